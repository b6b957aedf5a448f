//! Resumable frame parsers which recover packets from raw byte streams.
//!
//! A parser is fed arbitrary chunks of the input stream and appends the packet bytes it finds to
//! a caller provided [Packet]. [FrameParser::parse] returns once the chunk is exhausted or once
//! the packet is full, so the caller can hand the packet on, reset it and call again with the
//! remaining bytes. All state survives between calls, chunks can be as small as a single byte.
//!
//! An error means the parser lost track of the framing. The caller is expected to reset the
//! packet, call [FrameParser::goto_init_state] with `reset` set and retry one byte further.
use crate::config::{ConfigError, ParserConfig, StripConfig, ZFrameConfig, AosFrameConfig};
use crate::packet::{Packet, PacketError};

pub mod aos;
pub mod strip;
pub mod zframe;

pub use aos::AosFrameParser;
pub use strip::StripParser;
pub use zframe::ZFrameParser;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("frame sync token mismatch")]
    SyncMismatch,
    #[error("unable to read frame size {0:?}")]
    InvalidFrameSize(String),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
}

/// Closed set of stream framings.
#[derive(Debug)]
pub enum FrameParser {
    /// The stream consists of back to back packets.
    PassThrough,
    Strip(StripParser),
    Aos(AosFrameParser),
    ZFrame(ZFrameParser),
}

impl FrameParser {
    pub fn pass_through() -> Self {
        FrameParser::PassThrough
    }

    pub fn strip(cfg: &StripConfig) -> Self {
        FrameParser::Strip(StripParser::new(cfg.header_size))
    }

    pub fn aos(cfg: &AosFrameConfig) -> Result<Self, ConfigError> {
        Ok(FrameParser::Aos(AosFrameParser::new(cfg)?))
    }

    pub fn zframe(cfg: &ZFrameConfig) -> Self {
        FrameParser::ZFrame(ZFrameParser::new(cfg.file_mode))
    }

    pub fn from_config(cfg: &ParserConfig) -> Result<Self, ConfigError> {
        match cfg {
            ParserConfig::PassThrough => Ok(Self::pass_through()),
            ParserConfig::Strip(strip) => Ok(Self::strip(strip)),
            ParserConfig::Aos(aos) => Self::aos(aos),
            ParserConfig::ZFrame(zframe) => Ok(Self::zframe(zframe)),
        }
    }

    /// Feeds stream bytes into the packet. Returns the number of consumed bytes.
    pub fn parse(&mut self, buf: &[u8], pkt: &mut Packet) -> Result<usize, ParseError> {
        match self {
            FrameParser::PassThrough => pass_through(buf, pkt),
            FrameParser::Strip(parser) => parser.parse(buf, pkt),
            FrameParser::Aos(parser) => parser.parse(buf, pkt),
            FrameParser::ZFrame(parser) => parser.parse(buf, pkt),
        }
    }

    /// Re-arms the state machine for the next unit. With `reset`, synchronization and frame
    /// tracking state is discarded as well.
    pub fn goto_init_state(&mut self, reset: bool) {
        match self {
            FrameParser::PassThrough => (),
            FrameParser::Strip(parser) => parser.goto_init_state(reset),
            FrameParser::Aos(parser) => parser.goto_init_state(reset),
            FrameParser::ZFrame(parser) => parser.goto_init_state(reset),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameParser::PassThrough => "pass-through",
            FrameParser::Strip(_) => "strip",
            FrameParser::Aos(_) => "aos",
            FrameParser::ZFrame(_) => "zframe",
        }
    }

    pub fn in_sync(&self) -> bool {
        match self {
            FrameParser::PassThrough | FrameParser::Strip(_) => true,
            FrameParser::Aos(parser) => parser.in_sync(),
            FrameParser::ZFrame(parser) => parser.in_sync(),
        }
    }
}

#[inline]
pub(crate) fn pass_through(buf: &[u8], pkt: &mut Packet) -> Result<usize, ParseError> {
    Ok(pkt.append(buf)?)
}

//! AOS transfer frame parser.
//!
//! Each frame is preceded by an optional leading strip, an optional attached sync marker and
//! optional trailing strip bytes. The frame itself consists of the primary header, the 2 byte
//! M_PDU first header pointer, the packet zone and an optional 2 byte CRC trailer:
//!
//! ```text
//! | lstrip | sync marker | tstrip | header | first header pointer | packet zone ... | CRC |
//! ```
//!
//! Packets are streamed through the packet zones of consecutive frames. The first header pointer
//! is only evaluated after (re)acquisition, afterwards the packet zone is appended as is.
use crate::config::{AosFrameConfig, ConfigError};
use crate::crc::CRC_16_AOS_FRAME;
use crate::packet::Packet;
use crate::parser::{pass_through, ParseError};
use core::fmt::{Debug, Formatter};
use tracing::{error, info};

/// First header pointer value signalling that no packet starts inside the frame.
pub const FRAME_MPDU_CONTINUE: usize = 0xFFFF;
/// Size of the M_PDU first header pointer which is read along with the frame header.
pub const MPDU_POINTER_LEN: usize = 2;
/// Frame counters are 24 bits wide.
pub const FRAME_COUNTER_MASK: u32 = 0x00FF_FFFF;
const VIRTUAL_CHANNEL_MASK: u8 = 0x3F;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AosState {
    LeadingStrip,
    SyncSearch,
    TrailingStrip,
    Header,
    Mpdu,
    Ccsds,
    Trailer,
}

pub struct AosFrameParser {
    spacecraft_id: u16,
    virtual_channel: u8,
    sync_marker: Vec<u8>,
    lstrip_size: usize,
    tstrip_size: usize,
    frame_size: usize,
    /// Includes the first header pointer.
    header_size: usize,
    trailer_size: usize,

    state: AosState,
    lstrip_left: usize,
    tstrip_left: usize,
    sync_index: usize,
    header: Vec<u8>,
    header_index: usize,
    trailer: [u8; 2],
    trailer_index: usize,
    frame_index: usize,
    frame_counter: Option<u32>,
    mpdu_offset: usize,
    mpdu_offset_set: bool,
    in_sync: bool,
    crc: crc::Digest<'static, u16>,

    counter_errors: u64,
    crc_errors: u64,
}

impl AosFrameParser {
    pub fn new(cfg: &AosFrameConfig) -> Result<Self, ConfigError> {
        let sync_marker = cfg.validate()?;
        let header_size = cfg.header_size + MPDU_POINTER_LEN;
        let mut parser = Self {
            spacecraft_id: cfg.spacecraft_id,
            virtual_channel: cfg.virtual_channel,
            lstrip_size: cfg.sync_offset,
            tstrip_size: cfg.strip_size - (cfg.sync_offset + sync_marker.len()),
            sync_marker,
            frame_size: cfg.frame_size,
            header_size,
            trailer_size: cfg.trailer_size,
            state: AosState::Header,
            lstrip_left: 0,
            tstrip_left: 0,
            sync_index: 0,
            header: vec![0; header_size],
            header_index: 0,
            trailer: [0; 2],
            trailer_index: 0,
            frame_index: 0,
            frame_counter: None,
            mpdu_offset: 0,
            mpdu_offset_set: false,
            in_sync: true,
            crc: CRC_16_AOS_FRAME.digest(),
            counter_errors: 0,
            crc_errors: 0,
        };
        parser.goto_init_state(true);
        Ok(parser)
    }

    pub fn state(&self) -> AosState {
        self.state
    }

    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    /// Number of frame counter discontinuities seen so far.
    pub fn counter_errors(&self) -> u64 {
        self.counter_errors
    }

    /// Number of frames whose trailer did not match the computed CRC.
    pub fn crc_errors(&self) -> u64 {
        self.crc_errors
    }

    /// 16-bit master channel and virtual channel identifier as used in log lines.
    pub fn channel_id(&self) -> u16 {
        (1 << 14) | ((self.spacecraft_id & 0xFF) << 6) | u16::from(self.virtual_channel)
    }

    fn init_state(&self) -> AosState {
        if self.lstrip_size > 0 {
            AosState::LeadingStrip
        } else {
            self.state_after_leading_strip()
        }
    }

    fn state_after_leading_strip(&self) -> AosState {
        if !self.sync_marker.is_empty() {
            AosState::SyncSearch
        } else {
            self.state_after_sync()
        }
    }

    fn state_after_sync(&self) -> AosState {
        if self.tstrip_size > 0 {
            AosState::TrailingStrip
        } else {
            AosState::Header
        }
    }

    #[inline]
    fn data_end(&self) -> usize {
        self.frame_size - self.trailer_size
    }

    pub fn parse(&mut self, buf: &[u8], pkt: &mut Packet) -> Result<usize, ParseError> {
        let mut idx = 0;
        while idx < buf.len() {
            let bytes_left = buf.len() - idx;
            match self.state {
                AosState::LeadingStrip => {
                    if self.lstrip_left <= bytes_left {
                        idx += self.lstrip_left;
                        self.lstrip_left = self.lstrip_size;
                        self.state = self.state_after_leading_strip();
                    } else {
                        self.lstrip_left -= bytes_left;
                        idx += bytes_left;
                    }
                }
                AosState::SyncSearch => {
                    while self.state == AosState::SyncSearch && idx < buf.len() {
                        self.search_sync(buf[idx]);
                        idx += 1;
                    }
                }
                AosState::TrailingStrip => {
                    if self.tstrip_left <= bytes_left {
                        idx += self.tstrip_left;
                        self.tstrip_left = self.tstrip_size;
                        self.state = AosState::Header;
                    } else {
                        self.tstrip_left -= bytes_left;
                        idx += bytes_left;
                    }
                }
                AosState::Header => {
                    let cpy = (self.header_size - self.header_index).min(bytes_left);
                    self.header[self.header_index..self.header_index + cpy]
                        .copy_from_slice(&buf[idx..idx + cpy]);
                    self.header_index += cpy;
                    self.frame_index += cpy;
                    idx += cpy;
                    if self.header_index == self.header_size {
                        self.header_index = 0;
                        self.process_header(pkt);
                    }
                }
                AosState::Mpdu => {
                    let frame_left = self.data_end().saturating_sub(self.frame_index);
                    let available = bytes_left.min(frame_left);
                    if self.mpdu_offset == FRAME_MPDU_CONTINUE || self.mpdu_offset > available {
                        // No packet starts in the reachable part of the frame
                        if self.mpdu_offset != FRAME_MPDU_CONTINUE {
                            self.mpdu_offset -= available;
                        }
                        self.crc.update(&buf[idx..idx + available]);
                        idx += available;
                        self.frame_index += available;
                    } else {
                        self.crc.update(&buf[idx..idx + self.mpdu_offset]);
                        idx += self.mpdu_offset;
                        self.frame_index += self.mpdu_offset;
                        self.state = AosState::Ccsds;
                        self.mpdu_offset_set = true;
                    }
                }
                AosState::Ccsds => {
                    let frame_left = self.data_end().saturating_sub(self.frame_index);
                    let available = bytes_left.min(frame_left);
                    let consumed = pass_through(&buf[idx..idx + available], pkt)?;
                    self.crc.update(&buf[idx..idx + consumed]);
                    self.frame_index += consumed;
                    idx += consumed;
                }
                AosState::Trailer => {
                    let cpy = (self.trailer_size - self.trailer_index).min(bytes_left);
                    self.trailer[self.trailer_index..self.trailer_index + cpy]
                        .copy_from_slice(&buf[idx..idx + cpy]);
                    self.trailer_index += cpy;
                    idx += cpy;
                    if self.trailer_index == self.trailer_size {
                        self.finish_frame(pkt);
                    }
                }
            }

            if self.frame_index >= self.data_end() {
                self.state = AosState::Trailer;
            }

            // Frames carry packets back to back without padding, so a completed packet leaves
            // the frame state untouched
            if pkt.is_full() {
                break;
            }
        }
        Ok(idx)
    }

    fn search_sync(&mut self, byte: u8) {
        if byte == self.sync_marker[self.sync_index] {
            self.sync_index += 1;
            if self.sync_index == self.sync_marker.len() {
                self.sync_index = 0;
                if !self.in_sync {
                    info!(
                        "synchronization of AOS frames acquired on channel {:04X}",
                        self.channel_id()
                    );
                    self.in_sync = true;
                }
                self.state = self.state_after_sync();
            }
            return;
        }
        if self.in_sync {
            error!(
                "lost sync in processing AOS frames on channel {:04X}",
                self.channel_id()
            );
            self.in_sync = false;
            self.mpdu_offset_set = false;
        }
        // The mismatching byte may start the next marker
        self.sync_index = usize::from(byte == self.sync_marker[0]);
    }

    fn process_header(&mut self, pkt: &mut Packet) {
        self.crc = CRC_16_AOS_FRAME.digest();
        self.crc.update(&self.header);

        let counter = u32::from_be_bytes([0, self.header[2], self.header[3], self.header[4]]);
        let virtual_channel = self.header[1] & VIRTUAL_CHANNEL_MASK;

        if let Some(prev) = self.frame_counter {
            if counter != (prev + 1) & FRAME_COUNTER_MASK {
                error!(
                    "frame counter on channel {:04X} skipped from {} to {}",
                    self.channel_id(),
                    prev,
                    counter
                );
                self.counter_errors += 1;
                self.mpdu_offset_set = false;
                pkt.reset();
            }
        }
        if virtual_channel != self.virtual_channel {
            error!(
                "virtual channel does not match, expected {}, got {}",
                self.virtual_channel, virtual_channel
            );
        }
        self.frame_counter = Some(counter);

        if self.mpdu_offset_set {
            self.state = AosState::Ccsds;
        } else {
            let ptr = &self.header[self.header_size - MPDU_POINTER_LEN..];
            self.mpdu_offset = usize::from(u16::from_be_bytes([ptr[0], ptr[1]]));
            self.state = AosState::Mpdu;
        }
    }

    fn finish_frame(&mut self, pkt: &mut Packet) {
        self.trailer_index = 0;
        self.frame_index = 0;
        self.state = self.init_state();
        let computed =
            core::mem::replace(&mut self.crc, CRC_16_AOS_FRAME.digest()).finalize();
        if self.trailer_size == 2 {
            let expected = u16::from_be_bytes(self.trailer);
            if expected != computed {
                error!(
                    "frame CRC for frame {} does not match, expected {:04X}, computed {:04X}",
                    self.frame_counter.unwrap_or_default(),
                    expected,
                    computed
                );
                self.crc_errors += 1;
                self.mpdu_offset_set = false;
                pkt.reset();
            }
        }
    }

    pub fn goto_init_state(&mut self, reset: bool) {
        self.state = self.init_state();
        self.lstrip_left = self.lstrip_size;
        self.tstrip_left = self.tstrip_size;
        self.sync_index = 0;
        self.header_index = 0;
        self.trailer_index = 0;
        self.frame_index = 0;
        self.header.fill(0);
        if reset {
            self.mpdu_offset_set = false;
            self.frame_counter = None;
        }
    }
}

impl Debug for AosFrameParser {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AosFrameParser")
            .field("channel_id", &self.channel_id())
            .field("sync_marker", &self.sync_marker)
            .field("frame_size", &self.frame_size)
            .field("state", &self.state)
            .field("frame_index", &self.frame_index)
            .field("frame_counter", &self.frame_counter)
            .field("mpdu_offset_set", &self.mpdu_offset_set)
            .field("in_sync", &self.in_sync)
            .finish_non_exhaustive()
    }
}

//! Parser for Z-file frames, as written by ground station recorders.
//!
//! Every frame starts with a SFDU label holding the `CCSD3ZA00001` token and the ASCII encoded
//! length of the rest of the frame. In file mode a file header follows the label. Each packet
//! inside the frame is preceded by an annotation header and a final header.
//!
//! ```text
//! | label | file header? | annotation | final | packet | annotation | final | packet ...
//! ```
use crate::packet::Packet;
use crate::parser::{pass_through, ParseError};
use tracing::error;

pub const Z_SYNC_TOKEN: &[u8; 12] = b"CCSD3ZA00001";
pub const Z_LABEL_SIZE: usize = 20;
pub const Z_FILE_HEADER_SIZE: usize = 20;
pub const Z_ANNOTATION_SIZE: usize = 20;
pub const Z_FINAL_HEADER_SIZE: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ZState {
    Label,
    FileHeader,
    Annotation,
    FinalHeader,
    Ccsds,
}

#[derive(Debug, Clone)]
pub struct ZFrameParser {
    file_mode: bool,
    state: ZState,
    label: [u8; Z_LABEL_SIZE],
    label_index: usize,
    skip_left: usize,
    frame_size: usize,
    frame_index: usize,
    in_sync: bool,
}

impl ZFrameParser {
    pub fn new(file_mode: bool) -> Self {
        let mut parser = Self {
            file_mode,
            state: ZState::Label,
            label: [0; Z_LABEL_SIZE],
            label_index: 0,
            skip_left: 0,
            frame_size: 0,
            frame_index: 0,
            in_sync: false,
        };
        parser.goto_init_state(true);
        parser
    }

    pub fn state(&self) -> ZState {
        self.state
    }

    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn file_mode(&self) -> bool {
        self.file_mode
    }

    /// Size of the current frame including its label, zero while no label was read.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn enter(&mut self, state: ZState) {
        self.state = state;
        self.skip_left = match state {
            ZState::FileHeader => Z_FILE_HEADER_SIZE,
            ZState::Annotation => Z_ANNOTATION_SIZE,
            ZState::FinalHeader => Z_FINAL_HEADER_SIZE,
            ZState::Label | ZState::Ccsds => 0,
        };
    }

    fn process_label(&mut self) -> Result<(), ParseError> {
        self.label_index = 0;
        if &self.label[..Z_SYNC_TOKEN.len()] != Z_SYNC_TOKEN {
            self.in_sync = false;
            return Err(ParseError::SyncMismatch);
        }
        let size_field = &self.label[Z_SYNC_TOKEN.len()..];
        let body_size = core::str::from_utf8(size_field)
            .ok()
            .map(|text| text.trim_matches(|c: char| c == '\0' || c.is_whitespace()))
            .and_then(|text| text.parse::<usize>().ok());
        let Some(body_size) = body_size else {
            let text = String::from_utf8_lossy(size_field).into_owned();
            error!("unable to read z-frame size: {text:?}");
            return Err(ParseError::InvalidFrameSize(text));
        };
        self.in_sync = true;
        self.frame_size = body_size + Z_LABEL_SIZE;
        if self.file_mode {
            self.enter(ZState::FileHeader);
        } else {
            self.enter(ZState::Annotation);
        }
        Ok(())
    }

    pub fn parse(&mut self, buf: &[u8], pkt: &mut Packet) -> Result<usize, ParseError> {
        let mut idx = 0;
        while idx < buf.len() {
            let bytes_left = buf.len() - idx;
            match self.state {
                ZState::Label => {
                    let cpy = (Z_LABEL_SIZE - self.label_index).min(bytes_left);
                    self.label[self.label_index..self.label_index + cpy]
                        .copy_from_slice(&buf[idx..idx + cpy]);
                    self.label_index += cpy;
                    self.frame_index += cpy;
                    idx += cpy;
                    if self.label_index == Z_LABEL_SIZE {
                        self.process_label()?;
                    }
                }
                ZState::FileHeader | ZState::Annotation | ZState::FinalHeader => {
                    let skip = self.skip_left.min(bytes_left);
                    self.skip_left -= skip;
                    self.frame_index += skip;
                    idx += skip;
                    if self.skip_left == 0 {
                        match self.state {
                            ZState::FileHeader => self.enter(ZState::Annotation),
                            ZState::Annotation => self.enter(ZState::FinalHeader),
                            _ => self.enter(ZState::Ccsds),
                        }
                    }
                }
                ZState::Ccsds => {
                    let available = bytes_left.min(self.frame_size.saturating_sub(self.frame_index));
                    if available == 0 {
                        // Packet continues in the next frame
                        self.goto_init_state(false);
                        continue;
                    }
                    let consumed = pass_through(&buf[idx..idx + available], pkt)?;
                    self.frame_index += consumed;
                    idx += consumed;
                    if pkt.is_full() {
                        self.goto_init_state(false);
                        return Ok(idx);
                    }
                }
            }
        }
        Ok(idx)
    }

    /// Without `reset`, a frame with bytes left continues at the next annotation header,
    /// otherwise the next label is expected.
    pub fn goto_init_state(&mut self, reset: bool) {
        self.label_index = 0;
        if reset || self.frame_index >= self.frame_size {
            self.frame_index = 0;
            self.frame_size = 0;
            self.label = [0; Z_LABEL_SIZE];
            self.enter(ZState::Label);
        } else {
            self.enter(ZState::Annotation);
        }
    }
}

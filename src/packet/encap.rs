//! Encapsulation Packet Protocol packets.
//!
//! The first header byte holds the packet version number (3 bits), the protocol ID (3 bits) and
//! the length of length field (2 bits). The length of length selects the header size and with it
//! where the packet length is found:
//!
//! | LoL | header | length field       | other fields                                       |
//! |-----|--------|--------------------|----------------------------------------------------|
//! | 0   | 1      | none, length is 1  | none, idle packet                                  |
//! | 1   | 2      | byte 1             | none                                               |
//! | 2   | 4      | bytes 2..4         | byte 1: user defined and protocol ID extension     |
//! | 3   | 8      | bytes 4..8         | byte 1 as for 2, bytes 2..4: CCSDS defined field   |
use crate::packet::{CcsdsPacket, PacketError};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const MAX_ENCAP_PACKET_SIZE: usize = 0x40000;
/// Largest possible encapsulation header.
pub const MAX_ENCAP_HEADER_LEN: usize = 8;
/// Packet version number of encapsulation packets.
pub const ENCAP_VERSION: u8 = 0b111;

#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum EncapProtocol {
    Idle = 0,
    Ltp = 1,
    Ipe = 2,
    Cfdp = 3,
    Bp = 4,
    Extension = 6,
    Private = 7,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum LengthOfLength {
    None = 0,
    OneByte = 1,
    TwoBytes = 2,
    FourBytes = 3,
}

impl LengthOfLength {
    pub const fn header_size(self) -> usize {
        match self {
            LengthOfLength::None => 1,
            LengthOfLength::OneByte => 2,
            LengthOfLength::TwoBytes => 4,
            LengthOfLength::FourBytes => 8,
        }
    }

    /// Largest total length the length field can express.
    pub const fn max_len(self) -> usize {
        match self {
            LengthOfLength::None => 1,
            LengthOfLength::OneByte => 0xFF,
            LengthOfLength::TwoBytes => 0xFFFF,
            LengthOfLength::FourBytes => 0xFFFF_FFFF,
        }
    }

    fn from_header_byte(byte: u8) -> Self {
        match byte & 0x03 {
            0 => LengthOfLength::None,
            1 => LengthOfLength::OneByte,
            2 => LengthOfLength::TwoBytes,
            _ => LengthOfLength::FourBytes,
        }
    }
}

/// Owned encapsulation packet with an append cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapPacket {
    buf: Vec<u8>,
    index: usize,
}

impl Default for EncapPacket {
    fn default() -> Self {
        Self::new()
    }
}

impl EncapPacket {
    pub fn new() -> Self {
        Self {
            buf: vec![0; MAX_ENCAP_PACKET_SIZE],
            index: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Result<Self, PacketError> {
        if capacity < MAX_ENCAP_HEADER_LEN {
            return Err(PacketError::BufferTooSmall {
                found: capacity,
                expected: MAX_ENCAP_HEADER_LEN,
            });
        }
        if capacity > MAX_ENCAP_PACKET_SIZE {
            return Err(PacketError::BufferTooLarge {
                found: capacity,
                max: MAX_ENCAP_PACKET_SIZE,
            });
        }
        Ok(Self {
            buf: vec![0; capacity],
            index: 0,
        })
    }

    /// Zeroed packet of `len` bytes with version, protocol ID, length of length and packet
    /// length set. The cursor is placed behind the header.
    pub fn with_header(
        protocol: EncapProtocol,
        lol: LengthOfLength,
        len: usize,
    ) -> Result<Self, PacketError> {
        let mut pkt = Self::with_capacity(len.max(MAX_ENCAP_HEADER_LEN))?;
        pkt.buf[0] = (ENCAP_VERSION << 5) | (u8::from(protocol) << 2) | u8::from(lol);
        pkt.set_total_len(len)?;
        pkt.index = lol.header_size();
        Ok(pkt)
    }

    pub fn reset(&mut self) {
        self.buf[..MAX_ENCAP_HEADER_LEN].fill(0);
        self.index = 0;
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_index(&mut self, offset: usize) -> bool {
        if offset < self.total_len() && offset <= self.buf.len() {
            self.index = offset;
            return true;
        }
        false
    }

    pub fn version(&self) -> u8 {
        self.buf[0] >> 5
    }

    /// Raw 3-bit protocol ID.
    pub fn protocol_id(&self) -> u8 {
        (self.buf[0] & 0x1C) >> 2
    }

    pub fn protocol(&self) -> Option<EncapProtocol> {
        EncapProtocol::try_from(self.protocol_id()).ok()
    }

    pub fn length_of_length(&self) -> LengthOfLength {
        LengthOfLength::from_header_byte(self.buf[0])
    }

    /// Combined user defined and protocol ID extension byte, present for 4 and 8 byte headers.
    pub fn id_extension_byte(&self) -> Option<u8> {
        match self.length_of_length() {
            LengthOfLength::TwoBytes | LengthOfLength::FourBytes => Some(self.buf[1]),
            _ => None,
        }
    }

    pub fn user_defined(&self) -> Option<u8> {
        self.id_extension_byte().map(|byte| byte >> 4)
    }

    pub fn protocol_id_extension(&self) -> Option<u8> {
        self.id_extension_byte().map(|byte| byte & 0x0F)
    }

    pub fn set_id_extension_byte(&mut self, value: u8) -> Result<(), PacketError> {
        if self.id_extension_byte().is_none() {
            return Err(PacketError::FieldNotPresent {
                field: "protocol ID extension",
                apid: self.apid(),
            });
        }
        self.buf[1] = value;
        Ok(())
    }

    /// CCSDS defined field of 8 byte headers, used as the sequence count.
    pub fn ccsds_defined_field(&self) -> Option<u16> {
        if self.length_of_length() == LengthOfLength::FourBytes {
            return Some(u16::from_be_bytes([self.buf[2], self.buf[3]]));
        }
        None
    }

    pub fn set_ccsds_defined_field(&mut self, value: u16) -> Result<(), PacketError> {
        if self.length_of_length() != LengthOfLength::FourBytes {
            return Err(PacketError::FieldNotPresent {
                field: "CCSDS defined field",
                apid: self.apid(),
            });
        }
        self.buf[2..4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Writes the packet length field for the current length of length.
    pub fn set_total_len(&mut self, len: usize) -> Result<(), PacketError> {
        let lol = self.length_of_length();
        if len < lol.header_size() || len > lol.max_len() || len > MAX_ENCAP_PACKET_SIZE {
            return Err(PacketError::InvalidFieldValue {
                field: "packet length",
                value: len as u64,
            });
        }
        // Bounded by the length of length maximum above
        match lol {
            LengthOfLength::None => (),
            LengthOfLength::OneByte => self.buf[1] = len as u8,
            LengthOfLength::TwoBytes => self.buf[2..4].copy_from_slice(&(len as u16).to_be_bytes()),
            LengthOfLength::FourBytes => {
                self.buf[4..8].copy_from_slice(&(len as u32).to_be_bytes())
            }
        }
        Ok(())
    }

    /// Appends stream bytes. The first byte is taken on its own since it determines the header
    /// size, then the rest of the header and finally the user data up to the declared length.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, PacketError> {
        let mut consumed = 0;
        if self.index == 0 && !bytes.is_empty() {
            self.buf[0] = bytes[0];
            self.index = 1;
            consumed = 1;
        }
        if self.index == 0 {
            return Ok(0);
        }
        let hdr_size = self.header_size();
        if self.index < hdr_size {
            let hdr_copied = (hdr_size - self.index).min(bytes.len() - consumed);
            self.buf[self.index..self.index + hdr_copied]
                .copy_from_slice(&bytes[consumed..consumed + hdr_copied]);
            self.index += hdr_copied;
            consumed += hdr_copied;
        }
        if self.index >= hdr_size {
            let total = self.total_len();
            if total < hdr_size || total > self.buf.len() {
                tracing::error!(
                    "packet size mismatch: {} bytes declared with a {} byte header",
                    total,
                    hdr_size
                );
                return Err(PacketError::LengthMismatch {
                    declared: total,
                    capacity: self.buf.len(),
                });
            }
            let payload_copied = (total - self.index).min(bytes.len() - consumed);
            self.buf[self.index..self.index + payload_copied]
                .copy_from_slice(&bytes[consumed..consumed + payload_copied]);
            self.index += payload_copied;
            consumed += payload_copied;
        }
        Ok(consumed)
    }

    pub fn is_full(&self) -> bool {
        self.index >= 1 && self.index >= self.header_size() && self.index == self.total_len()
    }
}

impl CcsdsPacket for EncapPacket {
    /// The private protocol uses the extension byte as identifier, the extension protocol the
    /// protocol ID extension nibble. All other protocols are identified by their protocol ID.
    fn apid(&self) -> u16 {
        let proto = self.protocol_id();
        if proto == u8::from(EncapProtocol::Private) {
            u16::from(self.id_extension_byte().unwrap_or(proto))
        } else if proto != u8::from(EncapProtocol::Extension) {
            u16::from(proto)
        } else {
            u16::from(self.protocol_id_extension().unwrap_or(0))
        }
    }

    fn seq(&self) -> u16 {
        self.ccsds_defined_field().unwrap_or(0)
    }

    fn total_len(&self) -> usize {
        match self.length_of_length() {
            LengthOfLength::None => 1,
            LengthOfLength::OneByte => usize::from(self.buf[1]),
            LengthOfLength::TwoBytes => usize::from(u16::from_be_bytes([self.buf[2], self.buf[3]])),
            LengthOfLength::FourBytes => {
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize
            }
        }
    }

    fn header_size(&self) -> usize {
        self.length_of_length().header_size()
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.total_len().min(self.buf.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        for (lol, hdr) in [
            (LengthOfLength::None, 1),
            (LengthOfLength::OneByte, 2),
            (LengthOfLength::TwoBytes, 4),
            (LengthOfLength::FourBytes, 8),
        ] {
            let len = if lol == LengthOfLength::None { 1 } else { 20 };
            let pkt = EncapPacket::with_header(EncapProtocol::Ipe, lol, len).unwrap();
            assert_eq!(pkt.header_size(), hdr);
            assert_eq!(pkt.total_len(), len);
            assert_eq!(pkt.length_of_length(), lol);
            assert_eq!(pkt.version(), ENCAP_VERSION);
            assert_eq!(pkt.protocol(), Some(EncapProtocol::Ipe));
        }
    }

    #[test]
    fn test_apid_rules() {
        let pkt = EncapPacket::with_header(EncapProtocol::Cfdp, LengthOfLength::OneByte, 10).unwrap();
        assert_eq!(pkt.apid(), 3);

        let mut pkt =
            EncapPacket::with_header(EncapProtocol::Private, LengthOfLength::TwoBytes, 10).unwrap();
        pkt.set_id_extension_byte(0xA5).unwrap();
        assert_eq!(pkt.apid(), 0xA5);
        assert_eq!(pkt.user_defined(), Some(0x0A));
        assert_eq!(pkt.protocol_id_extension(), Some(0x05));

        let pkt = EncapPacket::with_header(EncapProtocol::Private, LengthOfLength::None, 1).unwrap();
        assert_eq!(pkt.apid(), 7);

        let mut pkt =
            EncapPacket::with_header(EncapProtocol::Extension, LengthOfLength::FourBytes, 16)
                .unwrap();
        pkt.set_id_extension_byte(0x3C).unwrap();
        assert_eq!(pkt.apid(), 0x0C);

        let pkt =
            EncapPacket::with_header(EncapProtocol::Extension, LengthOfLength::OneByte, 4).unwrap();
        assert_eq!(pkt.apid(), 0);
    }

    #[test]
    fn test_seq_only_for_long_header() {
        let mut pkt =
            EncapPacket::with_header(EncapProtocol::Ltp, LengthOfLength::FourBytes, 12).unwrap();
        pkt.set_ccsds_defined_field(0x1234).unwrap();
        assert_eq!(pkt.seq(), 0x1234);
        let mut pkt =
            EncapPacket::with_header(EncapProtocol::Ltp, LengthOfLength::TwoBytes, 12).unwrap();
        assert!(pkt.set_ccsds_defined_field(1).is_err());
        assert_eq!(pkt.seq(), 0);
    }

    #[test]
    fn test_invalid_length() {
        assert!(EncapPacket::with_header(EncapProtocol::Ltp, LengthOfLength::OneByte, 256).is_err());
        assert!(EncapPacket::with_header(EncapProtocol::Ltp, LengthOfLength::TwoBytes, 3).is_err());
        assert!(EncapPacket::with_header(EncapProtocol::Idle, LengthOfLength::None, 2).is_err());
    }

    #[test]
    fn test_append_byte_by_byte() {
        let mut src =
            EncapPacket::with_header(EncapProtocol::Bp, LengthOfLength::FourBytes, 11).unwrap();
        src.set_ccsds_defined_field(7).unwrap();
        let bytes = src.as_bytes().to_vec();
        let mut pkt = EncapPacket::new();
        for (idx, byte) in bytes.iter().enumerate() {
            assert!(!pkt.is_full());
            assert_eq!(pkt.append(core::slice::from_ref(byte)).unwrap(), 1);
            assert_eq!(pkt.index(), idx + 1);
        }
        assert!(pkt.is_full());
        assert_eq!(pkt.as_bytes(), bytes.as_slice());
        assert_eq!(pkt.seq(), 7);
        assert_eq!(pkt.payload().len(), 3);
        assert_eq!(pkt.append(&[0xFF]).unwrap(), 0);
    }

    #[test]
    fn test_idle_packet_is_single_byte() {
        let mut pkt = EncapPacket::new();
        assert_eq!(pkt.append(&[0xE0, 0xE0]).unwrap(), 1);
        assert!(pkt.is_full());
        assert_eq!(pkt.apid(), u16::from(u8::from(EncapProtocol::Idle)));
    }

    #[test]
    fn test_declared_len_shorter_than_header() {
        let mut pkt = EncapPacket::new();
        // Two byte length field holding 2, header is 4 bytes
        assert!(pkt.append(&[0xE6, 0x00, 0x00, 0x02]).is_err());
    }
}

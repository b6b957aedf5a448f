//! In-memory CCSDS packets which are filled incrementally from a byte stream.
//!
//! Two wire formats are supported:
//!
//!  - [SpacePacket] and its borrowed counterpart [SpacePacketRef], the Space Packet Protocol
//!    format with the 6 byte primary header and the optional command or telemetry secondary
//!    header.
//!  - [EncapPacket], the Encapsulation Packet Protocol format with a 1, 2, 4 or 8 byte header.
//!
//! The [Packet] enumeration wraps both so that one reusable packet object can be handed to a
//! [crate::parser::FrameParser] regardless of the configured wire format. Header fields which both
//! formats have in common are accessed through the [CcsdsPacket] trait.
use crate::config::ConfigError;
use core::str::FromStr;
use delegate::delegate;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod encap;
pub mod space;

pub use encap::*;
pub use space::*;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    /// The requested field does not exist for the current packet shape, for example the checksum
    /// of a telemetry packet.
    #[error("{field} not present in packet {apid:#06x}")]
    FieldNotPresent { field: &'static str, apid: u16 },
    /// The declared packet length can not be satisfied by the packet buffer.
    #[error("packet length mismatch, declared {declared} bytes with capacity {capacity}")]
    LengthMismatch { declared: usize, capacity: usize },
    #[error("buffer of {found} bytes too small, at least {expected} expected")]
    BufferTooSmall { found: usize, expected: usize },
    #[error("buffer of {found} bytes exceeds the maximum packet size of {max}")]
    BufferTooLarge { found: usize, max: usize },
    #[error("invalid value {value} for field {field}")]
    InvalidFieldValue { field: &'static str, value: u64 },
}

pub(crate) fn field_not_present(field: &'static str, apid: u16) -> PacketError {
    tracing::error!("{} not present in packet {:04X}", field, apid);
    PacketError::FieldNotPresent { field, apid }
}

/// Wire format selector.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PacketKind {
    #[default]
    #[cfg_attr(feature = "serde", serde(rename = "SPACE"))]
    Space,
    #[cfg_attr(feature = "serde", serde(rename = "ENCAP"))]
    Encapsulation,
}

impl FromStr for PacketKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("SPACE") {
            Ok(PacketKind::Space)
        } else if s.eq_ignore_ascii_case("ENCAP") {
            Ok(PacketKind::Encapsulation)
        } else {
            Err(ConfigError::InvalidPacketKind(s.to_string()))
        }
    }
}

/// Generic trait to access the header fields which both packet formats provide.
pub trait CcsdsPacket {
    /// Application process identifier. For encapsulation packets this is derived from the
    /// protocol identifier fields.
    fn apid(&self) -> u16;

    fn seq(&self) -> u16;

    /// Total packet length in bytes as declared by the header.
    fn total_len(&self) -> usize;

    /// Size of all headers preceding the user data.
    fn header_size(&self) -> usize;

    /// The packet bytes up to the declared length or the end of the buffer, whichever comes first.
    fn as_bytes(&self) -> &[u8];

    /// User data following all headers.
    fn payload(&self) -> &[u8] {
        self.as_bytes().get(self.header_size()..).unwrap_or(&[])
    }
}

/// Reusable packet of either wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Space(SpacePacket),
    Encap(EncapPacket),
}

impl Packet {
    /// Empty packet with the maximum capacity of the given format.
    pub fn new(kind: PacketKind) -> Self {
        match kind {
            PacketKind::Space => Packet::Space(SpacePacket::new()),
            PacketKind::Encapsulation => Packet::Encap(EncapPacket::new()),
        }
    }

    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Space(_) => PacketKind::Space,
            Packet::Encap(_) => PacketKind::Encapsulation,
        }
    }

    pub fn as_space(&self) -> Option<&SpacePacket> {
        match self {
            Packet::Space(pkt) => Some(pkt),
            Packet::Encap(_) => None,
        }
    }

    pub fn as_encap(&self) -> Option<&EncapPacket> {
        match self {
            Packet::Space(_) => None,
            Packet::Encap(pkt) => Some(pkt),
        }
    }

    delegate! {
        to match self {
            Packet::Space(pkt) => pkt,
            Packet::Encap(pkt) => pkt,
        } {
            pub fn append(&mut self, bytes: &[u8]) -> Result<usize, PacketError>;
            pub fn is_full(&self) -> bool;
            pub fn reset(&mut self);
            pub fn index(&self) -> usize;
            pub fn set_index(&mut self, offset: usize) -> bool;
            pub fn capacity(&self) -> usize;
        }
    }
}

impl CcsdsPacket for Packet {
    delegate! {
        to match self {
            Packet::Space(pkt) => pkt,
            Packet::Encap(pkt) => pkt,
        } {
            fn apid(&self) -> u16;
            fn seq(&self) -> u16;
            fn total_len(&self) -> usize;
            fn header_size(&self) -> usize;
            fn as_bytes(&self) -> &[u8];
            fn payload(&self) -> &[u8];
        }
    }
}

impl From<SpacePacket> for Packet {
    fn from(pkt: SpacePacket) -> Self {
        Packet::Space(pkt)
    }
}

impl From<EncapPacket> for Packet {
    fn from(pkt: EncapPacket) -> Self {
        Packet::Encap(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_kind_from_str() {
        assert_eq!("SPACE".parse::<PacketKind>().unwrap(), PacketKind::Space);
        assert_eq!("encap".parse::<PacketKind>().unwrap(), PacketKind::Encapsulation);
        let err = "FRAME".parse::<PacketKind>().unwrap_err();
        assert_eq!(err, ConfigError::InvalidPacketKind("FRAME".to_string()));
    }

    #[test]
    fn test_enum_dispatch_space() {
        let mut pkt = Packet::new(PacketKind::Space);
        assert_eq!(pkt.kind(), PacketKind::Space);
        let src = SpacePacket::with_header(0x123, 10, true).unwrap();
        assert_eq!(pkt.append(src.as_bytes()).unwrap(), 10);
        assert!(pkt.is_full());
        assert_eq!(pkt.apid(), 0x123);
        assert_eq!(pkt.total_len(), 10);
        assert_eq!(pkt.header_size(), SPACE_HEADER_LEN);
        assert_eq!(pkt.payload().len(), 4);
        assert!(pkt.as_space().is_some());
        assert!(pkt.as_encap().is_none());
    }

    #[test]
    fn test_enum_dispatch_encap() {
        let mut pkt = Packet::new(PacketKind::Encapsulation);
        let src = EncapPacket::with_header(EncapProtocol::Ltp, LengthOfLength::TwoBytes, 12).unwrap();
        assert_eq!(pkt.append(src.as_bytes()).unwrap(), 12);
        assert!(pkt.is_full());
        assert_eq!(pkt.apid(), EncapProtocol::Ltp as u16);
        assert_eq!(pkt.header_size(), 4);
        assert_eq!(pkt.payload().len(), 8);
        pkt.reset();
        assert!(!pkt.is_full());
        assert_eq!(pkt.index(), 0);
    }
}

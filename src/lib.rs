//! # CCSDS packet protocol engine
//!
//! This crate contains the packet processing engine of a ground segment data processing server
//! for spaceborne lidar and telemetry products. It recovers CCSDS packets from raw byte streams,
//! validates them, keeps per-APID statistics and routes them onward. Currently, this includes
//! the following components:
//!
//!  - Space Packet and Encapsulation Packet codecs according to
//!    [CCSDS 133.0-B-2](https://public.ccsds.org/Pubs/133x0b2e1.pdf) and
//!    [CCSDS 133.1-B-3](https://public.ccsds.org/Pubs/133x1b3e1.pdf), see [packet].
//!  - Resumable frame parsers for pass-through streams, fixed link headers, AOS transfer frames
//!    and SFDU wrapped Z-file frames, see [parser].
//!  - The validating [assembler::PacketAssembler] with per-APID statistics.
//!  - The [packetizer::Packetizer], the timestamp ordered [interleaver::Interleaver] and the
//!    APID based [dispatch::PayloadDispatcher].
//!
//! All components exchange byte messages over named queues of a [channel::MsgBroker]. A
//! zero-length message marks the end of a stream.
//!
//! ## Features
//!
//!  - `serde`: Derives [`serde`](https://serde.rs/) traits for the configuration structures in
//!    [config] and the statistics records in [stats].
//!
//! ## Example
//!
//! ```rust
//! use ccsds_engine::packet::{CcsdsPacket, SpacePacket};
//! use ccsds_engine::parser::FrameParser;
//! use ccsds_engine::packet::Packet;
//!
//! let mut tm = SpacePacket::with_header(0x42, 16, true).unwrap();
//! tm.set_sec_header_flag(false);
//! let raw = tm.as_bytes().to_vec();
//!
//! let mut parser = FrameParser::pass_through();
//! let mut pkt = Packet::Space(SpacePacket::new());
//! let consumed = parser.parse(&raw, &mut pkt).unwrap();
//! assert_eq!(consumed, 16);
//! assert!(pkt.is_full());
//! assert_eq!(pkt.apid(), 0x42);
//! ```
use core::fmt::{Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod assembler;
pub mod channel;
pub mod config;
pub mod crc;
pub mod dispatch;
pub mod interleaver;
pub mod packet;
pub mod packetizer;
pub mod parser;
pub mod seq_count;
pub mod stats;
pub mod time;

pub const MAX_APID: u16 = 2u16.pow(11) - 1;
pub const MAX_SEQ_COUNT: u16 = 2u16.pow(14) - 1;
/// Number of distinct APIDs. Also used as the selector for "all APIDs" and as the index of the
/// aggregate statistics slot.
pub const NUM_APIDS: usize = 2048;
pub const ALL_APIDS: usize = NUM_APIDS;

/// Packet type bit of the space packet primary header.
#[derive(Debug, PartialEq, Eq, Copy, Clone, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum PacketType {
    Tm = 0,
    Tc = 1,
}

/// Segmentation flags of the packet sequence control field. The discriminant is the raw 2-bit
/// field value, [SegmentationFlags::mask] returns it in place inside the third header byte.
#[derive(Debug, PartialEq, Eq, Copy, Clone, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum SegmentationFlags {
    Continue = 0b00,
    Start = 0b01,
    Stop = 0b10,
    Unsegmented = 0b11,
}

impl SegmentationFlags {
    /// Value of the flags when placed in bits 7 and 6 of the header byte, for example 0x40 for
    /// [SegmentationFlags::Start].
    pub const fn mask(self) -> u8 {
        (self as u8) << 6
    }

    pub fn from_header_byte(byte: u8) -> Self {
        // The shifted value only has two bits, all four values are valid variants
        match byte >> 6 {
            0b00 => SegmentationFlags::Continue,
            0b01 => SegmentationFlags::Start,
            0b10 => SegmentationFlags::Stop,
            _ => SegmentationFlags::Unsegmented,
        }
    }
}

impl Display for SegmentationFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            SegmentationFlags::Continue => "CONTINUE",
            SegmentationFlags::Start => "START",
            SegmentationFlags::Stop => "STOP",
            SegmentationFlags::Unsegmented => "NONE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use crate::{PacketType, SegmentationFlags, MAX_APID, MAX_SEQ_COUNT};

    #[test]
    fn test_seg_flag_helpers() {
        assert_eq!(
            SegmentationFlags::try_from(0b00).expect("SEG flag creation failed"),
            SegmentationFlags::Continue
        );
        assert_eq!(
            SegmentationFlags::try_from(0b01).expect("SEG flag creation failed"),
            SegmentationFlags::Start
        );
        assert_eq!(
            SegmentationFlags::try_from(0b10).expect("SEG flag creation failed"),
            SegmentationFlags::Stop
        );
        assert_eq!(
            SegmentationFlags::try_from(0b11).expect("SEG flag creation failed"),
            SegmentationFlags::Unsegmented
        );
        assert!(SegmentationFlags::try_from(0b100).is_err());
    }

    #[test]
    fn test_seg_flag_masks() {
        assert_eq!(SegmentationFlags::Start.mask(), 0x40);
        assert_eq!(SegmentationFlags::Continue.mask(), 0x00);
        assert_eq!(SegmentationFlags::Stop.mask(), 0x80);
        assert_eq!(SegmentationFlags::Unsegmented.mask(), 0xC0);
        assert_eq!(
            SegmentationFlags::from_header_byte(0x80 | 0x3F),
            SegmentationFlags::Stop
        );
        assert_eq!(SegmentationFlags::Unsegmented.to_string(), "NONE");
    }

    #[test]
    fn test_packet_type_helper() {
        assert_eq!(PacketType::try_from(0b00).unwrap(), PacketType::Tm);
        assert_eq!(PacketType::try_from(0b01).unwrap(), PacketType::Tc);
        assert!(PacketType::try_from(0b10).is_err());
    }

    #[test]
    fn test_limits() {
        assert_eq!(MAX_APID, 0x7FF);
        assert_eq!(MAX_SEQ_COUNT, 0x3FFF);
    }
}

//! CRC algorithms used by the frame parsers.

/// CRC used to protect AOS transfer frames handled by [crate::parser::AosFrameParser]. This is the
/// reflected 0x8005 polynomial with an initial value of 0 (CRC-16/ARC).
///
/// It is a static so that running digests can be kept across parse calls.
pub static CRC_16_AOS_FRAME: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_ARC);

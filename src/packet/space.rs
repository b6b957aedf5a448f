//! Space Packet Protocol packets.
//!
//! The primary header is laid out as follows:
//!
//! ```text
//! byte 0..2: version (3 bits) | type (1 bit) | secondary header flag (1 bit) | APID (11 bits)
//! byte 2..4: segmentation flags (2 bits) | sequence count (14 bits)
//! byte 4..6: total packet length - 7
//! ```
//!
//! Command packets with a secondary header carry a function code in byte 6 and an XOR checksum
//! in byte 7. Telemetry packets with a secondary header carry a CDS timestamp in bytes 6 to 11.
use crate::packet::{field_not_present, CcsdsPacket, PacketError};
use crate::time::CdsTime;
use crate::{PacketType, SegmentationFlags, MAX_APID, MAX_SEQ_COUNT};

pub const SPACE_HEADER_LEN: usize = 6;
pub const CMD_PAYLOAD_OFFSET: usize = 8;
pub const TLM_PAYLOAD_OFFSET: usize = 12;
pub const FUNCTION_CODE_OFFSET: usize = 6;
pub const CHECKSUM_OFFSET: usize = 7;
/// Largest total length the 16-bit length field can express.
pub const MAX_SPACE_PACKET_SIZE: usize = 0x10006;
/// The length field holds the total packet length minus this value.
const LEN_FIELD_OFFSET: usize = 7;

const VERSION_MASK: u8 = 0xE0;
const TYPE_MASK: u8 = 0x10;
const SEC_HEADER_MASK: u8 = 0x08;

/// Accessors for the fields of a space packet which only require read access. Implementors
/// provide the raw buffer starting with the primary header.
pub trait SpacePacketHeader {
    /// Raw packet buffer. It is at least [SPACE_HEADER_LEN] bytes long and may be longer than the
    /// packet itself.
    fn raw(&self) -> &[u8];

    fn version(&self) -> u8 {
        (self.raw()[0] & VERSION_MASK) >> 5
    }

    fn packet_type(&self) -> PacketType {
        if self.raw()[0] & TYPE_MASK != 0 {
            PacketType::Tc
        } else {
            PacketType::Tm
        }
    }

    #[inline]
    fn is_cmd(&self) -> bool {
        self.packet_type() == PacketType::Tc
    }

    #[inline]
    fn is_tlm(&self) -> bool {
        self.packet_type() == PacketType::Tm
    }

    fn has_sec_header(&self) -> bool {
        self.raw()[0] & SEC_HEADER_MASK != 0
    }

    fn seg_flags(&self) -> SegmentationFlags {
        SegmentationFlags::from_header_byte(self.raw()[2])
    }

    /// 16-bit stream identifier made of version, type, secondary header flag and APID.
    fn stream_id(&self) -> u16 {
        u16::from_be_bytes([self.raw()[0], self.raw()[1]])
    }

    fn declared_len(&self) -> usize {
        usize::from(u16::from_be_bytes([self.raw()[4], self.raw()[5]])) + LEN_FIELD_OFFSET
    }

    fn function_code(&self) -> Result<u8, PacketError> {
        if self.declared_len() > FUNCTION_CODE_OFFSET
            && self.is_cmd()
            && self.has_sec_header()
            && self.raw().len() > FUNCTION_CODE_OFFSET
        {
            return Ok(self.raw()[FUNCTION_CODE_OFFSET] & 0x7F);
        }
        Err(field_not_present("function code", raw_apid(self.raw())))
    }

    fn checksum(&self) -> Result<u8, PacketError> {
        if self.declared_len() > CHECKSUM_OFFSET
            && self.is_cmd()
            && self.has_sec_header()
            && self.raw().len() > CHECKSUM_OFFSET
        {
            return Ok(self.raw()[CHECKSUM_OFFSET]);
        }
        Err(field_not_present("checksum", raw_apid(self.raw())))
    }

    fn cds_days(&self) -> Result<u16, PacketError> {
        if self.declared_len() > 7
            && self.is_tlm()
            && self.has_sec_header()
            && self.raw().len() >= 8
        {
            return Ok(u16::from_be_bytes([self.raw()[6], self.raw()[7]]));
        }
        Err(field_not_present("timestamp", raw_apid(self.raw())))
    }

    fn cds_msecs(&self) -> Result<u32, PacketError> {
        if self.declared_len() > 11
            && self.is_tlm()
            && self.has_sec_header()
            && self.raw().len() >= TLM_PAYLOAD_OFFSET
        {
            let raw = self.raw();
            return Ok(u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]));
        }
        Err(field_not_present("timestamp", raw_apid(self.raw())))
    }

    fn cds_time(&self) -> Result<CdsTime, PacketError> {
        Ok(CdsTime::new(self.cds_days()?, self.cds_msecs()?))
    }

    /// XOR checksum over the whole packet with the checksum byte itself excluded, seeded with
    /// 0xFF. Only defined for command packets with a secondary header which fit into the buffer.
    fn compute_checksum(&self) -> Result<u8, PacketError> {
        let len = self.declared_len();
        if len <= CHECKSUM_OFFSET || !self.is_cmd() || !self.has_sec_header() {
            return Err(field_not_present("checksum", raw_apid(self.raw())));
        }
        let raw = self.raw();
        if len > raw.len() {
            return Err(PacketError::LengthMismatch {
                declared: len,
                capacity: raw.len(),
            });
        }
        Ok(raw[..len]
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != CHECKSUM_OFFSET)
            .fold(0xFF, |cs, (_, byte)| cs ^ byte))
    }

    fn valid_checksum(&self) -> bool {
        match (self.checksum(), self.compute_checksum()) {
            (Ok(expected), Ok(actual)) => expected == actual,
            _ => false,
        }
    }

    /// Header size including the secondary header as implied by the type and flag bits.
    fn space_header_size(&self) -> usize {
        match (self.has_sec_header(), self.packet_type()) {
            (true, PacketType::Tm) => TLM_PAYLOAD_OFFSET,
            (true, PacketType::Tc) => CMD_PAYLOAD_OFFSET,
            (false, _) => SPACE_HEADER_LEN,
        }
    }
}

#[inline]
fn raw_apid(raw: &[u8]) -> u16 {
    u16::from_be_bytes([raw[0], raw[1]]) & MAX_APID
}

macro_rules! space_ccsds_packet_impl {
    ($ty: ty) => {
        impl CcsdsPacket for $ty {
            #[inline]
            fn apid(&self) -> u16 {
                raw_apid(self.raw())
            }

            #[inline]
            fn seq(&self) -> u16 {
                u16::from_be_bytes([self.raw()[2], self.raw()[3]]) & MAX_SEQ_COUNT
            }

            #[inline]
            fn total_len(&self) -> usize {
                self.declared_len()
            }

            #[inline]
            fn header_size(&self) -> usize {
                self.space_header_size()
            }

            fn as_bytes(&self) -> &[u8] {
                let raw = self.raw();
                &raw[..self.declared_len().min(raw.len())]
            }
        }
    };
}

/// Owned space packet with an append cursor, used to assemble packets from a stream and to build
/// new packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpacePacket {
    buf: Vec<u8>,
    index: usize,
}

impl Default for SpacePacket {
    fn default() -> Self {
        Self::new()
    }
}

impl SpacePacket {
    /// Empty packet which can hold any space packet.
    pub fn new() -> Self {
        Self {
            buf: vec![0; MAX_SPACE_PACKET_SIZE],
            index: 0,
        }
    }

    /// Empty packet with a buffer of the given size.
    pub fn with_capacity(capacity: usize) -> Result<Self, PacketError> {
        check_capacity(capacity)?;
        Ok(Self {
            buf: vec![0; capacity],
            index: 0,
        })
    }

    /// Packet of exactly `len` bytes with the APID and length fields set. Only the primary header
    /// is cleared if `clear` is false. The append cursor is placed behind the primary header.
    pub fn with_header(apid: u16, len: usize, clear: bool) -> Result<Self, PacketError> {
        let mut pkt = Self::with_capacity(len)?;
        pkt.init(apid, len, clear)?;
        pkt.index = SPACE_HEADER_LEN;
        Ok(pkt)
    }

    /// Copy of a complete packet. The append cursor is placed at the end.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        check_capacity(bytes.len())?;
        Ok(Self {
            buf: bytes.to_vec(),
            index: bytes.len(),
        })
    }

    /// Re-initializes the header with the given APID and length and rewinds the cursor.
    pub fn init(&mut self, apid: u16, len: usize, clear: bool) -> Result<(), PacketError> {
        if clear {
            let end = len.min(self.buf.len());
            self.buf[..end].fill(0);
        } else {
            self.buf[..SPACE_HEADER_LEN].fill(0);
        }
        self.index = 0;
        self.set_apid(apid);
        self.set_total_len(len)
    }

    /// Clears the primary header and rewinds the cursor. The remaining bytes are left untouched.
    pub fn reset(&mut self) {
        self.buf[..SPACE_HEADER_LEN].fill(0);
        self.index = 0;
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Moves the cursor. Fails if the offset is not inside the declared packet length.
    pub fn set_index(&mut self, offset: usize) -> bool {
        if offset < self.declared_len() && offset <= self.buf.len() {
            self.index = offset;
            return true;
        }
        false
    }

    /// The bytes appended so far.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.index]
    }

    /// Appends stream bytes: first the primary header, then user data up to the declared packet
    /// length. Returns the number of consumed bytes, which is less than `bytes.len()` once the
    /// packet is full.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize, PacketError> {
        let mut hdr_copied = 0;
        if self.index < SPACE_HEADER_LEN {
            hdr_copied = bytes.len().min(SPACE_HEADER_LEN - self.index);
            self.buf[self.index..self.index + hdr_copied].copy_from_slice(&bytes[..hdr_copied]);
            self.index += hdr_copied;
        }
        let mut payload_copied = 0;
        if self.index >= SPACE_HEADER_LEN {
            let total = self.declared_len();
            if total > self.buf.len() {
                tracing::error!(
                    "packet too large: {} bytes declared, {} available",
                    total,
                    self.buf.len()
                );
                return Err(PacketError::LengthMismatch {
                    declared: total,
                    capacity: self.buf.len(),
                });
            }
            let payload_left = total.saturating_sub(self.index);
            payload_copied = payload_left.min(bytes.len() - hdr_copied);
            self.buf[self.index..self.index + payload_copied]
                .copy_from_slice(&bytes[hdr_copied..hdr_copied + payload_copied]);
            self.index += payload_copied;
        }
        Ok(hdr_copied + payload_copied)
    }

    pub fn is_full(&self) -> bool {
        self.index >= SPACE_HEADER_LEN && self.index == self.declared_len()
    }

    /// Mutable user data area following all headers, up to the declared length.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.space_header_size();
        let end = self.declared_len().min(self.buf.len());
        if start >= end {
            return &mut [];
        }
        &mut self.buf[start..end]
    }

    /// Sets the APID. Returns false and leaves the packet unchanged if the APID exceeds 11 bits.
    pub fn set_apid(&mut self, apid: u16) -> bool {
        if apid > MAX_APID {
            return false;
        }
        let [msb, lsb] = apid.to_be_bytes();
        self.buf[0] = (self.buf[0] & 0xF8) | (msb & 0x07);
        self.buf[1] = lsb;
        true
    }

    pub fn set_version(&mut self, version: u8) {
        self.buf[0] = (self.buf[0] & !VERSION_MASK) | ((version << 5) & VERSION_MASK);
    }

    pub fn set_packet_type(&mut self, packet_type: PacketType) {
        match packet_type {
            PacketType::Tc => self.buf[0] |= TYPE_MASK,
            PacketType::Tm => self.buf[0] &= !TYPE_MASK,
        }
    }

    pub fn set_sec_header_flag(&mut self, flag: bool) {
        if flag {
            self.buf[0] |= SEC_HEADER_MASK;
        } else {
            self.buf[0] &= !SEC_HEADER_MASK;
        }
    }

    /// Sets the 14-bit sequence count. Returns false if the value does not fit.
    pub fn set_seq(&mut self, seq: u16) -> bool {
        if seq > MAX_SEQ_COUNT {
            return false;
        }
        let [msb, lsb] = seq.to_be_bytes();
        self.buf[2] = (self.buf[2] & 0xC0) | msb;
        self.buf[3] = lsb;
        true
    }

    pub fn set_seg_flags(&mut self, flags: SegmentationFlags) {
        self.buf[2] = (self.buf[2] & 0x3F) | flags.mask();
    }

    /// Sets the total packet length including all headers.
    pub fn set_total_len(&mut self, len: usize) -> Result<(), PacketError> {
        if !(LEN_FIELD_OFFSET..=MAX_SPACE_PACKET_SIZE).contains(&len) {
            return Err(PacketError::InvalidFieldValue {
                field: "packet length",
                value: len as u64,
            });
        }
        // Range checked above
        let raw = (len - LEN_FIELD_OFFSET) as u16;
        self.buf[4..6].copy_from_slice(&raw.to_be_bytes());
        Ok(())
    }

    /// Secondary header fields can only be written if the buffer reaches `end`.
    fn check_field_end(&self, end: usize) -> Result<(), PacketError> {
        if self.buf.len() < end {
            return Err(PacketError::LengthMismatch {
                declared: self.declared_len(),
                capacity: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn set_function_code(&mut self, code: u8) -> Result<(), PacketError> {
        if self.declared_len() > FUNCTION_CODE_OFFSET && self.is_cmd() && self.has_sec_header() {
            self.check_field_end(FUNCTION_CODE_OFFSET + 1)?;
            self.buf[FUNCTION_CODE_OFFSET] = code & 0x7F;
            return Ok(());
        }
        Err(field_not_present("function code", self.apid()))
    }

    pub fn set_checksum(&mut self, checksum: u8) -> Result<(), PacketError> {
        if self.declared_len() > CHECKSUM_OFFSET && self.is_cmd() && self.has_sec_header() {
            self.check_field_end(CHECKSUM_OFFSET + 1)?;
            self.buf[CHECKSUM_OFFSET] = checksum;
            return Ok(());
        }
        Err(field_not_present("checksum", self.apid()))
    }

    /// Computes the checksum and writes it into the command secondary header.
    pub fn load_checksum(&mut self) -> Result<u8, PacketError> {
        self.set_checksum(0)?;
        let checksum = self.compute_checksum()?;
        self.set_checksum(checksum)?;
        Ok(checksum)
    }

    pub fn set_cds_days(&mut self, days: u16) -> Result<(), PacketError> {
        if self.declared_len() > 7 && self.is_tlm() && self.has_sec_header() {
            self.check_field_end(8)?;
            self.buf[6..8].copy_from_slice(&days.to_be_bytes());
            return Ok(());
        }
        Err(field_not_present("timestamp", self.apid()))
    }

    pub fn set_cds_msecs(&mut self, msecs: u32) -> Result<(), PacketError> {
        if self.declared_len() > 11 && self.is_tlm() && self.has_sec_header() {
            self.check_field_end(TLM_PAYLOAD_OFFSET)?;
            self.buf[8..12].copy_from_slice(&msecs.to_be_bytes());
            return Ok(());
        }
        Err(field_not_present("timestamp", self.apid()))
    }

    pub fn set_cds_time(&mut self, time: CdsTime) -> Result<(), PacketError> {
        self.set_cds_days(time.days)?;
        self.set_cds_msecs(time.ms_of_day)
    }

    /// Borrowed view of the packet bytes up to the declared length.
    pub fn as_ref_packet(&self) -> SpacePacketRef<'_> {
        SpacePacketRef {
            buf: self.as_bytes(),
        }
    }
}

fn check_capacity(capacity: usize) -> Result<(), PacketError> {
    if capacity < SPACE_HEADER_LEN {
        return Err(PacketError::BufferTooSmall {
            found: capacity,
            expected: SPACE_HEADER_LEN,
        });
    }
    if capacity > MAX_SPACE_PACKET_SIZE {
        return Err(PacketError::BufferTooLarge {
            found: capacity,
            max: MAX_SPACE_PACKET_SIZE,
        });
    }
    Ok(())
}

impl SpacePacketHeader for SpacePacket {
    #[inline]
    fn raw(&self) -> &[u8] {
        &self.buf
    }
}

space_ccsds_packet_impl!(SpacePacket);

/// Read-only view of a space packet inside a received message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SpacePacketRef<'buf> {
    buf: &'buf [u8],
}

impl<'buf> SpacePacketRef<'buf> {
    pub fn new(buf: &'buf [u8]) -> Result<Self, PacketError> {
        if buf.len() < SPACE_HEADER_LEN {
            return Err(PacketError::BufferTooSmall {
                found: buf.len(),
                expected: SPACE_HEADER_LEN,
            });
        }
        Ok(Self { buf })
    }

    /// Number of bytes available in the underlying buffer.
    pub fn received_len(&self) -> usize {
        self.buf.len()
    }

    pub fn primary_header(&self) -> Option<zc::SpacePrimaryHeader> {
        zc::SpacePrimaryHeader::from_bytes(self.buf)
    }
}

impl SpacePacketHeader for SpacePacketRef<'_> {
    #[inline]
    fn raw(&self) -> &[u8] {
        self.buf
    }
}

space_ccsds_packet_impl!(SpacePacketRef<'_>);

/// Zero-copy representation of the primary header.
pub mod zc {
    use crate::{PacketType, SegmentationFlags, MAX_APID, MAX_SEQ_COUNT};
    use zerocopy::byteorder::{NetworkEndian, U16};
    use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

    #[derive(FromBytes, FromZeroes, AsBytes, Unaligned, Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(C)]
    pub struct SpacePrimaryHeader {
        version_packet_id: U16<NetworkEndian>,
        psc: U16<NetworkEndian>,
        data_len: U16<NetworkEndian>,
    }

    impl SpacePrimaryHeader {
        /// Version 0 header. The APID and sequence count are masked to their field widths,
        /// `total_len` is the full packet length which must be at least 7.
        pub fn new(
            packet_type: PacketType,
            sec_header: bool,
            apid: u16,
            seg_flags: SegmentationFlags,
            seq: u16,
            total_len: usize,
        ) -> Self {
            let packet_id = (u16::from(u8::from(packet_type)) << 12)
                | (u16::from(sec_header) << 11)
                | (apid & MAX_APID);
            let psc = (u16::from(u8::from(seg_flags)) << 14) | (seq & MAX_SEQ_COUNT);
            let data_len = total_len.saturating_sub(super::LEN_FIELD_OFFSET).min(0xFFFF) as u16;
            SpacePrimaryHeader {
                version_packet_id: U16::new(packet_id),
                psc: U16::new(psc),
                data_len: U16::new(data_len),
            }
        }

        pub fn from_bytes(slice: &[u8]) -> Option<Self> {
            SpacePrimaryHeader::read_from_prefix(slice)
        }

        pub fn to_bytes(&self, slice: &mut [u8]) -> Option<()> {
            self.write_to_prefix(slice)
        }

        pub fn apid(&self) -> u16 {
            self.version_packet_id.get() & MAX_APID
        }

        pub fn seq(&self) -> u16 {
            self.psc.get() & MAX_SEQ_COUNT
        }

        pub fn total_len(&self) -> usize {
            usize::from(self.data_len.get()) + super::LEN_FIELD_OFFSET
        }
    }
}

//! Per-APID packet statistics.
//!
//! The [StatsTable] has one [ApidStats] slot for every APID plus an aggregate slot at index
//! [ALL_APIDS]. Every counter increment is applied to both the APID slot and the aggregate slot.
//! Snapshots are published in the fixed big-endian layout of [zc::StatsRecord].
use crate::{SegmentationFlags, ALL_APIDS, MAX_APID};
use paste::paste;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Folds a new sample into a running average over `n` previous samples.
#[inline]
pub fn integrate_average(n: u64, avg: f64, sample: f64) -> f64 {
    let n = n as f64;
    (avg * n + sample) / (n + 1.0)
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ApidStats {
    /// APID of the slot, [ALL_APIDS] for the aggregate slot.
    pub apid: u16,
    pub total_pkts: u64,
    pub total_bytes: u64,
    /// Packets of the current telemetry period.
    pub curr_pkts: u64,
    /// Bytes of the current telemetry period.
    pub curr_bytes: u64,
    pub pkts_dropped: u64,
    pub pkts_filtered: u64,
    pub seq_errors: u64,
    pub seg_errors: u64,
    pub len_errors: u64,
    pub odd_errors: u64,
    pub chksum_errors: u64,
    /// Observed sequence count stride.
    pub filter_factor: u16,
    pub last_seq: u16,
    /// [None] until the first packet was seen.
    pub last_seg: Option<SegmentationFlags>,
    pub max_bps: f64,
    pub min_bps: f64,
    pub avg_bps: f64,
    /// Number of samples folded into `avg_bps`.
    pub bps_index: u64,
}

impl ApidStats {
    pub fn new(apid: u16) -> Self {
        Self {
            apid,
            total_pkts: 0,
            total_bytes: 0,
            curr_pkts: 0,
            curr_bytes: 0,
            pkts_dropped: 0,
            pkts_filtered: 0,
            seq_errors: 0,
            seg_errors: 0,
            len_errors: 0,
            odd_errors: 0,
            chksum_errors: 0,
            filter_factor: 0,
            last_seq: 0,
            last_seg: None,
            max_bps: 0.0,
            min_bps: f64::MAX,
            avg_bps: 0.0,
            bps_index: 0,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.apid);
    }

    /// Folds the traffic of the current period into the rate statistics and starts a new
    /// period. `elapsed` is the period length in seconds. Returns the statistics as they were at
    /// the end of the closed period.
    pub fn close_period(&mut self, elapsed: f64) -> ApidStats {
        let bps = if elapsed > 0.0 {
            (self.curr_bytes * 8) as f64 / elapsed
        } else {
            0.0
        };
        if bps > self.max_bps {
            self.max_bps = bps;
        }
        if bps < self.min_bps {
            self.min_bps = bps;
        }
        self.avg_bps = integrate_average(self.bps_index, self.avg_bps, bps);
        self.bps_index += 1;
        let snapshot = self.clone();
        self.curr_pkts = 0;
        self.curr_bytes = 0;
        snapshot
    }
}

/// Statistics slots for all APIDs, indexed by APID, with the aggregate at [ALL_APIDS].
#[derive(Debug, Clone)]
pub struct StatsTable {
    slots: Vec<ApidStats>,
}

impl Default for StatsTable {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! stat_counters {
    ($($field: ident),+) => {
        paste! {
            $(
                #[doc = "Increments `" $field "` of the APID and the aggregate slot."]
                pub fn [<inc_ $field>](&mut self, apid: u16) {
                    self.slots[usize::from(apid & MAX_APID)].$field += 1;
                    self.slots[ALL_APIDS].$field += 1;
                }
            )+
        }
    };
}

impl StatsTable {
    pub fn new() -> Self {
        Self {
            slots: (0..=ALL_APIDS).map(|apid| ApidStats::new(apid as u16)).collect(),
        }
    }

    /// Slot of an APID or the aggregate slot for [ALL_APIDS].
    pub fn get(&self, apid: usize) -> Option<&ApidStats> {
        self.slots.get(apid)
    }

    pub fn get_mut(&mut self, apid: usize) -> Option<&mut ApidStats> {
        self.slots.get_mut(apid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApidStats> {
        self.slots.iter()
    }

    /// Clears one slot, or every slot including the aggregate for [ALL_APIDS]. Returns false for
    /// an out of range APID.
    pub fn clear(&mut self, apid: usize) -> bool {
        if apid == ALL_APIDS {
            self.slots.iter_mut().for_each(ApidStats::clear);
            return true;
        }
        match self.slots.get_mut(apid) {
            Some(slot) => {
                slot.clear();
                true
            }
            None => false,
        }
    }

    stat_counters!(
        pkts_dropped,
        pkts_filtered,
        seq_errors,
        seg_errors,
        len_errors,
        odd_errors,
        chksum_errors
    );

    /// Accounts one forwarded packet of `bytes` length.
    pub fn add_packet(&mut self, apid: u16, bytes: usize) {
        for idx in [usize::from(apid & MAX_APID), ALL_APIDS] {
            let slot = &mut self.slots[idx];
            slot.total_pkts += 1;
            slot.curr_pkts += 1;
            slot.total_bytes += bytes as u64;
            slot.curr_bytes += bytes as u64;
        }
    }

    /// Closes the current period of every slot with traffic and returns their snapshots.
    pub fn close_period(&mut self, elapsed: f64) -> Vec<ApidStats> {
        self.slots
            .iter_mut()
            .filter(|slot| slot.curr_pkts > 0)
            .map(|slot| slot.close_period(elapsed))
            .collect()
    }
}

/// Fixed binary layout of a statistics record as posted to statistics channels.
pub mod zc {
    use super::ApidStats;
    use crate::SegmentationFlags;
    use zerocopy::byteorder::{NetworkEndian, F64, U16, U64};
    use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

    /// Value of the segmentation flag byte before the first packet was seen.
    pub const NO_SEG_FLAGS: u8 = 0xFF;
    pub const STATS_RECORD_LEN: usize = core::mem::size_of::<StatsRecord>();

    #[derive(FromBytes, FromZeroes, AsBytes, Unaligned, Debug, Copy, Clone, PartialEq)]
    #[repr(C)]
    pub struct StatsRecord {
        apid: U16<NetworkEndian>,
        total_pkts: U64<NetworkEndian>,
        total_bytes: U64<NetworkEndian>,
        curr_pkts: U64<NetworkEndian>,
        curr_bytes: U64<NetworkEndian>,
        pkts_dropped: U64<NetworkEndian>,
        pkts_filtered: U64<NetworkEndian>,
        seq_errors: U64<NetworkEndian>,
        seg_errors: U64<NetworkEndian>,
        len_errors: U64<NetworkEndian>,
        odd_errors: U64<NetworkEndian>,
        chksum_errors: U64<NetworkEndian>,
        filter_factor: U16<NetworkEndian>,
        last_seq: U16<NetworkEndian>,
        last_seg: u8,
        max_bps: F64<NetworkEndian>,
        min_bps: F64<NetworkEndian>,
        avg_bps: F64<NetworkEndian>,
        bps_index: U64<NetworkEndian>,
    }

    impl StatsRecord {
        pub fn from_bytes(slice: &[u8]) -> Option<Self> {
            StatsRecord::read_from_prefix(slice)
        }

        pub fn to_bytes(&self, slice: &mut [u8]) -> Option<()> {
            self.write_to_prefix(slice)
        }

        pub fn apid(&self) -> u16 {
            self.apid.get()
        }
    }

    impl From<&ApidStats> for StatsRecord {
        fn from(stats: &ApidStats) -> Self {
            StatsRecord {
                apid: U16::new(stats.apid),
                total_pkts: U64::new(stats.total_pkts),
                total_bytes: U64::new(stats.total_bytes),
                curr_pkts: U64::new(stats.curr_pkts),
                curr_bytes: U64::new(stats.curr_bytes),
                pkts_dropped: U64::new(stats.pkts_dropped),
                pkts_filtered: U64::new(stats.pkts_filtered),
                seq_errors: U64::new(stats.seq_errors),
                seg_errors: U64::new(stats.seg_errors),
                len_errors: U64::new(stats.len_errors),
                odd_errors: U64::new(stats.odd_errors),
                chksum_errors: U64::new(stats.chksum_errors),
                filter_factor: U16::new(stats.filter_factor),
                last_seq: U16::new(stats.last_seq),
                last_seg: stats.last_seg.map_or(NO_SEG_FLAGS, u8::from),
                max_bps: F64::new(stats.max_bps),
                min_bps: F64::new(stats.min_bps),
                avg_bps: F64::new(stats.avg_bps),
                bps_index: U64::new(stats.bps_index),
            }
        }
    }

    impl From<&StatsRecord> for ApidStats {
        fn from(record: &StatsRecord) -> Self {
            ApidStats {
                apid: record.apid.get(),
                total_pkts: record.total_pkts.get(),
                total_bytes: record.total_bytes.get(),
                curr_pkts: record.curr_pkts.get(),
                curr_bytes: record.curr_bytes.get(),
                pkts_dropped: record.pkts_dropped.get(),
                pkts_filtered: record.pkts_filtered.get(),
                seq_errors: record.seq_errors.get(),
                seg_errors: record.seg_errors.get(),
                len_errors: record.len_errors.get(),
                odd_errors: record.odd_errors.get(),
                chksum_errors: record.chksum_errors.get(),
                filter_factor: record.filter_factor.get(),
                last_seq: record.last_seq.get(),
                last_seg: SegmentationFlags::try_from(record.last_seg).ok(),
                max_bps: record.max_bps.get(),
                min_bps: record.min_bps.get(),
                avg_bps: record.avg_bps.get(),
                bps_index: record.bps_index.get(),
            }
        }
    }
}

//! GPS time helpers for the CCSDS Day Segmented (CDS) time code carried in the telemetry
//! secondary header.
//!
//! The day segment counts days since the GPS epoch (1980-01-06T00:00:00Z) in 16 bits, the
//! millisecond segment counts milliseconds of the day in 32 bits.
use chrono::{DateTime, TimeZone, Utc};
use core::fmt::{Display, Formatter};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const SECONDS_PER_DAY: u32 = 86400;
pub const MS_PER_DAY: u32 = SECONDS_PER_DAY * 1000;
/// Offset between GPS time and UTC. GPS time is not adjusted for leap seconds.
pub const GPS_UTC_LEAP_SECONDS: i64 = 18;

/// Unix timestamp of the GPS epoch, 1980-01-06T00:00:00Z.
pub const GPS_EPOCH_UNIX_SECONDS: i64 = 315_964_800;

/// Returns the GPS epoch as a UTC datetime.
pub fn gps_epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(GPS_EPOCH_UNIX_SECONDS, 0)
        .single()
        .unwrap_or_default()
}

/// Seconds since the GPS epoch for the given UTC time, including the leap second offset.
pub fn gps_seconds_from_utc(utc: DateTime<Utc>) -> f64 {
    let since_epoch = utc.timestamp() - GPS_EPOCH_UNIX_SECONDS + GPS_UTC_LEAP_SECONDS;
    since_epoch as f64 + f64::from(utc.timestamp_subsec_micros()) / 1.0e6
}

/// Current GPS time in seconds since the GPS epoch.
pub fn gps_seconds_now() -> f64 {
    gps_seconds_from_utc(Utc::now())
}

/// Day segmented timestamp as written to the telemetry secondary header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CdsTime {
    pub days: u16,
    pub ms_of_day: u32,
}

impl CdsTime {
    pub const fn new(days: u16, ms_of_day: u32) -> Self {
        Self { days, ms_of_day }
    }

    /// Split GPS seconds into days and milliseconds of day. Negative values clamp to the epoch,
    /// days beyond the 16-bit range wrap.
    pub fn from_gps_seconds(gps: f64) -> Self {
        let gps = if gps.is_finite() && gps > 0.0 { gps } else { 0.0 };
        let seconds = gps.floor() as u64;
        let subsec_ms = ((gps - gps.floor()) * 1000.0).floor() as u32;
        let days = (seconds / SECONDS_PER_DAY as u64) as u16;
        let leftover_seconds = (seconds % SECONDS_PER_DAY as u64) as u32;
        Self {
            days,
            ms_of_day: (leftover_seconds * 1000 + subsec_ms).min(MS_PER_DAY - 1),
        }
    }

    pub fn now() -> Self {
        Self::from_gps_seconds(gps_seconds_now())
    }

    /// Seconds since the GPS epoch.
    pub fn as_gps_seconds(&self) -> f64 {
        f64::from(self.days) * f64::from(SECONDS_PER_DAY) + f64::from(self.ms_of_day) / 1000.0
    }

    /// UTC datetime corresponding to this timestamp.
    pub fn as_utc(&self) -> DateTime<Utc> {
        let ms = i64::from(self.days) * i64::from(MS_PER_DAY) + i64::from(self.ms_of_day)
            - GPS_UTC_LEAP_SECONDS * 1000;
        gps_epoch() + chrono::Duration::milliseconds(ms)
    }
}

impl Display for CdsTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_utc().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_epoch() {
        assert_eq!(gps_epoch().timestamp(), GPS_EPOCH_UNIX_SECONDS);
    }

    #[test]
    fn test_split_gps_seconds() {
        let stamp = CdsTime::from_gps_seconds(2.0 * 86400.0 + 3661.25);
        assert_eq!(stamp.days, 2);
        assert_eq!(stamp.ms_of_day, 3_661_250);
        assert_eq!(stamp.as_gps_seconds(), 2.0 * 86400.0 + 3661.25);
    }

    #[test]
    fn test_negative_clamps_to_epoch() {
        assert_eq!(CdsTime::from_gps_seconds(-5.0), CdsTime::new(0, 0));
        assert_eq!(CdsTime::from_gps_seconds(f64::NAN), CdsTime::new(0, 0));
    }

    #[test]
    fn test_utc_conversion() {
        let utc = Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap();
        let gps = gps_seconds_from_utc(utc);
        let stamp = CdsTime::from_gps_seconds(gps);
        assert_eq!(stamp.as_utc(), utc);
        assert_eq!(stamp.to_string(), "2020-01-01T12:00:00.000Z");
    }

    #[test]
    fn test_ordering() {
        assert!(CdsTime::new(1, 0) > CdsTime::new(0, MS_PER_DAY - 1));
        assert!(CdsTime::new(1, 5) < CdsTime::new(1, 6));
    }
}

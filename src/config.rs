//! Construction parameters of the engine components.
//!
//! All structures can be built in code or, with the `serde` feature, deserialized from a
//! configuration document. Components validate their configuration when they are created and
//! refuse to start with a [ConfigError].
use crate::packet::{PacketKind, CMD_PAYLOAD_OFFSET, MAX_SPACE_PACKET_SIZE, TLM_PAYLOAD_OFFSET};
use crate::{PacketType, MAX_APID};
use core::time::Duration;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const MAX_SYNC_MARKER_LEN: usize = 32;
/// Sync marker string which disables the sync marker search.
pub const NO_SYNC: &str = "NOSYNC";
/// Default bound for blocking channel operations.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
/// Default period of the assembler statistics task.
pub const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 1000;
/// Attached sync marker of AOS transfer frames.
pub const DEFAULT_AOS_SYNC_MARKER: &str = "1ACFFC1D";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid sync marker {0:?}, expected an even number of hex digits or NOSYNC")]
    InvalidSyncMarker(String),
    #[error("sync marker of {0} bytes exceeds the maximum of {max}", max = MAX_SYNC_MARKER_LEN)]
    SyncMarkerTooLong(usize),
    #[error("invalid packet kind {0:?}, expected SPACE or ENCAP")]
    InvalidPacketKind(String),
    #[error("APID {0} out of range")]
    InvalidApid(u16),
    #[error("function code {0} exceeds 7 bits")]
    InvalidFunctionCode(u8),
    #[error("invalid frame geometry: {0}")]
    InvalidGeometry(String),
    #[error("invalid maximum packet size {0}")]
    InvalidPacketSize(usize),
    #[error("missing required parameter {0}")]
    MissingParameter(&'static str),
}

/// Decodes a sync marker given as hex string. An empty string or [NO_SYNC] yield an empty marker.
pub fn parse_sync_marker(marker: &str) -> Result<Vec<u8>, ConfigError> {
    if marker.is_empty() || marker == NO_SYNC {
        return Ok(Vec::new());
    }
    if marker.len() % 2 != 0 || !marker.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ConfigError::InvalidSyncMarker(marker.to_string()));
    }
    if marker.len() / 2 > MAX_SYNC_MARKER_LEN {
        return Err(ConfigError::SyncMarkerTooLong(marker.len() / 2));
    }
    (0..marker.len())
        .step_by(2)
        .map(|idx| {
            u8::from_str_radix(&marker[idx..idx + 2], 16)
                .map_err(|_| ConfigError::InvalidSyncMarker(marker.to_string()))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StripConfig {
    /// Number of link header bytes discarded in front of every packet.
    pub header_size: usize,
}

/// AOS transfer frame geometry.
///
/// The stream is expected to contain `strip_size` bytes in front of each frame, consisting of
/// `sync_offset` leading bytes, the sync marker and any remaining bytes. `frame_size` covers the
/// frame header (`header_size` bytes plus the 2 byte first header pointer), the data field and
/// the `trailer_size` byte trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct AosFrameConfig {
    pub spacecraft_id: u16,
    pub virtual_channel: u8,
    pub strip_size: usize,
    /// Hex string, for example `1ACFFC1D`, or `NOSYNC`.
    pub sync_marker: String,
    pub sync_offset: usize,
    pub frame_size: usize,
    pub header_size: usize,
    pub trailer_size: usize,
}

impl Default for AosFrameConfig {
    fn default() -> Self {
        Self {
            spacecraft_id: 0,
            virtual_channel: 0,
            strip_size: 4,
            sync_marker: DEFAULT_AOS_SYNC_MARKER.to_string(),
            sync_offset: 0,
            frame_size: 1024,
            header_size: 6,
            trailer_size: 2,
        }
    }
}

impl AosFrameConfig {
    /// Checks the frame geometry and returns the decoded sync marker.
    pub fn validate(&self) -> Result<Vec<u8>, ConfigError> {
        let marker = parse_sync_marker(&self.sync_marker)?;
        if self.sync_offset + marker.len() > self.strip_size {
            return Err(ConfigError::InvalidGeometry(format!(
                "sync marker of {} bytes at offset {} does not fit into strip size {}",
                marker.len(),
                self.sync_offset,
                self.strip_size
            )));
        }
        if self.spacecraft_id > 0xFF {
            return Err(ConfigError::InvalidGeometry(format!(
                "spacecraft id {} exceeds 8 bits",
                self.spacecraft_id
            )));
        }
        if self.virtual_channel > 0x3F {
            return Err(ConfigError::InvalidGeometry(format!(
                "virtual channel {} exceeds 6 bits",
                self.virtual_channel
            )));
        }
        if self.header_size < 5 {
            return Err(ConfigError::InvalidGeometry(format!(
                "header size {} does not cover the frame counter",
                self.header_size
            )));
        }
        if self.trailer_size != 0 && self.trailer_size != 2 {
            return Err(ConfigError::InvalidGeometry(format!(
                "trailer size {} not supported",
                self.trailer_size
            )));
        }
        if self.frame_size <= self.header_size + 2 + self.trailer_size {
            return Err(ConfigError::InvalidGeometry(format!(
                "frame size {} leaves no room for data",
                self.frame_size
            )));
        }
        Ok(marker)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ZFrameConfig {
    /// Each frame carries a file header behind the SFDU label.
    pub file_mode: bool,
}

/// Framing of the raw input stream of a [crate::assembler::PacketAssembler].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ParserConfig {
    #[default]
    PassThrough,
    Strip(StripConfig),
    Aos(AosFrameConfig),
    ZFrame(ZFrameConfig),
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct AssemblerConfig {
    pub name: String,
    pub parser: ParserConfig,
    pub packet_kind: PacketKind,
    pub input: String,
    pub output: Option<String>,
    pub stats: Option<String>,
    /// Forward packets which fail validation.
    pub pass_invalid: bool,
    /// Force the parser to resynchronize after an invalid packet.
    pub reset_invalid: bool,
    /// Forward only the user data of each packet.
    pub strip_header: bool,
    pub telemetry_interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            name: "assembler".to_string(),
            parser: ParserConfig::default(),
            packet_kind: PacketKind::Space,
            input: String::new(),
            output: None,
            stats: None,
            pass_invalid: false,
            reset_invalid: false,
            strip_header: false,
            telemetry_interval_ms: DEFAULT_TELEMETRY_INTERVAL_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl AssemblerConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_millis(self.telemetry_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct PacketizerConfig {
    pub name: String,
    pub input: String,
    pub output: String,
    pub apid: u16,
    pub packet_type: PacketType,
    /// Only used for command packets.
    pub function_code: u8,
    pub max_packet_size: usize,
    pub timeout_ms: u64,
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        Self {
            name: "packetizer".to_string(),
            input: String::new(),
            output: String::new(),
            apid: 0,
            packet_type: PacketType::Tm,
            function_code: 0,
            max_packet_size: MAX_SPACE_PACKET_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl PacketizerConfig {
    /// Size of all headers of the generated packets.
    pub fn header_size(&self) -> usize {
        match self.packet_type {
            PacketType::Tm => TLM_PAYLOAD_OFFSET,
            PacketType::Tc => CMD_PAYLOAD_OFFSET,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.apid > MAX_APID {
            return Err(ConfigError::InvalidApid(self.apid));
        }
        if self.function_code > 0x7F {
            return Err(ConfigError::InvalidFunctionCode(self.function_code));
        }
        if self.max_packet_size < self.header_size() || self.max_packet_size > MAX_SPACE_PACKET_SIZE
        {
            return Err(ConfigError::InvalidPacketSize(self.max_packet_size));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct InterleaverConfig {
    pub name: String,
    pub inputs: Vec<String>,
    pub output: String,
    /// Messages stamped before this GPS time in seconds are dropped.
    pub start_time: Option<f64>,
    /// Messages stamped after this GPS time in seconds are dropped.
    pub stop_time: Option<f64>,
    pub timeout_ms: u64,
}

impl Default for InterleaverConfig {
    fn default() -> Self {
        Self {
            name: "interleaver".to_string(),
            inputs: Vec::new(),
            output: String::new(),
            start_time: None,
            stop_time: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl InterleaverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inputs.is_empty() {
            return Err(ConfigError::MissingParameter("inputs"));
        }
        if self.output.is_empty() {
            return Err(ConfigError::MissingParameter("output"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct DispatcherConfig {
    pub name: String,
    pub input: String,
    /// Drop packets whose declared length differs from the received length.
    pub check_length: bool,
    /// Drop command packets with an invalid checksum.
    pub check_checksum: bool,
    pub timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            input: String::new(),
            check_length: false,
            check_checksum: false,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl DispatcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_marker() {
        assert_eq!(
            parse_sync_marker("1ACFFC1D").unwrap(),
            vec![0x1A, 0xCF, 0xFC, 0x1D]
        );
        assert_eq!(parse_sync_marker("003201f3").unwrap(), vec![0x00, 0x32, 0x01, 0xF3]);
        assert!(parse_sync_marker(NO_SYNC).unwrap().is_empty());
        assert!(parse_sync_marker("").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_sync_marker() {
        assert_eq!(
            parse_sync_marker("ABC"),
            Err(ConfigError::InvalidSyncMarker("ABC".to_string()))
        );
        assert_eq!(
            parse_sync_marker("+1"),
            Err(ConfigError::InvalidSyncMarker("+1".to_string()))
        );
        assert_eq!(
            parse_sync_marker(&"AB".repeat(33)),
            Err(ConfigError::SyncMarkerTooLong(33))
        );
    }

    #[test]
    fn test_aos_geometry() {
        let cfg = AosFrameConfig::default();
        assert_eq!(cfg.validate().unwrap().len(), 4);

        let cfg = AosFrameConfig {
            sync_offset: 1,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidGeometry(_))));

        let cfg = AosFrameConfig {
            trailer_size: 4,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidGeometry(_))));

        let cfg = AosFrameConfig {
            frame_size: 10,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidGeometry(_))));

        let cfg = AosFrameConfig {
            virtual_channel: 0x40,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidGeometry(_))));

        let cfg = AosFrameConfig {
            sync_marker: NO_SYNC.to_string(),
            strip_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().unwrap().is_empty());
    }

    #[test]
    fn test_packetizer_validation() {
        let cfg = PacketizerConfig::default();
        assert!(cfg.validate().is_ok());
        let cfg = PacketizerConfig {
            apid: 0x800,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidApid(0x800)));
        let cfg = PacketizerConfig {
            max_packet_size: 10,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidPacketSize(10)));
        let cfg = PacketizerConfig {
            packet_type: PacketType::Tc,
            max_packet_size: 10,
            function_code: 0x80,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidFunctionCode(0x80)));
    }

    #[test]
    fn test_interleaver_validation() {
        let cfg = InterleaverConfig::default();
        assert_eq!(cfg.validate(), Err(ConfigError::MissingParameter("inputs")));
        let cfg = InterleaverConfig {
            inputs: vec!["a".to_string()],
            output: "out".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    #[cfg(feature = "serde")]
    fn test_assembler_config_from_json() {
        let json = r#"{
            "name": "aosparser",
            "parser": { "Aos": { "virtual_channel": 5, "frame_size": 512 } },
            "packet_kind": "SPACE",
            "input": "rawq",
            "output": "pktq",
            "pass_invalid": true
        }"#;
        let cfg: AssemblerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.name, "aosparser");
        assert_eq!(cfg.packet_kind, PacketKind::Space);
        assert_eq!(cfg.output.as_deref(), Some("pktq"));
        assert!(cfg.pass_invalid);
        assert!(!cfg.reset_invalid);
        assert_eq!(cfg.timeout_ms, DEFAULT_TIMEOUT_MS);
        match cfg.parser {
            ParserConfig::Aos(aos) => {
                assert_eq!(aos.virtual_channel, 5);
                assert_eq!(aos.frame_size, 512);
                assert_eq!(aos.sync_marker, DEFAULT_AOS_SYNC_MARKER);
            }
            other => panic!("unexpected parser config {other:?}"),
        }
    }

    #[test]
    #[cfg(feature = "serde")]
    fn test_packetizer_config_round_trip() {
        let cfg = PacketizerConfig {
            apid: 0x100,
            packet_type: PacketType::Tc,
            function_code: 3,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PacketizerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}

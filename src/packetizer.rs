//! Wraps arbitrary payloads into space packets.
//!
//! Telemetry packets carry a CDS timestamp of the time of wrapping and a per-APID sequence count.
//! Command packets carry the configured function code and a checksum. All generated packets are
//! unsegmented and have the secondary header flag set.
use crate::channel::{ChannelError, MsgBroker, Publisher, Subscriber, WorkerHandle};
use crate::config::{ConfigError, PacketizerConfig};
use crate::packet::{CcsdsPacket, PacketError, SpacePacket};
use crate::seq_count::ApidSeqCounters;
use crate::time::CdsTime;
use crate::{PacketType, SegmentationFlags};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketizerError {
    #[error("payload of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
}

#[derive(Debug)]
pub struct Packetizer {
    name: String,
    apid: u16,
    packet_type: PacketType,
    function_code: u8,
    header_size: usize,
    max_packet_size: usize,
    counters: ApidSeqCounters,
    input: Subscriber,
    output: Publisher,
    timeout: Duration,
    active: Arc<AtomicBool>,
}

impl Packetizer {
    pub fn new(cfg: &PacketizerConfig, broker: &MsgBroker) -> Result<Self, ConfigError> {
        cfg.validate()?;
        if cfg.input.is_empty() {
            return Err(ConfigError::MissingParameter("input"));
        }
        if cfg.output.is_empty() {
            return Err(ConfigError::MissingParameter("output"));
        }
        Ok(Self {
            name: cfg.name.clone(),
            apid: cfg.apid,
            packet_type: cfg.packet_type,
            function_code: cfg.function_code,
            header_size: cfg.header_size(),
            max_packet_size: cfg.max_packet_size,
            counters: ApidSeqCounters::default(),
            input: broker.subscriber(&cfg.input),
            output: broker.publisher(&cfg.output),
            timeout: cfg.timeout(),
            active: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Largest payload which fits into a single packet.
    pub fn max_payload(&self) -> usize {
        self.max_packet_size - self.header_size
    }

    /// Builds a complete packet around `payload`.
    pub fn wrap(&self, payload: &[u8]) -> Result<Vec<u8>, PacketizerError> {
        if payload.len() > self.max_payload() {
            return Err(PacketizerError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload(),
            });
        }
        let mut pkt = SpacePacket::with_header(self.apid, self.header_size + payload.len(), true)?;
        pkt.set_packet_type(self.packet_type);
        pkt.set_sec_header_flag(true);
        pkt.set_seg_flags(SegmentationFlags::Unsegmented);
        match self.packet_type {
            PacketType::Tm => {
                pkt.set_seq(self.counters.next(self.apid));
                pkt.set_cds_time(CdsTime::now())?;
                pkt.payload_mut().copy_from_slice(payload);
            }
            PacketType::Tc => {
                pkt.set_function_code(self.function_code)?;
                pkt.payload_mut().copy_from_slice(payload);
                pkt.load_checksum()?;
            }
        }
        Ok(pkt.as_bytes().to_vec())
    }

    /// Wraps and posts one payload. Failures are logged and the payload is dropped.
    pub fn process(&self, payload: &[u8]) -> bool {
        let pkt = match self.wrap(payload) {
            Ok(pkt) => pkt,
            Err(e) => {
                error!("{}: unable to wrap payload: {e}", self.name);
                return false;
            }
        };
        if let Err(e) = self.output.post(&pkt, self.timeout) {
            error!(
                "{}: failed ({e}) to post packet to {}",
                self.name,
                self.output.name()
            );
            return false;
        }
        true
    }

    fn run(self) {
        while self.active.load(Ordering::Relaxed) {
            match self.input.receive(self.timeout) {
                Ok(payload) if payload.is_empty() => {
                    debug!("{}: terminator received on {}", self.name, self.input.name());
                    if let Err(e) = self.output.post_terminator(self.timeout) {
                        error!(
                            "{}: failed ({e}) to post terminator to {}",
                            self.name,
                            self.output.name()
                        );
                    }
                    break;
                }
                Ok(payload) => {
                    self.process(&payload);
                }
                Err(ChannelError::Timeout) => continue,
                Err(e) => {
                    error!("{}: failed ({e}) to receive from {}", self.name, self.input.name());
                    break;
                }
            }
        }
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let name = self.name.clone();
        let active = self.active.clone();
        WorkerHandle::spawn(&name, active, move || self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{
        SpacePacketHeader, SpacePacketRef, CMD_PAYLOAD_OFFSET, TLM_PAYLOAD_OFFSET,
    };

    fn config(packet_type: PacketType) -> PacketizerConfig {
        PacketizerConfig {
            input: "payloadq".to_string(),
            output: "pktq".to_string(),
            apid: 0x123,
            packet_type,
            function_code: 0x15,
            max_packet_size: 64,
            timeout_ms: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_wrap_telemetry() {
        let broker = MsgBroker::new();
        let packetizer = Packetizer::new(&config(PacketType::Tm), &broker).unwrap();
        let before = CdsTime::now().as_gps_seconds();
        let first = packetizer.wrap(&[1, 2, 3]).unwrap();
        let second = packetizer.wrap(&[4]).unwrap();

        let view = SpacePacketRef::new(&first).unwrap();
        assert_eq!(view.apid(), 0x123);
        assert!(view.is_tlm());
        assert!(view.has_sec_header());
        assert_eq!(view.seg_flags(), SegmentationFlags::Unsegmented);
        assert_eq!(view.seq(), 0);
        assert_eq!(view.total_len(), TLM_PAYLOAD_OFFSET + 3);
        assert_eq!(view.payload(), &[1, 2, 3]);
        let stamp = view.cds_time().unwrap().as_gps_seconds();
        assert!(stamp >= before - 0.001);
        assert!(stamp - before < 60.0);

        assert_eq!(SpacePacketRef::new(&second).unwrap().seq(), 1);
    }

    #[test]
    fn test_wrap_command() {
        let broker = MsgBroker::new();
        let packetizer = Packetizer::new(&config(PacketType::Tc), &broker).unwrap();
        let pkt = packetizer.wrap(&[9; 10]).unwrap();
        let view = SpacePacketRef::new(&pkt).unwrap();
        assert!(view.is_cmd());
        assert_eq!(view.total_len(), CMD_PAYLOAD_OFFSET + 10);
        assert_eq!(view.function_code().unwrap(), 0x15);
        assert!(view.valid_checksum());
        assert_eq!(view.seq(), 0);
    }

    #[test]
    fn test_payload_too_large() {
        let broker = MsgBroker::new();
        let packetizer = Packetizer::new(&config(PacketType::Tm), &broker).unwrap();
        assert_eq!(packetizer.max_payload(), 64 - TLM_PAYLOAD_OFFSET);
        assert!(packetizer.wrap(&[0; 64 - TLM_PAYLOAD_OFFSET]).is_ok());
        assert_eq!(
            packetizer.wrap(&[0; 64]),
            Err(PacketizerError::PayloadTooLarge {
                size: 64,
                max: 64 - TLM_PAYLOAD_OFFSET
            })
        );
        assert!(!packetizer.process(&[0; 64]));
    }

    #[test]
    fn test_invalid_config() {
        let broker = MsgBroker::new();
        let cfg = PacketizerConfig {
            apid: 0x800,
            ..config(PacketType::Tm)
        };
        assert_eq!(
            Packetizer::new(&cfg, &broker).unwrap_err(),
            ConfigError::InvalidApid(0x800)
        );
        let cfg = PacketizerConfig {
            output: String::new(),
            ..config(PacketType::Tm)
        };
        assert_eq!(
            Packetizer::new(&cfg, &broker).unwrap_err(),
            ConfigError::MissingParameter("output")
        );
    }

    #[test]
    fn test_worker() {
        let broker = MsgBroker::new();
        let input = broker.publisher("payloadq");
        let output = broker.subscriber("pktq");
        let handle = Packetizer::new(&config(PacketType::Tm), &broker)
            .unwrap()
            .spawn()
            .unwrap();
        let timeout = Duration::from_millis(500);
        input.post(&[5, 6], timeout).unwrap();
        input.post(&[7], timeout).unwrap();
        input.post_terminator(timeout).unwrap();
        handle.join();
        let first = output.receive(timeout).unwrap();
        assert_eq!(SpacePacketRef::new(&first).unwrap().payload(), &[5, 6]);
        let second = output.receive(timeout).unwrap();
        assert_eq!(SpacePacketRef::new(&second).unwrap().seq(), 1);
        assert!(output.receive(timeout).unwrap().is_empty());
    }
}

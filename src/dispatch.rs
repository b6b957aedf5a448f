//! Routes the payloads of space packets to per-APID channels.
//!
//! Every APID can be forwarded to one named channel. Several APIDs may share a channel name, in
//! which case they share one [Publisher]. The publisher is released once the last APID referencing
//! its name is forwarded elsewhere or unforwarded.
use crate::channel::{ChannelError, MsgBroker, Publisher, Subscriber, WorkerHandle};
use crate::config::{ConfigError, DispatcherConfig};
use crate::packet::{CcsdsPacket, PacketError, SpacePacketHeader, SpacePacketRef};
use crate::{ALL_APIDS, NUM_APIDS};
use delegate::delegate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid APID {0}")]
    InvalidApid(usize),
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("packet {apid:#06x} declares {declared} bytes but {received} bytes were received")]
    LengthMismatch {
        apid: u16,
        declared: usize,
        received: usize,
    },
    #[error("invalid checksum in command packet {apid:#06x}")]
    ChecksumMismatch { apid: u16 },
    #[error("packet {apid:#06x} has no payload")]
    EmptyPayload { apid: u16 },
    #[error("failed to post to channel {name}: {source}")]
    Channel { name: String, source: ChannelError },
}

#[derive(Debug)]
struct Route {
    publisher: Publisher,
    refs: usize,
}

#[derive(Debug)]
struct RouteTable {
    apids: Vec<Option<String>>,
    channels: HashMap<String, Route>,
}

impl RouteTable {
    fn release(&mut self, apid: usize) {
        let Some(name) = self.apids[apid].take() else {
            return;
        };
        if let Some(route) = self.channels.get_mut(&name) {
            route.refs -= 1;
            if route.refs == 0 {
                self.channels.remove(&name);
                debug!("channel {} closed", name);
            }
        }
    }

    fn assign(&mut self, apid: usize, name: &str, broker: &MsgBroker) {
        if self.apids[apid].as_deref() == Some(name) {
            return;
        }
        self.release(apid);
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Route {
                publisher: broker.publisher(name),
                refs: 0,
            })
            .refs += 1;
        self.apids[apid] = Some(name.to_string());
    }
}

/// Cloneable handle to the routing table of a dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchRoutes {
    name: String,
    broker: MsgBroker,
    table: Arc<Mutex<RouteTable>>,
}

impl DispatchRoutes {
    fn new(name: &str, broker: &MsgBroker) -> Self {
        Self {
            name: name.to_string(),
            broker: broker.clone(),
            table: Arc::new(Mutex::new(RouteTable {
                apids: vec![None; NUM_APIDS],
                channels: HashMap::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forwards the payloads of `apid`, or of every APID for [ALL_APIDS], to the channel `name`.
    pub fn forward(&self, apid: usize, name: &str) -> Result<(), DispatchError> {
        let mut table = self.table.lock();
        if apid == ALL_APIDS {
            for apid in 0..NUM_APIDS {
                table.assign(apid, name, &self.broker);
            }
        } else if apid < NUM_APIDS {
            table.assign(apid, name, &self.broker);
        } else {
            error!("{}: invalid APID {} for forwarding", self.name, apid);
            return Err(DispatchError::InvalidApid(apid));
        }
        info!("{}: forwarding APID {} to {}", self.name, apid, name);
        Ok(())
    }

    /// Stops forwarding `apid`, or every APID for [ALL_APIDS].
    pub fn unforward(&self, apid: usize) -> Result<(), DispatchError> {
        let mut table = self.table.lock();
        if apid == ALL_APIDS {
            (0..NUM_APIDS).for_each(|apid| table.release(apid));
        } else if apid < NUM_APIDS {
            table.release(apid);
        } else {
            return Err(DispatchError::InvalidApid(apid));
        }
        Ok(())
    }

    /// Channel name `apid` is forwarded to.
    pub fn route(&self, apid: usize) -> Option<String> {
        self.table.lock().apids.get(apid).cloned().flatten()
    }

    /// Names of the channels referenced by at least one APID, sorted.
    pub fn open_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.lock().channels.keys().cloned().collect();
        names.sort();
        names
    }

    fn publisher(&self, apid: u16) -> Option<Publisher> {
        let table = self.table.lock();
        let name = table.apids[usize::from(apid)].as_ref()?;
        table.channels.get(name).map(|route| route.publisher.clone())
    }

    fn publishers(&self) -> Vec<Publisher> {
        self.table
            .lock()
            .channels
            .values()
            .map(|route| route.publisher.clone())
            .collect()
    }
}

pub struct PayloadDispatcher {
    routes: DispatchRoutes,
    input: Subscriber,
    check_length: bool,
    check_checksum: bool,
    timeout: Duration,
    active: Arc<AtomicBool>,
}

impl PayloadDispatcher {
    pub fn new(cfg: &DispatcherConfig, broker: &MsgBroker) -> Result<Self, ConfigError> {
        if cfg.input.is_empty() {
            return Err(ConfigError::MissingParameter("input"));
        }
        Ok(Self {
            routes: DispatchRoutes::new(&cfg.name, broker),
            input: broker.subscriber(&cfg.input),
            check_length: cfg.check_length,
            check_checksum: cfg.check_checksum,
            timeout: cfg.timeout(),
            active: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn routes(&self) -> &DispatchRoutes {
        &self.routes
    }

    delegate! {
        to self.routes {
            pub fn name(&self) -> &str;
            pub fn forward(&self, apid: usize, name: &str) -> Result<(), DispatchError>;
            pub fn unforward(&self, apid: usize) -> Result<(), DispatchError>;
            pub fn route(&self, apid: usize) -> Option<String>;
            pub fn open_channels(&self) -> Vec<String>;
        }
    }

    pub fn set_check_length(&mut self, enable: bool) {
        self.check_length = enable;
    }

    pub fn set_check_checksum(&mut self, enable: bool) {
        self.check_checksum = enable;
    }

    /// Checks one complete space packet and posts its payload to the channel of its APID.
    /// Returns `Ok(false)` if the APID is not forwarded.
    pub fn dispatch(&self, msg: &[u8]) -> Result<bool, DispatchError> {
        let pkt = SpacePacketRef::new(msg)?;
        let apid = pkt.apid();
        if self.check_length && pkt.declared_len() != msg.len() {
            return Err(DispatchError::LengthMismatch {
                apid,
                declared: pkt.declared_len(),
                received: msg.len(),
            });
        }
        if self.check_checksum && pkt.is_cmd() && pkt.has_sec_header() && !pkt.valid_checksum() {
            return Err(DispatchError::ChecksumMismatch { apid });
        }
        let Some(publisher) = self.routes.publisher(apid) else {
            return Ok(false);
        };
        let payload = pkt.payload();
        if payload.is_empty() {
            return Err(DispatchError::EmptyPayload { apid });
        }
        publisher
            .post(payload, self.timeout)
            .map_err(|source| DispatchError::Channel {
                name: publisher.name().to_string(),
                source,
            })?;
        Ok(true)
    }

    fn terminate_all(&self) {
        for publisher in self.routes.publishers() {
            if let Err(e) = publisher.post_terminator(self.timeout) {
                warn!(
                    "{}: failed ({e}) to post terminator to {}",
                    self.name(),
                    publisher.name()
                );
            }
        }
    }

    fn run(self) {
        while self.active.load(Ordering::Relaxed) {
            match self.input.receive(self.timeout) {
                Ok(msg) if msg.is_empty() => {
                    debug!("{}: terminator received on {}", self.name(), self.input.name());
                    self.terminate_all();
                    break;
                }
                Ok(msg) => {
                    if let Err(e) = self.dispatch(&msg) {
                        error!("{}: packet dropped: {e}", self.name());
                    }
                }
                Err(ChannelError::Timeout) => continue,
                Err(e) => {
                    error!(
                        "{}: failed ({e}) to receive from {}",
                        self.name(),
                        self.input.name()
                    );
                    break;
                }
            }
        }
        self.active.store(false, Ordering::Relaxed);
    }

    /// Moves the dispatcher onto a worker thread. The routes stay adjustable through the returned
    /// [DispatchRoutes].
    pub fn spawn(self) -> std::io::Result<(DispatchRoutes, WorkerHandle)> {
        let routes = self.routes.clone();
        let active = self.active.clone();
        let worker = WorkerHandle::spawn(routes.name(), active, move || self.run())?;
        Ok((routes, worker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{SpacePacket, CMD_PAYLOAD_OFFSET, SPACE_HEADER_LEN};
    use crate::PacketType;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            input: "pktq".to_string(),
            timeout_ms: 100,
            ..Default::default()
        }
    }

    fn packet(apid: u16, payload: &[u8]) -> Vec<u8> {
        let mut pkt = SpacePacket::with_header(apid, SPACE_HEADER_LEN + payload.len(), true).unwrap();
        pkt.payload_mut().copy_from_slice(payload);
        pkt.as_bytes().to_vec()
    }

    fn command(apid: u16, payload: &[u8]) -> Vec<u8> {
        let mut pkt =
            SpacePacket::with_header(apid, CMD_PAYLOAD_OFFSET + payload.len(), true).unwrap();
        pkt.set_packet_type(PacketType::Tc);
        pkt.set_sec_header_flag(true);
        pkt.set_function_code(3).unwrap();
        pkt.payload_mut().copy_from_slice(payload);
        pkt.load_checksum().unwrap();
        pkt.as_bytes().to_vec()
    }

    #[test]
    fn test_shared_channel() {
        let broker = MsgBroker::new();
        let dispatcher = PayloadDispatcher::new(&config(), &broker).unwrap();
        let shared = broker.subscriber("sharedq");
        let other = broker.subscriber("otherq");
        dispatcher.forward(10, "sharedq").unwrap();
        dispatcher.forward(20, "sharedq").unwrap();
        assert_eq!(dispatcher.open_channels(), vec!["sharedq".to_string()]);

        dispatcher.forward(10, "otherq").unwrap();
        assert_eq!(
            dispatcher.open_channels(),
            vec!["otherq".to_string(), "sharedq".to_string()]
        );
        assert_eq!(dispatcher.dispatch(&packet(20, &[1, 2])), Ok(true));
        assert_eq!(dispatcher.dispatch(&packet(10, &[3])), Ok(true));
        assert_eq!(shared.receive(TIMEOUT).unwrap(), vec![1, 2]);
        assert_eq!(other.receive(TIMEOUT).unwrap(), vec![3]);

        dispatcher.unforward(20).unwrap();
        assert_eq!(dispatcher.open_channels(), vec!["otherq".to_string()]);
        assert_eq!(dispatcher.route(20), None);
        assert_eq!(dispatcher.route(10), Some("otherq".to_string()));
        assert_eq!(dispatcher.dispatch(&packet(20, &[4])), Ok(false));
    }

    #[test]
    fn test_forward_all() {
        let broker = MsgBroker::new();
        let dispatcher = PayloadDispatcher::new(&config(), &broker).unwrap();
        let all = broker.subscriber("allq");
        dispatcher.forward(ALL_APIDS, "allq").unwrap();
        assert_eq!(dispatcher.route(0x7FF), Some("allq".to_string()));
        assert_eq!(dispatcher.dispatch(&packet(0x7FF, &[9])), Ok(true));
        assert_eq!(all.receive(TIMEOUT).unwrap(), vec![9]);
        assert_eq!(
            dispatcher.forward(ALL_APIDS + 1, "allq"),
            Err(DispatchError::InvalidApid(ALL_APIDS + 1))
        );
        dispatcher.unforward(ALL_APIDS).unwrap();
        assert!(dispatcher.open_channels().is_empty());
    }

    #[test]
    fn test_length_check() {
        let broker = MsgBroker::new();
        let mut dispatcher = PayloadDispatcher::new(&config(), &broker).unwrap();
        let _rx = broker.subscriber("lenq");
        dispatcher.forward(5, "lenq").unwrap();
        let mut raw = packet(5, &[1, 2, 3]);
        raw.push(0);
        assert_eq!(dispatcher.dispatch(&raw), Ok(true));
        dispatcher.set_check_length(true);
        assert_eq!(
            dispatcher.dispatch(&raw),
            Err(DispatchError::LengthMismatch {
                apid: 5,
                declared: 9,
                received: 10
            })
        );
    }

    #[test]
    fn test_checksum_check() {
        let broker = MsgBroker::new();
        let cfg = DispatcherConfig {
            check_checksum: true,
            ..config()
        };
        let dispatcher = PayloadDispatcher::new(&cfg, &broker).unwrap();
        let cmdq = broker.subscriber("cmdq");
        dispatcher.forward(7, "cmdq").unwrap();
        let mut raw = command(7, &[0xAA, 0xBB]);
        assert_eq!(dispatcher.dispatch(&raw), Ok(true));
        assert_eq!(cmdq.receive(TIMEOUT).unwrap(), vec![0xAA, 0xBB]);
        raw[CMD_PAYLOAD_OFFSET] ^= 0x01;
        assert_eq!(
            dispatcher.dispatch(&raw),
            Err(DispatchError::ChecksumMismatch { apid: 7 })
        );
    }

    #[test]
    fn test_empty_payload() {
        let broker = MsgBroker::new();
        let dispatcher = PayloadDispatcher::new(&config(), &broker).unwrap();
        dispatcher.forward(1, "emptyq").unwrap();
        let raw = SpacePacket::with_header(1, 7, true).unwrap().as_bytes()[..6].to_vec();
        assert_eq!(
            dispatcher.dispatch(&raw),
            Err(DispatchError::EmptyPayload { apid: 1 })
        );
        assert!(matches!(
            dispatcher.dispatch(&[0x00, 0x01]),
            Err(DispatchError::Packet(PacketError::BufferTooSmall { .. }))
        ));
    }

    #[test]
    fn test_requires_input() {
        let broker = MsgBroker::new();
        assert_eq!(
            PayloadDispatcher::new(&DispatcherConfig::default(), &broker).err(),
            Some(ConfigError::MissingParameter("input"))
        );
    }

    #[test]
    fn test_worker_terminates_channels() {
        let broker = MsgBroker::new();
        let input = broker.publisher("pktq");
        let first = broker.subscriber("firstq");
        let second = broker.subscriber("secondq");
        let dispatcher = PayloadDispatcher::new(&config(), &broker).unwrap();
        dispatcher.forward(1, "firstq").unwrap();
        dispatcher.forward(2, "secondq").unwrap();
        let (routes, handle) = dispatcher.spawn().unwrap();
        input.post(&packet(1, &[1]), TIMEOUT).unwrap();
        input.post(&packet(3, &[3]), TIMEOUT).unwrap();
        input.post(&packet(2, &[2]), TIMEOUT).unwrap();
        input.post_terminator(TIMEOUT).unwrap();
        handle.join();
        assert_eq!(routes.open_channels().len(), 2);
        assert_eq!(first.receive(TIMEOUT).unwrap(), vec![1]);
        assert!(first.receive(TIMEOUT).unwrap().is_empty());
        assert_eq!(second.receive(TIMEOUT).unwrap(), vec![2]);
        assert!(second.receive(TIMEOUT).unwrap().is_empty());
    }
}

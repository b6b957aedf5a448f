//! Merges several packet streams into one stream ordered by packet time.
//!
//! The interleaver holds at most one message per input. Whenever every input which is not yet
//! exhausted had the chance to deliver a message, the held message with the earliest CDS
//! timestamp is posted. An input is exhausted once it delivered its terminator.
use crate::channel::{ChannelError, MsgBroker, Publisher, Subscriber, WorkerHandle};
use crate::config::{ConfigError, InterleaverConfig};
use crate::packet::{CcsdsPacket, SpacePacketHeader, SpacePacketRef, TLM_PAYLOAD_OFFSET};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Timestamp of a telemetry packet in GPS seconds. Messages without a readable timestamp sort as
/// zero.
pub fn packet_time(msg: &[u8]) -> f64 {
    let Ok(pkt) = SpacePacketRef::new(msg) else {
        debug!("message of {} bytes carries no packet time", msg.len());
        return 0.0;
    };
    let stamped = pkt.is_tlm()
        && pkt.has_sec_header()
        && pkt.declared_len() >= TLM_PAYLOAD_OFFSET
        && msg.len() >= TLM_PAYLOAD_OFFSET;
    if !stamped {
        debug!("packet {:04X} carries no packet time", pkt.apid());
        return 0.0;
    }
    pkt.cds_time().map_or(0.0, |time| time.as_gps_seconds())
}

struct Input {
    subscriber: Subscriber,
    held: Option<(f64, Vec<u8>)>,
    exhausted: bool,
}

pub struct Interleaver {
    name: String,
    inputs: Vec<Input>,
    output: Publisher,
    start_time: Option<f64>,
    stop_time: Option<f64>,
    timeout: Duration,
    active: Arc<AtomicBool>,
}

impl Interleaver {
    pub fn new(cfg: &InterleaverConfig, broker: &MsgBroker) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self {
            name: cfg.name.clone(),
            inputs: cfg
                .inputs
                .iter()
                .map(|name| Input {
                    subscriber: broker.subscriber(name),
                    held: None,
                    exhausted: false,
                })
                .collect(),
            output: broker.publisher(&cfg.output),
            start_time: cfg.start_time,
            stop_time: cfg.stop_time,
            timeout: cfg.timeout(),
            active: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn in_window(&self, time: f64) -> bool {
        if matches!(self.start_time, Some(start) if time < start) {
            return false;
        }
        !matches!(self.stop_time, Some(stop) if time > stop)
    }

    /// Gives every input without a held message one chance to deliver.
    fn fill(&mut self) {
        for idx in 0..self.inputs.len() {
            let input = &self.inputs[idx];
            if input.exhausted || input.held.is_some() {
                continue;
            }
            match input.subscriber.receive(self.timeout) {
                Ok(msg) if msg.is_empty() => {
                    self.inputs[idx].exhausted = true;
                    debug!(
                        "{}: terminator received on {} ({} remaining)",
                        self.name,
                        self.inputs[idx].subscriber.name(),
                        self.remaining()
                    );
                }
                Ok(msg) => {
                    let time = packet_time(&msg);
                    if self.in_window(time) {
                        self.inputs[idx].held = Some((time, msg));
                    }
                }
                Err(ChannelError::Timeout) => (),
                Err(e) => {
                    error!(
                        "{}: failed ({e}) to read from input {}",
                        self.name,
                        self.inputs[idx].subscriber.name()
                    );
                    self.inputs[idx].exhausted = true;
                }
            }
        }
    }

    /// Number of inputs which did not deliver their terminator yet.
    pub fn remaining(&self) -> usize {
        self.inputs.iter().filter(|input| !input.exhausted).count()
    }

    /// Index of the input holding the earliest message. Ties go to the lower index.
    fn earliest(&self) -> Option<usize> {
        let mut earliest: Option<(usize, f64)> = None;
        for (idx, input) in self.inputs.iter().enumerate() {
            if let Some((time, _)) = &input.held {
                if earliest.map_or(true, |(_, earliest_time)| *time < earliest_time) {
                    earliest = Some((idx, *time));
                }
            }
        }
        earliest.map(|(idx, _)| idx)
    }

    /// Merges the inputs until all of them are exhausted or the interleaver is stopped, then
    /// posts a terminator. Returns the number of posted messages.
    pub fn run(&mut self) -> usize {
        let mut posted = 0;
        while self.active.load(Ordering::Relaxed) && self.remaining() > 0 {
            self.fill();
            let Some(idx) = self.earliest() else {
                continue;
            };
            let Some((_, msg)) = &self.inputs[idx].held else {
                continue;
            };
            match self.output.post_while(msg, self.timeout, &self.active) {
                Ok(_) => {
                    self.inputs[idx].held = None;
                    posted += 1;
                }
                Err(ChannelError::Timeout) => (),
                Err(e) => {
                    error!(
                        "{}: failed ({e}) to post to {}, exiting interleaver",
                        self.name,
                        self.output.name()
                    );
                    self.active.store(false, Ordering::Relaxed);
                }
            }
        }
        let dropped = self
            .inputs
            .iter_mut()
            .filter_map(|input| input.held.take())
            .count();
        if dropped > 0 {
            warn!("{}: {} held messages dropped", self.name, dropped);
        }
        if let Err(e) = self.output.post_terminator(self.timeout) {
            error!(
                "{}: failed ({e}) to post terminator to {}",
                self.name,
                self.output.name()
            );
        }
        self.active.store(false, Ordering::Relaxed);
        posted
    }

    pub fn spawn(mut self) -> std::io::Result<WorkerHandle> {
        let name = self.name.clone();
        let active = self.active.clone();
        WorkerHandle::spawn(&name, active, move || {
            self.run();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::SpacePacket;
    use crate::time::CdsTime;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn stamped(apid: u16, gps_seconds: f64) -> Vec<u8> {
        let mut pkt = SpacePacket::with_header(apid, TLM_PAYLOAD_OFFSET + 1, true).unwrap();
        pkt.set_sec_header_flag(true);
        pkt.set_cds_time(CdsTime::from_gps_seconds(gps_seconds)).unwrap();
        pkt.as_bytes().to_vec()
    }

    fn config(inputs: &[&str]) -> InterleaverConfig {
        InterleaverConfig {
            inputs: inputs.iter().map(|name| name.to_string()).collect(),
            output: "mergedq".to_string(),
            timeout_ms: 50,
            ..Default::default()
        }
    }

    fn feed(broker: &MsgBroker, name: &str, times: &[f64]) {
        let publisher = broker.publisher(name);
        for time in times {
            publisher.post(&stamped(1, *time), TIMEOUT).unwrap();
        }
        publisher.post_terminator(TIMEOUT).unwrap();
    }

    fn merged_times(subscriber: &Subscriber) -> Vec<f64> {
        let mut times = Vec::new();
        loop {
            let msg = subscriber.receive(TIMEOUT).unwrap();
            if msg.is_empty() {
                return times;
            }
            times.push(packet_time(&msg));
        }
    }

    #[test]
    fn test_merge_order() {
        let broker = MsgBroker::new();
        let output = broker.subscriber("mergedq");
        feed(&broker, "a", &[1.0, 3.0, 5.0]);
        feed(&broker, "b", &[2.0, 4.0]);
        feed(&broker, "c", &[0.0, 6.0]);
        let mut interleaver = Interleaver::new(&config(&["a", "b", "c"]), &broker).unwrap();
        assert_eq!(interleaver.run(), 7);
        assert_eq!(
            merged_times(&output),
            vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
        );
        assert_eq!(interleaver.remaining(), 0);
    }

    #[test]
    fn test_ties_prefer_first_input() {
        let broker = MsgBroker::new();
        let output = broker.subscriber("mergedq");
        let first = broker.publisher("a");
        let second = broker.publisher("b");
        second.post(&stamped(2, 10.0), TIMEOUT).unwrap();
        first.post(&stamped(1, 10.0), TIMEOUT).unwrap();
        first.post_terminator(TIMEOUT).unwrap();
        second.post_terminator(TIMEOUT).unwrap();
        let mut interleaver = Interleaver::new(&config(&["a", "b"]), &broker).unwrap();
        interleaver.run();
        let apids: Vec<u16> = [output.receive(TIMEOUT).unwrap(), output.receive(TIMEOUT).unwrap()]
            .iter()
            .map(|msg| SpacePacketRef::new(msg).unwrap().apid())
            .collect();
        assert_eq!(apids, vec![1, 2]);
    }

    #[test]
    fn test_time_window() {
        let broker = MsgBroker::new();
        let output = broker.subscriber("mergedq");
        feed(&broker, "a", &[100.0, 200.0, 300.0, 400.0]);
        let cfg = InterleaverConfig {
            start_time: Some(150.0),
            stop_time: Some(300.0),
            ..config(&["a"])
        };
        let mut interleaver = Interleaver::new(&cfg, &broker).unwrap();
        assert_eq!(interleaver.run(), 2);
        assert_eq!(merged_times(&output), vec![200.0, 300.0]);
    }

    #[test]
    fn test_unreadable_time_sorts_first() {
        let broker = MsgBroker::new();
        let output = broker.subscriber("mergedq");
        feed(&broker, "a", &[5.0]);
        let raw = broker.publisher("b");
        // Telemetry packet without secondary header
        let plain = SpacePacket::with_header(3, 8, true).unwrap();
        raw.post(plain.as_bytes(), TIMEOUT).unwrap();
        raw.post_terminator(TIMEOUT).unwrap();
        assert_eq!(packet_time(plain.as_bytes()), 0.0);
        let mut interleaver = Interleaver::new(&config(&["a", "b"]), &broker).unwrap();
        interleaver.run();
        assert_eq!(output.receive(TIMEOUT).unwrap(), plain.as_bytes().to_vec());
    }

    #[test]
    fn test_packet_time_without_stamp() {
        assert_eq!(packet_time(&stamped(1, 1234.5)), 1234.5);
        assert_eq!(packet_time(&[0x08, 0x01]), 0.0);
        // Command packet with secondary header
        let mut cmd = SpacePacket::with_header(2, 16, true).unwrap();
        cmd.set_packet_type(crate::PacketType::Tc);
        cmd.set_sec_header_flag(true);
        assert_eq!(packet_time(cmd.as_bytes()), 0.0);
        // Telemetry stamp cut off by the end of the message
        let truncated = stamped(1, 1234.5);
        assert_eq!(packet_time(&truncated[..10]), 0.0);
    }

    #[test]
    fn test_worker_thread() {
        let broker = MsgBroker::new();
        let output = broker.subscriber("mergedq");
        let handle = Interleaver::new(&config(&["a", "b"]), &broker)
            .unwrap()
            .spawn()
            .unwrap();
        feed(&broker, "b", &[7.0]);
        feed(&broker, "a", &[8.0]);
        handle.join();
        assert_eq!(merged_times(&output), vec![7.0, 8.0]);
    }

    #[test]
    fn test_requires_inputs() {
        let broker = MsgBroker::new();
        assert!(Interleaver::new(&config(&[]), &broker).is_err());
    }
}

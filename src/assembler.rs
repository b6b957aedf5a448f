//! Packet assembler which recovers, validates and forwards packets from a raw byte stream.
//!
//! The [PacketAssembler] runs a [FrameParser] over every received message. Completed packets are
//! checked against the APID filter, validated and accounted in the per-APID [StatsTable] before
//! they are posted to the output channel. [PacketAssembler::spawn] moves the assembler onto a
//! worker thread and starts a second thread which periodically closes the statistics period and
//! posts a [zc::StatsRecord] for every APID with traffic.
//!
//! The filter, the statistics and the validation settings are shared with the threads through an
//! [AssemblerControl] handle. Its lock is only held while tables are read or updated, never while
//! posting to a channel.
use crate::channel::{ChannelError, MsgBroker, Publisher, Subscriber, WorkerHandle};
use crate::config::{AssemblerConfig, ConfigError};
use crate::packet::{
    CcsdsPacket, EncapProtocol, Packet, SpacePacketHeader, SpacePacketRef,
};
use crate::parser::FrameParser;
use crate::stats::{zc, ApidStats, StatsTable};
use crate::{SegmentationFlags, ALL_APIDS, MAX_APID, MAX_SEQ_COUNT, NUM_APIDS};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use delegate::delegate;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use zerocopy::AsBytes;

#[derive(Debug)]
struct Shared {
    filter: Vec<bool>,
    stats: StatsTable,
    pass_invalid: bool,
    reset_invalid: bool,
    strip_header: bool,
}

/// Cloneable handle to the filter, statistics and settings of an assembler.
#[derive(Debug, Clone)]
pub struct AssemblerControl {
    name: String,
    shared: Arc<Mutex<Shared>>,
}

impl AssemblerControl {
    fn new(cfg: &AssemblerConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            shared: Arc::new(Mutex::new(Shared {
                filter: vec![true; NUM_APIDS],
                stats: StatsTable::new(),
                pass_invalid: cfg.pass_invalid,
                reset_invalid: cfg.reset_invalid,
                strip_header: cfg.strip_header,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enables or disables forwarding for the APIDs `start..=stop`, or for every APID if `start`
    /// is [ALL_APIDS]. Returns false if `start` is out of range.
    pub fn filter(&self, enable: bool, start: usize, stop: usize) -> bool {
        let mut shared = self.shared.lock();
        if start == ALL_APIDS {
            shared.filter.fill(enable);
            return true;
        }
        if start >= NUM_APIDS {
            error!("{}: invalid APID {} for filter", self.name, start);
            return false;
        }
        let stop = stop.clamp(start, NUM_APIDS - 1);
        shared.filter[start..=stop].fill(enable);
        true
    }

    pub fn is_enabled(&self, apid: u16) -> bool {
        self.shared.lock().filter[usize::from(apid & MAX_APID)]
    }

    /// Clears the statistics of one APID, or of all APIDs for [ALL_APIDS].
    pub fn clear_stats(&self, apid: usize) -> bool {
        let cleared = self.shared.lock().stats.clear(apid);
        if !cleared {
            error!("{}: invalid APID {} for statistics", self.name, apid);
        }
        cleared
    }

    /// Snapshot of the statistics of one APID or of the aggregate for [ALL_APIDS].
    pub fn stats(&self, apid: usize) -> Option<ApidStats> {
        self.shared.lock().stats.get(apid).cloned()
    }

    pub fn set_pass_invalid(&self, enable: bool) {
        self.shared.lock().pass_invalid = enable;
    }

    pub fn set_reset_invalid(&self, enable: bool) {
        self.shared.lock().reset_invalid = enable;
    }

    pub fn set_strip_header(&self, enable: bool) {
        self.shared.lock().strip_header = enable;
    }

    /// Logs the statistics of one APID. Returns the logged snapshot.
    pub fn log_stats(&self, apid: usize) -> Option<ApidStats> {
        let (stats, pass_invalid, reset_invalid) = {
            let shared = self.shared.lock();
            (
                shared.stats.get(apid).cloned(),
                shared.pass_invalid,
                shared.reset_invalid,
            )
        };
        let Some(stats) = stats else {
            error!("{}: invalid APID {} for statistics", self.name, apid);
            return None;
        };
        info!("{}: apid:            {:04X}", self.name, stats.apid);
        info!("{}: total (pkts):    {}", self.name, stats.total_pkts);
        info!("{}: total (bytes):   {}", self.name, stats.total_bytes);
        info!("{}: current (pkts):  {}", self.name, stats.curr_pkts);
        info!("{}: current (bytes): {}", self.name, stats.curr_bytes);
        info!("{}: dropped (pkts):  {}", self.name, stats.pkts_dropped);
        info!("{}: filtered (pkts): {}", self.name, stats.pkts_filtered);
        info!("{}: seq errors:      {}", self.name, stats.seq_errors);
        info!("{}: seg errors:      {}", self.name, stats.seg_errors);
        info!("{}: len errors:      {}", self.name, stats.len_errors);
        info!("{}: odd errors:      {}", self.name, stats.odd_errors);
        info!("{}: cks errors:      {}", self.name, stats.chksum_errors);
        info!("{}: filter:          {}", self.name, stats.filter_factor);
        info!("{}: max bps:         {}", self.name, stats.max_bps);
        info!("{}: min bps:         {}", self.name, stats.min_bps);
        info!("{}: avg bps:         {}", self.name, stats.avg_bps);
        info!("{}: pass invalid:    {}", self.name, pass_invalid);
        info!("{}: reset invalid:   {}", self.name, reset_invalid);
        Some(stats)
    }
}

/// Validates a completed space packet and updates the sequence and segmentation tracking of its
/// APID. Sequence gaps are counted but do not invalidate the packet.
pub fn validate_space_packet(
    name: &str,
    stats: &mut StatsTable,
    pkt: &SpacePacketRef<'_>,
    ignore_length: bool,
) -> bool {
    let apid = pkt.apid();
    let slot_idx = usize::from(apid);
    let seq = pkt.seq();
    let seg = pkt.seg_flags();
    let mut valid = true;

    if pkt.is_cmd() && pkt.has_sec_header() && !pkt.valid_checksum() {
        valid = false;
        stats.inc_chksum_errors(apid);
        error!(
            "{name}: incorrect checksum in command packet {apid:04X}: expected {:?}, checksum {:?}",
            pkt.compute_checksum().ok(),
            pkt.checksum().ok()
        );
    }

    if pkt.is_tlm() {
        if !ignore_length && pkt.declared_len() != pkt.received_len() {
            valid = false;
            stats.inc_len_errors(apid);
            error!(
                "{name}: packet {apid:04X} failed strict length validation, exp: {}, act: {}",
                pkt.received_len(),
                pkt.declared_len()
            );
        }
        let mut seq_error = false;
        if let Some(slot) = stats.get_mut(slot_idx) {
            let expected = (slot.last_seq + slot.filter_factor) & MAX_SEQ_COUNT;
            if slot.total_pkts > 2 && expected != seq {
                warn!(
                    "{name}: packet {apid:04X} seq {seq:04X} unexpected from previous seq {:04X} \
                     (filter factor of {})",
                    slot.last_seq, slot.filter_factor
                );
                seq_error = true;
            }
            slot.filter_factor = seq.wrapping_sub(slot.last_seq) & MAX_SEQ_COUNT;
            slot.last_seq = seq;
        }
        if seq_error {
            stats.inc_seq_errors(apid);
        }
    }

    let last_seg = stats.get(slot_idx).and_then(|slot| slot.last_seg);
    match last_seg {
        Some(last) if last != SegmentationFlags::Stop && seg == SegmentationFlags::Start => {
            error!("{name}: missing stop segmentation flags for APID {apid:04X} SEQ {seq:04X} ({last} {seg})");
            stats.inc_seg_errors(apid);
            valid = false;
        }
        Some(SegmentationFlags::Stop) if seg != SegmentationFlags::Start => {
            error!("{name}: missing start segmentation flags for APID {apid:04X} SEQ {seq:04X} (STOP {seg})");
            stats.inc_seg_errors(apid);
            valid = false;
        }
        _ => (),
    }
    if let Some(slot) = stats.get_mut(slot_idx) {
        slot.last_seg = Some(seg);
    }
    valid
}

pub struct PacketAssembler {
    control: AssemblerControl,
    parser: FrameParser,
    pkt: Packet,
    input: Subscriber,
    output: Option<Publisher>,
    stats_output: Option<Publisher>,
    timeout: Duration,
    telemetry_interval: Duration,
    in_sync: bool,
    parser_bytes: u64,
    active: Arc<AtomicBool>,
}

impl PacketAssembler {
    pub fn new(cfg: &AssemblerConfig, broker: &MsgBroker) -> Result<Self, ConfigError> {
        if cfg.input.is_empty() {
            return Err(ConfigError::MissingParameter("input"));
        }
        let parser = FrameParser::from_config(&cfg.parser)?;
        debug!("{}: created with {} parser", cfg.name, parser.name());
        Ok(Self {
            control: AssemblerControl::new(cfg),
            parser,
            pkt: Packet::new(cfg.packet_kind),
            input: broker.subscriber(&cfg.input),
            output: cfg.output.as_deref().map(|name| broker.publisher(name)),
            stats_output: cfg.stats.as_deref().map(|name| broker.publisher(name)),
            timeout: cfg.timeout(),
            telemetry_interval: cfg.telemetry_interval(),
            in_sync: true,
            parser_bytes: 0,
            active: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn control(&self) -> AssemblerControl {
        self.control.clone()
    }

    delegate! {
        to self.control {
            pub fn name(&self) -> &str;
            pub fn filter(&self, enable: bool, start: usize, stop: usize) -> bool;
            pub fn is_enabled(&self, apid: u16) -> bool;
            pub fn clear_stats(&self, apid: usize) -> bool;
            pub fn stats(&self, apid: usize) -> Option<ApidStats>;
            pub fn set_pass_invalid(&self, enable: bool);
            pub fn set_reset_invalid(&self, enable: bool);
            pub fn set_strip_header(&self, enable: bool);
        }
    }

    /// Logs the statistics of one APID along with the state of the packet in progress.
    pub fn log_stats(&self, apid: usize) -> Option<ApidStats> {
        let stats = self.control.log_stats(apid)?;
        info!("{}: pkt len:         {}", self.name(), self.pkt.total_len());
        info!("{}: pkt index:       {}", self.name(), self.pkt.index());
        Some(stats)
    }

    /// Total number of bytes received so far.
    pub fn parser_bytes(&self) -> u64 {
        self.parser_bytes
    }

    pub fn in_sync(&self) -> bool {
        self.in_sync
    }

    pub fn parser(&self) -> &FrameParser {
        &self.parser
    }

    /// Runs one received message through the parser and handles every completed packet.
    pub fn process(&mut self, buf: &[u8]) {
        self.parser_bytes += buf.len() as u64;
        let mut idx = 0;
        while idx < buf.len() {
            match self.parser.parse(&buf[idx..], &mut self.pkt) {
                Ok(consumed) => {
                    if !self.in_sync {
                        info!(
                            "{}: parser re-established sync at {}",
                            self.name(),
                            self.parser_bytes
                        );
                        self.in_sync = true;
                    }
                    idx += consumed;
                }
                Err(e) => {
                    if self.in_sync {
                        info!(
                            "{}: parser out of sync ({e}) at {}",
                            self.name(),
                            self.parser_bytes
                        );
                        self.in_sync = false;
                    }
                    self.pkt.reset();
                    self.parser.goto_init_state(true);
                    idx += 1;
                }
            }
            if self.pkt.is_full() {
                self.handle_packet();
                self.pkt.reset();
            }
        }
    }

    fn handle_packet(&mut self) {
        let apid = self.pkt.apid();
        let len = self.pkt.total_len();
        let (forward, strip_header) = {
            let mut shared = self.control.shared.lock();
            if !shared.filter[usize::from(apid & MAX_APID)] {
                shared.stats.inc_pkts_filtered(apid);
                return;
            }
            let valid = match &self.pkt {
                Packet::Space(pkt) => match SpacePacketRef::new(pkt.as_bytes()) {
                    Ok(view) => {
                        validate_space_packet(&self.control.name, &mut shared.stats, &view, true)
                    }
                    Err(_) => false,
                },
                Packet::Encap(_) => apid != u16::from(u8::from(EncapProtocol::Idle)),
            };
            let forward = valid || shared.pass_invalid;
            if forward {
                shared.stats.add_packet(apid, len);
            } else {
                warn!("{}: packet {:04X} dropped", self.control.name, apid);
                shared.stats.inc_pkts_dropped(apid);
            }
            if !valid && shared.reset_invalid {
                self.parser.goto_init_state(true);
            }
            (forward, shared.strip_header)
        };
        if forward {
            self.post_packet(apid, strip_header);
        }
    }

    fn post_packet(&self, apid: u16, strip_header: bool) {
        let Some(output) = &self.output else {
            return;
        };
        let data = if strip_header {
            self.pkt.payload()
        } else {
            self.pkt.as_bytes()
        };
        if data.is_empty() {
            error!(
                "{}: packet {:04X} has invalid size {}",
                self.name(),
                apid,
                data.len()
            );
            return;
        }
        match output.post_while(data, self.timeout, &self.active) {
            Ok(_) => (),
            Err(ChannelError::Timeout) => {
                debug!("{}: packet {:04X} not posted on shutdown", self.name(), apid);
            }
            Err(e) => {
                error!(
                    "{}: packet {:04X} unable to be posted ({e}) to output stream {}",
                    self.name(),
                    apid,
                    output.name()
                );
                self.control.shared.lock().stats.inc_pkts_dropped(apid);
            }
        }
    }

    /// Posts the end of stream terminator to the output channel.
    fn deinit(&self) {
        if let Some(output) = &self.output {
            if let Err(e) = output.post_terminator(self.timeout) {
                error!(
                    "{}: failed ({e}) to post terminator to {}",
                    self.name(),
                    output.name()
                );
            }
        }
    }

    fn run(mut self) {
        while self.active.load(Ordering::Relaxed) {
            match self.input.receive(self.timeout) {
                Ok(msg) if msg.is_empty() => {
                    info!("{}: end of stream on {}", self.name(), self.input.name());
                    break;
                }
                Ok(msg) => self.process(&msg),
                Err(ChannelError::Timeout) => continue,
                Err(e) => {
                    error!("{}: failed ({e}) to receive from {}", self.name(), self.input.name());
                    break;
                }
            }
        }
        self.deinit();
        self.active.store(false, Ordering::Relaxed);
    }

    /// Moves the assembler onto a worker thread and starts the statistics thread.
    pub fn spawn(self) -> std::io::Result<AssemblerHandle> {
        let control = self.control.clone();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let telemetry_active = Arc::new(AtomicBool::new(true));
        let telemetry = {
            let control = control.clone();
            let active = telemetry_active.clone();
            let stats_output = self.stats_output.clone();
            let interval = self.telemetry_interval;
            let timeout = self.timeout;
            WorkerHandle::spawn(
                &format!("{}-telemetry", control.name),
                telemetry_active,
                move || {
                    let mut last = Instant::now();
                    while active.load(Ordering::Relaxed) {
                        if let Ok(()) | Err(RecvTimeoutError::Disconnected) =
                            stop_rx.recv_timeout(interval)
                        {
                            break;
                        }
                        let now = Instant::now();
                        let elapsed = now.duration_since(last).as_secs_f64();
                        last = now;
                        let snapshots = control.shared.lock().stats.close_period(elapsed);
                        let Some(stats_output) = &stats_output else {
                            continue;
                        };
                        for snapshot in snapshots {
                            let record = zc::StatsRecord::from(&snapshot);
                            if let Err(e) = stats_output.post(record.as_bytes(), timeout) {
                                error!(
                                    "{}: failed ({e}) to post apid stats to {}",
                                    control.name,
                                    stats_output.name()
                                );
                            }
                        }
                    }
                },
            )?
        };
        let name = control.name.clone();
        let active = self.active.clone();
        let worker = WorkerHandle::spawn(&name, active, move || self.run())?;
        Ok(AssemblerHandle {
            control,
            stop_tx: Some(stop_tx),
            worker,
            telemetry,
        })
    }
}

/// Handle to a running assembler. Dropping the handle stops both threads.
pub struct AssemblerHandle {
    control: AssemblerControl,
    // Declared before the workers so that dropping it wakes up the statistics thread first
    stop_tx: Option<Sender<()>>,
    worker: WorkerHandle,
    telemetry: WorkerHandle,
}

impl AssemblerHandle {
    pub fn control(&self) -> &AssemblerControl {
        &self.control
    }

    pub fn is_active(&self) -> bool {
        self.worker.is_active()
    }

    /// Waits until the worker reached the end of its input stream, then stops the statistics
    /// thread.
    pub fn join(self) {
        let AssemblerHandle {
            stop_tx,
            worker,
            mut telemetry,
            ..
        } = self;
        worker.join();
        drop(stop_tx);
        telemetry.stop();
    }

    /// Stops processing after the message in progress.
    pub fn stop(&mut self) {
        self.worker.stop();
        self.stop_tx.take();
        self.telemetry.stop();
    }
}

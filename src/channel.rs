//! Named in-process message queues connecting the processing components.
//!
//! A [MsgBroker] is a cheaply cloneable handle to a registry of bounded FIFO queues which are
//! created on first use. Any number of [Publisher]s and [Subscriber]s can be attached to the same
//! queue name. Messages are byte vectors, a zero-length message marks the end of a stream.
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::error;

pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The operation did not complete in time and can be retried.
    #[error("channel operation timed out")]
    Timeout,
    #[error("channel disconnected")]
    Disconnected,
}

type Queue = (Sender<Vec<u8>>, Receiver<Vec<u8>>);

#[derive(Debug, Clone)]
pub struct MsgBroker {
    depth: usize,
    queues: Arc<Mutex<HashMap<String, Queue>>>,
}

impl Default for MsgBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgBroker {
    pub fn new() -> Self {
        Self::with_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// Queues created through this broker hold at most `depth` messages. A depth of zero
    /// creates rendezvous queues.
    pub fn with_depth(depth: usize) -> Self {
        Self {
            depth,
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn queue(&self, name: &str) -> Queue {
        let mut queues = self.queues.lock();
        queues
            .entry(name.to_string())
            .or_insert_with(|| bounded(self.depth))
            .clone()
    }

    pub fn publisher(&self, name: &str) -> Publisher {
        Publisher {
            name: name.to_string(),
            tx: self.queue(name).0,
        }
    }

    pub fn subscriber(&self, name: &str) -> Subscriber {
        Subscriber {
            name: name.to_string(),
            rx: self.queue(name).1,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.lock().contains_key(name)
    }

    /// Forgets a queue. Attached handles keep working among each other, posting fails with
    /// [ChannelError::Disconnected] once no subscriber is left.
    pub fn remove(&self, name: &str) -> bool {
        self.queues.lock().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone)]
pub struct Publisher {
    name: String,
    tx: Sender<Vec<u8>>,
}

impl Publisher {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Posts a copy of `data`. Returns the number of posted bytes.
    pub fn post(&self, data: &[u8], timeout: Duration) -> Result<usize, ChannelError> {
        self.tx
            .send_timeout(data.to_vec(), timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => ChannelError::Timeout,
                SendTimeoutError::Disconnected(_) => ChannelError::Disconnected,
            })?;
        Ok(data.len())
    }

    /// Posts `data`, retrying on timeouts for as long as `active` is set.
    pub fn post_while(
        &self,
        data: &[u8],
        timeout: Duration,
        active: &AtomicBool,
    ) -> Result<usize, ChannelError> {
        loop {
            match self.post(data, timeout) {
                Err(ChannelError::Timeout) if active.load(Ordering::Relaxed) => continue,
                result => return result,
            }
        }
    }

    /// Posts the zero-length end of stream message.
    pub fn post_terminator(&self, timeout: Duration) -> Result<(), ChannelError> {
        self.post(&[], timeout).map(|_| ())
    }

    /// Number of messages waiting in the queue.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Subscriber {
    name: String,
    rx: Receiver<Vec<u8>>,
}

impl Subscriber {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn receive(&self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ChannelError::Timeout,
            RecvTimeoutError::Disconnected => ChannelError::Disconnected,
        })
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Handle to a thread which processes channel messages for as long as its active flag is set.
/// Dropping the handle clears the flag and joins the thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn<F>(name: &str, active: Arc<AtomicBool>, work: F) -> std::io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(work)?;
        Ok(Self {
            name: name.to_string(),
            active,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn join_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("{}: worker thread panicked", self.name);
            }
        }
    }

    /// Waits for the worker to finish on its own, usually at the end of its input stream.
    pub fn join(mut self) {
        self.join_thread();
    }

    pub fn stop(&mut self) {
        self.active.store(false, Ordering::Relaxed);
        self.join_thread();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

use std::sync::Arc;
use std::time::Duration;

use crate::hash::HashAlgorithm;

/// Wire protocol spoken to the servers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// The classic line-oriented ASCII protocol.
    Ascii,
    /// The framed binary protocol (24-byte headers, magic 0x80/0x81).
    Binary,
}

/// How keys are mapped onto nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocatorKind {
    /// `hash(key) mod N`. Simple, but a membership change remaps almost
    /// every key.
    Array,
    /// Ketama consistent hashing: a membership change only remaps the keys
    /// on the affected node's arcs.
    Ketama,
}

/// What happens to operations queued on a node whose connection breaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureMode {
    /// Replay queued operations on the same node once it reconnects.
    Retry,
    /// Fail queued and in-flight operations with `ConnectionLost`.
    Cancel,
    /// Re-route queued operations to the next live node in the locator's
    /// fallback sequence.
    Redistribute,
}

/// Callbacks fired from the reactor on connection state transitions.
pub trait ConnectionObserver: Send + Sync {
    /// A connection to `addr` was (re-)established. `reconnect_count` is the
    /// number of times this node has reconnected; 0 on first connection.
    fn connection_established(&self, addr: &str, reconnect_count: u32);
    /// The connection to `addr` was lost.
    fn connection_lost(&self, addr: &str);
}

/// Client configuration, built with chained setters.
///
/// ```no_run
/// use memring::{ClientConfig, FailureMode};
/// use std::time::Duration;
///
/// let config = ClientConfig::new(["10.0.1.1:11211", "10.0.1.2:11211"])
///     .operation_timeout(Duration::from_millis(500))
///     .failure_mode(FailureMode::Redistribute);
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) servers: Vec<String>,
    pub(crate) protocol: Protocol,
    pub(crate) locator: LocatorKind,
    pub(crate) hash_algorithm: HashAlgorithm,
    pub(crate) failure_mode: FailureMode,
    pub(crate) operation_timeout: Duration,
    pub(crate) read_buf_size: usize,
    pub(crate) write_buf_size: usize,
    pub(crate) op_queue_max: usize,
    pub(crate) max_reconnect_delay: Duration,
    pub(crate) observer: Option<Arc<dyn ConnectionObserver>>,
}

impl ClientConfig {
    /// A configuration for the given servers with defaults: ASCII protocol,
    /// Ketama locator and hash, `Retry` failure mode, 2.5 s operation
    /// timeout, 16 KiB buffers, 16384-deep operation queues, 30 s reconnect
    /// ceiling.
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ClientConfig {
            servers: servers.into_iter().map(|s| s.as_ref().to_string()).collect(),
            protocol: Protocol::Ascii,
            locator: LocatorKind::Ketama,
            hash_algorithm: HashAlgorithm::Ketama,
            failure_mode: FailureMode::Retry,
            operation_timeout: Duration::from_millis(2500),
            read_buf_size: 16 * 1024,
            write_buf_size: 16 * 1024,
            op_queue_max: 16384,
            max_reconnect_delay: Duration::from_secs(30),
            observer: None,
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn locator(mut self, locator: LocatorKind) -> Self {
        self.locator = locator;
        self
    }

    pub fn hash_algorithm(mut self, hash_algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = hash_algorithm;
        self
    }

    pub fn failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    /// Deadline applied to every public call awaiting its result. The
    /// underlying operation is not cancelled when the deadline elapses.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn read_buf_size(mut self, size: usize) -> Self {
        self.read_buf_size = size;
        self
    }

    pub fn write_buf_size(mut self, size: usize) -> Self {
        self.write_buf_size = size;
        self
    }

    /// Capacity of the ingress queue and of each node's pending-write queue.
    /// Submissions beyond capacity fail fast with `Error::QueueFull`.
    pub fn op_queue_max(mut self, max: usize) -> Self {
        self.op_queue_max = max;
        self
    }

    /// Ceiling for the exponential reconnect backoff (1 s, 2 s, 4 s, ...).
    pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.max_reconnect_delay = delay;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

//! A Tokio-based clustered memcached client.
//!
//! Keys route to servers with Ketama consistent hashing, every server gets
//! one persistent pipelined connection, and a single reactor task owns all of
//! the I/O. Public calls never block: they validate input, enqueue an
//! operation onto a bounded channel, and await the result under the
//! configured operation timeout.
//!
//! ```no_run
//! use memring::{Client, ClientConfig};
//!
//! # async fn demo() -> Result<(), memring::Error> {
//! let client = Client::new(ClientConfig::new([
//!     "10.0.1.1:11211",
//!     "10.0.1.2:11211",
//! ]))?;
//!
//! client.set("foo", "bar", 0, 0).await?;
//! let value = client.get("foo").await?;
//! assert_eq!(value.unwrap().data, b"bar");
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod error;
mod hash;
mod node;
mod operation;
mod parser;
mod proto;
mod reactor;
mod ring;
mod transcoder;

pub use config::{ClientConfig, ConnectionObserver, FailureMode, LocatorKind, Protocol};
pub use error::Error;
pub use hash::HashAlgorithm;
pub use parser::{ErrorKind, Status, Value};
pub use ring::NodeLocator;
pub use transcoder::{RawTranscoder, Transcoder, Utf8Transcoder};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tracing::warn;

use crate::node::McNode;
use crate::operation::{
    BroadcastLatch, Completion, OpHandle, OpKind, OpOutcome, OpResult, Operation,
};
use crate::proto::{Request, StoreVerb};
use crate::reactor::{Command, Reactor, Route};

/// Maximum allowed key length, per the protocol specification.
pub const MAX_KEY_LENGTH: usize = 250;

/// Result of a compare-and-swap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasResponse {
    /// The value was stored.
    Stored,
    /// The CAS id no longer matched: another client wrote in between.
    Exists,
    /// The key does not exist.
    NotFound,
}

fn validate_key(key: &[u8]) -> Result<&[u8], Error> {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return Err(Error::InvalidKey(format!(
            "length {} not in 1..={}",
            key.len(),
            MAX_KEY_LENGTH
        )));
    }
    if let Some(b) = key
        .iter()
        .find(|&&b| b == b' ' || b == b'\r' || b == b'\n' || b == 0)
    {
        return Err(Error::InvalidKey(format!(
            "contains forbidden byte {:#04x}",
            b
        )));
    }
    Ok(key)
}

fn protocol_error() -> Error {
    Error::Protocol(Status::Error(ErrorKind::Protocol(None)))
}

// Cancels the underlying operation if the caller drops the call future while
// the operation is still in flight.
struct CancelOnDrop(Option<Arc<OpHandle>>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            if !handle.is_complete() {
                handle.cancel();
            }
        }
    }
}

/// Handle to a memcached cluster.
///
/// Cheap to clone; all clones share one reactor task. Dropping an in-flight
/// call future cancels the underlying operation. An elapsed operation
/// timeout does *not* cancel it: the waiter gives up, the operation keeps
/// running and may still take effect on the server.
#[derive(Clone)]
pub struct Client {
    tx: mpsc::Sender<Command>,
    locator: Arc<NodeLocator>,
    cfg: Arc<ClientConfig>,
    shut_down: Arc<AtomicBool>,
}

impl Client {
    /// Builds the locator, creates one node per configured server, and
    /// spawns the reactor task on the current Tokio runtime.
    ///
    /// Connections are established in the background with exponential
    /// backoff; operations submitted in the meantime queue until their node
    /// comes up.
    pub fn new(config: ClientConfig) -> Result<Client, Error> {
        if config.servers.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "at least one server is required",
            )));
        }
        let addrs = config
            .servers
            .iter()
            .map(|s| connection::normalize_addr(s))
            .collect::<Result<Vec<_>, _>>()?;

        let locator = Arc::new(NodeLocator::new(
            config.locator,
            config.hash_algorithm,
            addrs.clone(),
        ));
        let cfg = Arc::new(config);
        let (tx, rx) = mpsc::channel(cfg.op_queue_max);
        let nodes = addrs
            .into_iter()
            .map(|addr| McNode::new(addr, cfg.clone()))
            .collect();
        tokio::spawn(Reactor::new(rx, nodes, locator.clone(), cfg.clone()).run());

        Ok(Client {
            tx,
            locator,
            cfg,
            shut_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A read-only copy of the locator snapshot in use.
    pub fn locator(&self) -> NodeLocator {
        self.locator.readonly_copy()
    }

    fn submit(&self, op: Operation, route: Route) -> Result<(), Error> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        self.tx
            .try_send(Command::Submit { op, route })
            .map_err(|e| match e {
                TrySendError::Full(_) => Error::QueueFull,
                TrySendError::Closed(_) => Error::Shutdown,
            })
    }

    async fn run_op(&self, request: Request<'_>, key: &[u8]) -> Result<OpOutcome, Error> {
        let cmd = proto::encode(self.cfg.protocol, &request);
        let (handle, rx) = OpHandle::new();
        let op = Operation::new(
            request.kind(),
            cmd,
            Some(key.to_vec()),
            Completion::Single(handle.clone()),
        );
        self.submit(op, Route::Key(key.to_vec()))?;

        let guard = CancelOnDrop(Some(handle));
        match timeout(self.cfg.operation_timeout, rx).await {
            Ok(Ok(result)) => {
                guard.disarm();
                result
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(Error::Shutdown)
            }
            Err(_) => {
                // Only the waiter gives up; the operation keeps running.
                guard.disarm();
                Err(Error::Timeout)
            }
        }
    }

    async fn store(
        &self,
        verb: StoreVerb,
        key: &[u8],
        data: &[u8],
        flags: u32,
        exptime: u32,
        cas: Option<u64>,
    ) -> Result<Status, Error> {
        let key = validate_key(key)?;
        let request = Request::Store {
            verb,
            key,
            flags,
            exptime,
            data,
            cas,
        };
        match self.run_op(request, key).await? {
            OpOutcome::Status(status) => Ok(status),
            _ => Err(protocol_error()),
        }
    }

    /// Stores `data` under `key` unconditionally. Returns `true` when
    /// stored.
    ///
    /// `exptime` is transmitted verbatim: values up to 30 days are relative
    /// seconds, anything larger is an absolute Unix timestamp. 0 never
    /// expires.
    pub async fn set<K, V>(&self, key: K, data: V, flags: u32, exptime: u32) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let status = self
            .store(StoreVerb::Set, key.as_ref(), data.as_ref(), flags, exptime, None)
            .await?;
        Ok(status == Status::Stored)
    }

    /// Stores `data` only if `key` does not exist yet. `false` means the key
    /// was already present.
    pub async fn add<K, V>(&self, key: K, data: V, flags: u32, exptime: u32) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let status = self
            .store(StoreVerb::Add, key.as_ref(), data.as_ref(), flags, exptime, None)
            .await?;
        Ok(status == Status::Stored)
    }

    /// Stores `data` only if `key` already exists.
    pub async fn replace<K, V>(
        &self,
        key: K,
        data: V,
        flags: u32,
        exptime: u32,
    ) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let status = self
            .store(
                StoreVerb::Replace,
                key.as_ref(),
                data.as_ref(),
                flags,
                exptime,
                None,
            )
            .await?;
        Ok(status == Status::Stored)
    }

    /// Appends `data` to an existing value.
    pub async fn append<K, V>(&self, key: K, data: V) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let status = self
            .store(StoreVerb::Append, key.as_ref(), data.as_ref(), 0, 0, None)
            .await?;
        Ok(status == Status::Stored)
    }

    /// Prepends `data` to an existing value.
    pub async fn prepend<K, V>(&self, key: K, data: V) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let status = self
            .store(StoreVerb::Prepend, key.as_ref(), data.as_ref(), 0, 0, None)
            .await?;
        Ok(status == Status::Stored)
    }

    /// Compare-and-swap: stores `data` only if the value's CAS id (from a
    /// prior [`Client::gets`]) still matches.
    pub async fn cas<K, V>(
        &self,
        key: K,
        cas_id: u64,
        data: V,
        flags: u32,
        exptime: u32,
    ) -> Result<CasResponse, Error>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let status = self
            .store(
                StoreVerb::Set,
                key.as_ref(),
                data.as_ref(),
                flags,
                exptime,
                Some(cas_id),
            )
            .await?;
        match status {
            Status::Stored => Ok(CasResponse::Stored),
            Status::Exists => Ok(CasResponse::Exists),
            Status::NotFound => Ok(CasResponse::NotFound),
            status => Err(Error::Protocol(status)),
        }
    }

    async fn retrieve(&self, key: &[u8], with_cas: bool) -> Result<Option<Value>, Error> {
        let key = validate_key(key)?;
        let keys = vec![key.to_vec()];
        let request = Request::Get {
            keys: &keys,
            with_cas,
        };
        match self.run_op(request, key).await? {
            OpOutcome::Values(mut values) => {
                if values.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(values.remove(0)))
                }
            }
            _ => Err(protocol_error()),
        }
    }

    /// Fetches `key`. `None` when the key does not exist.
    pub async fn get<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Value>, Error> {
        self.retrieve(key.as_ref(), false).await
    }

    /// Fetches `key` along with its CAS id, for use with [`Client::cas`].
    pub async fn gets<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<Value>, Error> {
        self.retrieve(key.as_ref(), true).await
    }

    /// Fetches many keys at once, one pipelined retrieval per node.
    ///
    /// Missing keys are simply absent from the result map. A failed node's
    /// keys degrade to misses; the failure is logged, not propagated.
    pub async fn get_multi<I, K>(&self, keys: I) -> Result<FxHashMap<Vec<u8>, Value>, Error>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let mut groups: FxHashMap<usize, Vec<Vec<u8>>> = FxHashMap::default();
        for key in keys {
            let key = validate_key(key.as_ref())?;
            groups
                .entry(self.locator.primary(key))
                .or_default()
                .push(key.to_vec());
        }
        if groups.is_empty() {
            return Ok(FxHashMap::default());
        }

        let (latch, rx) = BroadcastLatch::new(groups.len());
        for (index, group) in groups {
            let cmd = proto::encode(
                self.cfg.protocol,
                &Request::Get {
                    keys: &group,
                    with_cas: false,
                },
            );
            let addr = self.locator.addr(index).to_string();
            let routing_key = group.into_iter().next();
            let op = Operation::new(
                OpKind::Retrieval,
                cmd,
                routing_key,
                Completion::Broadcast {
                    latch: latch.clone(),
                    addr: addr.clone(),
                },
            );
            if let Err(e) = self.submit(op, Route::Node(index)) {
                latch.complete_one(addr, Err(e));
            }
        }

        let results = match timeout(self.cfg.operation_timeout, rx).await {
            Ok(Ok(results)) => results,
            Ok(Err(_)) => return Err(Error::Shutdown),
            Err(_) => return Err(Error::Timeout),
        };

        let mut map = FxHashMap::default();
        for (addr, result) in results {
            match result {
                Ok(OpOutcome::Values(values)) => {
                    for value in values {
                        map.insert(value.key.clone(), value);
                    }
                }
                Ok(_) => warn!(%addr, "unexpected bulk get outcome"),
                Err(e) => warn!(%addr, error = %e, "bulk get shard failed"),
            }
        }
        Ok(map)
    }

    async fn mutate(&self, key: &[u8], delta: u64, decr: bool) -> Result<Option<u64>, Error> {
        let key = validate_key(key)?;
        let request = Request::Mutate { key, delta, decr };
        match self.run_op(request, key).await? {
            OpOutcome::Counter(value) => Ok(Some(value)),
            OpOutcome::Status(Status::NotFound) => Ok(None),
            OpOutcome::Status(status) => Err(Error::Protocol(status)),
            _ => Err(protocol_error()),
        }
    }

    /// Increments the numeric value at `key` by `delta`, returning the new
    /// value, or `None` when the key does not exist.
    pub async fn incr<K: AsRef<[u8]>>(&self, key: K, delta: u64) -> Result<Option<u64>, Error> {
        self.mutate(key.as_ref(), delta, false).await
    }

    /// Decrements the numeric value at `key` by `delta`, returning the new
    /// value, or `None` when the key does not exist. The server never
    /// decrements below zero.
    pub async fn decr<K: AsRef<[u8]>>(&self, key: K, delta: u64) -> Result<Option<u64>, Error> {
        self.mutate(key.as_ref(), delta, true).await
    }

    /// Increment with a default: a miss stores `default` via `add`. Losing
    /// the add race to another client falls back to incrementing their
    /// value.
    pub async fn incr_with_default<K: AsRef<[u8]>>(
        &self,
        key: K,
        delta: u64,
        default: u64,
        exptime: u32,
    ) -> Result<u64, Error> {
        self.mutate_with_default(key.as_ref(), delta, false, default, exptime)
            .await
    }

    /// Decrement counterpart of [`Client::incr_with_default`].
    pub async fn decr_with_default<K: AsRef<[u8]>>(
        &self,
        key: K,
        delta: u64,
        default: u64,
        exptime: u32,
    ) -> Result<u64, Error> {
        self.mutate_with_default(key.as_ref(), delta, true, default, exptime)
            .await
    }

    async fn mutate_with_default(
        &self,
        key: &[u8],
        delta: u64,
        decr: bool,
        default: u64,
        exptime: u32,
    ) -> Result<u64, Error> {
        const RETRIES: usize = 8;

        let mut itoa = itoa::Buffer::new();
        let default_bytes = itoa.format(default).as_bytes().to_vec();

        for _ in 0..RETRIES {
            if let Some(value) = self.mutate(key, delta, decr).await? {
                return Ok(value);
            }
            let status = self
                .store(StoreVerb::Add, key, &default_bytes, 0, exptime, None)
                .await?;
            if status == Status::Stored {
                return Ok(default);
            }
            // Someone else's add won the race; mutate their value instead.
        }

        Err(Error::Protocol(Status::Error(ErrorKind::Generic(
            "mutation retry limit exceeded".to_string(),
        ))))
    }

    /// Deletes `key`. `false` when the key did not exist.
    pub async fn delete<K: AsRef<[u8]>>(&self, key: K) -> Result<bool, Error> {
        let key = validate_key(key.as_ref())?;
        match self.run_op(Request::Delete { key }, key).await? {
            OpOutcome::Status(Status::Deleted) => Ok(true),
            OpOutcome::Status(Status::NotFound) => Ok(false),
            OpOutcome::Status(status) => Err(Error::Protocol(status)),
            _ => Err(protocol_error()),
        }
    }

    /// Updates the expiration of `key` without touching its value. `false`
    /// when the key did not exist.
    pub async fn touch<K: AsRef<[u8]>>(&self, key: K, exptime: u32) -> Result<bool, Error> {
        let key = validate_key(key.as_ref())?;
        match self.run_op(Request::Touch { key, exptime }, key).await? {
            OpOutcome::Status(Status::Touched) => Ok(true),
            OpOutcome::Status(Status::NotFound) => Ok(false),
            OpOutcome::Status(status) => Err(Error::Protocol(status)),
            _ => Err(protocol_error()),
        }
    }

    // One operation per node sharing a countdown latch; the caller awaits
    // the latch under the operation timeout.
    async fn broadcast(&self, request: Request<'_>) -> Result<Vec<(String, OpResult)>, Error> {
        let kind = request.kind();
        let cmd = proto::encode(self.cfg.protocol, &request);
        let (latch, rx) = BroadcastLatch::new(self.locator.len());

        for index in self.locator.all() {
            let addr = self.locator.addr(index).to_string();
            let op = Operation::new(
                kind,
                cmd.clone(),
                None,
                Completion::Broadcast {
                    latch: latch.clone(),
                    addr: addr.clone(),
                },
            );
            if let Err(e) = self.submit(op, Route::Node(index)) {
                latch.complete_one(addr, Err(e));
            }
        }

        match timeout(self.cfg.operation_timeout, rx).await {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Flushes every node, optionally after `delay` seconds. `true` only if
    /// every node acknowledged.
    pub async fn flush(&self, delay: Option<u32>) -> Result<bool, Error> {
        let results = self.broadcast(Request::Flush { delay }).await?;
        let mut all_ok = true;
        for (addr, result) in results {
            match result {
                Ok(OpOutcome::Status(Status::Ok)) => {}
                Ok(_) => all_ok = false,
                Err(e) => {
                    warn!(%addr, error = %e, "flush failed");
                    all_ok = false;
                }
            }
        }
        Ok(all_ok)
    }

    /// Per-node server version strings. Unreachable nodes are omitted.
    pub async fn version(&self) -> Result<FxHashMap<String, String>, Error> {
        let results = self.broadcast(Request::Version).await?;
        let mut map = FxHashMap::default();
        for (addr, result) in results {
            match result {
                Ok(OpOutcome::Version(version)) => {
                    map.insert(addr, version);
                }
                Ok(_) => {}
                Err(e) => warn!(%addr, error = %e, "version failed"),
            }
        }
        Ok(map)
    }

    /// Broadcasts a no-op to every node, draining each node's pipeline.
    /// `true` only if every node responded.
    ///
    /// Over the binary protocol this is a real noop packet; ASCII has no
    /// no-op command, so `version` stands in and the reply is discarded.
    pub async fn noop(&self) -> Result<bool, Error> {
        let results = self.broadcast(Request::Noop).await?;
        Ok(results.iter().all(|(_, result)| result.is_ok()))
    }

    /// Per-node statistics, optionally scoped (e.g. `stats("items")`).
    /// Unreachable nodes are omitted.
    pub async fn stats(
        &self,
        arg: Option<&str>,
    ) -> Result<FxHashMap<String, FxHashMap<String, String>>, Error> {
        let results = self.broadcast(Request::Stats { arg }).await?;
        let mut map = FxHashMap::default();
        for (addr, result) in results {
            match result {
                Ok(OpOutcome::Stats(entries)) => {
                    map.insert(addr, entries.into_iter().collect());
                }
                Ok(_) => {}
                Err(e) => warn!(%addr, error = %e, "stats failed"),
            }
        }
        Ok(map)
    }

    /// Typed fetch through a [`Transcoder`].
    pub async fn get_with<K, T>(&self, key: K, transcoder: &T) -> Result<Option<T::Value>, Error>
    where
        K: AsRef<[u8]>,
        T: Transcoder,
    {
        match self.get(key).await? {
            Some(value) => transcoder.decode(value.flags, &value.data).map(Some),
            None => Ok(None),
        }
    }

    /// Typed store through a [`Transcoder`].
    pub async fn set_with<K, T>(
        &self,
        key: K,
        value: &T::Value,
        exptime: u32,
        transcoder: &T,
    ) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
        T: Transcoder,
    {
        let (flags, data) = transcoder.encode(value)?;
        self.set(key, data, flags, exptime).await
    }

    /// Typed [`Client::add`] through a [`Transcoder`].
    pub async fn add_with<K, T>(
        &self,
        key: K,
        value: &T::Value,
        exptime: u32,
        transcoder: &T,
    ) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
        T: Transcoder,
    {
        let (flags, data) = transcoder.encode(value)?;
        self.add(key, data, flags, exptime).await
    }

    /// Typed [`Client::replace`] through a [`Transcoder`].
    pub async fn replace_with<K, T>(
        &self,
        key: K,
        value: &T::Value,
        exptime: u32,
        transcoder: &T,
    ) -> Result<bool, Error>
    where
        K: AsRef<[u8]>,
        T: Transcoder,
    {
        let (flags, data) = transcoder.encode(value)?;
        self.replace(key, data, flags, exptime).await
    }

    /// Initiates shutdown. Subsequent submissions fail with
    /// [`Error::Shutdown`]; operations still queued on the reactor are
    /// failed and the reactor task exits.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let _ = self.tx.try_send(Command::Shutdown);
    }
}

//! The unit of work flowing through the reactor.
//!
//! An operation carries its pre-encoded command bytes, walks the state
//! machine `WriteQueued -> Writing -> Reading -> Complete` on its node, and
//! delivers exactly one result through an idempotent completion. Cancellation
//! is cooperative: the caller flips a flag and completes the future
//! immediately; the reactor later skips the write or discards the response,
//! whichever comes first.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::parser::{ErrorKind, Status, Value};

/// Response shape expected by the decoder for an in-flight operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpKind {
    /// get/gets/multi-get: zero or more values, then a terminator.
    Retrieval,
    /// set/add/replace/append/prepend/cas: a single status line.
    Store,
    /// incr/decr: the new value or NOT_FOUND.
    Mutate,
    Delete,
    Touch,
    Flush,
    Version,
    Stats,
    Noop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpState {
    WriteQueued,
    Writing,
    Reading,
    Complete,
    Cancelled,
    Retry,
}

/// Decoded result of a completed operation, before the facade maps it onto
/// the public API types.
#[derive(Debug)]
pub(crate) enum OpOutcome {
    Status(Status),
    Values(Vec<Value>),
    Counter(u64),
    Stats(Vec<(String, String)>),
    Version(String),
}

pub(crate) type OpResult = Result<OpOutcome, Error>;

/// Caller-side handle for a single operation: cancellation flag plus the
/// one-shot completion. `complete` is idempotent; whoever calls it first
/// (reactor or canceller) wins, everyone else is a no-op.
pub(crate) struct OpHandle {
    cancelled: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<OpResult>>>,
}

impl OpHandle {
    pub(crate) fn new() -> (Arc<OpHandle>, oneshot::Receiver<OpResult>) {
        let (tx, rx) = oneshot::channel();
        let handle = Arc::new(OpHandle {
            cancelled: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        });
        (handle, rx)
    }

    pub(crate) fn complete(&self, result: OpResult) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            // The receiver may already be gone; that is fine.
            let _ = tx.send(result);
        }
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.complete(Err(Error::Cancelled));
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }
}

/// Shared latch for fan-out operations (flush, version, stats, multi-get):
/// one operation per node decrements the latch on completion, and the caller
/// receives the per-node results once the count reaches zero.
pub(crate) struct BroadcastLatch {
    remaining: AtomicUsize,
    results: Mutex<Vec<(String, OpResult)>>,
    tx: Mutex<Option<oneshot::Sender<Vec<(String, OpResult)>>>>,
}

impl BroadcastLatch {
    pub(crate) fn new(count: usize) -> (Arc<BroadcastLatch>, oneshot::Receiver<Vec<(String, OpResult)>>) {
        let (tx, rx) = oneshot::channel();
        let latch = Arc::new(BroadcastLatch {
            remaining: AtomicUsize::new(count),
            results: Mutex::new(Vec::with_capacity(count)),
            tx: Mutex::new(Some(tx)),
        });
        (latch, rx)
    }

    pub(crate) fn complete_one(&self, addr: String, result: OpResult) {
        self.results.lock().unwrap().push((addr, result));
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(tx) = self.tx.lock().unwrap().take() {
                let results = mem::take(&mut *self.results.lock().unwrap());
                let _ = tx.send(results);
            }
        }
    }
}

/// Where a finished operation delivers its result.
pub(crate) enum Completion {
    Single(Arc<OpHandle>),
    Broadcast {
        latch: Arc<BroadcastLatch>,
        addr: String,
    },
}

impl Completion {
    fn is_cancelled(&self) -> bool {
        match self {
            Completion::Single(handle) => handle.is_cancelled(),
            Completion::Broadcast { .. } => false,
        }
    }

    fn complete(self, result: OpResult) {
        match self {
            Completion::Single(handle) => handle.complete(result),
            Completion::Broadcast { latch, addr } => latch.complete_one(addr, result),
        }
    }
}

pub(crate) struct Operation {
    pub(crate) kind: OpKind,
    /// Pre-encoded command bytes, written verbatim on replay.
    pub(crate) cmd: Bytes,
    pub(crate) state: OpState,
    /// Routing key, kept so the reactor can redistribute the operation to a
    /// fallback node. Broadcast operations have none.
    pub(crate) key: Option<Vec<u8>>,
    completion: Completion,
    // response accumulators, filled by the decoder
    pub(crate) values: Vec<Value>,
    pub(crate) stats: Vec<(String, String)>,
    pub(crate) counter: Option<u64>,
    pub(crate) version: Option<String>,
    pub(crate) status: Option<Status>,
}

impl Operation {
    pub(crate) fn new(
        kind: OpKind,
        cmd: Bytes,
        key: Option<Vec<u8>>,
        completion: Completion,
    ) -> Operation {
        Operation {
            kind,
            cmd,
            state: OpState::WriteQueued,
            key,
            completion,
            values: Vec::new(),
            stats: Vec::new(),
            counter: None,
            version: None,
            status: None,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.completion.is_cancelled()
    }

    /// Deliver the decoded response. A cancelled operation's response is
    /// discarded; its future already resolved with `Cancelled`.
    pub(crate) fn finish(mut self) {
        self.state = OpState::Complete;
        if self.completion.is_cancelled() {
            return;
        }
        let result = self.outcome();
        self.completion.complete(result);
    }

    /// Deliver a failure (connection lost, queue full, shutdown, ...).
    pub(crate) fn fail(mut self, err: Error) {
        self.state = OpState::Cancelled;
        self.completion.complete(Err(err));
    }

    fn outcome(&mut self) -> OpResult {
        if let Some(Status::Error(kind)) = &self.status {
            return Err(Error::Protocol(Status::Error(kind.clone())));
        }

        match self.kind {
            OpKind::Retrieval => Ok(OpOutcome::Values(mem::take(&mut self.values))),
            OpKind::Store | OpKind::Delete | OpKind::Touch | OpKind::Flush => {
                match self.status.take() {
                    Some(status) => Ok(OpOutcome::Status(status)),
                    None => Err(Error::Protocol(Status::Error(ErrorKind::Protocol(None)))),
                }
            }
            OpKind::Mutate => match (self.counter, self.status.take()) {
                (Some(value), _) => Ok(OpOutcome::Counter(value)),
                (None, Some(status)) => Ok(OpOutcome::Status(status)),
                (None, None) => Err(Error::Protocol(Status::Error(ErrorKind::Protocol(None)))),
            },
            OpKind::Stats => Ok(OpOutcome::Stats(mem::take(&mut self.stats))),
            OpKind::Version | OpKind::Noop => {
                Ok(OpOutcome::Version(self.version.take().unwrap_or_default()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_is_idempotent() {
        let (handle, mut rx) = OpHandle::new();
        handle.complete(Ok(OpOutcome::Counter(1)));
        handle.complete(Ok(OpOutcome::Counter(2)));
        match rx.try_recv().unwrap() {
            Ok(OpOutcome::Counter(v)) => assert_eq!(v, 1),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_cancel_completes_with_cancelled() {
        let (handle, mut rx) = OpHandle::new();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.is_complete());
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_cancelled_operation_discards_its_response() {
        let (handle, mut rx) = OpHandle::new();
        handle.cancel();
        let mut op = Operation::new(
            OpKind::Mutate,
            Bytes::from_static(b"incr x 1\r\n"),
            Some(b"x".to_vec()),
            Completion::Single(handle),
        );
        op.counter = Some(7);
        op.finish();
        // Only the cancellation was delivered.
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_broadcast_latch_fires_after_last_completion() {
        let (latch, mut rx) = BroadcastLatch::new(2);
        latch.complete_one("a:11211".to_string(), Ok(OpOutcome::Version("1".into())));
        assert!(rx.try_recv().is_err());
        latch.complete_one("b:11211".to_string(), Ok(OpOutcome::Version("2".into())));
        let results = rx.try_recv().unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_server_error_status_becomes_protocol_error() {
        let (handle, mut rx) = OpHandle::new();
        let mut op = Operation::new(
            OpKind::Store,
            Bytes::from_static(b"set x 0 0 1\r\na\r\n"),
            Some(b"x".to_vec()),
            Completion::Single(handle),
        );
        op.status = Some(Status::Error(ErrorKind::Server("oom".to_string())));
        op.finish();
        assert_eq!(
            rx.try_recv().unwrap().unwrap_err(),
            Error::Protocol(Status::Error(ErrorKind::Server("oom".to_string())))
        );
    }
}

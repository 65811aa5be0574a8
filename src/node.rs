//! Per-server connection state.
//!
//! A node owns one TCP connection, the buffers around it, and two queues:
//! operations waiting to be written and operations fully written and awaiting
//! their response. Responses arrive strictly in command order, so the decoder
//! always feeds the head of the read queue.
//!
//! Exactly one operation is being serialized at any time. Its bytes sit in
//! the write buffer until flushed, which is what makes the retry rule
//! enforceable: an operation still in the write queue was never seen by the
//! server and can be replayed verbatim, while the operation being written may
//! have partially reached the server and never can.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;
use tokio::time::{sleep, Sleep};
use tracing::{debug, warn};

use crate::config::{ClientConfig, FailureMode};
use crate::connection::connect;
use crate::error::Error;
use crate::operation::{OpState, Operation};
use crate::parser::{ErrorKind, Status};
use crate::proto::{DecodeProgress, Decoder};

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum SocketState {
    Connecting(ConnectFuture),
    Connected(TcpStream),
    Backoff(Pin<Box<Sleep>>),
}

pub(crate) struct McNode {
    pub(crate) addr: String,
    cfg: Arc<ClientConfig>,
    state: SocketState,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Operations accepted but not yet serialized (state `WriteQueued`, or
    /// `Retry` while disconnected).
    write_queue: VecDeque<Operation>,
    /// The operation whose bytes are in `write_buf` (state `Writing`).
    writing: Option<Operation>,
    /// Fully written operations awaiting responses, FIFO (state `Reading`).
    read_queue: VecDeque<Operation>,
    decoder: Decoder,
    reconnect_attempts: u32,
    established: u32,
}

impl McNode {
    pub(crate) fn new(addr: String, cfg: Arc<ClientConfig>) -> McNode {
        let state = SocketState::Connecting(Box::pin(connect(addr.clone())));
        McNode {
            addr,
            read_buf: BytesMut::with_capacity(cfg.read_buf_size),
            write_buf: BytesMut::with_capacity(cfg.write_buf_size),
            write_queue: VecDeque::new(),
            writing: None,
            read_queue: VecDeque::new(),
            decoder: Decoder::new(cfg.protocol),
            reconnect_attempts: 0,
            established: 0,
            cfg,
            state,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        matches!(self.state, SocketState::Connected(_))
    }

    // Known-down: a connect attempt already failed or the connection was
    // lost. A node still on its first connect attempt is not down yet.
    fn is_down(&self) -> bool {
        matches!(self.state, SocketState::Backoff(_))
    }

    /// Accept an operation. Fails fast when the queue is full, or when the
    /// node is known to be down under `FailureMode::Cancel`.
    pub(crate) fn enqueue(&mut self, mut op: Operation) {
        if op.is_cancelled() {
            return;
        }
        if self.write_queue.len() >= self.cfg.op_queue_max {
            op.fail(Error::QueueFull);
            return;
        }
        if self.is_down() && self.cfg.failure_mode == FailureMode::Cancel {
            op.fail(Error::ConnectionLost(self.addr.clone()));
            return;
        }
        op.state = OpState::WriteQueued;
        self.write_queue.push_back(op);
    }

    /// Drive this node as far as it will go without blocking. Returns whether
    /// any progress was made, plus operations to re-route elsewhere
    /// (`FailureMode::Redistribute` after a connection loss).
    pub(crate) fn poll_io(&mut self, cx: &mut Context<'_>) -> (bool, Vec<Operation>) {
        let mut progress = false;
        let mut reroutes = Vec::new();

        loop {
            if let SocketState::Backoff(ref mut delay) = self.state {
                if delay.as_mut().poll(cx).is_pending() {
                    break;
                }
                debug!(addr = %self.addr, attempt = self.reconnect_attempts, "reconnecting");
                self.state = SocketState::Connecting(Box::pin(connect(self.addr.clone())));
                progress = true;
                continue;
            }

            if let SocketState::Connecting(ref mut fut) = self.state {
                match fut.as_mut().poll(cx) {
                    Poll::Pending => break,
                    Poll::Ready(Ok(stream)) => {
                        self.on_connected(stream);
                        progress = true;
                        continue;
                    }
                    Poll::Ready(Err(e)) => {
                        reroutes.extend(self.on_connect_failed(e));
                        progress = true;
                        continue;
                    }
                }
            }

            match self.pump(cx) {
                Ok(p) => {
                    progress |= p;
                    break;
                }
                Err(err) => {
                    reroutes.extend(self.on_disconnect(err));
                    progress = true;
                }
            }
        }

        (progress, reroutes)
    }

    // Write and read as much as readiness allows. Errors mean the connection
    // is gone.
    fn pump(&mut self, cx: &mut Context<'_>) -> Result<bool, Error> {
        let mut progress = false;

        loop {
            if self.write_buf.is_empty() {
                if let Some(mut op) = self.writing.take() {
                    op.state = OpState::Reading;
                    self.read_queue.push_back(op);
                }
                loop {
                    match self.write_queue.pop_front() {
                        Some(op) if op.is_cancelled() => continue,
                        Some(mut op) => {
                            op.state = OpState::Writing;
                            self.write_buf.extend_from_slice(&op.cmd);
                            self.writing = Some(op);
                            break;
                        }
                        None => break,
                    }
                }
                if self.write_buf.is_empty() {
                    break;
                }
            }

            let stream = match &self.state {
                SocketState::Connected(s) => s,
                _ => unreachable!("pump called while disconnected"),
            };
            match stream.poll_write_ready(cx) {
                Poll::Pending => break,
                Poll::Ready(Err(e)) => return Err(e.into()),
                Poll::Ready(Ok(())) => {}
            }
            match stream.try_write(&self.write_buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.write_buf.advance(n);
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }

        loop {
            let stream = match &self.state {
                SocketState::Connected(s) => s,
                _ => unreachable!("pump called while disconnected"),
            };
            match stream.poll_read_ready(cx) {
                Poll::Pending => break,
                Poll::Ready(Err(e)) => return Err(e.into()),
                Poll::Ready(Ok(())) => {}
            }
            self.read_buf.reserve(self.cfg.read_buf_size);
            match stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(_) => {
                    progress = true;
                    self.drain_read_buf()?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(progress)
    }

    fn drain_read_buf(&mut self) -> Result<(), Error> {
        while !self.read_buf.is_empty() {
            let op = match self.read_queue.front_mut() {
                Some(op) => op,
                None => {
                    return Err(Error::Protocol(Status::Error(ErrorKind::Protocol(Some(
                        "unsolicited data from server".to_string(),
                    )))));
                }
            };
            match self.decoder.decode(&mut self.read_buf, op) {
                Ok(DecodeProgress::NeedMore) => break,
                Ok(DecodeProgress::Complete) => {
                    let op = self.read_queue.pop_front().expect("head operation");
                    op.finish();
                }
                Err(kind) => return Err(Status::Error(kind).into()),
            }
        }
        Ok(())
    }

    // A connect attempt failed. Nothing was ever written, so the failure
    // mode applies to the whole queue: `Retry` keeps it for the next
    // attempt, `Cancel` fails it, `Redistribute` hands it back for
    // re-routing.
    fn on_connect_failed(&mut self, err: io::Error) -> Vec<Operation> {
        warn!(addr = %self.addr, error = %err, "connect failed");

        let mut reroutes = Vec::new();
        match self.cfg.failure_mode {
            FailureMode::Retry => {}
            FailureMode::Cancel => {
                for op in self.write_queue.drain(..) {
                    op.fail(Error::ConnectionLost(self.addr.clone()));
                }
            }
            FailureMode::Redistribute => {
                reroutes.extend(self.write_queue.drain(..).map(|mut op| {
                    op.state = OpState::Retry;
                    op
                }));
            }
        }

        self.schedule_backoff();
        reroutes
    }

    fn on_connected(&mut self, stream: TcpStream) {
        debug!(addr = %self.addr, reconnects = self.established, "connected");
        if let Some(observer) = &self.cfg.observer {
            observer.connection_established(&self.addr, self.established);
        }
        self.established = self.established.wrapping_add(1);
        self.reconnect_attempts = 0;
        self.decoder.reset();
        self.state = SocketState::Connected(stream);
        // Replay: everything still queued was never written and goes out
        // verbatim.
        for op in &mut self.write_queue {
            if op.state == OpState::Retry {
                op.state = OpState::WriteQueued;
            }
        }
    }

    /// Tear down the connection and apply the failure mode to queued work.
    /// In-flight operations (partially written or awaiting a response) can
    /// never be replayed; they complete as cancelled, or as `ConnectionLost`
    /// under `FailureMode::Cancel`.
    fn on_disconnect(&mut self, err: Error) -> Vec<Operation> {
        warn!(addr = %self.addr, error = %err, "connection lost");
        if let Some(observer) = &self.cfg.observer {
            observer.connection_lost(&self.addr);
        }

        self.read_buf.clear();
        self.write_buf.clear();
        self.decoder.reset();

        let failure_mode = self.cfg.failure_mode;
        let addr = self.addr.clone();
        let in_flight_err = move || match failure_mode {
            FailureMode::Cancel => Error::ConnectionLost(addr.clone()),
            _ => Error::Cancelled,
        };
        if let Some(op) = self.writing.take() {
            op.fail(in_flight_err());
        }
        for op in self.read_queue.drain(..) {
            op.fail(in_flight_err());
        }

        let mut reroutes = Vec::new();
        match self.cfg.failure_mode {
            FailureMode::Retry => {
                for op in &mut self.write_queue {
                    op.state = OpState::Retry;
                }
            }
            FailureMode::Cancel => {
                for op in self.write_queue.drain(..) {
                    op.fail(Error::ConnectionLost(self.addr.clone()));
                }
            }
            FailureMode::Redistribute => {
                reroutes.extend(self.write_queue.drain(..).map(|mut op| {
                    op.state = OpState::Retry;
                    op
                }));
            }
        }

        self.schedule_backoff();
        reroutes
    }

    fn schedule_backoff(&mut self) {
        let exp = self.reconnect_attempts.min(5);
        let delay = Duration::from_secs(1u64 << exp).min(self.cfg.max_reconnect_delay);
        self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
        self.state = SocketState::Backoff(Box::pin(sleep(delay)));
    }

    /// Fail everything still queued; called once when the reactor stops.
    pub(crate) fn shutdown(&mut self) {
        if let Some(op) = self.writing.take() {
            op.fail(Error::Shutdown);
        }
        for op in self.read_queue.drain(..) {
            op.fail(Error::Shutdown);
        }
        for op in self.write_queue.drain(..) {
            op.fail(Error::Shutdown);
        }
    }
}

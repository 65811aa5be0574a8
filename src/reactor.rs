//! The single I/O task servicing every node.
//!
//! All sockets, buffers, and per-node queues are owned here; the rest of the
//! process talks to the reactor exclusively through a bounded channel. Each
//! turn of the loop either routes newly submitted operations or drives node
//! I/O (connects, backoff timers, reads, writes) as far as readiness allows.
//! Wakeups are entirely waker-driven: there is no fixed poll timeout.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::poll_fn;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ClientConfig, FailureMode};
use crate::error::Error;
use crate::node::McNode;
use crate::operation::Operation;
use crate::ring::NodeLocator;

/// Messages from client handles to the reactor.
pub(crate) enum Command {
    Submit { op: Operation, route: Route },
    Shutdown,
}

pub(crate) enum Route {
    /// Route by key through the locator.
    Key(Vec<u8>),
    /// Route to an explicit node (broadcast shards, multi-get groups).
    Node(usize),
}

pub(crate) struct Reactor {
    rx: mpsc::Receiver<Command>,
    nodes: Vec<McNode>,
    locator: Arc<NodeLocator>,
    cfg: Arc<ClientConfig>,
}

enum Tick {
    Cmd(Option<Command>),
    Reroutes(Vec<Operation>),
}

impl Reactor {
    pub(crate) fn new(
        rx: mpsc::Receiver<Command>,
        nodes: Vec<McNode>,
        locator: Arc<NodeLocator>,
        cfg: Arc<ClientConfig>,
    ) -> Reactor {
        Reactor {
            rx,
            nodes,
            locator,
            cfg,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(nodes = self.nodes.len(), "reactor started");

        loop {
            let tick = {
                let Reactor { rx, nodes, .. } = &mut self;
                tokio::select! {
                    cmd = rx.recv() => Tick::Cmd(cmd),
                    reroutes = poll_fn(|cx| poll_nodes(nodes, cx)) => Tick::Reroutes(reroutes),
                }
            };

            match tick {
                Tick::Cmd(Some(Command::Submit { op, route })) => self.dispatch(op, route),
                // All client handles dropped, or an explicit shutdown.
                Tick::Cmd(Some(Command::Shutdown)) | Tick::Cmd(None) => break,
                Tick::Reroutes(ops) => {
                    for op in ops {
                        self.redispatch(op);
                    }
                }
            }
        }

        self.shutdown();
    }

    fn dispatch(&mut self, op: Operation, route: Route) {
        let primary = match route {
            Route::Node(index) => index,
            Route::Key(ref key) => self.locator.primary(key),
        };
        let target = self.fallback_target(primary, &op);
        self.nodes[target].enqueue(op);
    }

    // Under `Redistribute`, an operation aimed at a down node is diverted to
    // the first live node in the key's fallback sequence at submission time.
    fn fallback_target(&self, primary: usize, op: &Operation) -> usize {
        if self.cfg.failure_mode != FailureMode::Redistribute || self.nodes[primary].is_active() {
            return primary;
        }
        let key = match &op.key {
            Some(key) => key,
            None => return primary,
        };
        self.locator
            .sequence(key)
            .into_iter()
            .find(|&index| self.nodes[index].is_active())
            .unwrap_or(primary)
    }

    // Re-route an operation whose node just went down (`Redistribute` only).
    fn redispatch(&mut self, op: Operation) {
        let target = op.key.as_ref().and_then(|key| {
            self.locator
                .sequence(key)
                .into_iter()
                .find(|&index| self.nodes[index].is_active())
        });
        match target {
            Some(index) => {
                debug!(node = %self.nodes[index].addr, "redistributing operation");
                self.nodes[index].enqueue(op);
            }
            None => op.fail(Error::ConnectionLost("no live node".to_string())),
        }
    }

    fn shutdown(&mut self) {
        debug!("reactor shutting down");
        self.rx.close();
        // Reject everything already queued on the channel.
        while let Ok(cmd) = self.rx.try_recv() {
            if let Command::Submit { op, .. } = cmd {
                op.fail(Error::Shutdown);
            }
        }
        for node in &mut self.nodes {
            node.shutdown();
        }
    }
}

fn poll_nodes(nodes: &mut [McNode], cx: &mut Context<'_>) -> Poll<Vec<Operation>> {
    let mut progress = false;
    let mut reroutes = Vec::new();

    for node in nodes.iter_mut() {
        let (node_progress, node_reroutes) = node.poll_io(cx);
        progress |= node_progress;
        if !node_reroutes.is_empty() {
            warn!(addr = %node.addr, count = node_reroutes.len(), "rerouting queued operations");
            reroutes.extend(node_reroutes);
        }
    }

    if progress || !reroutes.is_empty() {
        Poll::Ready(reroutes)
    } else {
        Poll::Pending
    }
}

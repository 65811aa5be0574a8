//! A consistent hash ring over the server nodes.
//!
//! The ring is a continuum of points, each owned by a node. A key hashes to a
//! position on the continuum and routes to the node owning the first point at
//! or after that position, wrapping around at the top. Each node contributes
//! 160 points (40 MD5 digests of `"host:port-i"`, four little-endian words
//! each) so that adding or removing a server only remaps the keys on its own
//! arcs, roughly 1/N of the keyspace.

use crate::config::LocatorKind;
use crate::hash::{ketama_points, HashAlgorithm};

/// An immutable snapshot mapping keys to node indices.
///
/// Snapshots are cheap to clone and are shared behind an `Arc`; a membership
/// change is a new snapshot, never a mutation.
#[derive(Clone, Debug)]
pub struct NodeLocator {
    kind: LocatorKind,
    hash: HashAlgorithm,
    addrs: Vec<String>,
    continuum: Vec<(u32, usize)>,
}

impl NodeLocator {
    /// Builds a snapshot over `addrs`. Node indices follow the order given.
    pub fn new(kind: LocatorKind, hash: HashAlgorithm, addrs: Vec<String>) -> Self {
        let continuum = match kind {
            LocatorKind::Array => Vec::new(),
            LocatorKind::Ketama => {
                let mut continuum = Vec::with_capacity(addrs.len() * 160);
                for (node_index, addr) in addrs.iter().enumerate() {
                    for point in ketama_points(addr) {
                        continuum.push((point, node_index));
                    }
                }
                continuum.sort_unstable();
                continuum
            }
        };

        NodeLocator {
            kind,
            hash,
            addrs,
            continuum,
        }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// The address of the node at `index`.
    pub fn addr(&self, index: usize) -> &str {
        &self.addrs[index]
    }

    /// The node a key routes to while every node is reachable.
    ///
    /// Depends only on the key and the node set: no per-call randomness, so
    /// every client with the same configuration routes the same way.
    pub fn primary<K: AsRef<[u8]>>(&self, key: K) -> usize {
        if self.addrs.len() == 1 {
            return 0;
        }

        match self.kind {
            LocatorKind::Array => (self.hash.hash(key.as_ref()) as usize) % self.addrs.len(),
            LocatorKind::Ketama => {
                let entry = self.continuum_index(self.hash.hash(key.as_ref()));
                self.continuum[entry].1
            }
        }
    }

    /// The primary node followed by every other distinct node, in the order
    /// they appear around the ring from the key's position. Used to find a
    /// live fallback when the primary is down.
    pub fn sequence<K: AsRef<[u8]>>(&self, key: K) -> Vec<usize> {
        let n = self.addrs.len();
        let mut seen = vec![false; n];
        let mut out = Vec::with_capacity(n);

        match self.kind {
            LocatorKind::Array => {
                let first = self.primary(key);
                for i in 0..n {
                    out.push((first + i) % n);
                }
            }
            LocatorKind::Ketama => {
                let start = self.continuum_index(self.hash.hash(key.as_ref()));
                for i in 0..self.continuum.len() {
                    let node = self.continuum[(start + i) % self.continuum.len()].1;
                    if !seen[node] {
                        seen[node] = true;
                        out.push(node);
                        if out.len() == n {
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Every node index.
    pub fn all(&self) -> impl Iterator<Item = usize> {
        0..self.addrs.len()
    }

    /// A read-only copy of this snapshot.
    pub fn readonly_copy(&self) -> NodeLocator {
        self.clone()
    }

    // Index of the first continuum point >= hash, wrapping to the first
    // point when the hash is past the last one.
    fn continuum_index(&self, hash: u32) -> usize {
        match self.continuum.binary_search_by(|&(point, _)| point.cmp(&hash)) {
            Ok(index) => index,
            Err(index) => {
                if index == self.continuum.len() {
                    0
                } else {
                    index
                }
            }
        }
    }
}

//! Channel pair registry
//!
//! Every live relay is registered here under a stable [`PairId`] so the
//! tunnel can force-close all of them on disconnect. Entries remove
//! themselves when their [`PairGuard`] is dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use super::splice::{PairCloser, SpliceReport};

pub type PairId = u64;

/// Statistics for a port forward
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (client -> server)
    pub bytes_sent: u64,
    /// Total bytes received (server -> client)
    pub bytes_received: u64,
}

struct PairEntry {
    peer: SocketAddr,
    closer: PairCloser,
    opened_at: Instant,
}

/// Summary of a live pair
#[derive(Debug, Clone, Serialize)]
pub struct PairInfo {
    pub id: PairId,
    pub peer: SocketAddr,
    pub age_secs: u64,
}

#[derive(Default)]
pub struct ChannelPairRegistry {
    next_id: AtomicU64,
    pairs: DashMap<PairId, PairEntry>,
    closed: AtomicBool,
    stats: RwLock<ForwardStats>,
}

impl ChannelPairRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new pair for `peer`.
    ///
    /// After [`close_all`](Self::close_all) the returned guard's closer is
    /// already closed, so the relay tears down immediately.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> PairGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let closer = PairCloser::new();
        self.pairs.insert(
            id,
            PairEntry {
                peer,
                closer: closer.clone(),
                opened_at: Instant::now(),
            },
        );
        {
            let mut stats = self.stats.write();
            stats.connection_count += 1;
            stats.active_connections += 1;
        }

        // Checked after insert so a concurrent close_all cannot miss this pair
        if self.closed.load(Ordering::SeqCst) {
            closer.close();
        }

        debug!("Registered pair {} for {}", id, peer);
        PairGuard {
            id,
            closer,
            registry: Arc::clone(self),
        }
    }

    /// Force-close every live pair and refuse new ones. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut count = 0;
        for entry in self.pairs.iter() {
            if !entry.closer.is_closed() {
                entry.closer.close();
                count += 1;
            }
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn active_pairs(&self) -> Vec<PairInfo> {
        let mut pairs: Vec<PairInfo> = self
            .pairs
            .iter()
            .map(|entry| PairInfo {
                id: *entry.key(),
                peer: entry.peer,
                age_secs: entry.opened_at.elapsed().as_secs(),
            })
            .collect();
        pairs.sort_by_key(|p| p.id);
        pairs
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }

    fn release(&self, id: PairId, report: Option<&SpliceReport>) {
        if self.pairs.remove(&id).is_some() {
            let mut stats = self.stats.write();
            stats.active_connections = stats.active_connections.saturating_sub(1);
            if let Some(report) = report {
                stats.bytes_sent += report.bytes_to_remote();
                stats.bytes_received += report.bytes_to_local();
            }
        }
    }
}

/// Registration of one live pair; unregisters on drop
pub struct PairGuard {
    id: PairId,
    closer: PairCloser,
    registry: Arc<ChannelPairRegistry>,
}

impl PairGuard {
    pub fn id(&self) -> PairId {
        self.id
    }

    pub fn closer(&self) -> PairCloser {
        self.closer.clone()
    }

    /// Unregister, recording the relay's byte counts
    pub fn finish(self, report: &SpliceReport) {
        self.registry.release(self.id, Some(report));
    }
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        // No-op after finish()
        self.registry.release(self.id, None);
    }
}

//! Peer-keyed cache of associations
//!
//! Handles are either checked out (owned by a service) or idle in the pool,
//! never both. Every acquire reaps idle handles that are stale or no longer
//! connected. Whether `release` keeps a handle for reuse is controlled by
//! [`PoolConfig::reuse_on_release`]; by default every released handle is
//! disconnected.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dimse::DimseEngine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::association::AssociationHandle;
use crate::models::{LocalIdentity, OperationOutcome, Peer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Idle handles kept across all peers; creation is never refused
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    #[serde(default)]
    pub reuse_on_release: bool,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub max_connection_age_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            reuse_on_release: false,
            stale_after_secs: default_stale_after_secs(),
            max_connection_age_secs: default_stale_after_secs(),
        }
    }
}

fn default_max_pool_size() -> usize {
    10
}

fn default_stale_after_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub active_connections: usize,
    pub idle_connections: usize,
    pub peers: usize,
}

struct IdleHandle {
    handle: AssociationHandle,
    last_used_at: Instant,
}

struct PoolEntry {
    peer_key: String,
    queue: VecDeque<IdleHandle>,
    last_used_at: Instant,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<String, PoolEntry>,
    creation_locks: HashMap<String, Arc<Mutex<()>>>,
    active_connections: usize,
}

impl PoolInner {
    fn idle_connections(&self) -> usize {
        self.entries.values().map(|e| e.queue.len()).sum()
    }
}

pub struct ConnectionPool {
    engine: Arc<dyn DimseEngine>,
    max_pool_size: usize,
    reuse_on_release: bool,
    stale_after: Duration,
    max_connection_age: Duration,
    inner: Mutex<PoolInner>,
}

impl ConnectionPool {
    pub fn new(engine: Arc<dyn DimseEngine>, config: PoolConfig) -> Self {
        Self {
            engine,
            max_pool_size: config.max_pool_size,
            reuse_on_release: config.reuse_on_release,
            stale_after: Duration::from_secs(config.stale_after_secs),
            max_connection_age: Duration::from_secs(config.max_connection_age_secs),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check out a connected handle for `peer`, reusing an idle one if possible.
    ///
    /// On failure no handle is returned and the connect outcome is passed on.
    pub fn acquire(
        &self,
        peer: &Peer,
        local: &LocalIdentity,
    ) -> Result<AssociationHandle, OperationOutcome> {
        let key = peer.key();

        let (reaped, reused, creation_lock) = {
            let mut inner = self.lock();
            let mut reaped = self.cleanup_locked(&mut inner);
            let reused = self.take_idle(&mut inner, &key, local, &mut reaped);
            if reused.is_some() {
                inner.active_connections += 1;
            }
            let creation_lock = inner.creation_locks.entry(key.clone()).or_default().clone();
            (reaped, reused, creation_lock)
        };
        // reaped handles disconnect on drop, outside the pool lock
        drop(reaped);

        if let Some(handle) = reused {
            debug!(peer = %key, "Reusing pooled association");
            return Ok(handle);
        }

        // one association request per peer at a time
        let _creating = creation_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut handle = AssociationHandle::new(self.engine.clone(), peer.clone(), local.clone());
        let outcome = handle.connect(None);
        if !outcome.is_success() {
            return Err(outcome);
        }

        let mut inner = self.lock();
        inner.active_connections += 1;
        debug!(
            peer = %key,
            active = inner.active_connections,
            "New association checked out"
        );
        Ok(handle)
    }

    fn take_idle(
        &self,
        inner: &mut PoolInner,
        key: &str,
        local: &LocalIdentity,
        reaped: &mut Vec<AssociationHandle>,
    ) -> Option<AssociationHandle> {
        let entry = inner.entries.get_mut(key)?;
        let mut kept = VecDeque::with_capacity(entry.queue.len());
        let mut found = None;

        while let Some(idle) = entry.queue.pop_front() {
            if !idle.handle.is_connected() || idle.handle.has_timed_out(self.max_connection_age) {
                reaped.push(idle.handle);
            } else if found.is_none() && idle.handle.local_identity() == local {
                found = Some(idle.handle);
            } else {
                kept.push_back(idle);
            }
        }
        entry.queue = kept;
        if found.is_some() {
            entry.last_used_at = Instant::now();
        }
        found
    }

    /// Return a checked-out handle.
    ///
    /// With `reuse_on_release` off, or when the handle is unusable or the
    /// pool is full, the handle is disconnected and dropped.
    pub fn release(&self, handle: AssociationHandle) {
        let key = handle.peer().key();
        let mut inner = self.lock();
        inner.active_connections = inner.active_connections.saturating_sub(1);

        let keep = self.reuse_on_release
            && handle.is_connected()
            && !handle.has_timed_out(self.max_connection_age)
            && inner.idle_connections() < self.max_pool_size;

        if keep {
            let now = Instant::now();
            let entry = inner.entries.entry(key.clone()).or_insert_with(|| PoolEntry {
                peer_key: key.clone(),
                queue: VecDeque::new(),
                last_used_at: now,
            });
            entry.last_used_at = now;
            entry.queue.push_back(IdleHandle {
                handle,
                last_used_at: now,
            });
            debug!(peer = %key, "Association returned to pool");
            return;
        }
        drop(inner);

        let mut handle = handle;
        handle.disconnect();
        debug!(peer = %key, "Association released and discarded");
    }

    fn cleanup_locked(&self, inner: &mut PoolInner) -> Vec<AssociationHandle> {
        let mut reaped = Vec::new();
        for entry in inner.entries.values_mut() {
            let queue = std::mem::take(&mut entry.queue);
            for idle in queue {
                if idle.last_used_at.elapsed() < self.stale_after && idle.handle.is_connected() {
                    entry.queue.push_back(idle);
                } else {
                    debug!(peer = %entry.peer_key, "Reaping idle association");
                    reaped.push(idle.handle);
                }
            }
        }
        let stale_after = self.stale_after;
        let PoolInner {
            entries,
            creation_locks,
            ..
        } = inner;
        entries.retain(|_, entry| {
            !entry.queue.is_empty() || entry.last_used_at.elapsed() < stale_after
        });
        // a lock held only by the map has no acquire in flight
        creation_locks.retain(|key, lock| entries.contains_key(key) || Arc::strong_count(lock) > 1);
        reaped
    }

    /// Disconnect idle handles that are stale or no longer connected.
    /// Returns how many were removed.
    pub fn cleanup_stale_connections(&self) -> usize {
        let reaped = {
            let mut inner = self.lock();
            self.cleanup_locked(&mut inner)
        };
        let count = reaped.len();
        if count > 0 {
            info!("Reaped {} idle associations", count);
        }
        count
    }

    /// Disconnect every idle handle and reset the counters
    pub fn clear(&self) {
        let entries = {
            let mut inner = self.lock();
            inner.active_connections = 0;
            inner.creation_locks.clear();
            std::mem::take(&mut inner.entries)
        };
        let idle: usize = entries.values().map(|e| e.queue.len()).sum();
        drop(entries);
        info!("Connection pool cleared ({} idle associations closed)", idle);
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            active_connections: inner.active_connections,
            idle_connections: inner.idle_connections(),
            peers: inner.entries.len(),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("reuse_on_release", &self.reuse_on_release)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationStatus;
    use crate::test_support::FakeEngine;

    fn peer(ae: &str) -> Peer {
        Peer::new(ae.to_lowercase(), ae, "127.0.0.1", 104)
    }

    fn pool_with(engine: &Arc<FakeEngine>, reuse: bool) -> ConnectionPool {
        ConnectionPool::new(
            engine.clone(),
            PoolConfig {
                reuse_on_release: reuse,
                ..PoolConfig::default()
            },
        )
    }

    #[test]
    fn test_release_always_disconnects_by_default() {
        let engine = Arc::new(FakeEngine::new());
        let pool = pool_with(&engine, false);
        let local = LocalIdentity::new("LOCAL");

        let first = pool.acquire(&peer("PEER_A"), &local).unwrap();
        assert!(first.connected_at().is_some());
        pool.release(first);
        assert_eq!(engine.released(), 1);

        let before_second = Instant::now();
        let second = pool.acquire(&peer("PEER_A"), &local).unwrap();
        assert!(second.connected_at().unwrap() >= before_second);
        assert_eq!(engine.opened(), 2);
        assert_eq!(pool.stats().active_connections, 1);
        assert_eq!(pool.stats().idle_connections, 0);
    }

    #[test]
    fn test_reuse_on_release_returns_same_association() {
        let engine = Arc::new(FakeEngine::new());
        let pool = pool_with(&engine, true);
        let local = LocalIdentity::new("LOCAL");

        let first = pool.acquire(&peer("PEER_A"), &local).unwrap();
        let connected_at = first.connected_at();
        pool.release(first);
        assert_eq!(pool.stats().idle_connections, 1);

        let again = pool.acquire(&peer("PEER_A"), &local).unwrap();
        assert_eq!(again.connected_at(), connected_at);
        assert_eq!(engine.opened(), 1);
        assert_eq!(pool.stats().idle_connections, 0);
    }

    #[test]
    fn test_reuse_respects_local_identity() {
        let engine = Arc::new(FakeEngine::new());
        let pool = pool_with(&engine, true);

        let first = pool.acquire(&peer("PEER_A"), &LocalIdentity::new("ONE")).unwrap();
        pool.release(first);
        let other = pool.acquire(&peer("PEER_A"), &LocalIdentity::new("TWO")).unwrap();
        assert_eq!(other.local_identity().ae_title, "TWO");
        assert_eq!(engine.opened(), 2);
        assert_eq!(pool.stats().idle_connections, 1);
    }

    #[test]
    fn test_idle_cap_disconnects_overflow() {
        let engine = Arc::new(FakeEngine::new());
        let pool = ConnectionPool::new(
            engine.clone(),
            PoolConfig {
                max_pool_size: 1,
                reuse_on_release: true,
                ..PoolConfig::default()
            },
        );
        let local = LocalIdentity::new("LOCAL");

        let a = pool.acquire(&peer("PEER_A"), &local).unwrap();
        let b = pool.acquire(&peer("PEER_B"), &local).unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().idle_connections, 1);
        assert_eq!(engine.released(), 1);
    }

    #[test]
    fn test_cleanup_reaps_stale_and_disconnected_entries() {
        let engine = Arc::new(FakeEngine::new());
        let mut pool = pool_with(&engine, true);
        pool.stale_after = Duration::from_millis(50);
        let local = LocalIdentity::new("LOCAL");

        let a = pool.acquire(&peer("PEER_A"), &local).unwrap();
        let b = pool.acquire(&peer("PEER_B"), &local).unwrap();
        pool.release(a);
        std::thread::sleep(Duration::from_millis(80));
        pool.release(b);
        pool.lock()
            .entries
            .get_mut(&peer("PEER_B").key())
            .unwrap()
            .queue[0]
            .handle
            .abort();

        assert_eq!(pool.stats().idle_connections, 2);
        assert_eq!(pool.cleanup_stale_connections(), 2);
        assert_eq!(pool.stats().idle_connections, 0);
    }

    #[test]
    fn test_cleanup_prunes_unused_creation_locks() {
        let engine = Arc::new(FakeEngine::new());
        let pool = pool_with(&engine, false);
        let local = LocalIdentity::new("LOCAL");

        for ae in ["PEER_A", "PEER_B", "PEER_C"] {
            let handle = pool.acquire(&peer(ae), &local).unwrap();
            pool.release(handle);
        }
        // each acquire prunes the locks of earlier peers
        assert_eq!(pool.lock().creation_locks.len(), 1);

        pool.cleanup_stale_connections();
        assert!(pool.lock().creation_locks.is_empty());

        // a later acquire recreates its lock and still connects
        let again = pool.acquire(&peer("PEER_A"), &local).unwrap();
        assert!(again.is_connected());
        assert_eq!(pool.lock().creation_locks.len(), 1);
    }

    #[test]
    fn test_failed_connect_propagates_status() {
        let engine = Arc::new(FakeEngine::new().refusing());
        let pool = pool_with(&engine, false);
        let err = pool
            .acquire(&peer("PEER_A"), &LocalIdentity::new("LOCAL"))
            .unwrap_err();
        assert_eq!(err.status, OperationStatus::ConnectionFailed);
        assert!(!err.last_error.is_empty());
        assert_eq!(pool.stats().active_connections, 0);
    }

    #[test]
    fn test_clear_disconnects_everything() {
        let engine = Arc::new(FakeEngine::new());
        let pool = pool_with(&engine, true);
        let local = LocalIdentity::new("LOCAL");

        let a = pool.acquire(&peer("PEER_A"), &local).unwrap();
        let b = pool.acquire(&peer("PEER_B"), &local).unwrap();
        pool.release(a);
        pool.release(b);
        pool.clear();

        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.peers, 0);
        assert_eq!(engine.released(), 2);
    }
}

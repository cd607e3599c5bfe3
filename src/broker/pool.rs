//! Mutex-guarded connection pool.
//!
//! One slot list per [`PoolKey`], bounded by `max_connections`. Slot lists are
//! only mutated while holding that key's lock from the [`MutexManager`]; the
//! `DashMap` shard guard is never held across an `.await`.
//!
//! A checked-out connection lives in the caller's [`PooledHandle`] and its slot
//! stays `in_use` until the handle is released. A connection taken out of its
//! slot is wrapped in a handle before any `.await`, so a cancelled caller
//! discards the slot through the handle's `Drop` instead of leaking it. Exhaustion fails fast with
//! [`BrokerError::PoolExhausted`]; there is no waiting queue and no retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::PoolConfig;
use super::error::{BrokerError, Result};
use super::mutex::MutexManager;
use super::types::{ConnectionTarget, PoolKey};

/// Opens, checks and closes one kind of connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self, target: &ConnectionTarget) -> Result<Self::Connection>;

    /// Cheap liveness check run before reuse and on release.
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;

    async fn close(&self, conn: Self::Connection);
}

struct Slot<T> {
    id: Uuid,
    in_use: bool,
    /// `None` while checked out
    conn: Option<T>,
    created_at: Instant,
    last_used_at: Instant,
}

/// Per-key pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PoolStats {
    pub key: PoolKey,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub total: usize,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub in_use: usize,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub idle: usize,
}

/// Slot list of one key. The inner mutex keeps the map `Sync` for
/// connection types that are only `Send`; it is never held across an `.await`.
type SlotList<T> = Mutex<Vec<Slot<T>>>;

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    slots: DashMap<PoolKey, SlotList<C::Connection>>,
    locks: MutexManager<PoolKey>,
}

impl<C: Connector> PoolInner<C> {
    fn with_slots<R>(
        &self,
        key: &PoolKey,
        f: impl FnOnce(&mut Vec<Slot<C::Connection>>) -> R,
    ) -> Option<R> {
        let entry = self.slots.get(key)?;
        let mut slots = entry.lock();
        Some(f(&mut slots))
    }

    /// Takes the first free connection out of its slot, marking the slot in use.
    fn take_free(&self, key: &PoolKey) -> Option<(Uuid, C::Connection, Instant)> {
        self.with_slots(key, |slots| {
            let slot = slots.iter_mut().find(|s| !s.in_use && s.conn.is_some())?;
            let conn = slot.conn.take()?;
            slot.in_use = true;
            Some((slot.id, conn, slot.created_at))
        })
        .flatten()
    }

    fn stamp_in_use(&self, key: &PoolKey, id: Uuid, now: Instant) {
        self.with_slots(key, |slots| {
            if let Some(slot) = slots.iter_mut().find(|s| s.id == id) {
                slot.in_use = true;
                slot.last_used_at = now;
            }
        });
    }

    fn slot_count(&self, key: &PoolKey) -> usize {
        self.with_slots(key, |slots| slots.len()).unwrap_or(0)
    }

    fn register(&self, key: &PoolKey, slot: Slot<C::Connection>) {
        self.slots.entry(key.clone()).or_default().lock().push(slot);
    }

    /// Puts a connection back into its free slot, stamping it when `used`.
    /// Hands the connection back when the slot is gone.
    fn return_to_slot(
        &self,
        key: &PoolKey,
        id: Uuid,
        conn: C::Connection,
        used: bool,
    ) -> Option<C::Connection> {
        let mut conn = Some(conn);
        self.with_slots(key, |slots| {
            if let Some(slot) = slots.iter_mut().find(|s| s.id == id) {
                slot.in_use = false;
                if used {
                    slot.last_used_at = Instant::now();
                }
                slot.conn = conn.take();
            }
        });
        conn
    }

    fn remove_slot(&self, key: &PoolKey, id: Uuid) {
        self.with_slots(key, |slots| slots.retain(|s| s.id != id));
        self.prune(key);
    }

    fn prune(&self, key: &PoolKey) {
        self.slots.remove_if(key, |_, slots| slots.lock().is_empty());
    }

    async fn discard(&self, key: &PoolKey, id: Uuid, conn: C::Connection) {
        let _guard = self.locks.lock(key).await;
        self.remove_slot(key, id);
        self.connector.close(conn).await;
    }
}

/// Exclusive use of one pooled connection until it is released.
///
/// Dropping a handle without releasing it discards the connection in the
/// background.
pub struct PooledHandle<C: Connector> {
    id: Uuid,
    key: PoolKey,
    conn: Option<C::Connection>,
    created_at: Instant,
    last_used_at: Instant,
    invalidated: bool,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connector> std::fmt::Debug for PooledHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("invalidated", &self.invalidated)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PooledHandle<C> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// The live connection. `None` only after the handle has been released.
    pub fn connection(&mut self) -> Option<&mut C::Connection> {
        self.conn.as_mut()
    }

    /// Marks the connection unusable (e.g. after a command timeout) so release closes it.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }
}

impl<C: Connector> Drop for PooledHandle<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        warn!("Pooled handle {} for {} dropped without release", self.id, self.key);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let pool = Arc::clone(&self.pool);
            let key = self.key.clone();
            let id = self.id;
            runtime.spawn(async move { pool.discard(&key, id, conn).await });
        }
    }
}

/// Connection pool over any [`Connector`].
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                slots: DashMap::new(),
                locks: MutexManager::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Check out a live connection for `target`.
    ///
    /// Reuses the first valid free slot, otherwise opens a new connection when
    /// below `max_connections`, otherwise fails with `PoolExhausted`.
    pub async fn get_connection(&self, target: &ConnectionTarget) -> Result<PooledHandle<C>> {
        let inner = &self.inner;
        let key = target.pool_key();
        let _guard = inner.locks.acquire(&key, inner.config.lock_timeout).await?;

        while let Some((id, conn, created_at)) = inner.take_free(&key) {
            let mut handle = self.handle(id, key.clone(), conn, created_at, created_at);
            if self.check(&mut handle).await {
                let now = Instant::now();
                inner.stamp_in_use(&key, id, now);
                handle.last_used_at = now;
                debug!("Reusing pooled connection {} for {}", id, key);
                return Ok(handle);
            }
            debug!("Discarding invalid pooled connection {} for {}", id, key);
            inner.remove_slot(&key, id);
            if let Some(conn) = handle.conn.take() {
                inner.connector.close(conn).await;
            }
        }

        let max = inner.config.max_connections;
        if inner.slot_count(&key) >= max {
            warn!("Connection pool exhausted for {} ({} in use)", key, max);
            return Err(BrokerError::PoolExhausted { key, max });
        }

        let connect_timeout = inner.config.connect_timeout;
        let conn = match tokio::time::timeout(connect_timeout, inner.connector.connect(target)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                error!("Failed to connect to {}: {}", key, e);
                return Err(e);
            }
            Err(_) => {
                error!("Connection to {} timed out after {:?}", key, connect_timeout);
                return Err(BrokerError::Connection(format!(
                    "connection to {} timed out after {:?}",
                    key, connect_timeout
                )));
            }
        };

        let id = Uuid::new_v4();
        let now = Instant::now();
        inner.register(
            &key,
            Slot {
                id,
                in_use: true,
                conn: None,
                created_at: now,
                last_used_at: now,
            },
        );
        info!("Opened pooled connection {} for {}", id, key);
        Ok(self.handle(id, key, conn, now, now))
    }

    async fn check(&self, handle: &mut PooledHandle<C>) -> bool {
        match handle.conn.as_mut() {
            Some(conn) => self.inner.connector.is_valid(conn).await,
            None => false,
        }
    }

    fn handle(
        &self,
        id: Uuid,
        key: PoolKey,
        conn: C::Connection,
        created_at: Instant,
        last_used_at: Instant,
    ) -> PooledHandle<C> {
        PooledHandle {
            id,
            key,
            conn: Some(conn),
            created_at,
            last_used_at,
            invalidated: false,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a handle to the pool.
    ///
    /// Valid connections go back to their slot. Invalid or invalidated ones are
    /// closed and their slot removed. If the slot is gone (after shutdown) the
    /// connection is closed.
    pub async fn release_connection(&self, mut handle: PooledHandle<C>) {
        let inner = &self.inner;
        if handle.conn.is_none() {
            return;
        }
        let key = handle.key.clone();
        let id = handle.id;

        let _guard = inner.locks.lock(&key).await;
        let keep = !handle.invalidated && self.check(&mut handle).await;
        let Some(conn) = handle.conn.take() else {
            return;
        };
        let leftover = if keep {
            inner.return_to_slot(&key, id, conn, true)
        } else {
            debug!("Closing invalidated connection {} for {}", id, key);
            inner.remove_slot(&key, id);
            Some(conn)
        };
        if let Some(conn) = leftover {
            inner.connector.close(conn).await;
        }
    }

    /// Remove free connections idle past the idle timeout or failing validity.
    ///
    /// In-use slots are never touched. Keys whose lock cannot be taken within
    /// the lock timeout are skipped this round. Returns the number removed.
    pub async fn sweep(&self) -> usize {
        let inner = &self.inner;
        let keys: Vec<PoolKey> = inner.slots.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;

        for key in keys {
            let _guard = match inner.locks.acquire(&key, inner.config.lock_timeout).await {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("Skipping sweep of busy pool {}", key);
                    continue;
                }
            };

            let now = Instant::now();
            let mut expired = Vec::new();
            let mut candidates = Vec::new();
            inner.with_slots(&key, |slots| {
                slots.retain_mut(|slot| {
                    if slot.in_use {
                        return true;
                    }
                    let Some(conn) = slot.conn.take() else {
                        return false;
                    };
                    if now.duration_since(slot.last_used_at) > inner.config.idle_timeout {
                        expired.push((slot.id, conn));
                        false
                    } else {
                        slot.in_use = true;
                        candidates.push((slot.id, conn, slot.created_at, slot.last_used_at));
                        true
                    }
                });
            });

            for (id, conn, created_at, last_used_at) in candidates {
                let mut handle = self.handle(id, key.clone(), conn, created_at, last_used_at);
                let valid = self.check(&mut handle).await;
                let Some(conn) = handle.conn.take() else {
                    continue;
                };
                if valid {
                    if let Some(conn) = inner.return_to_slot(&key, id, conn, false) {
                        inner.connector.close(conn).await;
                    }
                } else {
                    inner.remove_slot(&key, id);
                    expired.push((id, conn));
                }
            }
            inner.prune(&key);

            for (id, conn) in expired {
                debug!("Sweeping idle connection {} for {}", id, key);
                inner.connector.close(conn).await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Idle sweep closed {} pooled connection(s)", removed);
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Pool sweeper stopped");
                        break;
                    }

                    _ = ticker.tick() => {
                        pool.sweep().await;
                    }
                }
            }
        })
    }

    /// Close every free connection and forget all slots.
    ///
    /// Handles still checked out are closed when they are released.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let keys: Vec<PoolKey> = inner.slots.iter().map(|e| e.key().clone()).collect();
        let mut to_close = Vec::new();

        for key in keys {
            let _guard = inner.locks.lock(&key).await;
            if let Some((_, slots)) = inner.slots.remove(&key) {
                to_close.extend(slots.into_inner().into_iter().filter_map(|slot| slot.conn));
            }
        }

        let count = to_close.len();
        join_all(to_close.into_iter().map(|conn| inner.connector.close(conn))).await;
        info!("Connection pool shut down, closed {} idle connection(s)", count);
    }

    /// Snapshot of every pool key, sorted by key.
    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self
            .inner
            .slots
            .iter()
            .map(|entry| {
                let slots = entry.value().lock();
                let in_use = slots.iter().filter(|s| s.in_use).count();
                PoolStats {
                    key: entry.key().clone(),
                    total: slots.len(),
                    in_use,
                    idle: slots.len() - in_use,
                }
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::types::{ProfileExtra, ResourceType};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use zeroize::Zeroizing;

    /// In-memory connection whose health can be flipped by the test.
    #[derive(Debug)]
    pub(crate) struct MockConn {
        pub serial: usize,
        pub healthy: Arc<AtomicBool>,
    }

    #[derive(Default)]
    pub(crate) struct MockConnector {
        pub connects: AtomicUsize,
        pub closes: AtomicUsize,
        pub fail: AtomicBool,
        pub hang: AtomicBool,
        pub slow_check: AtomicBool,
        pub healthy: Arc<AtomicBool>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self {
                healthy: Arc::new(AtomicBool::new(true)),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Connection = MockConn;

        async fn connect(&self, _target: &ConnectionTarget) -> Result<MockConn> {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(BrokerError::Connection("Connection refused".into()));
            }
            let serial = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(MockConn {
                serial,
                healthy: self.healthy.clone(),
            })
        }

        async fn is_valid(&self, conn: &mut MockConn) -> bool {
            if self.slow_check.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            conn.healthy.load(Ordering::SeqCst)
        }

        async fn close(&self, _conn: MockConn) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn target(host: &str) -> ConnectionTarget {
        ConnectionTarget {
            resource_type: ResourceType::Shell,
            host: host.to_string(),
            port: 22,
            username: "ops".to_string(),
            secret: Zeroizing::new("pw".to_string()),
            extra: ProfileExtra::default(),
        }
    }

    fn pool(max_connections: usize) -> ConnectionPool<MockConnector> {
        ConnectionPool::new(
            MockConnector::new(),
            PoolConfig {
                max_connections,
                idle_timeout: Duration::from_secs(300),
                lock_timeout: Duration::from_secs(1),
                connect_timeout: Duration::from_secs(5),
            },
        )
    }

    fn connects(pool: &ConnectionPool<MockConnector>) -> usize {
        pool.connector().connects.load(Ordering::SeqCst)
    }

    fn closes(pool: &ConnectionPool<MockConnector>) -> usize {
        pool.connector().closes.load(Ordering::SeqCst)
    }

    mod capacity {
        use super::*;

        #[tokio::test]
        async fn test_exhaustion_after_max_connections() {
            let pool = pool(2);
            let t = target("web1");
            let _a = pool.get_connection(&t).await.unwrap();
            let _b = pool.get_connection(&t).await.unwrap();

            let err = pool.get_connection(&t).await.unwrap_err();
            assert!(matches!(err, BrokerError::PoolExhausted { max: 2, .. }));
            assert_eq!(connects(&pool), 2);
            assert_eq!(pool.stats()[0].total, 2);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_concurrent_requests_never_exceed_limit() {
            let pool = pool(3);
            let t = target("web1");
            let results = join_all((0..5).map(|_| pool.get_connection(&t))).await;

            let ok = results.iter().filter(|r| r.is_ok()).count();
            let exhausted = results
                .iter()
                .filter(|r| matches!(r, Err(BrokerError::PoolExhausted { .. })))
                .count();
            assert_eq!(ok, 3);
            assert_eq!(exhausted, 2);
            assert_eq!(connects(&pool), 3);
        }

        #[tokio::test]
        async fn test_keys_have_independent_limits() {
            let pool = pool(1);
            let _a = pool.get_connection(&target("web1")).await.unwrap();
            assert!(pool.get_connection(&target("web2")).await.is_ok());
        }
    }

    mod reuse {
        use super::*;

        #[tokio::test]
        async fn test_release_then_get_reuses_handle() {
            let pool = pool(2);
            let t = target("web1");

            let first = pool.get_connection(&t).await.unwrap();
            let first_id = first.id();
            pool.release_connection(first).await;

            let mut second = pool.get_connection(&t).await.unwrap();
            assert_eq!(second.id(), first_id);
            assert_eq!(second.connection().unwrap().serial, 1);
            assert_eq!(connects(&pool), 1);
        }

        #[tokio::test]
        async fn test_key_locks_are_not_retained() {
            let pool = pool(1);
            for i in 0..10 {
                let handle = pool.get_connection(&target(&format!("web{i}"))).await.unwrap();
                pool.release_connection(handle).await;
            }
            assert_eq!(pool.stats().len(), 10);
            assert_eq!(pool.inner.locks.tracked_keys(), 0);
        }

        #[tokio::test]
        async fn test_invalid_free_slot_is_replaced() {
            let pool = pool(1);
            let t = target("web1");

            let first = pool.get_connection(&t).await.unwrap();
            let first_id = first.id();
            pool.release_connection(first).await;
            pool.connector().healthy.store(false, Ordering::SeqCst);

            let second = pool.get_connection(&t).await.unwrap();
            assert_ne!(second.id(), first_id);
            assert_eq!(closes(&pool), 1);
            assert_eq!(connects(&pool), 2);
            assert_eq!(pool.stats()[0].total, 1);
        }

        #[tokio::test]
        async fn test_invalidated_handle_is_closed_on_release() {
            let pool = pool(1);
            let t = target("web1");

            let mut handle = pool.get_connection(&t).await.unwrap();
            handle.invalidate();
            pool.release_connection(handle).await;

            assert_eq!(closes(&pool), 1);
            assert!(pool.stats().is_empty());
            assert!(pool.get_connection(&t).await.is_ok());
        }

        #[tokio::test]
        async fn test_unhealthy_connection_is_closed_on_release() {
            let pool = pool(1);
            let t = target("web1");

            let handle = pool.get_connection(&t).await.unwrap();
            pool.connector().healthy.store(false, Ordering::SeqCst);
            pool.release_connection(handle).await;

            assert_eq!(closes(&pool), 1);
            assert!(pool.stats().is_empty());
        }
    }

    mod failures {
        use super::*;

        #[tokio::test]
        async fn test_failed_connect_leaves_no_slot() {
            let pool = pool(1);
            pool.connector().fail.store(true, Ordering::SeqCst);

            let err = pool.get_connection(&target("web1")).await.unwrap_err();
            assert!(matches!(err, BrokerError::Connection(_)));
            assert!(pool.stats().is_empty());

            pool.connector().fail.store(false, Ordering::SeqCst);
            assert!(pool.get_connection(&target("web1")).await.is_ok());
        }

        #[tokio::test(start_paused = true)]
        async fn test_connect_timeout() {
            let pool = pool(1);
            pool.connector().hang.store(true, Ordering::SeqCst);

            let err = pool.get_connection(&target("web1")).await.unwrap_err();
            assert!(err.to_string().contains("timed out"));
            assert!(err.is_retryable());
            assert!(pool.stats().is_empty());
        }

        #[tokio::test]
        async fn test_dropped_handle_is_discarded() {
            let pool = pool(1);
            let t = target("web1");

            let handle = pool.get_connection(&t).await.unwrap();
            drop(handle);
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }

            assert_eq!(closes(&pool), 1);
            assert!(pool.stats().is_empty());
        }
    }

    mod cancellation {
        use super::*;

        async fn settle() {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_cancelled_reuse_check_frees_the_slot() {
            let pool = pool(1);
            let t = target("web1");

            let handle = pool.get_connection(&t).await.unwrap();
            pool.release_connection(handle).await;
            pool.connector().slow_check.store(true, Ordering::SeqCst);

            let cancelled =
                tokio::time::timeout(Duration::from_millis(100), pool.get_connection(&t)).await;
            assert!(cancelled.is_err());
            settle().await;

            assert!(pool.stats().is_empty());
            assert_eq!(closes(&pool), 1);

            pool.connector().slow_check.store(false, Ordering::SeqCst);
            let mut next = pool.get_connection(&t).await.unwrap();
            assert_eq!(next.connection().unwrap().serial, 2);
        }

        #[tokio::test(start_paused = true)]
        async fn test_cancelled_release_discards_the_connection() {
            let pool = pool(1);
            let t = target("web1");

            let handle = pool.get_connection(&t).await.unwrap();
            pool.connector().slow_check.store(true, Ordering::SeqCst);

            let cancelled =
                tokio::time::timeout(Duration::from_millis(100), pool.release_connection(handle))
                    .await;
            assert!(cancelled.is_err());
            settle().await;

            assert!(pool.stats().is_empty());
            assert_eq!(closes(&pool), 1);
            assert!(pool.get_connection(&t).await.is_ok());
        }
    }

    mod sweep {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_sweep_removes_idle_and_keeps_in_use() {
            let pool = pool(2);
            let t = target("web1");

            let idle = pool.get_connection(&t).await.unwrap();
            let busy = pool.get_connection(&t).await.unwrap();
            pool.release_connection(idle).await;

            tokio::time::advance(Duration::from_secs(301)).await;
            assert_eq!(pool.sweep().await, 1);

            let stats = pool.stats();
            assert_eq!(stats.len(), 1);
            assert_eq!(stats[0].total, 1);
            assert_eq!(stats[0].in_use, 1);
            assert_eq!(closes(&pool), 1);

            pool.release_connection(busy).await;
            assert_eq!(pool.stats()[0].idle, 1);
        }

        #[tokio::test(start_paused = true)]
        async fn test_sweep_keeps_recently_used() {
            let pool = pool(1);
            let t = target("web1");

            let handle = pool.get_connection(&t).await.unwrap();
            pool.release_connection(handle).await;
            tokio::time::advance(Duration::from_secs(10)).await;

            assert_eq!(pool.sweep().await, 0);
            assert_eq!(pool.stats()[0].idle, 1);
        }

        #[tokio::test]
        async fn test_sweep_removes_invalid_free_slots() {
            let pool = pool(1);
            let t = target("web1");

            let handle = pool.get_connection(&t).await.unwrap();
            pool.release_connection(handle).await;
            pool.connector().healthy.store(false, Ordering::SeqCst);

            assert_eq!(pool.sweep().await, 1);
            assert!(pool.stats().is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn test_sweeper_stops_on_cancel() {
            let pool = pool(1);
            let cancel = CancellationToken::new();
            let task = pool.spawn_sweeper(Duration::from_secs(60), cancel.clone());
            cancel.cancel();
            task.await.unwrap();
        }
    }

    mod shutdown {
        use super::*;

        #[tokio::test]
        async fn test_shutdown_closes_free_and_late_releases() {
            let pool = pool(2);
            let t = target("web1");

            let busy = pool.get_connection(&t).await.unwrap();
            let free = pool.get_connection(&t).await.unwrap();
            pool.release_connection(free).await;

            pool.shutdown().await;
            assert_eq!(closes(&pool), 1);
            assert!(pool.stats().is_empty());

            pool.release_connection(busy).await;
            assert_eq!(closes(&pool), 2);
            assert!(pool.stats().is_empty());
        }
    }
}

//! Per-key asynchronous mutexes with FIFO hand-off.
//!
//! Each key owns a small state machine `{locked, waiters}`. Releasing a held
//! key hands it straight to the oldest live waiter through a oneshot channel,
//! so the waiter resumes on its own task when the scheduler polls it. Waiters
//! that gave up (timed out or were dropped) are skipped.
//!
//! A key's entry is removed from the registry once it is unlocked with no
//! waiters and nobody else holds a reference to it, so the registry only
//! tracks keys that are in use.

use std::collections::VecDeque;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::error::{BrokerError, Result};

#[derive(Default)]
struct LockState {
    locked: bool,
    waiters: VecDeque<(u64, oneshot::Sender<()>)>,
    next_id: u64,
}

#[derive(Default)]
struct KeyLock {
    state: Mutex<LockState>,
}

enum Enqueued {
    Acquired,
    Waiting(u64, oneshot::Receiver<()>),
}

impl KeyLock {
    fn try_enqueue(&self) -> Enqueued {
        let mut state = self.state.lock();
        if !state.locked {
            state.locked = true;
            return Enqueued::Acquired;
        }
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back((id, tx));
        Enqueued::Waiting(id, rx)
    }

    /// Passes ownership to the next live waiter, or frees the key.
    fn release(&self) {
        let mut state = self.state.lock();
        while let Some((_, tx)) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        state.locked = false;
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        !state.locked && state.waiters.is_empty()
    }

    /// Removes waiter `id`. Returns false when it was already granted.
    fn withdraw(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        match state.waiters.iter().position(|(waiter, _)| *waiter == id) {
            Some(pos) => {
                state.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

type LockMap<K> = DashMap<K, Arc<KeyLock>>;

/// Drops the entry for `key` when only the map references it and it is idle.
fn prune<K: Eq + Hash>(locks: &LockMap<K>, key: &K) {
    locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1 && lock.is_idle());
}

/// Exclusive ownership of one key. Released on drop.
pub struct KeyGuard {
    lock: Option<Arc<KeyLock>>,
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl KeyGuard {
    /// Releases the key. Calling it again is a no-op.
    pub fn release(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
            drop(lock);
            if let Some(on_release) = self.on_release.take() {
                on_release();
            }
        }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard")
            .field("held", &self.lock.is_some())
            .finish()
    }
}

/// Registry of per-key locks. Independent keys never contend.
pub struct MutexManager<K> {
    locks: Arc<LockMap<K>>,
}

impl<K> Default for MutexManager<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> MutexManager<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    fn guard(&self, key: &K, lock: Arc<KeyLock>) -> KeyGuard {
        let locks = Arc::clone(&self.locks);
        let key = key.clone();
        KeyGuard {
            lock: Some(lock),
            on_release: Some(Box::new(move || prune(&locks, &key))),
        }
    }

    fn entry(&self, key: &K) -> Arc<KeyLock> {
        if let Some(lock) = self.locks.get(key) {
            return Arc::clone(lock.value());
        }
        Arc::clone(self.locks.entry(key.clone()).or_default().value())
    }

    /// Acquire `key`, waiting in FIFO order for at most `timeout`.
    pub async fn acquire(&self, key: &K, timeout: Duration) -> Result<KeyGuard> {
        let lock = self.entry(key);
        let (id, mut rx) = match lock.try_enqueue() {
            Enqueued::Acquired => return Ok(self.guard(key, lock)),
            Enqueued::Waiting(id, rx) => (id, rx),
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(())) => Ok(self.guard(key, lock)),
            // Senders are only dropped after a grant or a withdraw.
            Ok(Err(_)) => Err(BrokerError::LockTimeout(timeout)),
            Err(_) => {
                if !lock.withdraw(id) && rx.try_recv().is_ok() {
                    // Granted between the deadline and the withdraw.
                    debug!("Passing on lock for {} granted after timeout", key);
                    lock.release();
                }
                drop(lock);
                prune(&self.locks, key);
                warn!("Timed out after {:?} waiting for lock on {}", timeout, key);
                Err(BrokerError::LockTimeout(timeout))
            }
        }
    }

    /// Acquire `key` without a deadline.
    pub async fn lock(&self, key: &K) -> KeyGuard {
        let lock = self.entry(key);
        loop {
            let rx = match lock.try_enqueue() {
                Enqueued::Acquired => return self.guard(key, lock),
                Enqueued::Waiting(_, rx) => rx,
            };
            if rx.await.is_ok() {
                return self.guard(key, lock);
            }
        }
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.locks
            .get(key)
            .is_some_and(|lock| lock.state.lock().locked)
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.locks.len()
    }

    /// Number of live waiters queued on `key`.
    pub fn waiting(&self, key: &K) -> usize {
        self.locks.get(key).map_or(0, |lock| {
            lock.state
                .lock()
                .waiters
                .iter()
                .filter(|(_, tx)| !tx.is_closed())
                .count()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> Arc<MutexManager<String>> {
        Arc::new(MutexManager::new())
    }

    async fn wait_for_waiters(manager: &MutexManager<String>, key: &String, count: usize) {
        while manager.waiting(key) < count {
            tokio::task::yield_now().await;
        }
    }

    mod acquire {
        use super::*;

        #[tokio::test]
        async fn test_free_key_is_acquired_immediately() {
            let manager = manager();
            let key = "a".to_string();
            let guard = manager.acquire(&key, Duration::from_millis(1)).await.unwrap();
            assert!(manager.is_locked(&key));
            drop(guard);
            assert!(!manager.is_locked(&key));
        }

        #[tokio::test]
        async fn test_release_is_idempotent() {
            let manager = manager();
            let key = "a".to_string();
            let mut guard = manager.lock(&key).await;
            guard.release();
            guard.release();
            assert!(!manager.is_locked(&key));
            drop(guard);
            assert!(!manager.is_locked(&key));
        }

        #[tokio::test]
        async fn test_independent_keys_do_not_contend() {
            let manager = manager();
            let _a = manager.lock(&"a".to_string()).await;
            let b = manager
                .acquire(&"b".to_string(), Duration::from_millis(1))
                .await;
            assert!(b.is_ok());
        }
    }

    mod exclusion {
        use super::*;

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_holders_never_overlap() {
            let manager = manager();
            let active = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let manager = manager.clone();
                    let active = active.clone();
                    let peak = peak.clone();
                    tokio::spawn(async move {
                        let key = "shared".to_string();
                        let _guard = manager.acquire(&key, Duration::from_secs(10)).await.unwrap();
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                })
                .collect();

            for task in tasks {
                task.await.unwrap();
            }
            assert_eq!(peak.load(Ordering::SeqCst), 1);
            assert!(!manager.is_locked(&"shared".to_string()));
        }

        #[tokio::test]
        async fn test_waiters_resume_in_fifo_order() {
            let manager = manager();
            let key = "k".to_string();
            let order = Arc::new(Mutex::new(Vec::new()));

            let holder = manager.lock(&key).await;
            let mut tasks = Vec::new();
            for i in 0..3 {
                tasks.push(tokio::spawn({
                    let manager = manager.clone();
                    let order = order.clone();
                    let key = key.clone();
                    async move {
                        let _guard = manager.lock(&key).await;
                        order.lock().push(i);
                    }
                }));
                wait_for_waiters(&manager, &key, i + 1).await;
            }

            drop(holder);
            for task in tasks {
                task.await.unwrap();
            }
            assert_eq!(*order.lock(), vec![0, 1, 2]);
        }

        #[tokio::test]
        async fn test_second_holder_starts_after_release() {
            let manager = manager();
            let key = "k".to_string();
            let mut first = manager.lock(&key).await;

            let waiter = {
                let manager = manager.clone();
                let key = key.clone();
                tokio::spawn(async move { manager.lock(&key).await })
            };
            wait_for_waiters(&manager, &key, 1).await;
            assert!(!waiter.is_finished());

            first.release();
            let second = waiter.await.unwrap();
            assert!(manager.is_locked(&key));
            drop(second);
            assert!(!manager.is_locked(&key));
        }
    }

    mod timeouts {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_timed_out_waiter_does_not_block_later_ones() {
            let manager = manager();
            let key = "k".to_string();
            let holder = manager.lock(&key).await;

            let err = manager
                .acquire(&key, Duration::from_millis(50))
                .await
                .unwrap_err();
            assert!(matches!(err, BrokerError::LockTimeout(_)));
            assert_eq!(manager.waiting(&key), 0);

            let later = {
                let manager = manager.clone();
                let key = key.clone();
                tokio::spawn(async move { manager.acquire(&key, Duration::from_secs(5)).await })
            };
            wait_for_waiters(&manager, &key, 1).await;
            drop(holder);

            assert!(later.await.unwrap().is_ok());
        }

        #[tokio::test]
        async fn test_dropped_waiter_is_skipped() {
            let manager = manager();
            let key = "k".to_string();
            let holder = manager.lock(&key).await;

            let abandoned = {
                let manager = manager.clone();
                let key = key.clone();
                tokio::spawn(async move { manager.lock(&key).await })
            };
            wait_for_waiters(&manager, &key, 1).await;
            abandoned.abort();
            let _ = abandoned.await;

            drop(holder);
            assert!(!manager.is_locked(&key));
            assert!(manager.acquire(&key, Duration::from_millis(1)).await.is_ok());
        }
    }

    mod registry {
        use super::*;

        #[tokio::test]
        async fn test_released_keys_are_forgotten() {
            let manager = manager();
            for i in 0..50 {
                let _guard = manager.lock(&format!("key-{i}")).await;
            }
            assert_eq!(manager.tracked_keys(), 0);
        }

        #[tokio::test]
        async fn test_handed_off_key_stays_tracked() {
            let manager = manager();
            let key = "k".to_string();
            let holder = manager.lock(&key).await;

            let waiter = {
                let manager = manager.clone();
                let key = key.clone();
                tokio::spawn(async move { manager.lock(&key).await })
            };
            wait_for_waiters(&manager, &key, 1).await;

            drop(holder);
            let second = waiter.await.unwrap();
            assert_eq!(manager.tracked_keys(), 1);
            assert!(manager.is_locked(&key));

            drop(second);
            assert_eq!(manager.tracked_keys(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn test_timed_out_key_is_forgotten_after_release() {
            let manager = manager();
            let key = "k".to_string();
            let holder = manager.lock(&key).await;

            assert!(manager.acquire(&key, Duration::from_millis(50)).await.is_err());
            assert_eq!(manager.tracked_keys(), 1);

            drop(holder);
            assert_eq!(manager.tracked_keys(), 0);
        }
    }
}

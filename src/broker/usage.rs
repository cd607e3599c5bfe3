//! Fixed-capacity usage log with windowed statistics.
//!
//! Records live in a ring buffer: once full, the oldest slot is overwritten at
//! the round-robin index. `cleanup` raises an advisory flag while it compacts;
//! writes that arrive meanwhile are dropped and counted.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub operation_type: String,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OperationStats {
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub total: u64,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub successful: u64,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub failed: u64,
}

impl OperationStats {
    fn add(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Aggregate over the records inside a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UsageStats {
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub window_secs: u64,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub total: u64,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub successful: u64,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub failed: u64,
    pub by_type: BTreeMap<String, OperationStats>,
    /// Writes lost while a cleanup was running, since start
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub dropped_writes: u64,
}

struct Ring {
    records: Vec<UsageRecord>,
    next: usize,
    capacity: usize,
}

impl Ring {
    fn push(&mut self, record: UsageRecord) {
        if self.records.len() < self.capacity {
            self.records.push(record);
        } else {
            self.records[self.next] = record;
        }
        self.next = (self.next + 1) % self.capacity;
    }
}

pub struct UsageTracker {
    ring: Mutex<Ring>,
    is_locked: AtomicBool,
    dropped_writes: AtomicU64,
}

impl UsageTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                records: Vec::with_capacity(capacity),
                next: 0,
                capacity,
            }),
            is_locked: AtomicBool::new(false),
            dropped_writes: AtomicU64::new(0),
        }
    }

    pub fn record(&self, operation_type: &str, success: bool) {
        self.record_at(operation_type, success, Utc::now());
    }

    pub(crate) fn record_at(&self, operation_type: &str, success: bool, timestamp: DateTime<Utc>) {
        if self.is_locked.load(Ordering::Acquire) {
            self.dropped_writes.fetch_add(1, Ordering::Relaxed);
            debug!("Dropped usage record for {} during cleanup", operation_type);
            return;
        }
        self.ring.lock().push(UsageRecord {
            timestamp,
            operation_type: operation_type.to_string(),
            success,
        });
    }

    /// Statistics over records newer than `window`.
    pub fn windowed_stats(&self, window: Duration) -> UsageStats {
        let cutoff = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window));

        let mut stats = UsageStats {
            window_secs: window.as_secs(),
            dropped_writes: self.dropped_writes.load(Ordering::Relaxed),
            ..Default::default()
        };
        let ring = self.ring.lock();
        for record in ring
            .records
            .iter()
            .filter(|r| cutoff.is_none_or(|cutoff| r.timestamp >= cutoff))
        {
            stats.total += 1;
            if record.success {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            stats
                .by_type
                .entry(record.operation_type.clone())
                .or_default()
                .add(record.success);
        }
        stats
    }

    /// Drop records older than `max_age` and compact the buffer.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        self.is_locked.store(true, Ordering::Release);
        let removed = {
            let mut ring = self.ring.lock();
            if ring.records.len() == ring.capacity {
                let next = ring.next;
                ring.records.rotate_left(next);
            }
            let before = ring.records.len();
            ring.records.retain(|r| r.timestamp >= cutoff);
            ring.next = ring.records.len() % ring.capacity;
            before - ring.records.len()
        };
        self.is_locked.store(false, Ordering::Release);

        if removed > 0 {
            debug!("Usage cleanup removed {} record(s)", removed);
        }
        removed
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `cancel` fires.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    _ = ticker.tick() => {
                        tracker.cleanup(max_age);
                    }
                }
            }
        })
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<UsageRecord> {
        self.ring.lock().records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ago(secs: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::seconds(secs)
    }

    mod ring {
        use super::*;

        #[test]
        fn test_appends_until_capacity() {
            let tracker = UsageTracker::new(3);
            tracker.record("ssh_execute", true);
            tracker.record("sql_query", false);
            assert_eq!(tracker.snapshot().len(), 2);
        }

        #[test]
        fn test_overwrites_oldest_in_place() {
            let tracker = UsageTracker::new(3);
            for op in ["a", "b", "c", "d"] {
                tracker.record(op, true);
            }
            let ops: Vec<_> = tracker
                .snapshot()
                .into_iter()
                .map(|r| r.operation_type)
                .collect();
            assert_eq!(ops, vec!["d", "b", "c"]);

            tracker.record("e", true);
            let ops: Vec<_> = tracker
                .snapshot()
                .into_iter()
                .map(|r| r.operation_type)
                .collect();
            assert_eq!(ops, vec!["d", "e", "c"]);
        }
    }

    mod stats {
        use super::*;

        #[test]
        fn test_windowed_stats_filter_by_timestamp() {
            let tracker = UsageTracker::new(10);
            tracker.record_at("sql_query", true, ago(5));
            tracker.record_at("sql_query", false, ago(10));
            tracker.record_at("ssh_execute", true, ago(7200));

            let stats = tracker.windowed_stats(Duration::from_secs(60));
            assert_eq!(stats.total, 2);
            assert_eq!(stats.successful, 1);
            assert_eq!(stats.failed, 1);
            assert_eq!(stats.by_type["sql_query"].total, 2);
            assert!(!stats.by_type.contains_key("ssh_execute"));

            let all = tracker.windowed_stats(Duration::from_secs(86_400));
            assert_eq!(all.total, 3);
        }

        #[test]
        fn test_window_uses_timestamps_not_slot_order() {
            let tracker = UsageTracker::new(2);
            tracker.record_at("old", true, ago(7200));
            tracker.record_at("new", true, ago(1));
            tracker.record_at("newer", true, ago(0));

            let stats = tracker.windowed_stats(Duration::from_secs(60));
            assert_eq!(stats.total, 2);
            assert!(stats.by_type.contains_key("newer"));
        }
    }

    mod cleanup {
        use super::*;

        #[test]
        fn test_removes_old_records_and_compacts() {
            let tracker = UsageTracker::new(3);
            tracker.record_at("a", true, ago(7200));
            tracker.record_at("b", true, ago(10));
            tracker.record_at("c", true, ago(7200));
            tracker.record_at("d", true, ago(5));

            assert_eq!(tracker.cleanup(Duration::from_secs(3600)), 1);
            let ops: Vec<_> = tracker
                .snapshot()
                .into_iter()
                .map(|r| r.operation_type)
                .collect();
            assert_eq!(ops, vec!["b", "d"]);

            tracker.record("e", true);
            tracker.record("f", true);
            let ops: Vec<_> = tracker
                .snapshot()
                .into_iter()
                .map(|r| r.operation_type)
                .collect();
            assert_eq!(ops, vec!["f", "d", "e"]);
        }

        #[test]
        fn test_writes_during_cleanup_are_counted() {
            let tracker = UsageTracker::new(3);
            tracker.is_locked.store(true, Ordering::SeqCst);
            tracker.record("sql_query", true);
            tracker.is_locked.store(false, Ordering::SeqCst);

            assert!(tracker.snapshot().is_empty());
            assert_eq!(
                tracker.windowed_stats(Duration::from_secs(60)).dropped_writes,
                1
            );
        }

        #[tokio::test(start_paused = true)]
        async fn test_spawned_cleanup_stops_on_cancel() {
            let tracker = Arc::new(UsageTracker::new(3));
            let cancel = CancellationToken::new();
            let task = tracker.spawn_cleanup(
                Duration::from_secs(60),
                Duration::from_secs(3600),
                cancel.clone(),
            );
            tokio::time::sleep(Duration::from_secs(61)).await;
            cancel.cancel();
            task.await.unwrap();
            assert!(!tracker.is_locked.load(Ordering::SeqCst));
        }
    }
}

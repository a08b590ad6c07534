//! Send-pipeline metrics: totals, a running per-minute rate, the biased
//! latency smoother, and per-worker slot accounting. Everything is guarded
//! by one lock per concern; snapshots never hold a lock across I/O.

use std::collections::VecDeque;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use pelican_structs::timestamp::Timestamp;

const RATE_WINDOW: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SendMetricsSnapshot {
    pub total_sent: u64,
    pub total_failed: u64,
    pub avg_latency_ms: f64,
    pub rate_per_minute: usize,
}

struct SendMetricsInner {
    total_sent: u64,
    total_failed: u64,
    avg_latency_ms: f64,
    recent_sends: VecDeque<Instant>,
}

/// Counters for the worker pool. Reads dominate (status snapshots), so this
/// sits behind a reader-writer lock.
pub struct SendMetrics {
    inner: RwLock<SendMetricsInner>,
}

impl SendMetrics {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SendMetricsInner {
                total_sent: 0,
                total_failed: 0,
                avg_latency_ms: 0.0,
                recent_sends: VecDeque::new(),
            }),
        }
    }

    pub fn record_success(&self, latency: Duration, now: Instant) {
        let mut inner = self.inner.write().expect("send metrics lock poisoned");
        inner.total_sent += 1;
        // Low-memory smoother: each sample pulls the average halfway toward
        // it, weighting recent sends heavily.
        let sample = latency.as_secs_f64() * 1000.0;
        inner.avg_latency_ms = if inner.total_sent == 1 {
            sample
        } else {
            (inner.avg_latency_ms + sample) / 2.0
        };
        inner.recent_sends.push_back(now);
        while let Some(oldest) = inner.recent_sends.front() {
            if now.duration_since(*oldest) >= RATE_WINDOW {
                inner.recent_sends.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.write().expect("send metrics lock poisoned");
        inner.total_failed += 1;
    }

    pub fn snapshot(&self, now: Instant) -> SendMetricsSnapshot {
        let inner = self.inner.read().expect("send metrics lock poisoned");
        let rate = inner
            .recent_sends
            .iter()
            .filter(|at| now.duration_since(**at) < RATE_WINDOW)
            .count();
        SendMetricsSnapshot {
            total_sent: inner.total_sent,
            total_failed: inner.total_failed,
            avg_latency_ms: inner.avg_latency_ms,
            rate_per_minute: rate,
        }
    }
}

impl Default for SendMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// One worker's slot in the pool. Lifetime equals the pool's.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerSlot {
    pub id: usize,
    pub in_flight: Option<String>,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub last_active: Timestamp,
}

pub struct WorkerSlots {
    slots: Mutex<Vec<WorkerSlot>>,
}

impl WorkerSlots {
    pub fn new(count: usize) -> Self {
        let slots = (0..count)
            .map(|id| WorkerSlot {
                id,
                in_flight: None,
                tasks_processed: 0,
                tasks_failed: 0,
                last_active: Timestamp::now(),
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    pub fn set_in_flight(&self, worker: usize, task: Option<String>) {
        let mut slots = self.slots.lock().expect("worker slots lock poisoned");
        if let Some(slot) = slots.get_mut(worker) {
            slot.in_flight = task;
            slot.last_active = Timestamp::now();
        }
    }

    pub fn record_outcome(&self, worker: usize, succeeded: bool) {
        let mut slots = self.slots.lock().expect("worker slots lock poisoned");
        if let Some(slot) = slots.get_mut(worker) {
            if succeeded {
                slot.tasks_processed += 1;
            } else {
                slot.tasks_failed += 1;
            }
            slot.in_flight = None;
            slot.last_active = Timestamp::now();
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerSlot> {
        self.slots.lock().expect("worker slots lock poisoned").clone()
    }
}

//! Pooled backends and their supervision state: the SQLite store, the
//! in-memory cache, an acquisition gate enforcing the configured bounds,
//! and per-backend health counters. The supervisor's tickers call into
//! here; the gate can be re-bounded live without touching in-flight work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use moka::future::Cache;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use pelican_structs::fault::Fault;
use pelican_structs::timestamp::Timestamp;

use crate::config::PoolConfig;
use crate::store::mailboxes::MailboxRecord;

const CACHE_CAPACITY: u64 = 10_000;

#[derive(Clone, Debug, Serialize)]
pub struct BackendStatus {
    pub healthy: bool,
    pub last_check: Timestamp,
    pub errors: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct BackendsSnapshot {
    pub store_open: u32,
    pub store_idle: usize,
    pub store_in_use: usize,
    pub gate_limit: usize,
    pub gate_available: usize,
    pub cache_entries: u64,
    pub health: HashMap<String, BackendStatus>,
}

/// Bounded acquisition gate in front of the store. Resizing adds or forgets
/// permits; permits already handed out are unaffected.
struct StoreGate {
    semaphore: Arc<Semaphore>,
    limit: Mutex<usize>,
}

impl StoreGate {
    fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: Mutex::new(limit),
        }
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, Fault> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Fault::BackendUnavailable)
    }

    fn resize(&self, new_limit: usize) {
        let mut limit = self.limit.lock().expect("store gate lock poisoned");
        if new_limit > *limit {
            self.semaphore.add_permits(new_limit - *limit);
        } else {
            self.semaphore.forget_permits(*limit - new_limit);
        }
        *limit = new_limit;
    }

    fn limit(&self) -> usize {
        *self.limit.lock().expect("store gate lock poisoned")
    }
}

pub struct Backends {
    pub db: SqlitePool,
    mailbox_cache: Cache<String, MailboxRecord>,
    gate: StoreGate,
    health: RwLock<HashMap<String, BackendStatus>>,
    store_errors: AtomicU64,
    cache_errors: AtomicU64,
}

impl Backends {
    pub fn new(db: SqlitePool, config: &PoolConfig) -> Self {
        let mailbox_cache = Cache::builder()
            .max_capacity(CACHE_CAPACITY)
            .time_to_idle(Duration::from_secs(config.max_idle_secs))
            .build();
        Self {
            db,
            mailbox_cache,
            gate: StoreGate::new(config.max_open as usize),
            health: RwLock::new(HashMap::new()),
            store_errors: AtomicU64::new(0),
            cache_errors: AtomicU64::new(0),
        }
    }

    /// Every store operation holds one of these for its duration; release
    /// happens on drop, on every exit path.
    pub async fn store_permit(&self) -> Result<OwnedSemaphorePermit, Fault> {
        self.gate.acquire().await
    }

    /// Cheap shared handle to the mailbox cache (moka caches share storage
    /// across clones).
    pub fn mailbox_cache(&self) -> Cache<String, MailboxRecord> {
        self.mailbox_cache.clone()
    }

    /// Apply new pool bounds to the live gate without dropping in-flight
    /// work.
    pub fn update(&self, config: &PoolConfig) {
        self.gate.resize(config.max_open as usize);
        tracing::info!(max_open = config.max_open, "backend pool bounds updated");
    }

    /// Ping each backend, record the outcome, bump error counters on
    /// failure.
    pub async fn check_health(&self) {
        let now = Timestamp::now();
        let store_healthy = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.db)
            .await
            .is_ok();
        if !store_healthy {
            self.store_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("store health check failed");
        }

        // In-process cache: running its housekeeping is the probe.
        self.mailbox_cache.run_pending_tasks().await;
        let cache_healthy = true;

        let mut health = self.health.write().expect("backend health lock poisoned");
        health.insert(
            "store".to_string(),
            BackendStatus {
                healthy: store_healthy,
                last_check: now,
                errors: self.store_errors.load(Ordering::Relaxed),
            },
        );
        health.insert(
            "cache".to_string(),
            BackendStatus {
                healthy: cache_healthy,
                last_check: now,
                errors: self.cache_errors.load(Ordering::Relaxed),
            },
        );
    }

    /// Evict idle cache entries and let the store pool's own idle timeout
    /// close surplus connections.
    pub async fn sweep_idle(&self) {
        self.mailbox_cache.run_pending_tasks().await;
        tracing::debug!(
            idle = self.db.num_idle(),
            cache_entries = self.mailbox_cache.entry_count(),
            "idle sweep"
        );
    }

    pub fn snapshot(&self) -> BackendsSnapshot {
        let open = self.db.size();
        let idle = self.db.num_idle();
        BackendsSnapshot {
            store_open: open,
            store_idle: idle,
            store_in_use: (open as usize).saturating_sub(idle),
            gate_limit: self.gate.limit(),
            gate_available: self.gate.semaphore.available_permits(),
            cache_entries: self.mailbox_cache.entry_count(),
            health: self
                .health
                .read()
                .expect("backend health lock poisoned")
                .clone(),
        }
    }
}

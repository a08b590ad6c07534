//! Background supervision: one ticker task per concern, each owning its
//! interval and listening on the shared shutdown signal. The supervisor
//! holds the join handles and coordinates an orderly stop.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backends::Backends;
use crate::config::{MonitorConfig, QueueConfig};
use crate::credentials::CredentialService;
use crate::metrics::SendMetrics;
use crate::queue::SendQueue;

/// Sessions and blacklist entries are purged this often.
const EXPIRY_SWEEP_SECS: u64 = 10 * 60;

/// Dead letters past retention are purged this often.
const DEAD_LETTER_SWEEP_SECS: u64 = 60 * 60;

#[derive(Clone, Copy, Debug)]
pub struct Intervals {
    pub metrics: Duration,
    pub health: Duration,
    pub idle_sweep: Duration,
    pub retry_sweep: Duration,
    pub expiry_sweep: Duration,
    pub dead_letter_sweep: Duration,
}

impl Intervals {
    pub fn from_config(monitor: &MonitorConfig, queue: &QueueConfig) -> Self {
        Self {
            metrics: Duration::from_secs(monitor.metrics_interval_secs.max(1)),
            health: Duration::from_secs(monitor.health_interval_secs.max(1)),
            idle_sweep: Duration::from_secs(monitor.idle_sweep_interval_secs.max(1)),
            retry_sweep: Duration::from_secs(queue.retry_sweep_secs.max(1)),
            expiry_sweep: Duration::from_secs(EXPIRY_SWEEP_SECS),
            dead_letter_sweep: Duration::from_secs(DEAD_LETTER_SWEEP_SECS),
        }
    }
}

pub struct SupervisorDeps {
    pub backends: Arc<Backends>,
    pub metrics: Arc<SendMetrics>,
    pub queue: Arc<SendQueue>,
    pub credentials: Arc<CredentialService>,
}

pub struct Supervisor {
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn spawn(
        deps: SupervisorDeps,
        intervals: Intervals,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let SupervisorDeps {
            backends,
            metrics,
            queue,
            credentials,
        } = deps;

        let mut handles = Vec::new();

        handles.push(spawn_ticker("metrics-collector", intervals.metrics, shutdown.clone(), {
            let backends = backends.clone();
            let metrics = metrics.clone();
            let queue = queue.clone();
            move || {
                let backends = backends.clone();
                let metrics = metrics.clone();
                let queue = queue.clone();
                async move {
                    let pool = backends.snapshot();
                    let sends = metrics.snapshot(Instant::now());
                    tracing::debug!(
                        store_open = pool.store_open,
                        store_in_use = pool.store_in_use,
                        store_idle = pool.store_idle,
                        cache_entries = pool.cache_entries,
                        queue_depth = queue.depth(),
                        total_sent = sends.total_sent,
                        total_failed = sends.total_failed,
                        "metrics snapshot"
                    );
                }
            }
        }));

        handles.push(spawn_ticker("health-checker", intervals.health, shutdown.clone(), {
            let backends = backends.clone();
            move || {
                let backends = backends.clone();
                async move { backends.check_health().await }
            }
        }));

        handles.push(spawn_ticker("idle-sweeper", intervals.idle_sweep, shutdown.clone(), {
            let backends = backends.clone();
            move || {
                let backends = backends.clone();
                async move { backends.sweep_idle().await }
            }
        }));

        handles.push(spawn_ticker("retry-sweeper", intervals.retry_sweep, shutdown.clone(), {
            let queue = queue.clone();
            move || {
                let queue = queue.clone();
                async move {
                    if let Err(err) = queue.sweep_retries().await {
                        tracing::error!(%err, "retry sweep failed");
                    }
                }
            }
        }));

        handles.push(spawn_ticker("expiry-sweeper", intervals.expiry_sweep, shutdown.clone(), {
            let credentials = credentials.clone();
            move || {
                let credentials = credentials.clone();
                async move {
                    if let Err(err) = credentials.sweep_expired().await {
                        tracing::error!(%err, "credential sweep failed");
                    }
                }
            }
        }));

        handles.push(spawn_ticker(
            "dead-letter-sweeper",
            intervals.dead_letter_sweep,
            shutdown,
            {
                let queue = queue.clone();
                move || {
                    let queue = queue.clone();
                    async move {
                        if let Err(err) = queue.sweep_dead_letters().await {
                            tracing::error!(%err, "dead letter sweep failed");
                        }
                    }
                }
            },
        ));

        tracing::info!(tickers = handles.len(), "supervisor started");
        Self { handles }
    }

    /// Wait for every ticker to observe the shutdown signal and exit.
    pub async fn shutdown(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
        tracing::info!("supervisor stopped");
    }
}

fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut work: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => work().await,
            }
        }
        tracing::debug!(ticker = name, "ticker stopped");
    })
}

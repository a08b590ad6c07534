use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use pelican_crypt::seal::Sealer;
use pelican_relay::SmtpRelay;
use pelican_server::acceptor::Acceptor;
use pelican_server::api::{self, AppState};
use pelican_server::backends::Backends;
use pelican_server::breaker::SharedBreaker;
use pelican_server::config::CONFIG;
use pelican_server::credentials::CredentialService;
use pelican_server::database::{DATABASE, init_database};
use pelican_server::directory::MailboxDirectory;
use pelican_server::inbox::Inbox;
use pelican_server::metrics::{SendMetrics, WorkerSlots};
use pelican_server::queue::SendQueue;
use pelican_server::ratelimit::RateLimiter;
use pelican_server::supervisor::{Intervals, Supervisor, SupervisorDeps};
use pelican_server::tokens::TokenSigner;
use pelican_server::workers::{WorkerContext, WorkerPool};
use pelican_structs::address::EmailAddress;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pelican_server=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let master_key = CONFIG.master_key_bytes()?;
    init_database().await?;
    let db = DATABASE.clone();

    let sealer = Arc::new(Sealer::new(master_key));
    let backends = Arc::new(Backends::new(db.clone(), &CONFIG.pool));
    let directory = Arc::new(MailboxDirectory::new(db.clone(), backends.mailbox_cache()));
    let signer = TokenSigner::new(
        &CONFIG.token_secret,
        CONFIG.tokens.access_ttl_secs,
        CONFIG.tokens.refresh_ttl_secs,
    );
    let credentials = Arc::new(CredentialService::new(db.clone(), signer));
    bootstrap_admin(&credentials, &db).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (queue, task_rx) = SendQueue::new(db.clone(), CONFIG.queue.clone());
    let queue = Arc::new(queue);
    let metrics = Arc::new(SendMetrics::new());
    let breaker = Arc::new(SharedBreaker::new());
    let limiter = Arc::new(RateLimiter::new(
        CONFIG.rate_limit.max_per_window,
        Duration::from_secs(CONFIG.rate_limit.window_secs),
    ));
    let worker_count = CONFIG.worker_count();
    let slots = Arc::new(WorkerSlots::new(worker_count));
    let worker_ctx = Arc::new(WorkerContext {
        db: db.clone(),
        transport: Arc::new(SmtpRelay::new(CONFIG.relay.clone())),
        breaker: breaker.clone(),
        limiter: limiter.clone(),
        metrics: metrics.clone(),
        slots: slots.clone(),
        sealer: sealer.clone(),
        retry_delay_secs: CONFIG.queue.retry_delay_secs,
    });
    let workers = WorkerPool::spawn(worker_count, task_rx, worker_ctx);

    // Tasks that were in flight when the previous process stopped.
    queue.replay_pending().await?;

    let acceptor = Arc::new(Acceptor::new(
        db.clone(),
        directory.clone(),
        queue.clone(),
        sealer.clone(),
        backends.clone(),
        shutdown_rx.clone(),
    ));
    let inbox = Arc::new(Inbox::new(db.clone(), sealer.clone(), backends.clone()));

    let supervisor = Supervisor::spawn(
        SupervisorDeps {
            backends: backends.clone(),
            metrics: metrics.clone(),
            queue: queue.clone(),
            credentials: credentials.clone(),
        },
        Intervals::from_config(&CONFIG.monitor, &CONFIG.queue),
        shutdown_rx.clone(),
    );

    let state = AppState {
        credentials,
        directory,
        acceptor,
        inbox,
        queue,
        backends,
        metrics,
        slots,
        breaker,
        limiter,
    };
    let app = api::router(state);
    let listener = TcpListener::bind(CONFIG.listen).await?;
    tracing::info!(listen = %CONFIG.listen, workers = worker_count, "pelican server up");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // The signal task has already flipped the watch; drain the pipeline.
    workers.stop().await;
    supervisor.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM, flipping the process-wide shutdown flag so
/// acceptors, workers, and tickers wind down together.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("install SIGINT handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

/// A fresh install has no way to log in; create the configured admin when
/// no admin exists yet.
async fn bootstrap_admin(
    credentials: &CredentialService,
    db: &sqlx::SqlitePool,
) -> anyhow::Result<()> {
    let Some(bootstrap) = &CONFIG.bootstrap_admin else {
        return Ok(());
    };
    if pelican_server::store::users::any_admin_exists(db).await? {
        return Ok(());
    }
    let email = EmailAddress::parse(&bootstrap.email)
        .map_err(|err| anyhow::anyhow!("bootstrap admin email: {err}"))?;
    credentials
        .create_user(&email, &bootstrap.password, true)
        .await?;
    tracing::info!(admin = %email, "bootstrap admin created");
    Ok(())
}

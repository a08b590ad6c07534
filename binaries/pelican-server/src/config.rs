//! Startup configuration: a JSON document named on the command line.
//! Missing keys take the defaults below; unknown keys are ignored.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::{fs, process};

use clap::Parser;
use serde::Deserialize;
use pelican_relay::RelayConfig;

#[derive(Parser, Debug)]
#[command(name = "pelican-server")]
struct Args {
    #[arg(long)]
    config: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_relay")]
    pub relay: RelayConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    /// Worker count; defaults to twice the detected parallelism.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Master encryption key: 64 hex characters (256 bits).
    pub master_key: String,
    /// Secret the bearer tokens are signed with.
    pub token_secret: String,
    /// Created at startup when no admin exists yet.
    #[serde(default)]
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

#[derive(Debug, Deserialize)]
pub struct BootstrapAdmin {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_open")]
    pub max_open: u32,
    #[serde(default = "default_max_idle")]
    pub max_idle: u32,
    #[serde(default = "default_conn_lifetime")]
    pub max_lifetime_secs: u64,
    #[serde(default = "default_conn_idle")]
    pub max_idle_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: default_max_open(),
            max_idle: default_max_idle(),
            max_lifetime_secs: default_conn_lifetime(),
            max_idle_secs: default_conn_idle(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_idle_sweep_interval")]
    pub idle_sweep_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: default_metrics_interval(),
            health_interval_secs: default_health_interval(),
            idle_sweep_interval_secs: default_idle_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_max")]
    pub max_per_window: usize,
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: default_rate_max(),
            window_secs: default_rate_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_retry_sweep")]
    pub retry_sweep_secs: u64,
    #[serde(default = "default_dead_letter_retention")]
    pub dead_letter_retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
            retry_sweep_secs: default_retry_sweep(),
            dead_letter_retention_secs: default_dead_letter_retention(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    #[serde(default = "default_access_ttl")]
    pub access_ttl_secs: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_ttl_secs: default_access_ttl(),
            refresh_ttl_secs: default_refresh_ttl(),
        }
    }
}

impl Config {
    /// Decode and validate the master key. Startup fails on anything that
    /// is not exactly 256 bits of hex.
    pub fn master_key_bytes(&self) -> anyhow::Result<[u8; 32]> {
        let bytes = hex::decode(self.master_key.trim())
            .map_err(|_| anyhow::anyhow!("master_key is not valid hex"))?;
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("master_key must be 64 hex characters (256 bits)"))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            let parallelism = std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(2);
            parallelism * 2
        })
    }
}

fn default_listen() -> SocketAddr {
    "127.0.0.1:8025".parse().expect("valid default listen address")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("pelican.db")
}

fn default_relay() -> RelayConfig {
    RelayConfig {
        host: "localhost".to_string(),
        port: 587,
        username: None,
        password: None,
        use_tls: true,
        ehlo_host: "localhost".to_string(),
    }
}

fn default_max_open() -> u32 {
    10
}
fn default_max_idle() -> u32 {
    2
}
fn default_conn_lifetime() -> u64 {
    30 * 60
}
fn default_conn_idle() -> u64 {
    5 * 60
}
fn default_metrics_interval() -> u64 {
    30
}
fn default_health_interval() -> u64 {
    60
}
fn default_idle_sweep_interval() -> u64 {
    5 * 60
}
fn default_rate_max() -> usize {
    100
}
fn default_rate_window() -> u64 {
    60
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    5 * 60
}
fn default_retry_sweep() -> u64 {
    30
}
fn default_dead_letter_retention() -> u64 {
    7 * 24 * 60 * 60
}
fn default_access_ttl() -> u64 {
    15 * 60
}
fn default_refresh_ttl() -> u64 {
    7 * 24 * 60 * 60
}

pub static CONFIG: LazyLock<Config> = LazyLock::new(|| {
    let args = Args::parse();
    let raw = fs::read_to_string(&args.config).unwrap_or_else(|err| {
        eprintln!("failed to read config {}: {err}", args.config.display());
        process::exit(2);
    });
    serde_json::from_str(&raw).unwrap_or_else(|err| {
        eprintln!("failed to parse config {}: {err}", args.config.display());
        process::exit(2);
    })
});

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Coordinator tunables. Tests build this directly to shrink the timers.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Directory holding places.yaml and resources.yaml. `None` disables persistence.
    pub state_dir: Option<PathBuf>,
    pub save_interval: Duration,
    pub sync_interval: Duration,
    pub schedule_interval: Duration,
    /// Upper bound on a single exporter acquire/release round-trip.
    pub command_timeout: Duration,
    /// Lifetime of an unpolled reservation.
    pub reservation_timeout: Duration,
    /// How long invalid reservations stay visible before deletion.
    pub invalid_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            save_interval: Duration::from_secs(1),
            sync_interval: Duration::from_secs(5),
            schedule_interval: Duration::from_secs(15),
            command_timeout: Duration::from_secs(10),
            reservation_timeout: Duration::from_secs(60),
            invalid_grace: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub coordinator: CoordinatorConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("LABHUB_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:20408".to_string())
            .parse()
            .context("LABHUB_LISTEN_ADDR is not a socket address")?;

        let log_level = std::env::var("LABHUB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let state_dir = std::env::var("LABHUB_STATE_DIR").unwrap_or_else(|_| ".".to_string());

        let defaults = CoordinatorConfig::default();
        let coordinator = CoordinatorConfig {
            state_dir: Some(PathBuf::from(state_dir)),
            save_interval: env_millis("LABHUB_SAVE_INTERVAL_MS", defaults.save_interval)?,
            sync_interval: env_secs("LABHUB_SYNC_INTERVAL_SECS", defaults.sync_interval)?,
            schedule_interval: env_secs(
                "LABHUB_SCHEDULE_INTERVAL_SECS",
                defaults.schedule_interval,
            )?,
            command_timeout: env_secs("LABHUB_COMMAND_TIMEOUT_SECS", defaults.command_timeout)?,
            reservation_timeout: env_secs(
                "LABHUB_RESERVATION_TIMEOUT_SECS",
                defaults.reservation_timeout,
            )?,
            invalid_grace: defaults.invalid_grace,
        };

        Ok(Self {
            listen_addr,
            log_level,
            coordinator,
        })
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(v) => Ok(Duration::from_secs(
            v.parse().with_context(|| format!("{key} must be whole seconds"))?,
        )),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(v) => Ok(Duration::from_millis(
            v.parse().with_context(|| format!("{key} must be whole milliseconds"))?,
        )),
        Err(_) => Ok(default),
    }
}

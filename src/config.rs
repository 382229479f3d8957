//! Server configuration.
//!
//! Every option is a command-line flag that falls back to an environment
//! variable, and `.env` is loaded first (see `main`), so a deployment can be
//! configured purely through its environment.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;

const BYTES_PER_MB: u64 = 1024 * 1024;
const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DEFAULT_QUOTA_MB must be positive")]
    ZeroQuota,
    #[error("EXPIRY_DAYS must be positive")]
    ZeroExpiry,
    #[error("EXPIRY_CHECK_INTERVAL must be positive")]
    ZeroInterval,
    #[error("MAX_OPEN_DATABASES must be positive")]
    ZeroOpenDatabases,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// jsondrop server: multi-tenant JSON document store over HTTP.
#[derive(Parser, Debug, Clone)]
#[command(name = "jsondrop", version, about, long_about = None)]
pub struct Config {
    /// HTTP port
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    /// Directory holding one storage unit per database
    #[arg(long, env = "DB_BASE_DIR", default_value = "./data")]
    pub db_base_dir: PathBuf,

    /// Path of the catalog database
    #[arg(long, env = "CATALOG_DB_PATH", default_value = "./data/catalog.db")]
    pub catalog_db_path: PathBuf,

    /// Allowed CORS origins, comma separated; `*` allows any
    #[arg(long, env = "CORS_ORIGINS", default_value = "*", value_delimiter = ',')]
    pub cors_origins: Vec<String>,

    /// Storage quota for new databases, in MB
    #[arg(long, env = "DEFAULT_QUOTA_MB", default_value_t = 100)]
    pub default_quota_mb: u64,

    /// Databases idle for longer than this many days are deleted
    #[arg(long, env = "EXPIRY_DAYS", default_value_t = 30)]
    pub expiry_days: u64,

    /// How often to look for expired databases, e.g. `30m`, `24h`, `7d`
    #[arg(
        long,
        env = "EXPIRY_CHECK_INTERVAL",
        default_value = "24h",
        value_parser = parse_duration
    )]
    pub expiry_check_interval: Duration,

    /// Idle database handles kept open before the least recently used close
    #[arg(long, env = "MAX_OPEN_DATABASES", default_value_t = 64)]
    pub max_open_databases: usize,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Also write daily-rotated log files into this directory
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_quota_mb == 0 {
            return Err(ConfigError::ZeroQuota);
        }
        if self.expiry_days == 0 {
            return Err(ConfigError::ZeroExpiry);
        }
        if self.expiry_check_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.max_open_databases == 0 {
            return Err(ConfigError::ZeroOpenDatabases);
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn default_quota_bytes(&self) -> u64 {
        self.default_quota_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_days.saturating_mul(SECS_PER_DAY))
    }
}

/// Parse `<n>[s|m|h|d]`. A bare number is seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {:?}", raw))?;
    let scale = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => SECS_PER_DAY,
        _ => return Err(format!("invalid duration unit in {:?}", raw)),
    };
    Ok(Duration::from_secs(n.saturating_mul(scale)))
}

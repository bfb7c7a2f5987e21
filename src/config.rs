use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveTime;

/// Knobs the engine itself consults. Everything else in [`Config`] belongs to
/// the server shell.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a write waits for its provider/date lock when the caller
    /// supplies no deadline of its own.
    pub lock_timeout: Duration,
    /// When set, new bookings start `Pending` and lapse after this long unless
    /// confirmed. When unset they start `Confirmed`.
    pub pending_ttl: Option<Duration>,
    /// Opening hours for providers that never published their own.
    pub default_open: NaiveTime,
    pub default_close: NaiveTime,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(5000),
            pending_ttl: None,
            default_open: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            default_close: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    /// pgwire login name that is granted the admin role.
    pub admin_user: String,
    /// Password for `admin_user`. Falls back to `password` when unset.
    pub admin_password: Option<String>,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub engine: EngineConfig,
}

impl Config {
    /// Read `SLOTBOOK_*` variables, falling back to defaults for anything unset
    /// or unparsable.
    pub fn from_env() -> Self {
        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            lock_timeout: Duration::from_millis(env_or("SLOTBOOK_LOCK_TIMEOUT_MS", 5000)),
            pending_ttl: env_opt::<u64>("SLOTBOOK_PENDING_TTL_SECS").map(Duration::from_secs),
            default_open: env_time("SLOTBOOK_DEFAULT_OPEN").unwrap_or(defaults.default_open),
            default_close: env_time("SLOTBOOK_DEFAULT_CLOSE").unwrap_or(defaults.default_close),
        };

        Self {
            bind: std::env::var("SLOTBOOK_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("SLOTBOOK_PORT", 5433),
            data_dir: PathBuf::from(
                std::env::var("SLOTBOOK_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            password: std::env::var("SLOTBOOK_PASSWORD").unwrap_or_else(|_| "slotbook".into()),
            admin_user: std::env::var("SLOTBOOK_ADMIN_USER").unwrap_or_else(|_| "admin".into()),
            admin_password: std::env::var("SLOTBOOK_ADMIN_PASSWORD").ok(),
            max_connections: env_or("SLOTBOOK_MAX_CONNECTIONS", 256),
            compact_threshold: env_or("SLOTBOOK_COMPACT_THRESHOLD", 1000),
            metrics_port: env_opt("SLOTBOOK_METRICS_PORT"),
            tls_cert: std::env::var("SLOTBOOK_TLS_CERT").ok(),
            tls_key: std::env::var("SLOTBOOK_TLS_KEY").ok(),
            engine,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key).unwrap_or(default)
}

fn env_time(key: &str) -> Option<NaiveTime> {
    let raw = std::env::var(key).ok()?;
    parse_clock_time(&raw)
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_clock_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_time_formats() {
        assert_eq!(parse_clock_time("09:30"), NaiveTime::from_hms_opt(9, 30, 0));
        assert_eq!(parse_clock_time(" 17:00:00 "), NaiveTime::from_hms_opt(17, 0, 0));
        assert_eq!(parse_clock_time("25:00"), None);
        assert_eq!(parse_clock_time("9am"), None);
    }

    #[test]
    fn engine_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.default_open, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(cfg.default_close, NaiveTime::from_hms_opt(18, 0, 0).unwrap());
        assert!(cfg.pending_ttl.is_none());
    }
}

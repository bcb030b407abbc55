use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::TimePolicy;
use crate::error::MonitorError;

/// Which write paths are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    None,
    File,
    Db,
    Both,
}

impl StorageMode {
    fn from_env_value(value: &str) -> Result<Self, MonitorError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(StorageMode::None),
            "file" => Ok(StorageMode::File),
            "db" => Ok(StorageMode::Db),
            "both" => Ok(StorageMode::Both),
            other => Err(MonitorError::config(format!(
                "STORAGE must be one of none|file|db|both, got {other:?}"
            ))),
        }
    }

    pub fn file_enabled(&self) -> bool {
        matches!(self, StorageMode::File | StorageMode::Both)
    }

    pub fn db_enabled(&self) -> bool {
        matches!(self, StorageMode::Db | StorageMode::Both)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdPair {
    pub warning: f64,
    pub critical: f64,
}

impl ThresholdPair {
    fn validate(&self, what: &str) -> Result<(), MonitorError> {
        if !(0.0..=100.0).contains(&self.warning)
            || !(0.0..=100.0).contains(&self.critical)
            || self.warning >= self.critical
        {
            return Err(MonitorError::config(format!(
                "{what} thresholds must satisfy 0 <= warning < critical <= 100 \
                 (got warning={}, critical={})",
                self.warning, self.critical
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub cpu: ThresholdPair,
    pub memory: ThresholdPair,
    pub disk: ThresholdPair,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu: ThresholdPair {
                warning: 70.0,
                critical: 90.0,
            },
            memory: ThresholdPair {
                warning: 75.0,
                critical: 90.0,
            },
            disk: ThresholdPair {
                warning: 80.0,
                critical: 95.0,
            },
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), MonitorError> {
        self.cpu.validate("cpu")?;
        self.memory.validate("memory")?;
        self.disk.validate("disk")?;
        Ok(())
    }
}

/// A peer collector instance to scrape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

/// A URL whose reachability we probe each tick. Not necessarily a peer.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatTarget {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Shape of the optional JSON topology file (`CONFIG_PATH`). Everything has
/// a default so an absent file just means a collector with no peers and no
/// probe targets.
#[derive(Debug, Clone, Default, Deserialize)]
struct TopologyFile {
    refresh_interval_seconds: Option<u64>,
    #[serde(default)]
    servers: Vec<ServerEntry>,
    #[serde(default, alias = "heartbeat")]
    heartbeats: Vec<HeartbeatTarget>,
    thresholds: Option<Thresholds>,
}

/// Limits for the shared outbound HTTP pool.
#[derive(Debug, Clone, Copy)]
pub struct HttpLimits {
    pub max_conns_per_host: usize,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub max_response_bytes: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_conns_per_host: 8,
            max_idle_conns: 32,
            max_idle_conns_per_host: 4,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(5),
            max_response_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bind port (env: PORT)
    pub port: u16,

    pub storage: StorageMode,

    /// Base directory for the file backend (env: LOG_PATH)
    pub log_path: String,

    /// Resolved DSN for the SQL backend. `sqlite:` selects the embedded
    /// store, `postgres:` the relational one.
    pub database_url: String,

    /// Entries older than this are removed by the sweeper; 0 disables.
    pub retention_days: u32,

    pub refresh_interval_seconds: u64,

    /// Query responses larger than this are downsampled; <= 0 disables.
    pub downsample_max_points: i64,

    /// Logical table the combined record is written to.
    pub default_table: String,

    pub http: HttpLimits,

    pub time_policy: TimePolicy,

    /// Directory served under /assets and /js (env: STATIC_PATH)
    pub static_path: String,

    pub servers: Vec<ServerEntry>,
    pub heartbeats: Vec<HeartbeatTarget>,
    pub thresholds: Thresholds,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, MonitorError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| MonitorError::config(format!("{key} has unparseable value {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, MonitorError> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}

impl AppConfig {
    pub fn from_env() -> Result<Self, MonitorError> {
        let topology = load_topology(&env_string("CONFIG_PATH", "./monitoring.json"))?;

        let refresh_interval_seconds = match std::env::var("REFRESH_INTERVAL_SECONDS") {
            Ok(raw) => raw.trim().parse().map_err(|_| {
                MonitorError::config(format!(
                    "REFRESH_INTERVAL_SECONDS has unparseable value {raw:?}"
                ))
            })?,
            Err(_) => topology.refresh_interval_seconds.unwrap_or(5),
        };
        if refresh_interval_seconds < 1 {
            return Err(MonitorError::config(
                "REFRESH_INTERVAL_SECONDS must be at least 1",
            ));
        }

        let thresholds = topology.thresholds.unwrap_or_default();
        thresholds.validate()?;

        let time_policy = TimePolicy::new(
            &env_string("DEFAULT_TIMEZONE", "UTC"),
            !std::env::var("DISABLE_UTC_ENFORCEMENT")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        )?;

        let defaults = HttpLimits::default();
        let http = HttpLimits {
            max_conns_per_host: env_parse("HTTP_MAX_CONNS_PER_HOST", defaults.max_conns_per_host)?,
            max_idle_conns: env_parse("HTTP_MAX_IDLE_CONNS", defaults.max_idle_conns)?,
            max_idle_conns_per_host: env_parse(
                "HTTP_MAX_IDLE_CONNS_PER_HOST",
                defaults.max_idle_conns_per_host,
            )?,
            connect_timeout: env_secs("HTTP_CONNECT_TIMEOUT", defaults.connect_timeout)?,
            request_timeout: env_secs("HTTP_REQUEST_TIMEOUT", defaults.request_timeout)?,
            tls_handshake_timeout: env_secs(
                "HTTP_TLS_HANDSHAKE_TIMEOUT",
                defaults.tls_handshake_timeout,
            )?,
            max_response_bytes: env_parse("HTTP_MAX_RESPONSE_SIZE", defaults.max_response_bytes)?,
        };

        Ok(Self {
            port: env_parse("PORT", 3500)?,
            storage: StorageMode::from_env_value(&env_string("STORAGE", "file"))?,
            log_path: env_string("LOG_PATH", "./logs"),
            database_url: resolve_database_url()?,
            retention_days: env_parse("RETENTION_DAYS", 0)?,
            refresh_interval_seconds,
            downsample_max_points: env_parse("DOWNSAMPLE_MAX_POINTS", 500)?,
            default_table: "monitoring".to_string(),
            http,
            time_policy,
            static_path: env_string("STATIC_PATH", "./static"),
            servers: topology.servers,
            heartbeats: topology.heartbeats,
            thresholds,
        })
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }
}

/// Resolve the SQL DSN: `DATABASE_URL` wins, otherwise relational DSN parts
/// (`DB_HOST` etc.) assemble a Postgres URL, otherwise a local sqlite file.
fn resolve_database_url() -> Result<String, MonitorError> {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        let url = url.trim().to_string();
        if !url.starts_with("sqlite:") && !url.starts_with("postgres:") {
            return Err(MonitorError::config(format!(
                "DATABASE_URL must be a sqlite: or postgres: URL, got {url:?}"
            )));
        }
        return Ok(url);
    }

    if let Ok(host) = std::env::var("DB_HOST") {
        let port: u16 = env_parse("DB_PORT", 5432)?;
        let user = env_string("DB_USER", "postgres");
        let password = std::env::var("DB_PASSWORD").unwrap_or_default();
        let name = env_string("DB_NAME", "monitoring");
        let sslmode = env_string("DB_SSLMODE", "prefer");
        let auth = if password.is_empty() {
            user
        } else {
            format!("{user}:{password}")
        };
        return Ok(format!(
            "postgres://{auth}@{host}:{port}/{name}?sslmode={sslmode}"
        ));
    }

    Ok("sqlite://hostbeat.db".to_string())
}

fn load_topology(path: &str) -> Result<TopologyFile, MonitorError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path, "No topology file — running with defaults");
            return Ok(TopologyFile::default());
        }
        Err(e) => {
            return Err(MonitorError::config(format!(
                "failed to read topology file {path}: {e}"
            )))
        }
    };
    serde_json::from_str(&raw)
        .map_err(|e| MonitorError::config(format!("invalid topology file {path}: {e}")))
}

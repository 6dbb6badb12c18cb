use lifland_execution::{EngineConfig, DEFAULT_FUND_CREATES_PLAYER, DEFAULT_MAX_LOCK_ATTEMPTS};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::Level;
use url::Url;

pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SQLITE_PATH: &str = "/tmp/lifland.sqlite3";
pub const DEFAULT_SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POSTGRES_POOL_SIZE: usize = 8;
pub const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 64 * 1024;
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("postgres backend requires postgres_url")]
    MissingPostgresUrl,
    #[error("postgres_url must be a valid URL: {value}")]
    InvalidUrl { value: String },
}

/// Where the ledger rows live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    #[default]
    Sqlite,
    Postgres,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!(
                "unknown backend {other:?} (expected memory, sqlite or postgres)"
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other:?} (expected text or json)")),
        }
    }
}

/// Service configuration, read from an optional YAML file and overridden by
/// command-line flags.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,

    pub backend: BackendKind,
    pub sqlite_path: PathBuf,
    pub sqlite_busy_timeout_ms: u64,
    pub postgres_url: Option<String>,
    pub postgres_pool_size: usize,

    pub fund_creates_player: bool,
    pub max_lock_attempts: usize,

    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
    pub http_body_limit_bytes: Option<usize>,

    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST,
            port: DEFAULT_PORT,
            backend: BackendKind::default(),
            sqlite_path: PathBuf::from(DEFAULT_SQLITE_PATH),
            sqlite_busy_timeout_ms: DEFAULT_SQLITE_BUSY_TIMEOUT_MS,
            postgres_url: None,
            postgres_pool_size: DEFAULT_POSTGRES_POOL_SIZE,
            fund_creates_player: DEFAULT_FUND_CREATES_PLAYER,
            max_lock_attempts: DEFAULT_MAX_LOCK_ATTEMPTS,
            http_rate_limit_per_second: None,
            http_rate_limit_burst: None,
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_format: LogFormat::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log_level()?;
        ensure_nonzero("max_lock_attempts", self.max_lock_attempts as u64)?;
        ensure_nonzero("sqlite_busy_timeout_ms", self.sqlite_busy_timeout_ms)?;
        ensure_nonzero("postgres_pool_size", self.postgres_pool_size as u64)?;
        if self.backend == BackendKind::Postgres {
            let url = self
                .postgres_url
                .as_deref()
                .ok_or(ConfigError::MissingPostgresUrl)?;
            Url::parse(url).map_err(|_| ConfigError::InvalidUrl {
                value: redact_url(url),
            })?;
        }
        Ok(())
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
            value: self.log_level.clone(),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            fund_creates_player: self.fund_creates_player,
            max_lock_attempts: self.max_lock_attempts,
        }
    }

    pub fn sqlite_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.sqlite_busy_timeout_ms)
    }

    pub fn redacted_debug(&self) -> impl fmt::Debug + '_ {
        RedactedConfig(self)
    }
}

fn ensure_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

/// Replaces the password of a connection URL, if any.
pub fn redact_url(value: &str) -> String {
    match Url::parse(value) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        Ok(url) => url.to_string(),
        Err(_) => "<unparseable>".to_string(),
    }
}

struct RedactedConfig<'a>(&'a ServerConfig);

impl fmt::Debug for RedactedConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.0;
        f.debug_struct("ServerConfig")
            .field("host", &config.host)
            .field("port", &config.port)
            .field("backend", &config.backend)
            .field("sqlite_path", &config.sqlite_path)
            .field("sqlite_busy_timeout_ms", &config.sqlite_busy_timeout_ms)
            .field(
                "postgres_url",
                &config.postgres_url.as_deref().map(redact_url),
            )
            .field("postgres_pool_size", &config.postgres_pool_size)
            .field("fund_creates_player", &config.fund_creates_player)
            .field("max_lock_attempts", &config.max_lock_attempts)
            .field(
                "http_rate_limit_per_second",
                &config.http_rate_limit_per_second,
            )
            .field("http_rate_limit_burst", &config.http_rate_limit_burst)
            .field("http_body_limit_bytes", &config.http_body_limit_bytes)
            .field("log_level", &config.log_level)
            .field("log_format", &config.log_format)
            .finish()
    }
}

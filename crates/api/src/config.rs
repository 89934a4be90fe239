//! Application configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use domain::ConsistencyMode;
use projections::ProjectorConfig;
use read_model::CacheConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
/// - `DATABASE_URL`: selects the PostgreSQL stores when set
/// - `PROJECTOR_WORKERS`, `PROJECTOR_QUEUE_CAPACITY`, `PROJECTOR_MAX_ATTEMPTS`
/// - `CACHE_TTL_SECS`, `CACHE_CAPACITY`
/// - `PIPELINE_CONSISTENCY`: `inline` or `deferred` (default: `inline`)
/// - `PROJECTIONS_FILE`: JSON list of declarative projections
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub projector: ProjectorConfig,
    pub cache: CacheConfig,
    pub consistency: ConsistencyMode,
    pub projections_file: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source. Unparsable values
    /// fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let mut projector = defaults.projector;
        if let Some(workers) = parse(&lookup, "PROJECTOR_WORKERS") {
            projector.workers = workers;
        }
        if let Some(capacity) = parse(&lookup, "PROJECTOR_QUEUE_CAPACITY") {
            projector.queue_capacity = capacity;
        }
        if let Some(attempts) = parse(&lookup, "PROJECTOR_MAX_ATTEMPTS") {
            projector.retry.max_attempts = attempts;
        }

        let mut cache = defaults.cache;
        if let Some(secs) = parse(&lookup, "CACHE_TTL_SECS") {
            cache.ttl = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse(&lookup, "CACHE_CAPACITY") {
            cache.local_capacity = capacity;
        }

        let log_format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };
        let consistency = match lookup("PIPELINE_CONSISTENCY").as_deref().map(str::trim) {
            Some(m) if m.eq_ignore_ascii_case("deferred") => ConsistencyMode::Deferred,
            _ => ConsistencyMode::Inline,
        };

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format,
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            projector,
            cache,
            consistency,
            projections_file: lookup("PROJECTIONS_FILE")
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            projector: ProjectorConfig::default(),
            cache: CacheConfig::default(),
            consistency: ConsistencyMode::Inline,
            projections_file: None,
        }
    }
}

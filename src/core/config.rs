//! Configuration for the repair pipeline.
//!
//! Every option has a working default: a missing config file is not an
//! error. Environment overrides (`LOGMEND_*`) take precedence over the file.
//! The resolved [`Config`] is an explicit constructor input to the repair
//! manager; nothing in the core reads configuration ambiently.

use crate::core::error::MendError;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "logmend.toml";

/// Which persistence backend is in effect. A configuration choice, not a
/// runtime decision: mixing backends on the same session is forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BackendChoice {
    /// Backend A: in-place file rewrite with sidecar lock and backups.
    #[serde(rename = "file-atomic")]
    FileAtomic,
    /// Backend B: append-only repair events; the log file is never touched.
    #[serde(rename = "event-sourced")]
    EventSourced,
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendChoice::FileAtomic => write!(f, "file-atomic"),
            BackendChoice::EventSourced => write!(f, "event-sourced"),
        }
    }
}

impl BackendChoice {
    fn parse(s: &str) -> Result<Self, MendError> {
        match s {
            "file-atomic" => Ok(BackendChoice::FileAtomic),
            "event-sourced" => Ok(BackendChoice::EventSourced),
            other => Err(MendError::ConfigError(format!(
                "unknown backend '{}' (expected 'file-atomic' or 'event-sourced')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventStoreOptions {
    /// Location of the event store. For the SQLite-backed store this is a
    /// directory; the database file lives at `<endpoint>/<namespace>/<database>.db`.
    pub endpoint: PathBuf,
    /// Deployment-scoped namespace within the store.
    pub namespace: String,
    /// Database name scoped to this subsystem.
    pub database: String,
    /// Authentication material. Carried for backends that need it; the
    /// SQLite store ignores it.
    pub credentials: Option<String>,
}

impl Default for EventStoreOptions {
    fn default() -> Self {
        Self {
            endpoint: PathBuf::from(".logmend"),
            namespace: "logmend".to_string(),
            database: "repairs".to_string(),
            credentials: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaterializerOptions {
    /// View cache TTL in seconds.
    pub ttl_seconds: u64,
}

impl Default for MaterializerOptions {
    fn default() -> Self {
        Self { ttl_seconds: 300 }
    }
}

/// Weights for the text/time/session components of the suggester score.
/// The components are each normalized to [0, 1], so the weights must sum to
/// at most 1.0 to keep the combined score in range.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SuggesterWeights {
    pub text: f64,
    pub time: f64,
    pub session: f64,
}

impl Default for SuggesterWeights {
    fn default() -> Self {
        Self {
            text: 0.7,
            time: 0.2,
            session: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SuggesterOptions {
    /// Candidate count returned per orphan.
    pub top_k: usize,
    /// Minimum score for a candidate to surface.
    pub floor: f64,
    pub weights: SuggesterWeights,
}

impl Default for SuggesterOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            floor: 0.3,
            weights: SuggesterWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerOptions {
    /// Duplicate-id count at which a record is flagged `oom_risk`.
    pub oom_threshold: usize,
}

impl Default for ScannerOptions {
    fn default() -> Self {
        Self { oom_threshold: 100 }
    }
}

/// Resolved configuration for one pipeline run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendChoice,
    pub event_store: EventStoreOptions,
    pub materializer: MaterializerOptions,
    pub suggester: SuggesterOptions,
    pub scanner: ScannerOptions,
    /// Per-call timeout for event-store operations, in seconds.
    pub store_timeout_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendChoice::FileAtomic,
            event_store: EventStoreOptions::default(),
            materializer: MaterializerOptions::default(),
            suggester: SuggesterOptions::default(),
            scanner: ScannerOptions::default(),
            store_timeout_seconds: 30,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the TOML file (explicit path, or
    /// `logmend.toml` in the working directory when present), then
    /// `LOGMEND_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Config, MendError> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    MendError::ConfigError(format!("cannot read {}: {}", p.display(), e))
                })?;
                Self::from_toml(&raw)?
            }
            None => {
                let default_path = Path::new(CONFIG_FILE_NAME);
                if default_path.exists() {
                    let raw = std::fs::read_to_string(default_path)?;
                    Self::from_toml(&raw)?
                } else {
                    Config::default()
                }
            }
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Config, MendError> {
        toml::from_str(raw).map_err(|e| MendError::ConfigError(format!("invalid config: {}", e)))
    }

    /// Path of the SQLite database realizing the event-store namespace and
    /// database scoping.
    pub fn store_path(&self) -> PathBuf {
        self.event_store
            .endpoint
            .join(&self.event_store.namespace)
            .join(format!("{}.db", self.event_store.database))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_seconds)
    }

    fn apply_env(&mut self) -> Result<(), MendError> {
        if let Ok(v) = env::var("LOGMEND_BACKEND") {
            self.backend = BackendChoice::parse(v.trim())?;
        }
        if let Ok(v) = env::var("LOGMEND_EVENT_STORE_ENDPOINT") {
            self.event_store.endpoint = PathBuf::from(v);
        }
        if let Ok(v) = env::var("LOGMEND_EVENT_STORE_NAMESPACE") {
            self.event_store.namespace = v;
        }
        if let Ok(v) = env::var("LOGMEND_EVENT_STORE_DATABASE") {
            self.event_store.database = v;
        }
        if let Ok(v) = env::var("LOGMEND_EVENT_STORE_CREDENTIALS") {
            self.event_store.credentials = Some(v);
        }
        if let Ok(v) = env::var("LOGMEND_MATERIALIZER_TTL_SECONDS") {
            self.materializer.ttl_seconds = parse_env("LOGMEND_MATERIALIZER_TTL_SECONDS", &v)?;
        }
        if let Ok(v) = env::var("LOGMEND_SUGGESTER_TOP_K") {
            self.suggester.top_k = parse_env("LOGMEND_SUGGESTER_TOP_K", &v)?;
        }
        if let Ok(v) = env::var("LOGMEND_SUGGESTER_FLOOR") {
            self.suggester.floor = parse_env("LOGMEND_SUGGESTER_FLOOR", &v)?;
        }
        if let Ok(v) = env::var("LOGMEND_SCANNER_OOM_THRESHOLD") {
            self.scanner.oom_threshold = parse_env("LOGMEND_SCANNER_OOM_THRESHOLD", &v)?;
        }
        if let Ok(v) = env::var("LOGMEND_STORE_TIMEOUT_SECONDS") {
            self.store_timeout_seconds = parse_env("LOGMEND_STORE_TIMEOUT_SECONDS", &v)?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), MendError> {
        if !(0.0..=1.0).contains(&self.suggester.floor) {
            return Err(MendError::ConfigError(format!(
                "suggester.floor must be in [0, 1], got {}",
                self.suggester.floor
            )));
        }
        let w = self.suggester.weights;
        for (name, value) in [("text", w.text), ("time", w.time), ("session", w.session)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MendError::ConfigError(format!(
                    "suggester.weights.{} must be in [0, 1], got {}",
                    name, value
                )));
            }
        }
        if w.text + w.time + w.session > 1.0 + 1e-9 {
            return Err(MendError::ConfigError(
                "suggester weights must sum to at most 1.0".to_string(),
            ));
        }
        if self.suggester.top_k == 0 {
            return Err(MendError::ConfigError(
                "suggester.top_k must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, MendError> {
    raw.trim()
        .parse()
        .map_err(|_| MendError::ConfigError(format!("invalid value '{}' for {}", raw, name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.backend, BackendChoice::FileAtomic);
        assert_eq!(config.materializer.ttl_seconds, 300);
        assert_eq!(config.suggester.top_k, 5);
        assert_eq!(config.suggester.floor, 0.3);
        assert_eq!(config.scanner.oom_threshold, 100);
        assert_eq!(config.store_timeout_seconds, 30);
    }

    #[test]
    fn test_from_toml_partial_override() {
        let config = Config::from_toml(
            r#"
backend = "event-sourced"

[suggester]
top_k = 3

[event_store]
endpoint = "/var/lib/mend"
"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendChoice::EventSourced);
        assert_eq!(config.suggester.top_k, 3);
        // untouched options keep their defaults
        assert_eq!(config.suggester.floor, 0.3);
        assert_eq!(
            config.store_path(),
            PathBuf::from("/var/lib/mend/logmend/repairs.db")
        );
    }

    #[test]
    fn test_invalid_backend_rejected() {
        let err = Config::from_toml(r#"backend = "carrier-pigeon""#).unwrap_err();
        assert!(matches!(err, MendError::ConfigError(_)));
    }

    #[test]
    fn test_weight_sum_validated() {
        let mut config = Config::default();
        config.suggester.weights = SuggesterWeights {
            text: 0.8,
            time: 0.3,
            session: 0.1,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_display_round_trips() {
        for choice in [BackendChoice::FileAtomic, BackendChoice::EventSourced] {
            assert_eq!(BackendChoice::parse(&choice.to_string()).unwrap(), choice);
        }
    }
}

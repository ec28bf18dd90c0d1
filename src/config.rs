use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StatusError;

pub const DEFAULT_API_URL: &str = "http://localhost:3000";
pub const DEFAULT_FLOW_URL: &str = "http://localhost:1880";
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";
pub const DEFAULT_STORE_PATH: &str = ".status/tests.duckdb";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Client configuration. Every field has a local development default, so an
/// absent config file and an empty environment still produce a usable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the primary STATUS backend.
    pub api_url: String,
    /// Base URL of the flow-execution backend that runs mashups.
    pub flow_url: String,
    /// Session refresh endpoint, relative to `api_url` unless absolute.
    pub refresh_path: String,
    /// DuckDB file holding local mashup test history.
    pub store_path: PathBuf,
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            flow_url: DEFAULT_FLOW_URL.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `STATUS_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, StatusError> {
        let mut config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, StatusError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StatusError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, StatusError> {
        toml::from_str(content).map_err(|e| StatusError::Config(e.to_string()))
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("STATUS_API_URL") {
            self.api_url = url;
        }
        if let Some(url) = lookup("STATUS_FLOW_URL") {
            self.flow_url = url;
        }
        if let Some(path) = lookup("STATUS_REFRESH_PATH") {
            self.refresh_path = path;
        }
        if let Some(path) = lookup("STATUS_STORE_PATH") {
            self.store_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("STATUS_REQUEST_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.request_timeout_ms = ms,
                Err(_) => {
                    tracing::warn!(
                        "STATUS_REQUEST_TIMEOUT_MS={raw:?} is not a number, keeping {}ms",
                        self.request_timeout_ms
                    );
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), StatusError> {
        for (name, url) in [("api_url", &self.api_url), ("flow_url", &self.flow_url)] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(StatusError::Config(format!(
                    "{name} must be an http(s) URL, got {url:?}"
                )));
            }
        }
        if self.refresh_path.trim().is_empty() {
            return Err(StatusError::Config("refresh_path must not be empty".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(StatusError::Config(
                "request_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Absolute refresh URL. Both backends share it since the session cookie
    /// is issued by the primary backend.
    pub fn refresh_url(&self) -> String {
        join_url(&self.api_url, &self.refresh_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Join a base URL and a path; absolute `path` values are returned untouched.
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_are_local_development_values() {
        let config = Config::default();
        assert_eq!(config.api_url, "http://localhost:3000");
        assert_eq!(config.flow_url, "http://localhost:1880");
        assert_eq!(config.refresh_url(), "http://localhost:3000/auth/refresh");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config =
            Config::from_toml_str(r#"api_url = "https://status.example.com/api""#).unwrap();
        assert_eq!(config.api_url, "https://status.example.com/api");
        assert_eq!(config.flow_url, DEFAULT_FLOW_URL);
        assert_eq!(config.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    }

    #[test]
    fn env_overrides_win_over_file() {
        let mut config = Config::from_toml_str(r#"flow_url = "http://flows:1880""#).unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("STATUS_FLOW_URL", "https://flows.example.com"),
            ("STATUS_REQUEST_TIMEOUT_MS", "5000"),
            ("STATUS_STORE_PATH", "/tmp/status/tests.duckdb"),
        ]);
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.flow_url, "https://flows.example.com");
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.store_path, PathBuf::from("/tmp/status/tests.duckdb"));
    }

    #[test]
    fn bad_timeout_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|k| (k == "STATUS_REQUEST_TIMEOUT_MS").then(|| "soon".to_string()));
        assert_eq!(config.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let config = Config {
            api_url: "localhost:3000".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            request_timeout_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn mistyped_toml_is_a_config_error() {
        let err = Config::from_toml_str("api_url = 3").unwrap_err();
        assert!(matches!(err, StatusError::Config(_)));
    }

    #[test]
    fn join_url_handles_slashes_and_absolute_paths() {
        assert_eq!(join_url("http://a/", "/b"), "http://a/b");
        assert_eq!(join_url("http://a", "b"), "http://a/b");
        assert_eq!(join_url("http://a", "https://c/d"), "https://c/d");
    }
}

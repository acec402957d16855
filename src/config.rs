//! Persistent desktop configuration model and file-backed manager.

use gitlab_api::config::DEFAULT_HOST;
use gitlab_api::auth::{DEFAULT_REDIRECT_URI, DEFAULT_SCOPE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::pipelines::DEFAULT_WATCH_INTERVAL_SECS;
use crate::poll_guard::DEFAULT_MIN_INTERVAL_MS;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_redirect_uri() -> String {
    DEFAULT_REDIRECT_URI.to_string()
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

/// Application configuration persisted on disk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    /// Overrides the client id baked in at build time.
    pub client_id: Option<String>,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    pub poll_interval_ms: u64,
    pub activity_refresh_secs: u64,
    pub pipeline_watch_secs: u64,
    pub request_timeout_secs: u64,
    pub recent_limit: u32,
    pub custom_cert_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            client_id: None,
            redirect_uri: default_redirect_uri(),
            scope: default_scope(),
            poll_interval_ms: DEFAULT_MIN_INTERVAL_MS,
            activity_refresh_secs: 60,
            pipeline_watch_secs: DEFAULT_WATCH_INTERVAL_SECS,
            request_timeout_secs: 30,
            recent_limit: 20,
            custom_cert_path: None,
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn activity_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.activity_refresh_secs)
    }

    pub fn pipeline_watch_interval(&self) -> Duration {
        Duration::from_secs(self.pipeline_watch_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Replaces zero or blank values that would stall or break the loops.
pub fn normalize_config(mut config: Config) -> Config {
    let defaults = Config::default();
    if config.host.trim().is_empty() {
        config.host = defaults.host;
    }
    config.host = gitlab_api::normalize_host(&config.host);
    if config.redirect_uri.trim().is_empty() {
        config.redirect_uri = defaults.redirect_uri;
    }
    if config.scope.trim().is_empty() {
        config.scope = defaults.scope;
    }
    if config.activity_refresh_secs == 0 {
        config.activity_refresh_secs = 1;
    }
    if config.pipeline_watch_secs == 0 {
        config.pipeline_watch_secs = 1;
    }
    if config.request_timeout_secs == 0 {
        config.request_timeout_secs = defaults.request_timeout_secs;
    }
    config.recent_limit = config.recent_limit.clamp(1, 100);
    config.client_id = config
        .client_id
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    config.custom_cert_path = config
        .custom_cert_path
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    config
}

/// Loads and saves the configuration as JSON in the platform config directory.
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    /// Creates a manager bound to the platform-specific app config path.
    pub fn new() -> Result<Self, String> {
        let dirs = directories::ProjectDirs::from("com", "gitlab-tray", "gitlab-tray")
            .ok_or_else(|| "Could not determine config directory".to_string())?;
        Ok(Self {
            path: dirs.config_dir().join("config.json"),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Loads config from disk, falling back to defaults on read/parse errors.
    pub fn load(&self) -> Config {
        if self.path.exists() {
            let content = fs::read_to_string(&self.path).unwrap_or_default();
            serde_json::from_str(&content).unwrap_or_else(|err| {
                log::warn!("Ignoring unreadable config {}: {}", self.path.display(), err);
                Config::default()
            })
        } else {
            Config::default()
        }
    }

    pub fn save(&self, config: &Config) -> Result<(), std::io::Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "https://gitlab.com";
pub const DEFAULT_API_PREFIX: &str = "api/v4";
pub const DEFAULT_USER_AGENT: &str = "gitlab-tray";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Strips surrounding whitespace and trailing slashes from a host URL.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('/').to_string()
}

#[derive(Clone, Debug)]
pub struct GitlabConfig {
    pub host: String,
    pub api_prefix: String,
    pub token: String,
    pub custom_cert_path: Option<PathBuf>,
    pub user_agent: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl GitlabConfig {
    pub fn new(token: impl Into<String>, host: impl AsRef<str>) -> Self {
        Self {
            host: normalize_host(host.as_ref()),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            token: token.into(),
            custom_cert_path: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    pub fn with_custom_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.custom_cert_path = Some(path.into());
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }

    pub fn with_connect_timeout(mut self, duration: Duration) -> Self {
        self.connect_timeout = duration;
        self
    }

    pub fn api_root(&self) -> String {
        format!(
            "{}/{}/",
            self.host,
            self.api_prefix.trim_matches('/')
        )
    }
}

//! Error model used by GitLab API and OAuth client operations.

use std::io;

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GitlabError>;

/// Failure modes of a GitLab request. `Authentication` is the marker for an
/// expired or revoked access token; every other variant is a plain failure.
#[derive(Debug, Error)]
pub enum GitlabError {
    #[error("http {status}: {message}")]
    Http {
        status: StatusCode,
        code: Option<String>,
        message: String,
    },
    #[error("authentication error: {0}")]
    Authentication(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("certificate error: {0}")]
    Certificate(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected error: {0}")]
    Other(String),
}

impl GitlabError {
    /// Constructs an HTTP error variant with optional API-specific code.
    pub fn http(status: StatusCode, code: Option<String>, message: impl Into<String>) -> Self {
        GitlabError::Http {
            status,
            code,
            message: message.into(),
        }
    }

    /// True when the access token was rejected and a refresh may help.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, GitlabError::Authentication(_))
    }
}

impl From<reqwest::Error> for GitlabError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GitlabError::Timeout(err.to_string())
        } else if err.is_status() {
            let status = err.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if status == StatusCode::UNAUTHORIZED {
                GitlabError::Authentication(err.to_string())
            } else {
                GitlabError::http(status, None, err.to_string())
            }
        } else if err.is_connect() {
            GitlabError::Network(err.to_string())
        } else if err.is_decode() {
            GitlabError::Serialization(err.to_string())
        } else {
            GitlabError::Other(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GitlabError {
    fn from(err: serde_json::Error) -> Self {
        GitlabError::Serialization(err.to_string())
    }
}

impl From<reqwest::header::InvalidHeaderValue> for GitlabError {
    fn from(err: reqwest::header::InvalidHeaderValue) -> Self {
        GitlabError::Other(format!("invalid header value: {err}"))
    }
}

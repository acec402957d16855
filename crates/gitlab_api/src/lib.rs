//! Typed GitLab REST and OAuth2 client crate used by the tray backend.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod models;

pub use auth::{OAuthClient, OAuthSettings, PkceChallenge, TokenPair, TokenResponse};
pub use client::{EventFilter, GitlabClient};
pub use config::{normalize_host, GitlabConfig};
pub use error::{GitlabError, Result};
pub use reqwest::Url;
pub use models::{
    CurrentUser, Event, EventNote, Namespace, Pipeline, Project, PushData, PIPELINE_RUNNING,
    PIPELINE_SUCCESS,
};

use gitlab_api::GitlabError;
use thiserror::Error;

/// Errors surfaced by the session coordinator and the components built on it.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error("no sign-in in progress")]
    NoPendingLogin,
    #[error("could not log in: {0}")]
    LoginFailed(String),
    #[error("session refresh failed, please sign in again: {0}")]
    RefreshFailed(String),
    #[error("credential store error: {0}")]
    Store(String),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Api(#[from] GitlabError),
}

impl SessionError {
    /// True for failures that end with the user having to sign in again.
    pub fn requires_sign_in(&self) -> bool {
        matches!(
            self,
            SessionError::NotAuthenticated
                | SessionError::LoginFailed(_)
                | SessionError::RefreshFailed(_)
        )
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

//! User models returned by GitLab identity endpoints.

use serde::Deserialize;

/// Payload of `GET /user`. Fields stay optional so a malformed or
/// error-shaped body deserializes and can be rejected by [`CurrentUser::is_valid`].
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CurrentUser {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
}

impl CurrentUser {
    /// A usable profile carries both an id and a non-empty username.
    pub fn is_valid(&self) -> bool {
        self.id.is_some()
            && self
                .username
                .as_deref()
                .map(|name| !name.trim().is_empty())
                .unwrap_or(false)
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| self.username.clone())
            .unwrap_or_default()
    }
}

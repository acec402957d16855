//! Bookmarked projects, persisted as a JSON list next to the session keys.

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};
use crate::secrets::{CredentialStore, StoreKey};
use crate::session::SessionManager;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Bookmark {
    pub project_id: u64,
    pub name: String,
    pub path_with_namespace: String,
    #[serde(default)]
    pub web_url: Option<String>,
}

#[derive(Clone)]
pub struct Bookmarks {
    session: SessionManager,
}

impl Bookmarks {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }

    fn store(&self) -> &CredentialStore {
        self.session.store()
    }

    /// Stored bookmarks; an unreadable list counts as empty.
    pub fn list(&self) -> SessionResult<Vec<Bookmark>> {
        let raw = self
            .store()
            .get(StoreKey::Bookmarks)
            .map_err(SessionError::Store)?;
        Ok(raw
            .and_then(|value| serde_json::from_str(&value).ok())
            .unwrap_or_default())
    }

    /// Resolves the project and appends it. Already bookmarked projects are
    /// returned as-is without a network call.
    pub async fn add(&self, project_id: u64) -> SessionResult<Bookmark> {
        let mut bookmarks = self.list()?;
        if let Some(existing) = bookmarks.iter().find(|bookmark| bookmark.project_id == project_id) {
            return Ok(existing.clone());
        }

        let project = self
            .session
            .with_auth_retry(move |client| async move { client.project(project_id).await })
            .await?;
        let bookmark = Bookmark {
            project_id: project.id,
            name: project.name,
            path_with_namespace: project.path_with_namespace,
            web_url: project.web_url,
        };
        info!("Bookmarked {}", bookmark.path_with_namespace);
        bookmarks.push(bookmark.clone());
        self.save(&bookmarks)?;
        Ok(bookmark)
    }

    /// Returns whether anything was removed.
    pub fn remove(&self, project_id: u64) -> SessionResult<bool> {
        let mut bookmarks = self.list()?;
        let before = bookmarks.len();
        bookmarks.retain(|bookmark| bookmark.project_id != project_id);
        if bookmarks.len() == before {
            return Ok(false);
        }
        self.save(&bookmarks)?;
        Ok(true)
    }

    fn save(&self, bookmarks: &[Bookmark]) -> SessionResult<()> {
        let payload = serde_json::to_string(bookmarks)
            .map_err(|err| SessionError::Store(err.to_string()))?;
        self.store()
            .set(StoreKey::Bookmarks, &payload)
            .map_err(SessionError::Store)
    }
}

//! Panel-facing DTOs and conversion helpers.
//!
//! These are the serialized shapes the panel renders; the native API models
//! never leave the backend.

use chrono::{DateTime, Utc};
use gitlab_api::{CurrentUser, Event};
use serde::Serialize;

const SHORT_SHA_LEN: usize = 8;
const COMMENT_PREVIEW_CHARS: usize = 140;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub id: u64,
    pub username: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub web_url: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CommitItem {
    pub project_id: u64,
    pub sha: String,
    pub short_sha: String,
    pub title: String,
    pub ref_name: Option<String>,
    pub created_at: Option<String>,
    pub pipeline_id: Option<u64>,
    pub pipeline_status: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CommentItem {
    pub id: u64,
    pub project_id: Option<u64>,
    pub body: String,
    pub noteable_type: Option<String>,
    pub target_title: Option<String>,
    pub created_at: Option<String>,
}

/// Everything the panel shows at once.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivitySnapshot {
    pub user: Option<UserSummary>,
    pub commits: Vec<CommitItem>,
    pub comments: Vec<CommentItem>,
}

pub fn convert_user(user: CurrentUser) -> Option<UserSummary> {
    if !user.is_valid() {
        return None;
    }
    let name = user.display_name();
    Some(UserSummary {
        id: user.id?,
        username: user.username?,
        name,
        avatar_url: user.avatar_url,
        web_url: user.web_url,
    })
}

pub fn convert_commit(event: &Event) -> Option<CommitItem> {
    let project_id = event.project_id?;
    let (sha, push) = event.pushed_commit()?;
    Some(CommitItem {
        project_id,
        sha: sha.to_string(),
        short_sha: sha.chars().take(SHORT_SHA_LEN).collect(),
        title: push
            .commit_title
            .clone()
            .unwrap_or_else(|| "(no commit message)".to_string()),
        ref_name: push.ref_name.clone(),
        created_at: event.created_at.clone(),
        pipeline_id: None,
        pipeline_status: None,
    })
}

pub fn convert_comment(event: &Event) -> Option<CommentItem> {
    let note = event.note.as_ref()?;
    let body = note.body.as_deref().unwrap_or_default();
    Some(CommentItem {
        id: note.id,
        project_id: event.project_id,
        body: crate::truncate_text(&crate::collapse_whitespace(body), COMMENT_PREVIEW_CHARS),
        noteable_type: note.noteable_type.clone(),
        target_title: event.target_title.clone(),
        created_at: event.created_at.clone(),
    })
}

/// Short "time ago" label for an RFC 3339 timestamp.
pub fn relative_time(timestamp: &str, now: DateTime<Utc>) -> Option<String> {
    let then = DateTime::parse_from_rfc3339(timestamp).ok()?.with_timezone(&Utc);
    let seconds = now.signed_duration_since(then).num_seconds().max(0);
    let label = match seconds {
        0..=59 => "just now".to_string(),
        60..=3_599 => format!("{}m ago", seconds / 60),
        3_600..=86_399 => format!("{}h ago", seconds / 3_600),
        _ => format!("{}d ago", seconds / 86_400),
    };
    Some(label)
}

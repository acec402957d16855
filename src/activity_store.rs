//! In-memory activity cache read by the panel.

use crate::bridge::{ActivitySnapshot, CommentItem, CommitItem, UserSummary};
use std::sync::{Arc, Mutex, MutexGuard};

/// Thread-safe store for the latest fetched activity. Each poll source
/// replaces only its own slice.
#[derive(Clone, Default)]
pub struct ActivityStore {
    snapshot: Arc<Mutex<ActivitySnapshot>>,
}

impl ActivityStore {
    fn lock(&self) -> MutexGuard<'_, ActivitySnapshot> {
        self.snapshot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_user(&self, user: Option<UserSummary>) {
        self.lock().user = user;
    }

    pub fn set_commits(&self, commits: Vec<CommitItem>) {
        self.lock().commits = commits;
    }

    pub fn set_comments(&self, comments: Vec<CommentItem>) {
        self.lock().comments = comments;
    }

    /// Records a pipeline status change on every commit that points at it.
    pub fn update_pipeline_status(&self, pipeline_id: u64, status: &str) {
        for commit in self
            .lock()
            .commits
            .iter_mut()
            .filter(|commit| commit.pipeline_id == Some(pipeline_id))
        {
            commit.pipeline_status = Some(status.to_string());
        }
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        self.lock().clone()
    }

    pub fn clear(&self) {
        *self.lock() = ActivitySnapshot::default();
    }
}

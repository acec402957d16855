//! Guarded refreshes of the activity the panel shows.
//!
//! Every source goes through its [`PollGuard`](crate::poll_guard::PollGuard):
//! a call that lands inside the debounce window, or while the previous run
//! is still in flight, returns [`PollOutcome::Skipped`] without touching the
//! network.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};

use crate::activity_store::ActivityStore;
use crate::bridge::{convert_comment, convert_commit, convert_user, CommitItem};
use crate::error::{SessionError, SessionResult};
use crate::pipelines::{PipelineSubscription, PipelineWatcher};
use crate::poll_guard::PollGuard;
use crate::session::SessionManager;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Skipped,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub user: PollOutcome,
    pub commits: PollOutcome,
    pub comments: PollOutcome,
}

#[derive(Clone)]
pub struct ActivityPoller {
    session: SessionManager,
    activity: ActivityStore,
    watcher: PipelineWatcher,
    recent_limit: u32,
    timeout: Duration,
}

impl ActivityPoller {
    pub fn new(
        session: SessionManager,
        activity: ActivityStore,
        watcher: PipelineWatcher,
        recent_limit: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            session,
            activity,
            watcher,
            recent_limit,
            timeout,
        }
    }

    pub fn activity(&self) -> &ActivityStore {
        &self.activity
    }

    /// Runs the three sources concurrently; each keeps its own guard.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let (user, commits, comments) = tokio::join!(
            self.refresh_user(),
            self.refresh_commits(),
            self.refresh_comments()
        );
        RefreshSummary {
            user,
            commits,
            comments,
        }
    }

    pub async fn refresh_user(&self) -> PollOutcome {
        let guard = &self.session.guards().user;
        self.guarded(guard, async {
            let user = self
                .session
                .with_auth_retry(|client| async move { client.current_user().await })
                .await?;
            self.activity.set_user(convert_user(user));
            Ok(())
        })
        .await
    }

    /// Fetches recent pushes, resolves each head commit's latest pipeline and
    /// hands running ones to the pipeline watcher.
    pub async fn refresh_commits(&self) -> PollOutcome {
        let guard = &self.session.guards().commits;
        self.guarded(guard, async {
            let user_id = self.user_id()?;
            let limit = self.recent_limit;
            let events = self
                .session
                .with_auth_retry(move |client| async move {
                    client.recent_commits(user_id, limit).await
                })
                .await?;

            let mut seen = HashSet::new();
            let mut commits = Vec::new();
            for mut commit in events.iter().filter_map(convert_commit) {
                if !seen.insert((commit.project_id, commit.sha.clone())) {
                    continue;
                }
                self.attach_pipeline(&mut commit).await?;
                commits.push(commit);
            }
            self.activity.set_commits(commits);
            Ok(())
        })
        .await
    }

    pub async fn refresh_comments(&self) -> PollOutcome {
        let guard = &self.session.guards().comments;
        self.guarded(guard, async {
            let user_id = self.user_id()?;
            let limit = self.recent_limit;
            let events = self
                .session
                .with_auth_retry(move |client| async move {
                    client.recent_comments(user_id, limit).await
                })
                .await?;
            self.activity
                .set_comments(events.iter().filter_map(convert_comment).collect());
            Ok(())
        })
        .await
    }

    /// Pipeline lookups are best effort; only a lost session aborts the run.
    async fn attach_pipeline(&self, commit: &mut CommitItem) -> SessionResult<()> {
        let project_id = commit.project_id;
        let sha = commit.sha.clone();
        let result = self
            .session
            .with_auth_retry(|client| {
                let sha = sha.clone();
                async move { client.latest_commit_pipeline(project_id, &sha).await }
            })
            .await;

        let pipeline = match result {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => return Ok(()),
            Err(err) if err.requires_sign_in() => return Err(err),
            Err(err) => {
                debug!("No pipeline for {}: {}", commit.short_sha, err);
                return Ok(());
            }
        };

        if pipeline.is_running() {
            self.watcher.subscribe(PipelineSubscription {
                project_id,
                pipeline_id: pipeline.id,
                commit_title: commit.title.clone(),
            });
        }
        commit.pipeline_id = Some(pipeline.id);
        commit.pipeline_status = Some(pipeline.status);
        Ok(())
    }

    fn user_id(&self) -> SessionResult<u64> {
        self.session
            .profile()?
            .map(|profile| profile.user_id)
            .ok_or(SessionError::NotAuthenticated)
    }

    async fn guarded<F>(&self, guard: &PollGuard, run: F) -> PollOutcome
    where
        F: Future<Output = SessionResult<()>>,
    {
        if !self.session.is_authenticated() {
            return PollOutcome::Skipped;
        }
        let Some(_ticket) = guard.try_begin() else {
            debug!("Skipping {} refresh", guard.name());
            return PollOutcome::Skipped;
        };

        let result = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(self.timeout)),
        };

        match result {
            Ok(()) => PollOutcome::Completed,
            Err(err) => {
                warn!("Failed to refresh {}: {}", guard.name(), err);
                if err.requires_sign_in() {
                    self.activity.clear();
                }
                PollOutcome::Failed(err.to_string())
            }
        }
    }
}

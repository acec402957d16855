//! Watch loop for CI pipelines that were running when last seen.
//!
//! The loop only exists while something is subscribed: the first
//! subscription spawns it and it ends itself once the set drains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use gitlab_api::PIPELINE_SUCCESS;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::activity_store::ActivityStore;
use crate::events::EventSink;
use crate::session::SessionManager;

pub const DEFAULT_WATCH_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSubscription {
    pub project_id: u64,
    pub pipeline_id: u64,
    pub commit_title: String,
}

/// Label used in notifications for a terminal pipeline status.
pub fn describe_status(status: &str) -> &str {
    if status == PIPELINE_SUCCESS {
        "succeeded"
    } else {
        status
    }
}

#[derive(Clone)]
pub struct PipelineWatcher {
    inner: Arc<WatcherInner>,
}

struct WatcherInner {
    session: SessionManager,
    activity: ActivityStore,
    events: EventSink,
    interval: Duration,
    /// Keyed by pipeline id. Lock before `task` when both are needed.
    subscriptions: Mutex<HashMap<u64, PipelineSubscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PipelineWatcher {
    pub fn new(
        session: SessionManager,
        activity: ActivityStore,
        events: EventSink,
        interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                session,
                activity,
                events,
                interval,
                subscriptions: Mutex::new(HashMap::new()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Adds a pipeline to the watch set and starts the loop if it is idle.
    /// Returns `false` when the pipeline is already watched.
    pub fn subscribe(&self, subscription: PipelineSubscription) -> bool {
        {
            let mut subscriptions = lock(&self.inner.subscriptions);
            if subscriptions.contains_key(&subscription.pipeline_id) {
                return false;
            }
            debug!(
                "Watching pipeline {} of project {}",
                subscription.pipeline_id, subscription.project_id
            );
            subscriptions.insert(subscription.pipeline_id, subscription);
        }
        self.ensure_running();
        true
    }

    pub fn subscriptions(&self) -> Vec<PipelineSubscription> {
        let mut subscriptions: Vec<_> = lock(&self.inner.subscriptions).values().cloned().collect();
        subscriptions.sort_by_key(|subscription| subscription.pipeline_id);
        subscriptions
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner.subscriptions).is_empty()
    }

    /// True while the background loop is alive.
    pub fn is_watching(&self) -> bool {
        lock(&self.inner.task)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Drops every subscription and cancels the loop.
    pub fn stop(&self) {
        let mut subscriptions = lock(&self.inner.subscriptions);
        subscriptions.clear();
        if let Some(handle) = lock(&self.inner.task).take() {
            handle.abort();
        }
    }

    /// Checks every subscribed pipeline once. Pipelines that left `running`
    /// are announced and unsubscribed; the loop is cancelled when none remain.
    /// Returns the number of pipelines that finished.
    pub async fn tick(&self) -> usize {
        let finished = self.poll_subscriptions().await;
        self.stop_if_idle();
        finished
    }

    async fn poll_subscriptions(&self) -> usize {
        let mut finished = 0;
        for subscription in self.subscriptions() {
            let project_id = subscription.project_id;
            let pipeline_id = subscription.pipeline_id;
            let result = self
                .inner
                .session
                .with_auth_retry(move |client| async move {
                    client.pipeline(project_id, pipeline_id).await
                })
                .await;

            match result {
                Ok(pipeline) if pipeline.is_running() => {}
                Ok(pipeline) => {
                    if lock(&self.inner.subscriptions).remove(&pipeline_id).is_none() {
                        continue;
                    }
                    finished += 1;
                    info!("Pipeline {} finished: {}", pipeline_id, pipeline.status);
                    self.inner
                        .activity
                        .update_pipeline_status(pipeline_id, &pipeline.status);
                    self.inner.events.notify(
                        format!("Pipeline {}", describe_status(&pipeline.status)),
                        subscription.commit_title.clone(),
                    );
                }
                Err(err) if err.requires_sign_in() => {
                    warn!("Pipeline watch stopped: {}", err);
                    lock(&self.inner.subscriptions).clear();
                    break;
                }
                Err(err) => {
                    warn!("Failed to check pipeline {}: {}", pipeline_id, err);
                }
            }
        }
        finished
    }

    fn ensure_running(&self) {
        let mut task = lock(&self.inner.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let watcher = self.clone();
        *task = Some(tokio::spawn(async move { watcher.run().await }));
    }

    async fn run(self) {
        let period = self.inner.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_subscriptions().await;
            if self.stop_if_idle() {
                debug!("Pipeline watch loop idle, exiting");
                break;
            }
        }
    }

    /// Clears the loop handle when nothing is subscribed.
    fn stop_if_idle(&self) -> bool {
        let subscriptions = lock(&self.inner.subscriptions);
        if !subscriptions.is_empty() {
            return false;
        }
        if let Some(handle) = lock(&self.inner.task).take() {
            handle.abort();
        }
        true
    }
}

//! Debounce guards for polled data sources.
//!
//! A guard admits a run only when no run is in flight and the minimum
//! interval has elapsed since the previous run finished. Refused calls are
//! silent no-ops.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_MIN_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Default)]
struct GuardState {
    in_progress: bool,
    last_run: Option<Instant>,
    /// Bumped by `reset`; a ticket from an older generation must not stamp `last_run`.
    generation: u64,
}

/// Thread-safe "last run + in progress" pair for one data source.
#[derive(Clone, Debug)]
pub struct PollGuard {
    name: &'static str,
    min_interval: Duration,
    state: Arc<Mutex<GuardState>>,
}

impl PollGuard {
    pub fn new(name: &'static str, min_interval: Duration) -> Self {
        Self {
            name,
            min_interval,
            state: Arc::new(Mutex::new(GuardState::default())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims the guard. Returns `None` while a run is in flight or the
    /// interval since the last run has not elapsed.
    pub fn try_begin(&self) -> Option<PollTicket> {
        let now = Instant::now();
        let mut state = self.lock();
        if state.in_progress {
            return None;
        }
        if let Some(last) = state.last_run {
            if now.saturating_duration_since(last) < self.min_interval {
                return None;
            }
        }
        state.in_progress = true;
        Some(PollTicket {
            guard: self.clone(),
            generation: state.generation,
        })
    }

    /// Makes the guard eligible immediately, even if a run is in flight.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.last_run = None;
        state.generation = state.generation.wrapping_add(1);
    }

    pub fn is_in_progress(&self) -> bool {
        self.lock().in_progress
    }

    pub fn is_eligible(&self) -> bool {
        let state = self.lock();
        !state.in_progress
            && state
                .last_run
                .map(|last| Instant::now().saturating_duration_since(last) >= self.min_interval)
                .unwrap_or(true)
    }

    fn finish(&self, generation: u64) {
        let mut state = self.lock();
        state.in_progress = false;
        if state.generation == generation {
            state.last_run = Some(Instant::now());
        }
    }
}

/// Proof of a claimed guard. Dropping it ends the run, so a cancelled or
/// timed-out future releases the guard too.
#[must_use = "dropping the ticket ends the guarded run immediately"]
#[derive(Debug)]
pub struct PollTicket {
    guard: PollGuard,
    generation: u64,
}

impl Drop for PollTicket {
    fn drop(&mut self) {
        self.guard.finish(self.generation);
    }
}

/// The independently guarded activity sources.
#[derive(Clone, Debug)]
pub struct PollGuards {
    pub user: PollGuard,
    pub commits: PollGuard,
    pub comments: PollGuard,
}

impl PollGuards {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            user: PollGuard::new("user", min_interval),
            commits: PollGuard::new("commits", min_interval),
            comments: PollGuard::new("comments", min_interval),
        }
    }

    pub fn reset_all(&self) {
        self.user.reset();
        self.commits.reset();
        self.comments.reset();
    }
}

impl Default for PollGuards {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_MIN_INTERVAL_MS))
    }
}

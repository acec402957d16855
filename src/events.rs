//! Events raised by background components and consumed by the main loop.

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// User-facing notification (pipeline finished, ...).
    Notification { title: String, body: String },
    /// A session was verified and the first full data refresh should run.
    SessionStarted { username: String },
    /// Sign-in is required again; the session is gone.
    SignInRequired { reason: String },
    /// The process must restart (hard logout, certificate change).
    RestartRequested { reason: String },
}

/// Cloneable sending half. Sending never fails the caller: once the main
/// loop is gone there is nobody left to notify.
#[derive(Clone)]
pub struct EventSink {
    sender: UnboundedSender<AppEvent>,
}

impl EventSink {
    pub fn emit(&self, event: AppEvent) {
        if self.sender.send(event).is_err() {
            log::debug!("Event dropped: receiver closed");
        }
    }

    pub fn notify(&self, title: impl Into<String>, body: impl Into<String>) {
        self.emit(AppEvent::Notification {
            title: title.into(),
            body: body.into(),
        });
    }
}

pub fn event_channel() -> (EventSink, UnboundedReceiver<AppEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventSink { sender }, receiver)
}

//! Observable session events for the UI collaborator.
//!
//! The core never renders anything. Every state transition, progress
//! update and user-facing notification is published on an [`EventBus`]
//! backed by a tokio broadcast channel; the UI subscribes and renders.
//!
//! Notifications follow one rule: each terminal state yields exactly one
//! terminal notification, and each mid-flight fallback yields one
//! informational notice that is *not* terminal, so the user reads
//! "retrying with a different engine" instead of a false failure.

use crate::catalog::{OperationFamily, TechnologyId};
use crate::error::FailureReason;
use crate::session::{SessionId, Transition};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

/// A boxed stream of session events.
pub type SessionEventStream = Pin<Box<dyn Stream<Item = SessionEvent> + Send>>;

/// Everything the UI can observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Transition(Transition),
    Progress(ProgressUpdate),
    Notice(Notification),
}

impl SessionEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionEvent::Transition(t) => t.session_id,
            SessionEvent::Progress(p) => p.session_id,
            SessionEvent::Notice(n) => n.session_id,
        }
    }
}

/// Progress reading for one session.
///
/// `upload_percent` is derived from bytes sent. `processing_percent` is a
/// time-based estimate (see [`crate::progress::ProcessingEstimate`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub session_id: SessionId,
    pub family: OperationFamily,
    pub upload_percent: u8,
    pub processing_percent: u8,
    pub attempt_index: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    /// Non-blocking information (fallback to another engine).
    Info,
    Success,
    Error,
    Cancelled,
}

/// A user-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub session_id: SessionId,
    pub family: OperationFamily,
    pub level: NoticeLevel,
    /// `true` for the single notification that ends a session.
    pub terminal: bool,
    pub message: String,
    pub technology: Option<TechnologyId>,
    pub reason: Option<FailureReason>,
    pub attempts: usize,
}

/// In-process fan-out of [`SessionEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Raw broadcast receiver; callers handle `Lagged` themselves.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Stream of events from now on. Events dropped because the subscriber
    /// fell behind are logged and skipped.
    pub fn stream(&self) -> SessionEventStream {
        let s = BroadcastStream::new(self.tx.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Event subscriber lagging: {}", e);
                None
            }
        });
        Box::pin(s)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(id: SessionId) -> SessionEvent {
        SessionEvent::Notice(Notification {
            session_id: id,
            family: OperationFamily::new("merge").unwrap(),
            level: NoticeLevel::Info,
            terminal: false,
            message: "retrying".into(),
            technology: None,
            reason: None,
            attempts: 1,
        })
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBus::new(4);
        bus.publish(notice(SessionId::new_v4()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stream_delivers_published_events() {
        let bus = EventBus::new(16);
        let mut stream = bus.stream();
        let id = SessionId::new_v4();
        bus.publish(notice(id));
        let event = stream.next().await.expect("event");
        assert_eq!(event.session_id(), id);
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new(16);
        bus.publish(notice(SessionId::new_v4()));
        let mut stream = bus.stream();
        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());
    }

    #[test]
    fn event_serialises_with_tag() {
        let json = serde_json::to_value(notice(SessionId::new_v4())).unwrap();
        assert_eq!(json["event"], "notice");
        assert_eq!(json["level"], "info");
    }
}

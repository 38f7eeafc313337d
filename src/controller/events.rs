//! Kubernetes Event emission for rollout observability
//!
//! Production code uses `KubeEventRecorder`, which publishes `events.k8s.io`
//! Events attributed to the Rollout. Tests use `MockEventRecorder`, which keeps
//! events in memory for assertions.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};

/// Severity of a rollout event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLevel {
    Normal,
    Warning,
}

/// An event about a Rollout, independent of the Kubernetes Event wire type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutEvent {
    pub level: EventLevel,
    /// Short CamelCase reason, e.g. "ScaleFailed"
    pub reason: String,
    /// Human-readable note
    pub note: String,
    /// What the controller was doing, e.g. "Scale"
    pub action: String,
}

impl RolloutEvent {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        RolloutEvent {
            level: EventLevel::Normal,
            reason: reason.to_string(),
            note: note.into(),
            action: action.to_string(),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        RolloutEvent {
            level: EventLevel::Warning,
            reason: reason.to_string(),
            note: note.into(),
            action: action.to_string(),
        }
    }
}

/// Sink for rollout events
///
/// Publishing is best effort: implementations log failures instead of
/// returning them, so an unavailable event API never fails a reconcile.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn publish(&self, regarding: &ObjectReference, event: RolloutEvent);
}

/// Publishes events through the Kubernetes events API
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: kube::Client, controller_name: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance,
        };
        KubeEventRecorder {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, regarding: &ObjectReference, event: RolloutEvent) {
        let k8s_event = Event {
            type_: match event.level {
                EventLevel::Normal => EventType::Normal,
                EventLevel::Warning => EventType::Warning,
            },
            reason: event.reason.clone(),
            note: Some(truncate_note(event.note.clone())),
            action: event.action.clone(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&k8s_event, regarding).await {
            tracing::warn!(
                error = %e,
                reason = %event.reason,
                object = ?regarding.name,
                "Failed to publish Kubernetes event (non-fatal)"
            );
        }
    }
}

/// Event notes are limited to 1024 bytes by the API server
fn truncate_note(mut note: String) -> String {
    const MAX_NOTE_BYTES: usize = 1024;
    if note.len() > MAX_NOTE_BYTES {
        let mut end = MAX_NOTE_BYTES - '…'.len_utf8();
        while !note.is_char_boundary(end) {
            end -= 1;
        }
        note.truncate(end);
        note.push('…');
    }
    note
}

/// Mock recorder for testing - stores events in memory
#[cfg(test)]
#[derive(Default)]
pub struct MockEventRecorder {
    events: std::sync::Mutex<Vec<RolloutEvent>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RolloutEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventRecorder for MockEventRecorder {
    async fn publish(&self, _regarding: &ObjectReference, event: RolloutEvent) {
        #[allow(clippy::unwrap_used)]
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_note_keeps_short_notes() {
        assert_eq!(truncate_note("scaled".to_string()), "scaled");
    }

    #[test]
    fn test_truncate_note_limits_length_on_char_boundary() {
        let note = "é".repeat(700);
        let truncated = truncate_note(note);
        assert!(truncated.len() <= 1024);
        assert!(truncated.ends_with('…'));
    }

    #[tokio::test]
    async fn test_mock_recorder_collects_events() {
        let recorder = MockEventRecorder::new();
        let regarding = ObjectReference::default();

        recorder
            .publish(&regarding, RolloutEvent::warning("ScaleFailed", "Scale", "boom"))
            .await;
        recorder
            .publish(&regarding, RolloutEvent::normal("BatchAdvanced", "Rollout", "ok"))
            .await;

        assert_eq!(recorder.reasons(), vec!["ScaleFailed", "BatchAdvanced"]);
        assert_eq!(recorder.events()[0].level, EventLevel::Warning);
    }
}

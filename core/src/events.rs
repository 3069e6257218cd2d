use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Starting,
    Resuming,
    Running,
    Resolving,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Started,
    Completed,
    Failed,
}

/// Live progress for a turn. Purely informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Status {
        phase: TurnPhase,
    },
    ToolActivity {
        tool: String,
        state: ToolState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    OutputText {
        text: String,
    },
    Session {
        thread_id: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
    Warning {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub text: String,
    pub thread_id: Option<String>,
    pub conversation_id: Option<String>,
    pub events: Vec<ProgressEvent>,
    /// Set when no new session appeared and the single pre-existing one was
    /// reused instead.
    pub reused_session: bool,
}

/// Ordered record of the events emitted during a turn, optionally forwarded
/// to a live consumer. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    events: Arc<StdMutex<Vec<ProgressEvent>>>,
    forward: Option<UnboundedSender<ProgressEvent>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(forward: UnboundedSender<ProgressEvent>) -> Self {
        Self {
            events: Arc::default(),
            forward: Some(forward),
        }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(forward) = &self.forward {
            // A consumer that went away does not affect the turn.
            let _ = forward.send(event.clone());
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn status(&self, phase: TurnPhase) {
        self.emit(ProgressEvent::Status { phase });
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::Warning {
            message: message.into(),
        });
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ProgressEvent::ToolActivity {
            tool: "shell".to_string(),
            state: ToolState::Started,
            detail: None,
        };
        assert_eq!(
            serde_json::to_value(&event).expect("serialize"),
            serde_json::json!({ "type": "tool_activity", "tool": "shell", "state": "started" })
        );
    }

    #[tokio::test]
    async fn sink_records_and_forwards_in_order() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink::with_channel(tx);
        sink.status(TurnPhase::Starting);
        sink.warning("careful");

        assert_eq!(
            sink.events(),
            vec![
                ProgressEvent::Status {
                    phase: TurnPhase::Starting
                },
                ProgressEvent::Warning {
                    message: "careful".to_string()
                },
            ]
        );
        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::Status {
                phase: TurnPhase::Starting
            })
        );
    }

    #[test]
    fn closed_consumer_is_ignored() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let sink = EventSink::with_channel(tx);
        sink.status(TurnPhase::Completed);
        assert_eq!(sink.events().len(), 1);
    }
}

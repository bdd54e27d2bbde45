//! Events published on the scheduler's bus.
//!
//! Collaborators (the UI layer, the CLI) subscribe per session and render
//! whatever arrives; the engine never waits on subscribers. Serialized with
//! a `type` tag so the stream can cross a process boundary unchanged.

use serde::{Deserialize, Serialize};

use crate::model::FeatureStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// An agent run was launched for a work item.
    RunStarted { item_id: String },
    /// A run released its slot; `status` is the item's status afterwards.
    RunFinished {
        item_id: String,
        status: FeatureStatus,
    },
    /// A work item's persisted status changed.
    StatusChanged {
        item_id: String,
        status: FeatureStatus,
    },
    /// One line-level record from a running agent.
    Diagnostic {
        item_id: String,
        kind: String,
        content: String,
    },
    /// Nothing left to launch and nothing running. `unresolved` counts
    /// items still selectable whose session attempts ran out.
    BacklogDrained { unresolved: usize },
    /// The coordinator exited.
    SchedulerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_serialize_with_snake_case_tag() {
        let event = SchedulerEvent::RunStarted {
            item_id: "f-1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"run_started\""));
        assert!(json.contains("\"item_id\":\"f-1\""));
    }

    #[test]
    fn test_run_finished_carries_status() {
        let event = SchedulerEvent::RunFinished {
            item_id: "f-2".into(),
            status: FeatureStatus::WaitingApproval,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\":\"waiting_approval\""));

        let back: SchedulerEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            SchedulerEvent::RunFinished {
                status: FeatureStatus::WaitingApproval,
                ..
            }
        ));
    }

    #[test]
    fn test_backlog_drained_carries_unresolved_count() {
        let event = SchedulerEvent::BacklogDrained { unresolved: 2 };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"backlog_drained\""));
        assert!(json.contains("\"unresolved\":2"));
    }
}

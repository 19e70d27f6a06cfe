//! Actions received from the engine and lifecycle events sent back.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OutputError;

/// Classification of an assigned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    StartRun,
    CancelRun,
    StartDurable,
}

/// One unit of work assigned to this worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub tenant_id: String,
    pub worker_id: String,
    pub workflow_run_id: String,
    pub job_id: String,
    pub job_run_id: String,
    pub step_id: String,
    /// Task run id; together with `retry_count` forms the action key.
    pub step_run_id: String,
    /// Registered task name this action should execute.
    pub action_id: String,
    pub retry_count: i32,
    pub action_type: ActionType,
    #[serde(default)]
    pub action_payload: serde_json::Value,
    #[serde(default)]
    pub additional_metadata: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
}

impl Action {
    pub fn key(&self) -> ActionKey {
        ActionKey::new(self.step_run_id.clone(), self.retry_count)
    }
}

/// Disambiguates repeated deliveries of the same logical run after retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionKey {
    pub run_id: String,
    pub retry_count: i32,
}

impl ActionKey {
    pub fn new(run_id: impl Into<String>, retry_count: i32) -> Self {
        Self {
            run_id: run_id.into(),
            retry_count,
        }
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.retry_count)
    }
}

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionEventType {
    Started,
    Completed,
    Failed,
    CancellationConfirmed,
    CancellationFailed,
}

impl ActionEventType {
    /// At most one terminal event is emitted per action key.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::CancellationConfirmed
        )
    }
}

impl fmt::Display for ActionEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::CancellationConfirmed => "cancellation_confirmed",
            Self::CancellationFailed => "cancellation_failed",
        };
        write!(f, "{s}")
    }
}

/// Outbound lifecycle record for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub action: Action,
    pub event_type: ActionEventType,
    pub payload: serde_json::Value,
    pub should_not_retry: bool,
    pub event_timestamp: DateTime<Utc>,
}

impl ActionEvent {
    pub fn new(action: &Action, event_type: ActionEventType, payload: serde_json::Value) -> Self {
        Self {
            action: action.clone(),
            event_type,
            payload,
            should_not_retry: false,
            event_timestamp: Utc::now(),
        }
    }

    pub fn started(action: &Action) -> Self {
        Self::new(action, ActionEventType::Started, serde_json::Value::Null)
    }

    pub fn completed(action: &Action, output: serde_json::Value) -> Self {
        Self::new(action, ActionEventType::Completed, output)
    }

    pub fn failed(action: &Action, error: impl Into<String>, should_not_retry: bool) -> Self {
        Self {
            should_not_retry,
            ..Self::new(
                action,
                ActionEventType::Failed,
                serde_json::Value::String(error.into()),
            )
        }
    }

    /// The run returned, but its output breaks the output contract. Tagged so
    /// the engine can tell it apart from an application error.
    pub fn output_rejected(action: &Action, error: &OutputError) -> Self {
        Self {
            should_not_retry: true,
            ..Self::new(
                action,
                ActionEventType::Failed,
                serde_json::json!({
                    "kind": "output_contract",
                    "message": error.to_string(),
                }),
            )
        }
    }

    pub fn cancellation_confirmed(action: &Action) -> Self {
        Self::new(
            action,
            ActionEventType::CancellationConfirmed,
            serde_json::Value::Null,
        )
    }

    pub fn key(&self) -> ActionKey {
        self.action.key()
    }
}

#[cfg(test)]
pub(crate) fn test_action(run_id: &str, retry_count: i32, action_id: &str) -> Action {
    Action {
        tenant_id: "tenant".to_string(),
        worker_id: "worker".to_string(),
        workflow_run_id: format!("wf-{run_id}"),
        job_id: "job".to_string(),
        job_run_id: format!("job-{run_id}"),
        step_id: "step".to_string(),
        step_run_id: run_id.to_string(),
        action_id: action_id.to_string(),
        retry_count,
        action_type: ActionType::StartRun,
        action_payload: serde_json::json!({}),
        additional_metadata: serde_json::Value::Null,
        priority: 1,
    }
}

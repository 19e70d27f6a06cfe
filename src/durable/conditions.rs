//! Conditions a durable wait can be registered against.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A single wake-up condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitCondition {
    /// Wake once `duration_ms` has elapsed on the engine's clock.
    Sleep { duration_ms: u64 },
    /// Wake when an external event with `event_key` arrives, optionally
    /// filtered by an engine-side expression.
    UserEvent {
        event_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
    },
}

/// Conditions for one durable wait. The wait resolves when any condition fires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableConditions {
    pub conditions: Vec<WaitCondition>,
}

impl DurableConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleep(duration: Duration) -> Self {
        Self::new().or_sleep(duration)
    }

    pub fn user_event(event_key: impl Into<String>) -> Self {
        Self::new().or_user_event(event_key, None)
    }

    pub fn or_sleep(mut self, duration: Duration) -> Self {
        self.conditions.push(WaitCondition::Sleep {
            duration_ms: duration.as_millis() as u64,
        });
        self
    }

    pub fn or_user_event(mut self, event_key: impl Into<String>, expression: Option<String>) -> Self {
        self.conditions.push(WaitCondition::UserEvent {
            event_key: event_key.into(),
            expression,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn ok(type_: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::True,
            reason: type_.to_string(),
            message: String::new(),
            last_transition_time: None,
        }
    }

    pub fn failed(type_: &str, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: ConditionStatus::False,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Summary {
    #[default]
    InProgress,
    Completed,
    Error,
}

/// Reconcile status carried by role templates and role template bindings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub summary: Summary,
    #[serde(default)]
    pub observed_generation: u64,
}

impl ReconcileStatus {
    /// Replaces the condition of the same type. The transition time is kept
    /// when status, reason and message are unchanged.
    pub fn set_condition(&mut self, mut condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition.type_)
        {
            Some(existing) => {
                if existing.status == condition.status
                    && existing.reason == condition.reason
                    && existing.message == condition.message
                {
                    return;
                }
                condition.last_transition_time = Some(Utc::now());
                *existing = condition;
            }
            None => {
                condition.last_transition_time = Some(Utc::now());
                self.conditions.push(condition);
            }
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Completed when every condition is true, Error otherwise.
    pub fn summarize(&mut self) {
        self.summary = if self
            .conditions
            .iter()
            .all(|c| c.status == ConditionStatus::True)
        {
            Summary::Completed
        } else {
            Summary::Error
        };
    }

    /// Equality ignoring transition timestamps.
    pub fn same_state(&self, other: &ReconcileStatus) -> bool {
        self.summary == other.summary
            && self.observed_generation == other.observed_generation
            && self.conditions.len() == other.conditions.len()
            && self.conditions.iter().zip(&other.conditions).all(|(a, b)| {
                a.type_ == b.type_
                    && a.status == b.status
                    && a.reason == b.reason
                    && a.message == b.message
            })
    }
}

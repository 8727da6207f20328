//! Canonical event shapes at the platform boundary.
//!
//! The event ingest adapter normalizes whatever the managed platform emits
//! into these two shapes. Delivery is at-least-once and may be reordered
//! within a small window; the state cache and detector are written to
//! tolerate both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A state-change notification for one watched entity or automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    pub new_state: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// An execution-completion notification for one automation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub instance_id: String,
    pub automation_id: String,
    pub execution_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Everything the ingest channel carries.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    State(StateEvent),
    Execution(ExecutionEvent),
}

/// What kind of mismatch triggered a failure episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// An automation executed but the expected state never appeared.
    StateMismatch,
    /// A trigger fired but no corresponding execution was observed.
    ExecutionOutcomeMismatch,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::StateMismatch => write!(f, "state-mismatch"),
            FailureKind::ExecutionOutcomeMismatch => write!(f, "execution-outcome-mismatch"),
        }
    }
}

/// The command an automation originally issued, re-invoked by the entity
/// healer before any alternative variants are tried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Emitted by the failure detector when an episode should open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSignal {
    pub subject_id: String,
    /// Domain/category of the subject, e.g. "light" or "automation".
    pub category: String,
    pub kind: FailureKind,
    pub instance_id: String,
    /// Owning automation, when the subject is (or belongs to) one.
    pub automation_id: Option<String>,
    /// Execution event that was being validated, for deduplication.
    pub execution_id: Option<String>,
    /// Entity id → value we expected to observe.
    pub expected: HashMap<String, String>,
    /// Entity id → value actually observed at the deadline (None = unknown).
    pub observed: HashMap<String, Option<String>>,
    /// The command to re-issue first at entity level, when known.
    pub original_command: Option<CommandSpec>,
    pub detected_at: DateTime<Utc>,
}

impl FailureSignal {
    /// The entities the cascade should act on. Falls back to the subject
    /// itself when the signal carries no expected-state map.
    pub fn failed_entities(&self) -> Vec<String> {
        if self.expected.is_empty() {
            vec![self.subject_id.clone()]
        } else {
            let mut entities: Vec<String> = self.expected.keys().cloned().collect();
            entities.sort();
            entities
        }
    }
}

/// Category of a subject id, derived from the platform naming convention
/// ("light.living_room" → "light").
pub fn category_of(subject_id: &str) -> String {
    subject_id
        .split_once('.')
        .map(|(domain, _)| domain.to_string())
        .unwrap_or_else(|| subject_id.to_string())
}

/// Structured hand-off pushed to the alerting collaborator when a cascade
/// ends Escalated. Exactly one of these is produced per escalated episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub episode_id: Uuid,
    pub subject_ids: Vec<String>,
    pub attempts_tried: u32,
    pub last_error: Option<String>,
}

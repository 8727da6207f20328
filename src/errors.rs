use std::time::Duration;
use thiserror::Error;

/// The central error type for the Automedic engine.
///
/// Each variant maps to a distinct propagation policy: transport errors are
/// retryable within a strategy's bounds, breaker-open is a skip rather than
/// a failure, episode conflicts are dropped with a log, and store errors
/// degrade the control loop instead of crashing it.
#[derive(Error, Debug)]
pub enum AutomedicError {
    /// Command invocation against the platform failed or timed out.
    #[error("transport error invoking '{action}' on {target}: {detail}")]
    Transport {
        target: String,
        action: String,
        detail: String,
    },

    /// Circuit breaker or cooldown denied the attempt. Not retryable now.
    #[error("breaker open for {target}, retry after {retry_after:?}")]
    BreakerOpen {
        target: String,
        retry_after: Duration,
    },

    /// Expected state never arrived inside the validation window. This is a
    /// genuine failure signal, not a bug.
    #[error("expected state for {subject} did not converge within {window_secs}s")]
    ValidationTimeout { subject: String, window_secs: u64 },

    /// The subject already has an active cascade. The new signal is dropped.
    #[error("subject {subject} already has an active healing cascade")]
    EpisodeConflict { subject: String },

    /// Missing desired-state mapping, device registry entry, or invalid
    /// config. Fatal to the specific healer call only.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Durable store unavailable. Callers assume closed/first-seen and
    /// keep the control loop live.
    #[error("store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, AutomedicError>;

impl AutomedicError {
    /// Whether the same strategy may be retried after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AutomedicError::Transport { .. })
    }
}

//! Level Healers
//!
//! A closed set of healing levels ordered from narrowest to broadest blast
//! radius. Each level is a plain struct satisfying one trait; the
//! orchestrator dispatches through the trait, never through inheritance or
//! downcasting. Every internal strategy attempt is recorded as a
//! `RemediationAttempt` regardless of outcome, in the order it was tried.

pub mod device;
pub mod entity;
pub mod integration;

pub use device::DeviceHealer;
pub use entity::EntityHealer;
pub use integration::IntegrationHealer;

use crate::events::{CommandSpec, FailureKind};
use crate::patterns::{AttemptOutcome, ReliabilityAnalyzer, RemediationAttempt};
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

/// Healing levels, ordered by blast radius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealLevel {
    Entity,
    Device,
    Integration,
}

impl HealLevel {
    pub const ALL: [HealLevel; 3] = [HealLevel::Entity, HealLevel::Device, HealLevel::Integration];

    /// The next broader level, or None at integration level.
    pub fn broader(self) -> Option<HealLevel> {
        match self {
            HealLevel::Entity => Some(HealLevel::Device),
            HealLevel::Device => Some(HealLevel::Integration),
            HealLevel::Integration => None,
        }
    }
}

impl std::fmt::Display for HealLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealLevel::Entity => write!(f, "entity"),
            HealLevel::Device => write!(f, "device"),
            HealLevel::Integration => write!(f, "integration"),
        }
    }
}

/// Everything a healer needs to act on one failure episode.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub episode_id: Uuid,
    pub subject_id: String,
    pub instance_id: String,
    pub category: String,
    pub kind: FailureKind,
    /// Entities that failed to reach their expected state.
    pub entities: Vec<String>,
    /// The command the automation originally issued, when known.
    pub original_command: Option<CommandSpec>,
    pub expected: HashMap<String, String>,
}

/// Outcome of one level's `heal` call.
#[derive(Debug, Clone)]
pub struct HealingResult {
    pub success: bool,
    pub detail: String,
    /// Target ids this level could not resolve.
    pub unresolved: Vec<String>,
    /// Strategy attempts actually issued during this call.
    pub attempts: u32,
}

impl HealingResult {
    pub fn resolved(detail: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: true,
            detail: detail.into(),
            unresolved: Vec::new(),
            attempts,
        }
    }

    pub fn failed(detail: impl Into<String>, unresolved: Vec<String>, attempts: u32) -> Self {
        Self {
            success: false,
            detail: detail.into(),
            unresolved,
            attempts,
        }
    }
}

/// One remediation level. Implementations must be idempotent from the
/// caller's perspective: repeated calls with the same context are safe.
#[async_trait]
pub trait Healer: Send + Sync {
    fn level(&self) -> HealLevel;

    /// The breaker targets this level would act on for the given context.
    /// Consulted by the orchestrator before `heal` so denied targets can be
    /// excluded without ever reaching the healer.
    async fn targets(&self, ctx: &FailureContext) -> Vec<String>;

    /// Attempt remediation of the admitted targets. When routing matched a
    /// reliability pattern, `preferred` names the recorded strategy and the
    /// level tries it before its usual ladder order. Once `cancel` flips,
    /// no further strategy attempts may be issued; attempts already
    /// completed stay persisted.
    async fn heal(
        &self,
        ctx: &FailureContext,
        allowed: &[String],
        preferred: Option<&str>,
        cancel: &watch::Receiver<bool>,
    ) -> HealingResult;
}

/// Backoff modeled as data: a fixed delay schedule plus jitter, consumed by
/// the healer one entry per retry. Keeps cancellation and testing simple —
/// no recursive retry functions.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
    jitter: Duration,
}

impl RetrySchedule {
    pub fn new(delays_ms: &[u64], jitter_ms: u64) -> Self {
        Self {
            delays: delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            jitter: Duration::from_millis(jitter_ms),
        }
    }

    /// Number of attempts the schedule allows.
    pub fn attempts(&self) -> usize {
        self.delays.len()
    }

    /// Delay before the given attempt (0-based), with jitter applied.
    /// Zero-length base delays stay zero so first attempts are immediate.
    pub fn delay(&self, attempt: usize) -> Duration {
        let base = self.delays.get(attempt).copied().unwrap_or_default();
        if base.is_zero() || self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }
}

pub(crate) fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Build and persist one attempt record. Healers call this for every
/// strategy attempt, success or not, before moving to the next one, which
/// keeps the per-cascade attempt log in strict try order.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn record_attempt(
    analyzer: &ReliabilityAnalyzer,
    ctx: &FailureContext,
    level: HealLevel,
    strategy: &str,
    target: &str,
    params: serde_json::Value,
    outcome: AttemptOutcome,
    detail: Option<String>,
    started: Instant,
) {
    let attempt = RemediationAttempt {
        id: Uuid::new_v4(),
        episode_id: ctx.episode_id,
        subject_id: ctx.subject_id.clone(),
        target_id: target.to_string(),
        category: ctx.category.clone(),
        kind: ctx.kind,
        level,
        strategy: strategy.to_string(),
        params,
        outcome,
        detail,
        duration_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
    };
    analyzer.record_attempt(&attempt).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering_by_blast_radius() {
        assert!(HealLevel::Entity < HealLevel::Device);
        assert!(HealLevel::Device < HealLevel::Integration);
    }

    #[test]
    fn test_broader() {
        assert_eq!(HealLevel::Entity.broader(), Some(HealLevel::Device));
        assert_eq!(HealLevel::Device.broader(), Some(HealLevel::Integration));
        assert_eq!(HealLevel::Integration.broader(), None);
    }

    #[test]
    fn test_level_display_and_serde() {
        assert_eq!(HealLevel::Entity.to_string(), "entity");
        let json = serde_json::to_string(&HealLevel::Integration).unwrap();
        assert_eq!(json, "\"integration\"");
    }

    #[test]
    fn test_retry_schedule_attempts() {
        let schedule = RetrySchedule::new(&[0, 1000, 2000], 0);
        assert_eq!(schedule.attempts(), 3);
        assert_eq!(schedule.delay(0), Duration::ZERO);
        assert_eq!(schedule.delay(1), Duration::from_millis(1000));
        assert_eq!(schedule.delay(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_retry_schedule_jitter_bounds() {
        let schedule = RetrySchedule::new(&[500], 100);
        for _ in 0..20 {
            let d = schedule.delay(0);
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_retry_schedule_zero_base_stays_immediate() {
        let schedule = RetrySchedule::new(&[0], 1000);
        assert_eq!(schedule.delay(0), Duration::ZERO);
    }

    #[test]
    fn test_healing_result_constructors() {
        let ok = HealingResult::resolved("all good", 2);
        assert!(ok.success);
        assert!(ok.unresolved.is_empty());
        assert_eq!(ok.attempts, 2);

        let bad = HealingResult::failed("nope", vec!["light.lr".into()], 3);
        assert!(!bad.success);
        assert_eq!(bad.unresolved, vec!["light.lr"]);
    }
}

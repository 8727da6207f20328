//! Pattern Store & Reliability Analyzer
//!
//! Durable record of every remediation attempt plus the aggregates that
//! make intelligent routing possible. Aggregates are keyed by failure
//! signature — exact (category, failure-kind) equality; fuzzier matching is
//! a future extension, not a hidden requirement.
//!
//! Pattern lookup is an optimization, not a dependency: if the durable
//! store is unreachable the analyzer keeps working from its in-memory
//! aggregates and the orchestrator degrades to sequential routing.

use crate::config::PatternConfig;
use crate::events::FailureKind;
use crate::healers::HealLevel;
use crate::store::DurableStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Outcome of one strategy attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    Failure,
    /// The transport layer errored; recorded, then the next strategy runs.
    Error,
    /// The breaker denied the target. Not an attempt against the platform.
    BreakerOpen,
}

/// One action taken by a level healer. Immutable once written; the store
/// is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAttempt {
    pub id: Uuid,
    pub episode_id: Uuid,
    pub subject_id: String,
    pub target_id: String,
    pub category: String,
    pub kind: FailureKind,
    pub level: HealLevel,
    pub strategy: String,
    pub params: serde_json::Value,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate row: how often one level/strategy resolved one signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRow {
    pub category: String,
    pub kind: FailureKind,
    pub level: HealLevel,
    pub strategy: String,
    pub successes: u32,
    pub attempts: u32,
    pub last_seen: DateTime<Utc>,
}

impl PatternRow {
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            f64::from(self.successes) / f64::from(self.attempts)
        }
    }
}

/// Reporting view over one pattern row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityMetric {
    pub category: String,
    pub kind: FailureKind,
    pub level: HealLevel,
    pub strategy: String,
    pub successes: u32,
    pub attempts: u32,
    pub success_rate: f64,
}

type PatternKey = (String, FailureKind, HealLevel, String);

pub struct ReliabilityAnalyzer {
    config: PatternConfig,
    store: Arc<dyn DurableStore>,
    rows: RwLock<HashMap<PatternKey, PatternRow>>,
}

impl ReliabilityAnalyzer {
    pub fn new(config: PatternConfig, store: Arc<dyn DurableStore>) -> Self {
        Self {
            config,
            store,
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// Warm the in-memory aggregates from the durable store. A store error
    /// leaves the analyzer empty — sequential routing until patterns
    /// re-accumulate, never a crashed loop.
    pub async fn load(&self) {
        match self.store.load_patterns().await {
            Ok(patterns) => {
                let mut rows = self.rows.write();
                for row in patterns {
                    let key = (
                        row.category.clone(),
                        row.kind,
                        row.level,
                        row.strategy.clone(),
                    );
                    rows.insert(key, row);
                }
            }
            Err(e) => {
                warn!(error = %e, "pattern store unreachable, starting with empty aggregates");
            }
        }
    }

    /// Append the attempt and fold it into the aggregates. Breaker-open
    /// records go to the log but do not count as tries against a strategy.
    pub async fn record_attempt(&self, attempt: &RemediationAttempt) {
        if let Err(e) = self.store.append_attempt(attempt).await {
            warn!(
                episode = %attempt.episode_id,
                strategy = %attempt.strategy,
                error = %e,
                "failed to persist remediation attempt, keeping in-memory aggregates"
            );
        }

        if attempt.outcome == AttemptOutcome::BreakerOpen {
            return;
        }

        let row = {
            let mut rows = self.rows.write();
            let key = (
                attempt.category.clone(),
                attempt.kind,
                attempt.level,
                attempt.strategy.clone(),
            );
            let row = rows.entry(key).or_insert_with(|| PatternRow {
                category: attempt.category.clone(),
                kind: attempt.kind,
                level: attempt.level,
                strategy: attempt.strategy.clone(),
                successes: 0,
                attempts: 0,
                last_seen: attempt.timestamp,
            });
            row.attempts += 1;
            if attempt.outcome == AttemptOutcome::Success {
                row.successes += 1;
            }
            row.last_seen = attempt.timestamp;
            row.clone()
        };

        if let Err(e) = self.store.save_pattern(&row).await {
            warn!(error = %e, "failed to persist pattern row");
        }
    }

    /// Targets a level already resolved within this episode, read from the
    /// append-only attempt log. Healers consult this before acting so a
    /// repeated `heal` call on a resolved context issues nothing. A store
    /// error degrades to "nothing resolved yet".
    pub async fn resolved_targets(&self, episode_id: Uuid, level: HealLevel) -> HashSet<String> {
        match self.store.attempts_for(episode_id).await {
            Ok(attempts) => attempts
                .into_iter()
                .filter(|a| a.level == level && a.outcome == AttemptOutcome::Success)
                .map(|a| a.target_id)
                .collect(),
            Err(e) => {
                warn!(episode = %episode_id, error = %e, "attempt log unreachable for resolved-target check");
                HashSet::new()
            }
        }
    }

    /// The best historically-successful (level, strategy) for a signature,
    /// or None when nothing passes the confidence threshold.
    pub fn lookup(&self, category: &str, kind: FailureKind) -> Option<(HealLevel, String)> {
        let rows = self.rows.read();
        let best = rows
            .values()
            .filter(|r| r.category == category && r.kind == kind)
            .filter(|r| {
                r.successes >= self.config.min_successes
                    && r.success_rate() >= self.config.min_success_rate
            })
            .max_by(|a, b| {
                a.success_rate()
                    .partial_cmp(&b.success_rate())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.successes.cmp(&b.successes))
            })?;

        debug!(
            category = %category,
            kind = %kind,
            level = %best.level,
            strategy = %best.strategy,
            rate = best.success_rate(),
            "matched reliability pattern"
        );
        Some((best.level, best.strategy.clone()))
    }

    /// Aggregate stats for reporting, optionally filtered by category.
    pub fn stats(&self, category: Option<&str>) -> Vec<ReliabilityMetric> {
        let rows = self.rows.read();
        let mut metrics: Vec<ReliabilityMetric> = rows
            .values()
            .filter(|r| category.map(|c| r.category == c).unwrap_or(true))
            .map(|r| ReliabilityMetric {
                category: r.category.clone(),
                kind: r.kind,
                level: r.level,
                strategy: r.strategy.clone(),
                successes: r.successes,
                attempts: r.attempts,
                success_rate: r.success_rate(),
            })
            .collect();
        metrics.sort_by(|a, b| {
            a.category
                .cmp(&b.category)
                .then(a.strategy.cmp(&b.strategy))
        });
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn attempt(
        category: &str,
        level: HealLevel,
        strategy: &str,
        outcome: AttemptOutcome,
    ) -> RemediationAttempt {
        RemediationAttempt {
            id: Uuid::new_v4(),
            episode_id: Uuid::new_v4(),
            subject_id: format!("{category}.thing"),
            target_id: format!("{category}.thing"),
            category: category.to_string(),
            kind: FailureKind::StateMismatch,
            level,
            strategy: strategy.to_string(),
            params: serde_json::Value::Null,
            outcome,
            detail: None,
            duration_ms: 5,
            timestamp: Utc::now(),
        }
    }

    fn analyzer() -> ReliabilityAnalyzer {
        ReliabilityAnalyzer::new(PatternConfig::default(), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_lookup_empty_returns_none() {
        let analyzer = analyzer();
        assert!(analyzer.lookup("light", FailureKind::StateMismatch).is_none());
    }

    #[tokio::test]
    async fn test_one_success_qualifies() {
        let analyzer = analyzer();
        analyzer
            .record_attempt(&attempt(
                "light",
                HealLevel::Device,
                "device_reconnect",
                AttemptOutcome::Success,
            ))
            .await;

        let (level, strategy) = analyzer
            .lookup("light", FailureKind::StateMismatch)
            .unwrap();
        assert_eq!(level, HealLevel::Device);
        assert_eq!(strategy, "device_reconnect");
    }

    #[tokio::test]
    async fn test_below_half_success_rate_disqualifies() {
        let analyzer = analyzer();
        analyzer
            .record_attempt(&attempt(
                "light",
                HealLevel::Entity,
                "retry_original",
                AttemptOutcome::Success,
            ))
            .await;
        for _ in 0..2 {
            analyzer
                .record_attempt(&attempt(
                    "light",
                    HealLevel::Entity,
                    "retry_original",
                    AttemptOutcome::Failure,
                ))
                .await;
        }

        // 1 success / 3 attempts = 0.33 < 0.5
        assert!(analyzer.lookup("light", FailureKind::StateMismatch).is_none());
    }

    #[tokio::test]
    async fn test_best_rate_wins() {
        let analyzer = analyzer();
        analyzer
            .record_attempt(&attempt(
                "light",
                HealLevel::Entity,
                "retry_original",
                AttemptOutcome::Success,
            ))
            .await;
        analyzer
            .record_attempt(&attempt(
                "light",
                HealLevel::Entity,
                "retry_original",
                AttemptOutcome::Failure,
            ))
            .await;
        analyzer
            .record_attempt(&attempt(
                "light",
                HealLevel::Device,
                "device_reconnect",
                AttemptOutcome::Success,
            ))
            .await;

        // reconnect is 1/1 vs retry's 1/2
        let (level, strategy) = analyzer
            .lookup("light", FailureKind::StateMismatch)
            .unwrap();
        assert_eq!(level, HealLevel::Device);
        assert_eq!(strategy, "device_reconnect");
    }

    #[tokio::test]
    async fn test_breaker_open_does_not_count() {
        let analyzer = analyzer();
        analyzer
            .record_attempt(&attempt(
                "light",
                HealLevel::Entity,
                "retry_original",
                AttemptOutcome::BreakerOpen,
            ))
            .await;

        assert!(analyzer.stats(None).is_empty());
    }

    #[tokio::test]
    async fn test_signature_is_exact_category_match() {
        let analyzer = analyzer();
        analyzer
            .record_attempt(&attempt(
                "switch",
                HealLevel::Device,
                "device_reboot",
                AttemptOutcome::Success,
            ))
            .await;

        assert!(analyzer.lookup("light", FailureKind::StateMismatch).is_none());
        assert!(analyzer
            .lookup("switch", FailureKind::ExecutionOutcomeMismatch)
            .is_none());
        assert!(analyzer.lookup("switch", FailureKind::StateMismatch).is_some());
    }

    #[tokio::test]
    async fn test_stats_filter_by_category() {
        let analyzer = analyzer();
        analyzer
            .record_attempt(&attempt(
                "light",
                HealLevel::Entity,
                "retry_original",
                AttemptOutcome::Success,
            ))
            .await;
        analyzer
            .record_attempt(&attempt(
                "switch",
                HealLevel::Entity,
                "retry_original",
                AttemptOutcome::Failure,
            ))
            .await;

        assert_eq!(analyzer.stats(None).len(), 2);
        let light_only = analyzer.stats(Some("light"));
        assert_eq!(light_only.len(), 1);
        assert!((light_only[0].success_rate - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_load_warms_from_store() {
        let store = Arc::new(MemoryStore::new());
        let seeded = ReliabilityAnalyzer::new(PatternConfig::default(), store.clone());
        seeded
            .record_attempt(&attempt(
                "light",
                HealLevel::Device,
                "device_reconnect",
                AttemptOutcome::Success,
            ))
            .await;

        let fresh = ReliabilityAnalyzer::new(PatternConfig::default(), store);
        assert!(fresh.lookup("light", FailureKind::StateMismatch).is_none());
        fresh.load().await;
        assert!(fresh.lookup("light", FailureKind::StateMismatch).is_some());
    }

    #[tokio::test]
    async fn test_store_failure_degrades_not_crashes() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes(true);
        let analyzer = ReliabilityAnalyzer::new(PatternConfig::default(), store);

        analyzer
            .record_attempt(&attempt(
                "light",
                HealLevel::Entity,
                "retry_original",
                AttemptOutcome::Success,
            ))
            .await;

        // In-memory aggregates still advance when persistence fails.
        assert!(analyzer.lookup("light", FailureKind::StateMismatch).is_some());
    }
}

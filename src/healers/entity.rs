//! Entity-level healing.
//!
//! Narrowest blast radius: re-issue the command the automation originally
//! sent, first with identical parameters on a bounded retry schedule, then
//! with a short list of alternative parameter variants. First success per
//! entity stops the level for that entity.

use super::{
    is_cancelled, record_attempt, FailureContext, HealLevel, Healer, HealingResult, RetrySchedule,
};
use crate::events::CommandSpec;
use crate::patterns::{AttemptOutcome, ReliabilityAnalyzer};
use crate::store::CommandTransport;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

pub const STRATEGY_RETRY_ORIGINAL: &str = "retry_original";
pub const STRATEGY_ALTERNATE_PARAMS: &str = "alternate_params";

pub struct EntityHealer {
    transport: Arc<dyn CommandTransport>,
    analyzer: Arc<ReliabilityAnalyzer>,
    schedule: RetrySchedule,
}

impl EntityHealer {
    pub fn new(
        transport: Arc<dyn CommandTransport>,
        analyzer: Arc<ReliabilityAnalyzer>,
        schedule: RetrySchedule,
    ) -> Self {
        Self {
            transport,
            analyzer,
            schedule,
        }
    }

    /// The command to retry verbatim. When the signal carried no original
    /// command (e.g. a stale sensor), fall back to a state refresh.
    fn base_command(ctx: &FailureContext, entity: &str) -> CommandSpec {
        ctx.original_command.clone().unwrap_or_else(|| CommandSpec {
            action: "update_entity".to_string(),
            params: serde_json::json!({ "entity_id": entity }),
        })
    }

    /// Alternative parameter variants for one entity: a bare invocation
    /// stripped of tunables, then an explicit target-state request when the
    /// expected value is known.
    fn param_variants(ctx: &FailureContext, entity: &str) -> Vec<serde_json::Value> {
        let mut variants = vec![serde_json::json!({ "entity_id": entity })];
        if let Some(expected) = ctx.expected.get(entity) {
            variants.push(serde_json::json!({
                "entity_id": entity,
                "state": expected,
            }));
        }
        variants
    }

    /// One transport invocation mapped to an attempt outcome. The last
    /// element says whether the same strategy may be retried afterwards.
    async fn try_invoke(
        &self,
        entity: &str,
        action: &str,
        params: &serde_json::Value,
    ) -> (AttemptOutcome, Option<String>, bool) {
        match self.transport.invoke(entity, action, params).await {
            Ok(inv) if inv.accepted => (AttemptOutcome::Success, None, false),
            Ok(inv) => (AttemptOutcome::Failure, inv.error_detail, true),
            Err(e) => {
                let retryable = e.is_retryable();
                (AttemptOutcome::Error, Some(e.to_string()), retryable)
            }
        }
    }

    /// Identical-parameter retries on the bounded schedule. Returns
    /// (resolved, attempts).
    async fn retry_original(
        &self,
        ctx: &FailureContext,
        entity: &str,
        cancel: &watch::Receiver<bool>,
    ) -> (bool, u32) {
        let command = Self::base_command(ctx, entity);
        let mut attempts = 0u32;

        for retry in 0..self.schedule.attempts() {
            if is_cancelled(cancel) {
                return (false, attempts);
            }
            let delay = self.schedule.delay(retry);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if is_cancelled(cancel) {
                return (false, attempts);
            }

            let started = Instant::now();
            let (outcome, detail, retryable) = self
                .try_invoke(entity, &command.action, &command.params)
                .await;
            attempts += 1;
            record_attempt(
                &self.analyzer,
                ctx,
                HealLevel::Entity,
                STRATEGY_RETRY_ORIGINAL,
                entity,
                command.params.clone(),
                outcome,
                detail,
                started,
            )
            .await;
            if outcome == AttemptOutcome::Success {
                return (true, attempts);
            }
            if !retryable {
                debug!(target = %entity, "non-retryable error, abandoning identical retries");
                break;
            }
        }
        (false, attempts)
    }

    /// Alternative parameter variants, one attempt each. Returns
    /// (resolved, attempts).
    async fn alternate_params(
        &self,
        ctx: &FailureContext,
        entity: &str,
        cancel: &watch::Receiver<bool>,
    ) -> (bool, u32) {
        let command = Self::base_command(ctx, entity);
        let mut attempts = 0u32;

        for params in Self::param_variants(ctx, entity) {
            if is_cancelled(cancel) {
                return (false, attempts);
            }
            let started = Instant::now();
            let (outcome, detail, _) = self.try_invoke(entity, &command.action, &params).await;
            attempts += 1;
            record_attempt(
                &self.analyzer,
                ctx,
                HealLevel::Entity,
                STRATEGY_ALTERNATE_PARAMS,
                entity,
                params,
                outcome,
                detail,
                started,
            )
            .await;
            if outcome == AttemptOutcome::Success {
                return (true, attempts);
            }
        }
        (false, attempts)
    }

    /// Run both strategies for one entity, a routed strategy first.
    /// Returns (resolved, attempts).
    async fn heal_entity(
        &self,
        ctx: &FailureContext,
        entity: &str,
        preferred: Option<&str>,
        cancel: &watch::Receiver<bool>,
    ) -> (bool, u32) {
        let order = if preferred == Some(STRATEGY_ALTERNATE_PARAMS) {
            [STRATEGY_ALTERNATE_PARAMS, STRATEGY_RETRY_ORIGINAL]
        } else {
            [STRATEGY_RETRY_ORIGINAL, STRATEGY_ALTERNATE_PARAMS]
        };

        let mut total = 0u32;
        for strategy in order {
            let (resolved, attempts) = if strategy == STRATEGY_RETRY_ORIGINAL {
                self.retry_original(ctx, entity, cancel).await
            } else {
                self.alternate_params(ctx, entity, cancel).await
            };
            total += attempts;
            if resolved {
                return (true, total);
            }
            if is_cancelled(cancel) {
                return (false, total);
            }
        }
        (false, total)
    }
}

#[async_trait]
impl Healer for EntityHealer {
    fn level(&self) -> HealLevel {
        HealLevel::Entity
    }

    async fn targets(&self, ctx: &FailureContext) -> Vec<String> {
        ctx.entities.clone()
    }

    async fn heal(
        &self,
        ctx: &FailureContext,
        allowed: &[String],
        preferred: Option<&str>,
        cancel: &watch::Receiver<bool>,
    ) -> HealingResult {
        let done = self
            .analyzer
            .resolved_targets(ctx.episode_id, HealLevel::Entity)
            .await;
        let mut unresolved = Vec::new();
        let mut total_attempts = 0u32;

        for entity in allowed {
            if done.contains(entity) {
                debug!(target = %entity, "already resolved in this episode, skipping");
                continue;
            }
            if is_cancelled(cancel) {
                unresolved.push(entity.clone());
                continue;
            }
            let (resolved, attempts) = self.heal_entity(ctx, entity, preferred, cancel).await;
            total_attempts += attempts;
            if resolved {
                debug!(target = %entity, attempts, "entity healed");
            } else {
                unresolved.push(entity.clone());
            }
        }

        if unresolved.is_empty() && !allowed.is_empty() {
            HealingResult::resolved("entity-level remediation succeeded", total_attempts)
        } else {
            HealingResult::failed(
                format!("{} entity target(s) unresolved", unresolved.len()),
                unresolved,
                total_attempts,
            )
        }
    }
}

//! Integration-level healing.
//!
//! Broadest blast radius: reload the integration's configuration entry,
//! then restart the integration process if the reload was not enough. Only
//! reached after the narrower levels are exhausted or skipped by routing.

use super::{is_cancelled, record_attempt, FailureContext, HealLevel, Healer, HealingResult};
use crate::patterns::{AttemptOutcome, ReliabilityAnalyzer};
use crate::store::{CommandTransport, DeviceRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

pub const STRATEGY_RELOAD: &str = "reload_config_entry";
pub const STRATEGY_RESTART: &str = "restart_integration";

pub struct IntegrationHealer {
    registry: Arc<dyn DeviceRegistry>,
    transport: Arc<dyn CommandTransport>,
    analyzer: Arc<ReliabilityAnalyzer>,
}

impl IntegrationHealer {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        transport: Arc<dyn CommandTransport>,
        analyzer: Arc<ReliabilityAnalyzer>,
    ) -> Self {
        Self {
            registry,
            transport,
            analyzer,
        }
    }

    /// Deduplicated integrations owning the failed entities, in first-seen
    /// order. An entity without a registry entry falls back to its domain
    /// as the integration name.
    async fn resolve_integrations(&self, ctx: &FailureContext) -> Vec<String> {
        let mut integrations: Vec<String> = Vec::new();
        for entity in &ctx.entities {
            let integration = match self.registry.device_for(entity).await {
                Some(entry) => entry.integration,
                None => crate::events::category_of(entity),
            };
            if !integrations.contains(&integration) {
                integrations.push(integration);
            }
        }
        integrations
    }

    /// Reload then restart one integration, a routed strategy first.
    /// Returns (resolved, attempts).
    async fn heal_integration(
        &self,
        ctx: &FailureContext,
        integration: &str,
        preferred: Option<&str>,
        cancel: &watch::Receiver<bool>,
    ) -> (bool, u32) {
        let order = if preferred == Some(STRATEGY_RESTART) {
            [STRATEGY_RESTART, STRATEGY_RELOAD]
        } else {
            [STRATEGY_RELOAD, STRATEGY_RESTART]
        };
        let mut attempts = 0u32;
        for strategy in order {
            if is_cancelled(cancel) {
                return (false, attempts);
            }
            let params = serde_json::json!({ "integration": integration });
            let started = Instant::now();
            let (outcome, detail) = match self.transport.invoke(integration, strategy, &params).await
            {
                Ok(inv) if inv.accepted => (AttemptOutcome::Success, None),
                Ok(inv) => (AttemptOutcome::Failure, inv.error_detail),
                Err(e) => (AttemptOutcome::Error, Some(e.to_string())),
            };
            attempts += 1;
            record_attempt(
                &self.analyzer,
                ctx,
                HealLevel::Integration,
                strategy,
                integration,
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
}

#[async_trait]
impl Healer for IntegrationHealer {
    fn level(&self) -> HealLevel {
        HealLevel::Integration
    }

    async fn targets(&self, ctx: &FailureContext) -> Vec<String> {
        self.resolve_integrations(ctx).await
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
            .resolved_targets(ctx.episode_id, HealLevel::Integration)
            .await;
        let integrations = self.resolve_integrations(ctx).await;
        let mut unresolved = Vec::new();
        let mut total_attempts = 0u32;
        let mut acted = false;

        for integration in integrations {
            if !allowed.contains(&integration) {
                continue;
            }
            acted = true;
            if done.contains(&integration) {
                debug!(integration = %integration, "already resolved in this episode, skipping");
                continue;
            }
            if is_cancelled(cancel) {
                unresolved.push(integration);
                continue;
            }
            let (resolved, attempts) = self
                .heal_integration(ctx, &integration, preferred, cancel)
                .await;
            total_attempts += attempts;
            if resolved {
                debug!(integration = %integration, attempts, "integration healed");
            } else {
                unresolved.push(integration);
            }
        }

        if unresolved.is_empty() && acted {
            HealingResult::resolved("integration-level remediation succeeded", total_attempts)
        } else {
            HealingResult::failed(
                format!("{} integration target(s) unresolved", unresolved.len()),
                unresolved,
                total_attempts,
            )
        }
    }
}

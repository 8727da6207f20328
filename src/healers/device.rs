//! Device-level healing.
//!
//! Maps failing entities to their owning devices through the platform
//! registry, then walks reconnect, reboot, rediscover in order, stopping at
//! the first success per device. An action the device does not support is
//! skipped, never counted as a failure. An entity with no registry entry
//! cannot be resolved at this level and falls through to the next one.

use super::{is_cancelled, record_attempt, FailureContext, HealLevel, Healer, HealingResult};
use crate::patterns::{AttemptOutcome, ReliabilityAnalyzer};
use crate::store::{CommandTransport, DeviceAction, DeviceEntry, DeviceRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct DeviceHealer {
    registry: Arc<dyn DeviceRegistry>,
    transport: Arc<dyn CommandTransport>,
    analyzer: Arc<ReliabilityAnalyzer>,
}

impl DeviceHealer {
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

    /// Deduplicated device entries owning the failed entities, in first-seen
    /// order, plus the entities that have no registry mapping.
    async fn resolve_devices(
        &self,
        ctx: &FailureContext,
    ) -> (Vec<DeviceEntry>, Vec<String>) {
        let mut devices: Vec<DeviceEntry> = Vec::new();
        let mut unmapped = Vec::new();
        for entity in &ctx.entities {
            match self.registry.device_for(entity).await {
                Some(entry) => {
                    if !devices.iter().any(|d| d.device_id == entry.device_id) {
                        devices.push(entry);
                    }
                }
                None => {
                    warn!(entity = %entity, "no device registry entry, cannot heal at device level");
                    unmapped.push(entity.clone());
                }
            }
        }
        (devices, unmapped)
    }

    /// Walk the action ladder for one device, a routed action first.
    /// Returns (resolved, attempts).
    async fn heal_device(
        &self,
        ctx: &FailureContext,
        device: &DeviceEntry,
        preferred: Option<DeviceAction>,
        cancel: &watch::Receiver<bool>,
    ) -> (bool, u32) {
        let mut ladder: Vec<DeviceAction> = Vec::with_capacity(DeviceAction::ORDERED.len());
        if let Some(action) = preferred {
            ladder.push(action);
        }
        ladder.extend(
            DeviceAction::ORDERED
                .into_iter()
                .filter(|a| Some(*a) != preferred),
        );

        let mut attempts = 0u32;
        for action in ladder {
            if is_cancelled(cancel) {
                return (false, attempts);
            }
            if !device.supports(action) {
                debug!(
                    device = %device.device_id,
                    action = action.strategy_name(),
                    "device does not support action, skipping"
                );
                continue;
            }

            let params = serde_json::json!({ "device_id": device.device_id });
            let started = Instant::now();
            let (outcome, detail) = match self
                .transport
                .invoke(&device.device_id, action.strategy_name(), &params)
                .await
            {
                Ok(inv) if inv.accepted => (AttemptOutcome::Success, None),
                Ok(inv) => (AttemptOutcome::Failure, inv.error_detail),
                Err(e) => (AttemptOutcome::Error, Some(e.to_string())),
            };
            attempts += 1;
            record_attempt(
                &self.analyzer,
                ctx,
                HealLevel::Device,
                action.strategy_name(),
                &device.device_id,
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
impl Healer for DeviceHealer {
    fn level(&self) -> HealLevel {
        HealLevel::Device
    }

    async fn targets(&self, ctx: &FailureContext) -> Vec<String> {
        let (devices, _) = self.resolve_devices(ctx).await;
        devices.into_iter().map(|d| d.device_id).collect()
    }

    async fn heal(
        &self,
        ctx: &FailureContext,
        allowed: &[String],
        preferred: Option<&str>,
        cancel: &watch::Receiver<bool>,
    ) -> HealingResult {
        let preferred_action = preferred.and_then(DeviceAction::from_strategy);
        let done = self
            .analyzer
            .resolved_targets(ctx.episode_id, HealLevel::Device)
            .await;
        let (devices, unmapped) = self.resolve_devices(ctx).await;
        let mut unresolved = unmapped;
        let mut total_attempts = 0u32;
        let mut acted = false;

        for device in devices {
            if !allowed.contains(&device.device_id) {
                continue;
            }
            acted = true;
            if done.contains(&device.device_id) {
                debug!(device = %device.device_id, "already resolved in this episode, skipping");
                continue;
            }
            if is_cancelled(cancel) {
                unresolved.push(device.device_id);
                continue;
            }
            let (resolved, attempts) = self
                .heal_device(ctx, &device, preferred_action, cancel)
                .await;
            total_attempts += attempts;
            if resolved {
                debug!(device = %device.device_id, attempts, "device healed");
            } else {
                unresolved.push(device.device_id);
            }
        }

        if unresolved.is_empty() && acted {
            HealingResult::resolved("device-level remediation succeeded", total_attempts)
        } else {
            HealingResult::failed(
                format!("{} device target(s) unresolved", unresolved.len()),
                unresolved,
                total_attempts,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternConfig;
    use crate::events::FailureKind;
    use crate::store::{MemoryStore, ScriptedReply, ScriptedTransport, StaticRegistry};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn context(entities: &[&str]) -> FailureContext {
        FailureContext {
            episode_id: Uuid::new_v4(),
            subject_id: entities[0].to_string(),
            instance_id: "home".to_string(),
            category: "light".to_string(),
            kind: FailureKind::StateMismatch,
            entities: entities.iter().map(|e| e.to_string()).collect(),
            original_command: None,
            expected: HashMap::new(),
        }
    }

    fn entry(device_id: &str, supported: Vec<DeviceAction>) -> DeviceEntry {
        DeviceEntry {
            device_id: device_id.to_string(),
            integration: "zwave".to_string(),
            supported,
        }
    }

    fn healer(
        registry: StaticRegistry,
        transport: Arc<ScriptedTransport>,
        store: Arc<MemoryStore>,
    ) -> DeviceHealer {
        let analyzer = Arc::new(ReliabilityAnalyzer::new(PatternConfig::default(), store));
        DeviceHealer::new(Arc::new(registry), transport, analyzer)
    }

    #[tokio::test]
    async fn test_reconnect_first_then_stop() {
        let registry = StaticRegistry::new().with(
            "light.lr",
            entry("dev-1", vec![DeviceAction::Reconnect, DeviceAction::Reboot]),
        );
        let transport = Arc::new(ScriptedTransport::accepting());
        let store = Arc::new(MemoryStore::new());
        let healer = healer(registry, transport, store.clone());
        let (_tx, cancel) = watch::channel(false);

        let result = healer
            .heal(&context(&["light.lr"]), &["dev-1".to_string()], None, &cancel)
            .await;
        assert!(result.success);
        let attempts = store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].strategy, "device_reconnect");
        assert_eq!(attempts[0].target_id, "dev-1");
    }

    #[tokio::test]
    async fn test_unsupported_action_skipped_not_failed() {
        // Reconnect unsupported: the ladder starts at reboot.
        let registry = StaticRegistry::new().with(
            "light.lr",
            entry("dev-1", vec![DeviceAction::Reboot, DeviceAction::Rediscover]),
        );
        let transport = Arc::new(ScriptedTransport::accepting());
        transport.script(
            "dev-1",
            "device_reboot",
            vec![ScriptedReply::Reject("busy".into())],
        );
        let store = Arc::new(MemoryStore::new());
        let healer = healer(registry, transport, store.clone());
        let (_tx, cancel) = watch::channel(false);

        let result = healer
            .heal(&context(&["light.lr"]), &["dev-1".to_string()], None, &cancel)
            .await;
        assert!(result.success);
        let attempts = store.attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].strategy, "device_reboot");
        assert_eq!(attempts[1].strategy, "device_rediscover");
        assert_eq!(attempts[1].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn test_entities_sharing_device_deduplicated() {
        let registry = StaticRegistry::new()
            .with("light.lr", entry("dev-1", vec![DeviceAction::Reconnect]))
            .with("light.hall", entry("dev-1", vec![DeviceAction::Reconnect]));
        let transport = Arc::new(ScriptedTransport::accepting());
        let store = Arc::new(MemoryStore::new());
        let healer = healer(registry, transport, store.clone());

        let ctx = context(&["light.lr", "light.hall"]);
        assert_eq!(healer.targets(&ctx).await, vec!["dev-1"]);

        let (_tx, cancel) = watch::channel(false);
        let result = healer.heal(&ctx, &["dev-1".to_string()], None, &cancel).await;
        assert!(result.success);
        assert_eq!(store.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_unmapped_entity_blocks_full_success() {
        let registry =
            StaticRegistry::new().with("light.lr", entry("dev-1", vec![DeviceAction::Reconnect]));
        let transport = Arc::new(ScriptedTransport::accepting());
        let store = Arc::new(MemoryStore::new());
        let healer = healer(registry, transport, store);
        let (_tx, cancel) = watch::channel(false);

        let result = healer
            .heal(
                &context(&["light.lr", "sensor.ghost"]),
                &["dev-1".to_string()],
                None,
                &cancel,
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.unresolved, vec!["sensor.ghost"]);
    }

    #[tokio::test]
    async fn test_preferred_action_tried_before_ladder_order() {
        let registry = StaticRegistry::new().with(
            "light.lr",
            entry(
                "dev-1",
                vec![
                    DeviceAction::Reconnect,
                    DeviceAction::Reboot,
                    DeviceAction::Rediscover,
                ],
            ),
        );
        let transport = Arc::new(ScriptedTransport::accepting());
        let store = Arc::new(MemoryStore::new());
        let healer = healer(registry, transport, store.clone());
        let (_tx, cancel) = watch::channel(false);

        let result = healer
            .heal(
                &context(&["light.lr"]),
                &["dev-1".to_string()],
                Some("device_reboot"),
                &cancel,
            )
            .await;
        assert!(result.success);
        let attempts = store.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].strategy, "device_reboot");
    }

    #[tokio::test]
    async fn test_repeat_heal_on_resolved_episode_is_noop() {
        let registry =
            StaticRegistry::new().with("light.lr", entry("dev-1", vec![DeviceAction::Reconnect]));
        let transport = Arc::new(ScriptedTransport::accepting());
        let store = Arc::new(MemoryStore::new());
        let healer = healer(registry, transport, store.clone());
        let ctx = context(&["light.lr"]);
        let (_tx, cancel) = watch::channel(false);

        let first = healer.heal(&ctx, &["dev-1".to_string()], None, &cancel).await;
        assert!(first.success);
        assert_eq!(store.attempts().len(), 1);

        // Re-invoking with the same resolved context issues no commands and
        // writes no duplicate records.
        let second = healer.heal(&ctx, &["dev-1".to_string()], None, &cancel).await;
        assert!(second.success);
        assert_eq!(second.attempts, 0);
        assert_eq!(store.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_ladder_reports_device_unresolved() {
        let registry = StaticRegistry::new().with(
            "light.lr",
            entry("dev-1", vec![DeviceAction::Reconnect, DeviceAction::Reboot]),
        );
        let transport = Arc::new(ScriptedTransport::rejecting());
        let store = Arc::new(MemoryStore::new());
        let healer = healer(registry, transport, store.clone());
        let (_tx, cancel) = watch::channel(false);

        let result = healer
            .heal(&context(&["light.lr"]), &["dev-1".to_string()], None, &cancel)
            .await;
        assert!(!result.success);
        assert_eq!(result.unresolved, vec!["dev-1"]);
        assert_eq!(store.attempts().len(), 2);
    }
}

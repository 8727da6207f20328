//! Collaborator seams.
//!
//! The engine talks to the outside world through these traits: the durable
//! store, the command-invocation transport, the desired-state source, the
//! device registry, and the alerting notifier. The in-memory
//! implementations below back the default engine wiring and the test
//! suite; production deployments swap in real backends at construction.

use crate::errors::{AutomedicError, Result};
use crate::events::Escalation;
use crate::health::HealthStatus;
use crate::patterns::{PatternRow, RemediationAttempt};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Answer from the command-invocation transport. `accepted` does not imply
/// the action completed; effects are confirmed via the event stream.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub accepted: bool,
    pub error_detail: Option<String>,
}

/// Durable CRUD + aggregate-query access for engine records.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn append_attempt(&self, attempt: &RemediationAttempt) -> Result<()>;
    async fn attempts_for(&self, episode_id: Uuid) -> Result<Vec<RemediationAttempt>>;
    async fn save_pattern(&self, row: &PatternRow) -> Result<()>;
    async fn load_patterns(&self) -> Result<Vec<PatternRow>>;
    async fn save_health(&self, status: &HealthStatus) -> Result<()>;
    async fn load_health(&self) -> Result<Vec<HealthStatus>>;
}

/// Fire-and-confirm command invocation against the managed platform.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn invoke(
        &self,
        target_id: &str,
        action: &str,
        params: &serde_json::Value,
    ) -> Result<Invocation>;
}

/// Supplies the entity states an automation is expected to produce.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn expected_states(&self, automation_id: &str) -> Option<HashMap<String, String>>;
}

/// Actions a device may support. Unsupported actions are skipped by the
/// device healer, never treated as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Reconnect,
    Reboot,
    Rediscover,
}

impl DeviceAction {
    pub const ORDERED: [DeviceAction; 3] = [
        DeviceAction::Reconnect,
        DeviceAction::Reboot,
        DeviceAction::Rediscover,
    ];

    pub fn strategy_name(self) -> &'static str {
        match self {
            DeviceAction::Reconnect => "device_reconnect",
            DeviceAction::Reboot => "device_reboot",
            DeviceAction::Rediscover => "device_rediscover",
        }
    }

    /// The action a recorded strategy name maps back to.
    pub fn from_strategy(name: &str) -> Option<DeviceAction> {
        Self::ORDERED.into_iter().find(|a| a.strategy_name() == name)
    }
}

/// Registry entry mapping an entity to its owning device.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub device_id: String,
    pub integration: String,
    pub supported: Vec<DeviceAction>,
}

impl DeviceEntry {
    pub fn supports(&self, action: DeviceAction) -> bool {
        self.supported.contains(&action)
    }
}

/// Entity → owning-device lookups, backed by the platform registry.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn device_for(&self, entity_id: &str) -> Option<DeviceEntry>;
}

/// Receives exactly one escalation per episode that ends Escalated.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, escalation: &Escalation);
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// In-memory durable store. `fail_writes` simulates an unreachable backend
/// for degradation tests.
#[derive(Default)]
pub struct MemoryStore {
    attempts: Mutex<Vec<RemediationAttempt>>,
    patterns: Mutex<HashMap<String, PatternRow>>,
    health: Mutex<HashMap<(String, String), HealthStatus>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(AutomedicError::Store("store unavailable".into()))
        } else {
            Ok(())
        }
    }

    /// All attempts in append order, for test inspection.
    pub fn attempts(&self) -> Vec<RemediationAttempt> {
        self.attempts.lock().clone()
    }
}

fn pattern_key(row: &PatternRow) -> String {
    format!("{}|{}|{}|{}", row.category, row.kind, row.level, row.strategy)
}

fn health_key(status: &HealthStatus) -> String {
    format!("{}|{}", status.instance_id, status.automation_id)
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn append_attempt(&self, attempt: &RemediationAttempt) -> Result<()> {
        self.check()?;
        self.attempts.lock().push(attempt.clone());
        Ok(())
    }

    async fn attempts_for(&self, episode_id: Uuid) -> Result<Vec<RemediationAttempt>> {
        self.check()?;
        Ok(self
            .attempts
            .lock()
            .iter()
            .filter(|a| a.episode_id == episode_id)
            .cloned()
            .collect())
    }

    async fn save_pattern(&self, row: &PatternRow) -> Result<()> {
        self.check()?;
        self.patterns.lock().insert(pattern_key(row), row.clone());
        Ok(())
    }

    async fn load_patterns(&self) -> Result<Vec<PatternRow>> {
        self.check()?;
        Ok(self.patterns.lock().values().cloned().collect())
    }

    async fn save_health(&self, status: &HealthStatus) -> Result<()> {
        self.check()?;
        self.health.lock().insert(
            (status.instance_id.clone(), status.automation_id.clone()),
            status.clone(),
        );
        Ok(())
    }

    async fn load_health(&self) -> Result<Vec<HealthStatus>> {
        self.check()?;
        Ok(self.health.lock().values().cloned().collect())
    }
}

/// File-backed durable store: a JSON Lines attempt log plus JSON snapshot
/// maps for patterns and health, all under one data directory. The
/// reporting commands open the same directory the watch loop writes to, so
/// stats survive restarts. Heavier deployments swap in a database behind
/// the trait.
pub struct JsonStore {
    attempts_path: PathBuf,
    patterns_path: PathBuf,
    health_path: PathBuf,
    /// Serializes whole-file rewrites; held across awaits, so tokio's.
    io: tokio::sync::Mutex<()>,
}

impl JsonStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            AutomedicError::Store(format!("cannot create data dir {}: {e}", dir.display()))
        })?;
        Ok(Self {
            attempts_path: dir.join("attempts.jsonl"),
            patterns_path: dir.join("patterns.json"),
            health_path: dir.join("health.json"),
            io: tokio::sync::Mutex::new(()),
        })
    }

    fn store_err(e: impl std::fmt::Display) -> AutomedicError {
        AutomedicError::Store(e.to_string())
    }

    async fn read_map<T: serde::de::DeserializeOwned>(path: &Path) -> Result<HashMap<String, T>> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(Self::store_err),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Self::store_err(e)),
        }
    }

    /// Write-to-temp then rename, so a crash never leaves a torn snapshot.
    async fn write_map<T: serde::Serialize>(path: &Path, map: &HashMap<String, T>) -> Result<()> {
        let raw = serde_json::to_string_pretty(map).map_err(Self::store_err)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await.map_err(Self::store_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(Self::store_err)
    }
}

#[async_trait]
impl DurableStore for JsonStore {
    async fn append_attempt(&self, attempt: &RemediationAttempt) -> Result<()> {
        let mut line = serde_json::to_string(attempt).map_err(Self::store_err)?;
        line.push('\n');

        let _io = self.io.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.attempts_path)
            .await
            .map_err(Self::store_err)?;
        file.write_all(line.as_bytes())
            .await
            .map_err(Self::store_err)
    }

    async fn attempts_for(&self, episode_id: Uuid) -> Result<Vec<RemediationAttempt>> {
        let _io = self.io.lock().await;
        let raw = match tokio::fs::read_to_string(&self.attempts_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::store_err(e)),
        };

        let mut attempts = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let attempt: RemediationAttempt =
                serde_json::from_str(line).map_err(Self::store_err)?;
            if attempt.episode_id == episode_id {
                attempts.push(attempt);
            }
        }
        Ok(attempts)
    }

    async fn save_pattern(&self, row: &PatternRow) -> Result<()> {
        let _io = self.io.lock().await;
        let mut map: HashMap<String, PatternRow> = Self::read_map(&self.patterns_path).await?;
        map.insert(pattern_key(row), row.clone());
        Self::write_map(&self.patterns_path, &map).await
    }

    async fn load_patterns(&self) -> Result<Vec<PatternRow>> {
        let _io = self.io.lock().await;
        let map: HashMap<String, PatternRow> = Self::read_map(&self.patterns_path).await?;
        Ok(map.into_values().collect())
    }

    async fn save_health(&self, status: &HealthStatus) -> Result<()> {
        let _io = self.io.lock().await;
        let mut map: HashMap<String, HealthStatus> = Self::read_map(&self.health_path).await?;
        map.insert(health_key(status), status.clone());
        Self::write_map(&self.health_path, &map).await
    }

    async fn load_health(&self) -> Result<Vec<HealthStatus>> {
        let _io = self.io.lock().await;
        let map: HashMap<String, HealthStatus> = Self::read_map(&self.health_path).await?;
        Ok(map.into_values().collect())
    }
}

/// Scripted reply for one transport invocation.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Accept,
    Reject(String),
    TransportError(String),
}

/// Record of one invocation issued through the scripted transport.
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    pub target: String,
    pub action: String,
    pub params: serde_json::Value,
}

/// Command transport with per-(target, action) scripted replies, falling
/// back to a configurable default. Used by the default engine wiring for
/// dry runs and by the test suite to script fail/fail/succeed sequences.
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    journal: Mutex<Vec<InvocationRecord>>,
    default_reply: ScriptedReply,
}

impl ScriptedTransport {
    /// Every unscripted invocation is accepted.
    pub fn accepting() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
            default_reply: ScriptedReply::Accept,
        }
    }

    /// Every unscripted invocation is rejected.
    pub fn rejecting() -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            journal: Mutex::new(Vec::new()),
            default_reply: ScriptedReply::Reject("scripted rejection".into()),
        }
    }

    fn key(target: &str, action: &str) -> String {
        format!("{target}|{action}")
    }

    /// Queue replies for a (target, action) pair, consumed in order.
    pub fn script(&self, target: &str, action: &str, replies: Vec<ScriptedReply>) {
        self.replies
            .lock()
            .entry(Self::key(target, action))
            .or_default()
            .extend(replies);
    }

    /// Invocations issued so far, in order.
    pub fn journal(&self) -> Vec<InvocationRecord> {
        self.journal.lock().clone()
    }
}

#[async_trait]
impl CommandTransport for ScriptedTransport {
    async fn invoke(
        &self,
        target_id: &str,
        action: &str,
        params: &serde_json::Value,
    ) -> Result<Invocation> {
        self.journal.lock().push(InvocationRecord {
            target: target_id.to_string(),
            action: action.to_string(),
            params: params.clone(),
        });

        let reply = self
            .replies
            .lock()
            .get_mut(&Self::key(target_id, action))
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| self.default_reply.clone());

        match reply {
            ScriptedReply::Accept => Ok(Invocation {
                accepted: true,
                error_detail: None,
            }),
            ScriptedReply::Reject(detail) => Ok(Invocation {
                accepted: false,
                error_detail: Some(detail),
            }),
            ScriptedReply::TransportError(detail) => Err(AutomedicError::Transport {
                target: target_id.to_string(),
                action: action.to_string(),
                detail,
            }),
        }
    }
}

/// Fixed desired-state mappings.
#[derive(Default)]
pub struct StaticDesiredState {
    map: HashMap<String, HashMap<String, String>>,
}

impl StaticDesiredState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, automation_id: &str, entity_id: &str, expected: &str) -> Self {
        self.map
            .entry(automation_id.to_string())
            .or_default()
            .insert(entity_id.to_string(), expected.to_string());
        self
    }
}

#[async_trait]
impl DesiredStateSource for StaticDesiredState {
    async fn expected_states(&self, automation_id: &str) -> Option<HashMap<String, String>> {
        self.map.get(automation_id).cloned()
    }
}

/// Fixed entity → device mappings.
#[derive(Default)]
pub struct StaticRegistry {
    devices: HashMap<String, DeviceEntry>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, entity_id: &str, entry: DeviceEntry) -> Self {
        self.devices.insert(entity_id.to_string(), entry);
        self
    }
}

#[async_trait]
impl DeviceRegistry for StaticRegistry {
    async fn device_for(&self, entity_id: &str) -> Option<DeviceEntry> {
        self.devices.get(entity_id).cloned()
    }
}

/// Default notifier: escalations land in the log at warn level.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, escalation: &Escalation) {
        tracing::warn!(
            episode = %escalation.episode_id,
            subjects = ?escalation.subject_ids,
            attempts = escalation.attempts_tried,
            last_error = ?escalation.last_error,
            "remediation exhausted, human attention required"
        );
    }
}

/// Collects escalations for inspection.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Escalation>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Escalation> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, escalation: &Escalation) {
        self.sent.lock().push(escalation.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FailureKind;
    use crate::healers::HealLevel;
    use crate::patterns::AttemptOutcome;
    use chrono::Utc;

    fn sample_attempt(episode_id: Uuid) -> RemediationAttempt {
        RemediationAttempt {
            id: Uuid::new_v4(),
            episode_id,
            subject_id: "light.lr".into(),
            target_id: "light.lr".into(),
            category: "light".into(),
            kind: FailureKind::StateMismatch,
            level: HealLevel::Entity,
            strategy: "retry_original".into(),
            params: serde_json::Value::Null,
            outcome: AttemptOutcome::Failure,
            detail: None,
            duration_ms: 3,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_append_and_query() {
        let store = MemoryStore::new();
        let episode = Uuid::new_v4();
        store.append_attempt(&sample_attempt(episode)).await.unwrap();
        store.append_attempt(&sample_attempt(Uuid::new_v4())).await.unwrap();

        assert_eq!(store.attempts().len(), 2);
        assert_eq!(store.attempts_for(episode).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_fail_writes() {
        let store = MemoryStore::new();
        store.fail_writes(true);
        let err = store
            .append_attempt(&sample_attempt(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, AutomedicError::Store(_)));
    }

    #[tokio::test]
    async fn test_json_store_attempt_log_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let episode = Uuid::new_v4();
        store.append_attempt(&sample_attempt(episode)).await.unwrap();
        store
            .append_attempt(&sample_attempt(Uuid::new_v4()))
            .await
            .unwrap();

        // A fresh handle over the same directory sees the log.
        let reopened = JsonStore::open(dir.path()).unwrap();
        let attempts = reopened.attempts_for(episode).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].subject_id, "light.lr");
    }

    #[tokio::test]
    async fn test_json_store_patterns_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let row = PatternRow {
            category: "light".into(),
            kind: FailureKind::StateMismatch,
            level: HealLevel::Device,
            strategy: "device_reconnect".into(),
            successes: 3,
            attempts: 4,
            last_seen: Utc::now(),
        };
        store.save_pattern(&row).await.unwrap();
        // Upsert: same key overwrites, no duplicate rows.
        store.save_pattern(&row).await.unwrap();

        let reopened = JsonStore::open(dir.path()).unwrap();
        let patterns = reopened.load_patterns().await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].strategy, "device_reconnect");
        assert_eq!(patterns[0].successes, 3);
    }

    #[tokio::test]
    async fn test_json_store_health_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let status = HealthStatus {
            instance_id: "home".into(),
            automation_id: "automation.evening".into(),
            consecutive_successes: 2,
            consecutive_failures: 0,
            lifetime_successes: 7,
            lifetime_total: 9,
            validated_healthy: false,
            validated_at: None,
        };
        store.save_health(&status).await.unwrap();

        let reopened = JsonStore::open(dir.path()).unwrap();
        let rows = reopened.load_health().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].lifetime_total, 9);
    }

    #[tokio::test]
    async fn test_json_store_empty_dir_reads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        assert!(store.attempts_for(Uuid::new_v4()).await.unwrap().is_empty());
        assert!(store.load_patterns().await.unwrap().is_empty());
        assert!(store.load_health().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_transport_replies_in_order() {
        let transport = ScriptedTransport::accepting();
        transport.script(
            "light.lr",
            "turn_on",
            vec![
                ScriptedReply::Reject("busy".into()),
                ScriptedReply::TransportError("timeout".into()),
                ScriptedReply::Accept,
            ],
        );

        let params = serde_json::json!({});
        let first = transport.invoke("light.lr", "turn_on", &params).await.unwrap();
        assert!(!first.accepted);

        let second = transport.invoke("light.lr", "turn_on", &params).await;
        assert!(second.is_err());

        let third = transport.invoke("light.lr", "turn_on", &params).await.unwrap();
        assert!(third.accepted);

        // Exhausted script falls back to the default.
        let fourth = transport.invoke("light.lr", "turn_on", &params).await.unwrap();
        assert!(fourth.accepted);

        assert_eq!(transport.journal().len(), 4);
    }

    #[tokio::test]
    async fn test_static_desired_state() {
        let desired = StaticDesiredState::new().with("automation.a", "light.lr", "on");
        let states = desired.expected_states("automation.a").await.unwrap();
        assert_eq!(states.get("light.lr"), Some(&"on".to_string()));
        assert!(desired.expected_states("automation.b").await.is_none());
    }

    #[tokio::test]
    async fn test_static_registry_and_device_entry() {
        let entry = DeviceEntry {
            device_id: "dev-1".into(),
            integration: "zwave".into(),
            supported: vec![DeviceAction::Reconnect],
        };
        assert!(entry.supports(DeviceAction::Reconnect));
        assert!(!entry.supports(DeviceAction::Reboot));

        let registry = StaticRegistry::new().with("light.lr", entry);
        assert!(registry.device_for("light.lr").await.is_some());
        assert!(registry.device_for("light.kitchen").await.is_none());
    }

    #[tokio::test]
    async fn test_memory_notifier_collects() {
        let notifier = MemoryNotifier::new();
        notifier
            .notify(&Escalation {
                episode_id: Uuid::new_v4(),
                subject_ids: vec!["light.lr".into()],
                attempts_tried: 3,
                last_error: None,
            })
            .await;
        assert_eq!(notifier.sent().len(), 1);
    }
}

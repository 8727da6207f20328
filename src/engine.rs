//! Healing Engine
//!
//! One logical control loop per managed platform instance. Incoming
//! platform events are dispatched inline (cache update, health bookkeeping,
//! deferred-check scheduling); everything that may suspend on the outside
//! world runs inside spawned cascade tasks, so a slow remediation action
//! never stalls ingestion.

use crate::breaker::CircuitGuard;
use crate::config::Config;
use crate::detector::FailureDetector;
use crate::errors::{AutomedicError, Result};
use crate::events::{ExecutionEvent, FailureSignal, PlatformEvent, StateEvent};
use crate::healers::{DeviceHealer, EntityHealer, Healer, IntegrationHealer, RetrySchedule};
use crate::health::{HealthStatus, HealthTracker};
use crate::orchestrator::{CascadeOrchestrator, EpisodeReport};
use crate::patterns::{ReliabilityAnalyzer, ReliabilityMetric};
use crate::state_cache::StateCache;
use crate::store::{
    CommandTransport, DesiredStateSource, DeviceRegistry, DurableStore, LogNotifier, MemoryStore,
    Notifier, ScriptedTransport, StaticDesiredState, StaticRegistry,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// Handle for feeding events into a running engine and querying it.
#[derive(Clone)]
pub struct EngineHandle {
    events: mpsc::Sender<PlatformEvent>,
    shutdown: watch::Sender<bool>,
    cache: Arc<StateCache>,
    health: Arc<HealthTracker>,
    analyzer: Arc<ReliabilityAnalyzer>,
    orchestrator: Arc<CascadeOrchestrator>,
}

impl EngineHandle {
    pub async fn send(&self, event: PlatformEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| AutomedicError::Configuration("engine event channel closed".to_string()))
    }

    /// Request a cooperative shutdown of the control loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn reliability_stats(&self, category: Option<&str>) -> Vec<ReliabilityMetric> {
        self.analyzer.stats(category)
    }

    pub async fn health_status(
        &self,
        instance_id: &str,
        automation_id: &str,
    ) -> Option<HealthStatus> {
        self.health.status(instance_id, automation_id).await
    }

    pub fn report_episode(&self, subject_id: &str) -> Option<EpisodeReport> {
        self.orchestrator.report_episode(subject_id)
    }

    pub fn abort_episode(&self, subject_id: &str) -> bool {
        self.orchestrator.abort_episode(subject_id)
    }

    pub fn active_cascades(&self) -> usize {
        self.orchestrator.active_count()
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }
}

/// Wires collaborators into an engine. Every collaborator defaults to an
/// in-memory implementation, so a bare builder yields a self-contained
/// engine suitable for dry runs.
pub struct EngineBuilder {
    config: Config,
    store: Option<Arc<dyn DurableStore>>,
    transport: Option<Arc<dyn CommandTransport>>,
    registry: Option<Arc<dyn DeviceRegistry>>,
    desired: Option<Arc<dyn DesiredStateSource>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            transport: None,
            registry: None,
            desired: None,
            notifier: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn CommandTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn DeviceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn desired_state(mut self, desired: Arc<dyn DesiredStateSource>) -> Self {
        self.desired = Some(desired);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> (HealingEngine, EngineHandle) {
        let config = self.config;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ScriptedTransport::accepting()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(StaticRegistry::new()));
        let desired = self
            .desired
            .unwrap_or_else(|| Arc::new(StaticDesiredState::new()));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cache = Arc::new(StateCache::new());
        let analyzer = Arc::new(ReliabilityAnalyzer::new(
            config.patterns.clone(),
            store.clone(),
        ));
        let health = Arc::new(HealthTracker::new(config.health.clone(), store.clone()));
        let guard = Arc::new(CircuitGuard::new(&config.breaker));

        let schedule = RetrySchedule::new(
            &config.cascade.entity_retry_delays_ms,
            config.cascade.retry_jitter_ms,
        );
        let healers: Vec<Arc<dyn Healer>> = vec![
            Arc::new(EntityHealer::new(
                transport.clone(),
                analyzer.clone(),
                schedule,
            )),
            Arc::new(DeviceHealer::new(
                registry.clone(),
                transport.clone(),
                analyzer.clone(),
            )),
            Arc::new(IntegrationHealer::new(registry, transport, analyzer.clone())),
        ];
        let orchestrator = Arc::new(CascadeOrchestrator::new(
            config.cascade.clone(),
            guard,
            analyzer.clone(),
            health.clone(),
            healers,
            notifier,
        ));

        let detector = FailureDetector::new(
            config.validation_window(),
            config.instance_id.clone(),
            &config.watch,
            cache.clone(),
            desired,
            signals_tx,
        );

        let handle = EngineHandle {
            events: events_tx,
            shutdown: shutdown_tx,
            cache: cache.clone(),
            health: health.clone(),
            analyzer: analyzer.clone(),
            orchestrator: orchestrator.clone(),
        };

        let engine = HealingEngine {
            instance_id: config.instance_id,
            cache,
            detector,
            health,
            analyzer,
            orchestrator,
            events_rx,
            signals_rx,
            shutdown_rx,
        };
        (engine, handle)
    }
}

pub struct HealingEngine {
    instance_id: String,
    cache: Arc<StateCache>,
    detector: FailureDetector,
    health: Arc<HealthTracker>,
    analyzer: Arc<ReliabilityAnalyzer>,
    orchestrator: Arc<CascadeOrchestrator>,
    events_rx: mpsc::Receiver<PlatformEvent>,
    signals_rx: mpsc::Receiver<FailureSignal>,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealingEngine {
    /// Run the control loop until shutdown or all senders hang up.
    pub async fn run(mut self) {
        self.analyzer.load().await;
        self.health.load().await;
        info!(instance = %self.instance_id, "healing engine started");

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.dispatch(event).await,
                        None => break,
                    }
                }
                signal = self.signals_rx.recv() => {
                    if let Some(signal) = signal {
                        self.on_signal(signal).await;
                    }
                    // Detector holds a sender clone for the engine's
                    // lifetime, so None cannot occur before shutdown.
                }
            }
        }

        info!(instance = %self.instance_id, "healing engine stopped");
    }

    async fn dispatch(&self, event: PlatformEvent) {
        match event {
            PlatformEvent::State(ev) => self.on_state(ev),
            PlatformEvent::Execution(ev) => self.on_execution(ev).await,
        }
    }

    fn on_state(&self, event: StateEvent) {
        if self.cache.apply(&event) {
            self.detector.on_state_change(&event);
        } else {
            debug!(subject = %event.subject_id, "stale state event ignored");
        }
    }

    async fn on_execution(&self, event: ExecutionEvent) {
        self.health
            .record_outcome(&event.instance_id, &event.automation_id, event.success)
            .await;
        self.detector.on_execution(&event);
    }

    async fn on_signal(&self, signal: FailureSignal) {
        // One health failure per detected mismatch for the owning
        // automation, recorded whether or not a cascade opens.
        if let Some(automation) = &signal.automation_id {
            self.health
                .record_outcome(&signal.instance_id, automation, false)
                .await;
        }

        self.detector.cancel_pending(&signal.subject_id);

        match self.orchestrator.submit(signal) {
            Ok(episode_id) => debug!(episode = %episode_id, "cascade opened"),
            Err(AutomedicError::EpisodeConflict { subject }) => {
                debug!(subject = %subject, "subject already has an active cascade, signal dropped");
            }
            Err(e) => warn!(error = %e, "failed to open cascade"),
        }
    }
}

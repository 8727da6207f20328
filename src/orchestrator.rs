//! Cascade Orchestrator
//!
//! Top-level state machine driving one remediation cascade per failure
//! episode: route (intelligent jump from history, else sequential), gate
//! every target through the circuit guard, walk the level healers in
//! blast-radius order, and end Resolved or Escalated. Cascades for
//! different subjects run concurrently on a bounded pool; at most one
//! cascade is active per subject at any instant.

use crate::breaker::{Admission, CircuitGuard, DenyReason};
use crate::config::CascadeConfig;
use crate::errors::{AutomedicError, Result};
use crate::events::{Escalation, FailureSignal};
use crate::healers::{record_attempt, FailureContext, HealLevel, Healer};
use crate::health::HealthTracker;
use crate::patterns::{AttemptOutcome, ReliabilityAnalyzer};
use crate::store::Notifier;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where a cascade currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeState {
    Pending,
    RoutingDecision,
    Level(HealLevel),
    Resolved,
    Escalated,
}

/// Snapshot of an in-flight (or just-finished) cascade for dashboards.
#[derive(Debug, Clone)]
pub struct EpisodeReport {
    pub episode_id: Uuid,
    pub subject_id: String,
    pub state: CascadeState,
    pub attempts_tried: u32,
}

/// Shared progress counters, visible to the timeout path.
struct Progress {
    attempts: AtomicU32,
    last_error: Mutex<Option<String>>,
}

struct ActiveEpisode {
    episode_id: Uuid,
    cancel: watch::Sender<bool>,
    state: Arc<Mutex<CascadeState>>,
    progress: Arc<Progress>,
}

enum LevelOutcome {
    Resolved,
    Failed { last_error: Option<String> },
    Cancelled,
}

pub struct CascadeOrchestrator {
    config: CascadeConfig,
    guard: Arc<CircuitGuard>,
    analyzer: Arc<ReliabilityAnalyzer>,
    health: Arc<HealthTracker>,
    healers: Vec<Arc<dyn Healer>>,
    notifier: Arc<dyn Notifier>,
    pool: Arc<Semaphore>,
    active: Mutex<HashMap<String, ActiveEpisode>>,
}

impl CascadeOrchestrator {
    pub fn new(
        config: CascadeConfig,
        guard: Arc<CircuitGuard>,
        analyzer: Arc<ReliabilityAnalyzer>,
        health: Arc<HealthTracker>,
        healers: Vec<Arc<dyn Healer>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            guard,
            analyzer,
            health,
            healers,
            notifier,
            pool,
            active: Mutex::new(HashMap::new()),
        }
    }

    fn healer_for(&self, level: HealLevel) -> Option<Arc<dyn Healer>> {
        self.healers.iter().find(|h| h.level() == level).cloned()
    }

    /// Open a cascade for the signal. A subject with an active cascade
    /// rejects the new signal; the caller logs and drops it.
    pub fn submit(self: &Arc<Self>, signal: FailureSignal) -> Result<Uuid> {
        let subject = signal.subject_id.clone();
        let episode_id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = Arc::new(Mutex::new(CascadeState::Pending));
        let progress = Arc::new(Progress {
            attempts: AtomicU32::new(0),
            last_error: Mutex::new(None),
        });

        {
            let mut active = self.active.lock();
            if active.contains_key(&subject) {
                return Err(AutomedicError::EpisodeConflict { subject });
            }
            active.insert(
                subject.clone(),
                ActiveEpisode {
                    episode_id,
                    cancel: cancel_tx.clone(),
                    state: state.clone(),
                    progress: progress.clone(),
                },
            );
        }

        let ctx = FailureContext {
            episode_id,
            subject_id: signal.subject_id.clone(),
            instance_id: signal.instance_id.clone(),
            category: signal.category.clone(),
            kind: signal.kind,
            entities: signal.failed_entities(),
            original_command: signal.original_command.clone(),
            expected: signal.expected.clone(),
        };
        let automation_id = signal.automation_id.clone();

        info!(
            episode = %episode_id,
            subject = %ctx.subject_id,
            kind = %ctx.kind,
            "opening failure episode"
        );

        let orch = Arc::clone(self);
        tokio::spawn(async move {
            orch.drive(ctx, automation_id, cancel_tx, cancel_rx, state, progress)
                .await;
        });

        Ok(episode_id)
    }

    /// Full lifecycle of one cascade: pool admission, bounded run, terminal
    /// bookkeeping, active-map cleanup.
    async fn drive(
        self: Arc<Self>,
        ctx: FailureContext,
        automation_id: Option<String>,
        cancel_tx: watch::Sender<bool>,
        cancel_rx: watch::Receiver<bool>,
        state: Arc<Mutex<CascadeState>>,
        progress: Arc<Progress>,
    ) {
        let subject = ctx.subject_id.clone();
        let permit = self.pool.clone().acquire_owned().await;
        if permit.is_err() {
            // Pool closed only on shutdown; drop the episode quietly.
            self.active.lock().remove(&subject);
            return;
        }

        let run = self.run_cascade(&ctx, &cancel_rx, &state, &progress);
        let resolved = match tokio::time::timeout(self.config.timeout(), run).await {
            Ok(resolved) => resolved,
            Err(_) => {
                warn!(episode = %ctx.episode_id, subject = %subject, "cascade timed out, cancelling");
                let _ = cancel_tx.send(true);
                false
            }
        };

        if resolved {
            *state.lock() = CascadeState::Resolved;
            info!(episode = %ctx.episode_id, subject = %subject, "cascade resolved");
            if let Some(automation) = &automation_id {
                self.health
                    .record_outcome(&ctx.instance_id, automation, true)
                    .await;
            }
        } else {
            *state.lock() = CascadeState::Escalated;
            let escalation = Escalation {
                episode_id: ctx.episode_id,
                subject_ids: ctx.entities.clone(),
                attempts_tried: progress.attempts.load(Ordering::SeqCst),
                last_error: progress.last_error.lock().clone(),
            };
            warn!(
                episode = %ctx.episode_id,
                subject = %subject,
                attempts = escalation.attempts_tried,
                "cascade exhausted, escalating"
            );
            // Exactly one hand-off per escalated episode, even if every
            // store write failed along the way.
            self.notifier.notify(&escalation).await;
        }

        self.active.lock().remove(&subject);
    }

    /// Routing decision plus the level walk. Returns true when some level
    /// resolved every originally-failed target.
    async fn run_cascade(
        &self,
        ctx: &FailureContext,
        cancel: &watch::Receiver<bool>,
        state: &Arc<Mutex<CascadeState>>,
        progress: &Arc<Progress>,
    ) -> bool {
        *state.lock() = CascadeState::RoutingDecision;

        // Pattern lookup is an optimization, never a dependency: no match
        // (or an unreachable store at load time) means sequential routing.
        // A match jumps to the recorded level with the recorded strategy
        // tried first; the broader fallback levels run their normal ladder.
        let plan: Vec<(HealLevel, Option<String>)> =
            match self.analyzer.lookup(&ctx.category, ctx.kind) {
                Some((level, strategy)) => {
                    info!(
                        episode = %ctx.episode_id,
                        level = %level,
                        strategy = %strategy,
                        "intelligent routing from reliability pattern"
                    );
                    let mut plan = vec![(level, Some(strategy))];
                    let mut next = level.broader();
                    while let Some(l) = next {
                        plan.push((l, None));
                        next = l.broader();
                    }
                    plan
                }
                None => HealLevel::ALL.iter().map(|l| (*l, None)).collect(),
            };

        for (level, preferred) in plan {
            if *cancel.borrow() {
                return false;
            }
            *state.lock() = CascadeState::Level(level);
            match self
                .run_level(level, preferred.as_deref(), ctx, cancel, progress)
                .await
            {
                LevelOutcome::Resolved => return true,
                LevelOutcome::Failed { last_error } => {
                    if let Some(e) = last_error {
                        *progress.last_error.lock() = Some(e);
                    }
                }
                LevelOutcome::Cancelled => return false,
            }
        }
        false
    }

    /// Gate the level's targets through the circuit guard, invoke the
    /// healer on the admitted ones, and feed the outcomes back per target.
    async fn run_level(
        &self,
        level: HealLevel,
        preferred: Option<&str>,
        ctx: &FailureContext,
        cancel: &watch::Receiver<bool>,
        progress: &Arc<Progress>,
    ) -> LevelOutcome {
        let Some(healer) = self.healer_for(level) else {
            warn!(level = %level, "no healer registered for level");
            return LevelOutcome::Failed { last_error: None };
        };

        let targets = healer.targets(ctx).await;
        if targets.is_empty() {
            debug!(episode = %ctx.episode_id, level = %level, "level has no targets, skipping");
            return LevelOutcome::Failed { last_error: None };
        }

        let mut allowed = Vec::new();
        let mut denied = 0usize;
        for target in targets {
            match self.guard.allow(&target) {
                Admission::Allowed => allowed.push(target),
                Admission::Denied { reason, retry_after } => {
                    denied += 1;
                    let detail = match reason {
                        DenyReason::BreakerOpen => AutomedicError::BreakerOpen {
                            target: target.clone(),
                            retry_after,
                        }
                        .to_string(),
                        DenyReason::Cooldown => {
                            format!("cooldown for {target}, retry in {}s", retry_after.as_secs())
                        }
                    };
                    debug!(target = %target, level = %level, %detail, "target denied");
                    record_attempt(
                        &self.analyzer,
                        ctx,
                        level,
                        "breaker_open",
                        &target,
                        serde_json::Value::Null,
                        AttemptOutcome::BreakerOpen,
                        Some(detail),
                        Instant::now(),
                    )
                    .await;
                }
            }
        }

        if allowed.is_empty() {
            return LevelOutcome::Failed {
                last_error: Some(format!("all {level} targets denied by breaker")),
            };
        }

        let result = healer.heal(ctx, &allowed, preferred, cancel).await;
        progress.attempts.fetch_add(result.attempts, Ordering::SeqCst);

        for target in &allowed {
            if result.unresolved.contains(target) {
                self.guard.record_failure(target);
            } else {
                self.guard.record_success(target);
            }
        }

        if *cancel.borrow() {
            return LevelOutcome::Cancelled;
        }

        // Denied targets were never attempted, so even a clean heal of the
        // admitted ones leaves the episode unresolved at this level.
        if result.success && denied == 0 {
            LevelOutcome::Resolved
        } else {
            LevelOutcome::Failed {
                last_error: Some(result.detail),
            }
        }
    }

    /// Snapshot of the subject's in-flight cascade, for dashboards.
    pub fn report_episode(&self, subject_id: &str) -> Option<EpisodeReport> {
        let active = self.active.lock();
        let episode = active.get(subject_id)?;
        let state = *episode.state.lock();
        Some(EpisodeReport {
            episode_id: episode.episode_id,
            subject_id: subject_id.to_string(),
            state,
            attempts_tried: episode.progress.attempts.load(Ordering::SeqCst),
        })
    }

    /// Cooperatively cancel the subject's cascade. Attempts already issued
    /// stay persisted; the episode ends Escalated.
    pub fn abort_episode(&self, subject_id: &str) -> bool {
        let active = self.active.lock();
        match active.get(subject_id) {
            Some(episode) => {
                info!(subject = %subject_id, episode = %episode.episode_id, "abort requested");
                let _ = episode.cancel.send(true);
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

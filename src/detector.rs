//! Failure Detector
//!
//! Decides when a failure episode should open. Two detections:
//!
//! - State mismatch: after an automation execution, wait a validation
//!   window for the expected entity states to converge; emit a signal if
//!   they have not when the window elapses.
//! - Trigger miss: a watched trigger entity changed state but no execution
//!   for the owning automation arrived within the window.
//!
//! Windows are deferred timer tasks, never blocking waits, so the control
//! loop stays responsive while checks are pending. Rapid state changes
//! inside a window coalesce naturally: the deadline check reads the cache
//! once, seeing only the most recent value.

use crate::config::AutomationWatch;
use crate::errors::AutomedicError;
use crate::events::{category_of, ExecutionEvent, FailureKind, FailureSignal, StateEvent};
use crate::state_cache::StateCache;
use crate::store::DesiredStateSource;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bound on the (automation, execution) dedup set.
const SEEN_CAPACITY: usize = 4096;

type ExecutionKey = (String, String);

#[derive(Default)]
struct DetectorInner {
    /// Execution pairs a signal may never be emitted twice for.
    seen: HashSet<ExecutionKey>,
    seen_order: VecDeque<ExecutionKey>,
    /// Latest execution timestamp per automation, for trigger-miss checks.
    last_execution: HashMap<String, DateTime<Utc>>,
    /// Pending validation-window tasks per subject / execution.
    validations: HashMap<String, HashMap<String, JoinHandle<()>>>,
    /// Pending trigger-miss tasks, one per automation.
    trigger_checks: HashMap<String, JoinHandle<()>>,
}

#[derive(Clone)]
pub struct FailureDetector {
    window: Duration,
    instance_id: String,
    cache: Arc<StateCache>,
    desired: Arc<dyn DesiredStateSource>,
    signals: mpsc::Sender<FailureSignal>,
    /// Trigger entity → automations it should fire.
    triggers: Arc<HashMap<String, Vec<String>>>,
    inner: Arc<Mutex<DetectorInner>>,
}

impl FailureDetector {
    pub fn new(
        window: Duration,
        instance_id: String,
        watches: &[AutomationWatch],
        cache: Arc<StateCache>,
        desired: Arc<dyn DesiredStateSource>,
        signals: mpsc::Sender<FailureSignal>,
    ) -> Self {
        let mut triggers: HashMap<String, Vec<String>> = HashMap::new();
        for watch in watches {
            for entity in &watch.trigger_entities {
                triggers
                    .entry(entity.clone())
                    .or_default()
                    .push(watch.automation_id.clone());
            }
        }
        Self {
            window,
            instance_id,
            cache,
            desired,
            signals,
            triggers: Arc::new(triggers),
            inner: Arc::new(Mutex::new(DetectorInner::default())),
        }
    }

    /// Record the execution and schedule a deferred convergence check.
    pub fn on_execution(&self, event: &ExecutionEvent) {
        let automation = event.automation_id.clone();
        let execution = event.execution_id.clone();
        let key = (automation.clone(), execution.clone());

        {
            let mut inner = self.inner.lock();
            inner.last_execution.insert(automation.clone(), event.timestamp);
            if inner.seen.contains(&key) {
                debug!(
                    automation = %automation,
                    execution = %execution,
                    "duplicate execution event, validation already scheduled"
                );
                return;
            }
            inner.seen.insert(key.clone());
            inner.seen_order.push_back(key);
            while inner.seen_order.len() > SEEN_CAPACITY {
                if let Some(old) = inner.seen_order.pop_front() {
                    inner.seen.remove(&old);
                }
            }
        }

        let detector = self.clone();
        let handle = tokio::spawn({
            let automation = automation.clone();
            let execution = execution.clone();
            async move {
                tokio::time::sleep(detector.window).await;
                detector.validate_execution(&automation, &execution).await;
                let mut inner = detector.inner.lock();
                if let Some(pending) = inner.validations.get_mut(&automation) {
                    pending.remove(&execution);
                    if pending.is_empty() {
                        inner.validations.remove(&automation);
                    }
                }
            }
        });

        self.inner
            .lock()
            .validations
            .entry(automation)
            .or_default()
            .insert(execution, handle);
    }

    /// Deadline check for one execution: compare expected states against
    /// the cache and emit a signal on any mismatch.
    async fn validate_execution(&self, automation: &str, execution: &str) {
        let Some(expected) = self.desired.expected_states(automation).await else {
            debug!(automation = %automation, "no desired-state mapping, nothing to validate");
            return;
        };

        let mut mismatched: HashMap<String, String> = HashMap::new();
        let mut observed: HashMap<String, Option<String>> = HashMap::new();
        for (entity, want) in &expected {
            let actual = self.cache.current_state(entity);
            if actual.as_deref() != Some(want.as_str()) {
                mismatched.insert(entity.clone(), want.clone());
                observed.insert(entity.clone(), actual);
            }
        }

        if mismatched.is_empty() {
            debug!(automation = %automation, execution = %execution, "expected state converged");
            return;
        }

        let timeout = AutomedicError::ValidationTimeout {
            subject: automation.to_string(),
            window_secs: self.window.as_secs(),
        };
        warn!(execution = %execution, error = %timeout, "validation window missed");

        let category = {
            let mut entities: Vec<&String> = mismatched.keys().collect();
            entities.sort();
            category_of(entities[0])
        };
        let signal = FailureSignal {
            subject_id: automation.to_string(),
            category,
            kind: FailureKind::StateMismatch,
            instance_id: self.instance_id.clone(),
            automation_id: Some(automation.to_string()),
            execution_id: Some(execution.to_string()),
            expected: mismatched,
            observed,
            original_command: None,
            detected_at: Utc::now(),
        };
        self.emit(signal).await;
    }

    /// A state change arrived. If the entity triggers watched automations,
    /// schedule trigger-miss checks for each one without a check pending.
    pub fn on_state_change(&self, event: &StateEvent) {
        let Some(automations) = self.triggers.get(&event.subject_id) else {
            return;
        };

        for automation in automations {
            let mut inner = self.inner.lock();
            if inner.trigger_checks.contains_key(automation) {
                continue;
            }

            let detector = self.clone();
            let automation_owned = automation.clone();
            let trigger_entity = event.subject_id.clone();
            let triggered_at = event.timestamp;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(detector.window).await;
                detector
                    .check_trigger(&automation_owned, &trigger_entity, triggered_at)
                    .await;
                detector.inner.lock().trigger_checks.remove(&automation_owned);
            });
            inner.trigger_checks.insert(automation.clone(), handle);
        }
    }

    /// Deadline check for one trigger: an execution must have arrived at or
    /// after the trigger's timestamp.
    async fn check_trigger(
        &self,
        automation: &str,
        trigger_entity: &str,
        triggered_at: DateTime<Utc>,
    ) {
        let executed = self
            .inner
            .lock()
            .last_execution
            .get(automation)
            .map(|ts| *ts >= triggered_at)
            .unwrap_or(false);
        if executed {
            return;
        }

        let mut observed = HashMap::new();
        observed.insert(
            trigger_entity.to_string(),
            self.cache.current_state(trigger_entity),
        );
        let signal = FailureSignal {
            subject_id: automation.to_string(),
            category: category_of(automation),
            kind: FailureKind::ExecutionOutcomeMismatch,
            instance_id: self.instance_id.clone(),
            automation_id: Some(automation.to_string()),
            execution_id: None,
            expected: HashMap::new(),
            observed,
            original_command: None,
            detected_at: Utc::now(),
        };
        self.emit(signal).await;
    }

    async fn emit(&self, signal: FailureSignal) {
        debug!(
            subject = %signal.subject_id,
            kind = %signal.kind,
            "failure detected"
        );
        if self.signals.send(signal).await.is_err() {
            warn!("signal channel closed, dropping failure signal");
        }
    }

    /// Cancel every pending deferred check for a subject. Called when its
    /// episode opens, so a window scheduled before the episode cannot fire
    /// into an active cascade.
    pub fn cancel_pending(&self, subject_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(pending) = inner.validations.remove(subject_id) {
            for (_, handle) in pending {
                handle.abort();
            }
        }
        if let Some(handle) = inner.trigger_checks.remove(subject_id) {
            handle.abort();
        }
    }

    /// Pending deferred checks, for introspection.
    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.validations.values().map(|v| v.len()).sum::<usize>()
            + inner.trigger_checks.len()
    }
}

//! Circuit Breaker / Cooldown Guard
//!
//! Shared safety gate consulted immediately before every remediation
//! attempt, whichever level is acting — intelligent routing is never
//! permitted to bypass it. One state machine per target id:
//! Closed → Open (threshold failures within the window) → HalfOpen
//! (exactly one trial after the reset interval) → Closed or back to Open.
//!
//! A per-target cooldown is enforced independently of the breaker state
//! and blocks rapid re-attempts even while Closed. State is keyed per
//! target with per-key locking; there is no global lock across targets.

use crate::config::BreakerConfig;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// The breaker is open (or a half-open trial is already in flight).
    BreakerOpen,
    /// The per-target cooldown since the last attempt has not elapsed.
    Cooldown,
}

/// Answer from the gate. `Allowed` stamps the target's cooldown clock, so
/// a slow remediation cannot be immediately re-attempted in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied {
        reason: DenyReason,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

#[derive(Debug)]
struct TargetState {
    state: BreakerState,
    /// Failure timestamps within the rolling window.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    last_attempt: Option<Instant>,
}

impl TargetState {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            last_attempt: None,
        }
    }
}

pub struct CircuitGuard {
    threshold: u32,
    reset_interval: Duration,
    cooldown: Duration,
    targets: RwLock<HashMap<String, Arc<Mutex<TargetState>>>>,
}

impl CircuitGuard {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            threshold: config.failure_threshold,
            reset_interval: Duration::from_secs(config.reset_interval_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
            targets: RwLock::new(HashMap::new()),
        }
    }

    fn target(&self, target_id: &str) -> Arc<Mutex<TargetState>> {
        if let Some(t) = self.targets.read().get(target_id) {
            return t.clone();
        }
        let mut targets = self.targets.write();
        targets
            .entry(target_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TargetState::new())))
            .clone()
    }

    /// Gate one attempt against one target. Must be called immediately
    /// before invoking a healer strategy on that target.
    pub fn allow(&self, target_id: &str) -> Admission {
        let target = self.target(target_id);
        let mut st = target.lock();
        let now = Instant::now();

        match st.state {
            BreakerState::Open => {
                let opened_at = st.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened_at);
                if elapsed >= self.reset_interval {
                    // Exactly one trial attempt while half-open.
                    st.state = BreakerState::HalfOpen;
                    st.last_attempt = Some(now);
                    info!(target = %target_id, "breaker half-open, admitting trial attempt");
                    Admission::Allowed
                } else {
                    Admission::Denied {
                        reason: DenyReason::BreakerOpen,
                        retry_after: self.reset_interval - elapsed,
                    }
                }
            }
            BreakerState::HalfOpen => Admission::Denied {
                reason: DenyReason::BreakerOpen,
                retry_after: self.cooldown,
            },
            BreakerState::Closed => {
                if let Some(last) = st.last_attempt {
                    let since = now.duration_since(last);
                    if since < self.cooldown {
                        return Admission::Denied {
                            reason: DenyReason::Cooldown,
                            retry_after: self.cooldown - since,
                        };
                    }
                }
                st.last_attempt = Some(now);
                Admission::Allowed
            }
        }
    }

    /// Record a successful attempt outcome for the target.
    pub fn record_success(&self, target_id: &str) {
        let target = self.target(target_id);
        let mut st = target.lock();
        match st.state {
            BreakerState::HalfOpen => {
                info!(target = %target_id, "trial succeeded, closing breaker");
                st.state = BreakerState::Closed;
                st.failures.clear();
                st.opened_at = None;
            }
            _ => {
                st.failures.clear();
            }
        }
    }

    /// Record a failed attempt outcome for the target.
    pub fn record_failure(&self, target_id: &str) {
        let target = self.target(target_id);
        let mut st = target.lock();
        let now = Instant::now();

        match st.state {
            BreakerState::HalfOpen => {
                warn!(target = %target_id, "trial failed, reopening breaker");
                st.state = BreakerState::Open;
                st.opened_at = Some(now);
            }
            BreakerState::Closed => {
                st.failures.push_back(now);
                if let Some(window_start) = now.checked_sub(self.reset_interval) {
                    while st
                        .failures
                        .front()
                        .map(|&t| t < window_start)
                        .unwrap_or(false)
                    {
                        st.failures.pop_front();
                    }
                }
                if st.failures.len() >= self.threshold as usize {
                    warn!(
                        target = %target_id,
                        failures = st.failures.len(),
                        "failure threshold reached, opening breaker"
                    );
                    st.state = BreakerState::Open;
                    st.opened_at = Some(now);
                }
            }
            BreakerState::Open => {
                debug!(target = %target_id, "failure recorded while breaker already open");
            }
        }
    }

    pub fn state(&self, target_id: &str) -> BreakerState {
        self.target(target_id).lock().state
    }
}

//! Health Tracker
//!
//! Per-automation rolling counters with a "validated healthy" gate.
//! One row per (instance, automation) pair — upsert semantics, never
//! duplicated. Updates are totally ordered per key: a short-lived registry
//! lock hands out a per-key async mutex, and the read-modify-write plus
//! persistence happen under that key's lock, so concurrent recordings for
//! the same automation cannot lose an update.

use crate::config::HealthConfig;
use crate::store::DurableStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Rolling health counters for one automation on one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub instance_id: String,
    pub automation_id: String,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub lifetime_successes: u64,
    pub lifetime_total: u64,
    pub validated_healthy: bool,
    pub validated_at: Option<DateTime<Utc>>,
}

impl HealthStatus {
    fn fresh(instance_id: &str, automation_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            automation_id: automation_id.to_string(),
            consecutive_successes: 0,
            consecutive_failures: 0,
            lifetime_successes: 0,
            lifetime_total: 0,
            validated_healthy: false,
            validated_at: None,
        }
    }

    /// Lifetime success ratio. No executions yet is 0.0, not an error.
    pub fn reliability_score(&self) -> f64 {
        if self.lifetime_total == 0 {
            0.0
        } else {
            self.lifetime_successes as f64 / self.lifetime_total as f64
        }
    }
}

type HealthKey = (String, String);

pub struct HealthTracker {
    config: HealthConfig,
    store: Arc<dyn DurableStore>,
    rows: RwLock<HashMap<HealthKey, Arc<Mutex<HealthStatus>>>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig, store: Arc<dyn DurableStore>) -> Self {
        Self {
            config,
            store,
            rows: RwLock::new(HashMap::new()),
        }
    }

    fn row(&self, instance_id: &str, automation_id: &str) -> Arc<Mutex<HealthStatus>> {
        let key = (instance_id.to_string(), automation_id.to_string());
        if let Some(row) = self.rows.read().get(&key) {
            return row.clone();
        }
        let mut rows = self.rows.write();
        rows.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(HealthStatus::fresh(instance_id, automation_id))))
            .clone()
    }

    /// Warm the rows from the durable store, so counters survive a
    /// restart. A store error leaves the tracker empty rather than failing.
    pub async fn load(&self) {
        match self.store.load_health().await {
            Ok(statuses) => {
                let mut rows = self.rows.write();
                for status in statuses {
                    let key = (status.instance_id.clone(), status.automation_id.clone());
                    rows.insert(key, Arc::new(Mutex::new(status)));
                }
            }
            Err(e) => {
                warn!(error = %e, "health store unreachable, starting with empty rows");
            }
        }
    }

    /// Record one execution outcome. First call for an unseen pair creates
    /// the row with zeroed counters before applying the outcome.
    pub async fn record_outcome(
        &self,
        instance_id: &str,
        automation_id: &str,
        success: bool,
    ) -> HealthStatus {
        let row = self.row(instance_id, automation_id);
        let mut status = row.lock().await;

        status.lifetime_total += 1;
        if success {
            status.lifetime_successes += 1;
            status.consecutive_successes += 1;
            status.consecutive_failures = 0;
            if status.consecutive_successes >= self.config.validated_threshold
                && !status.validated_healthy
            {
                status.validated_healthy = true;
                status.validated_at = Some(Utc::now());
                debug!(
                    automation = %automation_id,
                    streak = status.consecutive_successes,
                    "automation validated healthy"
                );
            }
        } else {
            status.consecutive_failures += 1;
            status.consecutive_successes = 0;
            status.validated_healthy = false;
            status.validated_at = None;
        }

        let snapshot = status.clone();
        // Persist under the key lock so store writes stay ordered per row.
        if let Err(e) = self.store.save_health(&snapshot).await {
            warn!(automation = %automation_id, error = %e, "health persistence failed, keeping in-memory row");
        }
        snapshot
    }

    pub async fn status(&self, instance_id: &str, automation_id: &str) -> Option<HealthStatus> {
        let key = (instance_id.to_string(), automation_id.to_string());
        let row = self.rows.read().get(&key).cloned()?;
        let status = row.lock().await;
        Some(status.clone())
    }
}

//! Configuration Management
//!
//! Loads engine configuration from TOML files. Configuration covers:
//! - Detection (validation window)
//! - Health gating (validated-healthy threshold)
//! - Circuit breaker and per-entity cooldown
//! - Cascade behavior (timeout, concurrency, retry schedule)
//! - Pattern matching thresholds for intelligent routing
//! - Watched automations and their trigger entities

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identifier of the managed platform instance.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub cascade: CascadeConfig,

    #[serde(default)]
    pub patterns: PatternConfig,

    /// Directory holding the engine's durable records (attempt log,
    /// pattern and health snapshots). Defaults to the user data dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Automations to watch for trigger-fires-but-nothing-happens
    /// detection. The platform does not expose trigger wiring, so it is
    /// declared here.
    #[serde(default)]
    pub watch: Vec<AutomationWatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// How long to wait for expected state to converge after an execution.
    #[serde(default = "default_validation_window")]
    pub validation_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Consecutive successes required before an automation is considered
    /// validated healthy.
    #[serde(default = "default_validated_threshold")]
    pub validated_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures within the rolling window before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time an open breaker waits before allowing a half-open trial. Also
    /// the length of the rolling failure window.
    #[serde(default = "default_reset_interval")]
    pub reset_interval_secs: u64,
    /// Per-target cooldown between attempts, enforced independently of the
    /// breaker state.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Hard bound on total cascade duration. Exceeding it forces
    /// escalation and cancels any in-flight healer call.
    #[serde(default = "default_cascade_timeout")]
    pub timeout_secs: u64,
    /// Maximum cascades running concurrently (different subjects).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Delay schedule for identical-parameter retries at entity level.
    /// One entry per retry; backoff is data consumed by the healer.
    #[serde(default = "default_entity_retry_delays")]
    pub entity_retry_delays_ms: Vec<u64>,
    /// Jitter added to each retry delay to avoid thundering herds.
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Minimum recorded successes before a pattern can route a cascade.
    #[serde(default = "default_min_successes")]
    pub min_successes: u32,
    /// Minimum success rate before a pattern can route a cascade.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
}

/// One watched automation and the entities whose state changes should
/// trigger it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationWatch {
    pub automation_id: String,
    #[serde(default)]
    pub trigger_entities: Vec<String>,
}

impl Config {
    /// Load configuration from an explicit path, the user config dir, or
    /// fall back to defaults when no file exists. Invalid TOML is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("config file not found: {}", p.display());
                }
                Some(p.to_path_buf())
            }
            None => Self::default_path().filter(|p| p.exists()),
        };

        match candidate {
            Some(p) => {
                let raw = std::fs::read_to_string(&p)
                    .with_context(|| format!("failed to read config at {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("invalid config at {}", p.display()))
            }
            None => Ok(Self::default()),
        }
    }

    fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("automedic").join("config.toml"))
    }

    /// Where durable records live. Kept separate from the config dir.
    pub fn data_path(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("automedic")
        })
    }

    pub fn validation_window(&self) -> Duration {
        Duration::from_secs(self.detector.validation_window_secs)
    }

    pub fn cascade_timeout(&self) -> Duration {
        Duration::from_secs(self.cascade.timeout_secs)
    }
}

impl CascadeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            validation_window_secs: default_validation_window(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            validated_threshold: default_validated_threshold(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_interval_secs: default_reset_interval(),
            cooldown_secs: default_cooldown(),
        }
    }
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_cascade_timeout(),
            max_concurrent: default_max_concurrent(),
            entity_retry_delays_ms: default_entity_retry_delays(),
            retry_jitter_ms: default_retry_jitter(),
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            min_successes: default_min_successes(),
            min_success_rate: default_min_success_rate(),
        }
    }
}

fn default_instance_id() -> String {
    "default".to_string()
}
fn default_validation_window() -> u64 {
    10
}
fn default_validated_threshold() -> u32 {
    3
}
fn default_failure_threshold() -> u32 {
    10
}
fn default_reset_interval() -> u64 {
    3600
}
fn default_cooldown() -> u64 {
    300
}
fn default_cascade_timeout() -> u64 {
    300
}
fn default_max_concurrent() -> usize {
    4
}
fn default_entity_retry_delays() -> Vec<u64> {
    vec![0, 1000]
}
fn default_retry_jitter() -> u64 {
    250
}
fn default_min_successes() -> u32 {
    1
}
fn default_min_success_rate() -> f64 {
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.detector.validation_window_secs, 10);
        assert_eq!(config.health.validated_threshold, 3);
        assert_eq!(config.breaker.failure_threshold, 10);
        assert_eq!(config.breaker.reset_interval_secs, 3600);
        assert_eq!(config.breaker.cooldown_secs, 300);
        assert_eq!(config.cascade.timeout_secs, 300);
        assert_eq!(config.cascade.max_concurrent, 4);
        assert_eq!(config.patterns.min_successes, 1);
        assert!((config.patterns.min_success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            instance_id = "home"

            [breaker]
            failure_threshold = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.instance_id, "home");
        assert_eq!(config.breaker.failure_threshold, 5);
        // Unspecified fields fall back to defaults
        assert_eq!(config.breaker.reset_interval_secs, 3600);
        assert_eq!(config.detector.validation_window_secs, 10);
    }

    #[test]
    fn test_watch_tables() {
        let config: Config = toml::from_str(
            r#"
            [[watch]]
            automation_id = "automation.motion_lights"
            trigger_entities = ["binary_sensor.hall_motion"]

            [[watch]]
            automation_id = "automation.morning"
            "#,
        )
        .unwrap();

        assert_eq!(config.watch.len(), 2);
        assert_eq!(config.watch[0].automation_id, "automation.motion_lights");
        assert_eq!(
            config.watch[0].trigger_entities,
            vec!["binary_sensor.hall_motion"]
        );
        assert!(config.watch[1].trigger_entities.is_empty());
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let result: std::result::Result<Config, _> = toml::from_str("breaker = 12");
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/automedic.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_data_dir_override() {
        let config: Config = toml::from_str(r#"data_dir = "/var/lib/automedic""#).unwrap();
        assert_eq!(config.data_path(), PathBuf::from("/var/lib/automedic"));
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config::default();
        assert_eq!(config.validation_window(), Duration::from_secs(10));
        assert_eq!(config.cascade_timeout(), Duration::from_secs(300));
    }
}

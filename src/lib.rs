//! Automedic - Self-Healing Watchdog for Smart-Home Platforms
//!
//! Automedic watches a managed smart-home controller for entities and
//! automations that have stopped working and repairs them before a human
//! notices. The core is a long-running control loop:
//!
//! - **Detection**: validation windows over state events catch automations
//!   whose effects never materialize, and triggers that fire into silence
//! - **Healing**: an escalating cascade (entity → device → integration)
//!   of remediation strategies, each gated by a per-target circuit breaker
//! - **Learning**: every remediation attempt feeds a reliability ledger
//!   used to route future cascades straight to what worked last time
//! - **Safety**: bounded retries, cooldowns, cascade timeouts, and
//!   exactly-once escalation to a human when everything else fails
//!
//! # Quick Start
//!
//! ```ignore
//! use automedic::config::Config;
//! use automedic::engine::EngineBuilder;
//!
//! let config = Config::load(None)?;
//! let (engine, handle) = EngineBuilder::new(config).build();
//! tokio::spawn(engine.run());
//! handle.send(event).await?;
//! ```

// ─── Core control loop ─────────────────────────────────────────────
pub mod detector;
pub mod engine;
pub mod events;
pub mod orchestrator;
pub mod state_cache;

// ─── Healing & safety ──────────────────────────────────────────────
pub mod breaker;
pub mod healers;
pub mod health;
pub mod patterns;

// ─── Collaborator seams ────────────────────────────────────────────
pub mod store;

// ─── Ambient infrastructure ────────────────────────────────────────
pub mod cli;
pub mod config;
pub mod errors;
pub mod telemetry;

use std::sync::atomic::{AtomicBool, Ordering};

/// Global shutdown flag checked by long-running loops.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Request a graceful shutdown of the engine and any CLI loops.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Check whether a shutdown has been requested.
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

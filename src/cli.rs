//! Command-line surface.
//!
//! `watch` runs the healing engine against the configured platform
//! instance; `stats` and `health` are reporting views over the durable
//! records the watch loop writes. Aborting an in-flight cascade is a
//! library operation (`EngineHandle::abort_episode`), not a subcommand.

use crate::config::Config;
use crate::engine::EngineBuilder;
use crate::patterns::ReliabilityAnalyzer;
use crate::store::JsonStore;
use crate::telemetry::init_tracing;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "automedic")]
#[command(about = "Self-healing watchdog for smart-home platforms")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// Output format for reporting commands
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text (default)
    #[default]
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the platform and heal failures as they are detected
    #[command(alias = "w")]
    Watch,

    /// Show remediation reliability statistics
    #[command(alias = "s")]
    Stats {
        /// Restrict to one subject category (e.g. "light")
        category: Option<String>,

        /// Output format for machine consumption
        #[arg(long, value_enum, default_value = "text")]
        output_format: OutputFormat,
    },

    /// Show health status for one watched automation
    Health {
        /// Platform instance id
        instance_id: String,

        /// Automation id
        automation_id: String,
    },
}

pub async fn run() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Watch => watch(config).await,
        Commands::Stats {
            category,
            output_format,
        } => stats(config, category.as_deref(), output_format).await,
        Commands::Health {
            instance_id,
            automation_id,
        } => health(config, &instance_id, &automation_id).await,
    }
}

/// Run the engine until a shutdown signal arrives.
async fn watch(config: Config) -> Result<()> {
    let instance = config.instance_id.clone();
    let store = Arc::new(JsonStore::open(&config.data_path())?);
    let (engine, handle) = EngineBuilder::new(config).store(store).build();
    let engine_task = tokio::spawn(engine.run());

    println!("automedic watching instance '{instance}' (ctrl-c to stop)");

    // The signal handler in main flips the global flag; poll it so the
    // engine winds down between events rather than mid-dispatch.
    while !crate::is_shutdown_requested() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let active = handle.active_cascades();
    if active > 0 {
        println!("waiting for {active} active cascade(s) to finish...");
    }
    handle.shutdown();
    engine_task.await?;
    Ok(())
}

/// Print reliability aggregates from the durable store.
async fn stats(config: Config, category: Option<&str>, format: OutputFormat) -> Result<()> {
    let store = Arc::new(JsonStore::open(&config.data_path())?);
    let analyzer = ReliabilityAnalyzer::new(config.patterns.clone(), store);
    analyzer.load().await;
    let metrics = analyzer.stats(category);

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        OutputFormat::Text => {
            if metrics.is_empty() {
                println!("no remediation patterns recorded yet");
                return Ok(());
            }
            println!(
                "{:<16} {:<28} {:<12} {:<28} {:>9} {:>9} {:>8}",
                "category", "failure", "level", "strategy", "successes", "attempts", "rate"
            );
            for m in metrics {
                println!(
                    "{:<16} {:<28} {:<12} {:<28} {:>9} {:>9} {:>7.0}%",
                    m.category,
                    m.kind.to_string(),
                    m.level.to_string(),
                    m.strategy,
                    m.successes,
                    m.attempts,
                    m.success_rate * 100.0
                );
            }
        }
    }
    Ok(())
}

/// Print one automation's health row.
async fn health(config: Config, instance_id: &str, automation_id: &str) -> Result<()> {
    let store = Arc::new(JsonStore::open(&config.data_path())?);
    let tracker = crate::health::HealthTracker::new(config.health.clone(), store);
    tracker.load().await;
    match tracker.status(instance_id, automation_id).await {
        Some(status) => {
            println!("automation:             {}", status.automation_id);
            println!("instance:               {}", status.instance_id);
            println!("consecutive successes:  {}", status.consecutive_successes);
            println!("consecutive failures:   {}", status.consecutive_failures);
            println!(
                "lifetime:               {}/{} ({:.0}%)",
                status.lifetime_successes,
                status.lifetime_total,
                status.reliability_score() * 100.0
            );
            println!("validated healthy:      {}", status.validated_healthy);
            if let Some(at) = status.validated_at {
                println!("validated at:           {at}");
            }
        }
        None => {
            println!("no executions recorded for {instance_id}/{automation_id}");
        }
    }
    Ok(())
}

//! Autonomous pod remediation agent.
//!
//! Continuously observes workload health in one namespace, plans corrective
//! actions, applies them without human approval, and remembers which fixes
//! worked so recurring failures are repaired in a single shot.

mod detectors;
mod executor;
mod issue;
mod k8s;
mod memory;
mod monitor;
mod plan;
mod planner;
mod reasoning;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::k8s::{ClusterClient, ClusterOps};
use crate::memory::{MemoryStats, PatternStore};
use crate::monitor::{Monitor, MonitorConfig, SessionStats};
use crate::planner::Planner;
use crate::reasoning::ReasoningClient;

/// Autonomous pod remediation agent - observes, plans, acts, and learns
#[derive(Parser)]
#[command(name = "mend")]
#[command(about = "Autonomous pod remediation agent - observes, plans, acts, and learns")]
#[command(version)]
struct Cli {
    /// Kubernetes namespace to monitor
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Monitoring interval in seconds
    #[arg(short, long, default_value_t = 30)]
    interval: u64,

    /// Start with fresh memory (clears the pattern store)
    #[arg(short, long)]
    fresh: bool,

    /// Disable auto-remediation (observe and plan only)
    #[arg(long)]
    no_auto: bool,

    /// Path of the durable pattern memory file
    #[arg(long, default_value = "mend_memory.json")]
    memory_file: PathBuf,

    /// Log lines to fetch for log-consuming detectors
    #[arg(long, default_value_t = 50)]
    log_tail: u32,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "mend=debug" } else { "mend=info" })
        .init();

    let cluster = ClusterClient::new(&cli.namespace)
        .await
        .context("failed to connect to the cluster")?;

    // The only fatal condition: a target namespace that does not exist is a
    // configuration error, surfaced once before the loop starts.
    if !cluster
        .namespace_exists()
        .await
        .context("failed to check the target namespace")?
    {
        let known = cluster.known_namespaces().await.unwrap_or_default();
        anyhow::bail!(
            "namespace '{}' does not exist (known namespaces: {})",
            cli.namespace,
            known.join(", ")
        );
    }

    let mut store = PatternStore::load(&cli.memory_file);
    if cli.fresh {
        store
            .reset()
            .context("failed to reset pattern memory")?;
        info!("pattern memory reset, starting fresh");
    }

    let reasoning = ReasoningClient::from_env();
    let reasoning = if reasoning.is_configured() {
        Some(reasoning)
    } else {
        info!("reasoning fallback disabled (ANTHROPIC_API_KEY unset)");
        None
    };

    let config = MonitorConfig {
        namespace: cli.namespace.clone(),
        interval: Duration::from_secs(cli.interval),
        auto: !cli.no_auto,
        log_tail: cli.log_tail,
    };

    print_banner(&config, &store.statistics());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
        }
        signal_token.cancel();
    });

    let monitor = Monitor::new(config, Arc::new(cluster), Planner::new(reasoning), store);
    let (stats, memory) = monitor.run(shutdown).await;

    print_summary(&stats, &memory);
    Ok(())
}

fn print_banner(config: &MonitorConfig, memory: &MemoryStats) {
    let rule = "=".repeat(70);
    println!("{}", rule.cyan());
    println!("{}", "MEND - AUTONOMOUS POD REMEDIATION".bold());
    println!("{}", rule.cyan());
    println!("Namespace:        {}", config.namespace);
    println!("Check interval:   {} seconds", config.interval.as_secs());
    println!(
        "Auto-remediate:   {}",
        if config.auto {
            "ENABLED".green()
        } else {
            "DISABLED".yellow()
        }
    );
    println!(
        "Memory attempts:  {} ({} successful)",
        memory.total_attempts, memory.successful_attempts
    );
    println!("Patterns learned: {}", memory.patterns_learned);
    println!("{}", rule.cyan());
    println!("Press Ctrl+C to stop\n");
}

#[allow(clippy::cast_precision_loss)]
fn print_summary(stats: &SessionStats, memory: &MemoryStats) {
    let rule = "=".repeat(70);
    let rate = if stats.attempts == 0 {
        0.0
    } else {
        stats.successes as f64 / stats.attempts as f64 * 100.0
    };
    println!("\n{}", rule.cyan());
    println!("{}", "SESSION SUMMARY".bold());
    println!("{}", rule.cyan());
    println!("Iterations:                  {}", stats.iterations);
    println!("Issues observed:             {}", stats.issues_seen);
    println!("Remediation attempts:        {}", stats.attempts);
    println!("Successful attempts:         {}", stats.successes);
    println!("Success rate:                {rate:.1}%");
    println!("Patterns learned:            {}", memory.patterns_learned);
    println!("{}", rule.cyan());
}

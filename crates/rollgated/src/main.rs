//! rollgated — the rollgate daemon.
//!
//! Single binary that assembles the rollout controller:
//! - Audit/status store (redb)
//! - Simulated cluster control plane
//! - Rollout controller + crash recovery
//! - REST API
//!
//! # Usage
//!
//! ```text
//! rollgated standalone --config rollgate.toml --port 8450
//! rollgated validate plans/web-v2.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rollgate_cluster::InMemoryCluster;
use rollgate_core::config::LoggingConfig;
use rollgate_core::{RollgateConfig, RolloutPlan, WorkloadGroupSpec};
use rollgate_engine::RolloutController;
use rollgate_state::StateStore;

#[derive(Parser)]
#[command(name = "rollgated", about = "rollgate rollout controller daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller and API in a single process.
    Standalone {
        /// Path to rollgate.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `[server] port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for the store (overrides `[store] data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// JSON array of workload groups to pre-load into the simulated cluster.
        #[arg(long)]
        seed: Option<PathBuf>,
    },
    /// Check a plan file (JSON or TOML) and print its schedule.
    Validate {
        plan: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            config,
            port,
            data_dir,
            seed,
        } => {
            let mut config = match config {
                Some(path) => RollgateConfig::from_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => RollgateConfig::default(),
            };
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(dir) = data_dir {
                config.store.data_dir = dir;
            }
            init_tracing(&config.logging);
            run_standalone(config, seed).await
        }
        Command::Validate { plan } => {
            init_tracing(&LoggingConfig::default());
            validate(&plan)
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    if logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run_standalone(config: RollgateConfig, seed: Option<PathBuf>) -> anyhow::Result<()> {
    info!("rollgate daemon starting in standalone mode");

    // ── Initialize subsystems ──────────────────────────────────

    std::fs::create_dir_all(&config.store.data_dir)?;
    let db_path = config.store.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let cluster = InMemoryCluster::new();
    if let Some(path) = seed {
        let groups = load_seed(&path)?;
        info!(groups = groups.len(), path = %path.display(), "seeding simulated cluster");
        for group in groups {
            cluster.insert_group(group);
        }
    }

    let controller = RolloutController::new(store, Arc::new(cluster));

    if config.recovery.resume_on_start {
        let resumed = controller.recover().await?;
        info!(count = resumed.len(), "in-flight rollouts recovered");
    }

    // ── Start API server ───────────────────────────────────────

    let router = rollgate_api::build_router(controller.clone());
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    controller.shutdown().await;

    info!("rollgate daemon stopped");
    Ok(())
}

fn load_seed(path: &Path) -> anyhow::Result<Vec<WorkloadGroupSpec>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(serde_json::from_str(&content)?)
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let plan = RolloutPlan::from_file(path)?;
    plan.validate()?;

    println!(
        "plan {}: {} -> {} ({} replicas, {} gates)",
        plan.id,
        plan.source,
        plan.target.name,
        plan.total_replicas(),
        plan.gates.len()
    );
    for (i, step) in plan.schedule.iter().enumerate() {
        println!(
            "  step {i}: source={} target={}",
            step.source_replicas, step.target_replicas
        );
    }
    Ok(())
}

//! forgeline CLI
//!
//! Manages tenants, features and dependencies in the file store and runs the
//! scheduler loop against the configured stage workers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use forgeline::config::DEFAULT_CONFIG_FILE;
use forgeline::evidence::EvidenceStore;
use forgeline::metrics::{format_metrics, MetricsStore};
use forgeline::{
    format_status, DryRunPullRequests, Feature, FeatureId, FileStore, GitHubPullRequests,
    ProcessBackend, PullRequestService, Scheduler, SchedulerConfig, Store, Tenant,
};

const METRICS_SNAPSHOT: &str = "latest";

#[derive(Parser)]
#[command(name = "forgeline")]
#[command(about = "Dependency-aware feature pipeline scheduler", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./forgeline.toml when present)
    #[arg(long, short, global = true, env = "FORGELINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Manage tenants
    Tenant {
        #[command(subcommand)]
        command: TenantCommands,
    },
    /// Manage features
    Feature {
        #[command(subcommand)]
        command: FeatureCommands,
    },
    /// Make FEATURE depend on DEPENDS_ON
    Depend { feature: String, depends_on: String },
    /// Remove a dependency edge
    Undepend { feature: String, depends_on: String },
    /// Reset a pending or failing feature so the next tick considers it
    Enqueue { feature: String },
    /// Mark an awaiting-merge feature as passing
    ConfirmMerge { feature: String },
    /// Show per-tenant scheduling status
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show the metrics saved by the last run
    Metrics,
    /// Run the scheduler
    Run {
        /// Recover, run one tick and wait for the started pipelines
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
enum TenantCommands {
    /// Register a tenant
    Add {
        id: String,
        /// Concurrency limit (defaults to the configured default)
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[derive(Subcommand)]
enum FeatureCommands {
    /// Add a pending feature
    Add {
        id: String,
        #[arg(long)]
        tenant: String,
        /// Lower values are scheduled first
        #[arg(long, default_value_t = 10, allow_negative_numbers = true)]
        priority: i32,
        #[arg(long, default_value = "")]
        title: String,
        /// Features this one depends on
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forgeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { force } => {
            let path = cli
                .config
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            init_config(&path, force)
        }
        command => execute(command, cli.config.as_deref()).await,
    }
}

async fn execute(command: Commands, config_path: Option<&Path>) -> Result<()> {
    let config = SchedulerConfig::load(config_path).context("loading configuration")?;
    let store: Arc<dyn Store> = Arc::new(
        FileStore::open(&config.state_dir)
            .with_context(|| format!("opening store in {}", config.state_dir.display()))?,
    );

    match command {
        Commands::Init { force } => {
            init_config(config_path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE)), force)?;
        }
        Commands::Tenant {
            command: TenantCommands::Add { id, limit },
        } => {
            if limit == Some(0) {
                bail!("tenant limit must be positive");
            }
            let mut tenant = Tenant::new(id);
            tenant.concurrency_limit = limit;
            store.upsert_tenant(&tenant).await?;
            println!(
                "Tenant {} (limit {})",
                tenant.id,
                config.limit_for(&tenant)
            );
        }
        Commands::Feature {
            command:
                FeatureCommands::Add {
                    id,
                    tenant,
                    priority,
                    title,
                    depends_on,
                },
        } => {
            let feature = Feature::new(id, tenant, priority).with_title(title);
            store.insert_feature(&feature).await?;
            let scheduler = scheduler(&config, store.clone(), false)?;
            scheduler.resolver().load().await?;
            for dep in depends_on {
                scheduler
                    .add_dependency(&feature.id, &FeatureId::new(dep))
                    .await?;
            }
            println!("Added feature {} for tenant {}", feature.id, feature.tenant);
        }
        Commands::Depend {
            feature,
            depends_on,
        } => {
            let scheduler = scheduler(&config, store, false)?;
            scheduler.resolver().load().await?;
            scheduler
                .add_dependency(&FeatureId::new(&feature), &FeatureId::new(&depends_on))
                .await?;
            println!("{} now depends on {}", feature, depends_on);
        }
        Commands::Undepend {
            feature,
            depends_on,
        } => {
            let scheduler = scheduler(&config, store, false)?;
            scheduler.resolver().load().await?;
            scheduler
                .remove_dependency(&FeatureId::new(&feature), &FeatureId::new(&depends_on))
                .await?;
            println!("{} no longer depends on {}", feature, depends_on);
        }
        Commands::Enqueue { feature } => {
            let scheduler = scheduler(&config, store, false)?;
            scheduler.enqueue(&FeatureId::new(&feature)).await?;
            println!("Enqueued {}", feature);
        }
        Commands::ConfirmMerge { feature } => {
            let scheduler = scheduler(&config, store, false)?;
            scheduler.confirm_merge(&FeatureId::new(&feature)).await?;
            println!("{} is passing", feature);
        }
        Commands::Status { json } => {
            let scheduler = scheduler(&config, store, false)?;
            let status = scheduler.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", format_status(&status));
            }
        }
        Commands::Metrics => {
            let metrics_store = MetricsStore::new(&config.state_dir)?;
            match metrics_store.load(METRICS_SNAPSHOT)? {
                Some(metrics) => print!("{}", format_metrics(&metrics)),
                None => println!("No metrics recorded yet."),
            }
        }
        Commands::Run { once } => {
            let scheduler = scheduler(&config, store, true)?;
            if once {
                let resumed = scheduler.recover().await?;
                let summary = scheduler.tick().await?;
                info!(
                    resumed,
                    admitted = summary.admitted.len(),
                    deferred = summary.deferred.len(),
                    "single tick started, waiting for pipelines"
                );
                scheduler.join_pipelines().await;
            } else {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                tokio::spawn(async move {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => info!("shutdown requested"),
                        Err(err) => warn!("failed to listen for ctrl-c: {}", err),
                    }
                    let _ = shutdown_tx.send(true);
                });
                scheduler.run(shutdown_rx).await?;
            }
            save_metrics(&config.state_dir, &scheduler);
            print!("{}", format_status(&scheduler.status().await?));
        }
    }

    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let rendered = SchedulerConfig::default().to_toml()?;
    std::fs::write(path, rendered).with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Build a scheduler over `store`. Pipelines only run when `execute` is set;
/// management commands never launch workers.
fn scheduler(config: &SchedulerConfig, store: Arc<dyn Store>, execute: bool) -> Result<Scheduler> {
    let pull_requests: Arc<dyn PullRequestService> = match (&config.github, execute) {
        (Some(github), true) => Arc::new(
            GitHubPullRequests::from_env(github.clone()).context("configuring GitHub")?,
        ),
        _ => Arc::new(DryRunPullRequests),
    };
    let backend = Arc::new(ProcessBackend::new(config.workers.clone()));
    let scheduler = Scheduler::new(config.clone(), store, backend, pull_requests);
    if !execute {
        return Ok(scheduler);
    }

    let evidence = EvidenceStore::new(&config.state_dir, config.evidence_retention_days)
        .context("opening run journal")?;
    Ok(scheduler.with_evidence(evidence))
}

fn save_metrics(state_dir: &Path, scheduler: &Scheduler) {
    let result = MetricsStore::new(state_dir)
        .and_then(|store| store.save(METRICS_SNAPSHOT, &scheduler.metrics()));
    match result {
        Ok(path) => info!(path = %path.display(), "metrics saved"),
        Err(err) => warn!("failed to save metrics: {}", err),
    }
}

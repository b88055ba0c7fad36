//! Tether - keep GPU workloads alive on spot marketplaces
//!
//! ## Usage
//!
//! ```bash
//! # Race for a GPU and make it the workload's primary
//! tether race --workload train-1 --gpu-class RTX_4090 --max-price 0.6
//!
//! # Attach a policy and supervise until Ctrl+C
//! tether supervise --workload train-1 --policy snapshot-only --interval 600
//!
//! # Re-attach supervisors for every persisted workload (after a restart)
//! tether supervise
//!
//! # Seal, hibernate, resume
//! tether seal --workload train-1
//! tether hibernate --workload train-1
//! tether resume --workload train-1
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    ChunkStore, MarketplaceDriver, ResourceId, ResourceSpec, WorkloadId, WorkspaceArchiver,
};
use tether_orchestrator::{
    create_s3_client, ExecArchiver, FailoverOrchestrator, FailoverPolicy, JsonStateStore,
    LocalChunkStore, LocalDirArchiver, MemoryChunkStore, RaceCoordinator, Registry,
    RestMarketplaceDriver, S3ChunkStore, SnapshotEngine, StorageConfig, TetherConfig,
    WorkspaceConfig, ZstdCodec,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tether: provisioning races, snapshots and failover for spot GPUs
#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Provisioning races, snapshots and failover for spot GPU marketplaces", long_about = None)]
struct Cli {
    /// JSON config file (defaults apply when omitted)
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the state directory from the config
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Also write daily-rotated logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Race candidates for a GPU and install the winner as primary
    Race {
        #[arg(long)]
        workload: String,

        #[command(flatten)]
        spec: SpecArgs,
    },

    /// Attach a failover policy and supervise until Ctrl+C
    ///
    /// Without --workload, resumes supervision of every persisted workload.
    Supervise {
        #[arg(long)]
        workload: Option<String>,

        #[arg(long, value_enum, default_value_t = PolicyArg::SnapshotOnly)]
        policy: PolicyArg,

        /// Snapshot (snapshot-only) or sync (hot-standby) interval in seconds
        #[arg(long, default_value_t = 600)]
        interval: u64,

        /// GPU class of the hot standby (defaults to the workload's)
        #[arg(long)]
        standby_gpu_class: Option<String>,

        /// Offer id reserved for the warm pool
        #[arg(long)]
        reserved_offer: Option<String>,
    },

    /// Seal a snapshot of the primary now
    Seal {
        #[arg(long)]
        workload: String,
    },

    /// Restore an artifact into a resource of the workload
    Restore {
        #[arg(long)]
        workload: String,

        #[arg(long)]
        artifact: String,

        /// Target resource (defaults to the primary)
        #[arg(long)]
        resource: Option<String>,
    },

    /// Seal the primary and destroy every resource of the workload
    Hibernate {
        #[arg(long)]
        workload: String,
    },

    /// Race a fresh primary and restore the hibernation snapshot
    Resume {
        #[arg(long)]
        workload: String,
    },

    /// Pause the primary without failing over
    Pause {
        #[arg(long)]
        workload: String,
    },

    /// Resume a paused primary
    Unpause {
        #[arg(long)]
        workload: String,
    },

    /// Destroy every resource of the workload and stop supervising it
    Teardown {
        #[arg(long)]
        workload: String,
    },

    /// Show workload status (all workloads when omitted)
    Status {
        #[arg(long)]
        workload: Option<String>,
    },

    /// Show the failover event log of a workload
    Events {
        #[arg(long)]
        workload: String,
    },

    /// List artifacts found in chunk storage
    Artifacts,
}

#[derive(clap::Args)]
struct SpecArgs {
    #[arg(long)]
    gpu_class: String,

    #[arg(long)]
    region: Option<String>,

    /// Price ceiling in USD per hour
    #[arg(long)]
    max_price: Option<f64>,

    #[arg(long)]
    min_reliability: Option<f64>,
}

impl SpecArgs {
    fn into_spec(self) -> ResourceSpec {
        let mut spec = ResourceSpec::new(self.gpu_class);
        if let Some(region) = self.region {
            spec = spec.with_region(region);
        }
        if let Some(max) = self.max_price {
            spec = spec.with_max_price(max);
        }
        if let Some(min) = self.min_reliability {
            spec = spec.with_min_reliability(min);
        }
        spec
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    SnapshotOnly,
    HotStandby,
    WarmPool,
}

struct App {
    driver: Arc<dyn MarketplaceDriver>,
    orchestrator: FailoverOrchestrator,
    snapshots: Arc<SnapshotEngine>,
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_deref())?;

    let mut config = TetherConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = Some(dir);
    }

    let app = build(&config, cli.json).await?;
    run(app, cli.command).await
}

/// Console logging plus an optional daily file; the guard flushes the file on drop
fn init_tracing(
    log_dir: Option<&std::path::Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tether=info,tether_orchestrator=info,info".into());

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "tether.log"));
            let layer = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn build(config: &TetherConfig, json: bool) -> anyhow::Result<App> {
    let driver: Arc<dyn MarketplaceDriver> = Arc::new(RestMarketplaceDriver::from_config(&config.marketplace)?);

    let store: Arc<dyn ChunkStore> = match &config.storage {
        StorageConfig::Memory => {
            warn!("Using in-memory chunk storage, snapshots are lost on exit");
            Arc::new(MemoryChunkStore::new())
        }
        StorageConfig::Local { dir } => Arc::new(LocalChunkStore::new(dir.clone())),
        StorageConfig::S3 { bucket, prefix, region } => {
            let client = create_s3_client(region.clone()).await;
            let store = S3ChunkStore::new(client, bucket.clone()).with_prefix(prefix.clone());
            store.check_bucket().await?;
            Arc::new(store)
        }
    };

    let archiver: Arc<dyn WorkspaceArchiver> = match &config.workspace {
        WorkspaceConfig::Exec { workdir } => Arc::new(ExecArchiver::new(driver.clone(), workdir.clone())),
        WorkspaceConfig::Local { root } => Arc::new(LocalDirArchiver::new(root.clone())),
    };

    let snapshots = Arc::new(SnapshotEngine::new(
        store,
        Arc::new(ZstdCodec::new(config.snapshot.compression_level)),
        archiver,
        config.snapshot.clone(),
    ));

    let state_dir = config.state_dir();
    let registry = Arc::new(Registry::open(JsonStateStore::open(&state_dir)?)?);
    info!(state_dir = %state_dir.display(), workloads = registry.workload_ids().len(), "Registry loaded");

    let race = RaceCoordinator::with_config(driver.clone(), registry.clone(), config.race.clone());
    let orchestrator = FailoverOrchestrator::new(
        driver.clone(),
        registry,
        race,
        snapshots.clone(),
        config.failover.clone(),
    );

    Ok(App {
        driver,
        orchestrator,
        snapshots,
        json,
    })
}

/// Cancelled on the first Ctrl+C
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

async fn run(app: App, command: Commands) -> anyhow::Result<()> {
    let cancel = ctrl_c_token();
    if command.starts_work() {
        let reaped = app.orchestrator.reap_orphans().await?;
        if reaped > 0 {
            info!(reaped, "Destroyed resources left behind by an earlier run");
        }
    }

    let result = execute(&app, command, &cancel).await;
    app.orchestrator.shutdown().await;
    result
}

async fn execute(app: &App, command: Commands, cancel: &CancellationToken) -> anyhow::Result<()> {
    let orchestrator = &app.orchestrator;

    match command {
        Commands::Race { workload, spec } => {
            let workload_id = WorkloadId::new(workload);
            let handle = orchestrator.provision(&workload_id, spec.into_spec(), cancel).await?;
            info!(
                workload_id = %workload_id,
                resource_id = %handle.id,
                offer_id = %handle.offer.id,
                price = handle.offer.price_per_hour,
                "Primary ready"
            );
            app.print(&handle)?;
        }

        Commands::Supervise {
            workload,
            policy,
            interval,
            standby_gpu_class,
            reserved_offer,
        } => {
            let Some(workload) = workload else {
                let resumed = orchestrator.resume_supervision()?;
                info!(resumed, "Supervising persisted workloads until Ctrl+C");
                cancel.cancelled().await;
                info!("Stopping supervision");
                return Ok(());
            };

            let workload_id = WorkloadId::new(workload);
            let policy = app
                .policy(&workload_id, policy, Duration::from_secs(interval), standby_gpu_class, reserved_offer)
                .await?;
            orchestrator.attach_policy(&workload_id, policy)?;

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(workload_id = %workload_id, "Stopping supervision");
                }
                result = orchestrator.wait(&workload_id) => {
                    result?;
                    info!(workload_id = %workload_id, "Supervisor finished");
                }
            }
        }

        Commands::Seal { workload } => {
            let artifact = orchestrator.seal_now(&WorkloadId::new(workload), cancel).await?;
            app.print(&artifact)?;
        }

        Commands::Restore {
            workload,
            artifact,
            resource,
        } => {
            let workload_id = WorkloadId::new(workload);
            let resource_id = match resource {
                Some(id) => ResourceId::new(id),
                None => orchestrator
                    .registry()
                    .primary(&workload_id)?
                    .map(|h| h.id)
                    .ok_or_else(|| anyhow::anyhow!("workload {} has no primary, pass --resource", workload_id))?,
            };
            orchestrator
                .restore_into(&workload_id, &artifact, &resource_id, cancel)
                .await?;
            info!(workload_id = %workload_id, artifact_id = %artifact, resource_id = %resource_id, "Restore complete");
        }

        Commands::Hibernate { workload } => {
            let artifact = orchestrator.hibernate(&WorkloadId::new(workload), cancel).await?;
            app.print(&artifact)?;
        }

        Commands::Resume { workload } => {
            let handle = orchestrator.resume(&WorkloadId::new(workload), cancel).await?;
            app.print(&handle)?;
        }

        Commands::Pause { workload } => {
            let handle = orchestrator.pause(&WorkloadId::new(workload)).await?;
            app.print(&handle)?;
        }

        Commands::Unpause { workload } => {
            let handle = orchestrator.unpause(&WorkloadId::new(workload)).await?;
            app.print(&handle)?;
        }

        Commands::Teardown { workload } => {
            let workload_id = WorkloadId::new(workload);
            orchestrator.teardown(&workload_id).await?;
            info!(workload_id = %workload_id, "Workload torn down");
        }

        Commands::Status { workload } => {
            let ids = match workload {
                Some(w) => vec![WorkloadId::new(w)],
                None => orchestrator.registry().workload_ids(),
            };
            let statuses = ids
                .iter()
                .map(|id| orchestrator.status(id))
                .collect::<tether_orchestrator::Result<Vec<_>>>()?;
            app.print(&statuses)?;
        }

        Commands::Events { workload } => {
            let events = orchestrator.events(&WorkloadId::new(workload))?;
            app.print(&events)?;
        }

        Commands::Artifacts => {
            let artifacts = app.snapshots.discover().await?;
            app.print(&artifacts)?;
        }
    }

    Ok(())
}

impl Commands {
    /// Whether the command can launch or destroy resources
    fn starts_work(&self) -> bool {
        !matches!(
            self,
            Commands::Status { .. } | Commands::Events { .. } | Commands::Artifacts
        )
    }
}

impl App {
    fn print<T: serde::Serialize + std::fmt::Debug>(&self, value: &T) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            println!("{:#?}", value);
        }
        Ok(())
    }

    async fn policy(
        &self,
        workload_id: &WorkloadId,
        kind: PolicyArg,
        interval: Duration,
        standby_gpu_class: Option<String>,
        reserved_offer: Option<String>,
    ) -> anyhow::Result<FailoverPolicy> {
        let record = self.orchestrator.registry().workload(workload_id)?;
        let spec = record
            .spec
            .clone()
            .ok_or_else(|| anyhow::anyhow!("workload {} was never raced, run `tether race` first", workload_id))?;

        Ok(match kind {
            PolicyArg::SnapshotOnly => FailoverPolicy::snapshot_only(interval),
            PolicyArg::HotStandby => {
                let standby_spec = match standby_gpu_class {
                    Some(class) => ResourceSpec {
                        gpu_class: class,
                        ..spec
                    },
                    None => spec,
                };
                FailoverPolicy::hot_standby(interval, standby_spec)
            }
            PolicyArg::WarmPool => {
                let offer_id = reserved_offer.context("--reserved-offer is required for warm-pool")?;
                let offers = self.driver.search(&spec).await?;
                let offer = offers
                    .into_iter()
                    .find(|o| o.id == offer_id)
                    .ok_or_else(|| anyhow::anyhow!("offer {} is not available for {}", offer_id, spec.gpu_class))?;
                FailoverPolicy::warm_pool(offer)
            }
        })
    }
}

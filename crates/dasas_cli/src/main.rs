//! DASAS CLI
//!
//! Runs an in-memory coordination demo and inspects durable state.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail, eyre};
use config::{LoggingSettings, Settings};
use dasas_cluster::{CoordinationEngine, MutexOutcome, PeerBehaviour, SimNetwork};
use dasas_core::{ClusterId, CoreError};
use dasas_log::{CausalHistory, EventHistory};
use dasas_storage::{CheckpointStore, MemoryStore, RedbStore};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dasas")]
#[command(about = "DASAS - device cluster coordination and fault tolerance", long_about = None)]
struct Cli {
    /// Settings file (defaults to ./dasas.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run election, locking, agreement and checkpointing on a simulated mesh
    Demo {
        /// Devices to register
        #[arg(short, long, default_value_t = 4)]
        devices: usize,
        /// Arbitrary faults to tolerate; one device equivocates when above zero
        #[arg(short, long)]
        fault_tolerance: Option<usize>,
    },
    /// Print the effective configuration
    Config,
    /// List checkpoints of a cluster
    Checkpoints {
        /// Cluster id
        #[arg(long)]
        cluster: ClusterId,
        /// Maximum checkpoints shown
        #[arg(short, long, default_value_t = 24)]
        limit: usize,
    },
    /// Print a cluster's events in causal order
    History {
        /// Cluster id
        #[arg(long)]
        cluster: ClusterId,
        /// Only events at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Most recent events to order (defaults to engine.history_limit)
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    let settings = config::load(cli.config.as_deref()).map_err(|err| eyre!("{err:#}"))?;
    init_tracing(&settings.logging)?;

    match cli.command {
        Commands::Demo {
            devices,
            fault_tolerance,
        } => demo(settings, devices, fault_tolerance).await,
        Commands::Config => {
            print!("{}", settings.to_toml().map_err(|err| eyre!("{err:#}"))?);
            Ok(())
        }
        Commands::Checkpoints { cluster, limit } => {
            let store = open_store(&settings)?;
            let checkpoints = store.list_checkpoints(cluster, limit).await?;
            if checkpoints.is_empty() {
                println!("No checkpoints for {cluster}");
            }
            for checkpoint in checkpoints {
                println!(
                    "#{:<4} {}  {}  {} bytes  {}{}",
                    checkpoint.sequence,
                    checkpoint.id,
                    checkpoint.created_at.to_rfc3339(),
                    checkpoint.data.len(),
                    checkpoint.digest,
                    if checkpoint.verify() { "" } else { "  CORRUPT" },
                );
            }
            Ok(())
        }
        Commands::History { cluster, since, limit } => {
            let limit = limit.unwrap_or(settings.engine.history_limit);
            if limit == 0 {
                bail!("--limit must be positive");
            }
            let store = open_store(&settings)?;
            let history = CausalHistory::newest(store.entries_for(cluster, since).await?, limit);
            println!("{} events", history.len());
            for entry in history {
                println!(
                    "{}  {:<8} {:<22} {}  {}",
                    entry.timestamp.to_rfc3339(),
                    format!("{:?}", entry.severity).to_lowercase(),
                    entry.kind,
                    entry.source,
                    entry.message,
                );
            }
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .wrap_err_with(|| format!("invalid log filter {:?}", logging.level))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| eyre!("failed to install tracing subscriber: {err}"))
}

fn open_store(settings: &Settings) -> Result<RedbStore> {
    let path = settings
        .storage
        .path
        .as_ref()
        .ok_or_else(|| eyre!("storage.path is not configured (set it in dasas.toml or DASAS_DB_PATH)"))?;
    RedbStore::open(path).wrap_err_with(|| format!("failed to open {}", path.display()))
}

async fn demo(settings: Settings, devices: usize, fault_tolerance: Option<usize>) -> Result<()> {
    let mut config = settings.engine;
    if let Some(f) = fault_tolerance {
        config.agreement.fault_tolerance = f;
        config.agreement.quorum_size = None;
    }
    if devices < 2 {
        return Err(eyre!("the demo needs at least two devices"));
    }
    let f = config.agreement.fault_tolerance;

    let store = MemoryStore::new();
    let network = SimNetwork::with_default(PeerBehaviour::Honest);
    let engine = CoordinationEngine::new(Arc::new(store.clone()), Arc::new(network.clone()), config)?;

    let cluster = engine.create_cluster("demo", None).await?;
    let mut members = Vec::with_capacity(devices);
    for i in 0..devices {
        let device = engine
            .register_device(&format!("device-{i}"), ["capture", "ocr"])
            .await?;
        engine.join_cluster(cluster.id, device.id).await?;
        members.push(device.id);
    }
    println!("Cluster {} with {} devices", cluster.id, members.len());

    let election = engine.start_election(cluster.id).await?;
    println!("Leader {} elected in {}", election.leader, election.term);

    let (first, second) = (members[0], members[1]);
    engine.acquire_resource(cluster.id, first, "camera").await?;
    if let MutexOutcome::Queued { position } = engine.request_resource(cluster.id, second, "camera").await? {
        println!("camera held by {first}, {second} queued at {position}");
    }
    let next = engine.release_resource(cluster.id, first, "camera").await?;
    println!(
        "camera handed to {}",
        next.map_or_else(|| "nobody".to_string(), |d| d.to_string())
    );
    engine.release_resource(cluster.id, second, "camera").await?;

    engine.record_event(cluster.id, first, "frame captured").await?;
    engine.record_event(cluster.id, second, "text extracted").await?;

    if f > 0
        && let Some(liar) = members.last()
    {
        network.set_behaviour(*liar, PeerBehaviour::Equivocating).await;
        println!("{liar} will equivocate");
    }
    match engine
        .propose_agreement(cluster.id, json!({ "frame_rate": 30 }))
        .await
    {
        Ok(proposal) => println!(
            "Agreement committed with {}/{} matching votes",
            proposal.matching(),
            proposal.quorum
        ),
        Err(CoreError::QuorumNotReached { have, needed }) => {
            println!("Agreement aborted with {have}/{needed} matching votes");
        }
        Err(err) => return Err(err.into()),
    }
    let faulty = engine.detect_faulty_nodes(cluster.id).await?;
    println!("Faulty members: {}", faulty.len());

    engine.checkpoint_state(cluster.id).await?;
    let latest = engine.checkpoint_state(cluster.id).await?;
    let restored = engine.restore_from_checkpoint(cluster.id, None).await?;
    println!(
        "Checkpoint #{} written, restored #{} ({} bytes, digest {})",
        latest.sequence,
        restored.sequence,
        restored.data.len(),
        restored.digest
    );

    let status = engine.cluster_status(cluster.id).await?;
    let history = engine.causal_history(cluster.id, None).await?;
    println!(
        "Final state {:?}, leader {}, term {}, {} audit events",
        status.cluster.state,
        status
            .cluster
            .leader
            .map_or_else(|| "none".to_string(), |d| d.to_string()),
        status.cluster.term,
        history.len()
    );
    Ok(())
}

//! Background maintenance loops.
//!
//! Two tickers run next to the engine: one checkpoints the agreed state of
//! every active cluster, the other sweeps member health so faulty members
//! lose their tokens and a faulty leader is replaced without waiting for a
//! caller to notice.

use crate::engine::CoordinationEngine;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

/// Running maintenance loops
#[derive(Debug)]
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start both loops for `engine`
    #[must_use]
    pub fn start(engine: CoordinationEngine) -> Self {
        let config = engine.config();
        let checkpoint_every = Duration::from_secs(config.checkpoint.interval_secs.max(1));
        let sweep_every = Duration::from_millis(config.cluster_defaults.heartbeat_interval_ms.max(10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let tasks = vec![
            tokio::spawn(checkpoint_loop(engine.clone(), checkpoint_every, shutdown_rx.clone())),
            tokio::spawn(health_loop(engine, sweep_every, shutdown_rx)),
        ];
        tracing::debug!(?checkpoint_every, ?sweep_every, "scheduler started");
        Self { shutdown_tx, tasks }
    }

    /// Ask both loops to stop after their current pass
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the loops to exit
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Stop and wait
    pub async fn shutdown(self) {
        self.request_shutdown();
        self.wait().await;
    }
}

async fn checkpoint_loop(engine: CoordinationEngine, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval_at(time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => checkpoint_pass(&engine).await,
        }
    }
    tracing::debug!("checkpoint loop stopped");
}

async fn checkpoint_pass(engine: &CoordinationEngine) {
    let clusters = match engine.active_clusters().await {
        Ok(clusters) => clusters,
        Err(err) => {
            tracing::warn!(error = %err, "could not list clusters for checkpointing");
            return;
        }
    };
    for cluster in clusters.into_iter().filter(|c| c.member_count > 0) {
        match engine.checkpoint_state(cluster.id).await {
            Ok(checkpoint) => {
                tracing::debug!(cluster = %cluster.id, sequence = checkpoint.sequence, "scheduled checkpoint");
            }
            Err(err) => tracing::warn!(cluster = %cluster.id, error = %err, "scheduled checkpoint failed"),
        }
    }
}

async fn health_loop(engine: CoordinationEngine, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval_at(time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => health_pass(&engine).await,
        }
    }
    tracing::debug!("health loop stopped");
}

async fn health_pass(engine: &CoordinationEngine) {
    let clusters = match engine.active_clusters().await {
        Ok(clusters) => clusters,
        Err(err) => {
            tracing::warn!(error = %err, "could not list clusters for health sweep");
            return;
        }
    };
    for cluster in clusters.into_iter().filter(|c| c.member_count > 0) {
        match engine.detect_faulty_nodes(cluster.id).await {
            Ok(faulty) if !faulty.is_empty() => {
                tracing::debug!(cluster = %cluster.id, faulty = faulty.len(), "health sweep");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(cluster = %cluster.id, error = %err, "health sweep failed"),
        }
    }
}

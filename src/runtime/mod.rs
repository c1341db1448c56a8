//! # Runtime
//!
//! Runs the controllers: one runner task per controller, each fed by its own
//! work queue, with watches and a resync ticker fanning triggers out to all queues.
//!
//! - `initialization`: rustls, tracing, metrics, HTTP server and client setup
//! - `queue`: single-slot deduplicating work queue
//! - `runner`: per-controller reconcile loop with backoff and degraded reporting
//! - `triggers`: Kubernetes watches and the resync ticker
//! - `error_policy`: reconciliation and watch error handling

pub mod error_policy;
pub mod initialization;
pub mod queue;
pub mod runner;
pub mod triggers;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use crate::controller::{all_controllers, KeyLifecycleController};
use initialization::InitializationResult;
use queue::{Trigger, WorkQueue};
use runner::ControllerRunner;
use triggers::{spawn_triggers, QueueFanout};

/// Run every controller until SIGINT/SIGTERM
pub async fn run(init: InitializationResult) -> Result<()> {
    run_controllers(init, all_controllers()).await
}

pub async fn run_controllers(
    init: InitializationResult,
    controllers: Vec<Arc<dyn KeyLifecycleController>>,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut runners = Vec::with_capacity(controllers.len());
    for controller in controllers {
        let queue = Arc::new(WorkQueue::new());
        // every controller runs once at startup
        queue.add(Trigger::Resync);
        runners.push(ControllerRunner::new(controller, init.context.clone(), queue).await);
    }
    let fanout = QueueFanout::new(runners.iter().map(ControllerRunner::queue).collect());

    let trigger_handles = {
        let config = init.controller_config.read().await;
        spawn_triggers(init.client.clone(), &config, fanout, shutdown_rx.clone())
    };
    let runner_handles: Vec<_> = runners
        .into_iter()
        .map(|runner| tokio::spawn(runner.run(shutdown_rx.clone())))
        .collect();

    let server_state = Arc::clone(&init.server_state);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
        server_state.is_ready.store(false, Ordering::Relaxed);
        let _ = shutdown_tx.send(true);
    });

    for handle in runner_handles {
        if let Err(e) = handle.await {
            error!("Controller task failed: {}", e);
        }
    }
    for handle in trigger_handles {
        handle.abort();
    }

    info!("All controllers stopped");
    Ok(())
}

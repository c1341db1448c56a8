//! # Controller Runner
//!
//! Drives one controller: dequeues, reconciles, reports its degraded condition and
//! schedules the next run. Each runner owns its backoff, so controllers never slow
//! each other down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, Instrument};

use super::error_policy::{handle_reconciliation_error, ErrorAction};
use super::queue::{Trigger, WorkQueue};
use crate::controller::backoff::ExponentialBackoff;
use crate::controller::{
    degraded_condition_type, ControllerContext, KeyLifecycleController, ReconcileOutcome,
};
use crate::crd::Condition;
use crate::observability::metrics;

/// Result of a single runner step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Reconciled, waiting for the next trigger
    Idle,
    /// Reconciled, re-run requested after the delay
    Requeued(Duration),
    /// Failed, retrying after the backoff delay
    BackedOff(Duration),
    /// Failed fatally, only a watch trigger resumes the controller
    Halted,
    /// Trigger ignored while halted
    Skipped,
}

pub struct ControllerRunner {
    controller: Arc<dyn KeyLifecycleController>,
    ctx: ControllerContext,
    queue: Arc<WorkQueue>,
    backoff: ExponentialBackoff,
    halted: bool,
}

impl std::fmt::Debug for ControllerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerRunner")
            .field("controller", &self.controller.name())
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

impl ControllerRunner {
    pub async fn new(
        controller: Arc<dyn KeyLifecycleController>,
        ctx: ControllerContext,
        queue: Arc<WorkQueue>,
    ) -> Self {
        let backoff = {
            let config = ctx.config.read().await;
            ExponentialBackoff::new(config.backoff_start_duration(), config.backoff_max_duration())
        };
        Self {
            controller,
            ctx,
            queue,
            backoff,
            halted: false,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Run until the shutdown signal flips. An in-flight reconciliation is dropped
    /// on shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let name = self.controller.name();
        info!(controller = name, "Starting controller");
        loop {
            let trigger = tokio::select! {
                trigger = self.queue.next() => trigger,
                _ = shutdown.changed() => break,
            };
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.step(trigger) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!(controller = name, "Controller stopped");
    }

    /// Handle one dequeued trigger
    pub async fn step(&mut self, trigger: Trigger) -> Step {
        let name = self.controller.name();
        if self.halted {
            if trigger != Trigger::Watch {
                debug!(controller = name, trigger = trigger.as_str(), "Controller halted, ignoring trigger");
                return Step::Skipped;
            }
            info!(controller = name, "Watched object changed, resuming halted controller");
            self.halted = false;
        }

        let span = tracing::info_span!(
            "controller.reconcile",
            controller = name,
            trigger = trigger.as_str()
        );
        let started = Instant::now();
        metrics::increment_reconciliations(name);
        let result = self.controller.reconcile(&self.ctx).instrument(span).await;
        metrics::observe_reconciliation_duration(name, started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                self.backoff.reset();
                self.ctx
                    .conditions
                    .set_condition(Condition::new(
                        degraded_condition_type(name),
                        false,
                        "AsExpected",
                        "",
                    ))
                    .await;
                match outcome {
                    ReconcileOutcome::Done => Step::Idle,
                    ReconcileOutcome::RequeueAfter(delay) => {
                        debug!(controller = name, delay_secs = delay.as_secs(), "Requeue requested");
                        metrics::increment_requeues_total(name, "requested");
                        self.queue.add_after(Trigger::Requeue, delay);
                        Step::Requeued(delay)
                    }
                }
            }
            Err(error) => {
                self.ctx
                    .conditions
                    .set_condition(Condition::new(
                        degraded_condition_type(name),
                        true,
                        error.reason(),
                        error.to_string(),
                    ))
                    .await;
                match handle_reconciliation_error(name, &error, &mut self.backoff) {
                    ErrorAction::Backoff(delay) => {
                        self.queue.add_after(Trigger::Requeue, delay);
                        Step::BackedOff(delay)
                    }
                    ErrorAction::Halt => {
                        self.halted = true;
                        Step::Halted
                    }
                }
            }
        }
    }
}

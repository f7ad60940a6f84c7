//! # Scheduler
//!
//! A dedicated control loop. Each tick: run the recovery sweep if due, count
//! live leases, claim up to the free capacity, dispatch every claimed task to
//! the worker pool, then sleep the rest of the tick budget. Recovery runs
//! before claiming, so a task reclaimed from a dead executor can be picked up
//! in the same tick.
//!
//! Lifecycle: `Stopped → Running → Stopping → Stopped`. `stop` signals the
//! loop (honored within one tick), waits for it to exit, and drains in-flight
//! workers up to the given timeout.

pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::storage::TaskRepo;
use crate::time::now_ms;

pub use worker::Worker;

/// Runtime configuration for the control loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Global ceiling on concurrently RUNNING tasks.
    pub max_concurrent_tasks: usize,
    /// Target loop period.
    pub sched_tick_ms: u64,
    /// Lease length granted at claim time.
    pub lease_ms: i64,
    /// Minimum spacing between recovery sweeps.
    pub recovery_interval_ms: i64,
    /// Upper bound on tasks claimed in a single transaction.
    pub claim_batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            sched_tick_ms: 200,
            lease_ms: 60_000,
            recovery_interval_ms: 5_000,
            claim_batch_size: 50,
        }
    }
}

impl SchedulerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_concurrent_tasks: settings.max_concurrent_tasks,
            sched_tick_ms: settings.sched_tick_ms,
            lease_ms: settings.lease_ms,
            recovery_interval_ms: settings.recovery_interval_ms,
            ..Self::default()
        }
    }
}

pub struct Scheduler {
    repo: TaskRepo,
    worker: Arc<Worker>,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(repo: TaskRepo, config: SchedulerConfig) -> Self {
        let worker = Arc::new(Worker::new(repo.clone()));
        Self {
            repo,
            worker,
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start the control loop. A no-op while already running; valid to call
    /// again after `stop`.
    pub async fn start(&mut self) {
        if self.is_running() {
            return;
        }

        info!(
            max_concurrent = self.config.max_concurrent_tasks,
            tick_ms = self.config.sched_tick_ms,
            lease_ms = self.config.lease_ms,
            "starting scheduler"
        );

        // Recover stale leases left by a previous process before scheduling
        // any new work.
        match self.repo.sweep_expired_leases(now_ms()).await {
            Ok(0) => {}
            Ok(n) => info!(transitioned = n, "startup recovery requeued or failed stale tasks"),
            Err(err) => error!(error = %err, "startup recovery pass failed"),
        }

        self.running = Arc::new(AtomicBool::new(true));
        self.shutdown = Arc::new(Notify::new());

        let repo = self.repo.clone();
        let worker = Arc::clone(&self.worker);
        let config = self.config.clone();
        let running = Arc::clone(&self.running);
        let shutdown = Arc::clone(&self.shutdown);
        self.handle = Some(tokio::spawn(run_loop(
            repo, worker, config, running, shutdown,
        )));
    }

    /// Signal the loop to stop, wait for it to exit, and drain in-flight
    /// workers up to `drain_timeout`. In-flight tasks finish their current
    /// work; no new claims occur.
    pub async fn stop(&mut self, drain_timeout: Duration) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        info!("stopping scheduler");
        self.running.store(false, Ordering::Release);
        self.shutdown.notify_one();

        match timeout(drain_timeout, &mut handle).await {
            Ok(_) => info!("scheduler stopped"),
            Err(_) => {
                warn!("worker drain timed out; aborting in-flight tasks");
                handle.abort();
            }
        }
    }
}

async fn run_loop(
    repo: TaskRepo,
    worker: Arc<Worker>,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut last_recovery = now_ms();

    while running.load(Ordering::Acquire) {
        let tick_start = now_ms();

        if tick_start - last_recovery >= config.recovery_interval_ms {
            match repo.sweep_expired_leases(tick_start).await {
                Ok(0) => {}
                Ok(n) => info!(transitioned = n, "recovery requeued or failed stale tasks"),
                Err(err) => error!(error = %err, "recovery sweep failed"),
            }
            last_recovery = tick_start;
        }

        // A failed tick is not fatal: the next tick re-reads current truth.
        // The claim gets a fresh timestamp so a completion committed earlier
        // in this tick never postdates a successor's claim.
        if let Err(err) =
            claim_and_dispatch(&repo, &worker, &config, &mut workers, now_ms()).await
        {
            error!(error = %err, "scheduler tick failed");
        }

        while workers.try_join_next().is_some() {}

        let elapsed = (now_ms() - tick_start).max(0) as u64;
        let budget = config.sched_tick_ms.saturating_sub(elapsed);
        tokio::select! {
            _ = sleep(Duration::from_millis(budget)) => {}
            _ = shutdown.notified() => break,
        }
    }

    debug!(in_flight = workers.len(), "scheduler loop exited; draining workers");
    while workers.join_next().await.is_some() {}
}

async fn claim_and_dispatch(
    repo: &TaskRepo,
    worker: &Arc<Worker>,
    config: &SchedulerConfig,
    workers: &mut JoinSet<()>,
    now_ms: i64,
) -> Result<()> {
    // Capacity is derived from store truth; expired leases free their slot.
    let running = repo.count_running(now_ms).await?;
    let slots = config.max_concurrent_tasks as i64 - running;
    if slots <= 0 {
        return Ok(());
    }

    let limit = slots.min(config.claim_batch_size);
    let claimed = repo.claim_runnable(now_ms, config.lease_ms, limit).await?;
    if claimed.is_empty() {
        return Ok(());
    }

    info!(claimed = claimed.len(), running, slots, "claimed runnable tasks");
    for job in claimed {
        let worker = Arc::clone(worker);
        workers.spawn(async move { worker.run(job).await });
    }

    Ok(())
}

//! SchedulerActor - Drives the periodic monitoring cycle
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → list servers → probe all (concurrently) → apply outcomes
//!            → Publish ProbeEvent
//!     ↑
//!     └─── Commands (RunNow, Shutdown)
//! ```
//!
//! Cycles run inline in the actor loop, so two cycles never overlap. A cycle
//! that outlasts the interval delays the next tick instead of producing a
//! burst of catch-up cycles.
//!
//! [`Scheduler`] owns the actor's lifecycle. Its state is an explicit
//! `Stopped`/`Running` value behind a mutex, so `start` and `stop` can be
//! called from any task or thread. The actor is spawned on the runtime the
//! scheduler was created in.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use futures::future::join_all;
use tokio::runtime;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::model::{MonitorTarget, ProbeOutcome};
use crate::monitors::probe::Prober;
use crate::monitors::status::StatusTransitionEngine;
use crate::storage::{RecordStore, ServerDirectory, StorageResult};

use super::messages::{CycleReport, ProbeEvent, SchedulerCommand};

/// Retention cleanup runs once a day
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// One monitoring cycle: directory → probes → status transitions
pub struct MonitorCycle {
    directory: Arc<dyn ServerDirectory>,
    prober: Arc<dyn Prober>,
    engine: Arc<StatusTransitionEngine>,
    timeout: Duration,
    events: broadcast::Sender<ProbeEvent>,
}

impl MonitorCycle {
    pub fn new(
        directory: Arc<dyn ServerDirectory>,
        prober: Arc<dyn Prober>,
        engine: StatusTransitionEngine,
        timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            directory,
            prober,
            engine: Arc::new(engine),
            timeout,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.events.subscribe()
    }

    /// Run one cycle to completion
    ///
    /// Fails only if the server directory cannot be read. Every dispatched
    /// probe is waited for; a fault in one never affects the others.
    #[instrument(skip(self))]
    pub async fn run(&self) -> StorageResult<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport {
            started_at: Some(Utc::now()),
            ..CycleReport::default()
        };

        let targets = self.directory.list_monitorable().await?;
        report.probed = targets.len();
        debug!("probing {} servers", targets.len());

        let outcomes = self.probe_all(targets, &mut report).await;

        let applied = join_all(outcomes.into_iter().map(|outcome| async move {
            let result = self.engine.apply(&outcome).await;
            (outcome, result)
        }))
        .await;

        for (outcome, result) in applied {
            report.count(outcome.classification);
            let transition = match result {
                Ok(transition) => transition,
                Err(e) => {
                    warn!("failed to apply probe outcome for {}: {e}", outcome.server_id);
                    report.store_failures += 1;
                    None
                }
            };

            if let Some(transition) = transition.as_ref().filter(|t| t.changed()) {
                report.transitions.push(transition.clone());
            }

            if self.events.send(ProbeEvent { outcome, transition }).is_err() {
                trace!("no probe event subscribers");
            }
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    /// Probe every target concurrently and wait for all of them
    ///
    /// Outcomes are returned in dispatch order.
    async fn probe_all(
        &self,
        targets: Vec<MonitorTarget>,
        report: &mut CycleReport,
    ) -> Vec<ProbeOutcome> {
        let mut tasks = JoinSet::new();
        let mut dispatched = HashMap::with_capacity(targets.len());

        for (index, target) in targets.into_iter().enumerate() {
            let prober = self.prober.clone();
            let timeout = self.timeout;
            let server_id = target.id.clone();
            let handle = tasks.spawn(async move { prober.probe(&target, timeout).await });
            dispatched.insert(handle.id(), (index, server_id));
        }

        let mut settled = Vec::with_capacity(dispatched.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, outcome)) => {
                    let index = dispatched.get(&id).map_or(usize::MAX, |(index, _)| *index);
                    settled.push((index, outcome));
                }
                Err(e) => {
                    let server = dispatched
                        .get(&e.id())
                        .map_or("<unknown>", |(_, server_id)| server_id.as_str());
                    error!("probe task for {server} failed: {e}");
                    report.faults += 1;
                }
            }
        }

        settled.sort_by_key(|(index, _)| *index);
        settled.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

/// Deletes probe history past the retention period
#[derive(Clone)]
pub struct Retention {
    pub store: Arc<dyn RecordStore>,
    pub keep: chrono::Duration,
}

impl Retention {
    async fn run_cleanup(&self) {
        let cutoff = Utc::now() - self.keep;
        debug!("running retention cleanup (deleting probes before {cutoff})");

        match self.store.cleanup_probes_before(cutoff).await {
            Ok(0) => trace!("retention cleanup: nothing to delete"),
            Ok(deleted) => info!("retention cleanup complete: deleted {deleted} old probe results"),
            // retried on the next cleanup tick
            Err(e) => error!("failed to clean up old probe results: {e}"),
        }
    }
}

/// Actor running monitoring cycles at a fixed interval
pub struct SchedulerActor {
    cycle: Arc<MonitorCycle>,
    interval_duration: Duration,
    retention: Option<Retention>,
    command_rx: mpsc::Receiver<SchedulerCommand>,
}

impl SchedulerActor {
    pub fn new(
        cycle: Arc<MonitorCycle>,
        interval_duration: Duration,
        retention: Option<Retention>,
        command_rx: mpsc::Receiver<SchedulerCommand>,
    ) -> Self {
        Self {
            cycle,
            interval_duration,
            retention,
            command_rx,
        }
    }

    /// Run the actor's main loop
    ///
    /// Runs until a Shutdown command is received or the command channel is
    /// closed. Commands are checked before timers so that a shutdown queued
    /// during a cycle is honoured before another cycle can start.
    #[instrument(skip(self), fields(interval = ?self.interval_duration))]
    pub async fn run(mut self) {
        debug!("starting scheduler actor");

        let mut ticker = interval(self.interval_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cleanup_ticker = interval(CLEANUP_INTERVAL);
        cleanup_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let has_retention = self.retention.is_some();

        loop {
            tokio::select! {
                biased;

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::RunNow { respond_to }) => {
                            debug!("received RunNow command");
                            let result = self.cycle.run().await.context("monitoring cycle aborted");
                            let _ = respond_to.send(result);
                        }
                        Some(SchedulerCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                _ = ticker.tick() => {
                    self.run_cycle().await;
                }

                _ = cleanup_ticker.tick(), if has_retention => {
                    if let Some(retention) = &self.retention {
                        retention.run_cleanup().await;
                    }
                }
            }
        }

        debug!("scheduler actor stopped");
    }

    async fn run_cycle(&self) {
        match self.cycle.run().await {
            Ok(report) => {
                info!(
                    "cycle complete: {} probed, {} healthy, {} failed, {} transitions in {:?}",
                    report.probed,
                    report.healthy,
                    report.settled() - report.healthy,
                    report.transitions.len(),
                    report.duration
                );
                if report.store_failures > 0 {
                    warn!("{} probe outcomes could not be persisted", report.store_failures);
                }
            }
            // retried on the next tick
            Err(e) => error!("monitoring cycle aborted, server directory unavailable: {e}"),
        }
    }
}

enum SchedulerState {
    Stopped,
    Running {
        sender: mpsc::Sender<SchedulerCommand>,
        task: JoinHandle<()>,
    },
}

/// Start/stop handle for the periodic monitoring cycle
pub struct Scheduler {
    cycle: Arc<MonitorCycle>,
    interval_duration: Duration,
    retention: Option<Retention>,
    state: Mutex<SchedulerState>,

    /// Runtime the cycle task is spawned on
    runtime: runtime::Handle,
}

impl Scheduler {
    /// Must be called from within a Tokio runtime; `start` spawns onto it
    pub fn new(cycle: MonitorCycle, interval_duration: Duration) -> Self {
        Self {
            cycle: Arc::new(cycle),
            interval_duration,
            retention: None,
            state: Mutex::new(SchedulerState::Stopped),
            runtime: runtime::Handle::current(),
        }
    }

    /// Delete probe history older than `keep`, once a day
    pub fn with_retention(mut self, store: Arc<dyn RecordStore>, keep: chrono::Duration) -> Self {
        self.retention = Some(Retention { store, keep });
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProbeEvent> {
        self.cycle.subscribe()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), SchedulerState::Running { .. })
    }

    /// Begin the periodic cycle; the first cycle runs immediately
    ///
    /// Returns `false` if the scheduler was already running.
    pub fn start(&self) -> bool {
        let mut state = self.lock_state();
        if matches!(*state, SchedulerState::Running { .. }) {
            debug!("scheduler already running");
            return false;
        }

        let (sender, command_rx) = mpsc::channel(8);
        let actor = SchedulerActor::new(
            self.cycle.clone(),
            self.interval_duration,
            self.retention.clone(),
            command_rx,
        );
        let task = self.runtime.spawn(actor.run());

        *state = SchedulerState::Running { sender, task };
        info!("scheduler started with interval {:?}", self.interval_duration);
        true
    }

    /// Stop the periodic cycle
    ///
    /// An in-flight cycle runs to completion; no new cycle starts afterwards.
    /// Returns `false` if the scheduler was not running.
    pub async fn stop(&self) -> bool {
        let previous = std::mem::replace(&mut *self.lock_state(), SchedulerState::Stopped);
        let SchedulerState::Running { sender, task } = previous else {
            return false;
        };

        // the actor may already be gone if the loop exited on its own
        let _ = sender.send(SchedulerCommand::Shutdown).await;
        drop(sender);

        if let Err(e) = task.await {
            error!("scheduler task ended abnormally: {e}");
        }
        info!("scheduler stopped");
        true
    }

    /// Run a cycle right away, serialized with the ticked cycles
    pub async fn run_now(&self) -> Result<CycleReport> {
        let sender = match &*self.lock_state() {
            SchedulerState::Running { sender, .. } => sender.clone(),
            SchedulerState::Stopped => bail!("scheduler is not running"),
        };

        let (tx, rx) = oneshot::channel();
        sender
            .send(SchedulerCommand::RunNow { respond_to: tx })
            .await
            .context("scheduler is shutting down")?;

        rx.await.context("scheduler stopped before the cycle finished")?
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! AlertActor - Feeds incoming metric samples into the alert lifecycle
//!
//! Samples arrive from the metric broadcast (collectors) or directly via
//! [`AlertHandle::ingest`]. Each server gets its own worker task:
//!
//! ```text
//!                        ┌─▶ worker(web-1) ─▶ AlertLifecycleManager
//! MetricEvent / Ingest ──┼─▶ worker(web-2) ─▶ AlertLifecycleManager
//!                        └─▶ worker(db-1)  ─▶ AlertLifecycleManager
//! ```
//!
//! Samples of one server are evaluated in arrival order, while different
//! servers are evaluated in parallel. Workers with nothing queued are
//! dropped on every sweep and respawned by the next sample.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, instrument, trace, warn};

use crate::alerts::{AlertLifecycleManager, ReconcileReport};
use crate::model::{Alert, AlertId, MetricSample, ServerId};

use super::messages::{AlertCommand, MetricEvent};

/// How often idle workers are dropped
const WORKER_SWEEP: Duration = Duration::from_secs(60);

/// Samples of one server waiting for evaluation
struct Job {
    samples: Vec<MetricSample>,
    respond_to: Option<oneshot::Sender<ReconcileReport>>,
}

struct Worker {
    queue: mpsc::UnboundedSender<Job>,

    /// Jobs queued or being evaluated
    pending: Arc<AtomicUsize>,
}

async fn evaluate_server(
    manager: Arc<AlertLifecycleManager>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(job) = jobs.recv().await {
        let mut report = ReconcileReport::default();

        for sample in &job.samples {
            match manager.reconcile(sample).await {
                Ok(outcome) => report.merge(outcome),
                Err(e) => {
                    // skipped; the next sample of this kind retries
                    warn!("failed to load alert rules for {}: {e}", sample.server_id);
                    report.failures += 1;
                }
            }
        }

        pending.fetch_sub(1, Ordering::AcqRel);
        if let Some(respond_to) = job.respond_to {
            let _ = respond_to.send(report);
        }
    }
}

pub struct AlertActor {
    manager: Arc<AlertLifecycleManager>,

    /// Command receiver for control messages
    command_rx: mpsc::Receiver<AlertCommand>,

    /// Metric events from the collectors
    metric_rx: broadcast::Receiver<MetricEvent>,

    /// Job queue per server
    workers: HashMap<ServerId, Worker>,

    worker_tasks: JoinSet<()>,

    sweep_interval: Duration,
}

impl AlertActor {
    pub fn new(
        manager: Arc<AlertLifecycleManager>,
        command_rx: mpsc::Receiver<AlertCommand>,
        metric_rx: broadcast::Receiver<MetricEvent>,
    ) -> Self {
        Self {
            manager,
            command_rx,
            metric_rx,
            workers: HashMap::new(),
            worker_tasks: JoinSet::new(),
            sweep_interval: WORKER_SWEEP,
        }
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Run the actor's main loop
    ///
    /// Runs until a Shutdown command is received or the command channel is
    /// closed. Pending evaluations are drained before the actor exits.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting alert actor");
        let mut metrics_open = true;

        let mut sweep = time::interval_at(
            time::Instant::now() + self.sweep_interval,
            self.sweep_interval,
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // samples already broadcast are queued before later commands
                biased;

                result = self.metric_rx.recv(), if metrics_open => {
                    match result {
                        Ok(event) => {
                            trace!(
                                "received {} samples from {}",
                                event.samples.len(),
                                event.display_name
                            );
                            let job = Job {
                                samples: event.samples,
                                respond_to: None,
                            };
                            self.dispatch(event.server_id, job);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("alert actor lagged, skipped {skipped} metric events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("metric channel closed, continuing with direct ingestion only");
                            metrics_open = false;
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(AlertCommand::Ingest { samples, respond_to }) => {
                            self.ingest(samples, respond_to);
                        }
                        Some(AlertCommand::Acknowledge { alert_id, respond_to }) => {
                            let result = self
                                .manager
                                .acknowledge(alert_id)
                                .await
                                .map_err(anyhow::Error::from);
                            let _ = respond_to.send(result);
                        }
                        Some(AlertCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                _ = sweep.tick() => {
                    self.prune_idle();
                }
            }
        }

        // closing the queues lets every worker finish what it has
        self.workers.clear();
        while self.worker_tasks.join_next().await.is_some() {}

        debug!("alert actor stopped");
    }

    fn dispatch(&mut self, server_id: ServerId, job: Job) {
        let job = match self.workers.get(&server_id) {
            Some(worker) => {
                worker.pending.fetch_add(1, Ordering::AcqRel);
                match worker.queue.send(job) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(job)) => job,
                }
            }
            None => job,
        };

        trace!("starting alert worker for {server_id}");
        let (queue, jobs) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(1));
        self.worker_tasks
            .spawn(evaluate_server(self.manager.clone(), jobs, pending.clone()));
        // a fresh receiver is alive, so this cannot fail
        let _ = queue.send(job);
        self.workers.insert(server_id, Worker { queue, pending });
    }

    /// Drop the queues of workers with nothing left to evaluate
    ///
    /// Only this task adds jobs, so a worker seen idle here stays idle until
    /// its queue is gone and it exits.
    fn prune_idle(&mut self) {
        let before = self.workers.len();
        // a worker that panicked leaves a closed queue behind
        self.workers.retain(|_, worker| {
            worker.pending.load(Ordering::Acquire) > 0 && !worker.queue.is_closed()
        });

        // reap the tasks that already exited
        while self.worker_tasks.try_join_next().is_some() {}

        let pruned = before - self.workers.len();
        if pruned > 0 {
            trace!("dropped {pruned} idle alert workers");
        }
    }

    fn ingest(&mut self, samples: Vec<MetricSample>, respond_to: oneshot::Sender<ReconcileReport>) {
        let mut by_server: Vec<(ServerId, Vec<MetricSample>)> = Vec::new();
        for sample in samples {
            match by_server.iter_mut().find(|(id, _)| *id == sample.server_id) {
                Some((_, batch)) => batch.push(sample),
                None => by_server.push((sample.server_id.clone(), vec![sample])),
            }
        }

        let mut pending = Vec::with_capacity(by_server.len());
        for (server_id, samples) in by_server {
            let (tx, rx) = oneshot::channel();
            self.dispatch(
                server_id,
                Job {
                    samples,
                    respond_to: Some(tx),
                },
            );
            pending.push(rx);
        }

        tokio::spawn(async move {
            let mut report = ReconcileReport::default();
            for rx in pending {
                if let Ok(partial) = rx.await {
                    report.merge(partial);
                }
            }
            let _ = respond_to.send(report);
        });
    }
}

/// Handle for controlling the AlertActor
#[derive(Clone)]
pub struct AlertHandle {
    sender: mpsc::Sender<AlertCommand>,

    /// Actor task, taken by the first `shutdown`
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AlertHandle {
    /// Spawn the alert actor
    pub fn spawn(
        manager: Arc<AlertLifecycleManager>,
        metric_rx: broadcast::Receiver<MetricEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = AlertActor::new(manager, cmd_rx, metric_rx);

        let task = tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Evaluate samples and wait for the resulting alert changes
    pub async fn ingest(&self, samples: Vec<MetricSample>) -> Result<ReconcileReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlertCommand::Ingest {
                samples,
                respond_to: tx,
            })
            .await
            .context("alert actor is not running")?;

        rx.await.context("alert actor dropped the request")
    }

    /// Acknowledge an alert
    pub async fn acknowledge(&self, alert_id: AlertId) -> Result<Alert> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AlertCommand::Acknowledge {
                alert_id,
                respond_to: tx,
            })
            .await
            .context("alert actor is not running")?;

        rx.await.context("alert actor dropped the request")?
    }

    /// Shutdown the alert actor
    ///
    /// Returns once every queued evaluation has been written.
    pub async fn shutdown(&self) {
        let _ = self.sender.send(AlertCommand::Shutdown).await;

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return;
        };
        if let Err(e) = task.await {
            error!("alert actor ended abnormally: {e}");
        }
    }
}

//! MetricCollectorActor - Agent metrics ingestion
//!
//! One of the metric ingestion paths: a collector per server polls the
//! agent's `/metrics` endpoint, flattens the payload into samples and
//! publishes them for the alert actor.
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → Poll agent → Parse metrics → Publish MetricEvent → [AlertActor, ...]
//!     ↑
//!     └─── Commands (PollNow, UpdateInterval, Shutdown)
//! ```

use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ResolvedAgentConfig;
use crate::metrics::ServerMetrics;
use crate::model::ServerId;

use super::messages::{CollectorCommand, MetricEvent};

/// Header carrying the agent token
pub const AGENT_SECRET_HEADER: &str = "X-MONITORING-SECRET";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Polls one server's agent and publishes its samples
pub struct MetricCollectorActor {
    server_id: ServerId,
    display_name: String,
    agent: ResolvedAgentConfig,
    client: reqwest::Client,
    command_rx: mpsc::Receiver<CollectorCommand>,
    metric_tx: broadcast::Sender<MetricEvent>,
    interval_duration: Duration,
    /// Polls failed in a row, reset on the first success
    failed_polls: u32,
}

impl MetricCollectorActor {
    pub fn new(
        server_id: ServerId,
        display_name: String,
        agent: ResolvedAgentConfig,
        client: reqwest::Client,
        command_rx: mpsc::Receiver<CollectorCommand>,
        metric_tx: broadcast::Sender<MetricEvent>,
    ) -> Self {
        let interval_duration = agent.interval;
        Self {
            server_id,
            display_name,
            agent,
            client,
            command_rx,
            metric_tx,
            interval_duration,
            failed_polls: 0,
        }
    }

    /// Poll on every tick until shut down or every handle is dropped
    #[instrument(skip(self), fields(server = %self.display_name))]
    pub async fn run(mut self) {
        debug!("collecting from {} every {:?}", self.agent.url, self.interval_duration);

        let mut ticker = interval(self.interval_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // failures are tracked and logged in `collect`
                    let _ = self.collect().await;
                }

                command = self.command_rx.recv() => match command {
                    Some(CollectorCommand::PollNow { respond_to }) => {
                        let outcome = self.collect().await;
                        if respond_to.send(outcome).is_err() {
                            trace!("poll requester went away");
                        }
                    }
                    Some(CollectorCommand::UpdateInterval { interval_secs }) => {
                        self.interval_duration = Duration::from_secs(interval_secs.max(1));
                        debug!("collection interval now {:?}", self.interval_duration);
                        ticker = interval(self.interval_duration);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                    Some(CollectorCommand::Shutdown) => break,
                    None => {
                        warn!("all collector handles dropped");
                        break;
                    }
                },
            }
        }

        debug!("collector for {} stopped", self.server_id);
    }

    /// One poll: fetch, flatten, publish
    async fn collect(&mut self) -> Result<()> {
        match self.fetch().await {
            Ok(metrics) => {
                if self.failed_polls > 0 {
                    info!(
                        "agent of {} reachable again after {} failed polls",
                        self.display_name, self.failed_polls
                    );
                    self.failed_polls = 0;
                }
                self.publish(&metrics);
                Ok(())
            }
            Err(e) => {
                self.failed_polls = self.failed_polls.saturating_add(1);
                if self.failed_polls == 1 {
                    error!("failed to collect metrics from {}: {e:#}", self.agent.url);
                } else {
                    debug!("collection still failing ({} in a row): {e:#}", self.failed_polls);
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(server = %self.display_name))]
    async fn fetch(&self) -> Result<ServerMetrics> {
        let mut request = self.client.get(&self.agent.url).timeout(REQUEST_TIMEOUT);
        if let Some(token) = &self.agent.token {
            request = request.header(AGENT_SECRET_HEADER, token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("agent at {} unreachable", self.agent.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("agent answered with {status}");
        }

        response
            .json::<ServerMetrics>()
            .await
            .context("agent sent a malformed metrics payload")
    }

    fn publish(&self, metrics: &ServerMetrics) {
        let timestamp = Utc::now();
        let samples = metrics.to_samples(&self.server_id, timestamp);
        trace!("publishing {} samples", samples.len());

        let event = MetricEvent {
            server_id: self.server_id.clone(),
            display_name: self.display_name.clone(),
            samples,
            timestamp,
        };
        if self.metric_tx.send(event).is_err() {
            trace!("nobody is listening for metric events");
        }
    }
}

/// Cloneable control surface of a running collector
#[derive(Clone)]
pub struct CollectorHandle {
    commands: mpsc::Sender<CollectorCommand>,
    pub server_id: ServerId,
    pub display_name: String,
}

impl CollectorHandle {
    pub fn spawn(
        server_id: ServerId,
        display_name: String,
        agent: ResolvedAgentConfig,
        client: reqwest::Client,
        metric_tx: broadcast::Sender<MetricEvent>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(8);
        tokio::spawn(
            MetricCollectorActor::new(
                server_id.clone(),
                display_name.clone(),
                agent,
                client,
                command_rx,
                metric_tx,
            )
            .run(),
        );

        Self {
            commands,
            server_id,
            display_name,
        }
    }

    /// Poll right away; resolves once the samples are published
    pub async fn poll_now(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.command(CollectorCommand::PollNow { respond_to }).await?;
        response
            .await
            .with_context(|| format!("collector for {} dropped the poll", self.server_id))?
    }

    pub async fn update_interval(&self, interval_secs: u64) -> Result<()> {
        self.command(CollectorCommand::UpdateInterval { interval_secs }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.command(CollectorCommand::Shutdown).await
    }

    async fn command(&self, command: CollectorCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .with_context(|| format!("collector for {} is not running", self.server_id))
    }
}

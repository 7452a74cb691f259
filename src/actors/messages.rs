//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to specific actors via mpsc
//! 2. **Events**: Broadcast notifications published to multiple subscribers
//! 3. **Immutability**: All events are cloneable for multi-subscriber patterns

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::alerts::ReconcileReport;
use crate::model::{Alert, AlertId, MetricSample, ProbeClassification, ProbeOutcome, ServerId};
use crate::monitors::status::Transition;

/// Event published when metric samples arrive for a server
///
/// The broadcast channel may lag for slow subscribers. Lost samples are
/// tolerable: the next poll delivers fresh values.
#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub server_id: ServerId,

    /// Display name for the server (for logging)
    pub display_name: String,

    pub samples: Vec<MetricSample>,

    /// When the samples were collected
    pub timestamp: DateTime<Utc>,
}

/// Event published for every settled probe of a cycle
#[derive(Debug, Clone)]
pub struct ProbeEvent {
    pub outcome: ProbeOutcome,

    /// `None` if the server was in maintenance or the store update failed
    pub transition: Option<Transition>,
}

/// Alert lifecycle notifications for downstream dispatch
#[derive(Debug, Clone)]
pub enum AlertEvent {
    Opened(Alert),
    Resolved(Alert),
}

impl AlertEvent {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertEvent::Opened(alert) | AlertEvent::Resolved(alert) => alert,
        }
    }
}

/// Summary of one monitoring cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Duration,

    /// Servers a probe was dispatched to
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub timeouts: usize,
    pub errors: usize,

    /// State changes applied in this cycle
    pub transitions: Vec<Transition>,

    /// Outcomes whose persistence failed
    pub store_failures: usize,

    /// Probe tasks that panicked or were cancelled
    pub faults: usize,
}

impl CycleReport {
    pub(crate) fn count(&mut self, classification: ProbeClassification) {
        match classification {
            ProbeClassification::Healthy => self.healthy += 1,
            ProbeClassification::Unhealthy => self.unhealthy += 1,
            ProbeClassification::Timeout => self.timeouts += 1,
            ProbeClassification::Error => self.errors += 1,
        }
    }

    /// Probes that settled with an outcome
    pub fn settled(&self) -> usize {
        self.healthy + self.unhealthy + self.timeouts + self.errors
    }
}

/// Commands that can be sent to the SchedulerActor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run a cycle right away (bypassing the interval timer)
    ///
    /// Never overlaps a ticked cycle: the actor handles one thing at a time.
    RunNow {
        respond_to: oneshot::Sender<anyhow::Result<CycleReport>>,
    },

    /// Finish the in-flight cycle, if any, and exit
    Shutdown,
}

/// Commands that can be sent to a MetricCollectorActor
#[derive(Debug)]
pub enum CollectorCommand {
    /// Trigger an immediate poll (bypassing the interval timer)
    PollNow {
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    /// Update the polling interval
    UpdateInterval { interval_secs: u64 },

    /// Gracefully shut down the collector
    Shutdown,
}

/// Commands that can be sent to the AlertActor
#[derive(Debug)]
pub enum AlertCommand {
    /// Evaluate samples delivered outside the metric broadcast
    Ingest {
        samples: Vec<MetricSample>,
        respond_to: oneshot::Sender<ReconcileReport>,
    },

    /// Operator acknowledgement of an alert
    Acknowledge {
        alert_id: AlertId,
        respond_to: oneshot::Sender<anyhow::Result<Alert>>,
    },

    /// Drain pending evaluations and shut down
    Shutdown,
}

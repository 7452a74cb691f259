//! Status Transition Engine
//!
//! Derives a server's availability state from its probe outcomes:
//!
//! ```text
//! UNKNOWN ──HEALTHY──▶ ONLINE ◀──HEALTHY── OFFLINE
//!    │                   │                   ▲
//!    └──────── UNHEALTHY / TIMEOUT / ERROR ──┘
//! ```
//!
//! `MAINTENANCE` is operator territory: the engine never enters or leaves it.
//!
//! With the default failure threshold of 1 a single failed probe flips a
//! server to OFFLINE. A higher threshold requires that many consecutive
//! failures; until then the previous state is kept.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::model::{AvailabilityState, ProbeOutcome, Server, ServerId};
use crate::storage::{RecordStore, StatusUpdate, StorageError, StorageResult};

/// Applied change of a server's availability state
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub server_id: ServerId,
    pub from: AvailabilityState,
    pub to: AvailabilityState,
    pub last_seen: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Transition {
    /// Whether the availability state actually changed
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Compute the status a server moves to after `outcome`
///
/// Returns `None` for servers in maintenance.
pub fn next_status(
    server: &Server,
    outcome: &ProbeOutcome,
    failure_threshold: u32,
) -> Option<StatusUpdate> {
    if server.state == AvailabilityState::Maintenance {
        return None;
    }

    let update = if outcome.classification.is_healthy() {
        StatusUpdate {
            server_id: server.id.clone(),
            state: AvailabilityState::Online,
            last_seen: Some(outcome.observed_at),
            consecutive_failures: 0,
        }
    } else {
        let failures = server.consecutive_failures.saturating_add(1);
        let state = if failures >= failure_threshold.max(1) {
            AvailabilityState::Offline
        } else {
            server.state
        };

        StatusUpdate {
            server_id: server.id.clone(),
            state,
            last_seen: server.last_seen,
            consecutive_failures: failures,
        }
    };

    Some(update)
}

/// Applies probe outcomes to the record store
pub struct StatusTransitionEngine {
    store: Arc<dyn RecordStore>,
    failure_threshold: u32,
}

impl StatusTransitionEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            failure_threshold: 1,
        }
    }

    /// Require `threshold` consecutive failures before a server goes OFFLINE
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Record `outcome` in the probe history and update the server's state
    ///
    /// Returns `None` when the server is in maintenance; the outcome is still
    /// kept in the history.
    #[instrument(
        skip(self, outcome),
        fields(server = %outcome.server_id, classification = %outcome.classification)
    )]
    pub async fn apply(&self, outcome: &ProbeOutcome) -> StorageResult<Option<Transition>> {
        self.store.record_probe(outcome).await?;

        let server = self
            .store
            .server(&outcome.server_id)
            .await?
            .ok_or_else(|| StorageError::UnknownServer(outcome.server_id.clone()))?;

        let Some(update) = next_status(&server, outcome, self.failure_threshold) else {
            debug!("server is in maintenance, leaving state untouched");
            return Ok(None);
        };

        let transition = Transition {
            server_id: server.id.clone(),
            from: server.state,
            to: update.state,
            last_seen: update.last_seen,
            consecutive_failures: update.consecutive_failures,
        };

        if !self.store.update_server_status(update).await? {
            debug!("server entered maintenance during the probe, leaving state untouched");
            return Ok(None);
        }

        if transition.changed() {
            match transition.to {
                AvailabilityState::Offline => warn!(
                    "{} went offline ({})",
                    server.display(),
                    outcome.error.as_deref().unwrap_or("no detail")
                ),
                _ => info!("{} is now {}", server.display(), transition.to),
            }
        }

        Ok(Some(transition))
    }
}

//! Collaborator traits for the control loop
//!
//! The control loop never talks to a database directly. It sees two
//! collaborators:
//!
//! - [`ServerDirectory`]: the list of servers that should be probed
//! - [`RecordStore`]: probe history, server state, alert rules and alerts
//!
//! Both are `Send + Sync` and used behind `Arc<dyn ...>` from many tasks at once.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use crate::model::{
    Alert, AlertId, AlertRule, AvailabilityState, MonitorTarget, NewAlert, ProbeOutcome, RuleId,
    Server,
};

/// Health status of a storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// New availability values for one server, as computed by the status engine
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub server_id: String,
    pub state: AvailabilityState,
    pub last_seen: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Source of the servers a monitoring cycle should probe
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    /// All known servers except those in maintenance
    ///
    /// A failure here aborts the current cycle; it is retried on the next tick.
    async fn list_monitorable(&self) -> StorageResult<Vec<MonitorTarget>>;
}

/// Transactional record store used by the control loop
///
/// ## Alert uniqueness
///
/// Implementations must guarantee that at most one open (active or
/// acknowledged) alert exists per `(server_id, rule_id)`. `insert_alert` fails
/// with [`StorageError::Conflict`](super::StorageError::Conflict) instead of
/// creating a second one.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ========================================================================
    // Servers
    // ========================================================================

    /// Register a server, or update its address if it is already known
    ///
    /// Availability state and last-seen of an existing server are preserved.
    async fn register_server(&self, server: Server) -> StorageResult<()>;

    /// Fetch a single server
    async fn server(&self, server_id: &str) -> StorageResult<Option<Server>>;

    /// Persist the result of a status transition
    ///
    /// The write only happens if the server is not in maintenance, checked
    /// atomically with the write. Returns `false` when it was skipped.
    async fn update_server_status(&self, update: StatusUpdate) -> StorageResult<bool>;

    /// Operator action: force a state, typically entering or leaving maintenance
    async fn set_server_state(
        &self,
        server_id: &str,
        state: AvailabilityState,
    ) -> StorageResult<()>;

    // ========================================================================
    // Probe history
    // ========================================================================

    /// Append one probe outcome to the history
    async fn record_probe(&self, outcome: &ProbeOutcome) -> StorageResult<()>;

    /// The N most recent probe outcomes for a server, newest first
    async fn recent_probes(
        &self,
        server_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<ProbeOutcome>>;

    /// Delete probe history older than `before`, returning the number of rows removed
    async fn cleanup_probes_before(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    // ========================================================================
    // Alert rules
    // ========================================================================

    /// Create or replace a rule
    async fn upsert_rule(&self, rule: AlertRule) -> StorageResult<()>;

    /// Delete a rule, returning whether it existed
    async fn delete_rule(&self, rule_id: RuleId) -> StorageResult<bool>;

    /// All rules with `enabled = true`
    async fn enabled_rules(&self) -> StorageResult<Vec<AlertRule>>;

    // ========================================================================
    // Alerts
    // ========================================================================

    /// The open alert for a server/rule pair, if any
    async fn open_alert(&self, server_id: &str, rule_id: RuleId) -> StorageResult<Option<Alert>>;

    /// Insert a new active alert, honouring the uniqueness guarantee
    async fn insert_alert(&self, alert: NewAlert) -> StorageResult<Alert>;

    /// Refresh the observed value and time of an open alert
    async fn touch_alert(
        &self,
        alert_id: AlertId,
        value: f64,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Mark an alert resolved; resolving a resolved alert is a no-op
    async fn resolve_alert(&self, alert_id: AlertId, at: DateTime<Utc>) -> StorageResult<Alert>;

    /// Operator action: acknowledge an active alert
    async fn acknowledge_alert(&self, alert_id: AlertId) -> StorageResult<Alert>;

    /// All alerts of a server, oldest first
    async fn alerts_for_server(&self, server_id: &str) -> StorageResult<Vec<Alert>>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Check backend health
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}

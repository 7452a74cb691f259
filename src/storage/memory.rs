//! In-memory record store (no persistence)
//!
//! Implements both [`RecordStore`] and [`ServerDirectory`] on top of plain
//! collections behind a single `RwLock`. It's useful for:
//! - Testing without database dependencies
//! - Deployments that configure `"backend": "none"`
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Limited history**: Probe history is a ring buffer per server

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::backend::{HealthStatus, RecordStore, ServerDirectory, StatusUpdate};
use super::error::{StorageError, StorageResult};
use crate::model::{
    Alert, AlertId, AlertRule, AlertStatus, AvailabilityState, MonitorTarget, NewAlert,
    ProbeOutcome, RuleId, Server, ServerId,
};

/// Maximum probe outcomes to keep in memory per server
const MAX_PROBES_PER_SERVER: usize = 1000;

#[derive(Debug, Default)]
struct Inner {
    servers: BTreeMap<ServerId, Server>,
    probes: HashMap<ServerId, VecDeque<ProbeOutcome>>,
    rules: BTreeMap<RuleId, AlertRule>,
    alerts: BTreeMap<AlertId, Alert>,
    next_alert_id: AlertId,
}

impl Inner {
    fn open_alert(&self, server_id: &str, rule_id: RuleId) -> Option<&Alert> {
        self.alerts
            .values()
            .find(|a| a.server_id == server_id && a.rule_id == rule_id && a.status.is_open())
    }

    fn alert_mut(&mut self, alert_id: AlertId) -> StorageResult<&mut Alert> {
        self.alerts
            .get_mut(&alert_id)
            .ok_or(StorageError::UnknownAlert(alert_id))
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with servers and rules
    pub async fn seeded(servers: Vec<Server>, rules: Vec<AlertRule>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write().await;
            for server in servers {
                inner.servers.insert(server.id.clone(), server);
            }
            for rule in rules {
                inner.rules.insert(rule.id, rule);
            }
        }
        store
    }

    /// Number of probe outcomes currently held for a server
    pub async fn probe_count(&self, server_id: &str) -> usize {
        self.inner
            .read()
            .await
            .probes
            .get(server_id)
            .map_or(0, VecDeque::len)
    }

    /// Snapshot of every alert, ordered by id
    pub async fn all_alerts(&self) -> Vec<Alert> {
        self.inner.read().await.alerts.values().cloned().collect()
    }
}

#[async_trait]
impl ServerDirectory for MemoryStore {
    async fn list_monitorable(&self) -> StorageResult<Vec<MonitorTarget>> {
        let inner = self.inner.read().await;
        let targets: Vec<_> = inner
            .servers
            .values()
            .filter(|s| s.is_monitorable())
            .map(Server::target)
            .collect();

        trace!(
            "directory lists {} of {} servers",
            targets.len(),
            inner.servers.len()
        );
        Ok(targets)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn register_server(&self, server: Server) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        match inner.servers.get_mut(&server.id) {
            Some(existing) => {
                existing.address = server.address;
                existing.port = server.port;
                existing.display_name = server.display_name;
            }
            None => {
                debug!("registering server {}", server.id);
                inner.servers.insert(server.id.clone(), server);
            }
        }
        Ok(())
    }

    async fn server(&self, server_id: &str) -> StorageResult<Option<Server>> {
        Ok(self.inner.read().await.servers.get(server_id).cloned())
    }

    async fn update_server_status(&self, update: StatusUpdate) -> StorageResult<bool> {
        let mut inner = self.inner.write().await;
        let server = inner
            .servers
            .get_mut(&update.server_id)
            .ok_or_else(|| StorageError::UnknownServer(update.server_id.clone()))?;

        if server.state == AvailabilityState::Maintenance {
            return Ok(false);
        }

        server.state = update.state;
        server.last_seen = update.last_seen;
        server.consecutive_failures = update.consecutive_failures;
        Ok(true)
    }

    async fn set_server_state(
        &self,
        server_id: &str,
        state: AvailabilityState,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let server = inner
            .servers
            .get_mut(server_id)
            .ok_or_else(|| StorageError::UnknownServer(server_id.to_string()))?;

        debug!("server {server_id}: {} -> {state} (operator)", server.state);
        server.state = state;
        Ok(())
    }

    async fn record_probe(&self, outcome: &ProbeOutcome) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let history = inner.probes.entry(outcome.server_id.clone()).or_default();
        history.push_back(outcome.clone());
        if history.len() > MAX_PROBES_PER_SERVER {
            history.pop_front();
        }
        Ok(())
    }

    async fn recent_probes(
        &self,
        server_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<ProbeOutcome>> {
        let inner = self.inner.read().await;
        Ok(inner
            .probes
            .get(server_id)
            .map(|history| history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn cleanup_probes_before(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let mut removed = 0;
        for history in inner.probes.values_mut() {
            let len = history.len();
            history.retain(|p| p.observed_at >= before);
            removed += len - history.len();
        }
        Ok(removed)
    }

    async fn upsert_rule(&self, rule: AlertRule) -> StorageResult<()> {
        self.inner.write().await.rules.insert(rule.id, rule);
        Ok(())
    }

    async fn delete_rule(&self, rule_id: RuleId) -> StorageResult<bool> {
        Ok(self.inner.write().await.rules.remove(&rule_id).is_some())
    }

    async fn enabled_rules(&self) -> StorageResult<Vec<AlertRule>> {
        Ok(self
            .inner
            .read()
            .await
            .rules
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    async fn open_alert(&self, server_id: &str, rule_id: RuleId) -> StorageResult<Option<Alert>> {
        Ok(self.inner.read().await.open_alert(server_id, rule_id).cloned())
    }

    async fn insert_alert(&self, alert: NewAlert) -> StorageResult<Alert> {
        let mut inner = self.inner.write().await;

        // check and insert under the same write lock
        if inner.open_alert(&alert.server_id, alert.rule_id).is_some() {
            return Err(StorageError::Conflict {
                server_id: alert.server_id,
                rule_id: alert.rule_id,
            });
        }

        inner.next_alert_id += 1;
        let alert = alert.into_alert(inner.next_alert_id);
        inner.alerts.insert(alert.id, alert.clone());
        Ok(alert)
    }

    async fn touch_alert(
        &self,
        alert_id: AlertId,
        value: f64,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let alert = inner.alert_mut(alert_id)?;
        alert.observed_value = value;
        alert.last_observed_at = at;
        Ok(())
    }

    async fn resolve_alert(&self, alert_id: AlertId, at: DateTime<Utc>) -> StorageResult<Alert> {
        let mut inner = self.inner.write().await;
        let alert = inner.alert_mut(alert_id)?;
        if alert.status.is_open() {
            alert.status = AlertStatus::Resolved;
            alert.resolved_at = Some(at);
        }
        Ok(alert.clone())
    }

    async fn acknowledge_alert(&self, alert_id: AlertId) -> StorageResult<Alert> {
        let mut inner = self.inner.write().await;
        let alert = inner.alert_mut(alert_id)?;
        if alert.status == AlertStatus::Active {
            alert.status = AlertStatus::Acknowledged;
        }
        Ok(alert.clone())
    }

    async fn alerts_for_server(&self, server_id: &str) -> StorageResult<Vec<Alert>> {
        Ok(self
            .inner
            .read()
            .await
            .alerts
            .values()
            .filter(|a| a.server_id == server_id)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let inner = self.inner.read().await;
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("servers".to_string(), inner.servers.len().to_string()),
                ("alerts".to_string(), inner.alerts.len().to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory store (no-op)");
        Ok(())
    }
}

//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guardia::{
    actors::scheduler::MonitorCycle,
    model::{
        Alert, AlertId, AlertRule, AvailabilityState, Comparison, MetricKind, MonitorTarget,
        NewAlert, ProbeOutcome, RuleId, Server, Severity,
    },
    monitors::{EndpointProber, ProbeKind, Prober, StatusTransitionEngine},
    storage::{
        HealthStatus, MemoryStore, RecordStore, ServerDirectory, StatusUpdate, StorageError,
        StorageResult,
    },
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TEST_TIMEOUT: Duration = Duration::from_millis(500);

pub fn server_at(id: &str, addr: &SocketAddr) -> Server {
    Server::new(id, addr.ip().to_string(), addr.port())
}

/// Server registered from a wiremock URI, as an operator would configure it
pub fn server_from_uri(id: &str, uri: &str) -> Server {
    let url = url::Url::parse(uri).unwrap();
    Server::new(id, url.host_str().unwrap(), url.port().unwrap())
}

pub fn in_maintenance(mut server: Server) -> Server {
    server.state = AvailabilityState::Maintenance;
    server
}

pub fn http_prober() -> Arc<EndpointProber> {
    Arc::new(EndpointProber::new(ProbeKind::default()).unwrap())
}

/// Mock agent answering `/health` with the given status after `delay`
pub async fn mock_health(status: u16, delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(
            ResponseTemplate::new(status)
                .set_body_string("ok")
                .set_delay(delay),
        )
        .mount(&server)
        .await;
    server
}

/// Address of a port nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn cycle_with(
    store: Arc<MemoryStore>,
    directory: Arc<dyn ServerDirectory>,
    prober: Arc<dyn Prober>,
) -> MonitorCycle {
    MonitorCycle::new(
        directory,
        prober,
        StatusTransitionEngine::new(store),
        TEST_TIMEOUT,
    )
}

pub fn cycle_for(store: Arc<MemoryStore>, prober: Arc<dyn Prober>) -> MonitorCycle {
    cycle_with(store.clone(), store, prober)
}

pub fn cpu_rule() -> AlertRule {
    AlertRule::new(
        1,
        "High CPU",
        MetricKind::CpuUsage,
        Comparison::GreaterThan,
        90.0,
        Severity::High,
    )
}

pub fn memory_rule() -> AlertRule {
    AlertRule::new(
        2,
        "Low memory",
        MetricKind::MemoryUsage,
        Comparison::LessThan,
        10.0,
        Severity::Critical,
    )
}

/// Agent `/metrics` payload with the given CPU and memory usage
pub fn agent_payload(cpu: f32, memory_used: u64) -> serde_json::Value {
    serde_json::json!({
        "system": {
            "name": "TestOS",
            "kernel_version": "6.0",
            "os_version": "1",
            "host_name": "test"
        },
        "memory": { "total": 100, "used": memory_used, "total_swap": 0, "used_swap": 0 },
        "cpus": { "total": 4, "arch": "x86_64", "average_usage": cpu, "cpus": [] }
    })
}

/// Prober that tracks how many probes run at the same time
pub struct TrackingProber {
    pub delay: Duration,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl TrackingProber {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for TrackingProber {
    async fn probe(&self, target: &MonitorTarget, _timeout: Duration) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        ProbeOutcome::healthy(target.id.clone(), self.delay, None)
    }
}

/// Directory that can be switched into an unavailable state
pub struct SwitchableDirectory {
    pub inner: Arc<MemoryStore>,
    pub unavailable: AtomicBool,
}

impl SwitchableDirectory {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServerDirectory for SwitchableDirectory {
    async fn list_monitorable(&self) -> StorageResult<Vec<MonitorTarget>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("directory offline".to_string()));
        }
        self.inner.list_monitorable().await
    }
}

/// Record store whose writes fail for selected servers
///
/// It can also put servers into maintenance right after they are read,
/// like an operator acting while a probe outcome is being applied.
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    failing: HashSet<String>,
    parked_after_read: HashSet<String>,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>, failing: &[&str]) -> Self {
        Self {
            inner,
            failing: failing.iter().map(|s| s.to_string()).collect(),
            parked_after_read: HashSet::new(),
        }
    }

    pub fn parking_after_read(mut self, server_ids: &[&str]) -> Self {
        self.parked_after_read = server_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    fn check(&self, server_id: &str) -> StorageResult<()> {
        if self.failing.contains(server_id) {
            return Err(StorageError::QueryFailed(format!("disk full while writing {server_id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn register_server(&self, server: Server) -> StorageResult<()> {
        self.inner.register_server(server).await
    }

    async fn server(&self, server_id: &str) -> StorageResult<Option<Server>> {
        let snapshot = self.inner.server(server_id).await?;
        if self.parked_after_read.contains(server_id) {
            self.inner
                .set_server_state(server_id, AvailabilityState::Maintenance)
                .await?;
        }
        Ok(snapshot)
    }

    async fn update_server_status(&self, update: StatusUpdate) -> StorageResult<bool> {
        self.check(&update.server_id)?;
        self.inner.update_server_status(update).await
    }

    async fn set_server_state(
        &self,
        server_id: &str,
        state: AvailabilityState,
    ) -> StorageResult<()> {
        self.inner.set_server_state(server_id, state).await
    }

    async fn record_probe(&self, outcome: &ProbeOutcome) -> StorageResult<()> {
        self.check(&outcome.server_id)?;
        self.inner.record_probe(outcome).await
    }

    async fn recent_probes(
        &self,
        server_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<ProbeOutcome>> {
        self.inner.recent_probes(server_id, limit).await
    }

    async fn cleanup_probes_before(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        self.inner.cleanup_probes_before(before).await
    }

    async fn upsert_rule(&self, rule: AlertRule) -> StorageResult<()> {
        self.inner.upsert_rule(rule).await
    }

    async fn delete_rule(&self, rule_id: RuleId) -> StorageResult<bool> {
        self.inner.delete_rule(rule_id).await
    }

    async fn enabled_rules(&self) -> StorageResult<Vec<AlertRule>> {
        self.inner.enabled_rules().await
    }

    async fn open_alert(&self, server_id: &str, rule_id: RuleId) -> StorageResult<Option<Alert>> {
        self.inner.open_alert(server_id, rule_id).await
    }

    async fn insert_alert(&self, alert: NewAlert) -> StorageResult<Alert> {
        self.check(&alert.server_id)?;
        self.inner.insert_alert(alert).await
    }

    async fn touch_alert(
        &self,
        alert_id: AlertId,
        value: f64,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.inner.touch_alert(alert_id, value, at).await
    }

    async fn resolve_alert(&self, alert_id: AlertId, at: DateTime<Utc>) -> StorageResult<Alert> {
        self.inner.resolve_alert(alert_id, at).await
    }

    async fn acknowledge_alert(&self, alert_id: AlertId) -> StorageResult<Alert> {
        self.inner.acknowledge_alert(alert_id).await
    }

    async fn alerts_for_server(&self, server_id: &str) -> StorageResult<Vec<Alert>> {
        self.inner.alerts_for_server(server_id).await
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        self.inner.health_check().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}

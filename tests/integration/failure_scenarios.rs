//! Failure tests for the control loop
//!
//! These tests verify that the system handles failures gracefully:
//! - Refused connections and error statuses
//! - Server directory outages
//! - Record store write failures
//! - Unreachable agents and malformed payloads

use std::sync::Arc;
use std::time::Duration;

use guardia::{
    actors::{collector::CollectorHandle, scheduler::MonitorCycle},
    alerts::AlertLifecycleManager,
    config::ResolvedAgentConfig,
    model::{
        AlertRule, AvailabilityState, Comparison, MetricKind, MetricSample, ProbeClassification,
        ProbeOutcome, Server, Severity,
    },
    monitors::{MetricEvaluator, StatusTransitionEngine},
    storage::{MemoryStore, RecordStore, StorageError},
};
use tokio::sync::broadcast;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_refused_server_does_not_affect_the_others() {
    let mut mocks = Vec::new();
    let mut servers = Vec::new();
    for i in 0..4 {
        let mock = mock_health(200, Duration::ZERO).await;
        servers.push(server_from_uri(&format!("up-{i}"), &mock.uri()));
        mocks.push(mock);
    }
    servers.push(server_at("refusing", &closed_port().await));

    let store = Arc::new(MemoryStore::seeded(servers, Vec::new()).await);
    let report = cycle_for(store.clone(), http_prober()).run().await.unwrap();

    assert_eq!(report.probed, 5);
    assert_eq!(report.healthy, 4);
    assert_eq!(report.errors, 1);
    assert_eq!(report.store_failures, 0);

    for i in 0..4 {
        let server = store.server(&format!("up-{i}")).await.unwrap().unwrap();
        assert_eq!(server.state, AvailabilityState::Online);
        assert!(server.last_seen.is_some());
    }

    let refusing = store.server("refusing").await.unwrap().unwrap();
    assert_eq!(refusing.state, AvailabilityState::Offline);
    let outcome = &store.recent_probes("refusing", 1).await.unwrap()[0];
    assert_eq!(outcome.classification, ProbeClassification::Error);
    assert!(outcome.error.is_some());
}

#[tokio::test]
async fn test_directory_outage_aborts_only_the_current_cycle() {
    let up = mock_health(200, Duration::ZERO).await;
    let store = Arc::new(
        MemoryStore::seeded(vec![server_from_uri("up", &up.uri())], Vec::new()).await,
    );
    let directory = Arc::new(SwitchableDirectory::new(store.clone()));
    let cycle = cycle_with(store.clone(), directory.clone(), http_prober());

    directory.set_unavailable(true);
    let aborted = cycle.run().await;
    assert!(matches!(aborted, Err(StorageError::Unavailable(_))));
    assert!(up.received_requests().await.unwrap().is_empty());

    directory.set_unavailable(false);
    let report = cycle.run().await.unwrap();
    assert_eq!(report.healthy, 1);
}

#[tokio::test]
async fn test_store_failure_is_isolated_per_server() {
    let a = mock_health(200, Duration::ZERO).await;
    let b = mock_health(200, Duration::ZERO).await;
    let memory = Arc::new(
        MemoryStore::seeded(
            vec![server_from_uri("a", &a.uri()), server_from_uri("b", &b.uri())],
            Vec::new(),
        )
        .await,
    );
    let flaky = Arc::new(FlakyStore::new(memory.clone(), &["b"]));

    let cycle = MonitorCycle::new(
        memory.clone(),
        http_prober(),
        StatusTransitionEngine::new(flaky),
        TEST_TIMEOUT,
    );
    let report = cycle.run().await.unwrap();

    assert_eq!(report.probed, 2);
    assert_eq!(report.store_failures, 1);
    assert_eq!(
        memory.server("a").await.unwrap().unwrap().state,
        AvailabilityState::Online
    );
    assert_eq!(
        memory.server("b").await.unwrap().unwrap().state,
        AvailabilityState::Unknown
    );
}

#[tokio::test]
async fn test_maintenance_set_while_applying_is_kept() {
    let memory = Arc::new(
        MemoryStore::seeded(vec![Server::new("web-1", "10.0.0.1", 80)], Vec::new()).await,
    );
    let store = Arc::new(FlakyStore::new(memory.clone(), &[]).parking_after_read(&["web-1"]));
    let engine = StatusTransitionEngine::new(store);

    for outcome in [
        ProbeOutcome::error("web-1", Duration::from_millis(2), "connection refused"),
        ProbeOutcome::healthy("web-1", Duration::from_millis(2), None),
    ] {
        let transition = engine.apply(&outcome).await.unwrap();
        assert!(transition.is_none());

        let server = memory.server("web-1").await.unwrap().unwrap();
        assert_eq!(server.state, AvailabilityState::Maintenance);
        assert!(server.last_seen.is_none());
    }
    assert_eq!(memory.probe_count("web-1").await, 2);
}

#[tokio::test]
async fn test_alert_store_failure_is_counted_not_raised() {
    let memory = Arc::new(MemoryStore::seeded(Vec::new(), vec![cpu_rule()]).await);
    let flaky = Arc::new(FlakyStore::new(memory.clone(), &["broken"]));
    let manager = AlertLifecycleManager::new(flaky, MetricEvaluator::new());

    let report = manager
        .reconcile(&MetricSample::new("broken", MetricKind::CpuUsage, 99.0))
        .await
        .unwrap();
    assert_eq!(report.failures, 1);
    assert!(report.opened.is_empty());

    let report = manager
        .reconcile(&MetricSample::new("fine", MetricKind::CpuUsage, 99.0))
        .await
        .unwrap();
    assert_eq!(report.opened.len(), 1);
}

#[tokio::test]
async fn test_invalid_rules_are_skipped() {
    let broken = AlertRule::new(
        9,
        "Broken",
        MetricKind::CpuUsage,
        Comparison::GreaterThan,
        f64::INFINITY,
        Severity::Low,
    );
    let store = Arc::new(MemoryStore::seeded(Vec::new(), vec![cpu_rule(), broken]).await);
    let manager = AlertLifecycleManager::new(store.clone(), MetricEvaluator::new());

    let report = manager
        .reconcile(&MetricSample::new("web-1", MetricKind::CpuUsage, 99.0))
        .await
        .unwrap();

    assert_eq!(report.opened.len(), 1);
    assert_eq!(report.opened[0].rule_id, 1);
    assert_eq!(report.failures, 0);
}

#[tokio::test]
async fn test_collector_handles_agent_unreachable() {
    let addr = closed_port().await;
    let (metric_tx, mut metric_rx) = broadcast::channel(16);
    let collector = CollectorHandle::spawn(
        "gone".to_string(),
        "gone".to_string(),
        ResolvedAgentConfig {
            url: format!("http://{addr}/metrics"),
            interval: Duration::from_secs(3600),
            token: None,
        },
        reqwest::Client::new(),
        metric_tx,
    );

    assert!(collector.poll_now().await.is_err());
    let received = tokio::time::timeout(Duration::from_millis(100), metric_rx.recv()).await;
    assert!(received.is_err(), "no metrics should be published on failure");

    collector.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_collector_handles_500_error() {
    let agent = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&agent)
        .await;

    let (metric_tx, _metric_rx) = broadcast::channel(16);
    let collector = CollectorHandle::spawn(
        "web-1".to_string(),
        "web-1".to_string(),
        ResolvedAgentConfig {
            url: format!("{}/metrics", agent.uri()),
            interval: Duration::from_secs(3600),
            token: None,
        },
        reqwest::Client::new(),
        metric_tx,
    );

    assert!(collector.poll_now().await.is_err());
    // still alive after the failure
    collector.update_interval(60).await.unwrap();
    collector.shutdown().await.unwrap();
}

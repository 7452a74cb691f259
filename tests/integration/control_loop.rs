//! End-to-end behaviour of the monitoring cycle and the alert pipeline

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use guardia::{
    actors::{
        alert::AlertHandle, collector::CollectorHandle, messages::AlertEvent, scheduler::Scheduler,
    },
    alerts::AlertLifecycleManager,
    config::ResolvedAgentConfig,
    model::{
        AlertStatus, AvailabilityState, MetricKind, MetricSample, ProbeClassification, Severity,
    },
    monitors::MetricEvaluator,
    storage::{MemoryStore, RecordStore},
};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_cycle_probes_each_monitorable_server_exactly_once() {
    let up = mock_health(200, Duration::ZERO).await;
    let parked = mock_health(200, Duration::ZERO).await;

    let store = Arc::new(
        MemoryStore::seeded(
            vec![
                server_from_uri("up", &up.uri()),
                in_maintenance(server_from_uri("parked", &parked.uri())),
            ],
            Vec::new(),
        )
        .await,
    );

    let report = cycle_for(store.clone(), http_prober()).run().await.unwrap();

    assert_eq!(report.probed, 1);
    assert_eq!(up.received_requests().await.unwrap().len(), 1);
    assert!(parked.received_requests().await.unwrap().is_empty());
    assert_eq!(store.probe_count("parked").await, 0);
}

#[tokio::test]
async fn test_healthy_and_unhealthy_transitions() {
    let healthy = mock_health(200, Duration::ZERO).await;
    let failing = mock_health(500, Duration::ZERO).await;

    let seen_before = Utc::now() - chrono::Duration::hours(1);
    let mut was_online = server_from_uri("failing", &failing.uri());
    was_online.state = AvailabilityState::Online;
    was_online.last_seen = Some(seen_before);

    let store = Arc::new(
        MemoryStore::seeded(
            vec![server_from_uri("healthy", &healthy.uri()), was_online],
            Vec::new(),
        )
        .await,
    );

    let started = Utc::now();
    let report = cycle_for(store.clone(), http_prober()).run().await.unwrap();

    assert_eq!(report.healthy, 1);
    assert_eq!(report.unhealthy, 1);
    assert_eq!(report.transitions.len(), 2);

    let healthy = store.server("healthy").await.unwrap().unwrap();
    assert_eq!(healthy.state, AvailabilityState::Online);
    assert!(healthy.last_seen.unwrap() >= started);

    let failing = store.server("failing").await.unwrap().unwrap();
    assert_eq!(failing.state, AvailabilityState::Offline);
    assert_eq!(failing.last_seen, Some(seen_before));

    let history = store.recent_probes("failing", 1).await.unwrap();
    assert_eq!(history[0].classification, ProbeClassification::Unhealthy);
}

#[tokio::test]
async fn test_unresponsive_server_times_out() {
    let slow = mock_health(200, Duration::from_secs(3)).await;
    let store = Arc::new(
        MemoryStore::seeded(vec![server_from_uri("slow", &slow.uri())], Vec::new()).await,
    );

    let report = cycle_for(store.clone(), http_prober()).run().await.unwrap();

    assert_eq!(report.timeouts, 1);
    let outcome = &store.recent_probes("slow", 1).await.unwrap()[0];
    assert_eq!(outcome.classification, ProbeClassification::Timeout);
    assert_eq!(outcome.error.as_deref(), Some("connection timeout"));
    assert_eq!(
        store.server("slow").await.unwrap().unwrap().state,
        AvailabilityState::Offline
    );
}

#[tokio::test]
async fn test_scheduler_publishes_probe_events() {
    let up = mock_health(200, Duration::ZERO).await;
    let store = Arc::new(
        MemoryStore::seeded(vec![server_from_uri("up", &up.uri())], Vec::new()).await,
    );

    let scheduler = Scheduler::new(
        cycle_for(store.clone(), http_prober()),
        Duration::from_secs(3600),
    );
    let mut events = scheduler.subscribe();
    scheduler.start();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.outcome.server_id, "up");
    assert!(event.outcome.classification.is_healthy());
    assert_eq!(event.transition.unwrap().to, AvailabilityState::Online);

    scheduler.stop().await;
}

#[tokio::test]
async fn test_cpu_rule_lifecycle_through_alert_actor() {
    let store = Arc::new(MemoryStore::seeded(Vec::new(), vec![cpu_rule()]).await);
    let manager = Arc::new(AlertLifecycleManager::new(store.clone(), MetricEvaluator::new()));
    let mut alert_events = manager.subscribe();
    let (_metric_tx, metric_rx) = broadcast::channel(16);
    let alerts = AlertHandle::spawn(manager, metric_rx);

    let cpu = |value| MetricSample::new("web-1", MetricKind::CpuUsage, value);

    let first = alerts.ingest(vec![cpu(95.0)]).await.unwrap();
    assert_eq!(first.opened.len(), 1);
    assert_eq!(first.opened[0].status, AlertStatus::Active);
    assert_eq!(first.opened[0].severity, Severity::High);

    let second = alerts.ingest(vec![cpu(96.0)]).await.unwrap();
    assert!(second.opened.is_empty());
    assert_eq!(store.all_alerts().await.len(), 1);

    let third = alerts.ingest(vec![cpu(80.0)]).await.unwrap();
    assert_eq!(third.resolved.len(), 1);

    let alert = &store.all_alerts().await[0];
    assert_eq!(alert.status, AlertStatus::Resolved);
    assert!(alert.resolved_at.is_some());

    assert!(matches!(alert_events.recv().await.unwrap(), AlertEvent::Opened(_)));
    assert!(matches!(alert_events.recv().await.unwrap(), AlertEvent::Resolved(_)));

    alerts.shutdown().await;
}

#[tokio::test]
async fn test_same_sample_twice_creates_no_duplicate() {
    let store = Arc::new(MemoryStore::seeded(Vec::new(), vec![cpu_rule()]).await);
    let manager = Arc::new(AlertLifecycleManager::new(store.clone(), MetricEvaluator::new()));
    let (_metric_tx, metric_rx) = broadcast::channel(16);
    let alerts = AlertHandle::spawn(manager, metric_rx);

    let sample = MetricSample::new("web-1", MetricKind::CpuUsage, 95.0);
    alerts.ingest(vec![sample.clone(), sample]).await.unwrap();

    assert_eq!(store.all_alerts().await.len(), 1);
    alerts.shutdown().await;
}

#[tokio::test]
async fn test_collected_memory_metrics_raise_and_resolve_critical_alert() {
    let agent = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(agent_payload(10.0, 5)))
        .mount(&agent)
        .await;

    let store = Arc::new(MemoryStore::seeded(Vec::new(), vec![memory_rule()]).await);
    let manager = Arc::new(AlertLifecycleManager::new(store.clone(), MetricEvaluator::new()));
    let mut alert_events = manager.subscribe();

    let (metric_tx, metric_rx) = broadcast::channel(16);
    let alerts = AlertHandle::spawn(manager, metric_rx);
    let collector = CollectorHandle::spawn(
        "db-1".to_string(),
        "DB 1".to_string(),
        ResolvedAgentConfig {
            url: format!("{}/metrics", agent.uri()),
            interval: Duration::from_secs(3600),
            token: None,
        },
        reqwest::Client::new(),
        metric_tx,
    );

    collector.poll_now().await.unwrap();
    let opened = tokio::time::timeout(Duration::from_secs(2), alert_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(opened.alert().severity, Severity::Critical);

    // memory back at 50%
    agent.reset().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(agent_payload(10.0, 50)))
        .mount(&agent)
        .await;
    collector.poll_now().await.unwrap();
    let resolved = tokio::time::timeout(Duration::from_secs(2), alert_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.alert().status, AlertStatus::Resolved);
    assert_eq!(store.alerts_for_server("db-1").await.unwrap().len(), 1);

    collector.shutdown().await.unwrap();
    alerts.shutdown().await;
}

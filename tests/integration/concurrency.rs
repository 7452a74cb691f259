//! Concurrency tests for the scheduler and the alert lifecycle
//!
//! These tests verify:
//! - Concurrent reconciliation of one (server, rule) pair opens one alert
//! - Different servers are evaluated independently
//! - Cycles never overlap, even when slower than the interval
//! - Stopping mid-cycle lets in-flight probes finish

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use guardia::{
    actors::{alert::AlertHandle, scheduler::Scheduler},
    alerts::AlertLifecycleManager,
    model::{AlertStatus, MetricKind, MetricSample, Server},
    monitors::MetricEvaluator,
    storage::{MemoryStore, RecordStore},
};
use tokio::sync::broadcast;

use crate::helpers::*;

async fn tracked_servers(count: usize) -> Arc<MemoryStore> {
    let servers = (0..count)
        .map(|i| Server::new(format!("srv-{i}"), "127.0.0.1", 1000 + i as u16))
        .collect();
    Arc::new(MemoryStore::seeded(servers, Vec::new()).await)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reconcile_opens_single_alert() {
    let store = Arc::new(MemoryStore::seeded(Vec::new(), vec![cpu_rule()]).await);
    let manager = Arc::new(AlertLifecycleManager::new(store.clone(), MetricEvaluator::new()));

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let value = 91.0 + i as f64 / 10.0;
                let sample = MetricSample::new("web-1", MetricKind::CpuUsage, value);
                manager.reconcile(&sample).await.unwrap()
            })
        })
        .collect();

    let mut opened = 0;
    for task in tasks {
        opened += task.await.unwrap().opened.len();
    }

    assert_eq!(opened, 1);
    let alerts = store.alerts_for_server("web-1").await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].status, AlertStatus::Active);
    assert!(manager.locks().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_servers_are_reconciled_independently() {
    let store = Arc::new(MemoryStore::seeded(Vec::new(), vec![cpu_rule()]).await);
    let manager = Arc::new(AlertLifecycleManager::new(store.clone(), MetricEvaluator::new()));
    let (_metric_tx, metric_rx) = broadcast::channel(16);
    let alerts = AlertHandle::spawn(manager, metric_rx);

    let samples: Vec<_> = (0..10)
        .map(|i| MetricSample::new(format!("web-{i}"), MetricKind::CpuUsage, 95.0))
        .collect();
    let report = alerts.ingest(samples).await.unwrap();

    assert_eq!(report.opened.len(), 10);
    assert_eq!(store.all_alerts().await.len(), 10);

    // an ordered burst for one server ends in the state of its last sample
    let burst: Vec<_> = [95.0, 50.0, 97.0, 20.0]
        .into_iter()
        .map(|value| MetricSample::new("web-0", MetricKind::CpuUsage, value))
        .collect();
    alerts.ingest(burst).await.unwrap();

    let history = store.alerts_for_server("web-0").await.unwrap();
    assert!(history.iter().all(|alert| alert.status == AlertStatus::Resolved));
    assert_eq!(history.len(), 2);

    alerts.shutdown().await;
}

#[tokio::test]
async fn test_probes_within_a_cycle_run_concurrently() {
    let store = tracked_servers(8).await;
    let prober = Arc::new(TrackingProber::new(Duration::from_millis(100)));

    let report = cycle_for(store, prober.clone()).run().await.unwrap();

    assert_eq!(report.healthy, 8);
    assert_eq!(prober.max_in_flight.load(Ordering::SeqCst), 8);
    assert!(report.duration < Duration::from_millis(400));
}

#[tokio::test]
async fn test_slow_cycles_never_overlap() {
    let store = tracked_servers(3).await;
    let prober = Arc::new(TrackingProber::new(Duration::from_millis(120)));
    let scheduler = Scheduler::new(cycle_for(store, prober.clone()), Duration::from_millis(20));

    scheduler.start();
    tokio::time::sleep(Duration::from_millis(500)).await;
    scheduler.stop().await;

    let calls = prober.calls();
    assert!(calls >= 3);
    assert_eq!(calls % 3, 0, "every cycle probes each server exactly once");
    assert!(prober.max_in_flight.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_cycle() {
    let store = tracked_servers(4).await;
    let prober = Arc::new(TrackingProber::new(Duration::from_millis(200)));
    let mut events = {
        let scheduler = Scheduler::new(
            cycle_for(store.clone(), prober.clone()),
            Duration::from_secs(3600),
        );
        let events = scheduler.subscribe();
        scheduler.start();

        // let the first cycle dispatch its probes
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.stop().await);
        assert!(!scheduler.is_running());
        events
    };

    assert_eq!(prober.calls(), 4);
    for i in 0..4 {
        assert!(store.server(&format!("srv-{i}")).await.unwrap().unwrap().last_seen.is_some());
    }

    let mut delivered = 0;
    while events.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, 4);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(prober.calls(), 4, "no cycle may start after stop");
}

#[tokio::test]
async fn test_start_after_stop_resumes() {
    let store = tracked_servers(1).await;
    let prober = Arc::new(TrackingProber::new(Duration::ZERO));
    let scheduler = Scheduler::new(cycle_for(store, prober.clone()), Duration::from_secs(3600));

    assert!(scheduler.start());
    assert!(!scheduler.start());
    let report = scheduler.run_now().await.unwrap();
    assert_eq!(report.probed, 1);
    assert!(scheduler.stop().await);
    assert!(!scheduler.stop().await);
    assert!(scheduler.run_now().await.is_err());

    assert!(scheduler.start());
    let report = scheduler.run_now().await.unwrap();
    assert_eq!(report.healthy, 1);
    scheduler.stop().await;
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use guardia::{
    actors::{
        alert::AlertHandle,
        collector::CollectorHandle,
        messages::AlertEvent,
        scheduler::{MonitorCycle, Scheduler},
    },
    alerts::AlertLifecycleManager,
    config::{ResolvedConfig, StorageConfig, read_config_file},
    monitors::{EndpointProber, StatusTransitionEngine},
    storage::{MemoryStore, RecordStore, ServerDirectory},
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short, long, env = "GUARDIA_CONFIG")]
    file: PathBuf,

    /// Log level for guardia targets
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

fn init(level: LevelFilter) {
    let filter = filter::Targets::new().with_targets(vec![
        ("guardia", level),
        ("guardia_monitor", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

type Stores = (Arc<dyn RecordStore>, Arc<dyn ServerDirectory>);

fn shared<S: RecordStore + ServerDirectory + 'static>(store: S) -> Stores {
    let store = Arc::new(store);
    let records: Arc<dyn RecordStore> = store.clone();
    let directory: Arc<dyn ServerDirectory> = store;
    (records, directory)
}

async fn open_store(storage: &StorageConfig) -> anyhow::Result<Stores> {
    match storage {
        StorageConfig::None => {
            info!("using in-memory store, nothing will be persisted");
            Ok(shared(MemoryStore::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path, .. } => {
            let store = guardia::storage::sqlite::SqliteStore::new(path)
                .await
                .with_context(|| format!("failed to open database {}", path.display()))?;
            Ok(shared(store))
        }
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => {
            warn!("built without SQLite support, falling back to in-memory store");
            Ok(shared(MemoryStore::new()))
        }
    }
}

/// Push configured servers and rules into the record store
async fn seed_store(store: &dyn RecordStore, config: &ResolvedConfig) -> anyhow::Result<()> {
    for server in &config.servers {
        store
            .register_server(server.server.clone())
            .await
            .with_context(|| format!("failed to register server {}", server.server.id))?;
    }
    for rule in &config.rules {
        store
            .upsert_rule(rule.clone())
            .await
            .with_context(|| format!("failed to store rule {}", rule.id))?;
    }
    debug!(
        "registered {} servers and {} rules",
        config.servers.len(),
        config.rules.len()
    );
    Ok(())
}

/// Alert notifications are only logged; delivery is handled elsewhere
async fn log_alert_events(mut events: broadcast::Receiver<AlertEvent>) {
    loop {
        match events.recv().await {
            Ok(AlertEvent::Opened(alert)) => warn!(
                "[{}] alert {} opened for {}: {}",
                alert.severity, alert.id, alert.server_id, alert.description
            ),
            Ok(AlertEvent::Resolved(alert)) => info!(
                "alert {} resolved for {}: {}",
                alert.id, alert.server_id, alert.description
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("alert log lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init(args.log_level);
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?.resolve()?;
    let settings = config.monitoring.clone();

    let (store, directory) = open_store(&config.storage).await?;
    seed_store(store.as_ref(), &config).await?;

    // monitoring cycle
    let prober =
        EndpointProber::new(settings.probe.clone()).context("failed to build HTTP client")?;
    let engine = StatusTransitionEngine::new(store.clone())
        .with_failure_threshold(settings.failure_threshold);
    let cycle = MonitorCycle::new(directory, Arc::new(prober), engine, settings.timeout);
    let mut scheduler = Scheduler::new(cycle, settings.interval);
    if let Some(keep) = config.storage.retention() {
        scheduler = scheduler.with_retention(store.clone(), keep);
    }

    // metric ingestion and alerting
    let manager = Arc::new(AlertLifecycleManager::new(store.clone(), settings.evaluator()));
    tokio::spawn(log_alert_events(manager.subscribe()));

    let (metric_tx, metric_rx) = broadcast::channel(1024);
    let alerts = AlertHandle::spawn(manager, metric_rx);

    let client = reqwest::Client::new();
    let collectors: Vec<CollectorHandle> = config
        .servers
        .iter()
        .filter_map(|server| {
            let agent = server.agent.clone()?;
            Some(CollectorHandle::spawn(
                server.server.id.clone(),
                server.server.display(),
                agent,
                client.clone(),
                metric_tx.clone(),
            ))
        })
        .collect();
    info!("started {} metric collectors", collectors.len());

    scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    scheduler.stop().await;
    for collector in &collectors {
        if let Err(e) = collector.shutdown().await {
            error!("failed to stop collector for {}: {e:#}", collector.display_name);
        }
    }
    alerts.shutdown().await;
    store.close().await?;

    Ok(())
}

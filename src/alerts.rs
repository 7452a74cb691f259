//! Alert Lifecycle Manager
//!
//! Turns evaluator verdicts into alert state in the record store:
//!
//! ```text
//! violated,     no open alert  → insert ACTIVE alert   → AlertEvent::Opened
//! violated,     open alert     → refresh observed value (no new alert)
//! not violated, open alert     → RESOLVED              → AlertEvent::Resolved
//! not violated, no open alert  → nothing
//! ```
//!
//! "Open" means ACTIVE or ACKNOWLEDGED. An acknowledged alert still blocks a
//! duplicate and is still resolved once the metric recovers.
//!
//! ## Concurrency
//!
//! Check-then-create for a `(server, rule)` pair runs under a per-pair async
//! mutex, so concurrent evaluations of the same pair serialize while
//! different pairs proceed in parallel. The store's uniqueness guarantee
//! backs this up across processes: a [`StorageError::Conflict`] on insert is
//! treated as "someone else opened it first".

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::{OwnedMutexGuard, broadcast};
use tracing::{debug, info, instrument, trace, warn};

use crate::actors::messages::AlertEvent;
use crate::model::{Alert, AlertId, AlertRule, MetricSample, NewAlert, RuleId, ServerId};
use crate::monitors::evaluator::{MetricEvaluator, Verdict};
use crate::storage::{RecordStore, StorageError, StorageResult};

type PairKey = (ServerId, RuleId);
type LockTable = HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>;

/// Table of per-(server, rule) locks
///
/// Entries are created on demand and removed again once nobody holds or
/// waits for them, so the table only grows with concurrent activity.
#[derive(Debug, Default, Clone)]
pub struct PairLocks {
    table: Arc<Mutex<LockTable>>,
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the pair
    pub async fn lock(&self, server_id: &str, rule_id: RuleId) -> PairGuard {
        let key = (server_id.to_string(), rule_id);
        let mutex = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.entry(key.clone()).or_default().clone()
        };

        let guard = mutex.lock_owned().await;
        PairGuard {
            table: self.table.clone(),
            key,
            guard: Some(guard),
        }
    }

    /// Number of pairs currently locked or waited on
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one (server, rule) pair; released on drop
pub struct PairGuard {
    table: Arc<Mutex<LockTable>>,
    key: PairKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PairGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        // only the table itself still references the mutex: nobody is waiting
        if table
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            table.remove(&self.key);
        }
    }
}

/// What a single reconciliation did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub opened: Vec<Alert>,
    pub refreshed: usize,
    pub resolved: Vec<Alert>,
    /// Pairs whose store operations failed
    pub failures: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.opened.is_empty() && self.refreshed == 0 && self.resolved.is_empty()
    }

    pub fn merge(&mut self, other: ReconcileReport) {
        self.opened.extend(other.opened);
        self.refreshed += other.refreshed;
        self.resolved.extend(other.resolved);
        self.failures += other.failures;
    }
}

enum PairAction {
    Opened(Alert),
    Refreshed,
    Resolved(Alert),
    Unchanged,
}

/// Opens, deduplicates and resolves alerts for incoming metric samples
pub struct AlertLifecycleManager {
    store: Arc<dyn RecordStore>,
    evaluator: MetricEvaluator,
    locks: PairLocks,
    events: broadcast::Sender<AlertEvent>,
}

impl AlertLifecycleManager {
    pub fn new(store: Arc<dyn RecordStore>, evaluator: MetricEvaluator) -> Self {
        let (events, _) = broadcast::channel(256);
        Self::with_events(store, evaluator, events)
    }

    /// Publish alert transitions on an existing channel
    pub fn with_events(
        store: Arc<dyn RecordStore>,
        evaluator: MetricEvaluator,
        events: broadcast::Sender<AlertEvent>,
    ) -> Self {
        Self {
            store,
            evaluator,
            locks: PairLocks::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    pub fn evaluator(&self) -> &MetricEvaluator {
        &self.evaluator
    }

    pub fn locks(&self) -> &PairLocks {
        &self.locks
    }

    /// Evaluate `sample` against the enabled rules and update alerts
    ///
    /// Fails only if the rules cannot be loaded. Failures on individual pairs
    /// are logged and counted in the report.
    #[instrument(
        skip(self, sample),
        fields(server = %sample.server_id, metric = %sample.metric, value = sample.value)
    )]
    pub async fn reconcile(&self, sample: &MetricSample) -> StorageResult<ReconcileReport> {
        let rules = self.store.enabled_rules().await?;
        Ok(self.reconcile_with(sample, &rules).await)
    }

    /// Like [`reconcile`](Self::reconcile) with an already loaded rule set
    pub async fn reconcile_with(
        &self,
        sample: &MetricSample,
        rules: &[AlertRule],
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for verdict in self.evaluator.judge(sample, rules) {
            let _guard = self.locks.lock(&sample.server_id, verdict.rule.id).await;

            match self.reconcile_pair(sample, verdict).await {
                Ok(PairAction::Opened(alert)) => report.opened.push(alert),
                Ok(PairAction::Refreshed) => report.refreshed += 1,
                Ok(PairAction::Resolved(alert)) => report.resolved.push(alert),
                Ok(PairAction::Unchanged) => {}
                Err(e) => {
                    warn!(
                        "failed to reconcile rule {} ({}): {e}",
                        verdict.rule.id, verdict.rule.name
                    );
                    report.failures += 1;
                }
            }
        }

        report
    }

    async fn reconcile_pair(
        &self,
        sample: &MetricSample,
        verdict: Verdict<'_>,
    ) -> StorageResult<PairAction> {
        let rule = verdict.rule;
        let open = self.store.open_alert(&sample.server_id, rule.id).await?;
        let now = Utc::now();

        match (verdict.violated, open) {
            (true, Some(alert)) => {
                trace!("alert {} still open, refreshing", alert.id);
                self.store.touch_alert(alert.id, sample.value, now).await?;
                Ok(PairAction::Refreshed)
            }
            (true, None) => {
                let new_alert = NewAlert::from_violation(rule, sample, now);
                match self.store.insert_alert(new_alert).await {
                    Ok(alert) => {
                        info!(
                            "opened {} alert {}: {}",
                            alert.severity, alert.id, alert.description
                        );
                        self.publish(AlertEvent::Opened(alert.clone()));
                        Ok(PairAction::Opened(alert))
                    }
                    Err(StorageError::Conflict { .. }) => {
                        debug!("alert for rule {} opened concurrently elsewhere", rule.id);
                        let current = self.store.open_alert(&sample.server_id, rule.id).await?;
                        if let Some(alert) = current {
                            self.store.touch_alert(alert.id, sample.value, now).await?;
                        }
                        Ok(PairAction::Refreshed)
                    }
                    Err(e) => Err(e),
                }
            }
            (false, Some(alert)) => {
                let resolved = self.store.resolve_alert(alert.id, now).await?;
                info!("resolved alert {}: {}", resolved.id, resolved.description);
                self.publish(AlertEvent::Resolved(resolved.clone()));
                Ok(PairAction::Resolved(resolved))
            }
            (false, None) => Ok(PairAction::Unchanged),
        }
    }

    /// Operator action: acknowledge an active alert
    ///
    /// An acknowledged alert stays open until the metric recovers.
    #[instrument(skip(self))]
    pub async fn acknowledge(&self, alert_id: AlertId) -> StorageResult<Alert> {
        let alert = self.store.acknowledge_alert(alert_id).await?;
        info!("alert {} is {}", alert.id, alert.status);
        Ok(alert)
    }

    fn publish(&self, event: AlertEvent) {
        if self.events.send(event).is_err() {
            trace!("no alert event subscribers");
        }
    }
}

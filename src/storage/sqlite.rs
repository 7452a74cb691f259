//! SQLite record store implementation
//!
//! This module provides a SQLite-based implementation of [`RecordStore`] and
//! [`ServerDirectory`].
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Better concurrency for reads during writes
//! - **Connection pooling**: Efficient resource usage
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! ## Alert uniqueness
//!
//! A partial unique index on `alerts (server_id, rule_id) WHERE status != 'resolved'`
//! makes the database itself reject a second open alert for the same pair.
//! The violation is surfaced as [`StorageError::Conflict`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, RecordStore, ServerDirectory, StatusUpdate};
use super::error::{StorageError, StorageResult};
use crate::model::{
    Alert, AlertId, AlertRule, AvailabilityState, MonitorTarget, NewAlert, ProbeOutcome, RuleId,
    Server,
};

const ALERT_COLUMNS: &str = "id, server_id, rule_id, severity, status, description, \
     observed_value, created_at, last_observed_at, resolved_at";

const SERVER_COLUMNS: &str =
    "id, address, port, display_name, state, last_seen, consecutive_failures";

/// SQLite record store
///
/// Ideal for single-node deployments monitoring up to a few hundred servers.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path` and run migrations
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use guardia::storage::sqlite::SqliteStore;
    /// # async fn example() -> anyhow::Result<()> {
    /// let store = SqliteStore::new("./guardia.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite store at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> StorageResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| StorageError::InvalidRecord(format!("timestamp out of range: {millis}")))
    }

    fn parse_column<T>(row: &SqliteRow, column: &str) -> StorageResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let raw: String = row.try_get(column)?;
        raw.parse()
            .map_err(|e: T::Err| StorageError::InvalidRecord(format!("{column}: {e}")))
    }

    fn server_from_row(row: &SqliteRow) -> StorageResult<Server> {
        let port: i64 = row.try_get("port")?;
        let last_seen: Option<i64> = row.try_get("last_seen")?;
        let failures: i64 = row.try_get("consecutive_failures")?;

        Ok(Server {
            id: row.try_get("id")?,
            address: row.try_get("address")?,
            port: u16::try_from(port)
                .map_err(|_| StorageError::InvalidRecord(format!("port out of range: {port}")))?,
            display_name: row.try_get("display_name")?,
            state: Self::parse_column(row, "state")?,
            last_seen: last_seen.map(Self::millis_to_timestamp).transpose()?,
            consecutive_failures: u32::try_from(failures).unwrap_or(u32::MAX),
        })
    }

    fn probe_from_row(row: &SqliteRow) -> StorageResult<ProbeOutcome> {
        let latency_us: i64 = row.try_get("latency_us")?;
        Ok(ProbeOutcome {
            server_id: row.try_get("server_id")?,
            classification: Self::parse_column(row, "classification")?,
            latency: Duration::from_micros(latency_us.max(0) as u64),
            error: row.try_get("error")?,
            payload: row.try_get("payload")?,
            observed_at: Self::millis_to_timestamp(row.try_get("observed_at")?)?,
        })
    }

    fn rule_from_row(row: &SqliteRow) -> StorageResult<AlertRule> {
        Ok(AlertRule {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            metric: Self::parse_column(row, "metric")?,
            condition: Self::parse_column(row, "condition")?,
            threshold: row.try_get("threshold")?,
            severity: Self::parse_column(row, "severity")?,
            enabled: row.try_get("enabled")?,
        })
    }

    fn alert_from_row(row: &SqliteRow) -> StorageResult<Alert> {
        let resolved_at: Option<i64> = row.try_get("resolved_at")?;
        Ok(Alert {
            id: row.try_get("id")?,
            server_id: row.try_get("server_id")?,
            rule_id: row.try_get("rule_id")?,
            severity: Self::parse_column(row, "severity")?,
            status: Self::parse_column(row, "status")?,
            description: row.try_get("description")?,
            observed_value: row.try_get("observed_value")?,
            created_at: Self::millis_to_timestamp(row.try_get("created_at")?)?,
            last_observed_at: Self::millis_to_timestamp(row.try_get("last_observed_at")?)?,
            resolved_at: resolved_at.map(Self::millis_to_timestamp).transpose()?,
        })
    }

    async fn fetch_alert(&self, alert_id: AlertId) -> StorageResult<Alert> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::UnknownAlert(alert_id))?;

        Self::alert_from_row(&row)
    }
}

#[async_trait]
impl ServerDirectory for SqliteStore {
    #[instrument(skip(self))]
    async fn list_monitorable(&self) -> StorageResult<Vec<MonitorTarget>> {
        let rows = sqlx::query("SELECT id, address, port FROM servers WHERE state != ? ORDER BY id")
            .bind(AvailabilityState::Maintenance.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let port: i64 = row.try_get("port")?;
                Ok(MonitorTarget {
                    id: row.try_get("id")?,
                    address: row.try_get("address")?,
                    port: u16::try_from(port).map_err(|_| {
                        StorageError::InvalidRecord(format!("port out of range: {port}"))
                    })?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    #[instrument(skip(self, server), fields(server_id = %server.id))]
    async fn register_server(&self, server: Server) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO servers
                (id, address, port, display_name, state, last_seen, consecutive_failures)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                address = excluded.address,
                port = excluded.port,
                display_name = excluded.display_name
            "#,
        )
        .bind(&server.id)
        .bind(&server.address)
        .bind(i64::from(server.port))
        .bind(&server.display_name)
        .bind(server.state.as_str())
        .bind(server.last_seen.as_ref().map(Self::timestamp_to_millis))
        .bind(i64::from(server.consecutive_failures))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn server(&self, server_id: &str) -> StorageResult<Option<Server>> {
        let sql = format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::server_from_row).transpose()
    }

    #[instrument(skip(self, update), fields(server_id = %update.server_id))]
    async fn update_server_status(&self, update: StatusUpdate) -> StorageResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE servers SET state = ?, last_seen = ?, consecutive_failures = ?
            WHERE id = ? AND state != ?
            "#,
        )
        .bind(update.state.as_str())
        .bind(update.last_seen.as_ref().map(Self::timestamp_to_millis))
        .bind(i64::from(update.consecutive_failures))
        .bind(&update.server_id)
        .bind(AvailabilityState::Maintenance.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        // nothing matched: either unknown or in maintenance
        let exists = sqlx::query("SELECT 1 FROM servers WHERE id = ?")
            .bind(&update.server_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if !exists {
            return Err(StorageError::UnknownServer(update.server_id));
        }
        Ok(false)
    }

    #[instrument(skip(self))]
    async fn set_server_state(
        &self,
        server_id: &str,
        state: AvailabilityState,
    ) -> StorageResult<()> {
        let result = sqlx::query("UPDATE servers SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(server_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::UnknownServer(server_id.to_string()));
        }
        Ok(())
    }

    async fn record_probe(&self, outcome: &ProbeOutcome) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO probe_results
                (server_id, classification, latency_us, error, payload, observed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&outcome.server_id)
        .bind(outcome.classification.as_str())
        .bind(i64::try_from(outcome.latency.as_micros()).unwrap_or(i64::MAX))
        .bind(&outcome.error)
        .bind(&outcome.payload)
        .bind(Self::timestamp_to_millis(&outcome.observed_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_probes(
        &self,
        server_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<ProbeOutcome>> {
        let rows = sqlx::query(
            r#"
            SELECT server_id, classification, latency_us, error, payload, observed_at
            FROM probe_results
            WHERE server_id = ?
            ORDER BY observed_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(server_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::probe_from_row).collect()
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_probes_before(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM probe_results WHERE observed_at < ?")
            .bind(Self::timestamp_to_millis(&before))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {} old probe results", deleted);
        Ok(deleted)
    }

    async fn upsert_rule(&self, rule: AlertRule) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_rules (id, name, metric, condition, threshold, severity, enabled)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                metric = excluded.metric,
                condition = excluded.condition,
                threshold = excluded.threshold,
                severity = excluded.severity,
                enabled = excluded.enabled
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.metric.as_str())
        .bind(rule.condition.as_str())
        .bind(rule.threshold)
        .bind(rule.severity.as_str())
        .bind(rule.enabled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_rule(&self, rule_id: RuleId) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM alert_rules WHERE id = ?")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn enabled_rules(&self) -> StorageResult<Vec<AlertRule>> {
        let rows = sqlx::query(
            "SELECT id, name, metric, condition, threshold, severity, enabled \
             FROM alert_rules WHERE enabled = 1 ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        // a single malformed rule must not take down evaluation of the others
        let rules = rows
            .iter()
            .filter_map(|row| match Self::rule_from_row(row) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("skipping malformed alert rule: {e}");
                    None
                }
            })
            .collect();

        Ok(rules)
    }

    async fn open_alert(&self, server_id: &str, rule_id: RuleId) -> StorageResult<Option<Alert>> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE server_id = ? AND rule_id = ? AND status != 'resolved'"
        );
        let row = sqlx::query(&sql)
            .bind(server_id)
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::alert_from_row).transpose()
    }

    #[instrument(skip(self, alert), fields(server_id = %alert.server_id, rule_id = alert.rule_id))]
    async fn insert_alert(&self, alert: NewAlert) -> StorageResult<Alert> {
        let created_at = Self::timestamp_to_millis(&alert.created_at);

        let result = sqlx::query(
            r#"
            INSERT INTO alerts (server_id, rule_id, severity, status, description,
                                observed_value, created_at, last_observed_at, resolved_at)
            VALUES (?, ?, ?, 'active', ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(&alert.server_id)
        .bind(alert.rule_id)
        .bind(alert.severity.as_str())
        .bind(&alert.description)
        .bind(alert.observed_value)
        .bind(created_at)
        .bind(created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(alert.into_alert(done.last_insert_rowid())),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StorageError::Conflict {
                    server_id: alert.server_id,
                    rule_id: alert.rule_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn touch_alert(
        &self,
        alert_id: AlertId,
        value: f64,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let result =
            sqlx::query("UPDATE alerts SET observed_value = ?, last_observed_at = ? WHERE id = ?")
                .bind(value)
                .bind(Self::timestamp_to_millis(&at))
                .bind(alert_id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::UnknownAlert(alert_id));
        }
        Ok(())
    }

    async fn resolve_alert(&self, alert_id: AlertId, at: DateTime<Utc>) -> StorageResult<Alert> {
        sqlx::query(
            "UPDATE alerts SET status = 'resolved', resolved_at = ? \
             WHERE id = ? AND status != 'resolved'",
        )
        .bind(Self::timestamp_to_millis(&at))
        .bind(alert_id)
        .execute(&self.pool)
        .await?;

        self.fetch_alert(alert_id).await
    }

    async fn acknowledge_alert(&self, alert_id: AlertId) -> StorageResult<Alert> {
        sqlx::query("UPDATE alerts SET status = 'acknowledged' WHERE id = ? AND status = 'active'")
            .bind(alert_id)
            .execute(&self.pool)
            .await?;

        self.fetch_alert(alert_id).await
    }

    async fn alerts_for_server(&self, server_id: &str) -> StorageResult<Vec<Alert>> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE server_id = ? ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .bind(server_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::alert_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                message: "SQLite store operational".to_string(),
                metadata: HashMap::from([
                    ("backend".to_string(), "sqlite".to_string()),
                    ("db_path".to_string(), self.db_path.clone()),
                ]),
            }),
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite store");
        self.pool.close().await;
        Ok(())
    }
}

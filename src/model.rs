//! Domain types shared by the monitoring control loop
//!
//! Servers and their availability state, probe outcomes, alert rules, metric
//! samples and alerts. Everything here is plain data; behaviour lives in
//! [`crate::monitors`] and [`crate::alerts`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque server identifier (owned by the external server registry)
pub type ServerId = String;

/// Identifier of an alert rule
pub type RuleId = i64;

/// Identifier of a persisted alert (assigned by the record store)
pub type AlertId = i64;

/// Error returned when parsing one of the fixed enumerations from text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Generates `as_str`, `Display` and `FromStr` for a fieldless enum.
///
/// Parsing is case-insensitive so that both database values (`online`) and
/// API values (`ONLINE`) are accepted.
macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case($text) {
                        return Ok($ty::$variant);
                    }
                )+
                Err(ParseEnumError::new($kind, s))
            }
        }
    };
}

// ============================================================================
// Servers
// ============================================================================

/// Availability state of a server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilityState {
    Online,
    Offline,
    /// No probe history yet
    #[default]
    Unknown,
    /// Set by an operator; excluded from probing
    Maintenance,
}

text_enum!(AvailabilityState, "availability state", {
    Online => "online",
    Offline => "offline",
    Unknown => "unknown",
    Maintenance => "maintenance",
});

/// A server entry as handed out by the server directory
///
/// This is the minimal information a probe needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorTarget {
    pub id: ServerId,
    pub address: String,
    pub port: u16,
}

impl MonitorTarget {
    pub fn new(id: impl Into<ServerId>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
        }
    }

    /// `address:port`, with IPv6 literals bracketed
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Monitoring view of a server record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub address: String,
    pub port: u16,

    /// Human readable name for logs
    pub display_name: Option<String>,

    pub state: AvailabilityState,

    /// Time of the last HEALTHY probe
    pub last_seen: Option<DateTime<Utc>>,

    /// Failed probes since the last HEALTHY one
    pub consecutive_failures: u32,
}

impl Server {
    /// A freshly registered server without probe history
    pub fn new(id: impl Into<ServerId>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            display_name: None,
            state: AvailabilityState::Unknown,
            last_seen: None,
            consecutive_failures: 0,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn target(&self) -> MonitorTarget {
        MonitorTarget::new(self.id.clone(), self.address.clone(), self.port)
    }

    pub fn is_monitorable(&self) -> bool {
        self.state != AvailabilityState::Maintenance
    }

    pub fn display(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.target().endpoint())
    }
}

// ============================================================================
// Probes
// ============================================================================

/// Classification of a single probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeClassification {
    /// Completed with a success status
    Healthy,
    /// Completed with a non-success status
    Unhealthy,
    /// No response within the time budget
    Timeout,
    /// Any other transport fault
    Error,
}

text_enum!(ProbeClassification, "probe classification", {
    Healthy => "healthy",
    Unhealthy => "unhealthy",
    Timeout => "timeout",
    Error => "error",
});

impl ProbeClassification {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeClassification::Healthy)
    }
}

/// Result of one probe execution. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub server_id: ServerId,
    pub classification: ProbeClassification,
    pub latency: Duration,
    pub error: Option<String>,
    pub payload: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl ProbeOutcome {
    pub fn healthy(
        server_id: impl Into<ServerId>,
        latency: Duration,
        payload: Option<String>,
    ) -> Self {
        Self::build(server_id, ProbeClassification::Healthy, latency, None, payload)
    }

    pub fn unhealthy(
        server_id: impl Into<ServerId>,
        latency: Duration,
        error: impl Into<String>,
        payload: Option<String>,
    ) -> Self {
        Self::build(
            server_id,
            ProbeClassification::Unhealthy,
            latency,
            Some(error.into()),
            payload,
        )
    }

    pub fn timeout(server_id: impl Into<ServerId>, budget: Duration) -> Self {
        Self::build(
            server_id,
            ProbeClassification::Timeout,
            budget,
            Some("connection timeout".to_string()),
            None,
        )
    }

    pub fn error(
        server_id: impl Into<ServerId>,
        latency: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self::build(
            server_id,
            ProbeClassification::Error,
            latency,
            Some(error.into()),
            None,
        )
    }

    fn build(
        server_id: impl Into<ServerId>,
        classification: ProbeClassification,
        latency: Duration,
        error: Option<String>,
        payload: Option<String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            classification,
            latency,
            error,
            payload,
            observed_at: Utc::now(),
        }
    }

    /// Override the observation time (useful for replaying history)
    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }
}

// ============================================================================
// Metrics and rules
// ============================================================================

/// The fixed set of metric kinds alert rules can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    CpuUsage,
    MemoryUsage,
    DiskUsage,
    NetworkIn,
    NetworkOut,
    LoadAverage,
    Uptime,
}

text_enum!(MetricKind, "metric kind", {
    CpuUsage => "CPU_USAGE",
    MemoryUsage => "MEMORY_USAGE",
    DiskUsage => "DISK_USAGE",
    NetworkIn => "NETWORK_IN",
    NetworkOut => "NETWORK_OUT",
    LoadAverage => "LOAD_AVERAGE",
    Uptime => "UPTIME",
});

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        MetricKind::CpuUsage,
        MetricKind::MemoryUsage,
        MetricKind::DiskUsage,
        MetricKind::NetworkIn,
        MetricKind::NetworkOut,
        MetricKind::LoadAverage,
        MetricKind::Uptime,
    ];
}

/// Comparison applied as `sample.value <op> rule.threshold`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThan,
    LessThan,
    Equals,
}

text_enum!(Comparison, "comparison operator", {
    GreaterThan => "greater_than",
    LessThan => "less_than",
    Equals => "equals",
});

impl Comparison {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::GreaterThan => ">",
            Comparison::LessThan => "<",
            Comparison::Equals => "==",
        }
    }
}

/// Alert severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

text_enum!(Severity, "severity", {
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
    Critical => "CRITICAL",
});

/// A threshold rule evaluated against incoming metric samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: RuleId,
    pub name: String,
    #[serde(alias = "metricType", alias = "metric_type")]
    pub metric: MetricKind,
    pub condition: Comparison,
    pub threshold: f64,
    pub severity: Severity,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl AlertRule {
    pub fn new(
        id: RuleId,
        name: impl Into<String>,
        metric: MetricKind,
        condition: Comparison,
        threshold: f64,
        severity: Severity,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            metric,
            condition,
            threshold,
            severity,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether the rule takes part in evaluation at all
    pub fn is_evaluable(&self) -> bool {
        self.enabled && self.threshold.is_finite()
    }
}

/// One metric reading delivered by an ingestion path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub server_id: ServerId,
    #[serde(alias = "metricType", alias = "metric_type")]
    pub metric: MetricKind,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(server_id: impl Into<ServerId>, metric: MetricKind, value: f64) -> Self {
        Self {
            server_id: server_id.into(),
            metric,
            value,
            timestamp: Utc::now(),
        }
    }

    /// Parse a sample whose metric kind arrives as free text
    pub fn parse(
        server_id: impl Into<ServerId>,
        metric: &str,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, ParseEnumError> {
        Ok(Self {
            server_id: server_id.into(),
            metric: metric.parse()?,
            value,
            timestamp,
        })
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

text_enum!(AlertStatus, "alert status", {
    Active => "active",
    Acknowledged => "acknowledged",
    Resolved => "resolved",
});

impl AlertStatus {
    /// Active or acknowledged, i.e. not yet resolved
    pub fn is_open(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

/// A persisted alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub server_id: ServerId,
    pub rule_id: RuleId,
    pub severity: Severity,
    pub status: AlertStatus,
    pub description: String,

    /// Value of the most recent violating sample
    pub observed_value: f64,

    pub created_at: DateTime<Utc>,
    pub last_observed_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// An alert about to be inserted; the store assigns the id
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub server_id: ServerId,
    pub rule_id: RuleId,
    pub severity: Severity,
    pub description: String,
    pub observed_value: f64,
    pub created_at: DateTime<Utc>,
}

impl NewAlert {
    /// Build the alert raised by `rule` for `sample`
    pub fn from_violation(rule: &AlertRule, sample: &MetricSample, now: DateTime<Utc>) -> Self {
        Self {
            server_id: sample.server_id.clone(),
            rule_id: rule.id,
            severity: rule.severity,
            description: format!(
                "{}: {} is {} ({} {})",
                rule.name,
                rule.metric,
                sample.value,
                rule.condition.symbol(),
                rule.threshold
            ),
            observed_value: sample.value,
            created_at: now,
        }
    }

    pub fn into_alert(self, id: AlertId) -> Alert {
        Alert {
            id,
            server_id: self.server_id,
            rule_id: self.rule_id,
            severity: self.severity,
            status: AlertStatus::Active,
            description: self.description,
            observed_value: self.observed_value,
            created_at: self.created_at,
            last_observed_at: self.created_at,
            resolved_at: None,
        }
    }
}

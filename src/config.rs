//! Configuration file handling
//!
//! The configuration is a JSON document. Raw structs mirror the file and keep
//! everything optional; [`Config::resolve`] fills in defaults and validates,
//! producing a [`ResolvedConfig`] the rest of the crate works with.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail, ensure};
use regex::Regex;
use tracing::{trace, warn};

use crate::model::{AlertRule, MetricKind, MonitorTarget, Server};
use crate::monitors::evaluator::MetricEvaluator;
use crate::monitors::probe::ProbeKind;

/// Default port of the metrics agent
pub const DEFAULT_AGENT_PORT: u16 = 51243;

const DEFAULT_PROBE_INTERVAL_SECS: u64 = 300;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_AGENT_INTERVAL_SECS: u64 = 15;

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Probe history older than this is deleted
        #[serde(default)]
        retention_days: Option<u32>,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: Some(30),
        }
    }
}

impl StorageConfig {
    pub fn retention(&self) -> Option<chrono::Duration> {
        match self {
            StorageConfig::None => None,
            StorageConfig::Sqlite { retention_days, .. } => {
                retention_days.map(|days| chrono::Duration::days(i64::from(days)))
            }
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./guardia.db")
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Kept as raw JSON so one malformed rule cannot fail the whole file
    #[serde(default)]
    pub rules: Vec<serde_json::Value>,

    /// Storage configuration (optional - defaults to SQLite)
    pub storage: Option<StorageConfig>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct MonitoringConfig {
    /// Seconds between monitoring cycles
    pub interval: Option<u64>,
    /// Seconds a single probe may take
    pub timeout: Option<u64>,
    pub probe: Option<ProbeConfig>,
    /// Consecutive failed probes before a server goes offline
    pub failure_threshold: Option<u32>,
    /// Tolerance for `equals` rules; exact comparison when absent
    pub equals_epsilon: Option<f64>,
    /// Metric kinds the evaluator considers; all when absent
    pub enabled_metrics: Option<Vec<MetricKind>>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeConfig {
    Http {
        #[serde(default = "default_scheme")]
        scheme: String,
        #[serde(default = "default_health_path")]
        path: String,
        body_pattern: Option<String>,
    },
    Tcp,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub display: Option<String>,
    pub agent: Option<AgentConfig>,
}

/// Metrics agent running on a server
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_port")]
    pub port: u16,
    pub interval: Option<u64>,
    pub token: Option<String>,
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

// ============================================================================
// Resolved configuration
// ============================================================================

/// Validated monitoring settings with defaults applied
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub probe: ProbeKind,
    pub failure_threshold: u32,
    pub equals_epsilon: Option<f64>,
    pub enabled_metrics: Option<Vec<MetricKind>>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS),
            probe: ProbeKind::default(),
            failure_threshold: 1,
            equals_epsilon: None,
            enabled_metrics: None,
        }
    }
}

impl MonitorSettings {
    /// Metric evaluator configured from these settings
    pub fn evaluator(&self) -> MetricEvaluator {
        let mut evaluator = MetricEvaluator::new();
        if let Some(epsilon) = self.equals_epsilon {
            evaluator = evaluator.with_equals_epsilon(epsilon);
        }
        if let Some(kinds) = &self.enabled_metrics {
            evaluator = evaluator.with_enabled_metrics(kinds.iter().copied());
        }
        evaluator
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAgentConfig {
    pub url: String,
    pub interval: Duration,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub server: Server,
    pub agent: Option<ResolvedAgentConfig>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub monitoring: MonitorSettings,
    pub servers: Vec<ResolvedServerConfig>,
    pub rules: Vec<AlertRule>,
    pub storage: StorageConfig,
}

impl MonitoringConfig {
    pub fn resolve(self) -> anyhow::Result<MonitorSettings> {
        let defaults = MonitorSettings::default();

        let interval = self.interval.map_or(defaults.interval, Duration::from_secs);
        ensure!(!interval.is_zero(), "monitoring.interval must be greater than 0");

        let timeout = self.timeout.map_or(defaults.timeout, Duration::from_secs);
        ensure!(!timeout.is_zero(), "monitoring.timeout must be greater than 0");

        let failure_threshold = self.failure_threshold.unwrap_or(defaults.failure_threshold);
        ensure!(failure_threshold >= 1, "monitoring.failure_threshold must be at least 1");

        if let Some(epsilon) = self.equals_epsilon {
            ensure!(
                epsilon.is_finite() && epsilon >= 0.0,
                "monitoring.equals_epsilon must be a finite, non-negative number"
            );
        }

        let probe = match self.probe {
            None => defaults.probe,
            Some(ProbeConfig::Tcp) => ProbeKind::Tcp,
            Some(ProbeConfig::Http {
                scheme,
                path,
                body_pattern,
            }) => {
                if scheme != "http" && scheme != "https" {
                    bail!("unsupported probe scheme '{scheme}'");
                }
                let body_pattern = body_pattern
                    .map(|pattern| {
                        Regex::new(&pattern)
                            .with_context(|| format!("invalid probe body pattern '{pattern}'"))
                    })
                    .transpose()?;
                ProbeKind::Http {
                    scheme,
                    path,
                    body_pattern,
                }
            }
        };

        Ok(MonitorSettings {
            interval,
            timeout,
            probe,
            failure_threshold,
            equals_epsilon: self.equals_epsilon,
            enabled_metrics: self.enabled_metrics,
        })
    }
}

impl ServerConfig {
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        ensure!(!self.id.trim().is_empty(), "server id must not be empty");
        ensure!(
            !self.address.trim().is_empty(),
            "server '{}' has an empty address",
            self.id
        );

        let agent = self
            .agent
            .map(|agent| -> anyhow::Result<ResolvedAgentConfig> {
                let interval =
                    Duration::from_secs(agent.interval.unwrap_or(DEFAULT_AGENT_INTERVAL_SECS));
                ensure!(
                    !interval.is_zero(),
                    "agent interval of server '{}' must be greater than 0",
                    self.id
                );
                let endpoint =
                    MonitorTarget::new(self.id.clone(), self.address.clone(), agent.port)
                        .endpoint();
                Ok(ResolvedAgentConfig {
                    url: format!("http://{endpoint}/metrics"),
                    interval,
                    token: agent.token,
                })
            })
            .transpose()?;

        let mut server = Server::new(self.id, self.address, self.port);
        server.display_name = self.display;

        Ok(ResolvedServerConfig { server, agent })
    }
}

impl Config {
    /// Apply defaults and validate
    ///
    /// Structural problems (zero intervals, duplicate ids, bad patterns) are
    /// errors. Rules that cannot be evaluated are dropped with a warning.
    pub fn resolve(self) -> anyhow::Result<ResolvedConfig> {
        let monitoring = self.monitoring.resolve()?;

        let mut seen = HashSet::new();
        let servers = self
            .servers
            .into_iter()
            .map(|server| {
                ensure!(seen.insert(server.id.clone()), "duplicate server id '{}'", server.id);
                server.resolve()
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut rule_ids = HashSet::new();
        let mut rules = Vec::with_capacity(self.rules.len());
        for raw in self.rules {
            let id = raw.get("id").cloned().unwrap_or(serde_json::Value::Null);
            let rule = match serde_json::from_value::<AlertRule>(raw) {
                Ok(rule) => rule,
                Err(e) => {
                    warn!("skipping malformed rule {id}: {e}");
                    continue;
                }
            };
            ensure!(rule_ids.insert(rule.id), "duplicate rule id {}", rule.id);
            if !rule.threshold.is_finite() {
                warn!("skipping rule {} ({}): threshold is not finite", rule.id, rule.name);
                continue;
            }
            rules.push(rule);
        }

        Ok(ResolvedConfig {
            monitoring,
            servers,
            rules,
            storage: self.storage.unwrap_or_default(),
        })
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    serde_json::from_str(&file_content)
        .with_context(|| format!("invalid configuration file {}", path.display()))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

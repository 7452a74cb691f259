//! Probe Executor - one health probe against one server endpoint
//!
//! A probe never fails: every network fault is turned into a classified
//! [`ProbeOutcome`]. Classification follows a fixed priority:
//!
//! 1. response with a success status → `HEALTHY`
//! 2. response with any other status → `UNHEALTHY`
//! 3. no response within the time budget → `TIMEOUT`
//! 4. any other transport fault → `ERROR`
//!
//! Probes do no storage I/O.

use std::error::Error as StdError;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::net::TcpStream;
use tracing::{instrument, trace};

use crate::model::{MonitorTarget, ProbeOutcome};

/// Default time budget of a single probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Response bodies are captured up to this many bytes
pub const MAX_PAYLOAD_BYTES: usize = 4096;

/// Executes a single probe against a target
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &MonitorTarget, timeout: Duration) -> ProbeOutcome;
}

/// How a server endpoint is probed
#[derive(Debug, Clone)]
pub enum ProbeKind {
    /// `GET {scheme}://{address}:{port}{path}`
    Http {
        scheme: String,
        path: String,
        /// If set, a success response must also match this pattern
        body_pattern: Option<Regex>,
    },
    /// Plain TCP connect
    Tcp,
}

impl Default for ProbeKind {
    fn default() -> Self {
        ProbeKind::Http {
            scheme: "http".to_string(),
            path: "/health".to_string(),
            body_pattern: None,
        }
    }
}

/// Network prober supporting HTTP and TCP probes
///
/// The HTTP client is reused across probes. The time budget is enforced
/// around the whole exchange (connect, request and body read), so a slow
/// body counts as a timeout just like a slow connect.
#[derive(Debug, Clone)]
pub struct EndpointProber {
    client: reqwest::Client,
    kind: ProbeKind,
}

impl EndpointProber {
    pub fn new(kind: ProbeKind) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("guardia/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(client, kind))
    }

    pub fn with_client(client: reqwest::Client, kind: ProbeKind) -> Self {
        Self { client, kind }
    }

    pub fn kind(&self) -> &ProbeKind {
        &self.kind
    }

    async fn probe_http(
        &self,
        target: &MonitorTarget,
        timeout: Duration,
        scheme: &str,
        path: &str,
        body_pattern: Option<&Regex>,
    ) -> ProbeOutcome {
        let url = format!("{scheme}://{}{}", target.endpoint(), normalize_path(path));
        trace!("probing {url}");

        let start = Instant::now();
        let exchange = async {
            let response = self.client.get(&url).send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Err(_) => ProbeOutcome::timeout(target.id.clone(), timeout),
            Ok(Err(e)) if e.is_timeout() => ProbeOutcome::timeout(target.id.clone(), timeout),
            Ok(Err(e)) => ProbeOutcome::error(target.id.clone(), start.elapsed(), describe(&e)),
            Ok(Ok((status, body))) => {
                let latency = start.elapsed();
                let matched = body_pattern.is_none_or(|re| re.is_match(&body));
                let payload = capture_payload(body);

                if !status.is_success() {
                    ProbeOutcome::unhealthy(
                        target.id.clone(),
                        latency,
                        format!("unexpected status {status}"),
                        payload,
                    )
                } else if !matched {
                    ProbeOutcome::unhealthy(
                        target.id.clone(),
                        latency,
                        "response body did not match pattern",
                        payload,
                    )
                } else {
                    ProbeOutcome::healthy(target.id.clone(), latency, payload)
                }
            }
        }
    }

    async fn probe_tcp(&self, target: &MonitorTarget, timeout: Duration) -> ProbeOutcome {
        let endpoint = target.endpoint();
        trace!("connecting to {endpoint}");

        let start = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect(&endpoint)).await {
            Err(_) => ProbeOutcome::timeout(target.id.clone(), timeout),
            Ok(Err(e)) => ProbeOutcome::error(target.id.clone(), start.elapsed(), describe(&e)),
            Ok(Ok(_stream)) => ProbeOutcome::healthy(target.id.clone(), start.elapsed(), None),
        }
    }
}

#[async_trait]
impl Prober for EndpointProber {
    #[instrument(skip(self, target), fields(server = %target.id))]
    async fn probe(&self, target: &MonitorTarget, timeout: Duration) -> ProbeOutcome {
        let outcome = match &self.kind {
            ProbeKind::Http {
                scheme,
                path,
                body_pattern,
            } => {
                self.probe_http(target, timeout, scheme, path, body_pattern.as_ref())
                    .await
            }
            ProbeKind::Tcp => self.probe_tcp(target, timeout).await,
        };

        trace!(
            "probe finished: {} in {:?}",
            outcome.classification,
            outcome.latency
        );
        outcome
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Error message including its source chain
///
/// reqwest's top level message only says "error sending request"; the useful
/// part ("connection refused") sits in the sources.
fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn capture_payload(mut body: String) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if body.len() > MAX_PAYLOAD_BYTES {
        let mut cut = MAX_PAYLOAD_BYTES;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Some(body)
}

//! Guardia monitoring and alerting control loop
//!
//! - [`actors::scheduler`] probes every server on a fixed interval and feeds
//!   outcomes into the [`monitors::status`] engine
//! - metric samples from any ingestion path go through the
//!   [`monitors::evaluator`] and the [`alerts`] lifecycle manager
//! - everything persistent lives behind the [`storage`] traits

pub mod actors;
pub mod alerts;
pub mod config;
pub mod metrics;
pub mod model;
pub mod monitors;
pub mod storage;

pub use metrics::ServerMetrics;

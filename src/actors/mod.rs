//! Actor-based control loop
//!
//! Each actor runs as an independent async task communicating via Tokio channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!   ┌───────────────┐   probes    ┌──────────────┐
//!   │ SchedulerActor│────────────▶│ ProbeEvent   │ (broadcast)
//!   │  (interval)   │  + status   └──────────────┘
//!   └───────────────┘
//!
//!   ┌───────────────┐  samples    ┌──────────────┐            ┌──────────────┐
//!   │ Collector-N   │────────────▶│ MetricEvent  │──────────▶ │ AlertActor   │
//!   │ (per server)  │             │ (broadcast)  │            │ per-server   │
//!   └───────────────┘             └──────────────┘            │ workers      │
//!                                                             └──────┬───────┘
//!                                                                    ▼
//!                                                             ┌──────────────┐
//!                                                             │ AlertEvent   │ (broadcast)
//!                                                             └──────────────┘
//! ```
//!
//! ## Actor Types
//!
//! - **SchedulerActor**: Runs monitoring cycles at a fixed interval
//! - **MetricCollectorActor**: Polls agent endpoints for metrics
//! - **AlertActor**: Evaluates samples against alert rules
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Events**: Actors publish events to broadcast channels for fan-out
//! 3. **Request/Response**: oneshot channels for synchronous queries

pub mod alert;
pub mod collector;
pub mod messages;
pub mod scheduler;

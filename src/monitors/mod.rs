//! Probe execution, status transitions and metric evaluation

pub mod evaluator;
pub mod probe;
pub mod status;

pub use evaluator::{MetricEvaluator, Verdict};
pub use probe::{EndpointProber, ProbeKind, Prober};
pub use status::{StatusTransitionEngine, Transition, next_status};

//! Metric Evaluator
//!
//! Decides which alert rules a metric sample violates. Pure: no I/O and no
//! state beyond its configuration.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::model::{AlertRule, Comparison, MetricKind, MetricSample};

/// Outcome of checking one applicable rule against a sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict<'r> {
    pub rule: &'r AlertRule,
    pub violated: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MetricEvaluator {
    equals_epsilon: Option<f64>,
    enabled_metrics: Option<HashSet<MetricKind>>,
}

impl MetricEvaluator {
    /// Evaluator with exact `equals` and all metric kinds enabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `equals` as `|value - threshold| <= epsilon`
    pub fn with_equals_epsilon(mut self, epsilon: f64) -> Self {
        self.equals_epsilon = Some(epsilon.abs());
        self
    }

    /// Only evaluate samples of these kinds
    pub fn with_enabled_metrics(mut self, kinds: impl IntoIterator<Item = MetricKind>) -> Self {
        self.enabled_metrics = Some(kinds.into_iter().collect());
        self
    }

    /// Whether a sample takes part in evaluation at all
    pub fn accepts(&self, sample: &MetricSample) -> bool {
        if !sample.value.is_finite() {
            warn!(
                "skipping {} sample for {} with non-finite value {}",
                sample.metric, sample.server_id, sample.value
            );
            return false;
        }

        let enabled = self
            .enabled_metrics
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&sample.metric));
        if !enabled {
            debug!(
                "skipping {} sample for {}: metric kind not enabled",
                sample.metric, sample.server_id
            );
        }
        enabled
    }

    /// `value <condition> threshold`
    pub fn is_violated(&self, rule: &AlertRule, value: f64) -> bool {
        match rule.condition {
            Comparison::GreaterThan => value > rule.threshold,
            Comparison::LessThan => value < rule.threshold,
            Comparison::Equals => match self.equals_epsilon {
                Some(epsilon) => (value - rule.threshold).abs() <= epsilon,
                None => value == rule.threshold,
            },
        }
    }

    /// Verdicts for every enabled rule of the sample's metric kind
    pub fn judge<'r>(&self, sample: &MetricSample, rules: &'r [AlertRule]) -> Vec<Verdict<'r>> {
        if !self.accepts(sample) {
            return Vec::new();
        }

        rules
            .iter()
            .filter(|rule| rule.metric == sample.metric)
            .filter(|rule| {
                let evaluable = rule.is_evaluable();
                if rule.enabled && !evaluable {
                    warn!("skipping rule {} ({}) with invalid threshold", rule.id, rule.name);
                }
                evaluable
            })
            .map(|rule| Verdict {
                rule,
                violated: self.is_violated(rule, sample.value),
            })
            .collect()
    }

    /// The rules violated by `sample`
    pub fn evaluate<'r>(
        &self,
        sample: &MetricSample,
        rules: &'r [AlertRule],
    ) -> Vec<&'r AlertRule> {
        self.judge(sample, rules)
            .into_iter()
            .filter(|verdict| verdict.violated)
            .map(|verdict| verdict.rule)
            .collect()
    }
}

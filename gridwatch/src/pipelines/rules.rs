// gridwatch/src/pipelines/rules.rs
//
// Ordered predicate rules over the metric stream. Threshold and range
// rules are plain data evaluated by dispatch; custom rules carry a
// caller-supplied predicate. A predicate that panics counts as not
// matching, so one bad rule cannot drop the reading for the rest of the
// set. Alerts come out in rule insertion order, at most one per rule.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use thiserror::Error;

use crate::events::{MetricPoint, Severity};
use crate::pipelines::{AlertLimit, PipelineAlert};

pub type Predicate = Box<dyn Fn(&MetricPoint) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl RuleOp {
    /// Operator validation happens here, at rule construction; evaluation
    /// never sees an unknown operator.
    pub fn parse(op: &str) -> Result<Self, RuleError> {
        match op {
            ">" => Ok(RuleOp::Gt),
            ">=" => Ok(RuleOp::Ge),
            "<" => Ok(RuleOp::Lt),
            "<=" => Ok(RuleOp::Le),
            "==" => Ok(RuleOp::Eq),
            other => Err(RuleError::UnknownOperator(other.to_string())),
        }
    }

    fn apply(self, value: f64, threshold: f64) -> bool {
        match self {
            RuleOp::Gt => value > threshold,
            RuleOp::Ge => value >= threshold,
            RuleOp::Lt => value < threshold,
            RuleOp::Le => value <= threshold,
            RuleOp::Eq => value == threshold,
        }
    }
}

impl fmt::Display for RuleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleOp::Gt => ">",
            RuleOp::Ge => ">=",
            RuleOp::Lt => "<",
            RuleOp::Le => "<=",
            RuleOp::Eq => "==",
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
}

enum Condition {
    Threshold {
        metric_type: String,
        op:          RuleOp,
        threshold:   f64,
    },
    Range {
        metric_type: String,
        min:         f64,
        max:         f64,
    },
    Custom(Predicate),
}

pub struct Rule {
    pub name:     String,
    pub message:  String,
    pub severity: Severity,
    pub enabled:  bool,
    condition:    Condition,
}

impl Rule {
    /// A rule with a caller-supplied predicate.
    pub fn custom(
        name: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        predicate: Predicate,
    ) -> Self {
        Self {
            name:      name.into(),
            message:   message.into(),
            severity,
            enabled:   true,
            condition: Condition::Custom(predicate),
        }
    }

    fn matches(&self, point: &MetricPoint) -> bool {
        match &self.condition {
            Condition::Threshold { metric_type, op, threshold } => {
                point.metric_type == *metric_type && op.apply(point.value, *threshold)
            }
            Condition::Range { metric_type, min, max } => {
                point.metric_type == *metric_type && (point.value < *min || point.value > *max)
            }
            Condition::Custom(predicate) => {
                catch_unwind(AssertUnwindSafe(|| predicate(point))).unwrap_or(false)
            }
        }
    }

    fn limit(&self) -> Option<AlertLimit> {
        match &self.condition {
            Condition::Threshold { threshold, .. } => Some(AlertLimit::Threshold(*threshold)),
            Condition::Range { min, max, .. } => Some(AlertLimit::Bounds(*min, *max)),
            Condition::Custom(_) => None,
        }
    }

    pub fn evaluate(&self, point: &MetricPoint) -> Option<PipelineAlert> {
        if !self.enabled || !self.matches(point) {
            return None;
        }
        Some(PipelineAlert {
            rule:     self.name.clone(),
            message:  self.message.clone(),
            severity: self.severity,
            source:   point.device_id.clone(),
            value:    Some(point.value),
            limit:    self.limit(),
        })
    }
}

/// What one evaluation pass saw and produced.
#[derive(Debug)]
pub struct RuleOutcome {
    pub rules_evaluated: usize,
    pub triggered:       Vec<String>,
    pub alerts:          Vec<PipelineAlert>,
}

#[derive(Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Fires when `metric_type` readings compare true against the
    /// threshold. `op` is one of `>`, `>=`, `<`, `<=`, `==`.
    pub fn add_threshold_rule(
        &mut self,
        name: impl Into<String>,
        metric_type: impl Into<String>,
        threshold: f64,
        op: &str,
        severity: Severity,
        message: Option<String>,
    ) -> Result<(), RuleError> {
        let op = RuleOp::parse(op)?;
        let metric_type = metric_type.into();
        let message = message.unwrap_or_else(|| format!("{metric_type} {op} {threshold}"));
        self.rules.push(Rule {
            name: name.into(),
            message,
            severity,
            enabled: true,
            condition: Condition::Threshold { metric_type, op, threshold },
        });
        Ok(())
    }

    /// Fires when `metric_type` readings fall outside [min, max].
    pub fn add_range_rule(
        &mut self,
        name: impl Into<String>,
        metric_type: impl Into<String>,
        min: f64,
        max: f64,
        severity: Severity,
        message: Option<String>,
    ) {
        let metric_type = metric_type.into();
        let message =
            message.unwrap_or_else(|| format!("{metric_type} outside range [{min}, {max}]"));
        self.rules.push(Rule {
            name: name.into(),
            message,
            severity,
            enabled: true,
            condition: Condition::Range { metric_type, min, max },
        });
    }

    pub fn enable(&mut self, name: &str) {
        if let Some(rule) = self.rules.iter_mut().find(|r| r.name == name) {
            rule.enabled = true;
        }
    }

    pub fn disable(&mut self, name: &str) {
        if let Some(rule) = self.rules.iter_mut().find(|r| r.name == name) {
            rule.enabled = false;
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.rules.retain(|r| r.name != name);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, point: &MetricPoint) -> RuleOutcome {
        let mut alerts = Vec::new();
        let mut triggered = Vec::new();
        for rule in &self.rules {
            if let Some(alert) = rule.evaluate(point) {
                triggered.push(rule.name.clone());
                alerts.push(alert);
            }
        }
        RuleOutcome {
            rules_evaluated: self.rules.len(),
            triggered,
            alerts,
        }
    }
}

use crate::alert::Alert;
use crate::error::{RemedyError, Result};
use crate::metrics::MetricHistory;
use crate::pattern::PatternReport;
use crate::types::Priority;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// EvalContext
// ---------------------------------------------------------------------------

/// Everything a condition may look at besides the alert itself.
pub struct EvalContext<'a> {
    pub metrics: &'a MetricHistory,
    pub patterns: &'a PatternReport,
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "==")]
    Eq,
}

impl Comparison {
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Gt => lhs > rhs,
            Comparison::Lt => lhs < rhs,
            Comparison::Gte => lhs >= rhs,
            Comparison::Lte => lhs <= rhs,
            Comparison::Eq => (lhs - rhs).abs() < f64::EPSILON,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Lt => "<",
            Comparison::Gte => ">=",
            Comparison::Lte => "<=",
            Comparison::Eq => "==",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternScope {
    Frequent,
    Sequence,
    Correlation,
}

fn default_trend_window() -> usize {
    10
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Alert type equals `value`.
    Type { value: String },
    /// Alert priority equals `value`.
    Priority { value: Priority },
    /// Number at `metric` (a dotted path into the alert data) compared with `value`.
    Threshold {
        metric: String,
        operator: Comparison,
        value: f64,
    },
    /// Sign of the regression slope over the last `window` samples of `metric`.
    Trend {
        metric: String,
        direction: TrendDirection,
        #[serde(default)]
        min_slope: f64,
        #[serde(default = "default_trend_window")]
        window: usize,
    },
    /// A detected pattern, sequence or correlation with this key exists.
    Pattern {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<PatternScope>,
    },
    Composite {
        operator: LogicalOp,
        conditions: Vec<Condition>,
    },
}

impl Condition {
    pub fn evaluate(&self, alert: &Alert, ctx: &EvalContext) -> bool {
        match self {
            Condition::Type { value } => alert.alert_type == *value,
            Condition::Priority { value } => alert.priority == *value,
            Condition::Threshold {
                metric,
                operator,
                value,
            } => alert
                .metric(metric)
                .map(|v| operator.apply(v, *value))
                .unwrap_or(false),
            Condition::Trend {
                metric,
                direction,
                min_slope,
                window,
            } => match ctx.metrics.slope(metric, *window) {
                Some(slope) => {
                    let tolerance = min_slope.abs();
                    match direction {
                        TrendDirection::Increasing => slope > tolerance,
                        TrendDirection::Decreasing => slope < -tolerance,
                        TrendDirection::Stable => slope.abs() <= tolerance,
                    }
                }
                None => false,
            },
            Condition::Pattern { key, scope } => ctx.patterns.contains(key, *scope),
            Condition::Composite {
                operator,
                conditions,
            } => match operator {
                LogicalOp::And => conditions.iter().all(|c| c.evaluate(alert, ctx)),
                LogicalOp::Or => conditions.iter().any(|c| c.evaluate(alert, ctx)),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Condition::Type { value } if value.trim().is_empty() => Err(
                RemedyError::Validation("type condition has an empty value".into()),
            ),
            Condition::Threshold { metric, value, .. } => {
                if metric.trim().is_empty() {
                    return Err(RemedyError::Validation(
                        "threshold condition has an empty metric path".into(),
                    ));
                }
                if !value.is_finite() {
                    return Err(RemedyError::Validation(format!(
                        "threshold on '{metric}' must be a finite number"
                    )));
                }
                Ok(())
            }
            Condition::Trend { metric, window, .. } => {
                if metric.trim().is_empty() {
                    return Err(RemedyError::Validation(
                        "trend condition has an empty metric path".into(),
                    ));
                }
                if *window < 2 {
                    return Err(RemedyError::Validation(format!(
                        "trend on '{metric}' needs a window of at least 2 samples"
                    )));
                }
                Ok(())
            }
            Condition::Pattern { key, .. } if key.trim().is_empty() => Err(
                RemedyError::Validation("pattern condition has an empty key".into()),
            ),
            Condition::Composite { conditions, .. } => {
                if conditions.is_empty() {
                    return Err(RemedyError::Validation(
                        "composite condition has no nested conditions".into(),
                    ));
                }
                conditions.iter().try_for_each(Condition::validate)
            }
            _ => Ok(()),
        }
    }

    /// Metric paths this condition reads from history, including nested ones.
    pub fn trend_metrics(&self) -> Vec<&str> {
        match self {
            Condition::Trend { metric, .. } => vec![metric.as_str()],
            Condition::Composite { conditions, .. } => {
                conditions.iter().flat_map(|c| c.trend_metrics()).collect()
            }
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

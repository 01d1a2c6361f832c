use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Why a metric could not be computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum UndefinedReason {
    #[schemars(description = "The month before has no value to compare against")]
    NoPriorData,
    #[schemars(description = "The baseline value is zero")]
    ZeroBaseline,
    #[schemars(description = "Not enough history for the requested window or sample")]
    InsufficientHistory { required: usize, available: usize },
    #[schemars(description = "A ratio denominator (volatility, drawdown, downside deviation) is zero")]
    ZeroDenominator,
    #[schemars(description = "There is nothing to aggregate")]
    EmptyCohort,
}

impl fmt::Display for UndefinedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndefinedReason::NoPriorData => f.write_str("no prior data"),
            UndefinedReason::ZeroBaseline => f.write_str("zero baseline"),
            UndefinedReason::InsufficientHistory {
                required,
                available,
            } => write!(f, "not enough data ({} of {} months)", available, required),
            UndefinedReason::ZeroDenominator => f.write_str("zero denominator"),
            UndefinedReason::EmptyCohort => f.write_str("no data"),
        }
    }
}

/// A computed number, or an explicit marker saying why there is none.
/// Never collapses "undefined" into zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MetricValue {
    Defined(f64),
    Undefined(UndefinedReason),
}

impl MetricValue {
    pub fn value(&self) -> Option<f64> {
        match self {
            MetricValue::Defined(v) => Some(*v),
            MetricValue::Undefined(_) => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, MetricValue::Defined(_))
    }

    pub fn reason(&self) -> Option<UndefinedReason> {
        match self {
            MetricValue::Defined(_) => None,
            MetricValue::Undefined(r) => Some(*r),
        }
    }

    /// Wraps a raw number, treating NaN or infinity as a zero denominator.
    pub fn from_f64(value: f64) -> Self {
        if value.is_finite() {
            MetricValue::Defined(value)
        } else {
            MetricValue::Undefined(UndefinedReason::ZeroDenominator)
        }
    }

    pub fn map(self, f: impl FnOnce(f64) -> f64) -> Self {
        match self {
            MetricValue::Defined(v) => MetricValue::from_f64(f(v)),
            undefined => undefined,
        }
    }
}

impl From<MetricResult<f64>> for MetricValue {
    fn from(result: MetricResult<f64>) -> Self {
        match result {
            Ok(v) => MetricValue::from_f64(v),
            Err(reason) => MetricValue::Undefined(reason),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Defined(v) => write!(f, "{:.6}", v),
            MetricValue::Undefined(reason) => write!(f, "undefined ({})", reason),
        }
    }
}

/// Structured metrics carry their undefined case in the error slot.
pub type MetricResult<T> = std::result::Result<T, UndefinedReason>;

/// Metric name to value for one month.
pub type MetricRecord = BTreeMap<String, MetricValue>;

pub(crate) fn require_history(required: usize, available: usize) -> MetricResult<()> {
    if available < required {
        Err(UndefinedReason::InsufficientHistory {
            required,
            available,
        })
    } else {
        Ok(())
    }
}

pub(crate) fn ratio(numerator: f64, denominator: f64) -> MetricResult<f64> {
    if denominator == 0.0 || !denominator.is_finite() {
        Err(UndefinedReason::ZeroDenominator)
    } else {
        Ok(numerator / denominator)
    }
}

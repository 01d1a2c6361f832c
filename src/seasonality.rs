use crate::engine::MonthlyValues;
use crate::metrics::{require_history, MetricResult, MetricValue, UndefinedReason};
use crate::returns::monthly_returns;
use crate::utils::{mean, sample_std};
use serde::{Deserialize, Serialize};

const MONTH_LABELS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// Return statistics for one calendar month (1-12) or quarter (1-4) pooled across years.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalStats {
    pub period: u32,
    pub label: String,
    pub count: usize,
    pub mean_return: MetricValue,
    pub std_dev: MetricValue,
    /// Fraction of observations with a positive return.
    pub positive_probability: MetricValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalityReport {
    pub months_of_history: usize,
    pub by_month: Vec<SeasonalStats>,
    pub by_quarter: Vec<SeasonalStats>,
    /// Calendar month with the highest mean return.
    pub best_month: Option<u32>,
    pub worst_month: Option<u32>,
}

fn stats_for(period: u32, label: String, samples: &[f64]) -> SeasonalStats {
    let empty = MetricValue::Undefined(UndefinedReason::EmptyCohort);
    let positive_probability = if samples.is_empty() {
        empty
    } else {
        MetricValue::Defined(
            samples.iter().filter(|r| **r > 0.0).count() as f64 / samples.len() as f64,
        )
    };

    SeasonalStats {
        period,
        label,
        count: samples.len(),
        mean_return: mean(samples).map_or(empty, MetricValue::Defined),
        std_dev: sample_std(samples).map_or(
            MetricValue::Undefined(UndefinedReason::InsufficientHistory {
                required: 2,
                available: samples.len(),
            }),
            MetricValue::Defined,
        ),
        positive_probability,
    }
}

/// Pools monthly returns by calendar month and by quarter.
/// Needs at least `min_months` months of history.
pub fn analyze(values: &MonthlyValues, min_months: usize) -> MetricResult<SeasonalityReport> {
    require_history(min_months, values.len())?;

    let mut month_buckets: Vec<Vec<f64>> = vec![Vec::new(); 12];
    let mut quarter_buckets: Vec<Vec<f64>> = vec![Vec::new(); 4];

    for (month, r) in monthly_returns(values) {
        if let MetricValue::Defined(r) = r {
            month_buckets[month.month() as usize - 1].push(r);
            quarter_buckets[month.quarter() as usize - 1].push(r);
        }
    }

    let by_month: Vec<SeasonalStats> = month_buckets
        .iter()
        .enumerate()
        .map(|(i, samples)| stats_for(i as u32 + 1, MONTH_LABELS[i].to_string(), samples))
        .collect();

    let by_quarter: Vec<SeasonalStats> = quarter_buckets
        .iter()
        .enumerate()
        .map(|(i, samples)| stats_for(i as u32 + 1, format!("Q{}", i + 1), samples))
        .collect();

    let ranked: Vec<(u32, f64)> = by_month
        .iter()
        .filter_map(|s| s.mean_return.value().map(|m| (s.period, m)))
        .collect();

    Ok(SeasonalityReport {
        months_of_history: values.len(),
        best_month: ranked
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(p, _)| *p),
        worst_month: ranked
            .iter()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(p, _)| *p),
        by_month,
        by_quarter,
    })
}

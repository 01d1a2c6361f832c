use crate::error::{PortfolioError, Result};
use crate::schema::YearMonth;

pub const MONTHS_PER_YEAR: f64 = 12.0;

/// Every month from `start` to `end` inclusive. Empty when `end < start`.
pub fn months_in_range(start: YearMonth, end: YearMonth) -> Vec<YearMonth> {
    let mut months = Vec::new();
    let mut current = start;
    while current <= end {
        months.push(current);
        current = current.succ();
    }
    months
}

/// Parses a period string in the format "YYYY-MM" or "YYYY-MM:YYYY-MM"
/// Returns (start_month, end_month)
pub fn parse_period_string(period: &str) -> Result<(YearMonth, YearMonth)> {
    let parts: Vec<&str> = period.split(':').collect();

    match parts.len() {
        1 => {
            let month: YearMonth = parts[0].parse().map_err(|_| {
                PortfolioError::InvalidPeriod(format!(
                    "Invalid month in period: {}. Expected YYYY-MM",
                    parts[0]
                ))
            })?;
            Ok((month, month))
        }
        2 => {
            let start: YearMonth = parts[0].parse().map_err(|_| {
                PortfolioError::InvalidPeriod(format!(
                    "Invalid start month in period: {}. Expected YYYY-MM",
                    parts[0]
                ))
            })?;
            let end: YearMonth = parts[1].parse().map_err(|_| {
                PortfolioError::InvalidPeriod(format!(
                    "Invalid end month in period: {}. Expected YYYY-MM",
                    parts[1]
                ))
            })?;
            if end < start {
                return Err(PortfolioError::InvalidPeriod(format!(
                    "Period '{}' ends before it starts",
                    period
                )));
            }
            Ok((start, end))
        }
        _ => Err(PortfolioError::InvalidPeriod(format!(
            "Invalid period format: {}. Expected 'YYYY-MM' or 'YYYY-MM:YYYY-MM'",
            period
        ))),
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator). Needs at least two values.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values
        .iter()
        .map(|v| {
            let diff = v - m;
            diff * diff
        })
        .sum::<f64>()
        / (values.len() as f64 - 1.0);
    Some(var.sqrt())
}

/// Empirical percentile with linear interpolation between closest ranks.
/// `q` is a fraction in [0, 1].
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = q * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return Some(sorted[lower]);
    }
    let frac = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

use crate::engine::MonthlyValues;
use crate::metrics::{require_history, MetricResult, MetricValue, UndefinedReason};
use crate::schema::YearMonth;
use crate::utils::MONTHS_PER_YEAR;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A return measured against a period baseline (prior December, prior quarter end).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodReturn {
    pub value: f64,
    pub baseline_month: YearMonth,
    /// True when history starts inside the period and the earliest month stood in
    /// for the proper baseline.
    pub is_partial: bool,
}

fn change(base: f64, value: f64) -> MetricResult<f64> {
    if base == 0.0 {
        Err(UndefinedReason::ZeroBaseline)
    } else {
        Ok((value - base) / base)
    }
}

/// Return from the month before `month` to `month`.
pub fn mom_return(values: &MonthlyValues, month: YearMonth) -> MetricValue {
    let Some(current) = values.get(&month) else {
        return MetricValue::Undefined(UndefinedReason::EmptyCohort);
    };
    match values.get(&month.pred()) {
        Some(base) => change(*base, *current).into(),
        None => MetricValue::Undefined(UndefinedReason::NoPriorData),
    }
}

/// Month-over-month return for every month in the series.
pub fn monthly_returns(values: &MonthlyValues) -> BTreeMap<YearMonth, MetricValue> {
    values
        .keys()
        .map(|month| (*month, mom_return(values, *month)))
        .collect()
}

/// The defined monthly returns, in month order.
pub fn defined_returns(values: &MonthlyValues) -> Vec<f64> {
    monthly_returns(values)
        .values()
        .filter_map(MetricValue::value)
        .collect()
}

fn period_return(
    values: &MonthlyValues,
    month: YearMonth,
    proper_baseline: YearMonth,
) -> MetricResult<PeriodReturn> {
    let current = *values.get(&month).ok_or(UndefinedReason::EmptyCohort)?;

    let (baseline_month, is_partial) = if values.contains_key(&proper_baseline) {
        (proper_baseline, false)
    } else {
        let first = *values.keys().next().ok_or(UndefinedReason::EmptyCohort)?;
        if first <= proper_baseline {
            // History covers the baseline month but has a hole there.
            return Err(UndefinedReason::NoPriorData);
        }
        (first, true)
    };

    if baseline_month >= month {
        return Err(UndefinedReason::NoPriorData);
    }

    let base = values[&baseline_month];
    Ok(PeriodReturn {
        value: change(base, current)?,
        baseline_month,
        is_partial,
    })
}

/// Year-to-date return against the previous December.
pub fn ytd_return(values: &MonthlyValues, month: YearMonth) -> MetricResult<PeriodReturn> {
    period_return(values, month, month.prior_year_end())
}

/// Quarter-to-date return against the last month of the previous quarter.
pub fn qtd_return(values: &MonthlyValues, month: YearMonth) -> MetricResult<PeriodReturn> {
    period_return(values, month, month.prior_quarter_end())
}

/// YTD and QTD for one month, keeping the baseline and partial flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeriodReturns {
    pub ytd: MetricResult<PeriodReturn>,
    pub qtd: MetricResult<PeriodReturn>,
}

impl PeriodReturns {
    pub fn at(values: &MonthlyValues, month: YearMonth) -> Self {
        Self {
            ytd: ytd_return(values, month),
            qtd: qtd_return(values, month),
        }
    }

    pub fn is_partial(&self) -> bool {
        self.ytd.map_or(false, |r| r.is_partial) || self.qtd.map_or(false, |r| r.is_partial)
    }
}

/// Return since the first month of the series.
pub fn cumulative_return(values: &MonthlyValues, month: YearMonth) -> MetricValue {
    let Some(current) = values.get(&month) else {
        return MetricValue::Undefined(UndefinedReason::EmptyCohort);
    };
    match values.iter().next() {
        Some((first, base)) if *first < month => change(*base, *current).into(),
        _ => MetricValue::Undefined(UndefinedReason::NoPriorData),
    }
}

/// Months of history up to and including `month`.
pub(crate) fn history_len(values: &MonthlyValues, month: YearMonth) -> usize {
    values.range(..=month).count()
}

/// Compounded return over the `window` months ending at `month`.
/// Needs `window + 1` months of history.
pub fn rolling_return(values: &MonthlyValues, month: YearMonth, window: u32) -> MetricValue {
    window_change(values, month, window).into()
}

fn window_change(values: &MonthlyValues, month: YearMonth, window: u32) -> MetricResult<f64> {
    let current = *values.get(&month).ok_or(UndefinedReason::EmptyCohort)?;
    require_history(window as usize + 1, history_len(values, month))?;
    let base = *values
        .get(&month.minus_months(window))
        .ok_or(UndefinedReason::NoPriorData)?;
    change(base, current)
}

/// Geometric annual growth rate between the first and last month of the series.
pub fn annualized_return(values: &MonthlyValues) -> MetricResult<f64> {
    let (first_month, first) = values.iter().next().ok_or(UndefinedReason::EmptyCohort)?;
    let (last_month, last) = values.iter().next_back().ok_or(UndefinedReason::EmptyCohort)?;

    let months = first_month.months_until(*last_month);
    require_history(2, months as usize + 1)?;
    if *first <= 0.0 || *last < 0.0 {
        return Err(UndefinedReason::ZeroBaseline);
    }

    Ok((last / first).powf(MONTHS_PER_YEAR / months as f64) - 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ym(y: i32, m: u32) -> YearMonth {
        YearMonth::new(y, m).unwrap()
    }

    fn series(start: YearMonth, values: &[f64]) -> MonthlyValues {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (start.plus_months(i as u32), *v))
            .collect()
    }

    #[test]
    fn test_mom_return() {
        let values = series(ym(2024, 1), &[110.0, 110.0, 120.0]);
        assert_eq!(
            mom_return(&values, ym(2024, 1)),
            MetricValue::Undefined(UndefinedReason::NoPriorData)
        );
        assert_eq!(mom_return(&values, ym(2024, 2)), MetricValue::Defined(0.0));
        let mar = mom_return(&values, ym(2024, 3)).value().unwrap();
        assert!((mar - 0.0909090909).abs() < 1e-9);
    }

    #[test]
    fn test_mom_return_zero_baseline() {
        let values = series(ym(2024, 1), &[0.0, 50.0]);
        assert_eq!(
            mom_return(&values, ym(2024, 2)),
            MetricValue::Undefined(UndefinedReason::ZeroBaseline)
        );
        assert_eq!(defined_returns(&values), Vec::<f64>::new());
    }

    #[test]
    fn test_ytd_uses_prior_december() {
        let values = series(ym(2023, 11), &[90.0, 100.0, 105.0, 110.0]);
        let ytd = ytd_return(&values, ym(2024, 2)).unwrap();
        assert_eq!(ytd.baseline_month, ym(2023, 12));
        assert!(!ytd.is_partial);
        assert!((ytd.value - 0.10).abs() < 1e-12);

        // 2022-12 is before the first month, so November stands in
        let dec = ytd_return(&values, ym(2023, 12)).unwrap();
        assert!(dec.is_partial);
        assert_eq!(dec.baseline_month, ym(2023, 11));
    }

    #[test]
    fn test_ytd_partial_when_history_starts_mid_year() {
        let values = series(ym(2024, 4), &[200.0, 210.0, 220.0]);
        let ytd = ytd_return(&values, ym(2024, 6)).unwrap();
        assert!(ytd.is_partial);
        assert_eq!(ytd.baseline_month, ym(2024, 4));
        assert!((ytd.value - 0.10).abs() < 1e-12);

        assert_eq!(
            ytd_return(&values, ym(2024, 4)),
            Err(UndefinedReason::NoPriorData)
        );
    }

    #[test]
    fn test_qtd_return() {
        let values = series(ym(2024, 1), &[100.0, 102.0, 104.0, 110.0, 121.0]);
        let q2 = qtd_return(&values, ym(2024, 5)).unwrap();
        assert_eq!(q2.baseline_month, ym(2024, 3));
        assert!((q2.value - (121.0 / 104.0 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_rolling_return_requires_window_plus_one() {
        let values = series(ym(2024, 1), &[100.0, 110.0, 121.0, 133.1]);
        assert_eq!(
            rolling_return(&values, ym(2024, 3), 3),
            MetricValue::Undefined(UndefinedReason::InsufficientHistory {
                required: 4,
                available: 3
            })
        );
        let r = rolling_return(&values, ym(2024, 4), 3).value().unwrap();
        assert!((r - 0.331).abs() < 1e-9);
    }

    #[test]
    fn test_cumulative_and_annualized() {
        let mut raw = vec![100.0; 12];
        raw.push(110.0);
        let values = series(ym(2023, 1), &raw);
        let cumulative = cumulative_return(&values, ym(2024, 1)).value().unwrap();
        assert!((cumulative - 0.10).abs() < 1e-12);
        let annual = annualized_return(&values).unwrap();
        assert!((annual - 0.10).abs() < 1e-12);

        let single = series(ym(2024, 1), &[100.0]);
        assert!(annualized_return(&single).is_err());
        assert!(!cumulative_return(&single, ym(2024, 1)).is_defined());
    }
}

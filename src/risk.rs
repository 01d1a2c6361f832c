use crate::config::MetricParams;
use crate::engine::MonthlyValues;
use crate::metrics::{ratio, require_history, MetricResult, MetricValue, UndefinedReason};
use crate::returns::{defined_returns, history_len, monthly_returns, mom_return};
use crate::schema::YearMonth;
use crate::utils::{mean, percentile, sample_std, MONTHS_PER_YEAR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn annualization() -> f64 {
    MONTHS_PER_YEAR.sqrt()
}

/// The `window` monthly returns ending at `month`. Every one of them must be defined.
pub fn window_returns(values: &MonthlyValues, month: YearMonth, window: u32) -> MetricResult<Vec<f64>> {
    if !values.contains_key(&month) {
        return Err(UndefinedReason::EmptyCohort);
    }
    require_history(window as usize + 1, history_len(values, month))?;

    (0..window)
        .rev()
        .map(|back| match mom_return(values, month.minus_months(back)) {
            MetricValue::Defined(r) => Ok(r),
            MetricValue::Undefined(reason) => Err(reason),
        })
        .collect()
}

fn std_of(returns: &[f64]) -> MetricResult<f64> {
    sample_std(returns).ok_or(UndefinedReason::InsufficientHistory {
        required: 2,
        available: returns.len(),
    })
}

/// Sample standard deviation scaled by √12.
pub fn annualized_volatility(returns: &[f64]) -> MetricResult<f64> {
    Ok(std_of(returns)? * annualization())
}

/// Mean monthly excess return over its standard deviation, scaled by √12.
pub fn sharpe_ratio(returns: &[f64], annual_risk_free_rate: f64) -> MetricResult<f64> {
    let std = std_of(returns)?;
    let rf_monthly = annual_risk_free_rate / MONTHS_PER_YEAR;
    let excess = mean(returns).ok_or(UndefinedReason::EmptyCohort)? - rf_monthly;
    Ok(ratio(excess, std)? * annualization())
}

/// Root mean square of the shortfalls below `mar`. Months above it count as zero.
pub fn downside_deviation(returns: &[f64], mar: f64) -> MetricResult<f64> {
    let squares: Vec<f64> = returns
        .iter()
        .map(|r| {
            let shortfall = (r - mar).min(0.0);
            shortfall * shortfall
        })
        .collect();
    Ok(mean(&squares).ok_or(UndefinedReason::EmptyCohort)?.sqrt())
}

pub fn sortino_ratio(returns: &[f64], annual_risk_free_rate: f64, mar: f64) -> MetricResult<f64> {
    require_history(2, returns.len())?;
    let rf_monthly = annual_risk_free_rate / MONTHS_PER_YEAR;
    let excess = mean(returns).ok_or(UndefinedReason::EmptyCohort)? - rf_monthly;
    let dd = downside_deviation(returns, mar)?;
    Ok(ratio(excess, dd)? * annualization())
}

/// Empirical lower-tail percentile of monthly returns.
pub fn value_at_risk(returns: &[f64], quantile: f64, min_samples: usize) -> MetricResult<f64> {
    require_history(min_samples, returns.len())?;
    percentile(returns, quantile).ok_or(UndefinedReason::EmptyCohort)
}

/// Mean of the returns at or below the VaR threshold.
pub fn conditional_var(returns: &[f64], quantile: f64, min_samples: usize) -> MetricResult<f64> {
    let var = value_at_risk(returns, quantile, min_samples)?;
    let tail: Vec<f64> = returns.iter().copied().filter(|r| *r <= var).collect();
    mean(&tail).ok_or(UndefinedReason::EmptyCohort)
}

/// Sum of gains over the absolute sum of losses.
pub fn gain_to_pain(returns: &[f64]) -> MetricResult<f64> {
    if returns.is_empty() {
        return Err(UndefinedReason::EmptyCohort);
    }
    let gains: f64 = returns.iter().filter(|r| **r > 0.0).sum();
    let losses: f64 = returns.iter().filter(|r| **r < 0.0).map(|r| r.abs()).sum();
    ratio(gains, losses)
}

pub fn rolling_volatility(values: &MonthlyValues, month: YearMonth, window: u32) -> MetricValue {
    window_returns(values, month, window)
        .and_then(|r| annualized_volatility(&r))
        .into()
}

pub fn rolling_sharpe(
    values: &MonthlyValues,
    month: YearMonth,
    window: u32,
    annual_risk_free_rate: f64,
) -> MetricValue {
    window_returns(values, month, window)
        .and_then(|r| sharpe_ratio(&r, annual_risk_free_rate))
        .into()
}

pub fn rolling_sortino(
    values: &MonthlyValues,
    month: YearMonth,
    window: u32,
    annual_risk_free_rate: f64,
    mar: f64,
) -> MetricValue {
    window_returns(values, month, window)
        .and_then(|r| sortino_ratio(&r, annual_risk_free_rate, mar))
        .into()
}

/// Drawdown from the running peak for every month. Always `<= 0` when defined;
/// undefined while the running peak is not positive.
pub fn drawdown_series(values: &MonthlyValues) -> BTreeMap<YearMonth, MetricValue> {
    let mut peak = f64::NEG_INFINITY;
    values
        .iter()
        .map(|(month, value)| {
            peak = peak.max(*value);
            let dd = if peak > 0.0 {
                MetricValue::Defined(((value - peak) / peak).min(0.0))
            } else {
                MetricValue::Undefined(UndefinedReason::ZeroBaseline)
            };
            (*month, dd)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownSummary {
    /// Deepest drawdown, `<= 0`.
    pub max_drawdown: f64,
    pub peak_month: YearMonth,
    pub peak_value: f64,
    pub trough_month: YearMonth,
    /// First month after the trough back at or above the peak value.
    /// `None` when the series never recovers or never fell.
    pub recovery_month: Option<YearMonth>,
    pub recovery_months: Option<i64>,
    pub current_drawdown: f64,
    pub months_in_drawdown: usize,
}

pub fn drawdown_summary(values: &MonthlyValues) -> MetricResult<DrawdownSummary> {
    if values.is_empty() {
        return Err(UndefinedReason::EmptyCohort);
    }

    let mut running_peak: Option<(YearMonth, f64)> = None;
    let mut deepest: Option<(f64, YearMonth, f64, YearMonth)> = None;
    let mut current = 0.0;
    let mut months_in_drawdown = 0;

    for (month, value) in values {
        match running_peak {
            Some((_, p)) if p >= *value => {}
            _ => running_peak = Some((*month, *value)),
        }
        let Some((peak_month, peak)) = running_peak else {
            continue;
        };
        if peak <= 0.0 {
            continue;
        }

        current = ((value - peak) / peak).min(0.0);
        if current < 0.0 {
            months_in_drawdown += 1;
        }
        let deeper = deepest.map_or(true, |(d, ..)| current < d);
        if deeper {
            deepest = Some((current, peak_month, peak, *month));
        }
    }

    let (max_drawdown, peak_month, peak_value, trough_month) =
        deepest.ok_or(UndefinedReason::ZeroBaseline)?;

    let recovery_month = if max_drawdown < 0.0 {
        values
            .range(trough_month.succ()..)
            .find(|(_, v)| **v >= peak_value)
            .map(|(m, _)| *m)
    } else {
        None
    };

    Ok(DrawdownSummary {
        max_drawdown,
        peak_month,
        peak_value,
        trough_month,
        recovery_month,
        recovery_months: recovery_month.map(|m| trough_month.months_until(m)),
        current_drawdown: current,
        months_in_drawdown,
    })
}

/// Root mean square of the drawdown series.
pub fn ulcer_index(values: &MonthlyValues) -> MetricResult<f64> {
    let squares: Vec<f64> = drawdown_series(values)
        .values()
        .filter_map(MetricValue::value)
        .map(|d| d * d)
        .collect();
    Ok(mean(&squares).ok_or(UndefinedReason::EmptyCohort)?.sqrt())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonthlyReturn {
    pub month: YearMonth,
    pub value: f64,
}

/// Whole-series risk statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSummary {
    pub observations: usize,
    pub mean_monthly_return: MetricValue,
    pub annualized_mean_return: MetricValue,
    pub annualized_volatility: MetricValue,
    pub sharpe_ratio: MetricValue,
    pub sortino_ratio: MetricValue,
    pub downside_deviation: MetricValue,
    pub value_at_risk: MetricValue,
    pub conditional_var: MetricValue,
    pub max_drawdown: MetricValue,
    pub calmar_ratio: MetricValue,
    pub ulcer_index: MetricValue,
    pub gain_to_pain: MetricValue,
    pub best_month: Option<MonthlyReturn>,
    pub worst_month: Option<MonthlyReturn>,
    pub positive_months: usize,
    pub negative_months: usize,
}

pub fn risk_summary(values: &MonthlyValues, params: &MetricParams) -> RiskSummary {
    let dated: Vec<MonthlyReturn> = monthly_returns(values)
        .into_iter()
        .filter_map(|(month, r)| r.value().map(|value| MonthlyReturn { month, value }))
        .collect();
    let returns = defined_returns(values);

    let mean_monthly: MetricResult<f64> = mean(&returns).ok_or(UndefinedReason::EmptyCohort);
    let annual_mean = mean_monthly.map(|m| m * MONTHS_PER_YEAR);
    let drawdown = drawdown_summary(values);

    let calmar = annual_mean.and_then(|annual| {
        let dd = drawdown.as_ref().map_err(|r| *r)?;
        ratio(annual, dd.max_drawdown.abs())
    });

    RiskSummary {
        observations: returns.len(),
        mean_monthly_return: mean_monthly.into(),
        annualized_mean_return: annual_mean.into(),
        annualized_volatility: annualized_volatility(&returns).into(),
        sharpe_ratio: sharpe_ratio(&returns, params.risk_free_rate).into(),
        sortino_ratio: sortino_ratio(
            &returns,
            params.risk_free_rate,
            params.minimum_acceptable_return,
        )
        .into(),
        downside_deviation: downside_deviation(&returns, params.minimum_acceptable_return).into(),
        value_at_risk: value_at_risk(&returns, params.var_percentile, params.var_min_samples).into(),
        conditional_var: conditional_var(&returns, params.var_percentile, params.var_min_samples)
            .into(),
        max_drawdown: drawdown.as_ref().map(|d| d.max_drawdown).map_err(|r| *r).into(),
        calmar_ratio: calmar.into(),
        ulcer_index: ulcer_index(values).into(),
        gain_to_pain: gain_to_pain(&returns).into(),
        best_month: dated.iter().copied().max_by(|a, b| a.value.total_cmp(&b.value)),
        worst_month: dated.iter().copied().min_by(|a, b| a.value.total_cmp(&b.value)),
        positive_months: returns.iter().filter(|r| **r > 0.0).count(),
        negative_months: returns.iter().filter(|r| **r < 0.0).count(),
    }
}

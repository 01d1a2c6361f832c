use crate::config::{ForecastParams, SamplingMethod};
use crate::engine::MonthlyValues;
use crate::metrics::{ratio, require_history, MetricResult, UndefinedReason};
use crate::returns::defined_returns;
use crate::schema::YearMonth;
use crate::utils::{mean, percentile, sample_std, MONTHS_PER_YEAR};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub year_month: YearMonth,
    pub value: f64,
}

fn last_observation(values: &MonthlyValues) -> MetricResult<(YearMonth, f64)> {
    values
        .iter()
        .next_back()
        .map(|(m, v)| (*m, *v))
        .ok_or(UndefinedReason::EmptyCohort)
}

fn flat_projection(from: YearMonth, level: f64, horizon: u32) -> Vec<ForecastPoint> {
    (1..=horizon)
        .map(|h| ForecastPoint {
            year_month: from.plus_months(h),
            value: level,
        })
        .collect()
}

/// Projects the mean of the last `window` values forward unchanged.
pub fn moving_average_forecast(
    values: &MonthlyValues,
    window: usize,
    horizon: u32,
) -> MetricResult<Vec<ForecastPoint>> {
    require_history(window.max(1), values.len())?;
    let (last_month, _) = last_observation(values)?;
    let tail: Vec<f64> = values.values().rev().take(window).copied().collect();
    let level = mean(&tail).ok_or(UndefinedReason::EmptyCohort)?;
    Ok(flat_projection(last_month, level, horizon))
}

/// Simple exponential smoothing; the final level is projected flat.
pub fn exponential_smoothing_forecast(
    values: &MonthlyValues,
    alpha: f64,
    horizon: u32,
) -> MetricResult<Vec<ForecastPoint>> {
    let (last_month, _) = last_observation(values)?;
    let mut series = values.values();
    let mut level = *series.next().ok_or(UndefinedReason::EmptyCohort)?;
    for v in series {
        level = alpha * v + (1.0 - alpha) * level;
    }
    Ok(flat_projection(last_month, level, horizon))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LinearFit {
    pub fn at(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// Ordinary least squares of `ys` on `xs`.
pub fn linear_fit(xs: &[f64], ys: &[f64]) -> MetricResult<LinearFit> {
    let n = xs.len().min(ys.len());
    require_history(2, n)?;
    let (xs, ys) = (&xs[..n], &ys[..n]);

    let mx = mean(xs).ok_or(UndefinedReason::EmptyCohort)?;
    let my = mean(ys).ok_or(UndefinedReason::EmptyCohort)?;
    let sxy: f64 = xs.iter().zip(ys).map(|(x, y)| (x - mx) * (y - my)).sum();
    let sxx: f64 = xs.iter().map(|x| (x - mx) * (x - mx)).sum();

    let slope = ratio(sxy, sxx)?;
    let intercept = my - slope * mx;

    let ss_tot: f64 = ys.iter().map(|y| (y - my) * (y - my)).sum();
    let ss_res: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| {
            let e = y - (intercept + slope * x);
            e * e
        })
        .sum();
    let r_squared = if ss_tot == 0.0 { 1.0 } else { 1.0 - ss_res / ss_tot };

    Ok(LinearFit {
        slope,
        intercept,
        r_squared,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendForecast {
    pub fit: LinearFit,
    pub points: Vec<ForecastPoint>,
}

/// Fits value against month index and extends the line.
pub fn linear_trend_forecast(values: &MonthlyValues, horizon: u32) -> MetricResult<TrendForecast> {
    let (first_month, _) = values
        .iter()
        .next()
        .map(|(m, v)| (*m, *v))
        .ok_or(UndefinedReason::EmptyCohort)?;
    let (last_month, _) = last_observation(values)?;

    let xs: Vec<f64> = values
        .keys()
        .map(|m| first_month.months_until(*m) as f64)
        .collect();
    let ys: Vec<f64> = values.values().copied().collect();
    let fit = linear_fit(&xs, &ys)?;

    let offset = first_month.months_until(last_month) as f64;
    let points = (1..=horizon)
        .map(|h| ForecastPoint {
            year_month: last_month.plus_months(h),
            value: fit.at(offset + h as f64),
        })
        .collect();

    Ok(TrendForecast { fit, points })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandValue {
    pub quantile: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastBand {
    pub year_month: YearMonth,
    pub values: Vec<BandValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloForecast {
    pub start_month: YearMonth,
    pub start_value: f64,
    pub paths: usize,
    pub sampling: SamplingMethod,
    pub bands: Vec<ForecastBand>,
    pub expected_final_value: f64,
    pub probability_positive_return: f64,
}

impl MonteCarloForecast {
    pub fn final_band(&self) -> Option<&ForecastBand> {
        self.bands.last()
    }
}

/// Compounds `paths` simulated return sequences forward from `start`.
/// Returns one row of values per path.
fn simulate<R: Rng + ?Sized>(
    start: f64,
    paths: usize,
    horizon: u32,
    rng: &mut R,
    mut draw: impl FnMut(&mut R) -> f64,
) -> Vec<Vec<f64>> {
    (0..paths)
        .map(|_| {
            let mut value = start;
            (0..horizon)
                .map(|_| {
                    value *= 1.0 + draw(&mut *rng);
                    value
                })
                .collect()
        })
        .collect()
}

fn bands_from(paths: &[Vec<f64>], start_month: YearMonth, quantiles: &[f64]) -> Vec<ForecastBand> {
    let horizon = paths.first().map_or(0, Vec::len);
    (0..horizon)
        .map(|h| {
            let column: Vec<f64> = paths.iter().map(|p| p[h]).collect();
            ForecastBand {
                year_month: start_month.plus_months(h as u32 + 1),
                values: quantiles
                    .iter()
                    .filter_map(|q| {
                        percentile(&column, *q).map(|value| BandValue {
                            quantile: *q,
                            value,
                        })
                    })
                    .collect(),
            }
        })
        .collect()
}

fn finals(paths: &[Vec<f64>]) -> Vec<f64> {
    paths.iter().filter_map(|p| p.last().copied()).collect()
}

fn normal(mean: f64, std: f64) -> MetricResult<Normal<f64>> {
    Normal::new(mean, std).map_err(|_| UndefinedReason::ZeroDenominator)
}

/// Monte Carlo projection of the series from its last value.
///
/// Needs `params.min_history` defined monthly returns. All randomness comes from `rng`,
/// so a seeded generator gives reproducible bands.
pub fn monte_carlo<R: Rng + ?Sized>(
    values: &MonthlyValues,
    params: &ForecastParams,
    rng: &mut R,
) -> MetricResult<MonteCarloForecast> {
    let returns = defined_returns(values);
    require_history(params.min_history.max(2), returns.len())?;
    let (start_month, start_value) = last_observation(values)?;

    let paths = match params.sampling {
        SamplingMethod::Bootstrap => simulate(
            start_value,
            params.paths,
            params.horizon_months,
            rng,
            |rng| returns[rng.gen_range(0..returns.len())],
        ),
        SamplingMethod::FittedNormal => {
            let dist = normal(
                mean(&returns).ok_or(UndefinedReason::EmptyCohort)?,
                sample_std(&returns).ok_or(UndefinedReason::EmptyCohort)?,
            )?;
            simulate(start_value, params.paths, params.horizon_months, rng, |rng| {
                dist.sample(rng)
            })
        }
    };

    let final_values = finals(&paths);
    let expected_final_value = mean(&final_values).ok_or(UndefinedReason::EmptyCohort)?;
    let positive = final_values.iter().filter(|v| **v > start_value).count();

    debug!(
        "Simulated {} paths over {} months from {}",
        params.paths, params.horizon_months, start_month
    );

    Ok(MonteCarloForecast {
        start_month,
        start_value,
        paths: params.paths,
        sampling: params.sampling,
        bands: bands_from(&paths, start_month, &params.bands),
        expected_final_value,
        probability_positive_return: positive as f64 / final_values.len() as f64,
    })
}

pub fn monte_carlo_seeded(
    values: &MonthlyValues,
    params: &ForecastParams,
    seed: u64,
) -> MetricResult<MonteCarloForecast> {
    let mut rng = StdRng::seed_from_u64(seed);
    monte_carlo(values, params, &mut rng)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressScenario {
    pub stress_level: f64,
    pub stressed_mean_return: f64,
    /// Annualized.
    pub stressed_volatility: f64,
    pub median_final_value: f64,
    pub worst_decile_final_value: f64,
    pub probability_of_loss: f64,
}

/// Re-runs a fitted-normal simulation with the mean cut by `s` and the volatility
/// raised by `s`, for each configured stress level `s`.
pub fn stress_test<R: Rng + ?Sized>(
    values: &MonthlyValues,
    params: &ForecastParams,
    rng: &mut R,
) -> MetricResult<Vec<StressScenario>> {
    let returns = defined_returns(values);
    require_history(params.min_history.max(2), returns.len())?;
    let (_, start_value) = last_observation(values)?;
    let base_mean = mean(&returns).ok_or(UndefinedReason::EmptyCohort)?;
    let base_std = sample_std(&returns).ok_or(UndefinedReason::EmptyCohort)?;

    params
        .stress_levels
        .iter()
        .map(|&level| {
            let stressed_mean = base_mean * (1.0 - level);
            let stressed_std = base_std * (1.0 + level);
            let dist = normal(stressed_mean, stressed_std)?;
            let paths = simulate(
                start_value,
                params.paths,
                params.horizon_months,
                &mut *rng,
                |rng| dist.sample(rng),
            );
            let final_values = finals(&paths);
            let losses = final_values.iter().filter(|v| **v < start_value).count();

            Ok(StressScenario {
                stress_level: level,
                stressed_mean_return: stressed_mean,
                stressed_volatility: stressed_std * MONTHS_PER_YEAR.sqrt(),
                median_final_value: percentile(&final_values, 0.5)
                    .ok_or(UndefinedReason::EmptyCohort)?,
                worst_decile_final_value: percentile(&final_values, 0.1)
                    .ok_or(UndefinedReason::EmptyCohort)?,
                probability_of_loss: losses as f64 / final_values.len() as f64,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSet {
    pub moving_average: MetricResult<Vec<ForecastPoint>>,
    pub exponential_smoothing: MetricResult<Vec<ForecastPoint>>,
    pub linear_trend: MetricResult<TrendForecast>,
    pub monte_carlo: MetricResult<MonteCarloForecast>,
    pub stress_tests: MetricResult<Vec<StressScenario>>,
}

/// Runs every forecast method against one series.
pub fn forecast_all<R: Rng + ?Sized>(
    values: &MonthlyValues,
    params: &ForecastParams,
    rng: &mut R,
) -> ForecastSet {
    ForecastSet {
        moving_average: moving_average_forecast(
            values,
            params.moving_average_window,
            params.horizon_months,
        ),
        exponential_smoothing: exponential_smoothing_forecast(
            values,
            params.smoothing_alpha,
            params.horizon_months,
        ),
        linear_trend: linear_trend_forecast(values, params.horizon_months),
        monte_carlo: monte_carlo(values, params, rng),
        stress_tests: stress_test(values, params, rng),
    }
}

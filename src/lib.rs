//! # Portfolio History Builder
//!
//! A library for turning irregular, possibly duplicated asset snapshots taken from
//! a personal-finance spreadsheet into dense monthly series and portfolio analytics.
//!
//! ## Core Concepts
//!
//! - **Snapshot records**: timestamped values per (platform, asset) pair
//! - **Monthly grid**: one point per entity per month, with gaps forward-filled and flagged
//! - **Portfolio snapshots**: monthly totals, counts and per-asset-type subtotals
//! - **Metrics**: returns, rolling risk ratios, drawdown, attribution and forecasts.
//!   Every metric is either a number or an explicit undefined marker, never a silent zero
//!
//! ## Example
//!
//! ```rust,ignore
//! use portfolio_history_builder::*;
//!
//! let source = InMemorySource::new("sheet").with_table(RawTable::new(
//!     "Balance Sheet",
//!     &["Platform", "Asset", "Value", "Timestamp"],
//!     &[
//!         &["Monzo", "Current Account", "£1,200.00", "05/01/2024"],
//!         &["Monzo", "Current Account", "£1,350.00", "10/03/2024"],
//!     ],
//! ));
//!
//! let bundle = process_portfolio_history(DashboardConfig::default(), Arc::new(source)).unwrap();
//! println!("{:?}", bundle.portfolio_metrics);
//! ```

pub mod attribution;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod forecasting;
pub mod ingestion;
pub mod metrics;
pub mod pensions;
pub mod register;
pub mod returns;
pub mod risk;
pub mod schema;
pub mod seasonality;
pub mod utils;
pub mod vehicles;

pub use attribution::{allocation, concentration, contributions, ConcentrationSummary, ContributionBreakdown};
pub use cache::{CacheKey, MetricsCache};
pub use classifier::{AssetClassifier, ClassificationReport};
pub use config::*;
pub use engine::{
    build_portfolio_snapshots, normalize, to_snapshot_records, MonthlyValues, NormalizationReport,
    Normalizer,
};
pub use error::{PortfolioError, Result};
pub use forecasting::{forecast_all, monte_carlo, monte_carlo_seeded, ForecastSet, MonteCarloForecast};
pub use ingestion::*;
pub use metrics::{MetricRecord, MetricResult, MetricValue, UndefinedReason};
pub use pensions::{pension_summaries, PensionSummary};
pub use register::AssetRegister;
pub use returns::{PeriodReturn, PeriodReturns};
pub use risk::{DrawdownSummary, RiskSummary};
pub use schema::*;
pub use seasonality::SeasonalityReport;
pub use vehicles::{fleet_summary, FleetSummary, VehicleSummary};

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Everything read from a source, before classification.
#[derive(Debug, Clone, Default)]
pub struct SourceData {
    pub snapshots: Vec<SnapshotRecord>,
    pub cashflows: Vec<CashflowRecord>,
    pub vehicle_states: Vec<VehicleStateRecord>,
    pub vehicle_payments: Vec<VehiclePaymentRecord>,
    pub vehicle_expenses: Vec<VehicleExpenseRecord>,
    pub load_reports: Vec<LoadReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetrics {
    pub entity_id: EntityId,
    pub asset_type: AssetType,
    pub metrics: BTreeMap<YearMonth, MetricRecord>,
    pub period_returns: BTreeMap<YearMonth, PeriodReturns>,
}

/// The output handed to the presentation layer for one month range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardBundle {
    pub source_id: String,
    /// First and last month covered, `None` when there is no data.
    pub range: Option<(YearMonth, YearMonth)>,
    pub snapshots: Vec<PortfolioMonthlySnapshot>,
    pub points: Vec<MonthlySeriesPoint>,
    pub portfolio_metrics: BTreeMap<YearMonth, MetricRecord>,
    /// YTD and QTD with baseline month and partial flag, per month.
    pub period_returns: BTreeMap<YearMonth, PeriodReturns>,
    pub entity_metrics: Vec<EntityMetrics>,
    pub allocation: BTreeMap<YearMonth, BTreeMap<AssetType, MetricValue>>,
    pub contributions: BTreeMap<YearMonth, ContributionBreakdown>,
    pub risk: RiskSummary,
    pub drawdown: MetricResult<DrawdownSummary>,
    /// Concentration in the final month of the range.
    pub concentration: MetricResult<ConcentrationSummary>,
    pub seasonality: MetricResult<SeasonalityReport>,
    pub forecasts: ForecastSet,
    pub pensions: Vec<PensionSummary>,
    pub fleet: FleetSummary,
    pub register: AssetRegister,
    pub load_reports: Vec<LoadReport>,
    pub classification: ClassificationReport,
    pub normalization: NormalizationReport,
}

impl DashboardBundle {
    pub fn latest_snapshot(&self) -> Option<&PortfolioMonthlySnapshot> {
        self.snapshots.last()
    }

    pub fn portfolio_metric(&self, month: YearMonth, name: &str) -> Option<MetricValue> {
        self.portfolio_metrics
            .get(&month)
            .and_then(|record| record.get(name))
            .copied()
    }

    pub fn period_return(&self, month: YearMonth) -> Option<&PeriodReturns> {
        self.period_returns.get(&month)
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Metrics shared by the portfolio total and each entity for one month.
fn series_metrics(
    values: &MonthlyValues,
    drawdowns: &BTreeMap<YearMonth, MetricValue>,
    periods: &PeriodReturns,
    month: YearMonth,
    params: &MetricParams,
) -> MetricRecord {
    let mut record = MetricRecord::new();
    record.insert(
        "mom_return".to_string(),
        returns::mom_return(values, month),
    );
    record.insert(
        "ytd_return".to_string(),
        periods.ytd.map(|r| r.value).into(),
    );
    record.insert(
        "qtd_return".to_string(),
        periods.qtd.map(|r| r.value).into(),
    );
    record.insert(
        "cumulative_return".to_string(),
        returns::cumulative_return(values, month),
    );

    for window in &params.rolling_windows {
        record.insert(
            format!("rolling_{}m_return", window),
            returns::rolling_return(values, month, *window),
        );
        record.insert(
            format!("rolling_{}m_volatility", window),
            risk::rolling_volatility(values, month, *window),
        );
        record.insert(
            format!("rolling_{}m_sharpe", window),
            risk::rolling_sharpe(values, month, *window, params.risk_free_rate),
        );
        record.insert(
            format!("rolling_{}m_sortino", window),
            risk::rolling_sortino(
                values,
                month,
                *window,
                params.risk_free_rate,
                params.minimum_acceptable_return,
            ),
        );
    }

    record.insert(
        "drawdown".to_string(),
        drawdowns
            .get(&month)
            .copied()
            .unwrap_or(MetricValue::Undefined(UndefinedReason::EmptyCohort)),
    );
    record
}

pub struct PortfolioHistoryProcessor {
    config: DashboardConfig,
    classifier: AssetClassifier,
    normalizer: Normalizer,
}

impl PortfolioHistoryProcessor {
    /// Validates the configuration up front. Nothing is computed with an invalid one.
    pub fn new(config: DashboardConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            classifier: AssetClassifier::from_config(&config.classification),
            normalizer: Normalizer::from_config(&config.normalization),
            config,
        })
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    /// Reads every feed. The balance sheet is mandatory; a missing extension
    /// table is skipped, but a timeout on any table is fatal.
    pub fn load(&self, source: Arc<dyn RecordSource + Send + Sync>) -> Result<SourceData> {
        let timeout = Duration::from_secs(self.config.loader.timeout_seconds);
        info!("Loading data from source '{}'", source.source_id());

        let balance_sheet = fetch_with_timeout(Arc::clone(&source), BALANCE_SHEET, timeout)?;
        let (snapshots, report) =
            load_snapshots(&balance_sheet, self.config.loader.allowed_for(BALANCE_SHEET.name))?;

        let mut data = SourceData {
            snapshots,
            load_reports: vec![report],
            ..Default::default()
        };

        let fetch_optional = |spec: TableSpec| -> Result<Option<RawTable>> {
            match fetch_with_timeout(Arc::clone(&source), spec, timeout) {
                Ok(table) => Ok(Some(table)),
                Err(PortfolioError::SourceUnavailable(reason)) => {
                    debug!("Skipping table '{}': {}", spec.name, reason);
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        };

        if let Some(table) = fetch_optional(PENSION_CASHFLOWS)? {
            let (records, report) =
                load_cashflows(&table, self.config.loader.allowed_for(PENSION_CASHFLOWS.name))?;
            data.cashflows = records;
            data.load_reports.push(report);
        }
        if let Some(table) = fetch_optional(VEHICLE_STATE)? {
            let (records, report) =
                load_vehicle_states(&table, self.config.loader.allowed_for(VEHICLE_STATE.name))?;
            data.vehicle_states = records;
            data.load_reports.push(report);
        }
        if let Some(table) = fetch_optional(VEHICLE_PAYMENTS)? {
            let (records, report) =
                load_vehicle_payments(&table, self.config.loader.allowed_for(VEHICLE_PAYMENTS.name))?;
            data.vehicle_payments = records;
            data.load_reports.push(report);
        }
        if let Some(table) = fetch_optional(VEHICLE_EXPENSES)? {
            let (records, report) =
                load_vehicle_expenses(&table, self.config.loader.allowed_for(VEHICLE_EXPENSES.name))?;
            data.vehicle_expenses = records;
            data.load_reports.push(report);
        }

        for report in data.load_reports.iter().filter(|r| r.has_warnings()) {
            warn!("{} (by column: {:?})", report.summary(), report.warning_counts());
        }

        Ok(data)
    }

    /// Classifies, normalizes and computes every metric. With a `range`, series
    /// are built from the full history so that the first month in range still
    /// has a prior month, and the output is restricted to the range.
    pub fn analyze(
        &self,
        data: &SourceData,
        range: Option<(YearMonth, YearMonth)>,
    ) -> Result<DashboardBundle> {
        if let Some((start, end)) = range {
            if start > end {
                return Err(PortfolioError::InvalidPeriod(format!(
                    "range starts at {} after it ends at {}",
                    start, end
                )));
            }
        }

        let (classified, classification) = self.classifier.classify_records(&data.snapshots);
        let (all_points, normalization) = self.normalizer.normalize_with_report(&classified);
        let all_snapshots = build_portfolio_snapshots(&all_points);

        let (points, snapshots) = match range {
            Some((start, end)) => (
                engine::filter_months(&all_points, start, end),
                all_snapshots
                    .iter()
                    .filter(|s| s.year_month >= start && s.year_month <= end)
                    .cloned()
                    .collect::<Vec<_>>(),
            ),
            None => (all_points.clone(), all_snapshots.clone()),
        };
        let months: Vec<YearMonth> = snapshots.iter().map(|s| s.year_month).collect();

        info!(
            "Analyzing {} months across {} entities",
            months.len(),
            normalization.entities
        );

        let params = &self.config.metrics;
        let full_values = engine::portfolio_values(&all_snapshots);
        let full_drawdowns = risk::drawdown_series(&full_values);

        // Whole-range summaries keep the month before the range as their
        // baseline, so they see the same returns as the per-month records.
        let values: MonthlyValues = match months.first() {
            Some(first) => {
                let last = months.last().copied().unwrap_or(*first);
                full_values
                    .range(first.pred()..=last)
                    .map(|(m, v)| (*m, *v))
                    .collect()
            }
            None => MonthlyValues::new(),
        };

        let period_returns: BTreeMap<YearMonth, PeriodReturns> = months
            .iter()
            .map(|month| (*month, PeriodReturns::at(&full_values, *month)))
            .collect();

        let portfolio_metrics: BTreeMap<YearMonth, MetricRecord> = months
            .iter()
            .map(|month| {
                let mut record = series_metrics(
                    &full_values,
                    &full_drawdowns,
                    &period_returns[month],
                    *month,
                    params,
                );
                record.insert(
                    "tpv".to_string(),
                    MetricValue::Defined(full_values.get(month).copied().unwrap_or(0.0)),
                );
                (*month, record)
            })
            .collect();

        let all_entities = engine::entity_values(&all_points);
        let entity_metrics: Vec<EntityMetrics> = engine::group_by_entity(&points)
            .into_iter()
            .map(|(entity_id, series)| {
                let empty = MonthlyValues::new();
                let values = all_entities.get(&entity_id).unwrap_or(&empty);
                let drawdowns = risk::drawdown_series(values);
                let period_returns: BTreeMap<YearMonth, PeriodReturns> = series
                    .iter()
                    .map(|point| (point.year_month, PeriodReturns::at(values, point.year_month)))
                    .collect();
                let metrics = series
                    .iter()
                    .map(|point| {
                        let mut record = series_metrics(
                            values,
                            &drawdowns,
                            &period_returns[&point.year_month],
                            point.year_month,
                            params,
                        );
                        record.insert("value".to_string(), MetricValue::Defined(point.value));
                        record.insert(
                            "weight".to_string(),
                            attribution::weight(&all_entities, &entity_id, point.year_month),
                        );
                        (point.year_month, record)
                    })
                    .collect();
                EntityMetrics {
                    asset_type: series.first().map_or(AssetType::Other, |p| p.asset_type),
                    entity_id,
                    metrics,
                    period_returns,
                }
            })
            .collect();

        let contributions: BTreeMap<YearMonth, ContributionBreakdown> = months
            .iter()
            .filter_map(|month| {
                attribution::contributions(&all_entities, *month)
                    .ok()
                    .map(|c| (*month, c))
            })
            .collect();

        let allocation = snapshots
            .iter()
            .map(|s| (s.year_month, attribution::allocation(s)))
            .collect();

        let concentration = match months.last() {
            Some(month) => attribution::concentration(&points, *month),
            None => Err(UndefinedReason::EmptyCohort),
        };

        let mut rng = match self.config.forecast.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let forecasts = forecast_all(&values, &self.config.forecast, &mut rng);

        let pension_points: Vec<MonthlySeriesPoint> = points
            .iter()
            .filter(|p| p.asset_type == AssetType::Pensions)
            .cloned()
            .collect();

        debug!(
            "Built {} portfolio metric records and {} entity series",
            portfolio_metrics.len(),
            entity_metrics.len()
        );

        Ok(DashboardBundle {
            source_id: self.config.source_id.clone(),
            range: months.first().copied().zip(months.last().copied()),
            risk: risk::risk_summary(&values, params),
            drawdown: risk::drawdown_summary(&values),
            seasonality: seasonality::analyze(&values, params.seasonality_min_months),
            forecasts,
            pensions: pension_summaries(&data.cashflows, &pension_points),
            fleet: fleet_summary(
                &data.vehicle_states,
                &data.vehicle_payments,
                &data.vehicle_expenses,
                self.config.forecast.horizon_months,
            ),
            register: AssetRegister::from_points(&points),
            load_reports: data.load_reports.clone(),
            snapshots,
            points,
            portfolio_metrics,
            period_returns,
            entity_metrics,
            allocation,
            contributions,
            concentration,
            classification,
            normalization,
        })
    }

    /// Like `analyze`, but reuses a bundle already computed for the same source and range.
    pub fn analyze_cached(
        &self,
        cache: &MetricsCache<Result<DashboardBundle>>,
        data: &SourceData,
        range: Option<(YearMonth, YearMonth)>,
    ) -> Arc<Result<DashboardBundle>> {
        let key = CacheKey::new(self.config.source_id.clone(), range, "dashboard");
        cache.get_or_compute(key, || self.analyze(data, range))
    }

    /// Analyzes a period written as `"YYYY-MM"` or `"YYYY-MM:YYYY-MM"`.
    pub fn analyze_period(&self, data: &SourceData, period: &str) -> Result<DashboardBundle> {
        let range = utils::parse_period_string(period)?;
        self.analyze(data, Some(range))
    }

    pub fn process(&self, source: Arc<dyn RecordSource + Send + Sync>) -> Result<DashboardBundle> {
        let data = self.load(source)?;
        self.analyze(&data, None)
    }
}

pub fn process_portfolio_history(
    config: DashboardConfig,
    source: Arc<dyn RecordSource + Send + Sync>,
) -> Result<DashboardBundle> {
    PortfolioHistoryProcessor::new(config)?.process(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ym(y: i32, m: u32) -> YearMonth {
        YearMonth::new(y, m).unwrap()
    }

    fn source() -> InMemorySource {
        InMemorySource::new("sheet").with_table(RawTable::new(
            "Balance Sheet",
            &["Platform", "Asset", "Value", "Timestamp"],
            &[
                &["Monzo", "Current Account", "100", "2024-01-05"],
                &["Monzo", "Current Account", "110", "2024-01-20"],
                &["Monzo", "Current Account", "120", "2024-03-10"],
                &["Vanguard", "ISA", "not a number", "2024-01-10"],
            ],
        ))
    }

    fn config() -> DashboardConfig {
        let mut config = DashboardConfig::default();
        config
            .classification
            .platform_rules
            .insert("Monzo".to_string(), AssetType::Cash);
        config.forecast.seed = Some(7);
        config
    }

    #[test]
    fn test_end_to_end_processing() {
        let bundle = process_portfolio_history(config(), Arc::new(source())).unwrap();

        assert_eq!(bundle.range, Some((ym(2024, 1), ym(2024, 3))));
        assert_eq!(bundle.snapshots.len(), 3);
        assert_eq!(bundle.load_reports.len(), 1);
        assert_eq!(bundle.load_reports[0].rows_dropped, 1);
        assert_eq!(bundle.classification.classified_records, 3);

        assert_eq!(bundle.portfolio_metric(ym(2024, 2), "tpv"), Some(MetricValue::Defined(110.0)));
        assert_eq!(
            bundle.portfolio_metric(ym(2024, 2), "mom_return"),
            Some(MetricValue::Defined(0.0))
        );
        assert_eq!(
            bundle.portfolio_metric(ym(2024, 1), "mom_return"),
            Some(MetricValue::Undefined(UndefinedReason::NoPriorData))
        );
        assert!(!bundle
            .portfolio_metric(ym(2024, 3), "rolling_12m_volatility")
            .unwrap()
            .is_defined());

        assert_eq!(bundle.entity_metrics.len(), 1);
        assert_eq!(bundle.entity_metrics[0].asset_type, AssetType::Cash);
        assert!(bundle.pensions.is_empty());
        assert!(bundle.fleet.vehicles.is_empty());
        assert!(bundle.to_json().is_ok());
    }

    #[test]
    fn test_range_keeps_prior_month() {
        let processor = PortfolioHistoryProcessor::new(config()).unwrap();
        let data = processor.load(Arc::new(source())).unwrap();
        let bundle = processor.analyze_period(&data, "2024-03").unwrap();

        assert_eq!(bundle.snapshots.len(), 1);
        let mom = bundle.portfolio_metric(ym(2024, 3), "mom_return").unwrap();
        assert!((mom.value().unwrap() - 10.0 / 110.0).abs() < 1e-12);

        assert!(processor
            .analyze(&data, Some((ym(2024, 3), ym(2024, 1))))
            .is_err());
    }

    #[test]
    fn test_range_summaries_include_first_month_return() {
        let processor = PortfolioHistoryProcessor::new(config()).unwrap();
        let data = processor.load(Arc::new(source())).unwrap();
        let bundle = processor.analyze_period(&data, "2024-03").unwrap();

        assert_eq!(bundle.risk.observations, 1);
        let best = bundle.risk.best_month.unwrap();
        assert_eq!(best.month, ym(2024, 3));
        assert!((best.value - 10.0 / 110.0).abs() < 1e-12);
        assert_eq!(bundle.risk.positive_months, 1);
    }

    #[test]
    fn test_partial_ytd_is_reported() {
        let source = InMemorySource::new("sheet").with_table(RawTable::new(
            "Balance Sheet",
            &["Platform", "Asset", "Value", "Timestamp"],
            &[
                &["Monzo", "Current Account", "100", "2024-04-15"],
                &["Monzo", "Current Account", "110", "2024-06-15"],
            ],
        ));
        let bundle = process_portfolio_history(config(), Arc::new(source)).unwrap();

        let june = bundle.period_return(ym(2024, 6)).unwrap();
        let ytd = june.ytd.unwrap();
        assert!(ytd.is_partial);
        assert_eq!(ytd.baseline_month, ym(2024, 4));
        assert!((ytd.value - 0.1).abs() < 1e-12);

        // Q2 began in April, so its proper baseline (March) is missing as well
        assert!(june.qtd.unwrap().is_partial);
        assert!(june.is_partial());

        assert_eq!(
            bundle.portfolio_metric(ym(2024, 6), "ytd_return"),
            Some(MetricValue::Defined(ytd.value))
        );
        assert!(bundle.entity_metrics[0].period_returns[&ym(2024, 6)].is_partial());
        assert!(bundle.to_json().unwrap().contains("\"is_partial\": true"));
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let mut bad = config();
        bad.metrics.var_percentile = 1.5;
        assert!(matches!(
            PortfolioHistoryProcessor::new(bad),
            Err(PortfolioError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_balance_sheet_is_fatal() {
        let empty = InMemorySource::new("empty");
        let result = process_portfolio_history(config(), Arc::new(empty));
        assert!(matches!(result, Err(PortfolioError::SourceUnavailable(_))));
    }

    #[test]
    fn test_cached_analysis() {
        let processor = PortfolioHistoryProcessor::new(config()).unwrap();
        let data = processor.load(Arc::new(source())).unwrap();
        let cache = MetricsCache::new();

        let first = processor.analyze_cached(&cache, &data, None);
        let second = processor.analyze_cached(&cache, &data, None);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}

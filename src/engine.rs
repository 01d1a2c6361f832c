use crate::config::{ForwardFillPolicy, NormalizationConfig};
use crate::schema::*;
use crate::utils::months_in_range;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One value per month, ordered by month.
pub type MonthlyValues = BTreeMap<YearMonth, f64>;

/// Builds the de-duplicated monthly grid from raw snapshot records.
///
/// Within an entity-month the record with the latest timestamp wins. When two
/// records share that timestamp the one appearing later in the input wins.
pub struct Normalizer {
    policy: ForwardFillPolicy,
}

// Winning observation for one entity-month
#[derive(Debug, Clone)]
struct MonthSlot {
    value: f64,
    token_amount: Option<f64>,
    asset_type: AssetType,
    timestamp: chrono::NaiveDate,
}

type ObservationGrid = BTreeMap<EntityId, BTreeMap<YearMonth, MonthSlot>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationReport {
    pub input_records: usize,
    /// Records skipped because their value was not finite.
    pub rejected_records: usize,
    /// Records discarded because a later record covered the same entity-month.
    pub duplicates_collapsed: usize,
    pub entities: usize,
    pub observed_points: usize,
    pub imputed_points: usize,
    pub first_month: Option<YearMonth>,
    pub last_month: Option<YearMonth>,
}

impl Normalizer {
    pub fn new(policy: ForwardFillPolicy) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &NormalizationConfig) -> Self {
        Self::new(config.forward_fill)
    }

    pub fn policy(&self) -> ForwardFillPolicy {
        self.policy
    }

    pub fn normalize(&self, records: &[SnapshotRecord]) -> Vec<MonthlySeriesPoint> {
        self.normalize_with_report(records).0
    }

    pub fn normalize_with_report(
        &self,
        records: &[SnapshotRecord],
    ) -> (Vec<MonthlySeriesPoint>, NormalizationReport) {
        let mut report = NormalizationReport {
            input_records: records.len(),
            ..Default::default()
        };

        let grid = select_observations(records, &mut report);

        let global_end = grid
            .values()
            .filter_map(|months| months.keys().next_back())
            .max()
            .copied();

        let mut points = Vec::new();
        for (entity_id, observed) in &grid {
            let series = self.densify_entity(entity_id, observed, global_end);
            points.extend(series);
        }

        report.entities = grid.len();
        report.observed_points = points.iter().filter(|p| !p.is_imputed).count();
        report.imputed_points = points.len() - report.observed_points;
        report.first_month = points.iter().map(|p| p.year_month).min();
        report.last_month = points.iter().map(|p| p.year_month).max();

        info!(
            "Normalized {} records into {} monthly points for {} entities ({} imputed, {} duplicates collapsed)",
            report.input_records,
            points.len(),
            report.entities,
            report.imputed_points,
            report.duplicates_collapsed
        );

        (points, report)
    }

    fn densify_entity(
        &self,
        entity_id: &EntityId,
        observed: &BTreeMap<YearMonth, MonthSlot>,
        global_end: Option<YearMonth>,
    ) -> Vec<MonthlySeriesPoint> {
        let (Some(first), Some(last)) = (observed.keys().next(), observed.keys().next_back())
        else {
            return Vec::new();
        };

        let end = match (self.policy, global_end) {
            (ForwardFillPolicy::CarryToPresent, Some(g)) if g > *last => g,
            _ => *last,
        };

        let mut series = Vec::new();
        let mut carried: Option<&MonthSlot> = None;

        for (held, month) in months_in_range(*first, end).into_iter().enumerate() {
            let (slot, is_imputed) = match observed.get(&month) {
                Some(slot) => {
                    carried = Some(slot);
                    (slot, false)
                }
                // The range starts at the first observation, so a prior value always exists.
                None => match carried {
                    Some(slot) => (slot, true),
                    None => continue,
                },
            };

            series.push(MonthlySeriesPoint {
                entity_id: entity_id.clone(),
                asset_type: slot.asset_type,
                year_month: month,
                value: slot.value,
                token_amount: slot.token_amount,
                is_imputed,
                months_held: held as u32,
            });
        }

        debug!(
            "{}: {} months from {} to {}",
            entity_id,
            series.len(),
            first,
            end
        );

        series
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(ForwardFillPolicy::default())
    }
}

fn select_observations(records: &[SnapshotRecord], report: &mut NormalizationReport) -> ObservationGrid {
    let mut grid: ObservationGrid = BTreeMap::new();

    for record in records {
        if !record.value.is_finite() {
            warn!(
                "Skipping non-finite value for {} on {}",
                record.entity_id(),
                record.timestamp
            );
            report.rejected_records += 1;
            continue;
        }

        let months = grid.entry(record.entity_id()).or_default();
        let candidate = MonthSlot {
            value: record.value,
            token_amount: record.token_amount,
            asset_type: record.asset_type,
            timestamp: record.timestamp,
        };

        match months.get_mut(&record.year_month()) {
            Some(existing) => {
                report.duplicates_collapsed += 1;
                // `>=` lets the later input row win a timestamp tie.
                if candidate.timestamp >= existing.timestamp {
                    *existing = candidate;
                }
            }
            None => {
                months.insert(record.year_month(), candidate);
            }
        }
    }

    grid
}

pub fn normalize(records: &[SnapshotRecord], config: &NormalizationConfig) -> Vec<MonthlySeriesPoint> {
    Normalizer::from_config(config).normalize(records)
}

/// Turns each point back into a month-end record.
pub fn to_snapshot_records(points: &[MonthlySeriesPoint]) -> Vec<SnapshotRecord> {
    points
        .iter()
        .map(|p| SnapshotRecord {
            platform: p.entity_id.platform.clone(),
            asset_name: p.entity_id.asset_name.clone(),
            asset_type: p.asset_type,
            value: p.value,
            timestamp: p.year_month.last_day(),
            token_amount: p.token_amount,
        })
        .collect()
}

/// One snapshot per month across the whole observed range. Months in which no
/// entity holds a point total zero.
pub fn build_portfolio_snapshots(points: &[MonthlySeriesPoint]) -> Vec<PortfolioMonthlySnapshot> {
    let (Some(start), Some(end)) = (
        points.iter().map(|p| p.year_month).min(),
        points.iter().map(|p| p.year_month).max(),
    ) else {
        return Vec::new();
    };

    let mut by_month: BTreeMap<YearMonth, Vec<&MonthlySeriesPoint>> = BTreeMap::new();
    for point in points {
        by_month.entry(point.year_month).or_default().push(point);
    }

    months_in_range(start, end)
        .into_iter()
        .map(|month| {
            let members = by_month.get(&month).map(Vec::as_slice).unwrap_or(&[]);

            let mut subtotals: BTreeMap<AssetType, f64> = BTreeMap::new();
            let mut platforms = BTreeSet::new();
            let mut assets = BTreeSet::new();
            for p in members {
                *subtotals.entry(p.asset_type).or_insert(0.0) += p.value;
                platforms.insert(p.entity_id.platform.as_str());
                assets.insert(&p.entity_id);
            }

            PortfolioMonthlySnapshot {
                year_month: month,
                total_value: members.iter().map(|p| p.value).sum(),
                platform_count: platforms.len(),
                asset_count: assets.len(),
                imputed_count: members.iter().filter(|p| p.is_imputed).count(),
                subtotals,
            }
        })
        .collect()
}

pub fn group_by_entity(points: &[MonthlySeriesPoint]) -> BTreeMap<EntityId, Vec<MonthlySeriesPoint>> {
    let mut grouped: BTreeMap<EntityId, Vec<MonthlySeriesPoint>> = BTreeMap::new();
    for point in points {
        grouped
            .entry(point.entity_id.clone())
            .or_default()
            .push(point.clone());
    }
    for series in grouped.values_mut() {
        series.sort_by_key(|p| p.year_month);
    }
    grouped
}

/// Keeps points inside `[start, end]`.
pub fn filter_months(
    points: &[MonthlySeriesPoint],
    start: YearMonth,
    end: YearMonth,
) -> Vec<MonthlySeriesPoint> {
    points
        .iter()
        .filter(|p| p.year_month >= start && p.year_month <= end)
        .cloned()
        .collect()
}

pub fn entity_values(points: &[MonthlySeriesPoint]) -> BTreeMap<EntityId, MonthlyValues> {
    let mut out: BTreeMap<EntityId, MonthlyValues> = BTreeMap::new();
    for point in points {
        out.entry(point.entity_id.clone())
            .or_default()
            .insert(point.year_month, point.value);
    }
    out
}

pub fn portfolio_values(snapshots: &[PortfolioMonthlySnapshot]) -> MonthlyValues {
    snapshots
        .iter()
        .map(|s| (s.year_month, s.total_value))
        .collect()
}

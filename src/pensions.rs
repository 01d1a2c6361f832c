use crate::engine::MonthlyValues;
use crate::metrics::{MetricValue, UndefinedReason};
use crate::schema::{CashflowRecord, CashflowType, EntityId, MonthlySeriesPoint, YearMonth};
use crate::utils::months_in_range;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PensionSummary {
    pub entity_id: EntityId,
    pub total_contributions: f64,
    pub total_fees: f64,
    pub total_transfers: f64,
    /// Flows with an unrecognised type. Reported, not netted.
    pub other_flows: f64,
    /// Contributions plus transfers in, less fees.
    pub net_contributions: f64,
    pub latest_month: Option<YearMonth>,
    pub latest_value: MetricValue,
    /// Latest value minus net contributions.
    pub investment_growth: MetricValue,
    pub growth_percentage: MetricValue,
    /// Running net contributions at each month end.
    pub cumulative_net_contributions: MonthlyValues,
    /// Value minus running net contributions, for months with a value.
    pub growth_series: MonthlyValues,
}

fn net_effect(record: &CashflowRecord) -> f64 {
    match record.cashflow_type {
        CashflowType::Contribution | CashflowType::Transfer => record.value,
        CashflowType::Fee => -record.value.abs(),
        CashflowType::Other(_) => 0.0,
    }
}

/// Summarizes every pension that has either cashflows or valuation points.
pub fn pension_summaries(
    cashflows: &[CashflowRecord],
    points: &[MonthlySeriesPoint],
) -> Vec<PensionSummary> {
    let mut flows: BTreeMap<EntityId, Vec<&CashflowRecord>> = BTreeMap::new();
    for record in cashflows {
        flows.entry(record.entity_id()).or_default().push(record);
    }

    let mut values: BTreeMap<EntityId, MonthlyValues> = BTreeMap::new();
    for point in points {
        values
            .entry(point.entity_id.clone())
            .or_default()
            .insert(point.year_month, point.value);
    }

    let ids: BTreeSet<EntityId> = flows.keys().chain(values.keys()).cloned().collect();
    let empty_values = MonthlyValues::new();

    ids.into_iter()
        .map(|id| {
            let records = flows.get(&id).map(Vec::as_slice).unwrap_or(&[]);
            let series = values.get(&id).unwrap_or(&empty_values);
            summarize(id, records, series)
        })
        .collect()
}

fn summarize(entity_id: EntityId, records: &[&CashflowRecord], values: &MonthlyValues) -> PensionSummary {
    let sum_of = |kind: fn(&CashflowType) -> bool| -> f64 {
        records
            .iter()
            .filter(|r| kind(&r.cashflow_type))
            .map(|r| r.value)
            .sum()
    };

    let total_contributions = sum_of(|t| matches!(t, CashflowType::Contribution));
    let total_fees = records
        .iter()
        .filter(|r| r.cashflow_type == CashflowType::Fee)
        .map(|r| r.value.abs())
        .sum::<f64>();
    let total_transfers = sum_of(|t| matches!(t, CashflowType::Transfer));
    let other_flows = sum_of(|t| matches!(t, CashflowType::Other(_)));
    let net_contributions = total_contributions + total_transfers - total_fees;

    let mut monthly_net: BTreeMap<YearMonth, f64> = BTreeMap::new();
    for r in records {
        *monthly_net.entry(YearMonth::from_date(r.timestamp)).or_insert(0.0) += net_effect(r);
    }

    let first = monthly_net.keys().chain(values.keys()).min().copied();
    let last = monthly_net.keys().chain(values.keys()).max().copied();

    let mut cumulative_net_contributions = MonthlyValues::new();
    if let (Some(first), Some(last)) = (first, last) {
        let mut running = 0.0;
        for month in months_in_range(first, last) {
            running += monthly_net.get(&month).copied().unwrap_or(0.0);
            cumulative_net_contributions.insert(month, running);
        }
    }

    let growth_series: MonthlyValues = values
        .iter()
        .map(|(month, value)| {
            let paid_in = cumulative_net_contributions.get(month).copied().unwrap_or(0.0);
            (*month, value - paid_in)
        })
        .collect();

    let latest = values.iter().next_back().map(|(m, v)| (*m, *v));
    let latest_value = latest.map_or(
        MetricValue::Undefined(UndefinedReason::EmptyCohort),
        |(_, v)| MetricValue::Defined(v),
    );
    let investment_growth = latest_value.map(|v| v - net_contributions);
    let growth_percentage = match investment_growth {
        MetricValue::Defined(_) if net_contributions == 0.0 => {
            MetricValue::Undefined(UndefinedReason::ZeroDenominator)
        }
        growth => growth.map(|g| g / net_contributions * 100.0),
    };

    debug!(
        "Pension {}: {} cashflows, net contributions {:.2}",
        entity_id,
        records.len(),
        net_contributions
    );

    PensionSummary {
        entity_id,
        total_contributions,
        total_fees,
        total_transfers,
        other_flows,
        net_contributions,
        latest_month: latest.map(|(m, _)| m),
        latest_value,
        investment_growth,
        growth_percentage,
        cumulative_net_contributions,
        growth_series,
    }
}

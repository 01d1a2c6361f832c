use crate::engine::{MonthlyValues, Normalizer};
use crate::forecasting::{linear_trend_forecast, ForecastPoint, TrendForecast};
use crate::metrics::{MetricResult, MetricValue, UndefinedReason};
use crate::schema::{
    AssetType, LoanStatus, SnapshotRecord, VehicleExpenseRecord, VehiclePaymentRecord,
    VehicleStateRecord, YearMonth,
};
use crate::utils::{mean, months_in_range};
use chrono::Datelike;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const VEHICLE_PLATFORM: &str = "Vehicles";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleSummary {
    pub asset_name: String,
    pub latest_month: YearMonth,
    pub car_value: f64,
    pub loan_balance: f64,
    pub loan_status: Option<LoanStatus>,
    pub equity: f64,
    pub equity_percentage: MetricValue,
    pub latest_mileage: Option<f64>,
    pub ytd_mileage: MetricValue,
    pub total_payments: f64,
    pub latest_loan_payment: Option<f64>,
    pub total_expenses: f64,
    pub expenses_by_type: BTreeMap<String, f64>,
    pub latest_month_expenses: f64,
    pub latest_month_combined_cost: f64,
    pub ytd_cost_per_mile: MetricValue,
    pub total_cost_of_ownership: f64,
    /// Equity less everything paid towards the car.
    pub net_position: f64,
    /// First recorded value minus latest value.
    pub depreciation: f64,
    pub value_series: MonthlyValues,
    pub equity_series: MonthlyValues,
    pub value_forecast: MetricResult<TrendForecast>,
    pub cost_forecast: MetricResult<Vec<ForecastPoint>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSummary {
    pub vehicles: Vec<VehicleSummary>,
    pub total_car_value: f64,
    pub total_loan_balance: f64,
    pub total_equity: f64,
    pub total_ytd_mileage: f64,
}

impl FleetSummary {
    pub fn vehicle_names(&self) -> Vec<&str> {
        self.vehicles.iter().map(|v| v.asset_name.as_str()).collect()
    }
}

fn as_monthly(states: &[&VehicleStateRecord], value: impl Fn(&VehicleStateRecord) -> f64) -> MonthlyValues {
    let records: Vec<SnapshotRecord> = states
        .iter()
        .map(|s| SnapshotRecord {
            platform: VEHICLE_PLATFORM.to_string(),
            asset_name: s.asset_name.clone(),
            asset_type: AssetType::Vehicle,
            value: value(*s),
            timestamp: s.timestamp,
            token_amount: None,
        })
        .collect();

    Normalizer::default()
        .normalize(&records)
        .into_iter()
        .map(|p| (p.year_month, p.value))
        .collect()
}

/// Mileage driven this calendar year. The baseline is the last reading of an
/// earlier year, or failing that the first reading of this year.
fn ytd_mileage(states: &[&VehicleStateRecord]) -> MetricResult<f64> {
    let readings: Vec<(chrono::NaiveDate, f64)> = states
        .iter()
        .filter_map(|s| s.mileage.map(|m| (s.timestamp, m)))
        .collect();
    let (latest_date, latest) = *readings.last().ok_or(UndefinedReason::EmptyCohort)?;
    let year = latest_date.year();

    let baseline = readings
        .iter()
        .rev()
        .find(|(d, _)| d.year() < year)
        .or_else(|| readings.iter().find(|(d, _)| d.year() == year))
        .map(|(d, m)| (*d, *m))
        .ok_or(UndefinedReason::NoPriorData)?;

    if baseline.0 == latest_date {
        return Err(UndefinedReason::NoPriorData);
    }
    Ok(latest - baseline.1)
}

fn monthly_totals(entries: impl Iterator<Item = (YearMonth, f64)>) -> BTreeMap<YearMonth, f64> {
    let mut totals = BTreeMap::new();
    for (month, amount) in entries {
        *totals.entry(month).or_insert(0.0) += amount;
    }
    totals
}

/// Average monthly spend over the months from the first to the last expense,
/// projected flat.
fn cost_forecast(expenses: &[&VehicleExpenseRecord], horizon: u32) -> MetricResult<Vec<ForecastPoint>> {
    let totals = monthly_totals(
        expenses
            .iter()
            .map(|e| (YearMonth::from_date(e.timestamp), e.amount)),
    );
    let (first, last) = match (totals.keys().next(), totals.keys().next_back()) {
        (Some(f), Some(l)) => (*f, *l),
        _ => return Err(UndefinedReason::EmptyCohort),
    };

    let per_month: Vec<f64> = months_in_range(first, last)
        .iter()
        .map(|m| totals.get(m).copied().unwrap_or(0.0))
        .collect();
    let average = mean(&per_month).ok_or(UndefinedReason::EmptyCohort)?;

    Ok((1..=horizon)
        .map(|h| ForecastPoint {
            year_month: last.plus_months(h),
            value: average,
        })
        .collect())
}

fn summarize(
    name: &str,
    states: Vec<&VehicleStateRecord>,
    payments: Vec<&VehiclePaymentRecord>,
    expenses: Vec<&VehicleExpenseRecord>,
    horizon: u32,
) -> Option<VehicleSummary> {
    let latest = *states.last()?;
    let first = *states.first()?;
    let year = latest.timestamp.year();

    let equity = latest.car_value - latest.loan_balance;
    let equity_percentage = if latest.car_value > 0.0 {
        MetricValue::Defined(equity / latest.car_value * 100.0)
    } else {
        MetricValue::Undefined(UndefinedReason::ZeroDenominator)
    };

    let total_payments: f64 = payments.iter().map(|p| p.payment_amount).sum();
    let latest_loan_payment = payments.last().map(|p| p.payment_amount);

    let mut expenses_by_type: BTreeMap<String, f64> = BTreeMap::new();
    for e in &expenses {
        *expenses_by_type.entry(e.expense_type.clone()).or_insert(0.0) += e.amount;
    }
    let total_expenses: f64 = expenses.iter().map(|e| e.amount).sum();

    let expense_months = monthly_totals(
        expenses
            .iter()
            .map(|e| (YearMonth::from_date(e.timestamp), e.amount)),
    );
    let latest_month_expenses = expense_months.values().next_back().copied().unwrap_or(0.0);

    let ytd_miles = ytd_mileage(&states);
    let ytd_costs: f64 = payments
        .iter()
        .filter(|p| p.timestamp.year() == year)
        .map(|p| p.payment_amount)
        .chain(
            expenses
                .iter()
                .filter(|e| e.timestamp.year() == year)
                .map(|e| e.amount),
        )
        .sum();
    let ytd_cost_per_mile = match ytd_miles {
        Ok(miles) if miles > 0.0 => MetricValue::Defined(ytd_costs / miles),
        Ok(_) => MetricValue::Undefined(UndefinedReason::ZeroDenominator),
        Err(reason) => MetricValue::Undefined(reason),
    };

    let value_series = as_monthly(&states, |s| s.car_value);

    Some(VehicleSummary {
        asset_name: name.to_string(),
        latest_month: YearMonth::from_date(latest.timestamp),
        car_value: latest.car_value,
        loan_balance: latest.loan_balance,
        loan_status: latest.loan_status,
        equity,
        equity_percentage,
        latest_mileage: states.iter().rev().find_map(|s| s.mileage),
        ytd_mileage: ytd_miles.into(),
        total_payments,
        latest_loan_payment,
        total_expenses,
        expenses_by_type,
        latest_month_expenses,
        latest_month_combined_cost: latest_loan_payment.unwrap_or(0.0) + latest_month_expenses,
        ytd_cost_per_mile,
        total_cost_of_ownership: total_payments + total_expenses,
        net_position: equity - total_payments,
        depreciation: first.car_value - latest.car_value,
        value_forecast: linear_trend_forecast(&value_series, horizon),
        value_series,
        equity_series: as_monthly(&states, |s| s.car_value - s.loan_balance),
        cost_forecast: cost_forecast(&expenses, horizon),
    })
}

/// Builds per-vehicle metrics and fleet totals from the three vehicle feeds.
pub fn fleet_summary(
    states: &[VehicleStateRecord],
    payments: &[VehiclePaymentRecord],
    expenses: &[VehicleExpenseRecord],
    horizon: u32,
) -> FleetSummary {
    let names: BTreeSet<&str> = states.iter().map(|s| s.asset_name.as_str()).collect();

    let vehicles: Vec<VehicleSummary> = names
        .into_iter()
        .filter_map(|name| {
            let mut own_states: Vec<&VehicleStateRecord> =
                states.iter().filter(|s| s.asset_name == name).collect();
            own_states.sort_by_key(|s| s.timestamp);
            let mut own_payments: Vec<&VehiclePaymentRecord> =
                payments.iter().filter(|p| p.asset_name == name).collect();
            own_payments.sort_by_key(|p| p.timestamp);
            let mut own_expenses: Vec<&VehicleExpenseRecord> =
                expenses.iter().filter(|e| e.asset_name == name).collect();
            own_expenses.sort_by_key(|e| e.timestamp);

            summarize(name, own_states, own_payments, own_expenses, horizon)
        })
        .collect();

    info!("Summarized {} vehicles", vehicles.len());

    FleetSummary {
        total_car_value: vehicles.iter().map(|v| v.car_value).sum(),
        total_loan_balance: vehicles.iter().map(|v| v.loan_balance).sum(),
        total_equity: vehicles.iter().map(|v| v.equity).sum(),
        total_ytd_mileage: vehicles.iter().filter_map(|v| v.ytd_mileage.value()).sum(),
        vehicles,
    }
}

use crate::engine::MonthlyValues;
use crate::metrics::{MetricResult, MetricValue, UndefinedReason};
use crate::schema::{AssetType, EntityId, MonthlySeriesPoint, PortfolioMonthlySnapshot, YearMonth};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Share of the portfolio held by one entity in `month`.
pub fn weight(
    entities: &BTreeMap<EntityId, MonthlyValues>,
    entity: &EntityId,
    month: YearMonth,
) -> MetricValue {
    let total = total_at(entities, month);
    let Some(value) = entities.get(entity).and_then(|v| v.get(&month)) else {
        return MetricValue::Undefined(UndefinedReason::EmptyCohort);
    };
    if total == 0.0 {
        MetricValue::Undefined(UndefinedReason::ZeroDenominator)
    } else {
        MetricValue::Defined(value / total)
    }
}

fn total_at(entities: &BTreeMap<EntityId, MonthlyValues>, month: YearMonth) -> f64 {
    entities.values().filter_map(|v| v.get(&month)).sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityContribution {
    pub entity_id: EntityId,
    /// Weight at the end of the previous month.
    pub prior_weight: MetricValue,
    pub asset_return: MetricValue,
    pub contribution: f64,
    /// The entity entered or left the portfolio this month, or its prior value was zero.
    /// Its contribution is its value change over the prior portfolio total.
    pub is_flow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionBreakdown {
    pub month: YearMonth,
    pub portfolio_return: f64,
    pub entities: Vec<EntityContribution>,
    /// Sum of contributions minus the portfolio return.
    pub residual: f64,
}

impl ContributionBreakdown {
    pub fn reconciles(&self, tolerance: f64) -> bool {
        self.residual.abs() < tolerance
    }
}

/// Splits the portfolio return for `month` into per-entity contributions,
/// `weight(i, m-1) * return(i, m)`, so that they sum to the portfolio return.
pub fn contributions(
    entities: &BTreeMap<EntityId, MonthlyValues>,
    month: YearMonth,
) -> MetricResult<ContributionBreakdown> {
    let prior = month.pred();
    let active: Vec<(&EntityId, Option<f64>, Option<f64>)> = entities
        .iter()
        .map(|(id, values)| (id, values.get(&prior).copied(), values.get(&month).copied()))
        .filter(|(_, before, after)| before.is_some() || after.is_some())
        .collect();

    if active.is_empty() {
        return Err(UndefinedReason::EmptyCohort);
    }
    if active.iter().all(|(_, before, _)| before.is_none()) {
        return Err(UndefinedReason::NoPriorData);
    }

    let total_prior = total_at(entities, prior);
    let total_now = total_at(entities, month);
    if total_prior == 0.0 {
        return Err(UndefinedReason::ZeroBaseline);
    }
    let portfolio_return = (total_now - total_prior) / total_prior;

    let breakdown: Vec<EntityContribution> = active
        .into_iter()
        .map(|(id, before, after)| match (before, after) {
            (Some(b), Some(a)) if b != 0.0 => {
                let w = b / total_prior;
                let r = (a - b) / b;
                EntityContribution {
                    entity_id: id.clone(),
                    prior_weight: MetricValue::Defined(w),
                    asset_return: MetricValue::Defined(r),
                    contribution: w * r,
                    is_flow: false,
                }
            }
            _ => {
                let b = before.unwrap_or(0.0);
                let a = after.unwrap_or(0.0);
                EntityContribution {
                    entity_id: id.clone(),
                    prior_weight: match before {
                        Some(v) => MetricValue::Defined(v / total_prior),
                        None => MetricValue::Undefined(UndefinedReason::NoPriorData),
                    },
                    asset_return: MetricValue::Undefined(if before.is_some() {
                        UndefinedReason::ZeroBaseline
                    } else {
                        UndefinedReason::NoPriorData
                    }),
                    contribution: (a - b) / total_prior,
                    is_flow: true,
                }
            }
        })
        .collect();

    let residual = breakdown.iter().map(|c| c.contribution).sum::<f64>() - portfolio_return;

    Ok(ContributionBreakdown {
        month,
        portfolio_return,
        entities: breakdown,
        residual,
    })
}

/// Share of the total held in each asset type.
pub fn allocation(snapshot: &PortfolioMonthlySnapshot) -> BTreeMap<AssetType, MetricValue> {
    snapshot
        .subtotals
        .iter()
        .map(|(asset_type, subtotal)| {
            let share = if snapshot.total_value == 0.0 {
                MetricValue::Undefined(UndefinedReason::ZeroDenominator)
            } else {
                MetricValue::Defined(subtotal / snapshot.total_value)
            };
            (*asset_type, share)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcentrationSummary {
    pub month: YearMonth,
    pub entity_count: usize,
    pub herfindahl_index: f64,
    pub effective_number_of_assets: f64,
    pub largest_entity: EntityId,
    pub largest_weight: f64,
    pub top_five_weight: f64,
}

/// Concentration of positive holdings in `month`. Liabilities and empty
/// positions are left out of the weights.
pub fn concentration(points: &[MonthlySeriesPoint], month: YearMonth) -> MetricResult<ConcentrationSummary> {
    let holdings: Vec<(&EntityId, f64)> = points
        .iter()
        .filter(|p| p.year_month == month && p.value > 0.0)
        .map(|p| (&p.entity_id, p.value))
        .collect();

    let total: f64 = holdings.iter().map(|(_, v)| v).sum();
    if holdings.is_empty() || total == 0.0 {
        return Err(UndefinedReason::EmptyCohort);
    }

    let mut weights: Vec<(&EntityId, f64)> = holdings.iter().map(|(id, v)| (*id, v / total)).collect();
    weights.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let herfindahl: f64 = weights.iter().map(|(_, w)| w * w).sum();
    let (largest_entity, largest_weight) = weights[0];

    Ok(ConcentrationSummary {
        month,
        entity_count: weights.len(),
        herfindahl_index: herfindahl,
        effective_number_of_assets: 1.0 / herfindahl,
        largest_entity: largest_entity.clone(),
        largest_weight,
        top_five_weight: weights.iter().take(5).map(|(_, w)| w).sum(),
    })
}

use crate::error::{PortfolioError, Result};
use chrono::{Datelike, Days, NaiveDate};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub enum AssetType {
    #[schemars(description = "Current accounts, savings accounts and other cash balances")]
    Cash,

    #[schemars(description = "Brokerage holdings, funds and crypto positions")]
    Investments,

    #[schemars(description = "Workplace and personal pension pots (SIPP, defined contribution)")]
    Pensions,

    #[schemars(description = "Real estate holdings")]
    Property,

    #[schemars(description = "Cars and other vehicles, valued net of any finance")]
    Vehicle,

    #[schemars(description = "Fallback bucket for pairs with no classification rule")]
    Other,
}

impl AssetType {
    pub fn label(&self) -> &'static str {
        match self {
            AssetType::Cash => "Cash",
            AssetType::Investments => "Investments",
            AssetType::Pensions => "Pensions",
            AssetType::Property => "Property",
            AssetType::Vehicle => "Vehicle",
            AssetType::Other => "Other",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A calendar month. Serialized as `"YYYY-MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(PortfolioError::DateError(format!(
                "Month {} out of range for year {}",
                month, year
            )));
        }
        Ok(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// 1-based calendar quarter.
    pub fn quarter(&self) -> u32 {
        (self.month - 1) / 3 + 1
    }

    pub fn succ(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn pred(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn plus_months(&self, months: u32) -> Self {
        let index = self.ordinal() + months as i64;
        Self::from_ordinal(index)
    }

    pub fn minus_months(&self, months: u32) -> Self {
        Self::from_ordinal(self.ordinal() - months as i64)
    }

    /// Signed number of months from `self` to `other` (positive when `other` is later).
    pub fn months_until(&self, other: YearMonth) -> i64 {
        other.ordinal() - self.ordinal()
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .expect("YearMonth always holds a valid month")
    }

    pub fn last_day(&self) -> NaiveDate {
        self.succ()
            .first_day()
            .checked_sub_days(Days::new(1))
            .expect("the first of a month always has a predecessor")
    }

    /// December of the previous calendar year.
    pub fn prior_year_end(&self) -> Self {
        Self {
            year: self.year - 1,
            month: 12,
        }
    }

    /// Last month of the previous calendar quarter.
    pub fn prior_quarter_end(&self) -> Self {
        let quarter_start = (self.quarter() - 1) * 3 + 1;
        Self {
            year: self.year,
            month: quarter_start,
        }
        .pred()
    }

    fn ordinal(&self) -> i64 {
        self.year as i64 * 12 + (self.month as i64 - 1)
    }

    fn from_ordinal(ordinal: i64) -> Self {
        Self {
            year: ordinal.div_euclid(12) as i32,
            month: ordinal.rem_euclid(12) as u32 + 1,
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = PortfolioError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (year, month) = trimmed.split_once('-').ok_or_else(|| {
            PortfolioError::DateError(format!("Invalid month '{}'. Expected YYYY-MM", s))
        })?;
        let year: i32 = year.parse().map_err(|_| {
            PortfolioError::DateError(format!("Invalid year in '{}'. Expected YYYY-MM", s))
        })?;
        let month: u32 = month.parse().map_err(|_| {
            PortfolioError::DateError(format!("Invalid month in '{}'. Expected YYYY-MM", s))
        })?;
        YearMonth::new(year, month)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identity of a tracked asset: the (platform, asset name) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub platform: String,
    pub asset_name: String,
}

impl EntityId {
    pub fn new(platform: impl Into<String>, asset_name: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            asset_name: asset_name.into(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.platform, self.asset_name)
    }
}

/// One observed value for an entity at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub platform: String,
    pub asset_name: String,
    pub asset_type: AssetType,
    /// May be negative for liabilities such as loan balances.
    pub value: f64,
    pub timestamp: NaiveDate,
    pub token_amount: Option<f64>,
}

impl SnapshotRecord {
    pub fn entity_id(&self) -> EntityId {
        EntityId::new(self.platform.clone(), self.asset_name.clone())
    }

    pub fn year_month(&self) -> YearMonth {
        YearMonth::from_date(self.timestamp)
    }
}

/// One entity's value for one calendar month after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySeriesPoint {
    pub entity_id: EntityId,
    pub asset_type: AssetType,
    pub year_month: YearMonth,
    pub value: f64,
    pub token_amount: Option<f64>,
    /// True when the value was carried forward rather than observed.
    pub is_imputed: bool,
    /// 0-based index of this month from the entity's first observed month.
    pub months_held: u32,
}

/// Aggregate across all entities for one month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioMonthlySnapshot {
    pub year_month: YearMonth,
    pub total_value: f64,
    pub platform_count: usize,
    pub asset_count: usize,
    pub imputed_count: usize,
    pub subtotals: BTreeMap<AssetType, f64>,
}

impl PortfolioMonthlySnapshot {
    pub fn subtotal(&self, asset_type: AssetType) -> f64 {
        self.subtotals.get(&asset_type).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum CashflowType {
    #[schemars(description = "Money paid into the pension by the holder or employer")]
    Contribution,
    #[schemars(description = "Platform or fund charges deducted from the pot")]
    Fee,
    #[schemars(description = "Money moved between pension providers")]
    Transfer,
    #[schemars(description = "Any other cashflow label found in the sheet")]
    Other(String),
}

impl CashflowType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "contribution" | "contributions" => CashflowType::Contribution,
            "fee" | "fees" | "charge" => CashflowType::Fee,
            "transfer" | "transfer in" => CashflowType::Transfer,
            _ => CashflowType::Other(raw.trim().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashflowRecord {
    pub platform: String,
    pub asset_name: String,
    pub value: f64,
    pub timestamp: NaiveDate,
    pub cashflow_type: CashflowType,
    pub description: Option<String>,
}

impl CashflowRecord {
    pub fn entity_id(&self) -> EntityId {
        EntityId::new(self.platform.clone(), self.asset_name.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum LoanStatus {
    Financed,
    Owned,
}

impl LoanStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "financed" => Some(LoanStatus::Financed),
            "owned" => Some(LoanStatus::Owned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleStateRecord {
    pub timestamp: NaiveDate,
    pub asset_name: String,
    pub car_value: f64,
    pub loan_balance: f64,
    pub loan_status: Option<LoanStatus>,
    pub mileage: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePaymentRecord {
    pub timestamp: NaiveDate,
    pub asset_name: String,
    pub payment_amount: f64,
    pub payment_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleExpenseRecord {
    pub timestamp: NaiveDate,
    pub asset_name: String,
    pub amount: f64,
    pub expense_type: String,
}

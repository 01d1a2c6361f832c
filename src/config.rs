use crate::error::{PortfolioError, Result};
use crate::ingestion::{AllowedValues, TableSpec};
use crate::schema::AssetType;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DashboardConfig {
    #[schemars(
        description = "Identity of the data source (e.g. spreadsheet id). Used as part of metric cache keys."
    )]
    #[serde(default = "default_source_id")]
    pub source_id: String,

    #[serde(default)]
    pub classification: ClassificationConfig,

    #[serde(default)]
    pub normalization: NormalizationConfig,

    #[serde(default)]
    pub metrics: MetricParams,

    #[serde(default)]
    pub forecast: ForecastParams,

    #[serde(default)]
    pub loader: LoaderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ClassificationConfig {
    #[schemars(
        description = "Exact platform name to asset type (e.g. 'IBKR' -> Investments). Checked first."
    )]
    #[serde(default)]
    pub platform_rules: BTreeMap<String, AssetType>,

    #[schemars(
        description = "Exact asset name to asset type (e.g. 'Wahed SIPP' -> Pensions). Checked when no platform rule matches."
    )]
    #[serde(default)]
    pub asset_rules: BTreeMap<String, AssetType>,

    #[schemars(
        description = "Case-insensitive substring rules, evaluated in order against the asset name and then the platform."
    )]
    #[serde(default)]
    pub substring_rules: Vec<SubstringRule>,

    #[schemars(description = "Category for pairs that match no rule. Defaults to Other.")]
    #[serde(default = "default_asset_type")]
    pub default_type: AssetType,

    #[schemars(
        description = "Asset types that at least one rule must map to. Configuration fails validation otherwise."
    )]
    #[serde(default)]
    pub required_types: Vec<AssetType>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubstringRule {
    #[schemars(description = "Text to look for, compared case-insensitively")]
    pub pattern: String,
    pub asset_type: AssetType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ForwardFillPolicy {
    #[default]
    #[schemars(
        description = "An entity's series ends at its own last observed month. Exited assets drop out of later totals."
    )]
    StopAtLastObservation,

    #[schemars(
        description = "Carry every entity forward to the last month observed anywhere in the dataset."
    )]
    CarryToPresent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NormalizationConfig {
    #[serde(default)]
    pub forward_fill: ForwardFillPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MetricParams {
    #[schemars(description = "Rolling window sizes in months (e.g. [3, 6, 12])")]
    #[serde(default = "default_rolling_windows")]
    pub rolling_windows: Vec<u32>,

    #[schemars(
        description = "Lower-tail fraction for empirical Value at Risk. 0.05 means the 5th percentile."
    )]
    #[serde(default = "default_var_percentile")]
    pub var_percentile: f64,

    #[schemars(description = "Minimum number of monthly returns before VaR is reported")]
    #[serde(default = "default_var_min_samples")]
    pub var_min_samples: usize,

    #[schemars(
        description = "Minimum acceptable monthly return used for downside deviation (Sortino). Default 0."
    )]
    #[serde(default)]
    pub minimum_acceptable_return: f64,

    #[schemars(description = "Annual risk-free rate used for Sharpe excess returns")]
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,

    #[schemars(description = "Months of history required for seasonality statistics")]
    #[serde(default = "default_seasonality_min_months")]
    pub seasonality_min_months: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMethod {
    #[default]
    #[schemars(description = "Resample historical monthly returns with replacement")]
    Bootstrap,
    #[schemars(description = "Draw from a normal distribution fitted to historical returns")]
    FittedNormal,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ForecastParams {
    #[serde(default = "default_paths")]
    pub paths: usize,

    #[serde(default = "default_horizon")]
    pub horizon_months: u32,

    #[schemars(description = "Percentile bands to report, as strictly increasing fractions")]
    #[serde(default = "default_bands")]
    pub bands: Vec<f64>,

    #[serde(default)]
    pub sampling: SamplingMethod,

    #[schemars(description = "Seed for reproducible simulations. Random when omitted.")]
    #[serde(default)]
    pub seed: Option<u64>,

    #[schemars(description = "Minimum number of historical monthly returns required")]
    #[serde(default = "default_min_history")]
    pub min_history: usize,

    #[serde(default = "default_moving_average_window")]
    pub moving_average_window: usize,

    #[schemars(description = "Smoothing factor for exponential smoothing, in (0, 1]")]
    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f64,

    #[schemars(description = "Stress levels applied to mean (reduced) and volatility (inflated)")]
    #[serde(default = "default_stress_levels")]
    pub stress_levels: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LoaderConfig {
    #[schemars(description = "Hard timeout when contacting the external data source")]
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[schemars(
        description = "Allowed values per table name, then per column (e.g. \"Car Assets\" -> Loan_Status). Unknown values raise warnings only."
    )]
    #[serde(default)]
    pub allowed_values: BTreeMap<String, AllowedValues>,
}

static NO_ALLOWED_VALUES: AllowedValues = BTreeMap::new();

impl LoaderConfig {
    pub fn allowed_for(&self, table: &str) -> &AllowedValues {
        self.allowed_values.get(table).unwrap_or(&NO_ALLOWED_VALUES)
    }
}

fn default_source_id() -> String {
    "default".to_string()
}

fn default_asset_type() -> AssetType {
    AssetType::Other
}

fn default_rolling_windows() -> Vec<u32> {
    vec![3, 6, 12]
}

fn default_var_percentile() -> f64 {
    0.05
}

fn default_var_min_samples() -> usize {
    12
}

fn default_risk_free_rate() -> f64 {
    0.05
}

fn default_seasonality_min_months() -> usize {
    12
}

fn default_paths() -> usize {
    1000
}

fn default_horizon() -> u32 {
    12
}

fn default_bands() -> Vec<f64> {
    vec![0.10, 0.50, 0.90]
}

fn default_min_history() -> usize {
    12
}

fn default_moving_average_window() -> usize {
    3
}

fn default_smoothing_alpha() -> f64 {
    0.3
}

fn default_stress_levels() -> Vec<f64> {
    vec![0.1, 0.2, 0.3]
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            platform_rules: BTreeMap::new(),
            asset_rules: BTreeMap::new(),
            substring_rules: Vec::new(),
            default_type: default_asset_type(),
            required_types: Vec::new(),
        }
    }
}

impl Default for MetricParams {
    fn default() -> Self {
        Self {
            rolling_windows: default_rolling_windows(),
            var_percentile: default_var_percentile(),
            var_min_samples: default_var_min_samples(),
            minimum_acceptable_return: 0.0,
            risk_free_rate: default_risk_free_rate(),
            seasonality_min_months: default_seasonality_min_months(),
        }
    }
}

impl Default for ForecastParams {
    fn default() -> Self {
        Self {
            paths: default_paths(),
            horizon_months: default_horizon(),
            bands: default_bands(),
            sampling: SamplingMethod::default(),
            seed: None,
            min_history: default_min_history(),
            moving_average_window: default_moving_average_window(),
            smoothing_alpha: default_smoothing_alpha(),
            stress_levels: default_stress_levels(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            allowed_values: BTreeMap::new(),
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            source_id: default_source_id(),
            classification: ClassificationConfig::default(),
            normalization: NormalizationConfig::default(),
            metrics: MetricParams::default(),
            forecast: ForecastParams::default(),
            loader: LoaderConfig::default(),
        }
    }
}

impl DashboardConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DashboardConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(DashboardConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }

    /// Checks every field and reports all problems at once.
    pub fn validate(&self) -> Result<()> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            debug!("Configuration for source '{}' is valid", self.source_id);
            Ok(())
        } else {
            Err(PortfolioError::InvalidConfig(errors))
        }
    }

    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.source_id.trim().is_empty() {
            errors.push("source_id must be a non-empty string".to_string());
        }

        self.validate_classification(&mut errors);
        self.validate_metrics(&mut errors);
        self.validate_forecast(&mut errors);

        self.validate_loader(&mut errors);

        errors
    }

    fn validate_loader(&self, errors: &mut Vec<String>) {
        let loader = &self.loader;

        if loader.timeout_seconds == 0 {
            errors.push("loader.timeout_seconds must be positive".to_string());
        }
        for (table, columns) in &loader.allowed_values {
            let Some(spec) = TableSpec::find(table) else {
                errors.push(format!("loader.allowed_values names unknown table '{}'", table));
                continue;
            };
            for column in columns.keys() {
                if !spec.has_column(column) {
                    errors.push(format!(
                        "loader.allowed_values: table '{}' has no column '{}'",
                        table, column
                    ));
                }
            }
        }
    }

    fn validate_classification(&self, errors: &mut Vec<String>) {
        let classification = &self.classification;

        for (idx, rule) in classification.substring_rules.iter().enumerate() {
            if rule.pattern.trim().is_empty() {
                errors.push(format!("substring rule #{} has an empty pattern", idx));
            }
        }
        for name in classification
            .platform_rules
            .keys()
            .chain(classification.asset_rules.keys())
        {
            if name.trim().is_empty() {
                errors.push("classification rules must not use an empty name".to_string());
                break;
            }
        }

        let mapped: BTreeSet<AssetType> = classification
            .platform_rules
            .values()
            .chain(classification.asset_rules.values())
            .copied()
            .chain(classification.substring_rules.iter().map(|r| r.asset_type))
            .collect();

        for required in &classification.required_types {
            if !mapped.contains(required) {
                errors.push(format!(
                    "required asset type {} is not targeted by any classification rule",
                    required
                ));
            }
        }
    }

    fn validate_metrics(&self, errors: &mut Vec<String>) {
        let metrics = &self.metrics;

        if metrics.rolling_windows.is_empty() {
            errors.push("metrics.rolling_windows must contain at least one window".to_string());
        }
        if metrics.rolling_windows.iter().any(|&w| w == 0) {
            errors.push("metrics.rolling_windows must all be positive".to_string());
        }
        let distinct: BTreeSet<u32> = metrics.rolling_windows.iter().copied().collect();
        if distinct.len() != metrics.rolling_windows.len() {
            errors.push("metrics.rolling_windows must not contain duplicates".to_string());
        }

        if !(metrics.var_percentile > 0.0 && metrics.var_percentile < 0.5) {
            errors.push(format!(
                "metrics.var_percentile {} must be in (0, 0.5)",
                metrics.var_percentile
            ));
        }
        if metrics.var_min_samples < 2 {
            errors.push("metrics.var_min_samples must be at least 2".to_string());
        }
        if !metrics.minimum_acceptable_return.is_finite() {
            errors.push("metrics.minimum_acceptable_return must be finite".to_string());
        }
        if !metrics.risk_free_rate.is_finite() || metrics.risk_free_rate < 0.0 {
            errors.push("metrics.risk_free_rate must be a non-negative number".to_string());
        }
        if metrics.seasonality_min_months == 0 {
            errors.push("metrics.seasonality_min_months must be positive".to_string());
        }
    }

    fn validate_forecast(&self, errors: &mut Vec<String>) {
        let forecast = &self.forecast;

        if forecast.paths == 0 {
            errors.push("forecast.paths must be positive".to_string());
        }
        if forecast.horizon_months == 0 {
            errors.push("forecast.horizon_months must be positive".to_string());
        }
        if forecast.bands.is_empty() {
            errors.push("forecast.bands must contain at least one percentile".to_string());
        }
        if forecast.bands.iter().any(|b| !(*b > 0.0 && *b < 1.0)) {
            errors.push("forecast.bands must all lie strictly between 0 and 1".to_string());
        }
        if forecast.bands.windows(2).any(|pair| pair[0] >= pair[1]) {
            errors.push("forecast.bands must be strictly increasing".to_string());
        }
        if forecast.min_history < 2 {
            errors.push("forecast.min_history must be at least 2".to_string());
        }
        if forecast.moving_average_window == 0 {
            errors.push("forecast.moving_average_window must be positive".to_string());
        }
        if !(forecast.smoothing_alpha > 0.0 && forecast.smoothing_alpha <= 1.0) {
            errors.push(format!(
                "forecast.smoothing_alpha {} must be in (0, 1]",
                forecast.smoothing_alpha
            ));
        }
        if forecast.stress_levels.iter().any(|s| !(*s >= 0.0 && *s < 1.0)) {
            errors.push("forecast.stress_levels must lie in [0, 1)".to_string());
        }
    }
}

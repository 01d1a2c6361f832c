use crate::error::Result;
use crate::schema::{AssetType, EntityId, MonthlySeriesPoint, YearMonth};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterEntry {
    pub entity_id: EntityId,
    pub first_month: YearMonth,
    pub latest_month: YearMonth,
    pub latest_value: f64,
    /// The latest value was carried forward rather than observed.
    pub is_imputed: bool,
}

/// Every tracked entity, grouped by asset type, with its latest value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRegister {
    pub as_of: Option<YearMonth>,
    pub sections: BTreeMap<AssetType, Vec<RegisterEntry>>,
}

impl AssetRegister {
    pub fn from_points(points: &[MonthlySeriesPoint]) -> Self {
        let mut latest: BTreeMap<&EntityId, (&MonthlySeriesPoint, YearMonth)> = BTreeMap::new();
        for point in points {
            latest
                .entry(&point.entity_id)
                .and_modify(|(last, first)| {
                    if point.year_month < *first {
                        *first = point.year_month;
                    }
                    if point.year_month >= last.year_month {
                        *last = point;
                    }
                })
                .or_insert((point, point.year_month));
        }

        let mut sections: BTreeMap<AssetType, Vec<RegisterEntry>> = BTreeMap::new();
        for (entity_id, (point, first_month)) in latest {
            sections.entry(point.asset_type).or_default().push(RegisterEntry {
                entity_id: entity_id.clone(),
                first_month,
                latest_month: point.year_month,
                latest_value: point.value,
                is_imputed: point.is_imputed,
            });
        }

        Self {
            as_of: points.iter().map(|p| p.year_month).max(),
            sections,
        }
    }

    pub fn total_entries(&self) -> usize {
        self.sections.values().map(Vec::len).sum()
    }

    /// Sum of latest values for entities still held in the final month.
    pub fn total_current_value(&self) -> f64 {
        self.entries()
            .filter(|e| Some(e.latest_month) == self.as_of)
            .map(|e| e.latest_value)
            .sum()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegisterEntry> {
        self.sections.values().flatten()
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record([
            "Asset Type",
            "Platform",
            "Asset",
            "First Month",
            "Latest Month",
            "Latest Value",
            "Imputed",
        ])?;

        for (asset_type, entries) in &self.sections {
            for entry in entries {
                writer.write_record([
                    asset_type.label().to_string(),
                    entry.entity_id.platform.clone(),
                    entry.entity_id.asset_name.clone(),
                    entry.first_month.to_string(),
                    entry.latest_month.to_string(),
                    format!("{:.2}", entry.latest_value),
                    entry.is_imputed.to_string(),
                ])?;
            }
        }

        let bytes = writer.into_inner().map_err(|e| e.into_error())?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        output.push_str("# Asset Register\n\n");
        if let Some(as_of) = self.as_of {
            output.push_str(&format!("**As of:** {}\n\n", as_of));
        }

        for (asset_type, entries) in &self.sections {
            let subtotal: f64 = entries
                .iter()
                .filter(|e| Some(e.latest_month) == self.as_of)
                .map(|e| e.latest_value)
                .sum();
            output.push_str(&format!("## {} ({:.2})\n\n", asset_type, subtotal));

            for entry in entries {
                let marker = if entry.is_imputed { " *(carried forward)*" } else { "" };
                let held = if Some(entry.latest_month) == self.as_of {
                    String::new()
                } else {
                    format!(" (last seen {})", entry.latest_month)
                };
                output.push_str(&format!(
                    "- {}: {:.2}{}{}\n",
                    entry.entity_id, entry.latest_value, held, marker
                ));
            }
            output.push('\n');
        }

        output
    }
}

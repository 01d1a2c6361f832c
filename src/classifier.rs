use crate::config::ClassificationConfig;
use crate::schema::{AssetType, EntityId, SnapshotRecord};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Which rule produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedRule {
    Platform,
    Asset,
    AssetSubstring,
    PlatformSubstring,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub asset_type: AssetType,
    pub rule: MatchedRule,
}

/// Maps (platform, asset) pairs to an asset type.
///
/// Lookup order is exact platform, exact asset, asset substring, platform
/// substring, then the configured default. Substring rules are tried in
/// configuration order and compared case-insensitively.
#[derive(Debug, Clone)]
pub struct AssetClassifier {
    platform_rules: BTreeMap<String, AssetType>,
    asset_rules: BTreeMap<String, AssetType>,
    substring_rules: Vec<(String, AssetType)>,
    default_type: AssetType,
}

impl AssetClassifier {
    pub fn from_config(config: &ClassificationConfig) -> Self {
        Self {
            platform_rules: config
                .platform_rules
                .iter()
                .map(|(k, v)| (k.trim().to_string(), *v))
                .collect(),
            asset_rules: config
                .asset_rules
                .iter()
                .map(|(k, v)| (k.trim().to_string(), *v))
                .collect(),
            substring_rules: config
                .substring_rules
                .iter()
                .map(|r| (r.pattern.trim().to_lowercase(), r.asset_type))
                .collect(),
            default_type: config.default_type,
        }
    }

    pub fn classify(&self, platform: &str, asset_name: &str) -> AssetType {
        self.classify_with_rule(platform, asset_name).asset_type
    }

    pub fn classify_with_rule(&self, platform: &str, asset_name: &str) -> Classification {
        let platform = platform.trim();
        let asset_name = asset_name.trim();

        if let Some(t) = self.platform_rules.get(platform) {
            return Classification {
                asset_type: *t,
                rule: MatchedRule::Platform,
            };
        }
        if let Some(t) = self.asset_rules.get(asset_name) {
            return Classification {
                asset_type: *t,
                rule: MatchedRule::Asset,
            };
        }

        let asset_lower = asset_name.to_lowercase();
        if let Some((_, t)) = self
            .substring_rules
            .iter()
            .find(|(pattern, _)| asset_lower.contains(pattern.as_str()))
        {
            return Classification {
                asset_type: *t,
                rule: MatchedRule::AssetSubstring,
            };
        }

        let platform_lower = platform.to_lowercase();
        if let Some((_, t)) = self
            .substring_rules
            .iter()
            .find(|(pattern, _)| platform_lower.contains(pattern.as_str()))
        {
            return Classification {
                asset_type: *t,
                rule: MatchedRule::PlatformSubstring,
            };
        }

        Classification {
            asset_type: self.default_type,
            rule: MatchedRule::Default,
        }
    }

    /// Assigns an asset type to every record. Each distinct unmapped pair is
    /// warned about once, however many rows carry it.
    pub fn classify_records(
        &self,
        records: &[SnapshotRecord],
    ) -> (Vec<SnapshotRecord>, ClassificationReport) {
        let mut report = ClassificationReport {
            total_records: records.len(),
            ..Default::default()
        };
        let mut unmapped: BTreeSet<EntityId> = BTreeSet::new();

        let classified = records
            .iter()
            .map(|record| {
                let classification =
                    self.classify_with_rule(&record.platform, &record.asset_name);

                *report
                    .type_distribution
                    .entry(classification.asset_type)
                    .or_insert(0) += 1;

                if classification.rule == MatchedRule::Default {
                    report.unclassified_records += 1;
                    let id = record.entity_id();
                    if !unmapped.contains(&id) {
                        warn!(
                            "No classification rule for {}; using {}",
                            id, classification.asset_type
                        );
                        unmapped.insert(id);
                    }
                } else {
                    report.classified_records += 1;
                }

                SnapshotRecord {
                    asset_type: classification.asset_type,
                    ..record.clone()
                }
            })
            .collect();

        report.unmapped_pairs = unmapped.into_iter().collect();
        debug!(
            "Classified {} of {} records",
            report.classified_records, report.total_records
        );

        (classified, report)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub total_records: usize,
    pub classified_records: usize,
    /// Records that fell through to the default type.
    pub unclassified_records: usize,
    pub unmapped_pairs: Vec<EntityId>,
    pub type_distribution: BTreeMap<AssetType, usize>,
}

impl ClassificationReport {
    /// Share of records matched by an explicit rule, in percent. `None` without records.
    pub fn classification_rate(&self) -> Option<f64> {
        if self.total_records == 0 {
            None
        } else {
            Some(self.classified_records as f64 / self.total_records as f64 * 100.0)
        }
    }

    pub fn recommendations(&self) -> Vec<String> {
        let mut out = Vec::new();

        if self.unclassified_records > 0 {
            out.push(format!(
                "Review {} unclassified records across {} platform/asset pairs and add classification rules for them",
                self.unclassified_records,
                self.unmapped_pairs.len()
            ));
        }

        if self.classification_rate().is_some_and(|rate| rate < 90.0) {
            out.push("Consider adding more classification rules to improve coverage".to_string());
        }

        for asset_type in [AssetType::Cash, AssetType::Investments, AssetType::Pensions] {
            if !self.type_distribution.contains_key(&asset_type) {
                out.push(format!(
                    "No records classified as {} - verify classification rules",
                    asset_type
                ));
            }
        }

        out
    }
}

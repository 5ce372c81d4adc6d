//! Category rule table for the symptom-tracker export.
//!
//! Every category found in the export is looked up here by exact name. The
//! mode decides how the normalizer reshapes its rows; only `Map` carries
//! extra parameters.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const COUNT_RETAIN_CATEGORY: &str = "Bowel Movements";
pub const COUNT_RETAIN_DETAIL: &str = "Number_Bowel_Movements";

pub type FactorMap = BTreeMap<String, BTreeMap<String, i64>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransformMode {
    Map {
        #[serde(default)]
        factors: FactorMap,
    },
    Symptom,
    EnergyMood,
    CountRetain,
    Remove,
    Preserve,
}

impl TransformMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Map { .. } => "map",
            Self::Symptom => "symptom",
            Self::EnergyMood => "energy_mood",
            Self::CountRetain => "count_retain",
            Self::Remove => "remove",
            Self::Preserve => "preserve",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    #[serde(flatten)]
    pub mode: TransformMode,
}

impl CategoryRule {
    pub fn new(category: impl Into<String>, mode: TransformMode) -> Self {
        Self {
            category: category.into(),
            mode,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("duplicate rule for category '{0}'")]
    DuplicateCategory(String),
    #[error("rule category must not be blank")]
    BlankCategory,
    #[error("failed to read rule file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid rule JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuleTable {
    rules: BTreeMap<String, TransformMode>,
}

impl RuleTable {
    pub fn new(rules: impl IntoIterator<Item = CategoryRule>) -> Result<Self, RuleError> {
        let mut out = BTreeMap::new();
        for rule in rules {
            if rule.category.trim().is_empty() {
                return Err(RuleError::BlankCategory);
            }
            if out.contains_key(&rule.category) {
                return Err(RuleError::DuplicateCategory(rule.category));
            }
            out.insert(rule.category, rule.mode);
        }
        Ok(Self { rules: out })
    }

    pub fn get(&self, category: &str) -> Option<&TransformMode> {
        self.rules.get(category)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    pub fn bearable_default() -> Self {
        let amount = levels(&[("None", 0), ("Little", 1), ("Moderate", 2), ("A lot", 3)]);
        let intensity = levels(&[("None", 0), ("Low", 1), ("Moderate", 2), ("High", 3)]);
        let portion = levels(&[("Little", 1), ("Moderate", 2), ("A Lot", 3)]);

        let lifestyle = factors(&[
            ("Work", &amount),
            ("Stress", &amount),
            ("Time Outside", &amount),
            ("Screen Time", &amount),
        ]);
        let social = factors(&[
            ("Sociability level", &amount),
            (
                "Social interaction quality",
                &levels(&[("Poor", 1), ("OK", 2), ("Good", 3)]),
            ),
        ]);

        let rules = vec![
            CategoryRule::new("Lifestyle", TransformMode::Map { factors: lifestyle }),
            CategoryRule::new(
                "Active",
                TransformMode::Map {
                    factors: factors(&[("Activity level", &intensity)]),
                },
            ),
            CategoryRule::new("Social", TransformMode::Map { factors: social }),
            CategoryRule::new(
                "Weather",
                TransformMode::Map {
                    factors: factors(&[("Active level", &intensity)]),
                },
            ),
            CategoryRule::new("Creative", TransformMode::Map { factors: FactorMap::new() }),
            CategoryRule::new("Symptom", TransformMode::Symptom),
            CategoryRule::new("Sleep", TransformMode::Map { factors: FactorMap::new() }),
            CategoryRule::new("Sleep quality", TransformMode::EnergyMood),
            CategoryRule::new(
                "Nutrition",
                TransformMode::Map {
                    factors: factors(&[("Sugar", &portion), ("Protein", &portion)]),
                },
            ),
            CategoryRule::new("Mood", TransformMode::EnergyMood),
            CategoryRule::new("Energy", TransformMode::EnergyMood),
            CategoryRule::new("Heart Measurements", TransformMode::Remove),
            CategoryRule::new("Med/Supplements", TransformMode::Preserve),
            CategoryRule::new("Bowel Movements", TransformMode::CountRetain),
            CategoryRule::new("Gratitudes", TransformMode::Remove),
        ];

        let mut table = BTreeMap::new();
        for rule in rules {
            table.insert(rule.category, rule.mode);
        }
        Self { rules: table }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, RuleError> {
        let rules: Vec<CategoryRule> = serde_json::from_str(raw)?;
        Self::new(rules)
    }

    pub fn from_path(path: &Path) -> Result<Self, RuleError> {
        let raw = fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::from_json_str(&raw)?;
        info!(
            component = "rules",
            event = "rules.loaded",
            path = %path.display(),
            rule_count = table.len()
        );
        Ok(table)
    }
}

fn levels(entries: &[(&str, i64)]) -> BTreeMap<String, i64> {
    entries
        .iter()
        .map(|(label, score)| ((*label).to_string(), *score))
        .collect()
}

fn factors(entries: &[(&str, &BTreeMap<String, i64>)]) -> FactorMap {
    entries
        .iter()
        .map(|(name, levels)| ((*name).to_string(), (*levels).clone()))
        .collect()
}

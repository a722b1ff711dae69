//! # Run Configuration
//!
//! Everything the pipeline used to read from an import-time global lives here and
//! is injected explicitly: feature exclusion lists per dataset, the ECG feature
//! list, prefill values, the columns that never enter the feature matrix, the
//! diagnosis-to-label scheme, and the network's feature-group layout.
//!
//! The file format is TOML. Every section has a default so a run can start with
//! no configuration file at all.

use crate::error::CascadeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// How an operating point is chosen from held-out scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdMethod {
    /// Most stringent cutoff whose true-positive rate reaches the target.
    Tpr,
    /// `Tpr` on complemented labels and scores: targets the true-negative rate.
    Tprn,
    /// Cutoff maximising `TPR - FPR`.
    Youden,
}

/// Where the held-out in-bag scores come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitMethod {
    /// Stratified k-fold cross-validation over every in-bag row.
    Cv,
    /// Fit on `train` rows, score the `val` rows.
    Fixed,
}

/// Which imaging/ECG feature families stay in the feature matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AngioOrEcg {
    Angio,
    Ecg,
    None,
    Both,
}

macro_rules! impl_option_enum {
    ($ty:ty, $label:literal, { $($text:literal => $variant:path),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = CascadeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok($variant),)+
                    other => Err(CascadeError::Configuration(format!(
                        "unknown {} '{}' (expected one of: {})",
                        $label,
                        other,
                        [$($text),+].join(", ")
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let text = match self {
                    $($variant => $text,)+
                };
                f.write_str(text)
            }
        }
    };
}

impl_option_enum!(ThresholdMethod, "threshold_method", {
    "tpr" => ThresholdMethod::Tpr,
    "tprn" => ThresholdMethod::Tprn,
    "youden" => ThresholdMethod::Youden,
});

impl_option_enum!(SplitMethod, "split_method", {
    "cv" => SplitMethod::Cv,
    "fixed" => SplitMethod::Fixed,
});

impl_option_enum!(AngioOrEcg, "angio_or_ecg", {
    "angio" => AngioOrEcg::Angio,
    "ecg" => AngioOrEcg::Ecg,
    "none" => AngioOrEcg::None,
    "both" => AngioOrEcg::Both,
});

/// Per-dataset feature lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureLists {
    /// Columns removed before anything else happens, keyed by dataset name.
    #[serde(default)]
    pub exclude: HashMap<String, Vec<String>>,
    /// ECG-derived columns, keyed by dataset name.
    #[serde(default)]
    pub ecg: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefillSection {
    /// Value substituted for missing entries, keyed by column name.
    #[serde(default)]
    pub all: HashMap<String, f64>,
}

/// Columns with a fixed role in the raw table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRoles {
    /// Identifier, raw-measurement and bookkeeping columns that never become features.
    pub drop: Vec<String>,
    pub angiogram: String,
    pub diagnosis: String,
}

impl Default for ColumnRoles {
    fn default() -> Self {
        let mut drop: Vec<String> = ["idPatient", "cohort_id", "supercell_id", "subjectid"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        drop.extend((0..6).map(|i| format!("trop{i}")));
        drop.extend((0..6).map(|i| format!("time_trop{i}")));
        drop.extend(
            ["adjudicatorDiagnosis", "set", "set0", "dataset", "event_dmi30d"]
                .iter()
                .map(|s| s.to_string()),
        );
        Self {
            drop,
            angiogram: "angiogram".to_string(),
            diagnosis: "adjudicatorDiagnosis".to_string(),
        }
    }
}

/// Maps a categorical diagnosis onto the two cascade levels.
///
/// A row is level-1 positive unless its category is listed in `level1_negative`,
/// and level-2 positive iff its category is listed in `level2_positive`.
/// Numeric label columns are read as ordinal codes instead: `y1 = v >= 1`,
/// `y2 = v >= 2`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelScheme {
    pub level1_negative: Vec<String>,
    pub level2_positive: Vec<String>,
    /// Diagnoses kept by the "normal and chronic only" population filters.
    pub normal_and_chronic: Vec<String>,
}

impl Default for LabelScheme {
    fn default() -> Self {
        Self {
            level1_negative: vec!["Normal".to_string()],
            level2_positive: vec!["T1MI".to_string()],
            normal_and_chronic: vec!["Normal".to_string(), "Chronic".to_string()],
        }
    }
}

impl LabelScheme {
    pub fn validate(&self) -> Result<(), CascadeError> {
        if let Some(both) = self
            .level2_positive
            .iter()
            .find(|c| self.level1_negative.contains(c))
        {
            return Err(CascadeError::Configuration(format!(
                "diagnosis '{both}' is both level-1 negative and level-2 positive"
            )));
        }
        Ok(())
    }
}

/// One named group of the network's flat input vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLength {
    pub name: String,
    pub length: usize,
}

/// Network section: the ordered feature-group lengths and the active heads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSection {
    pub data_version: u32,
    #[serde(default = "default_luke_multiplier")]
    pub luke_multiplier: usize,
    pub use_luke: bool,
    /// Declared order is the storage order of the flat vector.
    pub groups: Vec<GroupLength>,
    /// Classification heads and their class counts (`outl1`, `outl2`, `out3c`, `out5`).
    #[serde(default)]
    pub cls_cols: Vec<(String, usize)>,
    #[serde(default)]
    pub binary_cls_cols: Vec<String>,
    #[serde(default)]
    pub regression_cols: Vec<String>,
    #[serde(default)]
    pub seed: u64,
}

fn default_luke_multiplier() -> usize {
    100
}

/// The top-level configuration object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CascadeConfig {
    #[serde(default)]
    pub features: FeatureLists,
    #[serde(default)]
    pub prefill: PrefillSection,
    #[serde(default)]
    pub columns: ColumnRoles,
    #[serde(default)]
    pub labels: LabelScheme,
    #[serde(default)]
    pub network: Option<NetworkSection>,
}

impl CascadeConfig {
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.labels.validate()?;
        log::info!("Loaded configuration from '{}'", path.display());
        Ok(config)
    }

    /// Columns excluded for `dataset`; an unknown dataset has no exclusions.
    pub fn excluded(&self, dataset: &str) -> &[String] {
        self.features
            .exclude
            .get(dataset)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn ecg_features(&self, dataset: &str) -> &[String] {
        self.features
            .ecg
            .get(dataset)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Full list of columns kept out of the feature matrix for one run.
    ///
    /// The label column is always retained, even when it appears in a drop list.
    pub fn drop_list(
        &self,
        dataset: &str,
        angio_or_ecg: AngioOrEcg,
        label_name: &str,
    ) -> Vec<String> {
        let mut drop = self.columns.drop.clone();
        let ecg = self.ecg_features(dataset);
        match angio_or_ecg {
            AngioOrEcg::Angio => drop.extend_from_slice(ecg),
            AngioOrEcg::Ecg => drop.push(self.columns.angiogram.clone()),
            AngioOrEcg::None => {
                drop.push(self.columns.angiogram.clone());
                drop.extend_from_slice(ecg);
            }
            AngioOrEcg::Both => {}
        }
        drop.retain(|c| c != label_name);
        drop
    }
}

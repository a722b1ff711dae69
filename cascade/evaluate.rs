//! # Out-of-Bag Evaluation
//!
//! Scores every boot's held-out population with its own cascade and aggregates
//! four views across boots:
//!
//! - level-1 accuracy against `y1`;
//! - the composed decision `y1_pred * y2_pred` against `y2`;
//! - the composed decision against `y2`, restricted to rows with `y1 == 1`;
//! - the 3-way class built from both decisions against `y1 + y2`, reported both
//!   raw and class-balanced.
//!
//! A level-2 positive is meaningless once level 1 rules a patient out, so the
//! `(0, 1)` decision pair always maps to class 0.

use crate::bootstrap::BootArtifact;
use crate::classifier::Classifier;
use crate::config::LabelScheme;
use crate::error::{BootContext, BootStage, CascadeError};
use crate::labels::get_label;
use crate::threshold::rates;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, Zip};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const N_CLASSES: usize = 3;

/// Maps a pair of level decisions to the ordinal 3-way class.
pub fn compose_three_way(y1_pred: u8, y2_pred: u8) -> u8 {
    match (y1_pred, y2_pred) {
        (0, _) => 0,
        (_, 0) => 1,
        _ => 2,
    }
}

pub fn compose_three_way_all(y1_pred: ArrayView1<u8>, y2_pred: ArrayView1<u8>) -> Array1<u8> {
    Zip::from(y1_pred)
        .and(y2_pred)
        .map_collect(|&a, &b| compose_three_way(a, b))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewScore {
    pub correct: usize,
    pub total: usize,
    pub accuracy: f64,
}

impl ViewScore {
    pub fn from_predictions(truth: ArrayView1<u8>, predicted: ArrayView1<u8>) -> Self {
        let correct = Zip::from(truth)
            .and(predicted)
            .fold(0usize, |acc, &t, &p| acc + usize::from(t == p));
        let total = truth.len();
        let accuracy = if total == 0 {
            f64::NAN
        } else {
            correct as f64 / total as f64
        };
        Self {
            correct,
            total,
            accuracy,
        }
    }
}

/// Row-normalised 3x3 confusion matrix (rows are true classes) and the mean of
/// its diagonal over the classes present in `truth`.
pub fn normalized_confusion(
    truth: ArrayView1<u8>,
    predicted: ArrayView1<u8>,
) -> (Array2<f64>, f64) {
    let mut counts = Array2::<f64>::zeros((N_CLASSES, N_CLASSES));
    Zip::from(truth).and(predicted).for_each(|&t, &p| {
        counts[[usize::from(t), usize::from(p)]] += 1.0;
    });

    let mut diagonal_sum = 0.0;
    let mut present = 0usize;
    for (class, mut row) in counts.rows_mut().into_iter().enumerate() {
        let total = row.sum();
        if total > 0.0 {
            row /= total;
            diagonal_sum += row[class];
            present += 1;
        }
    }
    let balanced = if present == 0 {
        f64::NAN
    } else {
        diagonal_sum / present as f64
    };
    (counts, balanced)
}

/// Everything measured on one boot's out-of-bag population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootMetrics {
    pub boot: usize,
    pub thresh1: f64,
    pub thresh2: f64,
    pub normalized_accuracy: f64,
    /// `[L1-, L1+, L1+ & L2-, L1+ & L2+]` on the out-of-bag rows.
    pub census: [usize; 4],
    pub level1: ViewScore,
    pub composed: ViewScore,
    /// Absent when the boot has no level-1 positive rows.
    pub level2_conditional: Option<ViewScore>,
    pub three_way: ViewScore,
    pub confusion: Vec<[f64; N_CLASSES]>,
}

/// Mean and population standard deviation of one metric across boots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub std: f64,
    pub n: usize,
}

impl MetricSummary {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            std: variance.sqrt(),
            n: values.len(),
        })
    }
}

/// Aggregated statistics over all boots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub label_name: String,
    pub n_boots: usize,
    pub level1_accuracy: MetricSummary,
    pub composed_accuracy: MetricSummary,
    pub level2_conditional_accuracy: Option<MetricSummary>,
    pub three_way_accuracy: MetricSummary,
    pub normalized_accuracy: MetricSummary,
    pub thresh1: MetricSummary,
    pub thresh2: MetricSummary,
    /// Elementwise mean of the per-boot normalised confusion matrices.
    pub mean_confusion: Vec<[f64; N_CLASSES]>,
    pub boots: Vec<BootMetrics>,
}

impl EvaluationReport {
    pub fn from_boots(label_name: &str, boots: Vec<BootMetrics>) -> Result<Self, CascadeError> {
        let collect =
            |f: &dyn Fn(&BootMetrics) -> f64| -> Vec<f64> { boots.iter().map(f).collect() };
        let summarize = |values: Vec<f64>, what: &str| {
            MetricSummary::from_values(&values).ok_or_else(|| {
                CascadeError::InvalidInput(format!("no boots to aggregate for {what}"))
            })
        };

        let conditional: Vec<f64> = boots
            .iter()
            .filter_map(|b| b.level2_conditional.map(|v| v.accuracy))
            .collect();

        let mut mean_confusion = vec![[0.0; N_CLASSES]; N_CLASSES];
        for boot in &boots {
            for (sum_row, row) in mean_confusion.iter_mut().zip(boot.confusion.iter()) {
                for (sum, value) in sum_row.iter_mut().zip(row.iter()) {
                    *sum += value;
                }
            }
        }
        if !boots.is_empty() {
            for row in mean_confusion.iter_mut() {
                for value in row.iter_mut() {
                    *value /= boots.len() as f64;
                }
            }
        }

        Ok(Self {
            label_name: label_name.to_string(),
            n_boots: boots.len(),
            level1_accuracy: summarize(collect(&|b| b.level1.accuracy), "level-1 accuracy")?,
            composed_accuracy: summarize(collect(&|b| b.composed.accuracy), "composed accuracy")?,
            level2_conditional_accuracy: MetricSummary::from_values(&conditional),
            three_way_accuracy: summarize(collect(&|b| b.three_way.accuracy), "3-way accuracy")?,
            normalized_accuracy: summarize(
                collect(&|b| b.normalized_accuracy),
                "normalized accuracy",
            )?,
            thresh1: summarize(collect(&|b| b.thresh1), "level-1 thresholds")?,
            thresh2: summarize(collect(&|b| b.thresh2), "level-2 thresholds")?,
            mean_confusion,
            boots,
        })
    }

    pub fn log_summary(&self) {
        let line = |name: &str, m: &MetricSummary| {
            log::info!("{:<28} {:.4} +/- {:.4} (n = {})", name, m.mean, m.std, m.n);
        };
        log::info!("Summary over {} boots for '{}':", self.n_boots, self.label_name);
        line("L1 accuracy", &self.level1_accuracy);
        line("L1&L2 accuracy", &self.composed_accuracy);
        match &self.level2_conditional_accuracy {
            Some(m) => line("L2 accuracy given L1+", m),
            None => log::warn!("L2 accuracy given L1+ is undefined in every boot"),
        }
        line("3-way accuracy", &self.three_way_accuracy);
        line("3-way normalized accuracy", &self.normalized_accuracy);
        line("thresh1", &self.thresh1);
        line("thresh2", &self.thresh2);
        for (class, row) in self.mean_confusion.iter().enumerate() {
            log::info!(
                "confusion[{}] = [{}]",
                class,
                row.iter().map(|v| format!("{v:.4}")).join(", ")
            );
        }
    }

    /// Writes the report as TOML, creating parent directories as needed.
    pub fn write_toml(&self, path: &Path) -> Result<(), CascadeError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        log::info!("Wrote evaluation summary to '{}'", path.display());
        Ok(())
    }
}

/// Evaluates boot artifacts against their out-of-bag populations.
#[derive(Debug, Clone)]
pub struct CascadeEvaluator<'a> {
    scheme: &'a LabelScheme,
    /// When set, out-of-bag tables are written under `outbags_{label}/`.
    output_dir: Option<PathBuf>,
}

impl<'a> CascadeEvaluator<'a> {
    pub fn new(scheme: &'a LabelScheme) -> Self {
        Self {
            scheme,
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn out_of_bag_path(&self, label_name: &str, boot: usize) -> Option<PathBuf> {
        self.output_dir.as_ref().map(|dir| {
            dir.join(format!("outbags_{label_name}"))
                .join(format!("out_bag{boot}.csv"))
        })
    }

    pub fn evaluate_boot<M: Classifier>(
        &self,
        artifact: &BootArtifact<M>,
    ) -> Result<BootMetrics, CascadeError> {
        let boot = artifact.boot;
        let table = &artifact.out_of_bag;
        let truth = get_label(table, self.scheme).at_stage(boot, BootStage::Evaluation)?;
        let output = artifact
            .model
            .infer(table)
            .at_stage(boot, BootStage::Evaluation)?;

        let census = truth.census();
        log::info!(
            "Boot {}: out-of-bag census [L1-:L1+:L2-:L2+] = [{}:{}:{}:{}]",
            boot,
            census[0],
            census[1],
            census[2],
            census[3]
        );

        let (tpr1, fpr1) = rates(truth.y1.view(), output.y1_pred.view());
        let (tpr2, fpr2) = rates(truth.y2.view(), output.y2_pred.view());
        log::debug!(
            "Boot {}: level 1 TPR {:.4} FPR {:.4}; level 2 TPR {:.4} FPR {:.4}",
            boot,
            tpr1,
            fpr1,
            tpr2,
            fpr2
        );

        let composed_pred = &output.y1_pred * &output.y2_pred;
        let level1 = ViewScore::from_predictions(truth.y1.view(), output.y1_pred.view());
        let composed = ViewScore::from_predictions(truth.y2.view(), composed_pred.view());

        let positives: Vec<usize> = truth
            .y1
            .iter()
            .enumerate()
            .filter(|&(_, &y)| y == 1)
            .map(|(i, _)| i)
            .collect();
        let level2_conditional = if positives.is_empty() {
            log::warn!(
                "Boot {}: no level-1 positive rows out of bag; skipping the L2-conditional view",
                boot
            );
            None
        } else {
            let subset = truth.select(&positives);
            let predicted: Array1<u8> = positives.iter().map(|&i| composed_pred[i]).collect();
            Some(ViewScore::from_predictions(subset.y2.view(), predicted.view()))
        };

        let truth3 = truth.three_way();
        let pred3 = compose_three_way_all(output.y1_pred.view(), output.y2_pred.view());
        let three_way = ViewScore::from_predictions(truth3.view(), pred3.view());
        let (confusion, normalized_accuracy) = normalized_confusion(truth3.view(), pred3.view());

        for (name, view) in [("L1", &level1), ("L1&L2", &composed), ("3-way", &three_way)] {
            log::info!(
                "Boot {}: {} correct {}/{} accuracy {:.4}",
                boot,
                name,
                view.correct,
                view.total,
                view.accuracy
            );
        }
        if let Some(view) = &level2_conditional {
            log::info!(
                "Boot {}: L2 given L1+ correct {}/{} accuracy {:.4}",
                boot,
                view.correct,
                view.total,
                view.accuracy
            );
        }

        if let Some(path) = self.out_of_bag_path(&table.label_name, boot) {
            table
                .write_csv(&path)
                .at_stage(boot, BootStage::Persistence)?;
        }

        Ok(BootMetrics {
            boot,
            thresh1: output.thresh1,
            thresh2: output.thresh2,
            normalized_accuracy,
            census,
            level1,
            composed,
            level2_conditional,
            three_way,
            confusion: confusion
                .rows()
                .into_iter()
                .map(|row| [row[0], row[1], row[2]])
                .collect(),
        })
    }

    /// Evaluates every artifact and aggregates across boots.
    pub fn evaluate<M: Classifier>(
        &self,
        artifacts: &[BootArtifact<M>],
    ) -> Result<EvaluationReport, CascadeError> {
        let label_name = artifacts
            .first()
            .map(|a| a.out_of_bag.label_name.clone())
            .unwrap_or_default();
        let metrics = artifacts
            .iter()
            .map(|artifact| self.evaluate_boot(artifact))
            .collect::<Result<Vec<_>, _>>()?;
        EvaluationReport::from_boots(&label_name, metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{LabelColumn, PatientTable};
    use crate::inference::{CascadeModel, FittedLevel};
    use crate::threshold::{Orientation, ThresholdRule};
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayView2, array};

    #[derive(Debug)]
    struct ColumnScore(usize);

    impl Classifier for ColumnScore {
        fn n_features(&self) -> usize {
            2
        }

        fn predict_proba(&self, features: ArrayView2<f64>) -> Result<Array1<f64>, CascadeError> {
            Ok(features.column(self.0).to_owned())
        }
    }

    fn out_of_bag() -> PatientTable {
        let diagnosis = ["Normal", "Normal", "Chronic", "T1MI", "T1MI", "T2MI"];
        let features = array![
            [0.2, 0.1],
            [0.3, 0.9],
            [0.7, 0.2],
            [0.8, 0.6],
            [0.4, 0.7],
            [0.9, 0.8]
        ];
        PatientTable::new(
            vec!["s1".to_string(), "s2".to_string()],
            features,
            "adjudicatorDiagnosis",
            LabelColumn::Categorical(diagnosis.iter().map(|s| s.to_string()).collect()),
            None,
        )
        .unwrap()
    }

    fn artifact(
        boot: usize,
        thresh1: f64,
        thresh2: f64,
        table: PatientTable,
    ) -> BootArtifact<ColumnScore> {
        BootArtifact {
            boot,
            model: CascadeModel {
                level1: FittedLevel {
                    classifier: ColumnScore(0),
                    rule: ThresholdRule::at_least(thresh1),
                },
                level2: FittedLevel {
                    classifier: ColumnScore(1),
                    rule: ThresholdRule::at_least(thresh2),
                },
            },
            out_of_bag: table,
            in_bag_rows: 0,
        }
    }

    #[test]
    fn three_way_mapping_folds_rule_in_without_rule_out() {
        assert_eq!(compose_three_way(0, 0), 0);
        assert_eq!(compose_three_way(0, 1), 0);
        assert_eq!(compose_three_way(1, 0), 1);
        assert_eq!(compose_three_way(1, 1), 2);
    }

    #[test]
    fn single_boot_matches_hand_derived_numbers() {
        let scheme = LabelScheme::default();
        let evaluator = CascadeEvaluator::new(&scheme);
        let metrics = evaluator
            .evaluate_boot(&artifact(0, 0.5, 0.5, out_of_bag()))
            .unwrap();

        assert_eq!(metrics.census, [2, 4, 2, 2]);
        assert_eq!((metrics.level1.correct, metrics.level1.total), (5, 6));
        assert_eq!((metrics.composed.correct, metrics.composed.total), (4, 6));
        let conditional = metrics.level2_conditional.unwrap();
        assert_eq!((conditional.correct, conditional.total), (2, 4));
        assert_eq!((metrics.three_way.correct, metrics.three_way.total), (4, 6));

        assert_eq!(metrics.confusion[0], [1.0, 0.0, 0.0]);
        assert_eq!(metrics.confusion[1], [0.0, 0.5, 0.5]);
        assert_eq!(metrics.confusion[2], [0.5, 0.0, 0.5]);
        assert_abs_diff_eq!(metrics.normalized_accuracy, 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn complement_orientation_is_respected() {
        let scheme = LabelScheme::default();
        let mut boot = artifact(0, 0.3, 0.5, out_of_bag());
        boot.model.level1.rule = ThresholdRule::complement(1.0 - 0.3);
        let metrics = CascadeEvaluator::new(&scheme).evaluate_boot(&boot).unwrap();
        // Row 1 scores exactly 0.3; its complement meets the cutoff, so it stays negative.
        assert_eq!(metrics.level1.correct, 6);
        let mut boot = artifact(0, 0.3, 0.5, out_of_bag());
        boot.model.level1.rule.orientation = Orientation::AtLeast;
        let metrics = CascadeEvaluator::new(&scheme).evaluate_boot(&boot).unwrap();
        assert_eq!(metrics.level1.correct, 5);
    }

    #[test]
    fn aggregates_use_population_standard_deviation() {
        let scheme = LabelScheme::default();
        let report = CascadeEvaluator::new(&scheme)
            .evaluate(&[
                artifact(0, 0.5, 0.5, out_of_bag()),
                artifact(1, 0.35, 0.5, out_of_bag()),
            ])
            .unwrap();
        assert_eq!(report.n_boots, 2);
        assert_abs_diff_eq!(report.level1_accuracy.mean, 11.0 / 12.0, epsilon = 1e-12);
        assert_abs_diff_eq!(report.level1_accuracy.std, 1.0 / 12.0, epsilon = 1e-12);
        assert_abs_diff_eq!(report.composed_accuracy.mean, 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(report.thresh1.mean, 0.425, epsilon = 1e-12);
        for row in &report.mean_confusion {
            assert_abs_diff_eq!(row.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn boot_order_does_not_change_aggregates() {
        let scheme = LabelScheme::default();
        let evaluator = CascadeEvaluator::new(&scheme);
        let forward = [
            artifact(0, 0.5, 0.5, out_of_bag()),
            artifact(1, 0.35, 0.65, out_of_bag()),
            artifact(2, 0.75, 0.15, out_of_bag()),
        ];
        let reversed = [
            artifact(2, 0.75, 0.15, out_of_bag()),
            artifact(1, 0.35, 0.65, out_of_bag()),
            artifact(0, 0.5, 0.5, out_of_bag()),
        ];
        let a = evaluator.evaluate(&forward).unwrap();
        let b = evaluator.evaluate(&reversed).unwrap();
        for (x, y) in [
            (a.level1_accuracy, b.level1_accuracy),
            (a.composed_accuracy, b.composed_accuracy),
            (a.three_way_accuracy, b.three_way_accuracy),
            (a.normalized_accuracy, b.normalized_accuracy),
        ] {
            assert_abs_diff_eq!(x.mean, y.mean, epsilon = 1e-12);
            assert_abs_diff_eq!(x.std, y.std, epsilon = 1e-12);
        }
        for (ra, rb) in a.mean_confusion.iter().zip(b.mean_confusion.iter()) {
            for (va, vb) in ra.iter().zip(rb.iter()) {
                assert_abs_diff_eq!(va, vb, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn conditional_view_is_skipped_without_level_one_positives() {
        let scheme = LabelScheme::default();
        let normals = out_of_bag().select_rows(&[0, 1]);
        let metrics = CascadeEvaluator::new(&scheme)
            .evaluate_boot(&artifact(0, 0.5, 0.5, normals))
            .unwrap();
        assert!(metrics.level2_conditional.is_none());

        let report = EvaluationReport::from_boots("adjudicatorDiagnosis", vec![metrics]).unwrap();
        assert!(report.level2_conditional_accuracy.is_none());
        assert_abs_diff_eq!(report.normalized_accuracy.mean, 1.0);
    }

    #[test]
    fn out_of_bag_tables_and_summary_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let scheme = LabelScheme::default();
        let evaluator = CascadeEvaluator::new(&scheme).with_output_dir(dir.path());
        let report = evaluator
            .evaluate(&[artifact(3, 0.5, 0.5, out_of_bag())])
            .unwrap();

        let oob = dir
            .path()
            .join("outbags_adjudicatorDiagnosis")
            .join("out_bag3.csv");
        assert!(oob.exists());
        assert_eq!(fs::read_to_string(&oob).unwrap().lines().count(), 7);

        let summary = dir.path().join("summary.toml");
        report.write_toml(&summary).unwrap();
        let parsed: EvaluationReport =
            toml::from_str(&fs::read_to_string(&summary).unwrap()).unwrap();
        assert_eq!(parsed.n_boots, 1);
        assert_eq!(parsed.boots[0].boot, 3);
    }
}

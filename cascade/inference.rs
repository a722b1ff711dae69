//! The fitted two-level cascade and its inference pass.

use crate::classifier::Classifier;
use crate::data::PatientTable;
use crate::error::CascadeError;
use crate::threshold::ThresholdRule;
use ndarray::Array1;

/// A fitted classifier together with its decision rule.
#[derive(Debug, Clone)]
pub struct FittedLevel<M> {
    pub classifier: M,
    pub rule: ThresholdRule,
}

/// Level-1 "rule out" and level-2 "rule in" models of one boot.
///
/// Both thresholds were derived from in-bag scores only.
#[derive(Debug, Clone)]
pub struct CascadeModel<M> {
    pub level1: FittedLevel<M>,
    pub level2: FittedLevel<M>,
}

/// Per-row decisions and scores for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    pub y1_pred: Array1<u8>,
    pub y2_pred: Array1<u8>,
    pub s1: Array1<f64>,
    pub s2: Array1<f64>,
    pub thresh1: f64,
    pub thresh2: f64,
}

impl<M: Classifier> CascadeModel<M> {
    /// Scores every row of `table` with both levels and applies their rules.
    ///
    /// Level 2 is scored independently of level 1; composition happens in the evaluator.
    pub fn infer(&self, table: &PatientTable) -> Result<InferenceOutput, CascadeError> {
        let features = table.features.view();
        let s1 = self.level1.classifier.predict_proba(features)?;
        let s2 = self.level2.classifier.predict_proba(features)?;
        if s1.len() != table.n_rows() || s2.len() != table.n_rows() {
            return Err(CascadeError::integrity(
                "inference scores",
                table.n_rows(),
                s1.len().min(s2.len()),
            ));
        }
        Ok(InferenceOutput {
            y1_pred: self.level1.rule.apply(s1.view()),
            y2_pred: self.level2.rule.apply(s2.view()),
            s1,
            s2,
            thresh1: self.level1.rule.threshold,
            thresh2: self.level2.rule.threshold,
        })
    }
}

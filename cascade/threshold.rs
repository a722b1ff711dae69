//! # Operating-Point Selection
//!
//! Converts held-out classifier scores into a decision cutoff. The primary
//! criterion sweeps the observed scores from the top down and stops at the first
//! cutoff whose true-positive rate reaches the target, which is the most
//! stringent cutoff meeting the target.
//!
//! The reciprocal `tprn` mode runs the same sweep on complemented labels and
//! scores and complements the result back. On the flipped problem a "positive"
//! is an original negative, so the target becomes a true-negative rate. The
//! complemented threshold is only reported; a rule derived this way keeps the
//! flipped cutoff and compares `1 - score` against it, so it makes exactly the
//! decisions the sweep counted. See [`Orientation`].
//!
//! Every function here is pure. No randomness is involved.

use crate::config::ThresholdMethod;
use crate::error::CascadeError;
use ndarray::{Array1, ArrayView1, Zip};
use std::cmp::Ordering;

/// How a score is compared with its threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Orientation {
    /// Positive iff `score >= threshold`.
    AtLeast,
    /// Negative iff `1 - score >= cutoff`, where `cutoff` was chosen on the
    /// complemented scores of a `tprn` sweep.
    Complement { cutoff: f64 },
}

/// A threshold together with the comparison it was derived for.
///
/// For [`Orientation::Complement`] the `threshold` is `1 - cutoff` and serves
/// reporting only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdRule {
    pub threshold: f64,
    pub orientation: Orientation,
}

impl ThresholdRule {
    pub fn at_least(threshold: f64) -> Self {
        Self {
            threshold,
            orientation: Orientation::AtLeast,
        }
    }

    pub fn complement(cutoff: f64) -> Self {
        Self {
            threshold: 1.0 - cutoff,
            orientation: Orientation::Complement { cutoff },
        }
    }

    pub fn classify(&self, score: f64) -> u8 {
        let positive = match self.orientation {
            Orientation::AtLeast => score >= self.threshold,
            Orientation::Complement { cutoff } => 1.0 - score < cutoff,
        };
        u8::from(positive)
    }

    pub fn apply(&self, scores: ArrayView1<f64>) -> Array1<u8> {
        scores.mapv(|s| self.classify(s))
    }
}

/// Finds a score cutoff for `labels`/`scores` under `method`.
///
/// `target_tpr` must lie in `(0, 1]` for the rate-based methods; `Youden`
/// ignores it.
///
/// # Errors
/// `InvalidInput` when the arrays are empty or of different lengths, when a
/// label is not 0/1, when a score is not finite, when the target is out of
/// range, or when the class the criterion needs is absent.
pub fn find_threshold(
    labels: ArrayView1<u8>,
    scores: ArrayView1<f64>,
    target_tpr: f64,
    method: ThresholdMethod,
) -> Result<f64, CascadeError> {
    Ok(derive_rule(labels, scores, target_tpr, method)?.threshold)
}

/// Like [`find_threshold`], returning the rule with the orientation the method implies.
pub fn derive_rule(
    labels: ArrayView1<u8>,
    scores: ArrayView1<f64>,
    target_tpr: f64,
    method: ThresholdMethod,
) -> Result<ThresholdRule, CascadeError> {
    validate(labels, scores)?;
    match method {
        ThresholdMethod::Tpr => {
            optimize_tpr(labels, scores, target_tpr).map(ThresholdRule::at_least)
        }
        ThresholdMethod::Tprn => {
            let flipped_labels = labels.mapv(|y| 1 - y);
            let flipped_scores = scores.mapv(|s| 1.0 - s);
            optimize_tpr(flipped_labels.view(), flipped_scores.view(), target_tpr)
                .map(ThresholdRule::complement)
        }
        ThresholdMethod::Youden => optimize_youden(labels, scores).map(ThresholdRule::at_least),
    }
}

/// True- and false-positive rates of binary `predictions` against `labels`.
///
/// A rate whose denominator is empty is reported as `NaN`.
pub fn rates(labels: ArrayView1<u8>, predictions: ArrayView1<u8>) -> (f64, f64) {
    let (mut tp, mut fp, mut positives, mut negatives) = (0usize, 0usize, 0usize, 0usize);
    Zip::from(labels).and(predictions).for_each(|&y, &p| {
        if y == 1 {
            positives += 1;
            tp += usize::from(p == 1);
        } else {
            negatives += 1;
            fp += usize::from(p == 1);
        }
    });
    let ratio = |num: usize, den: usize| {
        if den == 0 {
            f64::NAN
        } else {
            num as f64 / den as f64
        }
    };
    (ratio(tp, positives), ratio(fp, negatives))
}

fn validate(labels: ArrayView1<u8>, scores: ArrayView1<f64>) -> Result<(), CascadeError> {
    if labels.len() != scores.len() {
        return Err(CascadeError::InvalidInput(format!(
            "{} labels but {} scores",
            labels.len(),
            scores.len()
        )));
    }
    if labels.is_empty() {
        return Err(CascadeError::InvalidInput(
            "cannot derive a threshold from an empty score array".to_string(),
        ));
    }
    if let Some(bad) = labels.iter().find(|&&y| y > 1) {
        return Err(CascadeError::InvalidInput(format!(
            "labels must be 0 or 1, found {bad}"
        )));
    }
    if scores.iter().any(|s| !s.is_finite()) {
        return Err(CascadeError::InvalidInput(
            "scores contain NaN or infinite values".to_string(),
        ));
    }
    Ok(())
}

/// Row indices ordered by descending score; ties keep their input order.
fn descending_order(scores: ArrayView1<f64>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
    });
    order
}

/// Walks distinct cutoffs from high to low, yielding `(cutoff, tp, fp)` after
/// each block of tied scores has been admitted.
fn sweep(labels: ArrayView1<u8>, scores: ArrayView1<f64>) -> Vec<(f64, usize, usize)> {
    let order = descending_order(scores);
    let mut points = Vec::new();
    let (mut tp, mut fp) = (0usize, 0usize);
    let mut idx = 0;
    while idx < order.len() {
        let cutoff = scores[order[idx]];
        while idx < order.len() && scores[order[idx]] == cutoff {
            if labels[order[idx]] == 1 {
                tp += 1;
            } else {
                fp += 1;
            }
            idx += 1;
        }
        points.push((cutoff, tp, fp));
    }
    points
}

fn optimize_tpr(
    labels: ArrayView1<u8>,
    scores: ArrayView1<f64>,
    target_tpr: f64,
) -> Result<f64, CascadeError> {
    if !(target_tpr > 0.0 && target_tpr <= 1.0) {
        return Err(CascadeError::InvalidInput(format!(
            "target true-positive rate must lie in (0, 1], got {target_tpr}"
        )));
    }
    let positives = labels.iter().filter(|&&y| y == 1).count();
    if positives == 0 {
        return Err(CascadeError::InvalidInput(
            "no positive labels; the true-positive rate is undefined".to_string(),
        ));
    }
    let points = sweep(labels, scores);
    points
        .iter()
        .find(|&&(_, tp, _)| tp as f64 / positives as f64 >= target_tpr)
        .map(|&(cutoff, _, _)| cutoff)
        .ok_or_else(|| {
            CascadeError::InvalidInput(format!(
                "no cutoff reaches a true-positive rate of {target_tpr}"
            ))
        })
}

fn optimize_youden(labels: ArrayView1<u8>, scores: ArrayView1<f64>) -> Result<f64, CascadeError> {
    let positives = labels.iter().filter(|&&y| y == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(CascadeError::InvalidInput(format!(
            "Youden's index needs both classes ({positives} positives, {negatives} negatives)"
        )));
    }
    let mut best: Option<(f64, f64)> = None;
    for (cutoff, tp, fp) in sweep(labels, scores) {
        let j = tp as f64 / positives as f64 - fp as f64 / negatives as f64;
        match best {
            Some((best_j, _)) if j <= best_j => {}
            _ => best = Some((j, cutoff)),
        }
    }
    best.map(|(_, cutoff)| cutoff).ok_or_else(|| {
        CascadeError::InvalidInput("no candidate cutoffs for Youden's index".to_string())
    })
}

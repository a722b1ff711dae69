//! # Level Classifiers and the Reference Trainer
//!
//! The bootstrap protocol only needs two things from a model: held-out scores on
//! in-bag rows, and probabilities for unseen rows. [`CascadeTrainer`] and
//! [`Classifier`] are those two seams. Any learner can sit behind them.
//!
//! The reference learner is an L2-penalised logistic regression fitted by
//! iteratively reweighted least squares. Features are standardised on the
//! training rows, the intercept is unpenalised, and each IRLS step solves the
//! penalised normal equations directly.
//!
//! The level-2 model is chained: it is trained only on level-1 positive rows,
//! but it scores every held-out row, because the cascade decides later which
//! level-2 scores matter.

use crate::config::SplitMethod;
use crate::data::{PatientTable, SetTag};
use crate::error::CascadeError;
use crate::labels::CascadeLabels;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::Solve;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// A fitted binary classifier producing `P(y = 1)` per row.
pub trait Classifier: Send + Sync {
    fn n_features(&self) -> usize;

    fn predict_proba(&self, features: ArrayView2<f64>) -> Result<Array1<f64>, CascadeError>;
}

/// One fitted level with the held-out scores used to pick its threshold.
#[derive(Debug, Clone)]
pub struct LevelFit<M> {
    pub model: M,
    pub scores: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct CascadeFit<M> {
    pub level1: LevelFit<M>,
    pub level2: LevelFit<M>,
}

/// Trains both cascade levels on one boot's in-bag table.
///
/// `labels` covers every row of `in_bag`. The returned scores cover every
/// in-bag row for [`SplitMethod::Cv`] and only the `val` rows, in table order,
/// for [`SplitMethod::Fixed`].
pub trait CascadeTrainer: Sync {
    type Model: Classifier;

    fn fit(
        &self,
        in_bag: &PatientTable,
        labels: &CascadeLabels,
        boot: usize,
        split: SplitMethod,
    ) -> Result<CascadeFit<Self::Model>, CascadeError>;
}

#[derive(Debug, Clone)]
pub struct RidgeLogisticSettings {
    /// Penalty on the standardised slopes.
    pub lambda: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub n_folds: usize,
    /// Cross-validation repeats; scores are averaged over repeats.
    pub n_repeats: usize,
    pub seed: u64,
}

impl Default for RidgeLogisticSettings {
    fn default() -> Self {
        Self {
            lambda: 1.0,
            max_iterations: 50,
            tolerance: 1e-8,
            n_folds: 10,
            n_repeats: 1,
            seed: 20201216,
        }
    }
}

/// Standardised logistic model.
#[derive(Debug, Clone)]
pub struct RidgeLogisticModel {
    pub means: Array1<f64>,
    pub scales: Array1<f64>,
    pub intercept: f64,
    pub coefficients: Array1<f64>,
}

impl RidgeLogisticModel {
    fn linear_predictor(&self, features: ArrayView2<f64>) -> Array1<f64> {
        let standardized = (&features - &self.means) / &self.scales;
        standardized.dot(&self.coefficients) + self.intercept
    }
}

impl Classifier for RidgeLogisticModel {
    fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    fn predict_proba(&self, features: ArrayView2<f64>) -> Result<Array1<f64>, CascadeError> {
        if features.ncols() != self.n_features() {
            return Err(CascadeError::InvalidInput(format!(
                "model expects {} features, got {}",
                self.n_features(),
                features.ncols()
            )));
        }
        Ok(self.linear_predictor(features).mapv(sigmoid))
    }
}

fn sigmoid(eta: f64) -> f64 {
    let e = eta.clamp(-700.0, 700.0);
    1.0 / (1.0 + (-e).exp())
}

/// Fits an L2-penalised logistic regression by IRLS.
pub fn fit_ridge_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<u8>,
    settings: &RidgeLogisticSettings,
) -> Result<RidgeLogisticModel, CascadeError> {
    const MIN_WEIGHT: f64 = 1e-6;
    const PROB_EPS: f64 = 1e-8;

    let (n, p) = x.dim();
    if n == 0 {
        return Err(CascadeError::InvalidInput(
            "cannot fit a classifier on zero rows".to_string(),
        ));
    }
    if y.len() != n {
        return Err(CascadeError::integrity("classifier targets", n, y.len()));
    }

    let means = x.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p));
    let scales = x
        .std_axis(Axis(0), 0.0)
        .mapv(|sd| if sd > 1e-12 { sd } else { 1.0 });

    // Column 0 is the intercept.
    let mut design = Array2::<f64>::ones((n, p + 1));
    design
        .slice_mut(s![.., 1..])
        .assign(&((&x - &means) / &scales));
    let target = y.mapv(f64::from);

    let mut penalty = Array2::<f64>::eye(p + 1) * settings.lambda;
    penalty[[0, 0]] = 0.0;

    let mut beta = Array1::<f64>::zeros(p + 1);
    let mut converged = false;
    for iteration in 0..settings.max_iterations {
        let eta = design.dot(&beta).mapv(|e| e.clamp(-700.0, 700.0));
        let mu = eta.mapv(|e| (1.0 / (1.0 + (-e).exp())).clamp(PROB_EPS, 1.0 - PROB_EPS));
        let weights = (&mu * &(1.0 - &mu)).mapv(|w| w.max(MIN_WEIGHT));
        let working = &eta + &((&target - &mu) / &weights);

        let weighted = &design * &weights.view().insert_axis(Axis(1));
        let hessian = weighted.t().dot(&design) + &penalty;
        let rhs = weighted.t().dot(&working);
        let next = hessian
            .solve_into(rhs)
            .map_err(CascadeError::LinearSystemSolveFailed)?;

        let step = (&next - &beta).mapv(f64::abs).fold(0.0_f64, |a, &b| a.max(b));
        beta = next;
        if step < settings.tolerance {
            log::debug!("IRLS converged after {} iterations", iteration + 1);
            converged = true;
            break;
        }
    }
    if !converged {
        log::debug!(
            "IRLS stopped at the iteration limit ({}) before converging",
            settings.max_iterations
        );
    }

    Ok(RidgeLogisticModel {
        means,
        scales,
        intercept: beta[0],
        coefficients: beta.slice(s![1..]).to_owned(),
    })
}

/// Assigns each row to one of `n_folds` folds, balancing every stratum across folds.
pub fn stratified_folds(strata: ArrayView1<u8>, n_folds: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut assignment = vec![0usize; strata.len()];
    let mut levels: Vec<u8> = strata.iter().copied().collect();
    levels.sort_unstable();
    levels.dedup();

    let mut offset = 0;
    for level in levels {
        let mut members: Vec<usize> = strata
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s == level)
            .map(|(i, _)| i)
            .collect();
        members.shuffle(rng);
        for (k, row) in members.iter().enumerate() {
            assignment[*row] = (offset + k) % n_folds;
        }
        offset += members.len();
    }
    assignment
}

/// Reference [`CascadeTrainer`] built on [`fit_ridge_logistic`].
#[derive(Debug, Clone, Default)]
pub struct RidgeLogisticTrainer {
    pub settings: RidgeLogisticSettings,
}

impl RidgeLogisticTrainer {
    pub fn new(settings: RidgeLogisticSettings) -> Self {
        Self { settings }
    }

    fn fit_level2(
        &self,
        x: ArrayView2<f64>,
        labels: &CascadeLabels,
        rows: &[usize],
    ) -> Result<RidgeLogisticModel, CascadeError> {
        let positives: Vec<usize> = rows
            .iter()
            .copied()
            .filter(|&r| labels.y1[r] == 1)
            .collect();
        if positives.is_empty() {
            return Err(CascadeError::InvalidInput(
                "no level-1 positive rows available to train the level-2 model".to_string(),
            ));
        }
        fit_ridge_logistic(
            x.select(Axis(0), &positives).view(),
            labels.y2.select(Axis(0), &positives).view(),
            &self.settings,
        )
    }

    fn fit_level1(
        &self,
        x: ArrayView2<f64>,
        labels: &CascadeLabels,
        rows: &[usize],
    ) -> Result<RidgeLogisticModel, CascadeError> {
        fit_ridge_logistic(
            x.select(Axis(0), rows).view(),
            labels.y1.select(Axis(0), rows).view(),
            &self.settings,
        )
    }

    fn cross_validated(
        &self,
        x: ArrayView2<f64>,
        labels: &CascadeLabels,
        boot: usize,
    ) -> Result<CascadeFit<RidgeLogisticModel>, CascadeError> {
        let n = labels.len();
        if n < 2 {
            return Err(CascadeError::InvalidInput(format!(
                "cross-validation needs at least 2 in-bag rows, found {n}"
            )));
        }
        let n_folds = self.settings.n_folds.clamp(2, n);
        let n_repeats = self.settings.n_repeats.max(1);
        let strata = labels.three_way();

        let mut scores1 = Array1::<f64>::zeros(n);
        let mut scores2 = Array1::<f64>::zeros(n);
        for repeat in 0..n_repeats {
            let seed = self
                .settings
                .seed
                .wrapping_add((boot * n_repeats + repeat) as u64);
            let mut rng = StdRng::seed_from_u64(seed);
            let folds = stratified_folds(strata.view(), n_folds, &mut rng);

            for fold in 0..n_folds {
                let (held_out, training): (Vec<usize>, Vec<usize>) =
                    (0..n).partition(|&r| folds[r] == fold);
                if held_out.is_empty() {
                    continue;
                }
                let held_x = x.select(Axis(0), &held_out);
                let level1 = self.fit_level1(x, labels, &training)?;
                let level2 = self.fit_level2(x, labels, &training)?;
                let p1 = level1.predict_proba(held_x.view())?;
                let p2 = level2.predict_proba(held_x.view())?;
                for (k, &row) in held_out.iter().enumerate() {
                    scores1[row] += p1[k];
                    scores2[row] += p2[k];
                }
            }
        }
        scores1 /= n_repeats as f64;
        scores2 /= n_repeats as f64;

        let everything: Vec<usize> = (0..n).collect();
        Ok(CascadeFit {
            level1: LevelFit {
                model: self.fit_level1(x, labels, &everything)?,
                scores: scores1,
            },
            level2: LevelFit {
                model: self.fit_level2(x, labels, &everything)?,
                scores: scores2,
            },
        })
    }

    fn fixed_split(
        &self,
        in_bag: &PatientTable,
        labels: &CascadeLabels,
    ) -> Result<CascadeFit<RidgeLogisticModel>, CascadeError> {
        let training = in_bag.rows_tagged(|tag| tag == SetTag::Train)?;
        let validation = in_bag.rows_tagged(|tag| tag == SetTag::Val)?;
        if validation.is_empty() {
            return Err(CascadeError::InvalidInput(
                "fixed split requested but no in-bag row is tagged 'val'".to_string(),
            ));
        }
        let x = in_bag.features.view();
        let val_x = in_bag.features.select(Axis(0), &validation);

        let level1 = self.fit_level1(x, labels, &training)?;
        let level2 = self.fit_level2(x, labels, &training)?;
        let scores1 = level1.predict_proba(val_x.view())?;
        let scores2 = level2.predict_proba(val_x.view())?;
        Ok(CascadeFit {
            level1: LevelFit {
                model: level1,
                scores: scores1,
            },
            level2: LevelFit {
                model: level2,
                scores: scores2,
            },
        })
    }
}

impl CascadeTrainer for RidgeLogisticTrainer {
    type Model = RidgeLogisticModel;

    fn fit(
        &self,
        in_bag: &PatientTable,
        labels: &CascadeLabels,
        boot: usize,
        split: SplitMethod,
    ) -> Result<CascadeFit<Self::Model>, CascadeError> {
        if labels.len() != in_bag.n_rows() {
            return Err(CascadeError::integrity(
                "in-bag labels",
                in_bag.n_rows(),
                labels.len(),
            ));
        }
        match split {
            SplitMethod::Cv => self.cross_validated(in_bag.features.view(), labels, boot),
            SplitMethod::Fixed => self.fixed_split(in_bag, labels),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::LabelColumn;
    use ndarray::array;
    use rand::Rng;

    fn separable(n: usize, seed: u64) -> (Array2<f64>, Array1<u8>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let y = Array1::from_shape_fn(n, |i| u8::from(i % 2 == 0));
        let x = Array2::from_shape_fn((n, 2), |(i, j)| {
            let shift = if y[i] == 1 { 1.5 } else { -1.5 };
            if j == 0 {
                shift + rng.gen_range(-1.0..1.0)
            } else {
                rng.gen_range(-1.0..1.0)
            }
        });
        (x, y)
    }

    #[test]
    fn ridge_logistic_separates_shifted_classes() {
        let (x, y) = separable(200, 3);
        let model = fit_ridge_logistic(x.view(), y.view(), &RidgeLogisticSettings::default())
            .unwrap();
        assert!(model.coefficients[0] > 0.0);
        let probs = model.predict_proba(x.view()).unwrap();
        let correct = probs
            .iter()
            .zip(y.iter())
            .filter(|&(&p, &t)| (p >= 0.5) == (t == 1))
            .count();
        assert!(correct as f64 / 200.0 > 0.9, "accuracy {}", correct);
        assert!(probs.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn predict_rejects_wrong_width() {
        let (x, y) = separable(20, 1);
        let model = fit_ridge_logistic(x.view(), y.view(), &RidgeLogisticSettings::default())
            .unwrap();
        let err = model.predict_proba(Array2::zeros((3, 5)).view()).unwrap_err();
        assert!(matches!(err, CascadeError::InvalidInput(_)));
    }

    #[test]
    fn constant_column_does_not_break_standardisation() {
        let x = array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0], [4.0, 5.0]];
        let y = array![0u8, 0, 1, 1];
        let model = fit_ridge_logistic(x.view(), y.view(), &RidgeLogisticSettings::default())
            .unwrap();
        assert!(model.coefficients.iter().all(|c| c.is_finite()));
        assert_eq!(model.scales[1], 1.0);
    }

    #[test]
    fn stratified_folds_balance_each_class() {
        let strata = Array1::from_shape_fn(30, |i| (i % 3) as u8);
        let mut rng = StdRng::seed_from_u64(11);
        let folds = stratified_folds(strata.view(), 5, &mut rng);
        for fold in 0..5 {
            for class in 0..3u8 {
                let count = (0..30)
                    .filter(|&i| folds[i] == fold && strata[i] == class)
                    .count();
                assert_eq!(count, 2);
            }
        }
    }

    fn in_bag_table(n: usize) -> (PatientTable, CascadeLabels) {
        let (x, y1) = separable(n, 9);
        let y2 = Array1::from_shape_fn(n, |i| u8::from(y1[i] == 1 && i % 4 == 0));
        let codes = Array1::from_shape_fn(n, |i| f64::from(y1[i] + y2[i]));
        let tags = (0..n)
            .map(|i| if i % 5 == 0 { SetTag::Val } else { SetTag::Train })
            .collect();
        let table = PatientTable::new(
            vec!["a".to_string(), "b".to_string()],
            x,
            "outcome",
            LabelColumn::Ordinal(codes),
            None,
        )
        .unwrap()
        .with_set_tags(tags)
        .unwrap();
        (table, CascadeLabels::new(y1, y2).unwrap())
    }

    #[test]
    fn cross_validated_scores_cover_every_in_bag_row() {
        let (table, labels) = in_bag_table(60);
        let trainer = RidgeLogisticTrainer::new(RidgeLogisticSettings {
            n_folds: 5,
            ..Default::default()
        });
        let fit = trainer.fit(&table, &labels, 0, SplitMethod::Cv).unwrap();
        assert_eq!(fit.level1.scores.len(), 60);
        assert_eq!(fit.level2.scores.len(), 60);
        assert!(fit.level1.scores.iter().all(|s| (0.0..=1.0).contains(s)));

        let again = trainer.fit(&table, &labels, 0, SplitMethod::Cv).unwrap();
        assert_eq!(fit.level1.scores, again.level1.scores);
    }

    #[test]
    fn fixed_split_scores_only_val_rows() {
        let (table, labels) = in_bag_table(60);
        let fit = RidgeLogisticTrainer::default()
            .fit(&table, &labels, 0, SplitMethod::Fixed)
            .unwrap();
        assert_eq!(fit.level1.scores.len(), 12);
        assert_eq!(fit.level2.scores.len(), 12);
    }
}

//! # Bootstrap Training Protocol
//!
//! Each boot receives its own train/val/test tags. The in-bag rows (`train` and
//! `val`) are used to fit both cascade levels and to pick their thresholds. The
//! out-of-bag rows (`test`) are set aside untouched for the evaluator.
//!
//! Boots share nothing but read-only access to the base table, so they can run
//! on a `rayon` pool. Results are always returned in boot order. The first
//! failing boot aborts the run and the error names the boot and its stage.

use crate::classifier::CascadeTrainer;
use crate::config::{LabelScheme, SplitMethod, ThresholdMethod};
use crate::data::{PatientTable, SetTag, SetTagSource};
use crate::error::{BootContext, BootStage, CascadeError};
use crate::inference::{CascadeModel, FittedLevel};
use crate::labels::{get_label, get_val_label};
use crate::progress::BootProgressObserver;
use crate::threshold::derive_rule;
use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub n_boots: usize,
    pub tpr1: f64,
    pub tpr2: f64,
    pub threshold_method: ThresholdMethod,
    pub split_method: SplitMethod,
    /// Restrict the in-bag population to the normal-and-chronic diagnoses.
    pub train_on_normal_and_chronic_only: bool,
    /// Restrict the out-of-bag population to the normal-and-chronic diagnoses.
    pub test_on_normal_and_chronic_only: bool,
    pub parallel: bool,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            n_boots: 50,
            tpr1: 0.99,
            tpr2: 0.99,
            threshold_method: ThresholdMethod::Tprn,
            split_method: SplitMethod::Cv,
            train_on_normal_and_chronic_only: false,
            test_on_normal_and_chronic_only: false,
            parallel: false,
        }
    }
}

impl BootstrapSettings {
    /// Level 2 never uses the complemented criterion.
    pub fn level2_method(&self) -> ThresholdMethod {
        match self.threshold_method {
            ThresholdMethod::Tprn => ThresholdMethod::Tpr,
            other => other,
        }
    }
}

/// Row positions of the base table assigned to each side of one boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSplit {
    pub boot: usize,
    pub in_bag: Vec<usize>,
    pub out_of_bag: Vec<usize>,
    /// The subset of `in_bag` tagged `val`.
    pub validation: Vec<usize>,
}

impl BootSplit {
    pub fn from_tags(boot: usize, tags: &[SetTag]) -> Self {
        let mut split = Self {
            boot,
            in_bag: Vec::new(),
            out_of_bag: Vec::new(),
            validation: Vec::new(),
        };
        for (row, tag) in tags.iter().enumerate() {
            match tag {
                SetTag::Train => split.in_bag.push(row),
                SetTag::Val => {
                    split.in_bag.push(row);
                    split.validation.push(row);
                }
                SetTag::Test => split.out_of_bag.push(row),
                SetTag::Unassigned => {}
            }
        }
        split
    }
}

/// Everything one boot hands to the evaluator.
#[derive(Debug, Clone)]
pub struct BootArtifact<M> {
    pub boot: usize,
    pub model: CascadeModel<M>,
    /// Held-out evaluation population, already filtered if a test filter applies.
    pub out_of_bag: PatientTable,
    pub in_bag_rows: usize,
}

pub struct BootstrapTrainer<'a, T, S> {
    base: &'a PatientTable,
    scheme: &'a LabelScheme,
    trainer: &'a T,
    tags: &'a S,
    settings: BootstrapSettings,
}

impl<'a, T, S> BootstrapTrainer<'a, T, S>
where
    T: CascadeTrainer,
    S: SetTagSource,
{
    pub fn new(
        base: &'a PatientTable,
        scheme: &'a LabelScheme,
        trainer: &'a T,
        tags: &'a S,
        settings: BootstrapSettings,
    ) -> Self {
        Self {
            base,
            scheme,
            trainer,
            tags,
            settings,
        }
    }

    pub fn settings(&self) -> &BootstrapSettings {
        &self.settings
    }

    /// Runs every boot and returns their artifacts in boot order.
    pub fn run(
        &self,
        progress: &dyn BootProgressObserver,
    ) -> Result<Vec<BootArtifact<T::Model>>, CascadeError> {
        let n_boots = self.settings.n_boots;
        log::info!(
            "Starting {} boots (threshold method {}, split {}, tpr1 {}, tpr2 {})",
            n_boots,
            self.settings.threshold_method,
            self.settings.split_method,
            self.settings.tpr1,
            self.settings.tpr2
        );
        progress.on_run_start(n_boots);

        let one = |boot: usize| {
            let artifact = self.run_boot(boot);
            progress.on_boot_finish(boot);
            artifact
        };
        let artifacts = if self.settings.parallel {
            (0..n_boots)
                .into_par_iter()
                .map(one)
                .collect::<Result<Vec<_>, _>>()
        } else {
            (0..n_boots).map(one).collect::<Result<Vec<_>, _>>()
        };

        progress.on_run_finish();
        artifacts
    }

    /// Trains and thresholds a single boot.
    pub fn run_boot(&self, boot: usize) -> Result<BootArtifact<T::Model>, CascadeError> {
        let tags = self.tags.set_tags(boot).at_stage(boot, BootStage::SetTags)?;
        let tagged = self
            .base
            .with_set_tags(tags)
            .at_stage(boot, BootStage::SetTags)?;
        let split = BootSplit::from_tags(boot, tagged.set_tags.as_deref().unwrap_or(&[]));

        let mut in_bag = tagged.select_rows(&split.in_bag);
        if self.settings.train_on_normal_and_chronic_only {
            let keep = in_bag
                .rows_with_diagnosis(&self.scheme.normal_and_chronic)
                .at_stage(boot, BootStage::Training)?;
            in_bag = in_bag.select_rows(&keep);
        }
        let mut out_of_bag = tagged.select_rows(&split.out_of_bag);
        if self.settings.test_on_normal_and_chronic_only {
            let keep = out_of_bag
                .rows_with_diagnosis(&self.scheme.normal_and_chronic)
                .at_stage(boot, BootStage::Evaluation)?;
            out_of_bag = out_of_bag.select_rows(&keep);
        }
        log::debug!(
            "Boot {}: {} in-bag rows ({} val), {} out-of-bag rows",
            boot,
            in_bag.n_rows(),
            split.validation.len(),
            out_of_bag.n_rows()
        );

        let labels = get_label(&in_bag, self.scheme).at_stage(boot, BootStage::Labels)?;
        let fit = self
            .trainer
            .fit(&in_bag, &labels, boot, self.settings.split_method)
            .at_stage(boot, BootStage::Training)?;

        let scored = match self.settings.split_method {
            SplitMethod::Cv => labels,
            SplitMethod::Fixed => {
                get_val_label(&in_bag, self.scheme).at_stage(boot, BootStage::Labels)?
            }
        };
        for (context, found) in [
            ("level-1 held-out scores", fit.level1.scores.len()),
            ("level-2 held-out scores", fit.level2.scores.len()),
        ] {
            if found != scored.len() {
                return Err(CascadeError::integrity(context, scored.len(), found)
                    .in_boot(boot, BootStage::Labels));
            }
        }

        let rule1 = derive_rule(
            scored.y1.view(),
            fit.level1.scores.view(),
            self.settings.tpr1,
            self.settings.threshold_method,
        )
        .at_stage(boot, BootStage::Thresholding)?;
        let rule2 = derive_rule(
            scored.y2.view(),
            fit.level2.scores.view(),
            self.settings.tpr2,
            self.settings.level2_method(),
        )
        .at_stage(boot, BootStage::Thresholding)?;
        log::info!(
            "Boot {}: thresh1 = {:.6}, thresh2 = {:.6}",
            boot,
            rule1.threshold,
            rule2.threshold
        );

        Ok(BootArtifact {
            boot,
            model: CascadeModel {
                level1: FittedLevel {
                    classifier: fit.level1.model,
                    rule: rule1,
                },
                level2: FittedLevel {
                    classifier: fit.level2.model,
                    rule: rule2,
                },
            },
            out_of_bag,
            in_bag_rows: in_bag.n_rows(),
        })
    }
}

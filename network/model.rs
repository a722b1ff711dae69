//! # Cascade Fusion Network
//!
//! Forward pass of the multi-head network, as an explicit ordered pipeline:
//!
//! 1. `net_l1` and `net_l2` encode their luke-weighted bundles.
//! 2. `net_trop` and the curve decoder run when the trajectory is needed.
//! 3. The out5 encoder consumes either the luke bundle or, without luke
//!    channels, the reduced bundle plus the four raw curve outputs.
//! 4. Classification heads are read off their encoders; `out3c` is composed
//!    from the rule-out and rule-in probabilities.
//! 5. The binary and regression heads read the out5 features.
//!
//! Encoder input widths are computed from the same group lists the forward
//! pass assembles, so a width can never disagree with the data it receives.

use crate::config::NetworkSection;
use crate::error::CascadeError;
use crate::network::curve::{CURVE_PARAMS, CurveDecoder, CurveOutput, CurveParams, evaluate_curve};
use crate::network::features::FeatureLayout;
use crate::network::heads::{HeadKind, TargetInfo, compose_three_class};
use crate::network::layers::{Encoder, ExecutionContext, HIDDEN_UNITS, Linear};
use crate::network::loss::{soft_cross_entropy, softmax};
use ndarray::{Array2, ArrayView2, Axis, concatenate};
use rand::SeedableRng;
use rand::rngs::StdRng;

const TIME_GROUPS: [&str; 2] = ["time_trop", "time_fake_trop"];

/// An encoder and the feature groups it reads, in order.
#[derive(Debug, Clone)]
struct Branch {
    names: Vec<String>,
    encoder: Encoder,
}

/// Everything one forward pass produces.
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    /// Per declared classification head. `out3c` holds probabilities, the rest logits.
    pub classification: Vec<(HeadKind, Array2<f64>)>,
    pub binary: Option<Array2<f64>>,
    pub regression: Option<Array2<f64>>,
    pub curve_params: Option<CurveParams>,
    pub curve: Option<CurveOutput>,
}

impl NetworkOutput {
    pub fn head(&self, kind: HeadKind) -> Option<&Array2<f64>> {
        self.classification
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, values)| values)
    }

    /// Soft cross-entropy of one classification head against soft targets.
    ///
    /// The same function is used for every head, `out3c` included.
    pub fn head_loss(&self, kind: HeadKind, targets: ArrayView2<f64>) -> Result<f64, CascadeError> {
        let values = self.head(kind).ok_or_else(|| {
            CascadeError::Configuration(format!("head '{kind}' is not active in this network"))
        })?;
        soft_cross_entropy(values.view(), targets)
    }
}

#[derive(Debug, Clone)]
pub struct CascadeNetwork {
    target: TargetInfo,
    layout: FeatureLayout,
    net_l1: Option<Branch>,
    net_l2: Option<Branch>,
    net_trop: Option<Branch>,
    curve: Option<CurveDecoder>,
    net_out5: Option<Branch>,
    classifiers: Vec<(HeadKind, Linear)>,
    binary_classifier: Option<Linear>,
    regressor: Option<Linear>,
}

impl CascadeNetwork {
    /// Builds the heads declared in `target`, initialising parameters from `seed`.
    pub fn new(target: TargetInfo, layout: FeatureLayout, seed: u64) -> Result<Self, CascadeError> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut build = |names: Vec<String>, extra: usize| -> Result<Branch, CascadeError> {
            let width = layout.assembled_width(&names)? + extra;
            Ok(Branch {
                encoder: Encoder::new(width, &mut rng),
                names,
            })
        };

        let base = base_names(&target);
        let full = append_angio(&target, base.clone());

        let net_l1 = if target.has(HeadKind::RuleOut) {
            Some(build(base, 0)?)
        } else {
            None
        };
        let net_l2 = if target.has(HeadKind::RuleIn) {
            Some(build(full.clone(), 0)?)
        } else {
            None
        };
        let net_trop = if target.curve_active() {
            for group in TIME_GROUPS {
                layout.group(group)?;
            }
            Some(build(full.clone(), 0)?)
        } else {
            None
        };
        let net_out5 = if target.outcome_encoder_active() {
            if target.use_luke {
                Some(build(full, 0)?)
            } else {
                Some(build(reduced_names(&target), CURVE_PARAMS)?)
            }
        } else {
            None
        };

        let curve = net_trop
            .as_ref()
            .map(|branch| CurveDecoder::new(branch.encoder.output_width(), &mut rng));

        let mut classifiers = Vec::new();
        for &(kind, n_classes) in &target.cls_heads {
            if kind != HeadKind::ThreeClass {
                classifiers.push((kind, Linear::new(HIDDEN_UNITS, n_classes, &mut rng)));
            }
        }
        let binary_classifier = (!target.binary_cls_cols.is_empty())
            .then(|| Linear::new(HIDDEN_UNITS, target.binary_cls_cols.len(), &mut rng));
        let regressor = (!target.regression_cols.is_empty())
            .then(|| Linear::new(HIDDEN_UNITS, target.regression_cols.len(), &mut rng));

        let network = Self {
            target,
            layout,
            net_l1,
            net_l2,
            net_trop,
            curve,
            net_out5,
            classifiers,
            binary_classifier,
            regressor,
        };
        log::debug!(
            "Built network with {} parameters over {} input columns",
            network.parameter_count(),
            network.layout.total_width()
        );
        Ok(network)
    }

    /// Builds the network described by a `[network]` configuration section.
    pub fn from_section(section: &NetworkSection) -> Result<Self, CascadeError> {
        let target = TargetInfo::from_section(section)?;
        let layout = FeatureLayout::new(&section.groups)?;
        Self::new(target, layout, section.seed)
    }

    pub fn target(&self) -> &TargetInfo {
        &self.target
    }

    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    /// Input width of each constructed encoder.
    pub fn encoder_widths(&self) -> Vec<(&'static str, usize)> {
        [
            ("net_l1", &self.net_l1),
            ("net_l2", &self.net_l2),
            ("net_trop", &self.net_trop),
            ("net_out5", &self.net_out5),
        ]
        .into_iter()
        .filter_map(|(name, branch)| {
            branch
                .as_ref()
                .map(|b| (name, b.encoder.input_width()))
        })
        .collect()
    }

    pub fn parameter_count(&self) -> usize {
        let encoders: usize = [&self.net_l1, &self.net_l2, &self.net_trop, &self.net_out5]
            .into_iter()
            .flatten()
            .map(|b| b.encoder.parameter_count())
            .sum();
        let heads: usize = self
            .classifiers
            .iter()
            .map(|(_, l)| l.parameter_count())
            .chain(self.binary_classifier.iter().map(Linear::parameter_count))
            .chain(self.regressor.iter().map(Linear::parameter_count))
            .sum();
        encoders + heads + self.curve.as_ref().map_or(0, CurveDecoder::parameter_count)
    }

    fn encode(
        &self,
        branch: &Branch,
        batch: ArrayView2<f64>,
        ctx: &mut ExecutionContext,
    ) -> Result<Array2<f64>, CascadeError> {
        let input = self.layout.assemble(batch, &branch.names)?;
        branch.encoder.forward(input.view(), ctx)
    }

    fn classifier(&self, kind: HeadKind) -> Result<&Linear, CascadeError> {
        self.classifiers
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, l)| l)
            .ok_or_else(|| CascadeError::Configuration(format!("no classifier built for '{kind}'")))
    }

    pub fn forward(
        &self,
        batch: ArrayView2<f64>,
        ctx: &mut ExecutionContext,
    ) -> Result<NetworkOutput, CascadeError> {
        if batch.ncols() != self.layout.total_width() {
            return Err(CascadeError::Configuration(format!(
                "input width mismatch: layout spans {} columns, batch has {}",
                self.layout.total_width(),
                batch.ncols()
            )));
        }

        let features_l1 = match &self.net_l1 {
            Some(branch) => Some(self.encode(branch, batch, ctx)?),
            None => None,
        };
        let features_l2 = match &self.net_l2 {
            Some(branch) => Some(self.encode(branch, batch, ctx)?),
            None => None,
        };

        let mut raw_curve = None;
        let mut curve_params = None;
        let mut curve = None;
        if let (Some(branch), Some(decoder)) = (&self.net_trop, &self.curve) {
            let features_trop = self.encode(branch, batch, ctx)?;
            let (raw, params) = decoder.decode(features_trop.view())?;
            let times = self.layout.assemble(batch, &TIME_GROUPS)?;
            curve = Some(evaluate_curve(&params, times.view())?);
            curve_params = Some(params);
            raw_curve = Some(raw);
        }

        let features_out5 = match &self.net_out5 {
            Some(branch) => {
                let assembled = self.layout.assemble(batch, &branch.names)?;
                let input = if self.target.use_luke {
                    assembled
                } else {
                    let raw = raw_curve.as_ref().ok_or_else(|| {
                        CascadeError::Configuration(
                            "out5 without luke channels needs the curve decoder".to_string(),
                        )
                    })?;
                    concatenate(Axis(1), &[assembled.view(), raw.view()]).map_err(|e| {
                        CascadeError::Configuration(format!("cannot append curve outputs: {e}"))
                    })?
                };
                Some(branch.encoder.forward(input.view(), ctx)?)
            }
            None => None,
        };

        let mut classification = Vec::with_capacity(self.target.cls_heads.len());
        for &(kind, _) in &self.target.cls_heads {
            let features = match kind {
                HeadKind::RuleOut => encoded(kind, &features_l1)?,
                HeadKind::RuleIn => encoded(kind, &features_l2)?,
                HeadKind::Outcome => encoded(kind, &features_out5)?,
                HeadKind::ThreeClass => continue,
            };
            let logits = self.classifier(kind)?.forward(features.view())?;
            classification.push((kind, logits));
        }
        if let Some(position) = self
            .target
            .cls_heads
            .iter()
            .position(|(k, _)| *k == HeadKind::ThreeClass)
        {
            let find = |kind: HeadKind| {
                classification
                    .iter()
                    .find(|(k, _)| *k == kind)
                    .map(|(_, logits)| softmax(logits.view()))
                    .ok_or_else(|| {
                        CascadeError::Configuration(format!("out3c needs the '{kind}' head"))
                    })
            };
            let composed = compose_three_class(
                find(HeadKind::RuleOut)?.view(),
                find(HeadKind::RuleIn)?.view(),
            );
            classification.insert(
                position.min(classification.len()),
                (HeadKind::ThreeClass, composed),
            );
        }

        let binary = match (&self.binary_classifier, &features_out5) {
            (Some(head), Some(features)) => Some(head.forward(features.view())?),
            _ => None,
        };
        let regression = match (&self.regressor, &features_out5) {
            (Some(head), Some(features)) => Some(head.forward(features.view())?),
            _ => None,
        };

        Ok(NetworkOutput {
            classification,
            binary,
            regression,
            curve_params,
            curve,
        })
    }
}

fn encoded(kind: HeadKind, features: &Option<Array2<f64>>) -> Result<&Array2<f64>, CascadeError> {
    features
        .as_ref()
        .ok_or_else(|| CascadeError::Configuration(format!("encoder for '{kind}' was not built")))
}

/// `luke` repeated by the multiplier, then `phys`, `bio`, `onehot` and, for
/// data version 1, `onset`.
fn base_names(target: &TargetInfo) -> Vec<String> {
    let mut names = vec!["luke".to_string(); target.luke_multiplier];
    names.extend(["phys", "bio", "onehot"].map(String::from));
    if target.data_version == 1 {
        names.push("onset".to_string());
    }
    names
}

/// `names` followed by `angio` repeated by the multiplier.
fn append_angio(target: &TargetInfo, mut names: Vec<String>) -> Vec<String> {
    names.extend(std::iter::repeat_n("angio".to_string(), target.luke_multiplier));
    names
}

/// The out5 bundle used when the luke channels are withheld.
fn reduced_names(target: &TargetInfo) -> Vec<String> {
    let mut names: Vec<String> = ["phys", "bio", "onehot"].map(String::from).to_vec();
    if target.data_version == 1 {
        names.push("onset".to_string());
    }
    names.push("angio".to_string());
    names
}

//! Head selection and the analytic 3-class composition.

use crate::config::NetworkSection;
use crate::error::CascadeError;
use ndarray::{Array2, ArrayView2, Axis, Zip};
use std::fmt;
use std::str::FromStr;

/// Classification heads the network can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadKind {
    /// Level-1 rule-out, read off `net_l1`.
    RuleOut,
    /// Level-2 rule-in, read off `net_l2`.
    RuleIn,
    /// Composed from the rule-out and rule-in probabilities; has no parameters.
    ThreeClass,
    /// Outcome classifier, read off the out5 encoder.
    Outcome,
}

impl HeadKind {
    pub fn column(self) -> &'static str {
        match self {
            Self::RuleOut => "outl1",
            Self::RuleIn => "outl2",
            Self::ThreeClass => "out3c",
            Self::Outcome => "out5",
        }
    }
}

impl fmt::Display for HeadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for HeadKind {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outl1" => Ok(Self::RuleOut),
            "outl2" => Ok(Self::RuleIn),
            "out3c" => Ok(Self::ThreeClass),
            "out5" => Ok(Self::Outcome),
            other => Err(CascadeError::Configuration(format!(
                "unknown classification head '{other}' (expected outl1, outl2, out3c or out5)"
            ))),
        }
    }
}

/// Validated description of which heads are active.
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub data_version: u32,
    pub use_luke: bool,
    pub luke_multiplier: usize,
    /// Declared order is the output order.
    pub cls_heads: Vec<(HeadKind, usize)>,
    pub binary_cls_cols: Vec<String>,
    pub regression_cols: Vec<String>,
}

impl TargetInfo {
    pub fn new(
        data_version: u32,
        use_luke: bool,
        luke_multiplier: usize,
        cls_cols: &[(String, usize)],
        binary_cls_cols: Vec<String>,
        regression_cols: Vec<String>,
    ) -> Result<Self, CascadeError> {
        let mut cls_heads: Vec<(HeadKind, usize)> = Vec::with_capacity(cls_cols.len());
        for (name, n_classes) in cls_cols {
            let kind: HeadKind = name.parse()?;
            if cls_heads.iter().any(|(k, _)| *k == kind) {
                return Err(CascadeError::Configuration(format!(
                    "classification head '{kind}' is declared twice"
                )));
            }
            if *n_classes == 0 {
                return Err(CascadeError::Configuration(format!(
                    "classification head '{kind}' needs at least one class"
                )));
            }
            cls_heads.push((kind, *n_classes));
        }

        let info = Self {
            data_version,
            use_luke,
            luke_multiplier,
            cls_heads,
            binary_cls_cols,
            regression_cols,
        };
        if let Some(n) = info.n_classes(HeadKind::ThreeClass) {
            let binary = |kind| info.n_classes(kind) == Some(2);
            if !binary(HeadKind::RuleOut) || !binary(HeadKind::RuleIn) {
                return Err(CascadeError::Configuration(
                    "out3c needs both outl1 and outl2 declared with 2 classes".to_string(),
                ));
            }
            if n != 3 {
                return Err(CascadeError::Configuration(format!(
                    "out3c always has 3 classes, declared {n}"
                )));
            }
        }
        Ok(info)
    }

    pub fn from_section(section: &NetworkSection) -> Result<Self, CascadeError> {
        Self::new(
            section.data_version,
            section.use_luke,
            section.luke_multiplier,
            &section.cls_cols,
            section.binary_cls_cols.clone(),
            section.regression_cols.clone(),
        )
    }

    pub fn n_classes(&self, kind: HeadKind) -> Option<usize> {
        self.cls_heads
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|&(_, n)| n)
    }

    pub fn has(&self, kind: HeadKind) -> bool {
        self.n_classes(kind).is_some()
    }

    /// The out5 encoder feeds the outcome, binary and regression heads.
    pub fn outcome_encoder_active(&self) -> bool {
        self.has(HeadKind::Outcome)
            || !self.binary_cls_cols.is_empty()
            || !self.regression_cols.is_empty()
    }

    /// The trajectory decoder runs when `trop0` is a regression target, or when
    /// the out5 encoder consumes its parameters in place of the luke channels.
    pub fn curve_active(&self) -> bool {
        self.regression_cols.iter().any(|c| c == "trop0")
            || (self.outcome_encoder_active() && !self.use_luke)
    }
}

/// `P(class 0..3)` from the level-1 and level-2 probabilities, renormalised per row.
///
/// A level-2 positive after a level-1 negative counts towards class 0.
pub fn compose_three_class(p1: ArrayView2<f64>, p2: ArrayView2<f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((p1.nrows(), 3));
    Zip::from(out.rows_mut())
        .and(p1.rows())
        .and(p2.rows())
        .for_each(|mut row, a, b| {
            row[0] = a[0] * b[0] + a[0] * b[1];
            row[1] = a[1] * b[0];
            row[2] = a[1] * b[1];
        });
    let totals = out.sum_axis(Axis(1)).insert_axis(Axis(1));
    out / &totals
}

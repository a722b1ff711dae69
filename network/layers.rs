//! Dense building blocks and the shared encoder shape.
//!
//! Layers are inference-time modules: parameters are plain `ndarray` buffers and
//! every forward pass is a function of the input, the parameters and the
//! [`ExecutionContext`]. Nothing here mutates parameters during a forward pass.

use crate::error::CascadeError;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const HIDDEN_UNITS: usize = 512;
pub const DROPOUT_P: f64 = 0.5;
pub const BATCH_NORM_EPS: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// Mode and randomness for one forward pass.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub mode: Mode,
    rng: StdRng,
}

impl ExecutionContext {
    pub fn new(mode: Mode, seed: u64) -> Self {
        Self {
            mode,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn eval() -> Self {
        Self::new(Mode::Eval, 0)
    }

    pub fn train(seed: u64) -> Self {
        Self::new(Mode::Train, seed)
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// Fully connected layer `y = x W + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    /// Shape: `[in_features, out_features]`.
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Linear {
    /// Uniform initialisation in `[-1/sqrt(fan_in), 1/sqrt(fan_in)]`.
    pub fn new(in_features: usize, out_features: usize, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        Self {
            weight: Array2::from_shape_fn((in_features, out_features), |_| {
                rng.gen_range(-bound..=bound)
            }),
            bias: Array1::from_shape_fn(out_features, |_| rng.gen_range(-bound..=bound)),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn parameter_count(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    pub fn forward(&self, input: ArrayView2<f64>) -> Result<Array2<f64>, CascadeError> {
        if input.ncols() != self.in_features() {
            return Err(CascadeError::Configuration(format!(
                "input width mismatch: layer expects {} columns, got {}",
                self.in_features(),
                input.ncols()
            )));
        }
        Ok(input.dot(&self.weight) + &self.bias)
    }
}

/// Batch normalisation over the batch axis with learned scale and shift.
#[derive(Debug, Clone)]
pub struct BatchNorm1d {
    pub gamma: Array1<f64>,
    pub beta: Array1<f64>,
    pub running_mean: Array1<f64>,
    pub running_var: Array1<f64>,
}

impl BatchNorm1d {
    pub fn new(features: usize) -> Self {
        Self {
            gamma: Array1::ones(features),
            beta: Array1::zeros(features),
            running_mean: Array1::zeros(features),
            running_var: Array1::ones(features),
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.gamma.len() + self.beta.len()
    }

    pub fn forward(&self, input: ArrayView2<f64>, mode: Mode) -> Array2<f64> {
        let (mean, var) = match mode {
            Mode::Eval => (self.running_mean.clone(), self.running_var.clone()),
            Mode::Train if input.nrows() > 0 => (
                input.mean_axis(Axis(0)).unwrap_or_else(|| self.running_mean.clone()),
                input.var_axis(Axis(0), 0.0),
            ),
            Mode::Train => (self.running_mean.clone(), self.running_var.clone()),
        };
        let scale = &self.gamma / &var.mapv(|v| (v + BATCH_NORM_EPS).sqrt());
        (&input - &mean) * &scale + &self.beta
    }
}

pub fn relu(input: Array2<f64>) -> Array2<f64> {
    input.mapv_into(|v| v.max(0.0))
}

/// Inverted dropout: surviving activations are scaled by `1 / (1 - p)`.
pub fn dropout(input: Array2<f64>, p: f64, ctx: &mut ExecutionContext) -> Array2<f64> {
    match ctx.mode {
        Mode::Eval => input,
        Mode::Train => {
            let keep = 1.0 - p;
            let rng = ctx.rng();
            input.mapv_into(|v| if rng.gen_bool(keep) { v / keep } else { 0.0 })
        }
    }
}

#[derive(Debug, Clone)]
struct HiddenBlock {
    linear: Linear,
    norm: BatchNorm1d,
}

/// Two `Linear -> BatchNorm1d -> ReLU -> Dropout` blocks of [`HIDDEN_UNITS`] units.
#[derive(Debug, Clone)]
pub struct Encoder {
    blocks: [HiddenBlock; 2],
}

impl Encoder {
    pub fn new(input_width: usize, rng: &mut StdRng) -> Self {
        let first = HiddenBlock {
            linear: Linear::new(input_width, HIDDEN_UNITS, rng),
            norm: BatchNorm1d::new(HIDDEN_UNITS),
        };
        let second = HiddenBlock {
            linear: Linear::new(HIDDEN_UNITS, HIDDEN_UNITS, rng),
            norm: BatchNorm1d::new(HIDDEN_UNITS),
        };
        Self {
            blocks: [first, second],
        }
    }

    pub fn input_width(&self) -> usize {
        self.blocks[0].linear.in_features()
    }

    pub fn output_width(&self) -> usize {
        HIDDEN_UNITS
    }

    pub fn parameter_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.linear.parameter_count() + b.norm.parameter_count())
            .sum()
    }

    pub fn forward(
        &self,
        input: ArrayView2<f64>,
        ctx: &mut ExecutionContext,
    ) -> Result<Array2<f64>, CascadeError> {
        let mut hidden = self.blocks[0].linear.forward(input)?;
        for (depth, block) in self.blocks.iter().enumerate() {
            if depth > 0 {
                hidden = block.linear.forward(hidden.view())?;
            }
            hidden = block.norm.forward(hidden.view(), ctx.mode);
            hidden = relu(hidden);
            hidden = dropout(hidden, DROPOUT_P, ctx);
        }
        Ok(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn linear_init_is_bounded_and_seeded() {
        let mut a = StdRng::seed_from_u64(5);
        let mut b = StdRng::seed_from_u64(5);
        let first = Linear::new(16, 8, &mut a);
        let second = Linear::new(16, 8, &mut b);
        assert_eq!(first.weight, second.weight);
        assert!(first.weight.iter().all(|w| w.abs() <= 0.25));
    }

    #[test]
    fn linear_rejects_wrong_width() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Linear::new(3, 2, &mut rng);
        assert!(matches!(
            layer.forward(Array2::zeros((4, 5)).view()),
            Err(CascadeError::Configuration(_))
        ));
    }

    #[test]
    fn batch_norm_modes() {
        let norm = BatchNorm1d::new(2);
        let x = array![[1.0, 10.0], [3.0, 30.0]];
        let eval = norm.forward(x.view(), Mode::Eval);
        assert_abs_diff_eq!(eval[[0, 0]], 1.0 / (1.0 + BATCH_NORM_EPS).sqrt(), epsilon = 1e-12);

        let train = norm.forward(x.view(), Mode::Train);
        for j in 0..2 {
            assert_abs_diff_eq!(train.column(j).sum(), 0.0, epsilon = 1e-9);
        }
        assert!(train[[0, 0]] < 0.0 && train[[1, 0]] > 0.0);
    }

    #[test]
    fn dropout_is_identity_in_eval_mode() {
        let x = Array2::from_elem((4, 4), 2.0);
        let mut ctx = ExecutionContext::eval();
        assert_eq!(dropout(x.clone(), DROPOUT_P, &mut ctx), x);

        let mut ctx = ExecutionContext::train(3);
        let dropped = dropout(x, DROPOUT_P, &mut ctx);
        assert!(dropped.iter().all(|&v| v == 0.0 || v == 4.0));
    }

    #[test]
    fn encoder_output_shape() {
        let mut rng = StdRng::seed_from_u64(9);
        let encoder = Encoder::new(7, &mut rng);
        let out = encoder
            .forward(Array2::ones((3, 7)).view(), &mut ExecutionContext::eval())
            .unwrap();
        assert_eq!(out.dim(), (3, HIDDEN_UNITS));
        assert!(out.iter().all(|&v| v >= 0.0));
    }
}

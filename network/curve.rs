//! Troponin trajectory decoder.
//!
//! Encoded features are mapped to four parameters `(A, B, alpha, beta)` per
//! sample, made non-negative by taking their absolute value, and the curve
//!
//! ```text
//! f(t) = -A exp(-alpha t) + B exp(-beta t) + ln 3
//! ```
//!
//! is evaluated at each sample's measurement times. A time equal to
//! [`MISSING_TIME`] marks a point that was never measured; it is masked out and
//! reported as 0.

use crate::error::CascadeError;
use crate::network::layers::Linear;
use ndarray::{Array1, Array2, ArrayView2, Zip};
use rand::rngs::StdRng;

pub const CURVE_PARAMS: usize = 4;
pub const MISSING_TIME: f64 = -1e10;

/// Non-negative curve parameters, one entry per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveParams {
    pub a: Array1<f64>,
    pub b: Array1<f64>,
    pub alpha: Array1<f64>,
    pub beta: Array1<f64>,
}

impl CurveParams {
    /// Takes the absolute value of each raw column `[A, B, alpha, beta]`.
    pub fn from_raw(raw: ArrayView2<f64>) -> Result<Self, CascadeError> {
        if raw.ncols() != CURVE_PARAMS {
            return Err(CascadeError::Configuration(format!(
                "curve decoder produced {} columns, expected {}",
                raw.ncols(),
                CURVE_PARAMS
            )));
        }
        let column = |j: usize| raw.column(j).mapv(f64::abs);
        Ok(Self {
            a: column(0),
            b: column(1),
            alpha: column(2),
            beta: column(3),
        })
    }

    pub fn len(&self) -> usize {
        self.a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
    }

    pub fn value_at(&self, sample: usize, t: f64) -> f64 {
        -self.a[sample] * (-self.alpha[sample] * t).exp()
            + self.b[sample] * (-self.beta[sample] * t).exp()
            + 3.0_f64.ln()
    }
}

/// Curve values at every requested time, with the validity mask.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveOutput {
    /// `values[[i, j]]` is the curve of sample `i` at its `j`-th time, or `0.0`
    /// where that time is [`MISSING_TIME`]. The curve is not evaluated there,
    /// so consumers must read `mask` rather than the value.
    pub values: Array2<f64>,
    /// `false` exactly where the requested time was [`MISSING_TIME`].
    pub mask: Array2<bool>,
}

/// Evaluates the curve of each sample at its own time points.
pub fn evaluate_curve(
    params: &CurveParams,
    times: ArrayView2<f64>,
) -> Result<CurveOutput, CascadeError> {
    if times.nrows() != params.len() {
        return Err(CascadeError::integrity(
            "curve time points",
            params.len(),
            times.nrows(),
        ));
    }
    let mask = times.mapv(|t| t != MISSING_TIME);
    let mut values = Array2::<f64>::zeros(times.dim());
    for (sample, row) in values.rows_mut().into_iter().enumerate() {
        Zip::from(row)
            .and(times.row(sample))
            .and(mask.row(sample))
            .for_each(|value, &t, &valid| {
                *value = if valid { params.value_at(sample, t) } else { 0.0 };
            });
    }
    Ok(CurveOutput { values, mask })
}

/// Linear map from encoded features to the raw curve parameters.
#[derive(Debug, Clone)]
pub struct CurveDecoder {
    projection: Linear,
}

impl CurveDecoder {
    pub fn new(in_features: usize, rng: &mut StdRng) -> Self {
        Self {
            projection: Linear::new(in_features, CURVE_PARAMS, rng),
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.projection.parameter_count()
    }

    /// Raw (signed) outputs and the non-negative parameters derived from them.
    pub fn decode(
        &self,
        features: ArrayView2<f64>,
    ) -> Result<(Array2<f64>, CurveParams), CascadeError> {
        let raw = self.projection.forward(features)?;
        let params = CurveParams::from_raw(raw.view())?;
        Ok((raw, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::{Rng, SeedableRng};

    #[test]
    fn parameters_are_non_negative_for_any_input() {
        let mut rng = StdRng::seed_from_u64(42);
        let decoder = CurveDecoder::new(6, &mut rng);
        let features = Array2::from_shape_fn((50, 6), |_| rng.gen_range(-100.0..100.0));
        let (raw, params) = decoder.decode(features.view()).unwrap();
        assert!(raw.iter().any(|&v| v < 0.0));
        for values in [&params.a, &params.b, &params.alpha, &params.beta] {
            assert!(values.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn curve_matches_closed_form_and_masks_missing_times() {
        let params = CurveParams::from_raw(array![[1.0, -2.0, 0.5, -0.1]].view()).unwrap();
        let times = array![[0.0, 3.0, MISSING_TIME]];
        let out = evaluate_curve(&params, times.view()).unwrap();

        assert_abs_diff_eq!(out.values[[0, 0]], -1.0 + 2.0 + 3.0_f64.ln(), epsilon = 1e-12);
        let expected = -(-1.5_f64).exp() + 2.0 * (-0.3_f64).exp() + 3.0_f64.ln();
        assert_abs_diff_eq!(out.values[[0, 1]], expected, epsilon = 1e-12);
        assert_eq!(out.mask, array![[true, true, false]]);
        assert_eq!(out.values[[0, 2]], 0.0);
    }

    #[test]
    fn row_count_mismatch_is_an_integrity_error() {
        let params = CurveParams::from_raw(array![[1.0, 1.0, 1.0, 1.0]].view()).unwrap();
        let err = evaluate_curve(&params, Array2::zeros((2, 3)).view()).unwrap_err();
        assert!(matches!(err, CascadeError::DataIntegrity { .. }));
    }
}

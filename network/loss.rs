use crate::error::CascadeError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Row-wise `log_softmax`, shifted by the row maximum.
pub fn log_softmax(logits: ArrayView2<f64>) -> Array2<f64> {
    let mut out = logits.to_owned();
    for mut row in out.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f64>().ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    out
}

pub fn softmax(logits: ArrayView2<f64>) -> Array2<f64> {
    log_softmax(logits).mapv_into(f64::exp)
}

/// `-sum(target * log_softmax(logits))` per row, averaged over the batch.
pub fn soft_cross_entropy(
    logits: ArrayView2<f64>,
    targets: ArrayView2<f64>,
) -> Result<f64, CascadeError> {
    if logits.dim() != targets.dim() {
        return Err(CascadeError::InvalidInput(format!(
            "logits have shape {:?} but targets have shape {:?}",
            logits.dim(),
            targets.dim()
        )));
    }
    if logits.nrows() == 0 {
        return Err(CascadeError::InvalidInput(
            "cross-entropy of an empty batch".to_string(),
        ));
    }
    let per_row = (&targets * &log_softmax(logits)).sum_axis(Axis(1));
    Ok(-per_row.mean().unwrap_or(f64::NAN))
}

/// Arg-max class per row.
pub fn predict(logits: ArrayView2<f64>) -> Array1<usize> {
    logits
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, &v)| {
                    if v > best.1 { (i, v) } else { best }
                })
                .0
        })
        .collect()
}

/// Number of rows whose arg-max matches the integer target.
pub fn correct(logits: ArrayView2<f64>, targets: ArrayView1<usize>) -> usize {
    predict(logits)
        .iter()
        .zip(targets.iter())
        .filter(|(p, t)| p == t)
        .count()
}

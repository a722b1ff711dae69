//! Level-1 (rule-out) and level-2 (rule-in) label derivation.
//!
//! `y2 = 1` always implies `y1 = 1`, so `y1 + y2` is the ordinal 3-way label
//! used by the evaluator: 0 ruled out, 1 abnormal but not ruled in, 2 ruled in.

use crate::config::LabelScheme;
use crate::data::{LabelColumn, PatientTable, SetTag};
use crate::error::CascadeError;
use ndarray::{Array1, Axis};

/// Binary labels for both cascade levels, aligned to the rows of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeLabels {
    pub y1: Array1<u8>,
    pub y2: Array1<u8>,
}

impl CascadeLabels {
    pub fn new(y1: Array1<u8>, y2: Array1<u8>) -> Result<Self, CascadeError> {
        if y1.len() != y2.len() {
            return Err(CascadeError::integrity("level-2 labels", y1.len(), y2.len()));
        }
        Ok(Self { y1, y2 })
    }

    pub fn len(&self) -> usize {
        self.y1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y1.is_empty()
    }

    /// Ordinal 3-way label `y1 + y2`.
    pub fn three_way(&self) -> Array1<u8> {
        &self.y1 + &self.y2
    }

    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            y1: self.y1.select(Axis(0), rows),
            y2: self.y2.select(Axis(0), rows),
        }
    }

    /// Counts of `[L1-, L1+, L1+ & L2-, L1+ & L2+]`.
    pub fn census(&self) -> [usize; 4] {
        let mut counts = [0usize; 4];
        for (&a, &b) in self.y1.iter().zip(self.y2.iter()) {
            match (a, b) {
                (0, _) => counts[0] += 1,
                (_, 0) => {
                    counts[1] += 1;
                    counts[2] += 1;
                }
                _ => {
                    counts[1] += 1;
                    counts[3] += 1;
                }
            }
        }
        counts
    }
}

/// Labels for every row of `table`.
pub fn get_label(
    table: &PatientTable,
    scheme: &LabelScheme,
) -> Result<CascadeLabels, CascadeError> {
    let (y1, y2): (Vec<u8>, Vec<u8>) = match &table.labels {
        LabelColumn::Categorical(values) => values
            .iter()
            .map(|diagnosis| {
                let level1 = !scheme.level1_negative.contains(diagnosis);
                let level2 = scheme.level2_positive.contains(diagnosis);
                (u8::from(level1), u8::from(level2))
            })
            .unzip(),
        LabelColumn::Ordinal(values) => {
            let mut y1 = Vec::with_capacity(values.len());
            let mut y2 = Vec::with_capacity(values.len());
            for (row, &code) in values.iter().enumerate() {
                if !(code == 0.0 || code == 1.0 || code == 2.0) {
                    return Err(CascadeError::InvalidInput(format!(
                        "label '{}' has value {} at row {}; ordinal labels must be 0, 1 or 2",
                        table.label_name, code, table.row_ids[row]
                    )));
                }
                y1.push(u8::from(code >= 1.0));
                y2.push(u8::from(code >= 2.0));
            }
            (y1, y2)
        }
    };
    CascadeLabels::new(Array1::from_vec(y1), Array1::from_vec(y2))
}

/// Labels for the `val` rows of `table`, the rows a fixed split scores.
pub fn get_val_label(
    table: &PatientTable,
    scheme: &LabelScheme,
) -> Result<CascadeLabels, CascadeError> {
    let rows = table.rows_tagged(|tag| tag == SetTag::Val)?;
    Ok(get_label(table, scheme)?.select(&rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    fn categorical_table(values: &[&str]) -> PatientTable {
        PatientTable::new(
            vec!["x".to_string()],
            Array2::zeros((values.len(), 1)),
            "adjudicatorDiagnosis",
            LabelColumn::Categorical(values.iter().map(|s| s.to_string()).collect()),
            None,
        )
        .unwrap()
    }

    #[test]
    fn categorical_labels_follow_scheme() {
        let table = categorical_table(&["Normal", "T1MI", "Chronic", "T2MI"]);
        let labels = get_label(&table, &LabelScheme::default()).unwrap();
        assert_eq!(labels.y1, array![0, 1, 1, 1]);
        assert_eq!(labels.y2, array![0, 1, 0, 0]);
        assert_eq!(labels.three_way(), array![0, 2, 1, 1]);
        assert_eq!(labels.census(), [1, 3, 2, 1]);
    }

    #[test]
    fn ordinal_labels_are_decoded() {
        let table = PatientTable::new(
            vec!["x".to_string()],
            Array2::zeros((3, 1)),
            "outcome",
            LabelColumn::Ordinal(array![2.0, 0.0, 1.0]),
            None,
        )
        .unwrap();
        let labels = get_label(&table, &LabelScheme::default()).unwrap();
        assert_eq!(labels.y1, array![1, 0, 1]);
        assert_eq!(labels.y2, array![1, 0, 0]);
    }

    #[test]
    fn ordinal_labels_outside_range_are_rejected() {
        let table = PatientTable::new(
            vec!["x".to_string()],
            Array2::zeros((2, 1)),
            "outcome",
            LabelColumn::Ordinal(array![0.0, 3.0]),
            None,
        )
        .unwrap();
        let err = get_label(&table, &LabelScheme::default()).unwrap_err();
        assert!(matches!(err, CascadeError::InvalidInput(_)));
    }

    #[test]
    fn val_labels_use_only_val_rows() {
        let table = categorical_table(&["Normal", "T1MI", "Chronic", "T1MI"])
            .with_set_tags(vec![SetTag::Train, SetTag::Val, SetTag::Train, SetTag::Val])
            .unwrap();
        let labels = get_val_label(&table, &LabelScheme::default()).unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.y2, array![1, 1]);
    }
}

//! # Patient Table Loading and Persistence
//!
//! This module is the only place that touches raw tabular files. It reads the
//! patient table with `polars`, applies the configured exclusions and prefill
//! values, separates bookkeeping columns from model features, and hands the core
//! an owned [`PatientTable`] backed by `ndarray`.
//!
//! - Per-boot fold tags arrive through a [`SetTagSource`], one column per boot.
//! - Row selection always produces a fresh table with contiguous indexing; the
//!   original row index of every row travels with it for audit.
//! - Out-of-bag tables are written back to CSV, one file per boot.

use crate::config::{AngioOrEcg, CascadeConfig};
use crate::error::CascadeError;
use ndarray::{Array1, Array2, Axis};
use polars::prelude::*;
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// A comprehensive error type for reading and writing tabular files.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The required column '{0}' was not found in '{1}'.")]
    ColumnNotFound(String, String),
    #[error(
        "Column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing values were found in column '{0}' and no prefill value is configured for it."
    )]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Unrecognised set tag '{tag}' in column '{column}' (expected train, val or test).")]
    UnknownSetTag { column: String, tag: String },
}

/// Fold membership of one row for one boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetTag {
    Train,
    Val,
    Test,
    /// Row takes no part in this boot.
    Unassigned,
}

impl SetTag {
    pub fn is_in_bag(self) -> bool {
        matches!(self, Self::Train | Self::Val)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
            Self::Unassigned => "",
        }
    }
}

impl FromStr for SetTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "train" => Ok(Self::Train),
            "val" => Ok(Self::Val),
            "test" => Ok(Self::Test),
            "" => Ok(Self::Unassigned),
            other => Err(other.to_string()),
        }
    }
}

/// The label column of the table, kept in its source representation.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelColumn {
    /// Diagnosis categories, mapped to cascade levels by a `LabelScheme`.
    Categorical(Vec<String>),
    /// Ordinal codes `0`, `1`, `2`.
    Ordinal(Array1<f64>),
}

impl LabelColumn {
    pub fn len(&self) -> usize {
        match self {
            Self::Categorical(values) => values.len(),
            Self::Ordinal(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(&self, rows: &[usize]) -> Self {
        match self {
            Self::Categorical(values) => {
                Self::Categorical(rows.iter().map(|&r| values[r].clone()).collect())
            }
            Self::Ordinal(values) => Self::Ordinal(values.select(Axis(0), rows)),
        }
    }
}

/// Tabular patient records: model features plus the columns the protocol needs.
#[derive(Debug, Clone)]
pub struct PatientTable {
    pub feature_names: Vec<String>,
    /// Shape: `[n_rows, feature_names.len()]`.
    pub features: Array2<f64>,
    pub label_name: String,
    pub labels: LabelColumn,
    /// Adjudicated diagnosis, used by the population filters.
    pub diagnosis: Option<Vec<String>>,
    /// Position of each row in the source file.
    pub row_ids: Vec<usize>,
    /// Fold tags of the boot this table was cut for, if any.
    pub set_tags: Option<Vec<SetTag>>,
}

impl PatientTable {
    pub fn new(
        feature_names: Vec<String>,
        features: Array2<f64>,
        label_name: impl Into<String>,
        labels: LabelColumn,
        diagnosis: Option<Vec<String>>,
    ) -> Result<Self, CascadeError> {
        let n = features.nrows();
        if feature_names.len() != features.ncols() {
            return Err(CascadeError::integrity(
                "feature names vs feature matrix columns",
                features.ncols(),
                feature_names.len(),
            ));
        }
        if labels.len() != n {
            return Err(CascadeError::integrity("label column", n, labels.len()));
        }
        if let Some(diagnosis) = &diagnosis {
            if diagnosis.len() != n {
                return Err(CascadeError::integrity("diagnosis column", n, diagnosis.len()));
            }
        }
        Ok(Self {
            feature_names,
            features,
            label_name: label_name.into(),
            labels,
            diagnosis,
            row_ids: (0..n).collect(),
            set_tags: None,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.features.nrows()
    }

    /// Copies `rows` (positions in this table) into a new table indexed `0..rows.len()`.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            feature_names: self.feature_names.clone(),
            features: self.features.select(Axis(0), rows),
            label_name: self.label_name.clone(),
            labels: self.labels.select(rows),
            diagnosis: self
                .diagnosis
                .as_ref()
                .map(|d| rows.iter().map(|&r| d[r].clone()).collect()),
            row_ids: rows.iter().map(|&r| self.row_ids[r]).collect(),
            set_tags: self
                .set_tags
                .as_ref()
                .map(|tags| rows.iter().map(|&r| tags[r]).collect()),
        }
    }

    /// Returns a copy of this table carrying `tags`, one per row.
    pub fn with_set_tags(&self, tags: Vec<SetTag>) -> Result<Self, CascadeError> {
        if tags.len() != self.n_rows() {
            return Err(CascadeError::integrity("set tags", self.n_rows(), tags.len()));
        }
        let mut tagged = self.clone();
        tagged.set_tags = Some(tags);
        Ok(tagged)
    }

    /// Row positions whose set tag satisfies `keep`.
    pub fn rows_tagged(&self, keep: impl Fn(SetTag) -> bool) -> Result<Vec<usize>, CascadeError> {
        let tags = self.set_tags.as_ref().ok_or_else(|| {
            CascadeError::Configuration("table has no set tags assigned".to_string())
        })?;
        Ok(tags
            .iter()
            .enumerate()
            .filter(|&(_, &tag)| keep(tag))
            .map(|(i, _)| i)
            .collect())
    }

    /// Row positions whose diagnosis is one of `allowed`.
    pub fn rows_with_diagnosis(&self, allowed: &[String]) -> Result<Vec<usize>, CascadeError> {
        let diagnosis = self.diagnosis.as_ref().ok_or_else(|| {
            CascadeError::Configuration(
                "a diagnosis filter was requested but the table has no diagnosis column"
                    .to_string(),
            )
        })?;
        Ok(diagnosis
            .iter()
            .enumerate()
            .filter(|(_, d)| allowed.contains(d))
            .map(|(i, _)| i)
            .collect())
    }

    /// Assembles a row-labelled `DataFrame` of the whole table.
    pub fn to_dataframe(&self) -> Result<DataFrame, DataError> {
        let mut columns: Vec<Column> = Vec::with_capacity(self.feature_names.len() + 4);
        let ids: Vec<u64> = self.row_ids.iter().map(|&r| r as u64).collect();
        columns.push(Series::new("row_id".into(), ids).into());

        for (j, name) in self.feature_names.iter().enumerate() {
            let values: Vec<f64> = self.features.column(j).to_vec();
            columns.push(Series::new(name.as_str().into(), values).into());
        }

        match &self.labels {
            LabelColumn::Categorical(values) => {
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                columns.push(Series::new(self.label_name.as_str().into(), values).into());
            }
            LabelColumn::Ordinal(values) => {
                columns.push(Series::new(self.label_name.as_str().into(), values.to_vec()).into());
            }
        }

        if let Some(diagnosis) = &self.diagnosis {
            let name = format!("{}_diagnosis", self.label_name);
            let values: Vec<&str> = diagnosis.iter().map(String::as_str).collect();
            columns.push(Series::new(name.as_str().into(), values).into());
        }

        if let Some(tags) = &self.set_tags {
            let values: Vec<&str> = tags.iter().map(|t| t.as_str()).collect();
            columns.push(Series::new("set".into(), values).into());
        }

        Ok(DataFrame::new(columns)?)
    }

    /// Writes the table as CSV, creating parent directories as needed.
    pub fn write_csv(&self, path: &Path) -> Result<(), DataError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut df = self.to_dataframe()?;
        let mut file = File::create(path)?;
        CsvWriter::new(&mut file)
            .include_header(true)
            .with_separator(b',')
            .finish(&mut df)?;
        Ok(())
    }
}

/// Options that decide which raw columns become features.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub dataset: String,
    pub label_name: String,
    pub angio_or_ecg: AngioOrEcg,
}

/// Loads the base patient table.
///
/// Columns are removed in two passes: the dataset's exclusion list, then the
/// identifier/bookkeeping drop list for the chosen `angio_or_ecg` family. The
/// label column is never dropped; a missing label column is a configuration error.
pub fn load_patient_table(
    path: &Path,
    config: &CascadeConfig,
    options: &LoadOptions,
) -> Result<PatientTable, CascadeError> {
    log::info!("Loading patient table from '{}'", path.display());
    let df = internal::read_tabular(path)?;
    let source = path.display().to_string();
    let present: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    if !present.contains(&options.label_name) {
        return Err(CascadeError::Configuration(format!(
            "label column '{}' is not present in '{}'",
            options.label_name, source
        )));
    }

    let mut removed: HashSet<String> = config
        .excluded(&options.dataset)
        .iter()
        .cloned()
        .collect();
    removed.extend(config.drop_list(&options.dataset, options.angio_or_ecg, &options.label_name));
    removed.insert(options.label_name.clone());

    let feature_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .filter(|name| !removed.contains(name))
        .collect();

    let n = df.height();
    let mut buffer = Vec::with_capacity(n * feature_names.len());
    let mut columns = Vec::with_capacity(feature_names.len());
    for name in &feature_names {
        let prefill = config.prefill.all.get(name).copied();
        columns.push(internal::extract_numeric_column(&df, name, prefill)?);
    }
    for i in 0..n {
        for column in &columns {
            buffer.push(column[i]);
        }
    }
    let features = Array2::from_shape_vec((n, feature_names.len()), buffer)
        .map_err(|_| CascadeError::integrity("feature matrix", n * feature_names.len(), 0))?;

    let labels = internal::extract_label_column(&df, &options.label_name, config)?;

    let diagnosis_name = &config.columns.diagnosis;
    let diagnosis = if present.contains(diagnosis_name) {
        Some(internal::extract_string_column(&df, diagnosis_name)?)
    } else {
        log::warn!(
            "Diagnosis column '{}' not found in '{}'; population filters are unavailable.",
            diagnosis_name,
            source
        );
        None
    };

    log::info!(
        "Loaded {} rows with {} feature columns (label '{}').",
        n,
        feature_names.len(),
        options.label_name
    );

    PatientTable::new(feature_names, features, options.label_name.clone(), labels, diagnosis)
}

/// Supplies the stratified train/val/test tags of one boot, aligned to source rows.
pub trait SetTagSource: Sync {
    fn set_tags(&self, boot: usize) -> Result<Vec<SetTag>, CascadeError>;
}

/// Reads column `set{boot}` from `{prefix}{boot}.csv` inside a directory.
#[derive(Debug, Clone)]
pub struct CsvSetTagSource {
    pub directory: PathBuf,
    pub file_prefix: String,
}

impl CsvSetTagSource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            file_prefix: "data_raw_trop6_phys_".to_string(),
        }
    }

    pub fn path_for(&self, boot: usize) -> PathBuf {
        self.directory.join(format!("{}{}.csv", self.file_prefix, boot))
    }
}

impl SetTagSource for CsvSetTagSource {
    fn set_tags(&self, boot: usize) -> Result<Vec<SetTag>, CascadeError> {
        let path = self.path_for(boot);
        let df = internal::read_tabular(&path)?;
        let column = format!("set{boot}");
        let raw = internal::extract_optional_string_column(&df, &column)
            .map_err(|e| match e {
                DataError::ColumnNotFound(c, _) => {
                    DataError::ColumnNotFound(c, path.display().to_string())
                }
                other => other,
            })?;
        let mut tags = Vec::with_capacity(raw.len());
        for value in raw {
            let tag = match value {
                None => SetTag::Unassigned,
                Some(text) => text.parse::<SetTag>().map_err(|tag| DataError::UnknownSetTag {
                    column: column.clone(),
                    tag,
                })?,
            };
            tags.push(tag);
        }
        Ok(tags)
    }
}

/// Fixed per-boot tags held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemorySetTags {
    pub boots: Vec<Vec<SetTag>>,
}

impl SetTagSource for InMemorySetTags {
    fn set_tags(&self, boot: usize) -> Result<Vec<SetTag>, CascadeError> {
        self.boots.get(boot).cloned().ok_or_else(|| {
            CascadeError::Configuration(format!(
                "no set tags available for boot {boot} ({} boots configured)",
                self.boots.len()
            ))
        })
    }
}

/// Internal helpers shared by the loaders.
mod internal {
    use super::*;

    pub(super) fn read_tabular(path: &Path) -> Result<DataFrame, DataError> {
        let separator = match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref()
        {
            Some("tsv") => b'\t',
            _ => b',',
        };
        let file = File::open(path)?;
        CsvReadOptions::default()
            .with_has_header(true)
            .map_parse_options(|options| options.with_separator(separator))
            .into_reader_with_file_handle(file)
            .finish()
            .map_err(DataError::from)
    }

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
        prefill: Option<f64>,
    ) -> Result<Vec<f64>, DataError> {
        let series = df
            .column(column_name)
            .map_err(|_| DataError::ColumnNotFound(column_name.to_string(), "table".to_string()))?;
        if matches!(series.dtype(), DataType::String) {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            })?;
        let chunked = casted.f64()?;

        let mut values = Vec::with_capacity(chunked.len());
        for value in chunked.into_iter() {
            match (value, prefill) {
                (Some(v), _) if v.is_finite() => values.push(v),
                (Some(_), _) => {
                    return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
                }
                (None, Some(fill)) => values.push(fill),
                (None, None) => {
                    return Err(DataError::MissingValuesFound(column_name.to_string()));
                }
            }
        }
        Ok(values)
    }

    pub(super) fn extract_optional_string_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<Option<String>>, DataError> {
        let series = df
            .column(column_name)
            .map_err(|_| DataError::ColumnNotFound(column_name.to_string(), "table".to_string()))?;
        let casted = series.cast(&DataType::String)?;
        let chunked = casted.str()?;
        Ok(chunked
            .into_iter()
            .map(|v| v.map(|s| s.to_string()))
            .collect())
    }

    pub(super) fn extract_string_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<String>, DataError> {
        extract_optional_string_column(df, column_name)?
            .into_iter()
            .map(|v| v.ok_or_else(|| DataError::MissingValuesFound(column_name.to_string())))
            .collect()
    }

    pub(super) fn extract_label_column(
        df: &DataFrame,
        label_name: &str,
        config: &CascadeConfig,
    ) -> Result<LabelColumn, DataError> {
        let series = df
            .column(label_name)
            .map_err(|_| DataError::ColumnNotFound(label_name.to_string(), "table".to_string()))?;
        if matches!(series.dtype(), DataType::String) {
            Ok(LabelColumn::Categorical(extract_string_column(df, label_name)?))
        } else {
            let prefill = config.prefill.all.get(label_name).copied();
            Ok(LabelColumn::Ordinal(Array1::from_vec(extract_numeric_column(
                df, label_name, prefill,
            )?)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    fn write_csv(content: &str) -> NamedTempFile {
        let mut file = Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "{}", content).unwrap();
        file.flush().unwrap();
        file
    }

    fn options(label: &str) -> LoadOptions {
        LoadOptions {
            dataset: "data3".to_string(),
            label_name: label.to_string(),
            angio_or_ecg: AngioOrEcg::Ecg,
        }
    }

    const TABLE: &str = "idPatient,dataset,adjudicatorDiagnosis,age,phys_hr,angiogram,st_dep\n\
                         1,data3,Normal,54,70,0,0.1\n\
                         2,data3,T1MI,61,,1,0.4\n\
                         3,data3,Chronic,72,88,0,0.0";

    #[test]
    fn loader_applies_drop_lists_and_prefill() {
        let file = write_csv(TABLE);
        let mut config = CascadeConfig::default();
        config.prefill.all.insert("phys_hr".to_string(), 75.0);
        config
            .features
            .ecg
            .insert("data3".to_string(), vec!["st_dep".to_string()]);

        let table =
            load_patient_table(file.path(), &config, &options("adjudicatorDiagnosis")).unwrap();
        assert_eq!(table.feature_names, vec!["age", "phys_hr", "st_dep"]);
        assert_eq!(table.n_rows(), 3);
        assert_abs_diff_eq!(table.features[[1, 1]], 75.0);
        assert_abs_diff_eq!(table.features[[2, 0]], 72.0);
        assert_eq!(
            table.labels,
            LabelColumn::Categorical(vec![
                "Normal".to_string(),
                "T1MI".to_string(),
                "Chronic".to_string()
            ])
        );
        assert_eq!(table.diagnosis.as_ref().unwrap()[2], "Chronic");
    }

    #[test]
    fn loader_rejects_missing_values_without_prefill() {
        let file = write_csv(TABLE);
        let err = load_patient_table(
            file.path(),
            &CascadeConfig::default(),
            &options("adjudicatorDiagnosis"),
        )
        .unwrap_err();
        match err {
            CascadeError::Data(DataError::MissingValuesFound(col)) => assert_eq!(col, "phys_hr"),
            other => panic!("expected MissingValuesFound, got {other:?}"),
        }
    }

    #[test]
    fn missing_label_column_is_a_configuration_error() {
        let file = write_csv(TABLE);
        let err = load_patient_table(file.path(), &CascadeConfig::default(), &options("outcome"))
            .unwrap_err();
        assert!(matches!(err, CascadeError::Configuration(_)), "{err:?}");
    }

    #[test]
    fn select_rows_keeps_source_row_ids() {
        let table = PatientTable::new(
            vec!["a".to_string()],
            Array2::from_shape_vec((4, 1), vec![0.0, 1.0, 2.0, 3.0]).unwrap(),
            "label",
            LabelColumn::Ordinal(Array1::from_vec(vec![0.0, 1.0, 2.0, 1.0])),
            None,
        )
        .unwrap();
        let subset = table.select_rows(&[3, 1]);
        let again = subset.select_rows(&[1]);
        assert_eq!(subset.row_ids, vec![3, 1]);
        assert_eq!(again.row_ids, vec![1]);
        assert_abs_diff_eq!(again.features[[0, 0]], 1.0);
    }

    #[test]
    fn mismatched_label_length_is_a_data_integrity_error() {
        let err = PatientTable::new(
            vec!["a".to_string()],
            Array2::zeros((3, 1)),
            "label",
            LabelColumn::Ordinal(Array1::zeros(2)),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CascadeError::DataIntegrity { expected: 3, found: 2, .. }));
    }

    #[test]
    fn csv_set_tags_are_read_per_boot() {
        let dir = tempfile::tempdir().unwrap();
        let source = CsvSetTagSource::new(dir.path());
        fs::write(source.path_for(2), "idPatient,set2\n1,train\n2,val\n3,test\n4,\n").unwrap();
        let tags = source.set_tags(2).unwrap();
        assert_eq!(
            tags,
            vec![SetTag::Train, SetTag::Val, SetTag::Test, SetTag::Unassigned]
        );

        fs::write(source.path_for(3), "set3\ntrain\nholdout\n").unwrap();
        let err = source.set_tags(3).unwrap_err();
        assert!(matches!(
            err,
            CascadeError::Data(DataError::UnknownSetTag { .. })
        ));
    }

    #[test]
    fn out_of_bag_table_round_trips_through_csv() {
        let table = PatientTable::new(
            vec!["age".to_string(), "hr".to_string()],
            Array2::from_shape_vec((2, 2), vec![50.0, 70.0, 65.0, 90.0]).unwrap(),
            "adjudicatorDiagnosis",
            LabelColumn::Categorical(vec!["Normal".to_string(), "T1MI".to_string()]),
            None,
        )
        .unwrap()
        .with_set_tags(vec![SetTag::Test, SetTag::Test])
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbags").join("out_bag0.csv");
        table.write_csv(&path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        let header = written.lines().next().unwrap();
        assert_eq!(header, "row_id,age,hr,adjudicatorDiagnosis,set");
        assert_eq!(written.lines().count(), 3);
    }
}

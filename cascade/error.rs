//! Error taxonomy shared by the cascade pipeline and the fusion network.
//!
//! Configuration and data-integrity failures indicate a defect in the pipeline
//! feeding the core, so nothing here is retried. Errors raised inside a
//! bootstrap iteration are wrapped in [`CascadeError::Boot`] so the final
//! message names the boot index and the stage that failed.

use crate::data::DataError;
use std::fmt;
use thiserror::Error;

/// Stage of a single bootstrap iteration, reported alongside a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BootStage {
    SetTags,
    Training,
    Labels,
    Thresholding,
    Evaluation,
    Persistence,
}

impl BootStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::SetTags => "set-tag assignment",
            Self::Training => "training",
            Self::Labels => "label extraction",
            Self::Thresholding => "thresholding",
            Self::Evaluation => "evaluation",
            Self::Persistence => "out-of-bag persistence",
        }
    }
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Error, Debug)]
pub enum CascadeError {
    /// Degenerate label/score arrays handed to a pure routine.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Misdeclared feature groups, unknown enum values, missing label columns.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A frame and the arrays derived from it disagree on their row count.
    #[error("Data integrity error in {context}: expected {expected} rows, found {found}")]
    DataIntegrity {
        context: String,
        expected: usize,
        found: usize,
    },

    #[error("Data loading failed: {0}")]
    Data(#[from] DataError),

    #[error("Failed to parse TOML configuration: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to serialize report to TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Linear system solve failed while fitting a classifier: {0}")]
    LinearSystemSolveFailed(ndarray_linalg::error::LinalgError),

    #[error("Boot {boot} failed during {stage}: {source}")]
    Boot {
        boot: usize,
        stage: BootStage,
        #[source]
        source: Box<CascadeError>,
    },
}

impl CascadeError {
    pub(crate) fn integrity(context: impl Into<String>, expected: usize, found: usize) -> Self {
        Self::DataIntegrity {
            context: context.into(),
            expected,
            found,
        }
    }

    /// Attach the boot index and stage to an error raised inside one iteration.
    pub fn in_boot(self, boot: usize, stage: BootStage) -> Self {
        match self {
            already @ Self::Boot { .. } => already,
            other => Self::Boot {
                boot,
                stage,
                source: Box::new(other),
            },
        }
    }
}

/// Extension used at every stage boundary of a bootstrap iteration.
pub trait BootContext<T> {
    fn at_stage(self, boot: usize, stage: BootStage) -> Result<T, CascadeError>;
}

impl<T, E> BootContext<T> for Result<T, E>
where
    E: Into<CascadeError>,
{
    fn at_stage(self, boot: usize, stage: BootStage) -> Result<T, CascadeError> {
        self.map_err(|e| e.into().in_boot(boot, stage))
    }
}

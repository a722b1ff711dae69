#![deny(unused_variables)]

pub mod bootstrap;
pub mod classifier;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod inference;
pub mod labels;
pub mod progress;
pub mod threshold;

#[path = "../network/mod.rs"]
pub mod network;

pub use bootstrap::{BootArtifact, BootSplit, BootstrapSettings, BootstrapTrainer};
pub use classifier::{CascadeTrainer, Classifier, RidgeLogisticSettings, RidgeLogisticTrainer};
pub use config::{AngioOrEcg, CascadeConfig, SplitMethod, ThresholdMethod};
pub use error::{BootStage, CascadeError};
pub use evaluate::{CascadeEvaluator, EvaluationReport};
pub use inference::{CascadeModel, InferenceOutput};
pub use threshold::{ThresholdRule, find_threshold};

//! Multi-head fusion network over routed feature groups.
//!
//! A flat per-patient input vector is cut into named groups by a
//! [`features::FeatureLayout`]. Each head then assembles the groups it needs,
//! runs them through its own encoder, and reads its output off the encoded
//! features. Only heads declared in [`heads::TargetInfo`] are constructed.

pub mod curve;
pub mod features;
pub mod heads;
pub mod layers;
pub mod loss;
pub mod model;

pub use features::{FeatureGroup, FeatureLayout};
pub use heads::{HeadKind, TargetInfo};
pub use layers::{ExecutionContext, Mode};
pub use model::{CascadeNetwork, NetworkOutput};

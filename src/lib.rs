//! Epifit Library
//!
//! Parameter-inference engine for metapopulation epidemic models: a
//! dual-chain (global + chimeric) MCMC driver with per-subpopulation
//! likelihoods, hierarchical priors, resumable on-disk artifacts, and an
//! optional affine-invariant ensemble back end. The forward simulator is an
//! external collaborator behind the [`inference::Simulator`] trait.

pub mod inference;

// Re-export the embedding surface at the crate root for convenience.
pub use inference::{
    ExpandedSpecs, FittingWindow, InferenceConfig, InferenceError, ObservationBundle,
    ParamSample, Simulator, Trajectory,
};

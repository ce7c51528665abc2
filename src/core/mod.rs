//! Core map-making logic

pub mod catalogue;
pub mod coadd;
pub mod config;
pub mod convergence;
pub mod masking;
pub mod pointing;
pub mod units;

// Re-export main types
pub use catalogue::{
    assemble_cube, CatalogueAssembler, CatalogueOptions, CatalogueProduct, StokesCube,
};
pub use coadd::{CoaddEngine, CoaddRequest};
pub use config::{ConfigComposer, ConfigOverlay, ResolvedConfig, SolverTarget};
pub use convergence::{
    backoff, seed_thresholds, ConvergenceController, ConvergenceParams, SolveOutcome,
    ThresholdSeeds,
};
pub use masking::{MaskBuilder, MaskBuilderParams, MaskPass, MaskResult, MaskSet};
pub use pointing::{PointingCorrector, PointingParams, PointingTable};
pub use units::{catalogue_fcf, reference_conversion, standard_fcf};

//! File handling: input classification, caches, metadata sidecars and the
//! run workspace

pub mod cache;
pub mod classify;
pub mod manifest;
pub mod metadata;
pub mod workspace;

pub use cache::{CacheManager, ReuseDecision};
pub use classify::{Classification, ClassifiedFile, Classifier, ComponentFiles};
pub use metadata::ArtifactMetadata;
pub use workspace::{CancelHandle, Workspace};

//! Provenance sidecars written next to every map the pipeline creates.
//!
//! A map `X.sdf` is accompanied by `X.meta.xml`, which records the
//! convergence threshold used to make it and the pointing corrections that
//! were applied to it or found to be required afterwards.

use crate::types::{
    AngularOffset, MaskMode, ObservationKey, PipelineError, PipelineResult, StokesComponent,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "artifactMetadata")]
pub struct ArtifactMetadata {
    #[serde(rename = "key")]
    pub key: String,
    #[serde(rename = "component")]
    pub component: String,
    #[serde(rename = "maskMode")]
    pub mask_mode: String,
    #[serde(rename = "units")]
    pub units: String,
    #[serde(rename = "thresholdUsed", default, skip_serializing_if = "Option::is_none")]
    pub threshold_used: Option<f64>,
    #[serde(rename = "appliedCorrection", default, skip_serializing_if = "Option::is_none")]
    pub applied_correction: Option<AngularOffset>,
    #[serde(rename = "requiredCorrection", default, skip_serializing_if = "Option::is_none")]
    pub required_correction: Option<AngularOffset>,
    #[serde(rename = "created")]
    pub created: DateTime<Utc>,
}

impl ArtifactMetadata {
    pub fn new(key: ObservationKey, component: StokesComponent, mode: MaskMode) -> Self {
        Self {
            key: key.to_string(),
            component: component.label().to_string(),
            mask_mode: mode.tag().to_string(),
            units: "pW".to_string(),
            threshold_used: None,
            applied_correction: None,
            required_correction: None,
            created: Utc::now(),
        }
    }

    pub fn observation_key(&self) -> PipelineResult<ObservationKey> {
        self.key.parse()
    }

    pub fn stokes_component(&self) -> PipelineResult<StokesComponent> {
        self.component.parse()
    }

    pub fn mode(&self) -> Option<MaskMode> {
        MaskMode::from_tag(&self.mask_mode)
    }
}

/// Location of the sidecar belonging to `artifact`
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    artifact.with_extension("meta.xml")
}

/// Read the sidecar of `artifact`. `Ok(None)` when there is none.
pub fn read_metadata(artifact: &Path) -> PipelineResult<Option<ArtifactMetadata>> {
    let path = sidecar_path(artifact);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let metadata = quick_xml::de::from_str::<ArtifactMetadata>(&content).map_err(|e| {
        PipelineError::Metadata(format!("Failed to parse {}: {}", path.display(), e))
    })?;
    Ok(Some(metadata))
}

/// Write (or replace) the sidecar of `artifact`
pub fn write_metadata(artifact: &Path, metadata: &ArtifactMetadata) -> PipelineResult<()> {
    let path = sidecar_path(artifact);
    let xml = quick_xml::se::to_string(metadata).map_err(|e| {
        PipelineError::Metadata(format!(
            "Failed to serialise metadata for {}: {}",
            artifact.display(),
            e
        ))
    })?;
    std::fs::write(&path, xml)?;
    log::debug!("Wrote metadata {}", path.display());
    Ok(())
}

/// Delete an artifact and its sidecar, ignoring files that are already gone
pub fn remove_artifact(artifact: &Path) -> PipelineResult<()> {
    for path in [artifact.to_path_buf(), sidecar_path(artifact)] {
        match std::fs::remove_file(&path) {
            Ok(()) => log::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

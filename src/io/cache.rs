//! Reuse decisions for the two long-lived caches: decomposed component
//! time-series and per-observation maps.

use crate::io::classify::{map_file_name, Classifier};
use crate::io::metadata::{read_metadata, sidecar_path, ArtifactMetadata};
use crate::types::{
    AngularOffset, ArtifactKind, MaskMode, ObservationId, ObservationKey, PipelineResult,
    StokesComponent, Subarray, Waveband,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum ReuseDecision {
    /// Existing files that can be used as they are
    Reuse(Vec<PathBuf>),
    /// Why the artifact has to be made again
    Regenerate(String),
}

impl ReuseDecision {
    pub fn is_reuse(&self) -> bool {
        matches!(self, ReuseDecision::Reuse(_))
    }
}

/// Looks up cached artifacts. Never creates, modifies or deletes anything.
pub struct CacheManager {
    series_dir: PathBuf,
    map_dir: PathBuf,
    reuse: bool,
    classifier: Classifier,
}

impl CacheManager {
    pub fn new(series_dir: PathBuf, map_dir: PathBuf, reuse: bool) -> PipelineResult<Self> {
        Ok(Self {
            series_dir,
            map_dir,
            reuse,
            classifier: Classifier::new()?,
        })
    }

    pub fn series_dir(&self) -> &Path {
        &self.series_dir
    }

    pub fn map_dir(&self) -> &Path {
        &self.map_dir
    }

    pub fn reuse_enabled(&self) -> bool {
        self.reuse
    }

    /// Where the map for (key, component) made under `mode` lives
    pub fn map_path(
        &self,
        key: &ObservationKey,
        component: StokesComponent,
        mode: MaskMode,
    ) -> PathBuf {
        self.map_dir.join(map_file_name(key, component, mode))
    }

    /// Decide whether an existing per-observation map can be reused
    pub fn check_map(
        &self,
        key: &ObservationKey,
        component: StokesComponent,
        mode: MaskMode,
    ) -> ReuseDecision {
        let path = self.map_path(key, component, mode);
        if !self.reuse {
            return ReuseDecision::Regenerate("reuse disabled".to_string());
        }
        if !path.is_file() {
            return ReuseDecision::Regenerate(format!("{} does not exist", path.display()));
        }

        // A sidecar, when present, must describe this very artifact
        match read_metadata(&path) {
            Ok(Some(meta)) => {
                let matches = meta.observation_key().ok() == Some(*key)
                    && meta.stokes_component().ok() == Some(component)
                    && meta.mode() == Some(mode);
                if !matches {
                    return ReuseDecision::Regenerate(format!(
                        "metadata of {} describes a different artifact",
                        path.display()
                    ));
                }
            }
            Ok(None) => {}
            Err(e) => return ReuseDecision::Regenerate(e.to_string()),
        }
        ReuseDecision::Reuse(vec![path])
    }

    /// Decide whether the decomposed time-series of an observation can be
    /// reused. All four subarrays must contribute the same, non-zero number
    /// of files to each of the three components.
    pub fn check_series(
        &self,
        id: &ObservationId,
        band: Waveband,
    ) -> PipelineResult<ReuseDecision> {
        if !self.reuse {
            return Ok(ReuseDecision::Regenerate("reuse disabled".to_string()));
        }
        if !self.series_dir.is_dir() {
            return Ok(ReuseDecision::Regenerate(format!(
                "{} does not exist",
                self.series_dir.display()
            )));
        }

        let mut counts: BTreeMap<(Subarray, StokesComponent), usize> = BTreeMap::new();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.series_dir)? {
            let path = entry?.path();
            let Some(file) = self.classifier.identify(&path).ok().flatten() else {
                continue;
            };
            if file.kind != ArtifactKind::ComponentSeries
                || file.key.observation_id() != *id
                || file.band != Some(band)
            {
                continue;
            }
            if let (Some(sub), Some(comp)) = (file.subarray, file.component) {
                *counts.entry((sub, comp)).or_default() += 1;
                files.push(path);
            }
        }

        let expected: Vec<usize> = Subarray::ALL
            .iter()
            .flat_map(|&sub| {
                StokesComponent::CUBE_ORDER
                    .iter()
                    .map(move |&comp| (sub, comp))
            })
            .map(|slot| counts.get(&slot).copied().unwrap_or(0))
            .collect();

        let first = expected[0];
        if first == 0 || expected.iter().any(|&n| n != first) {
            return Ok(ReuseDecision::Regenerate(format!(
                "{} cached time-series files for {} have inconsistent counts {:?}",
                files.len(),
                id,
                expected
            )));
        }
        files.sort();
        Ok(ReuseDecision::Reuse(files))
    }

    fn map_metadata(&self) -> PipelineResult<Vec<ArtifactMetadata>> {
        let mut found = Vec::new();
        if !self.map_dir.is_dir() {
            return Ok(found);
        }
        for entry in std::fs::read_dir(&self.map_dir)? {
            let path = entry?.path();
            let is_map = self
                .classifier
                .identify(&path)
                .ok()
                .flatten()
                .map_or(false, |f| f.kind == ArtifactKind::Map);
            if !is_map || !sidecar_path(&path).exists() {
                continue;
            }
            match read_metadata(&path) {
                Ok(Some(meta)) => found.push(meta),
                Ok(None) => {}
                Err(e) => log::warn!("Ignoring unreadable metadata: {}", e),
            }
        }
        Ok(found)
    }

    /// Convergence threshold recorded by the oldest cached map made under
    /// `mode`, together with its key
    pub fn inherited_threshold(&self, mode: MaskMode) -> PipelineResult<Option<(f64, String)>> {
        Ok(self
            .map_metadata()?
            .into_iter()
            .filter(|m| m.mode() == Some(mode))
            .filter_map(|m| m.threshold_used.map(|t| (m.created, t, m.key)))
            .min_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, threshold, key)| (threshold, key)))
    }

    /// Pointing correction measured for this chunk by an earlier run
    pub fn stored_correction(
        &self,
        key: &ObservationKey,
        mode: MaskMode,
    ) -> PipelineResult<Option<AngularOffset>> {
        let path = self.map_path(key, StokesComponent::Intensity, mode);
        Ok(read_metadata(&path)?.and_then(|m| m.required_correction))
    }
}

//! Input classification and grouping by observation.
//!
//! File names carry everything needed to identify an input:
//!
//! * raw exposures: `s8a20160101_00012_0003.sdf`
//! * component time-series: `s8a20160101_00012_0001_QT.sdf`
//! * per-observation maps: `20160101_00012_0001_auto_qmap.sdf`
//!
//! Every kind derives its [`ObservationKey`] through
//! [`ObservationKey::from_parts`], so series and maps of the same chunk
//! always group under the same key.

use crate::types::{
    ArtifactKind, MaskMode, ObservationError, ObservationId, ObservationKey, ObservationResult,
    PipelineError, PipelineResult, StokesComponent, Subarray, Waveband,
};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// A recognised input file
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedFile {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub key: ObservationKey,
    pub component: Option<StokesComponent>,
    pub band: Option<Waveband>,
    pub subarray: Option<Subarray>,
    pub mask_mode: Option<MaskMode>,
}

/// Disjoint partitions of the inputs
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub raw: Vec<ClassifiedFile>,
    pub series: Vec<ClassifiedFile>,
    pub maps: Vec<ClassifiedFile>,
    pub rejects: Vec<PathBuf>,
    /// Raw sub-files that should exist given the rest of the observation
    pub missing: Vec<String>,
}

impl Classification {
    pub fn accepted(&self) -> usize {
        self.raw.len() + self.series.len() + self.maps.len()
    }

    /// The waveband shared by all raw and series inputs
    pub fn waveband(&self) -> PipelineResult<Option<Waveband>> {
        let bands: BTreeSet<char> = self
            .raw
            .iter()
            .chain(self.series.iter())
            .filter_map(|f| f.band.map(|b| b.digit()))
            .collect();
        match bands.len() {
            0 => Ok(None),
            1 => Ok(bands.iter().next().and_then(|&d| Waveband::from_digit(d))),
            _ => Err(PipelineError::Consistency(
                "Inputs mix 450um and 850um data".to_string(),
            )),
        }
    }
}

/// Per-component file lists for one observation chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentFiles {
    pub first: Vec<PathBuf>,
    pub second: Vec<PathBuf>,
    pub intensity: Vec<PathBuf>,
}

impl ComponentFiles {
    pub fn get(&self, component: StokesComponent) -> &[PathBuf] {
        match component {
            StokesComponent::First => &self.first,
            StokesComponent::Second => &self.second,
            StokesComponent::Intensity => &self.intensity,
        }
    }

    pub fn push(&mut self, component: StokesComponent, path: PathBuf) {
        match component {
            StokesComponent::First => self.first.push(path),
            StokesComponent::Second => self.second.push(path),
            StokesComponent::Intensity => self.intensity.push(path),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_empty() && self.second.is_empty() && self.intensity.is_empty()
    }

    /// The requested components must have the same, non-zero number of
    /// files
    pub fn check_consistent(
        &self,
        key: &ObservationKey,
        components: &[StokesComponent],
    ) -> ObservationResult<()> {
        let counts: Vec<usize> = components.iter().map(|c| self.get(*c).len()).collect();
        let equal = counts.windows(2).all(|w| w[0] == w[1]);
        if equal && counts.first().map_or(true, |n| *n > 0) {
            return Ok(());
        }
        let listed: Vec<String> = components
            .iter()
            .zip(&counts)
            .map(|(c, n)| format!("{} ({})", c.map_letter().to_ascii_uppercase(), n))
            .collect();
        Err(ObservationError::Consistency {
            key: *key,
            message: format!("unequal numbers of time-series files: {}", listed.join(", ")),
        })
    }
}

/// Recognises pipeline files by name
pub struct Classifier {
    raw: Regex,
    series: Regex,
    map: Regex,
}

impl Classifier {
    pub fn new() -> PipelineResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| {
                PipelineError::InvalidConfiguration(format!(
                    "Bad file name pattern {}: {}",
                    pattern, e
                ))
            })
        };
        Ok(Self {
            raw: compile(r"^s([48])([a-d])(\d{8})_(\d{5})_(\d{4})\.sdf$")?,
            series: compile(r"^s([48])([a-d])(\d{8})_(\d{5})_(\d{4})_(QT|UT|IT)\.sdf$")?,
            map: compile(r"^(\d{8})_(\d{5})_(\d{4})_(auto|circle|ext)_([iqu])map\.sdf$")?,
        })
    }

    /// Identify one file from its name. `Ok(None)` means the file has
    /// nothing to do with this pipeline.
    pub fn identify(&self, path: &Path) -> PipelineResult<Option<ClassifiedFile>> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };

        if let Some(caps) = self.series.captures(name) {
            let key = ObservationKey::from_parts(&caps[3], &caps[4], &caps[5])?;
            return Ok(Some(ClassifiedFile {
                path: path.to_path_buf(),
                kind: ArtifactKind::ComponentSeries,
                key,
                component: StokesComponent::from_series_suffix(&caps[6]),
                band: caps[1].chars().next().and_then(Waveband::from_digit),
                subarray: caps[2].chars().next().and_then(Subarray::from_letter),
                mask_mode: None,
            }));
        }

        if let Some(caps) = self.raw.captures(name) {
            let key = ObservationKey::from_parts(&caps[3], &caps[4], &caps[5])?;
            return Ok(Some(ClassifiedFile {
                path: path.to_path_buf(),
                kind: ArtifactKind::RawExposure,
                key,
                component: None,
                band: caps[1].chars().next().and_then(Waveband::from_digit),
                subarray: caps[2].chars().next().and_then(Subarray::from_letter),
                mask_mode: None,
            }));
        }

        if let Some(caps) = self.map.captures(name) {
            let key = ObservationKey::from_parts(&caps[1], &caps[2], &caps[3])?;
            return Ok(Some(ClassifiedFile {
                path: path.to_path_buf(),
                kind: ArtifactKind::Map,
                key,
                component: caps[5].chars().next().and_then(StokesComponent::from_map_letter),
                band: None,
                subarray: None,
                mask_mode: MaskMode::from_tag(&caps[4]),
            }));
        }

        Ok(None)
    }

    /// Partition `inputs` into raw exposures, component series, maps and
    /// rejects. Duplicate paths are classified once.
    pub fn classify(&self, inputs: &[PathBuf]) -> PipelineResult<Classification> {
        let mut result = Classification::default();
        let mut seen = BTreeSet::new();

        for path in inputs {
            if !seen.insert(path.clone()) {
                log::debug!("Ignoring duplicate input {}", path.display());
                continue;
            }
            if !path.exists() {
                return Err(PipelineError::Classification(format!(
                    "Input file {} does not exist",
                    path.display()
                )));
            }
            match self.identify(path)? {
                Some(file) => match file.kind {
                    ArtifactKind::RawExposure => result.raw.push(file),
                    ArtifactKind::ComponentSeries => result.series.push(file),
                    ArtifactKind::Map => result.maps.push(file),
                },
                None => result.rejects.push(path.clone()),
            }
        }

        result.missing = missing_raw_files(&result.raw);

        if !result.rejects.is_empty() {
            let names: Vec<String> =
                result.rejects.iter().map(|p| p.display().to_string()).collect();
            log::warn!(
                "⚠️  {} input files are not recognised and will be ignored: {}",
                names.len(),
                names.join(", ")
            );
        }
        if !result.missing.is_empty() {
            log::warn!(
                "⚠️  {} expected raw files were not supplied: {}",
                result.missing.len(),
                result.missing.join(", ")
            );
        }

        log::info!(
            "Classified {} inputs: {} raw, {} time-series, {} maps, {} rejected",
            seen.len(),
            result.raw.len(),
            result.series.len(),
            result.maps.len(),
            result.rejects.len()
        );
        Ok(result)
    }
}

/// For each observation, every subarray seen should have every subscan in
/// the range of subscans seen
fn missing_raw_files(raw: &[ClassifiedFile]) -> Vec<String> {
    let mut missing = Vec::new();
    for (id, files) in group_raw(raw) {
        let subarrays: BTreeSet<Subarray> = files.iter().filter_map(|f| f.subarray).collect();
        let subscans: BTreeSet<u32> = files.iter().map(|f| f.key.chunk).collect();
        let band = files.iter().find_map(|f| f.band).unwrap_or_default();
        let (Some(&lo), Some(&hi)) = (subscans.first(), subscans.last()) else {
            continue;
        };
        let present: BTreeSet<(Subarray, u32)> = files
            .iter()
            .filter_map(|f| f.subarray.map(|s| (s, f.key.chunk)))
            .collect();

        for subarray in &subarrays {
            for subscan in lo..=hi {
                if !present.contains(&(*subarray, subscan)) {
                    missing.push(format!(
                        "s{}{}{}_{:04}.sdf",
                        band.digit(),
                        subarray.letter(),
                        id,
                        subscan
                    ));
                }
            }
        }
    }
    missing
}

/// Raw exposures grouped by observation
pub fn group_raw(raw: &[ClassifiedFile]) -> BTreeMap<ObservationId, Vec<ClassifiedFile>> {
    let mut groups: BTreeMap<ObservationId, Vec<ClassifiedFile>> = BTreeMap::new();
    for file in raw {
        groups.entry(file.key.observation_id()).or_default().push(file.clone());
    }
    groups
}

/// Component time-series grouped by observation chunk
pub fn group_series(series: &[ClassifiedFile]) -> BTreeMap<ObservationKey, ComponentFiles> {
    let mut groups: BTreeMap<ObservationKey, ComponentFiles> = BTreeMap::new();
    for file in series {
        if let Some(component) = file.component {
            groups.entry(file.key).or_default().push(component, file.path.clone());
        }
    }
    groups
}

/// Cache file name of a per-observation map
pub fn map_file_name(key: &ObservationKey, component: StokesComponent, mode: MaskMode) -> String {
    format!("{}_{}_{}map.sdf", key, mode.tag(), component.map_letter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn test_identify_each_kind() {
        let classifier = Classifier::new().unwrap();

        let raw = classifier.identify(Path::new("s8a20160101_00012_0003.sdf")).unwrap().unwrap();
        assert_eq!(raw.kind, ArtifactKind::RawExposure);
        assert_eq!(raw.key.chunk, 3);
        assert_eq!(raw.subarray, Some(Subarray::A));
        assert_eq!(raw.band, Some(Waveband::Band850));

        let series = classifier
            .identify(Path::new("s4d20160101_00012_0001_UT.sdf"))
            .unwrap()
            .unwrap();
        assert_eq!(series.kind, ArtifactKind::ComponentSeries);
        assert_eq!(series.component, Some(StokesComponent::Second));
        assert_eq!(series.band, Some(Waveband::Band450));

        let map = classifier
            .identify(Path::new("20160101_00012_0001_circle_imap.sdf"))
            .unwrap()
            .unwrap();
        assert_eq!(map.kind, ArtifactKind::Map);
        assert_eq!(map.component, Some(StokesComponent::Intensity));
        assert_eq!(map.mask_mode, Some(MaskMode::Circle));

        assert_eq!(series.key, map.key);
        assert!(classifier.identify(Path::new("notes.txt")).unwrap().is_none());
    }

    #[test]
    fn test_impossible_date_is_an_error() {
        let classifier = Classifier::new().unwrap();
        let err = classifier.identify(Path::new("s8a20161301_00012_0003.sdf")).unwrap_err();
        assert!(matches!(err, PipelineError::Classification(_)));
    }

    #[test]
    fn test_classify_partitions_without_duplicates() {
        let dir = TempDir::new().unwrap();
        let q = touch(dir.path(), "s8a20160101_00012_0001_QT.sdf");
        let u = touch(dir.path(), "s8a20160101_00012_0001_UT.sdf");
        let i = touch(dir.path(), "s8a20160101_00012_0001_IT.sdf");
        let map = touch(dir.path(), "20160101_00012_0001_auto_imap.sdf");
        let junk = touch(dir.path(), "README");

        let inputs = vec![q.clone(), u, i, map, junk.clone(), q];
        let result = Classifier::new().unwrap().classify(&inputs).unwrap();
        assert_eq!(result.series.len(), 3);
        assert_eq!(result.maps.len(), 1);
        assert_eq!(result.rejects, vec![junk]);
        assert_eq!(result.accepted() + result.rejects.len(), 5);

        let series = group_series(&result.series);
        assert_eq!(series.len(), 1);
        let key = *series.keys().next().unwrap();
        assert_eq!(result.maps[0].key, key);
        series[&key].check_consistent(&key, &StokesComponent::PROCESSING_ORDER).unwrap();
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let err = Classifier::new()
            .unwrap()
            .classify(&[PathBuf::from("/definitely/not/here/s8a20160101_00012_0001.sdf")])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Classification(_)));
    }

    #[test]
    fn test_missing_raw_subfiles_are_reported() {
        let dir = TempDir::new().unwrap();
        let inputs = vec![
            touch(dir.path(), "s8a20160101_00012_0001.sdf"),
            touch(dir.path(), "s8a20160101_00012_0002.sdf"),
            touch(dir.path(), "s8a20160101_00012_0003.sdf"),
            touch(dir.path(), "s8b20160101_00012_0001.sdf"),
            touch(dir.path(), "s8b20160101_00012_0003.sdf"),
        ];
        let result = Classifier::new().unwrap().classify(&inputs).unwrap();
        assert_eq!(result.raw.len(), 5);
        assert_eq!(result.missing, vec!["s8b20160101_00012_0002.sdf".to_string()]);
        assert_eq!(group_raw(&result.raw).len(), 1);
    }

    #[test]
    fn test_unequal_component_counts_are_inconsistent() {
        let key = ObservationKey::from_parts("20160101", "00012", "0001").unwrap();
        let mut files = ComponentFiles::default();
        files.push(StokesComponent::First, PathBuf::from("q"));
        files.push(StokesComponent::Second, PathBuf::from("u"));
        let all = StokesComponent::PROCESSING_ORDER;
        assert!(matches!(
            files.check_consistent(&key, &all),
            Err(ObservationError::Consistency { .. })
        ));
        // Only the components being made are compared
        files.check_consistent(&key, &[StokesComponent::First, StokesComponent::Second]).unwrap();
        assert!(files.check_consistent(&key, &[StokesComponent::Intensity]).is_err());
    }

    #[test]
    fn test_map_file_name_encodes_mode() {
        let key = ObservationKey::from_parts("20160101", "00012", "0001").unwrap();
        assert_eq!(
            map_file_name(&key, StokesComponent::First, MaskMode::External),
            "20160101_00012_0001_ext_qmap.sdf"
        );
    }
}

//! The workflow controller.
//!
//! A run classifies its inputs, turns raw exposures into component
//! time-series (reusing cached ones), builds masks, makes one map per
//! observation chunk and component (reusing cached maps), coadds them,
//! measures pointing corrections for new intensity maps and finally
//! tabulates a vector catalogue. Everything runs inside a scratch
//! [`Workspace`] that is released exactly once however the run ends.

use crate::core::catalogue::{CatalogueAssembler, CatalogueOptions, CatalogueProduct};
use crate::core::coadd::{CoaddEngine, CoaddRequest};
use crate::core::config::{
    ConfigComposer, ConfigOverlay, ResolvedConfig, SolverTarget, NUMITER_KEY, THRESHOLD_KEY,
};
use crate::core::convergence::{seed_thresholds, ConvergenceController};
use crate::core::masking::{MaskBuilder, MaskBuilderParams};
use crate::core::pointing::{PointingCorrector, PointingParams, PointingTable};
use crate::core::units::reference_conversion;
use crate::engines::{Engines, SolveRequest};
use crate::io::cache::{CacheManager, ReuseDecision};
use crate::io::classify::{
    group_raw, group_series, Classification, ClassifiedFile, Classifier, ComponentFiles,
};
use crate::io::manifest::write_manifest;
use crate::io::metadata::{read_metadata, write_metadata, ArtifactMetadata};
use crate::io::workspace::{CancelHandle, Workspace};
use crate::types::{
    Artifact, ArtifactKind, CoaddProduct, ConvergenceOutcome, ExternalMask, MaskMode, MaskSpec,
    ObservationError, ObservationId, ObservationKey, PipelineError, PipelineResult,
    PointingCorrection, StokesComponent, VariancePolicy, Waveband,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Everything a run needs to know, apart from its inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename = "runConfig", default)]
pub struct RunConfig {
    /// Coadded I map
    pub intensity_output: Option<PathBuf>,
    /// Coadded Q map
    pub first_output: Option<PathBuf>,
    /// Coadded U map
    pub second_output: Option<PathBuf>,
    /// Vector catalogue; forces all three coadds
    pub catalogue: Option<PathBuf>,
    pub magnitude_map: Option<PathBuf>,
    /// Catalogue pixel size in arc-seconds
    pub bin_size: Option<f64>,
    /// Map pixel size in arc-seconds
    pub pixel_size: Option<f64>,
    /// Cache of decomposed time-series; scratch space when unset
    pub series_dir: Option<PathBuf>,
    /// Cache of per-observation maps; scratch space when unset
    pub map_dir: Option<PathBuf>,
    pub mask: MaskSpec,
    /// Map defining the output grid and the pointing reference
    pub reference: Option<PathBuf>,
    /// FCF used to bring `reference` back to pW
    pub reference_fcf: Option<f64>,
    /// Correct Q and U for instrumental polarisation. Defaults to on when
    /// Q or U are produced.
    pub ip_correction: Option<bool>,
    pub ip_reference: Option<PathBuf>,
    /// Reference direction for the decomposition
    pub north: String,
    pub reuse: bool,
    /// Keep the scratch workspace after the run
    pub retain: bool,
    pub variance_policy: VariancePolicy,
    /// User overlay applied to every map
    pub config: String,
    /// User overlay for I maps
    pub intensity_config: String,
    /// User overlay for Q and U maps
    pub polarised_config: String,
    pub debias: bool,
    /// Tabulate in mJy/beam rather than pW
    pub jansky: bool,
    /// Jy/beam per pW for the catalogue
    pub fcf: Option<f64>,
    /// Where to list the maps created by this run
    pub new_maps: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            intensity_output: None,
            first_output: None,
            second_output: None,
            catalogue: None,
            magnitude_map: None,
            bin_size: None,
            pixel_size: None,
            series_dir: None,
            map_dir: None,
            mask: MaskSpec::Auto,
            reference: None,
            reference_fcf: None,
            ip_correction: None,
            ip_reference: None,
            north: "TRACKING".to_string(),
            reuse: true,
            retain: false,
            variance_policy: VariancePolicy::PropagateFromInputs,
            config: String::new(),
            intensity_config: String::new(),
            polarised_config: String::new(),
            debias: false,
            jansky: true,
            fcf: None,
            new_maps: None,
        }
    }
}

impl RunConfig {
    pub fn from_xml_str(xml: &str) -> PipelineResult<Self> {
        quick_xml::de::from_str(xml).map_err(|e| {
            PipelineError::InvalidConfiguration(format!("Failed to parse run configuration: {}", e))
        })
    }

    pub fn from_xml_file(path: &Path) -> PipelineResult<Self> {
        let xml = std::fs::read_to_string(path)?;
        Self::from_xml_str(&xml)
    }

    /// Coadd requested by the user for `component`
    pub fn output(&self, component: StokesComponent) -> Option<&Path> {
        match component {
            StokesComponent::Intensity => self.intensity_output.as_deref(),
            StokesComponent::First => self.first_output.as_deref(),
            StokesComponent::Second => self.second_output.as_deref(),
        }
    }

    pub fn ip_enabled(&self) -> bool {
        self.ip_correction.unwrap_or(
            self.first_output.is_some() || self.second_output.is_some() || self.catalogue.is_some(),
        )
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let no_coadds = StokesComponent::PROCESSING_ORDER
            .iter()
            .all(|c| self.output(*c).is_none());
        if self.catalogue.is_none() && no_coadds {
            return Err(PipelineError::InvalidConfiguration(
                "No output coadd or catalogue requested".to_string(),
            ));
        }
        if let MaskSpec::External(mask) = &self.mask {
            mask.validate()?;
        }
        if let Some(bin) = self.bin_size {
            if !(bin > 0.0) {
                return Err(PipelineError::InvalidConfiguration(format!(
                    "Catalogue bin size must be positive, got {}",
                    bin
                )));
            }
        }
        if self.magnitude_map.is_some() && self.catalogue.is_none() {
            return Err(PipelineError::InvalidConfiguration(
                "A magnitude map needs a catalogue".to_string(),
            ));
        }
        Ok(())
    }
}

/// Warnings about one observation (or one observation chunk)
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationWarnings {
    pub scope: String,
    pub messages: Vec<String>,
}

/// Threshold a new map was made with
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdRecord {
    pub key: ObservationKey,
    pub component: StokesComponent,
    pub threshold: Option<f64>,
    pub outcome: ConvergenceOutcome,
    pub attempts: u32,
}

/// What a run did
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub new_maps: Vec<PathBuf>,
    pub reused_maps: Vec<PathBuf>,
    pub decomposed: Vec<ObservationId>,
    pub reused_series: Vec<ObservationId>,
    pub coadds: Vec<CoaddProduct>,
    pub corrections: Vec<PointingCorrection>,
    pub thresholds: Vec<ThresholdRecord>,
    /// Chunks left out because their component files do not match up
    pub skipped_chunks: Vec<ObservationKey>,
    pub catalogue: Option<CatalogueProduct>,
    pub warnings: Vec<ObservationWarnings>,
    pub run_warnings: Vec<String>,
}

impl RunReport {
    fn warn(&mut self, scope: &str, message: String) {
        match self.warnings.iter_mut().find(|w| w.scope == scope) {
            Some(entry) => entry.messages.push(message),
            None => self.warnings.push(ObservationWarnings {
                scope: scope.to_string(),
                messages: vec![message],
            }),
        }
    }

    fn run_warn(&mut self, message: String) {
        self.run_warnings.push(message);
    }

    pub fn warnings_for(&self, scope: &str) -> &[String] {
        self.warnings
            .iter()
            .find(|w| w.scope == scope)
            .map_or(&[], |w| w.messages.as_slice())
    }

    pub fn coadd(&self, component: StokesComponent) -> Option<&CoaddProduct> {
        self.coadds.iter().find(|c| c.component == component)
    }
}

/// A configured run
pub struct Pipeline {
    config: RunConfig,
    engines: Engines,
    cancel: CancelHandle,
}

impl Pipeline {
    pub fn new(config: RunConfig, engines: Engines) -> Self {
        Self {
            config,
            engines,
            cancel: CancelHandle::new(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Handle through which another thread can interrupt the run
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Process `inputs`. The scratch workspace is released before this
    /// returns, whether the run succeeded or not.
    pub fn run(&self, inputs: &[PathBuf]) -> PipelineResult<RunReport> {
        self.config.validate()?;
        let mut workspace = Workspace::acquire(self.config.retain)?;

        let result = RunContext {
            config: &self.config,
            engines: &self.engines,
            cancel: &self.cancel,
            workspace: &mut workspace,
            report: RunReport::default(),
        }
        .execute(inputs);

        workspace.release();
        match &result {
            Ok(report) => log::info!(
                "✅ Run complete: {} new maps, {} reused, {} warnings",
                report.new_maps.len(),
                report.reused_maps.len(),
                report.warnings.iter().map(|w| w.messages.len()).sum::<usize>()
                    + report.run_warnings.len()
            ),
            Err(e) => log::error!("❌ Run failed: {}", e),
        }
        result
    }
}

/// Grid and pointing references of a run
#[derive(Debug, Clone, Default)]
struct References {
    /// Defines the map pixel grid
    grid: Option<PathBuf>,
    /// Map the intensity maps are aligned with
    alignment: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
struct MaskPaths {
    ast: Option<PathBuf>,
    pca: Option<PathBuf>,
}

struct OutputPlan {
    component: StokesComponent,
    output: PathBuf,
    catalogue_output: Option<PathBuf>,
}

/// Per-component solver settings shared by every chunk
struct SolveSettings<'a> {
    resolved: &'a ResolvedConfig,
    numiter: f64,
    masks: &'a MaskPaths,
    grid: Option<&'a Path>,
    ip_reference: Option<&'a Path>,
    pixel_size: Option<f64>,
}

struct RunContext<'p> {
    config: &'p RunConfig,
    engines: &'p Engines,
    cancel: &'p CancelHandle,
    workspace: &'p mut Workspace,
    report: RunReport,
}

fn store_error(path: &Path, e: anyhow::Error) -> PipelineError {
    PipelineError::Engine {
        engine: "image store",
        message: format!("{}: {:#}", path.display(), e),
    }
}

impl<'p> RunContext<'p> {
    fn check_cancel(&self) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn cache_dir(&self, configured: Option<&Path>, scratch: &str) -> PipelineResult<PathBuf> {
        let dir = match configured {
            Some(dir) => dir.to_path_buf(),
            None => self.workspace.file(scratch),
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn execute(mut self, inputs: &[PathBuf]) -> PipelineResult<RunReport> {
        let config = self.config;
        let engines = self.engines;
        let mode = config.mask.mode();

        let series_dir = self.cache_dir(config.series_dir.as_deref(), "series")?;
        let map_dir = self.cache_dir(config.map_dir.as_deref(), "maps")?;
        let cache = CacheManager::new(series_dir, map_dir, config.reuse)?;

        let classifier = Classifier::new()?;
        let classification = classifier.classify(inputs)?;
        for reject in &classification.rejects {
            self.report.run_warn(format!("Unrecognised input {} ignored", reject.display()));
        }
        for missing in &classification.missing {
            self.report.run_warn(format!("Expected raw file {} was not supplied", missing));
        }
        let band = match classification.waveband()? {
            Some(band) => band,
            None => {
                log::info!("No waveband found in the input names; assuming 850um");
                Waveband::Band850
            }
        };

        let references = self.prepare_reference(band)?;
        let supplied = self.supplied_maps(&classification)?;

        let mut series = classification.series.clone();
        series.extend(self.decompose(&classifier, &cache, &classification, band)?);
        let plans = self.plan_outputs();
        let requested: Vec<StokesComponent> = plans.iter().map(|p| p.component).collect();

        let mut groups = BTreeMap::new();
        for (key, files) in group_series(&series) {
            if requested.iter().all(|c| files.get(*c).is_empty()) {
                log::debug!("{} has no time-series for the requested maps", key);
                continue;
            }
            match files.check_consistent(&key, &requested) {
                Ok(()) => {
                    groups.insert(key, files);
                }
                Err(e) => {
                    log::warn!("⚠️  {}; chunk skipped", e);
                    self.report.warn(&key.to_string(), e.to_string());
                    self.report.skipped_chunks.push(key);
                }
            }
        }
        log::info!("{} observation chunks to map", groups.len());

        let masks = if groups.is_empty() { MaskPaths::default() } else { self.masks()? };
        let composer = ConfigComposer::new(
            mode,
            masks.pca.is_some(),
            ConfigOverlay::parse("user", &config.config)?,
            ConfigOverlay::parse("user-intensity", &config.intensity_config)?,
            ConfigOverlay::parse("user-polarised", &config.polarised_config)?,
        );
        let seeds = if groups.is_empty() {
            Default::default()
        } else {
            let auto = match mode {
                MaskMode::Auto => None,
                _ => cache.inherited_threshold(MaskMode::Auto)?,
            };
            seed_thresholds(&composer, cache.inherited_threshold(mode)?, auto)
        };
        let mut intensity_controller = ConvergenceController::new(mode, seeds.intensity);
        let mut polarised_controller = ConvergenceController::new(mode, seeds.polarised);

        let makes_polarised = plans.iter().any(|p| p.component != StokesComponent::Intensity);
        let ip_reference = if config.ip_enabled() && makes_polarised {
            Some(self.ip_reference(&references)?)
        } else {
            None
        };

        let mut catalogue_grid: Option<PathBuf> = None;
        for plan in &plans {
            let component = plan.component;
            let target = SolverTarget::for_component(component);
            let resolved = composer.compose(target, seeds.base);
            let numiter = match resolved.get_for_band(NUMITER_KEY, band) {
                Some(value) => value.parse::<f64>().map_err(|_| {
                    PipelineError::InvalidConfiguration(format!(
                        "Invalid {} value '{}'",
                        NUMITER_KEY, value
                    ))
                })?,
                None => 0.0,
            };
            let settings = SolveSettings {
                resolved: &resolved,
                numiter,
                masks: &masks,
                grid: references.grid.as_deref(),
                ip_reference: match target {
                    SolverTarget::Polarised => ip_reference.as_deref(),
                    SolverTarget::Intensity => None,
                },
                pixel_size: config.pixel_size,
            };
            let controller = match target {
                SolverTarget::Intensity => &mut intensity_controller,
                SolverTarget::Polarised => &mut polarised_controller,
            };

            let (maps, new_keys) = self.make_maps(
                component,
                &groups,
                supplied.get(&component),
                &cache,
                &settings,
                controller,
            )?;
            if maps.is_empty() {
                return Err(PipelineError::NoUsableProducts { component });
            }
            let contributors: Vec<Artifact> = maps.values().cloned().collect();

            let coadder = CoaddEngine::new(engines.mosaic.as_ref(), self.cancel);
            let wants_grid = config.catalogue.is_some() && catalogue_grid.is_none();
            if let (Some(bin_size), true) = (config.bin_size, wants_grid) {
                let grid = self.workspace.file("catalogue_grid.sdf");
                coadder.prepare_catalogue_grid(
                    engines.store.as_ref(),
                    &contributors[0].path,
                    bin_size,
                    &grid,
                )?;
                self.workspace.register(grid.clone());
                catalogue_grid = Some(grid);
            }

            let product = coadder.combine(&CoaddRequest {
                component,
                contributors: &contributors,
                variance_policy: config.variance_policy,
                output: &plan.output,
                catalogue_grid: catalogue_grid.as_deref(),
                catalogue_output: plan.catalogue_output.as_deref(),
                scratch: self.workspace.path(),
            })?;

            if component == StokesComponent::Intensity {
                self.measure_pointing(&maps, &new_keys, &plan.output, &references)?;
            }
            self.report.coadds.push(product);
        }

        if let Some(catalogue) = &config.catalogue {
            self.catalogue(catalogue, band)?;
        }

        if let Some(path) = &config.new_maps {
            write_manifest(path, &self.report.new_maps)?;
        }
        Ok(self.report)
    }

    /// Bring the reference map to pW if needed and decide which maps define
    /// the grid and the pointing reference
    fn prepare_reference(&mut self, band: Waveband) -> PipelineResult<References> {
        let config = self.config;
        let engines = self.engines;
        let store = engines.store.as_ref();

        if let Some(reference) = &config.reference {
            let image = store.read_map(reference).map_err(|e| store_error(reference, e))?;
            let conversion =
                reference_conversion(&image.units, band, image.fcf, config.reference_fcf)?;
            let path = match conversion {
                None => reference.clone(),
                Some((conversion, warning)) => {
                    if let Some(warning) = warning {
                        log::warn!("⚠️  {}", warning);
                        self.report.run_warn(warning);
                    }
                    log::info!(
                        "Converting reference map {} from {} to pW using FCF={}",
                        reference.display(),
                        image.units,
                        conversion.fcf
                    );
                    let fcf = conversion.fcf;
                    let mut scaled = image;
                    scaled.data.mapv_inplace(|v| v / fcf);
                    if let Some(variance) = &mut scaled.variance {
                        variance.mapv_inplace(|v| v / (fcf * fcf));
                    }
                    scaled.units = "pW".to_string();
                    scaled.fcf = None;

                    let out = self.workspace.file("reference_pw.sdf");
                    store.write_map(&out, &scaled).map_err(|e| store_error(&out, e))?;
                    self.workspace.register(out.clone());
                    out
                }
            };
            return Ok(References {
                grid: Some(path.clone()),
                alignment: Some(path),
            });
        }

        Ok(match &config.mask {
            MaskSpec::External(ExternalMask {
                signal_map: Some(signal),
                ..
            }) => References {
                grid: Some(signal.clone()),
                alignment: Some(signal.clone()),
            },
            MaskSpec::External(mask) => References {
                grid: mask.ast_mask.clone(),
                alignment: None,
            },
            MaskSpec::Auto | MaskSpec::Circle => References::default(),
        })
    }

    /// Map used for instrumental-polarisation correction of Q and U
    fn ip_reference(&self, references: &References) -> PipelineResult<PathBuf> {
        let config = self.config;
        match &config.ip_reference {
            Some(ipref) => {
                // The I coadd of this run is made in pW before any Q or U map
                if Some(ipref.as_path()) != config.intensity_output.as_deref() {
                    let image = self
                        .engines
                        .store
                        .read_map(ipref)
                        .map_err(|e| store_error(ipref, e))?;
                    if image.units.trim() != "pW" {
                        return Err(PipelineError::InvalidConfiguration(format!(
                            "IP reference map {} has units {}; units must be pW",
                            ipref.display(),
                            image.units
                        )));
                    }
                }
                Ok(ipref.clone())
            }
            None => references.grid.clone().ok_or_else(|| {
                PipelineError::InvalidConfiguration(
                    "IP correction requested but no IP reference map supplied".to_string(),
                )
            }),
        }
    }

    /// Per-observation maps supplied as inputs, which must be in pW
    fn supplied_maps(
        &self,
        classification: &Classification,
    ) -> PipelineResult<BTreeMap<StokesComponent, BTreeMap<ObservationKey, Artifact>>> {
        let mut supplied: BTreeMap<StokesComponent, BTreeMap<ObservationKey, Artifact>> =
            BTreeMap::new();
        for file in &classification.maps {
            let Some(component) = file.component else {
                continue;
            };
            if let Some(meta) = read_metadata(&file.path)? {
                if meta.units != "pW" {
                    return Err(PipelineError::InvalidConfiguration(format!(
                        "Input map {} has units {}; units must be pW",
                        file.path.display(),
                        meta.units
                    )));
                }
            }
            let artifact = Artifact::map(file.key, component, file.path.clone(), file.mask_mode);
            supplied.entry(component).or_default().insert(file.key, artifact);
        }
        Ok(supplied)
    }

    /// Component time-series for every raw observation, reused from the
    /// series cache where possible
    fn decompose(
        &mut self,
        classifier: &Classifier,
        cache: &CacheManager,
        classification: &Classification,
        band: Waveband,
    ) -> PipelineResult<Vec<ClassifiedFile>> {
        let engines = self.engines;
        let mut series = Vec::new();
        let observations = group_raw(&classification.raw);
        let total = observations.len();

        for (index, (id, raw)) in observations.iter().enumerate() {
            self.check_cancel()?;
            let files = match cache.check_series(id, band)? {
                ReuseDecision::Reuse(files) => {
                    log::info!(
                        "Re-using previously created Q, U and I time-streams for observation {}",
                        id
                    );
                    self.report.reused_series.push(*id);
                    files
                }
                ReuseDecision::Regenerate(reason) => {
                    log::debug!("Decomposing {}: {}", id, reason);
                    log::info!(
                        "🔄 {}/{}: Processing {} raw data files from observation {}",
                        index + 1,
                        total,
                        raw.len(),
                        id
                    );
                    let paths: Vec<PathBuf> = raw.iter().map(|f| f.path.clone()).collect();
                    let decomposed = engines.decomposer.decompose(
                        &paths,
                        &self.config.north,
                        band,
                        cache.series_dir(),
                    );
                    match decomposed {
                        Ok(files) => {
                            self.report.decomposed.push(*id);
                            files
                        }
                        Err(e) => {
                            let err = ObservationError::EngineInvocation {
                                scope: id.to_string(),
                                engine: "decomposition",
                                message: format!("{:#}", e),
                            };
                            log::warn!("⚠️  {}; observation ignored", err);
                            self.report.warn(&id.to_string(), err.to_string());
                            continue;
                        }
                    }
                }
            };

            for path in files {
                match classifier.identify(&path)? {
                    Some(file) if file.kind == ArtifactKind::ComponentSeries => series.push(file),
                    _ => log::warn!("Ignoring unexpected decomposition output {}", path.display()),
                }
            }
        }
        Ok(series)
    }

    /// Coadds to make, in processing order. A catalogue needs all three.
    fn plan_outputs(&self) -> Vec<OutputPlan> {
        let config = self.config;
        let wants_catalogue = config.catalogue.is_some();
        StokesComponent::PROCESSING_ORDER
            .iter()
            .filter_map(|&component| {
                let letter = component.map_letter();
                let output = match config.output(component) {
                    Some(path) => path.to_path_buf(),
                    None if wants_catalogue => {
                        self.workspace.file(&format!("{}_coadd.sdf", letter))
                    }
                    None => return None,
                };
                Some(OutputPlan {
                    component,
                    output,
                    catalogue_output: wants_catalogue
                        .then(|| self.workspace.file(&format!("{}_cat.sdf", letter))),
                })
            })
            .collect()
    }

    fn masks(&mut self) -> PipelineResult<MaskPaths> {
        let config = self.config;
        let engines = self.engines;
        match &config.mask {
            MaskSpec::External(ExternalMask {
                signal_map: Some(signal),
                ast_mask,
                pca_mask,
            }) => {
                self.check_cancel()?;
                let ast_out = ast_mask
                    .clone()
                    .unwrap_or_else(|| self.workspace.file("ast_mask.sdf"));
                let pca_out = pca_mask
                    .clone()
                    .unwrap_or_else(|| self.workspace.file("pca_mask.sdf"));
                let set = MaskBuilder::new(engines.segmenter.as_ref(), MaskBuilderParams::default())
                    .build_masks(engines.store.as_ref(), signal, &ast_out, &pca_out)?;
                if set.pca_mask.is_none() {
                    self.report.run_warn(
                        "No emission bright enough for a PCA mask; maps made without one"
                            .to_string(),
                    );
                }
                Ok(MaskPaths {
                    ast: Some(set.ast_mask),
                    pca: set.pca_mask,
                })
            }
            MaskSpec::External(mask) => Ok(MaskPaths {
                ast: mask.ast_mask.clone(),
                pca: mask.pca_mask.clone(),
            }),
            MaskSpec::Auto | MaskSpec::Circle => Ok(MaskPaths::default()),
        }
    }

    /// Maps of one component for every chunk, plus the keys of the maps
    /// made in this run
    fn make_maps(
        &mut self,
        component: StokesComponent,
        groups: &BTreeMap<ObservationKey, ComponentFiles>,
        supplied: Option<&BTreeMap<ObservationKey, Artifact>>,
        cache: &CacheManager,
        settings: &SolveSettings<'_>,
        controller: &mut ConvergenceController,
    ) -> PipelineResult<(BTreeMap<ObservationKey, Artifact>, Vec<ObservationKey>)> {
        let engines = self.engines;
        let cancel = self.cancel;
        let mode = self.config.mask.mode();
        let mut maps = supplied.cloned().unwrap_or_default();
        let mut new_keys = Vec::new();

        for (key, files) in groups {
            let inputs = files.get(component);
            if inputs.is_empty() {
                continue;
            }
            self.check_cancel()?;
            log::info!(">>> Making {} map from {}", component, key);

            let stored = cache.stored_correction(key, mode).unwrap_or_else(|e| {
                log::warn!("Ignoring stored pointing correction for {}: {}", key, e);
                None
            });
            let table = PointingTable::for_observation(key, stored);
            let output = cache.map_path(key, component, mode);

            match cache.check_map(key, component, mode) {
                ReuseDecision::Reuse(_) => {
                    log::info!("   Re-using previously created map {}", output.display());
                    self.report.reused_maps.push(output.clone());
                    maps.insert(*key, Artifact::map(*key, component, output, Some(mode)));
                    continue;
                }
                ReuseDecision::Regenerate(reason) => {
                    log::debug!("{} {}: new map needed ({})", key, component, reason)
                }
            }

            let pointing = if table.is_empty() {
                None
            } else {
                let name = format!("{}_{}_pointing.lis", key, component.map_letter());
                let path = self.workspace.file(&name);
                table.write(&path)?;
                self.workspace.register(path.clone());
                Some(path)
            };
            if let Some(offset) = stored {
                log::info!(
                    "   Using pre-calculated pointing corrections of ({}, {}) arc-seconds",
                    offset.dx,
                    offset.dy
                );
            }

            let request = SolveRequest {
                key: *key,
                component,
                inputs,
                config: settings.resolved,
                output: &output,
                reference: settings.grid,
                pointing: pointing.as_deref(),
                ast_mask: settings.masks.ast.as_deref(),
                pca_mask: settings.masks.pca.as_deref(),
                pixel_size: settings.pixel_size,
                ip_reference: settings.ip_reference,
                abort_soon: false,
            };

            match controller.solve(engines.solver.as_ref(), request, settings.numiter, cancel)? {
                Ok(outcome) => {
                    let threshold = outcome
                        .threshold
                        .or_else(|| settings.resolved.get_f64(THRESHOLD_KEY));
                    let mut meta = ArtifactMetadata::new(*key, component, mode);
                    meta.threshold_used = threshold;
                    meta.applied_correction = table.tracking_correction();
                    write_metadata(&output, &meta)?;

                    if let Some(warning) = &outcome.warning {
                        self.report.warn(&key.to_string(), warning.to_string());
                    }
                    self.report.thresholds.push(ThresholdRecord {
                        key: *key,
                        component,
                        threshold,
                        outcome: outcome.outcome,
                        attempts: outcome.attempts,
                    });
                    self.report.new_maps.push(output.clone());
                    new_keys.push(*key);
                    maps.insert(*key, Artifact::map(*key, component, output, Some(mode)));
                }
                Err(e) => {
                    log::warn!("⚠️  {}; no {} map for this chunk", e, component);
                    self.report.warn(&key.to_string(), e.to_string());
                    maps.remove(key);
                }
            }
        }
        Ok((maps, new_keys))
    }

    /// Measure and store pointing corrections for the intensity maps made
    /// in this run
    fn measure_pointing(
        &mut self,
        maps: &BTreeMap<ObservationKey, Artifact>,
        new_keys: &[ObservationKey],
        coadd: &Path,
        references: &References,
    ) -> PipelineResult<()> {
        // Aligning a lone map with a coadd of itself tells us nothing
        let reference = match &references.alignment {
            Some(reference) => reference.clone(),
            None if maps.len() > 1 => coadd.to_path_buf(),
            None => {
                log::debug!("No alignment reference available; pointing corrections skipped");
                return Ok(());
            }
        };

        let mode = self.config.mask.mode();
        let engines = self.engines;
        let corrector = PointingCorrector::new(
            engines.aligner.as_ref(),
            engines.store.as_ref(),
            PointingParams::default(),
        );
        for key in new_keys {
            self.check_cancel()?;
            let Some(artifact) = maps.get(key) else {
                continue;
            };
            match corrector.measure(*key, &artifact.path, &reference) {
                Ok(correction) => {
                    let mut meta = read_metadata(&artifact.path)?.unwrap_or_else(|| {
                        ArtifactMetadata::new(*key, StokesComponent::Intensity, mode)
                    });
                    meta.required_correction = Some(correction.offset());
                    write_metadata(&artifact.path, &meta)?;
                    self.report.corrections.push(correction);
                }
                Err(e) => {
                    log::warn!("⚠️  {}; check whether this observation should be omitted", e);
                    self.report.warn(&key.to_string(), e.to_string());
                }
            }
        }
        Ok(())
    }

    fn catalogue(&mut self, catalogue: &Path, band: Waveband) -> PipelineResult<()> {
        let config = self.config;
        let engines = self.engines;
        let mut cubes = Vec::with_capacity(3);
        for component in StokesComponent::CUBE_ORDER {
            let path = self
                .report
                .coadd(component)
                .and_then(|c| c.catalogue_output.clone())
                .ok_or(PipelineError::NoUsableProducts { component })?;
            cubes.push(path);
        }

        let options = CatalogueOptions {
            catalogue: catalogue.to_path_buf(),
            magnitude_map: config.magnitude_map.clone(),
            debias: config.debias,
            jansky: config.jansky,
            fcf: config.fcf,
            band,
        };
        let assembler = CatalogueAssembler::new(
            engines.store.as_ref(),
            engines.tabulator.as_ref(),
            self.cancel,
        );
        let product = assembler.run(
            [cubes[0].as_path(), cubes[1].as_path(), cubes[2].as_path()],
            &options,
        )?;
        self.report.catalogue = Some(product);
        Ok(())
    }
}

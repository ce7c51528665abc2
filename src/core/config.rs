//! Layered solver configuration.
//!
//! A resolved configuration is built by applying overlays in a fixed order,
//! later layers replacing identically named keys of earlier ones:
//!
//! 1. (Q/U only) `com.noflag = 1`
//! 2. baseline defaults
//! 3. mask-mode additions (auto, circle or external)
//! 4. the user's base overlay
//! 5. the user's component overlay (I or Q/U)
//! 6. mandatory overrides
//!
//! Keys are case-insensitive and stored lower-case. Resolution is held in a
//! `BTreeMap`, so rendering is independent of insertion order.

use crate::types::{MaskMode, PipelineError, PipelineResult, StokesComponent, Waveband};
use std::collections::BTreeMap;
use std::path::Path;

/// Name of the convergence-control parameter
pub const THRESHOLD_KEY: &str = "pca.pcathresh";

/// Name of the iteration-count parameter
pub const NUMITER_KEY: &str = "numiter";

const MAX_INCLUDE_DEPTH: usize = 8;

/// An ordered list of key/value assignments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverlay {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl ConfigOverlay {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    /// Parse overlay text.
    ///
    /// Assignments are separated by newlines or by commas outside
    /// parentheses. `#` starts a comment. A line `^path` includes another
    /// overlay file. The values `def` and `!` denote an empty overlay.
    pub fn parse(name: &str, text: &str) -> PipelineResult<Self> {
        let mut overlay = Self::new(name);
        overlay.parse_into(text, 0)?;
        Ok(overlay)
    }

    fn include(&mut self, path: &Path, depth: usize) -> PipelineResult<()> {
        if depth >= MAX_INCLUDE_DEPTH {
            return Err(PipelineError::InvalidConfiguration(format!(
                "Configuration includes nested too deeply at {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidConfiguration(format!(
                "Cannot read configuration {}: {}",
                path.display(),
                e
            ))
        })?;
        self.parse_into(&text, depth + 1)
    }

    fn parse_into(&mut self, text: &str, depth: usize) -> PipelineResult<()> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("def") || trimmed == "!" {
            return Ok(());
        }

        for line in text.lines() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            for item in split_top_level(line) {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                if let Some(file) = item.strip_prefix('^') {
                    self.include(Path::new(file.trim()), depth)?;
                    continue;
                }
                let Some((key, value)) = item.split_once('=') else {
                    return Err(PipelineError::InvalidConfiguration(format!(
                        "Configuration item '{}' in {} is not of the form key=value",
                        item, self.name
                    )));
                };
                let key = key.trim();
                if key.is_empty() {
                    return Err(PipelineError::InvalidConfiguration(format!(
                        "Configuration item '{}' in {} has no key",
                        item, self.name
                    )));
                }
                self.set(key, value.trim());
            }
        }
        Ok(())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.push((key.to_lowercase(), value.to_string()));
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, &value.to_string());
        self
    }

    /// Last value assigned to `key` in this overlay
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_lowercase();
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn split_top_level(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in line.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&line[start..]);
    parts
}

/// Final key/value mapping handed to the solver, remembering which layer
/// supplied each value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedConfig {
    values: BTreeMap<String, (String, String)>,
}

impl ResolvedConfig {
    pub fn from_layers(layers: &[ConfigOverlay]) -> Self {
        let mut resolved = Self::default();
        for layer in layers {
            resolved.apply(layer);
        }
        resolved
    }

    fn apply(&mut self, layer: &ConfigOverlay) {
        for (key, value) in layer.entries() {
            self.values.insert(key.clone(), (value.clone(), layer.name.clone()));
        }
    }

    /// A copy with `layer` applied on top of everything else
    pub fn overlaid(&self, layer: &ConfigOverlay) -> Self {
        let mut copy = self.clone();
        copy.apply(layer);
        copy
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_lowercase()).map(|(v, _)| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Value of `key`, preferring a waveband-qualified form such as
    /// `850.numiter`
    pub fn get_for_band(&self, key: &str, band: Waveband) -> Option<&str> {
        self.get(&format!("{}.{}", band.microns(), key)).or_else(|| self.get(key))
    }

    /// Name of the layer that supplied `key`
    pub fn layer_of(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_lowercase()).map(|(_, l)| l.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `key = value` lines, sorted by key
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, (value, _)) in &self.values {
            out.push_str(key);
            out.push_str(" = ");
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

/// Which of the two solver configurations a component uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolverTarget {
    Intensity,
    Polarised,
}

impl SolverTarget {
    pub fn for_component(component: StokesComponent) -> Self {
        match component {
            StokesComponent::Intensity => SolverTarget::Intensity,
            StokesComponent::First | StokesComponent::Second => SolverTarget::Polarised,
        }
    }
}

/// Builds the solver configurations of a run
#[derive(Debug, Clone)]
pub struct ConfigComposer {
    mode: MaskMode,
    has_pca_mask: bool,
    user_base: ConfigOverlay,
    user_intensity: ConfigOverlay,
    user_polarised: ConfigOverlay,
}

impl ConfigComposer {
    pub fn new(
        mode: MaskMode,
        has_pca_mask: bool,
        user_base: ConfigOverlay,
        user_intensity: ConfigOverlay,
        user_polarised: ConfigOverlay,
    ) -> Self {
        Self {
            mode,
            has_pca_mask,
            user_base,
            user_intensity,
            user_polarised,
        }
    }

    pub fn mode(&self) -> MaskMode {
        self.mode
    }

    pub fn user_base(&self) -> &ConfigOverlay {
        &self.user_base
    }

    pub fn user_overlay(&self, target: SolverTarget) -> &ConfigOverlay {
        match target {
            SolverTarget::Intensity => &self.user_intensity,
            SolverTarget::Polarised => &self.user_polarised,
        }
    }

    /// Defaults shared by every mask mode. An undetermined threshold is
    /// written as the external-mask default.
    pub fn baseline(&self, threshold: Option<f64>) -> ConfigOverlay {
        ConfigOverlay::new("baseline")
            .with("numiter", -200)
            .with("modelorder", "(com,gai,pca,ext,flt,ast,noi)")
            .with("maptol", 0.05)
            .with("maptol_mask", "<undef>")
            .with("maptol_mean", 0)
            .with("maptol_box", 60)
            .with("maptol_hits", 1)
            .with(THRESHOLD_KEY, threshold.unwrap_or(MaskMode::External.default_threshold()))
            .with("ast.mapspike_freeze", 5)
            .with("pca.zero_niter", 0.5)
            .with("com.zero_niter", 0.5)
            .with("flt.zero_niter", 0.5)
            .with("com.freeze_flags", 30)
    }

    /// Additions specific to the mask mode
    pub fn mask_overlay(&self, threshold: Option<f64>) -> ConfigOverlay {
        match self.mode {
            MaskMode::Auto => {
                let mut overlay = ConfigOverlay::new("auto-mask")
                    .with("ast.skip", 10)
                    .with("ast.zero_snr", 3)
                    .with("ast.zero_snrlo", 2)
                    .with("ast.zero_freeze", 0.2)
                    .with(THRESHOLD_KEY, threshold.unwrap_or(MaskMode::Auto.default_threshold()));
                for model in ["pca", "com", "flt"] {
                    overlay = overlay
                        .with(&format!("{}.zero_snr", model), 5)
                        .with(&format!("{}.zero_snrlo", model), 3)
                        .with(&format!("{}.zero_freeze", model), -1);
                }
                overlay
            }
            MaskMode::Circle => {
                let mut overlay = ConfigOverlay::new("circle-mask");
                for model in ["ast", "pca", "com", "flt"] {
                    overlay.set(&format!("{}.zero_circle", model), "(0.0083)");
                }
                overlay
            }
            MaskMode::External => {
                let mut overlay = ConfigOverlay::new("external-mask").with("ast.zero_mask", "ref");
                if self.has_pca_mask {
                    for model in ["pca", "com", "flt"] {
                        overlay.set(&format!("{}.zero_mask", model), "mask2");
                    }
                }
                overlay
            }
        }
    }

    /// Values the workflow depends on, applied last
    pub fn mandatory() -> ConfigOverlay {
        ConfigOverlay::new("mandatory")
            .with("noi.usevar", 1)
            .with("flagslow", 0.01)
            .with("downsampscale", 0)
    }

    /// All layers for `target`, lowest precedence first
    pub fn layers(&self, target: SolverTarget, threshold: Option<f64>) -> Vec<ConfigOverlay> {
        let mut layers = Vec::with_capacity(6);
        if target == SolverTarget::Polarised {
            // The common mode is poorly defined in Q and U
            layers.push(ConfigOverlay::new("polarised-defaults").with("com.noflag", 1));
        }
        layers.push(self.baseline(threshold));
        layers.push(self.mask_overlay(threshold));
        layers.push(self.user_base.clone());
        layers.push(self.user_overlay(target).clone());
        layers.push(Self::mandatory());
        layers
    }

    pub fn compose(&self, target: SolverTarget, threshold: Option<f64>) -> ResolvedConfig {
        let resolved = ResolvedConfig::from_layers(&self.layers(target, threshold));
        log::debug!(
            "Composed {:?} configuration with {} parameters",
            target,
            resolved.len()
        );
        resolved
    }

    /// Threshold fixed by the user for `target`. Zero counts as unset.
    pub fn user_threshold(&self, target: SolverTarget) -> Option<f64> {
        let nonzero = |o: &ConfigOverlay| o.get_f64(THRESHOLD_KEY).filter(|t| *t != 0.0);
        nonzero(self.user_overlay(target)).or_else(|| nonzero(&self.user_base))
    }

    /// True when the user's model order leaves out the PCA model, in which
    /// case the threshold is irrelevant and never searched for
    pub fn pca_disabled(&self) -> bool {
        self.user_base
            .get("modelorder")
            .map_or(false, |m| !m.to_lowercase().contains("pca"))
    }
}

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Identity of one contiguous exposure sequence (an observation chunk)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservationKey {
    pub date: NaiveDate,
    pub observation: u32,
    pub chunk: u32,
}

impl ObservationKey {
    pub fn new(date: NaiveDate, observation: u32, chunk: u32) -> Self {
        Self { date, observation, chunk }
    }

    /// Derive a key from the textual fields found in file names and headers.
    ///
    /// This is the only key derivation used by the classifier, so keys built
    /// for time-series files and for maps always join on the same value.
    pub fn from_parts(utdate: &str, observation: &str, chunk: &str) -> PipelineResult<Self> {
        let date = NaiveDate::parse_from_str(utdate, "%Y%m%d").map_err(|e| {
            PipelineError::Classification(format!("Invalid UT date '{}': {}", utdate, e))
        })?;
        let observation = observation.parse::<u32>().map_err(|e| {
            PipelineError::Classification(format!(
                "Invalid observation number '{}': {}",
                observation, e
            ))
        })?;
        let chunk = chunk.parse::<u32>().map_err(|e| {
            PipelineError::Classification(format!("Invalid chunk number '{}': {}", chunk, e))
        })?;
        Ok(Self::new(date, observation, chunk))
    }

    /// The observation this chunk belongs to
    pub fn observation_id(&self) -> ObservationId {
        ObservationId {
            date: self.date,
            observation: self.observation,
        }
    }

    /// UT date as the integer YYYYMMDD
    pub fn utdate(&self) -> u32 {
        self.date.year() as u32 * 10000 + self.date.month() * 100 + self.date.day()
    }
}

impl std::fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{:05}_{:04}", self.date.format("%Y%m%d"), self.observation, self.chunk)
    }
}

impl FromStr for ObservationKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('_').collect();
        match parts.as_slice() {
            [date, obs, chunk] => Self::from_parts(date, obs, chunk),
            _ => Err(PipelineError::Classification(format!(
                "Malformed observation key '{}'",
                s
            ))),
        }
    }
}

/// A whole observation (all chunks), used to group raw exposures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservationId {
    pub date: NaiveDate,
    pub observation: u32,
}

impl std::fmt::Display for ObservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{:05}", self.date.format("%Y%m%d"), self.observation)
    }
}

/// The three orthogonal signal components measured per exposure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StokesComponent {
    /// Stokes Q
    First,
    /// Stokes U
    Second,
    /// Total intensity, Stokes I
    Intensity,
}

impl StokesComponent {
    /// Order in which per-observation maps are made. Intensity comes first
    /// because its coadd drives the pointing corrections used by Q and U.
    pub const PROCESSING_ORDER: [StokesComponent; 3] = [
        StokesComponent::Intensity,
        StokesComponent::First,
        StokesComponent::Second,
    ];

    /// Plane order of the stacked cube handed to the tabulation engine
    pub const CUBE_ORDER: [StokesComponent; 3] = [
        StokesComponent::First,
        StokesComponent::Second,
        StokesComponent::Intensity,
    ];

    /// Single-letter Stokes label
    pub fn label(&self) -> &'static str {
        match self {
            StokesComponent::First => "Q",
            StokesComponent::Second => "U",
            StokesComponent::Intensity => "I",
        }
    }

    /// Suffix of component time-series file names
    pub fn series_suffix(&self) -> &'static str {
        match self {
            StokesComponent::First => "QT",
            StokesComponent::Second => "UT",
            StokesComponent::Intensity => "IT",
        }
    }

    pub fn from_series_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "QT" => Some(StokesComponent::First),
            "UT" => Some(StokesComponent::Second),
            "IT" => Some(StokesComponent::Intensity),
            _ => None,
        }
    }

    /// Letter used in map file names
    pub fn map_letter(&self) -> char {
        match self {
            StokesComponent::First => 'q',
            StokesComponent::Second => 'u',
            StokesComponent::Intensity => 'i',
        }
    }

    pub fn from_map_letter(letter: char) -> Option<Self> {
        match letter {
            'q' => Some(StokesComponent::First),
            'u' => Some(StokesComponent::Second),
            'i' => Some(StokesComponent::Intensity),
            _ => None,
        }
    }
}

impl std::fmt::Display for StokesComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for StokesComponent {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "Q" | "FIRST" => Ok(StokesComponent::First),
            "U" | "SECOND" => Ok(StokesComponent::Second),
            "I" | "INTENSITY" => Ok(StokesComponent::Intensity),
            _ => Err(PipelineError::Metadata(format!("Unknown Stokes component '{}'", s))),
        }
    }
}

/// Kind of file handled by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    RawExposure,
    ComponentSeries,
    Map,
}

/// Observing waveband, encoded in raw and time-series file names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Waveband {
    Band450,
    Band850,
}

impl Waveband {
    pub fn from_digit(digit: char) -> Option<Self> {
        match digit {
            '4' => Some(Waveband::Band450),
            '8' => Some(Waveband::Band850),
            _ => None,
        }
    }

    pub fn digit(&self) -> char {
        match self {
            Waveband::Band450 => '4',
            Waveband::Band850 => '8',
        }
    }

    pub fn microns(&self) -> u32 {
        match self {
            Waveband::Band450 => 450,
            Waveband::Band850 => 850,
        }
    }
}

impl Default for Waveband {
    fn default() -> Self {
        Waveband::Band850
    }
}

/// Detector sub-array. Every exposure is recorded by four of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subarray {
    A,
    B,
    C,
    D,
}

impl Subarray {
    pub const ALL: [Subarray; 4] = [Subarray::A, Subarray::B, Subarray::C, Subarray::D];

    pub fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'a' => Some(Subarray::A),
            'b' => Some(Subarray::B),
            'c' => Some(Subarray::C),
            'd' => Some(Subarray::D),
            _ => None,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            Subarray::A => 'a',
            Subarray::B => 'b',
            Subarray::C => 'c',
            Subarray::D => 'd',
        }
    }
}

/// Masking mode of a run, stripped of any file references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaskMode {
    Auto,
    Circle,
    External,
}

impl MaskMode {
    /// Tag embedded in cached map names so maps made under different
    /// masking modes never collide
    pub fn tag(&self) -> &'static str {
        match self {
            MaskMode::Auto => "auto",
            MaskMode::Circle => "circle",
            MaskMode::External => "ext",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "auto" => Some(MaskMode::Auto),
            "circle" => Some(MaskMode::Circle),
            "ext" => Some(MaskMode::External),
            _ => None,
        }
    }

    /// Starting convergence threshold when none is configured
    pub fn default_threshold(&self) -> f64 {
        match self {
            MaskMode::Auto => -50.0,
            MaskMode::Circle | MaskMode::External => -150.0,
        }
    }
}

impl FromStr for MaskMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "external" => Ok(MaskMode::External),
            other => Self::from_tag(other).ok_or_else(|| {
                PipelineError::InvalidConfiguration(format!("Unknown mask mode '{}'", s))
            }),
        }
    }
}

impl std::fmt::Display for MaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// External masks: either built from a signal map or supplied ready-made
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalMask {
    /// Map of astronomical signal (with variance) from which masks are built
    pub signal_map: Option<PathBuf>,
    /// Broad (AST) mask. An input when no signal map is given, otherwise
    /// the location at which the built mask is kept.
    pub ast_mask: Option<PathBuf>,
    /// Tight (PCA) mask, same convention as `ast_mask`
    pub pca_mask: Option<PathBuf>,
}

impl ExternalMask {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.signal_map.is_none() && (self.ast_mask.is_none() || self.pca_mask.is_none()) {
            return Err(PipelineError::InvalidConfiguration(
                "External masking needs either a signal map or both an AST and a PCA mask"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Masking strategy chosen once per run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "MaskSettings", into = "MaskSettings")]
pub enum MaskSpec {
    Auto,
    Circle,
    External(ExternalMask),
}

impl MaskSpec {
    pub fn mode(&self) -> MaskMode {
        match self {
            MaskSpec::Auto => MaskMode::Auto,
            MaskSpec::Circle => MaskMode::Circle,
            MaskSpec::External(_) => MaskMode::External,
        }
    }
}

impl Default for MaskSpec {
    fn default() -> Self {
        MaskSpec::Auto
    }
}

/// Flat form of a [`MaskSpec`] as written in run configuration files:
/// a `mode` of `auto`, `circle` or `external` and, for external masks,
/// the files involved
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskSettings {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_map: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ast_mask: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pca_mask: Option<PathBuf>,
}

impl TryFrom<MaskSettings> for MaskSpec {
    type Error = PipelineError;

    fn try_from(settings: MaskSettings) -> Result<Self, Self::Error> {
        let mode = match settings.mode.trim() {
            "" => MaskMode::Auto,
            text => text.parse()?,
        };
        let has_files = settings.signal_map.is_some()
            || settings.ast_mask.is_some()
            || settings.pca_mask.is_some();
        match mode {
            MaskMode::External => Ok(MaskSpec::External(ExternalMask {
                signal_map: settings.signal_map,
                ast_mask: settings.ast_mask,
                pca_mask: settings.pca_mask,
            })),
            _ if has_files => Err(PipelineError::InvalidConfiguration(format!(
                "Mask files are only used with external masking, not {}",
                mode
            ))),
            MaskMode::Auto => Ok(MaskSpec::Auto),
            MaskMode::Circle => Ok(MaskSpec::Circle),
        }
    }
}

impl From<MaskSpec> for MaskSettings {
    fn from(spec: MaskSpec) -> Self {
        match spec {
            MaskSpec::Auto => Self {
                mode: "auto".to_string(),
                ..Default::default()
            },
            MaskSpec::Circle => Self {
                mode: "circle".to_string(),
                ..Default::default()
            },
            MaskSpec::External(mask) => Self {
                mode: "external".to_string(),
                signal_map: mask.signal_map,
                ast_mask: mask.ast_mask,
                pca_mask: mask.pca_mask,
            },
        }
    }
}

/// How variances of a coadd are estimated. Written as `propagate` or
/// `spread` in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VariancePolicy {
    /// Propagate the variances of the contributing maps
    PropagateFromInputs,
    /// Use the spread of the contributing pixel values
    SpreadOfInputs,
}

impl Default for VariancePolicy {
    fn default() -> Self {
        VariancePolicy::PropagateFromInputs
    }
}

impl FromStr for VariancePolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "propagate" | "propagatefrominputs" => Ok(VariancePolicy::PropagateFromInputs),
            "spread" | "spreadofinputs" => Ok(VariancePolicy::SpreadOfInputs),
            other => Err(PipelineError::InvalidConfiguration(format!(
                "Unknown variance policy '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for VariancePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VariancePolicy::PropagateFromInputs => write!(f, "propagate"),
            VariancePolicy::SpreadOfInputs => write!(f, "spread"),
        }
    }
}

impl TryFrom<String> for VariancePolicy {
    type Error = PipelineError;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<VariancePolicy> for String {
    fn from(policy: VariancePolicy) -> Self {
        policy.to_string()
    }
}

/// Where an artifact came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub units: String,
    pub mask_mode: Option<MaskMode>,
}

/// A file known to the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub key: ObservationKey,
    pub kind: ArtifactKind,
    pub component: Option<StokesComponent>,
    pub path: PathBuf,
    pub provenance: Provenance,
}

impl Artifact {
    pub fn map(
        key: ObservationKey,
        component: StokesComponent,
        path: PathBuf,
        mode: Option<MaskMode>,
    ) -> Self {
        Self {
            key,
            kind: ArtifactKind::Map,
            component: Some(component),
            path,
            provenance: Provenance {
                units: "pW".to_string(),
                mask_mode: mode,
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Outcome of one per-observation convergence search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceOutcome {
    Unknown,
    Converged,
    AbortedEarly,
    GivenUp,
}

/// State of the convergence search for one map
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceState {
    pub current_threshold: f64,
    pub attempt: u32,
    pub outcome: ConvergenceOutcome,
}

impl ConvergenceState {
    pub fn new(threshold: f64) -> Self {
        Self {
            current_threshold: threshold,
            attempt: 0,
            outcome: ConvergenceOutcome::Unknown,
        }
    }
}

/// Angular offset in arc-seconds along the longitude and latitude axes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngularOffset {
    pub dx: f64,
    pub dy: f64,
}

/// Status of a pointing correction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionValidity {
    /// Measured in this run
    Fresh,
    /// Read back from a map made by an earlier run
    Reused,
    /// Measurement failed or was implausible; nothing persisted
    Rejected,
}

/// Pointing correction for one observation chunk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointingCorrection {
    pub key: ObservationKey,
    pub dx: f64,
    pub dy: f64,
    pub validity: CorrectionValidity,
}

impl PointingCorrection {
    pub fn offset(&self) -> AngularOffset {
        AngularOffset { dx: self.dx, dy: self.dy }
    }
}

/// Stacked product for one component
#[derive(Debug, Clone, PartialEq)]
pub struct CoaddProduct {
    pub component: StokesComponent,
    pub contributors: Vec<Artifact>,
    pub variance_policy: VariancePolicy,
    pub output: PathBuf,
    /// Independent coadd at catalogue resolution, if a catalogue was requested
    pub catalogue_output: Option<PathBuf>,
}

/// Errors that abort the whole run
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Classification error: {0}")]
    Classification(String),

    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Insufficient signal: {0}")]
    InsufficientSignal(String),

    #[error("No usable {component} maps remain to be coadded")]
    NoUsableProducts { component: StokesComponent },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("{engine} engine failed: {message}")]
    Engine { engine: &'static str, message: String },

    #[error("Run interrupted")]
    Interrupted,
}

/// Result type for whole-run operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Failures confined to one observation. The run carries on without it.
///
/// There is deliberately no conversion into [`PipelineError`]: callers have
/// to decide what to do with every one of these.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ObservationError {
    #[error("{engine} engine failed for {scope}: {message}")]
    EngineInvocation {
        scope: String,
        engine: &'static str,
        message: String,
    },

    #[error("{key}: no convergence after {attempts} attempts, using threshold {threshold}")]
    ConvergenceGivenUp {
        key: ObservationKey,
        attempts: u32,
        threshold: f64,
    },

    #[error("{key}: alignment rejected ({reason})")]
    AlignmentRejected { key: ObservationKey, reason: String },

    #[error("{key}: {message}")]
    Consistency { key: ObservationKey, message: String },
}

/// Result type for observation-scoped operations
pub type ObservationResult<T> = Result<T, ObservationError>;

//! Interfaces to the external processing engines.
//!
//! The workflow controller never does signal processing itself. Everything
//! numerical (time-series decomposition, iterative map solving, image
//! alignment, source segmentation, mosaicking and vector tabulation) sits
//! behind the traits in this module so that the orchestration logic can be
//! driven by real engines or by in-memory fakes.

use crate::core::config::ResolvedConfig;
use crate::core::catalogue::StokesCube;
use crate::types::{ObservationKey, StokesComponent, Waveband};
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// Gnomonic (TAN) projection of a 2-D pixel grid onto the sky.
///
/// `crpix` is given in the pixel-index coordinates used by
/// [`MapImage::lower_bound`], `crval` holds the reference longitude and
/// latitude in radians and `cd` the linear transform from pixel offsets to
/// intermediate world coordinates, also in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TanProjection {
    pub crpix: [f64; 2],
    pub crval: [f64; 2],
    pub cd: [[f64; 2]; 2],
}

impl TanProjection {
    /// Square-pixel projection with north up and east to the left
    pub fn new(crpix: [f64; 2], crval: [f64; 2], pixel_scale_arcsec: f64) -> Self {
        let step = (pixel_scale_arcsec / 3600.0).to_radians();
        Self {
            crpix,
            crval,
            cd: [[-step, 0.0], [0.0, step]],
        }
    }

    /// Sky coordinates (radians) of a pixel position
    pub fn pixel_to_sky(&self, x: f64, y: f64) -> (f64, f64) {
        let dx = x - self.crpix[0];
        let dy = y - self.crpix[1];
        let xi = self.cd[0][0] * dx + self.cd[0][1] * dy;
        let eta = self.cd[1][0] * dx + self.cd[1][1] * dy;

        let (sin_dec0, cos_dec0) = self.crval[1].sin_cos();
        let denom = cos_dec0 - eta * sin_dec0;
        let lon = self.crval[0] + xi.atan2(denom);
        let lat = (sin_dec0 + eta * cos_dec0).atan2((xi * xi + denom * denom).sqrt());
        (lon, lat)
    }

    /// Pixel size in arc-seconds, taken from the determinant of the CD matrix
    pub fn pixel_scale(&self) -> f64 {
        let det = self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0];
        det.abs().sqrt().to_degrees() * 3600.0
    }
}

/// Great-circle distance in radians between two sky positions
pub fn angular_separation(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * a.sqrt().min(1.0).asin()
}

/// Named bit planes attached to a map (e.g. the AST and PCA masks the
/// solver used)
#[derive(Debug, Clone, PartialEq)]
pub struct QualityPlane {
    pub names: Vec<String>,
    pub bits: Array2<u8>,
}

impl QualityPlane {
    /// Bit value of a named quality flag; names map onto bits 1, 2, 4, ...
    pub fn bit_for(&self, name: &str) -> Option<u8> {
        self.names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(name))
            .filter(|&i| i < 8)
            .map(|i| 1u8 << i)
    }
}

/// In-memory image with optional variance, exposure time and quality.
///
/// Bad pixels are NaN in `data`. `lower_bound` is the pixel index of the
/// first element along (x, y), so two maps on the same projection can be
/// intersected by comparing bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct MapImage {
    pub data: Array2<f64>,
    pub variance: Option<Array2<f64>>,
    pub exposure: Option<Array2<f64>>,
    pub quality: Option<QualityPlane>,
    pub lower_bound: (i64, i64),
    pub projection: TanProjection,
    pub units: String,
    /// Flux conversion factor recorded in the header, if any
    pub fcf: Option<f64>,
}

impl MapImage {
    pub fn new(data: Array2<f64>, projection: TanProjection) -> Self {
        Self {
            data,
            variance: None,
            exposure: None,
            quality: None,
            lower_bound: (1, 1),
            projection,
            units: "pW".to_string(),
            fcf: None,
        }
    }

    pub fn with_variance(mut self, variance: Array2<f64>) -> Self {
        self.variance = Some(variance);
        self
    }

    pub fn with_exposure(mut self, exposure: Array2<f64>) -> Self {
        self.exposure = Some(exposure);
        self
    }

    pub fn with_quality(mut self, quality: QualityPlane) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_units(mut self, units: &str) -> Self {
        self.units = units.to_string();
        self
    }

    pub fn with_lower_bound(mut self, lower_bound: (i64, i64)) -> Self {
        self.lower_bound = lower_bound;
        self
    }

    /// Array shape as (ny, nx)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Inclusive upper pixel bound along (x, y)
    pub fn upper_bound(&self) -> (i64, i64) {
        let (ny, nx) = self.shape();
        (
            self.lower_bound.0 + nx as i64 - 1,
            self.lower_bound.1 + ny as i64 - 1,
        )
    }

    /// Central pixel position (pixel-index coordinates, may be fractional)
    pub fn centre(&self) -> (f64, f64) {
        let upper = self.upper_bound();
        (
            0.5 * (self.lower_bound.0 + upper.0) as f64,
            0.5 * (self.lower_bound.1 + upper.1) as f64,
        )
    }

    /// Number of pixels with a finite data value
    pub fn good_pixels(&self) -> usize {
        self.data.iter().filter(|v| v.is_finite()).count()
    }

    /// Signal-to-noise image, NaN wherever the variance is missing or not
    /// positive
    pub fn snr(&self) -> Option<Array2<f64>> {
        let variance = self.variance.as_ref()?;
        let mut snr = self.data.clone();
        ndarray::Zip::from(&mut snr).and(variance).for_each(|s, &v| {
            *s = if v.is_finite() && v > 0.0 && s.is_finite() {
                *s / v.sqrt()
            } else {
                f64::NAN
            };
        });
        Some(snr)
    }
}

/// Reads and writes map files
pub trait ImageStore {
    fn read_map(&self, path: &Path) -> anyhow::Result<MapImage>;
    fn write_map(&self, path: &Path, image: &MapImage) -> anyhow::Result<()>;
}

/// Splits raw exposures of one observation into Q, U and I time-series
pub trait DecompositionEngine {
    /// Returns the paths of every component time-series file created
    fn decompose(
        &self,
        raw: &[PathBuf],
        north: &str,
        band: Waveband,
        output_dir: &Path,
    ) -> anyhow::Result<Vec<PathBuf>>;
}

/// Everything the iterative solver needs for one component map
#[derive(Debug, Clone, Copy)]
pub struct SolveRequest<'a> {
    pub key: ObservationKey,
    pub component: StokesComponent,
    pub inputs: &'a [PathBuf],
    pub config: &'a ResolvedConfig,
    pub output: &'a Path,
    /// Reference map defining the output pixel grid
    pub reference: Option<&'a Path>,
    /// Pointing correction table
    pub pointing: Option<&'a Path>,
    pub ast_mask: Option<&'a Path>,
    pub pca_mask: Option<&'a Path>,
    pub pixel_size: Option<f64>,
    /// Total-intensity map used for instrumental-polarisation correction
    pub ip_reference: Option<&'a Path>,
    /// Stop as soon as non-convergence becomes apparent
    pub abort_soon: bool,
}

impl<'a> SolveRequest<'a> {
    pub fn with_config(mut self, config: &'a ResolvedConfig) -> Self {
        self.config = config;
        self
    }
}

/// What the solver reports back after a successful invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SolveReport {
    /// 0 when the solution converged, otherwise the iteration at which
    /// convergence was abandoned
    pub aborted_at: u32,
}

/// Iterative map-maker
pub trait MapSolver {
    fn solve(&self, request: &SolveRequest<'_>) -> anyhow::Result<SolveReport>;
}

/// Measures the pixel offset of an image relative to a reference map
pub trait AlignmentEngine {
    /// Returns the (dx, dy) pixel shift that moves `image` onto `reference`
    fn align(&self, reference: &Path, image: &MapImage) -> anyhow::Result<(f64, f64)>;
}

/// Segments a signal-to-noise image into labelled clumps
pub trait SegmentationEngine {
    /// Pixels belonging to a clump get a non-zero label. A clump is made of
    /// contiguous pixels above `noise` that contain at least one pixel
    /// above `min_height`.
    fn segment(
        &self,
        snr: &Array2<f64>,
        noise: f64,
        min_height: f64,
    ) -> anyhow::Result<Array2<u32>>;
}

/// Which plane of the input maps to mosaic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MosaicChannel {
    Data,
    ExposureTime,
    Weights,
}

#[derive(Debug, Clone, Copy)]
pub struct MosaicRequest<'a> {
    pub inputs: &'a [PathBuf],
    pub output: &'a Path,
    pub channel: MosaicChannel,
    /// Estimate output variance from the spread of the input values
    pub gen_var: bool,
    /// Average rather than sum overlapping pixels
    pub normalise: bool,
}

/// Aligns and combines maps onto a common grid
pub trait MosaicEngine {
    fn mosaic(&self, request: &MosaicRequest<'_>) -> anyhow::Result<()>;
    fn copy(&self, input: &Path, output: &Path) -> anyhow::Result<()>;
    /// Resample `input` onto the pixel grid of `grid`
    fn resample(&self, input: &Path, grid: &Path, output: &Path) -> anyhow::Result<()>;
    /// Create an empty grid with the projection of `template` and pixels of
    /// `bin_size` arc-seconds
    fn make_grid(&self, template: &Path, bin_size: f64, output: &Path) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct TabulationRequest<'a> {
    pub catalogue: &'a Path,
    pub debias: bool,
    pub magnitude_map: Option<&'a Path>,
}

/// Converts a Q/U/I cube into a vector catalogue
pub trait TabulationEngine {
    fn tabulate(&self, cube: &StokesCube, request: &TabulationRequest<'_>) -> anyhow::Result<()>;
}

/// The complete set of engines a run talks to
pub struct Engines {
    pub store: Box<dyn ImageStore>,
    pub decomposer: Box<dyn DecompositionEngine>,
    pub solver: Box<dyn MapSolver>,
    pub aligner: Box<dyn AlignmentEngine>,
    pub segmenter: Box<dyn SegmentationEngine>,
    pub mosaic: Box<dyn MosaicEngine>,
    pub tabulator: Box<dyn TabulationEngine>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_projection_reference_pixel_maps_to_crval() {
        let proj = TanProjection::new([10.0, 20.0], [1.2, -0.4], 4.0);
        let (lon, lat) = proj.pixel_to_sky(10.0, 20.0);
        assert_relative_eq!(lon, 1.2, epsilon = 1e-12);
        assert_relative_eq!(lat, -0.4, epsilon = 1e-12);
        assert_relative_eq!(proj.pixel_scale(), 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_one_pixel_step_is_one_pixel_scale() {
        let proj = TanProjection::new([1.0, 1.0], [0.5, 0.3], 4.0);
        let (lon0, lat0) = proj.pixel_to_sky(1.0, 1.0);
        let (lon1, lat1) = proj.pixel_to_sky(1.0, 2.0);
        let sep = angular_separation(lon0, lat0, lon1, lat1).to_degrees() * 3600.0;
        assert_relative_eq!(sep, 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_bounds_and_centre() {
        let projection = TanProjection::new([1.0, 1.0], [0.0, 0.0], 4.0);
        let image = MapImage::new(Array2::zeros((4, 6)), projection).with_lower_bound((-2, -1));
        assert_eq!(image.upper_bound(), (3, 2));
        assert_eq!(image.centre(), (0.5, 0.5));
    }

    #[test]
    fn test_snr_masks_missing_variance() {
        let projection = TanProjection::new([1.0, 1.0], [0.0, 0.0], 4.0);
        let image = MapImage::new(array![[4.0, 2.0], [f64::NAN, 1.0]], projection)
            .with_variance(array![[4.0, 0.0], [1.0, 1.0]]);
        let snr = image.snr().unwrap();
        assert_relative_eq!(snr[[0, 0]], 2.0);
        assert!(snr[[0, 1]].is_nan());
        assert!(snr[[1, 0]].is_nan());
        assert_relative_eq!(snr[[1, 1]], 1.0);
    }

    #[test]
    fn test_quality_bits_follow_name_order() {
        let plane = QualityPlane {
            names: vec!["RING".into(), "AST".into(), "PCA".into()],
            bits: Array2::zeros((1, 1)),
        };
        assert_eq!(plane.bit_for("ast"), Some(2));
        assert_eq!(plane.bit_for("PCA"), Some(4));
        assert_eq!(plane.bit_for("COM"), None);
    }
}

//! Pointing corrections.
//!
//! Two sources of correction feed the solver's pointing table: a fixed
//! AZ/EL offset for data from the 2015 commissioning period, and a tracking
//! offset measured by aligning an earlier intensity map with a reference.
//! Both are applied when both exist.

use crate::engines::{angular_separation, AlignmentEngine, ImageStore, MapImage};
use crate::types::{
    AngularOffset, CorrectionValidity, ObservationError, ObservationKey, ObservationResult,
    PipelineResult, PointingCorrection,
};
use std::f64::consts::PI;
use std::fmt::Write as _;
use std::path::Path;

/// First and last UT dates needing the fixed AZ/EL correction
pub const LEGACY_EPOCH: (u32, u32) = (20150606, 20150929);

/// AZ/EL correction for the legacy epoch, arc-seconds
pub const LEGACY_AZEL_OFFSET: AngularOffset = AngularOffset { dx: 32.1, dy: 27.4 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointingSystem {
    AzEl,
    Tracking,
}

impl PointingSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointingSystem::AzEl => "azel",
            PointingSystem::Tracking => "tracking",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointingEntry {
    pub system: PointingSystem,
    /// Arc-seconds
    pub dlon: f64,
    pub dlat: f64,
}

/// Ordered list of corrections, all of which the solver applies
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointingTable {
    entries: Vec<PointingEntry>,
}

impl PointingTable {
    /// Corrections for one chunk: the legacy AZ/EL offset where its date
    /// calls for it, followed by any stored tracking correction
    pub fn for_observation(key: &ObservationKey, stored: Option<AngularOffset>) -> Self {
        let mut table = Self::default();
        let ut = key.utdate();
        if ut >= LEGACY_EPOCH.0 && ut <= LEGACY_EPOCH.1 {
            table.push(PointingSystem::AzEl, LEGACY_AZEL_OFFSET);
        }
        if let Some(offset) = stored {
            table.push(PointingSystem::Tracking, offset);
        }
        table
    }

    pub fn push(&mut self, system: PointingSystem, offset: AngularOffset) {
        self.entries.push(PointingEntry {
            system,
            dlon: offset.dx,
            dlat: offset.dy,
        });
    }

    pub fn entries(&self) -> &[PointingEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The tracking-system correction, recorded on maps made with it
    pub fn tracking_correction(&self) -> Option<AngularOffset> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.system == PointingSystem::Tracking)
            .map(|e| AngularOffset { dx: e.dlon, dy: e.dlat })
    }

    /// Text form read by the solver. Tables are separated by `--`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push_str("--\n");
            }
            let _ = writeln!(out, "# system={}", entry.system.as_str());
            out.push_str("# tai dlon dlat\n");
            for tai in [54000, 56000] {
                let _ = writeln!(out, "{} {} {}", tai, entry.dlon, entry.dlat);
            }
        }
        out
    }

    pub fn write(&self, path: &Path) -> PipelineResult<()> {
        std::fs::write(path, self.render())?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointingParams {
    /// Largest believable shift along either axis, in pixels
    pub max_offset_pixels: f64,
    /// Fewest pixels a quality-masked map may keep before falling back to
    /// the exposure-time mask
    pub min_quality_pixels: usize,
    /// Quality flag marking background pixels
    pub quality_name: String,
}

impl Default for PointingParams {
    fn default() -> Self {
        Self {
            max_offset_pixels: 8.0,
            min_quality_pixels: 400,
            quality_name: "AST".to_string(),
        }
    }
}

/// Wrap an angle into (-pi, pi]
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}

/// Convert a pixel shift measured on `image` into arc-seconds along the
/// longitude and latitude axes at the map centre
pub fn pixel_offset_to_angular(image: &MapImage, dx: f64, dy: f64) -> AngularOffset {
    let (cx, cy) = image.centre();
    let (cen_a, cen_b) = image.projection.pixel_to_sky(cx, cy);
    let (off_a, off_b) = image.projection.pixel_to_sky(cx + dx, cy + dy);
    let arcsec = |rad: f64| rad.to_degrees() * 3600.0;

    let mut along_lon = arcsec(angular_separation(cen_a, cen_b, off_a, cen_b));
    if normalize_angle(off_a - cen_a) < 0.0 {
        along_lon = -along_lon;
    }
    let mut along_lat = arcsec(angular_separation(cen_a, cen_b, cen_a, off_b));
    if off_b - cen_b < 0.0 {
        along_lat = -along_lat;
    }
    AngularOffset {
        dx: along_lon,
        dy: along_lat,
    }
}

/// Measures how far an intensity map sits from a reference map
pub struct PointingCorrector<'a> {
    aligner: &'a dyn AlignmentEngine,
    store: &'a dyn ImageStore,
    params: PointingParams,
}

impl<'a> PointingCorrector<'a> {
    pub fn new(
        aligner: &'a dyn AlignmentEngine,
        store: &'a dyn ImageStore,
        params: PointingParams,
    ) -> Self {
        Self { aligner, store, params }
    }

    /// Copy of `image` restricted to well-exposed source pixels.
    ///
    /// Background pixels flagged in the quality plane are removed. If that
    /// leaves too few pixels, the whole map is used instead with pixels
    /// below the mean exposure time removed.
    pub fn alignment_image(&self, image: &MapImage) -> MapImage {
        let mut masked = image.clone();
        if let Some((plane, bit)) = image
            .quality
            .as_ref()
            .and_then(|q| q.bit_for(&self.params.quality_name).map(|b| (q, b)))
        {
            ndarray::Zip::from(&mut masked.data)
                .and(&plane.bits)
                .for_each(|v, &q| {
                    if q & bit != 0 {
                        *v = f64::NAN;
                    }
                });
        }

        if masked.good_pixels() >= self.params.min_quality_pixels {
            return masked;
        }

        let mut fallback = image.clone();
        if let Some(exposure) = &image.exposure {
            let finite: Vec<f64> = exposure.iter().cloned().filter(|v| v.is_finite()).collect();
            if !finite.is_empty() {
                let mean = finite.iter().sum::<f64>() / finite.len() as f64;
                ndarray::Zip::from(&mut fallback.data).and(exposure).for_each(|v, &t| {
                    if !(t >= mean) {
                        *v = f64::NAN;
                    }
                });
            }
        }
        log::debug!(
            "Quality mask kept {} pixels; using exposure mask with {} pixels",
            masked.good_pixels(),
            fallback.good_pixels()
        );
        fallback
    }

    /// Measure the correction for one chunk's intensity map.
    ///
    /// Nothing here is fatal: any failure or an implausibly large shift
    /// rejects the correction for this chunk only.
    pub fn measure(
        &self,
        key: ObservationKey,
        map: &Path,
        reference: &Path,
    ) -> ObservationResult<PointingCorrection> {
        let reject = |reason: String| ObservationError::AlignmentRejected { key, reason };

        let image = self
            .store
            .read_map(map)
            .map_err(|e| reject(format!("cannot read {}: {}", map.display(), e)))?;
        let target = self.alignment_image(&image);

        let (dx, dy) = self
            .aligner
            .align(reference, &target)
            .map_err(|e| reject(format!("alignment failed: {}", e)))?;

        let limit = self.params.max_offset_pixels;
        if !(dx.abs() <= limit && dy.abs() <= limit) {
            return Err(reject(format!(
                "shift of ({:.2}, {:.2}) pixels exceeds {} pixels",
                dx, dy, limit
            )));
        }

        let offset = pixel_offset_to_angular(&image, dx, dy);
        log::info!(
            "📍 {}: pointing correction of ({:5.1}, {:5.1}) arc-seconds",
            key,
            offset.dx,
            offset.dy
        );
        Ok(PointingCorrection {
            key,
            dx: offset.dx,
            dy: offset.dy,
            validity: CorrectionValidity::Fresh,
        })
    }
}

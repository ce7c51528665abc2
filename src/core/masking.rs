//! Source masks derived from a signal-to-noise image.
//!
//! Very bright sources can produce masks that leave too few background
//! pixels for the solver. Each pass therefore raises the segmentation
//! thresholds until the masked fraction of the originally good pixels fits
//! within the pass budget.

use crate::engines::{ImageStore, MapImage, SegmentationEngine};
use crate::types::{PipelineError, PipelineResult};
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// Starting thresholds and pixel budget of one masking pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskPass {
    /// Largest allowed fraction of good pixels flagged as source
    pub budget: f64,
    pub noise: f64,
    pub min_height: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaskBuilderParams {
    /// Broad mask (solver AST model)
    pub broad: MaskPass,
    /// Tight mask (solver PCA, COM and FLT models)
    pub tight: MaskPass,
    /// Growth of the height threshold once noise has caught up with it
    pub height_growth: f64,
    pub max_iterations: usize,
}

impl Default for MaskBuilderParams {
    fn default() -> Self {
        Self {
            broad: MaskPass {
                budget: 0.2,
                noise: 2.0,
                min_height: 3.0,
            },
            tight: MaskPass {
                budget: 0.1,
                noise: 3.0,
                min_height: 5.0,
            },
            height_growth: 1.2,
            max_iterations: 50,
        }
    }
}

/// Thresholds tried and fraction obtained on one iteration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskIteration {
    pub noise: f64,
    pub min_height: f64,
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaskResult {
    /// True for source pixels
    pub mask: Array2<bool>,
    pub fraction: f64,
    pub iterations: Vec<MaskIteration>,
}

impl MaskResult {
    pub fn source_pixels(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }
}

/// Masks written for the solver
#[derive(Debug, Clone, PartialEq)]
pub struct MaskSet {
    pub ast_mask: PathBuf,
    pub pca_mask: Option<PathBuf>,
    pub broad: MaskResult,
    pub tight: Option<MaskResult>,
}

pub struct MaskBuilder<'a> {
    segmenter: &'a dyn SegmentationEngine,
    params: MaskBuilderParams,
}

impl<'a> MaskBuilder<'a> {
    pub fn new(segmenter: &'a dyn SegmentationEngine, params: MaskBuilderParams) -> Self {
        Self { segmenter, params }
    }

    /// Run one pass. Returns `None` if segmentation finds no source pixels
    /// (or fails) before the budget is met.
    pub fn build(&self, snr: &Array2<f64>, pass: &MaskPass) -> Option<MaskResult> {
        let good = snr.iter().filter(|v| v.is_finite()).count();
        if good == 0 {
            log::warn!("Signal-to-noise image has no good pixels");
            return None;
        }

        let mut noise = pass.noise;
        let mut min_height = pass.min_height;
        let mut iterations = Vec::new();

        for _ in 0..self.params.max_iterations {
            let labels = match self.segmenter.segment(snr, noise, min_height) {
                Ok(labels) => labels,
                Err(e) => {
                    log::warn!(
                        "Segmentation failed at noise={} height={}: {}",
                        noise,
                        min_height,
                        e
                    );
                    return None;
                }
            };
            let mask = labels.mapv(|l| l > 0);
            let flagged = mask.iter().filter(|&&m| m).count();
            if flagged == 0 {
                log::debug!("No clumps found at noise={} height={}", noise, min_height);
                return None;
            }

            let fraction = flagged as f64 / good as f64;
            iterations.push(MaskIteration {
                noise,
                min_height,
                fraction,
            });
            log::debug!(
                "Mask at noise={:.3} height={:.3} flags {:.1}% of good pixels",
                noise,
                min_height,
                100.0 * fraction
            );

            if fraction <= pass.budget {
                return Some(MaskResult {
                    mask,
                    fraction,
                    iterations,
                });
            }

            if noise == min_height {
                min_height *= self.params.height_growth;
            }
            noise = min_height;
        }

        log::warn!(
            "Mask budget of {:.0}% not met after {} iterations",
            100.0 * pass.budget,
            self.params.max_iterations
        );
        None
    }

    /// Build the broad and tight masks from a signal map and write them.
    ///
    /// No broad mask is fatal. No tight mask just means the solver runs
    /// without one.
    pub fn build_masks(
        &self,
        store: &dyn ImageStore,
        signal_map: &Path,
        ast_out: &Path,
        pca_out: &Path,
    ) -> PipelineResult<MaskSet> {
        let signal = store.read_map(signal_map).map_err(|e| PipelineError::Engine {
            engine: "image store",
            message: format!("cannot read mask signal map {}: {}", signal_map.display(), e),
        })?;
        let snr = signal.snr().ok_or_else(|| {
            PipelineError::InvalidConfiguration(format!(
                "Mask signal map {} has no variance",
                signal_map.display()
            ))
        })?;

        log::info!("🎭 Building source masks from {}", signal_map.display());
        let broad = self.build(&snr, &self.params.broad).ok_or_else(|| {
            PipelineError::InsufficientSignal(format!(
                "No significant emission found in mask signal map {}",
                signal_map.display()
            ))
        })?;
        write_mask(store, &signal, &broad.mask, ast_out)?;
        log::info!(
            "AST mask covers {:.1}% of good pixels after {} iterations",
            100.0 * broad.fraction,
            broad.iterations.len()
        );

        let tight = self.build(&snr, &self.params.tight);
        let pca_mask = match &tight {
            Some(result) => {
                write_mask(store, &signal, &result.mask, pca_out)?;
                log::info!("PCA mask covers {:.1}% of good pixels", 100.0 * result.fraction);
                Some(pca_out.to_path_buf())
            }
            None => {
                log::warn!("⚠️  No emission bright enough for a PCA mask; going on without one");
                None
            }
        };

        Ok(MaskSet {
            ast_mask: ast_out.to_path_buf(),
            pca_mask,
            broad,
            tight,
        })
    }
}

/// Source pixels are 1, everything else bad
fn write_mask(
    store: &dyn ImageStore,
    template: &MapImage,
    mask: &Array2<bool>,
    out: &Path,
) -> PipelineResult<()> {
    let image = MapImage::new(mask.mapv(|m| if m { 1.0 } else { f64::NAN }), template.projection)
        .with_lower_bound(template.lower_bound)
        .with_units("");
    store.write_map(out, &image).map_err(|e| PipelineError::Engine {
        engine: "image store",
        message: format!("cannot write mask {}: {}", out.display(), e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Labels every pixel above `noise`, provided the image has a peak above
    /// `min_height`
    struct ThresholdSegmenter {
        calls: RefCell<Vec<(f64, f64)>>,
    }

    impl SegmentationEngine for ThresholdSegmenter {
        fn segment(
            &self,
            snr: &Array2<f64>,
            noise: f64,
            min_height: f64,
        ) -> anyhow::Result<Array2<u32>> {
            self.calls.borrow_mut().push((noise, min_height));
            let peak = snr.iter().cloned().filter(|v| v.is_finite()).fold(f64::MIN, f64::max);
            Ok(snr.mapv(|v| u32::from(peak >= min_height && v.is_finite() && v >= noise)))
        }
    }

    /// 20x20 image falling off linearly from a bright centre
    fn bright_core() -> Array2<f64> {
        Array2::from_shape_fn((20, 20), |(y, x)| {
            let r = ((x as f64 - 9.5).powi(2) + (y as f64 - 9.5).powi(2)).sqrt();
            (40.0 - 3.0 * r).max(0.0)
        })
    }

    #[test]
    fn test_masks_fit_their_budgets() {
        let seg = ThresholdSegmenter { calls: RefCell::new(Vec::new()) };
        let params = MaskBuilderParams::default();
        let builder = MaskBuilder::new(&seg, params.clone());
        let snr = bright_core();

        for pass in [params.broad, params.tight] {
            let result = builder.build(&snr, &pass).unwrap();
            assert!(result.fraction <= pass.budget);
            assert!(result.source_pixels() > 0);
            for pair in result.iterations.windows(2) {
                assert!(pair[1].noise >= pair[0].noise);
                assert!(pair[1].min_height >= pair[0].min_height);
            }
        }
    }

    #[test]
    fn test_threshold_schedule() {
        let seg = ThresholdSegmenter { calls: RefCell::new(Vec::new()) };
        let builder = MaskBuilder::new(&seg, MaskBuilderParams::default());
        builder.build(&bright_core(), &MaskBuilderParams::default().broad).unwrap();

        let calls = seg.calls.borrow();
        assert_eq!(calls[0], (2.0, 3.0));
        assert_eq!(calls[1], (3.0, 3.0));
        assert!((calls[2].0 - 3.6).abs() < 1e-12);
        assert!((calls[2].1 - 3.6).abs() < 1e-12);
    }

    #[test]
    fn test_empty_image_yields_no_mask() {
        let seg = ThresholdSegmenter { calls: RefCell::new(Vec::new()) };
        let builder = MaskBuilder::new(&seg, MaskBuilderParams::default());
        let flat = Array2::from_elem((10, 10), 0.5);
        assert!(builder.build(&flat, &MaskBuilderParams::default().broad).is_none());
        assert_eq!(seg.calls.borrow().len(), 1);
    }
}

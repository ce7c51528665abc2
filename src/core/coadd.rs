//! Stacking of per-observation maps into one product per component.

use crate::engines::{ImageStore, MosaicChannel, MosaicEngine, MosaicRequest};
use crate::io::workspace::CancelHandle;
use crate::types::{
    Artifact, CoaddProduct, PipelineError, PipelineResult, StokesComponent, VariancePolicy,
};
use std::path::{Path, PathBuf};

/// What to stack and where to put it
#[derive(Debug, Clone, Copy)]
pub struct CoaddRequest<'a> {
    pub component: StokesComponent,
    pub contributors: &'a [Artifact],
    pub variance_policy: VariancePolicy,
    pub output: &'a Path,
    /// Grid at catalogue resolution, if the maps are to be binned up
    pub catalogue_grid: Option<&'a Path>,
    /// Second, independent coadd used only for the catalogue
    pub catalogue_output: Option<&'a Path>,
    /// Directory for resampled copies
    pub scratch: &'a Path,
}

pub struct CoaddEngine<'a> {
    mosaic: &'a dyn MosaicEngine,
    cancel: &'a CancelHandle,
}

fn engine_error(e: anyhow::Error) -> PipelineError {
    PipelineError::Engine {
        engine: "mosaic",
        message: format!("{:#}", e),
    }
}

impl<'a> CoaddEngine<'a> {
    pub fn new(mosaic: &'a dyn MosaicEngine, cancel: &'a CancelHandle) -> Self {
        Self { mosaic, cancel }
    }

    fn check_cancel(&self) -> PipelineResult<()> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Create the catalogue grid from the first contributing map. The bin
    /// size may not be finer than the map pixels.
    pub fn prepare_catalogue_grid(
        &self,
        store: &dyn ImageStore,
        template: &Path,
        bin_size: f64,
        output: &Path,
    ) -> PipelineResult<()> {
        let image = store.read_map(template).map_err(|e| PipelineError::Engine {
            engine: "image store",
            message: format!("cannot read {}: {:#}", template.display(), e),
        })?;
        let pixel_scale = image.projection.pixel_scale();
        // Allow for rounding in the stored projection
        if bin_size < pixel_scale * (1.0 - 1e-6) {
            return Err(PipelineError::InvalidConfiguration(format!(
                "Requested catalogue bin size ({}) is smaller than the map pixel size ({:.3})",
                bin_size, pixel_scale
            )));
        }
        log::info!("The vector catalogue will use maps binned up to {} arcsec pixels", bin_size);
        self.check_cancel()?;
        self.mosaic.make_grid(template, bin_size, output).map_err(engine_error)
    }

    fn stack(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        policy: VariancePolicy,
        with_aux: bool,
    ) -> PipelineResult<()> {
        self.check_cancel()?;
        self.mosaic
            .mosaic(&MosaicRequest {
                inputs,
                output,
                channel: MosaicChannel::Data,
                gen_var: policy == VariancePolicy::SpreadOfInputs,
                normalise: true,
            })
            .map_err(engine_error)?;

        if with_aux {
            // Totals across observations, not means
            for channel in [MosaicChannel::ExposureTime, MosaicChannel::Weights] {
                self.check_cancel()?;
                self.mosaic
                    .mosaic(&MosaicRequest {
                        inputs,
                        output,
                        channel,
                        gen_var: false,
                        normalise: false,
                    })
                    .map_err(engine_error)?;
            }
        }
        Ok(())
    }

    /// Rebuild the coadd of `request.component` from all its contributors
    pub fn combine(&self, request: &CoaddRequest<'_>) -> PipelineResult<CoaddProduct> {
        let inputs: Vec<PathBuf> = request.contributors.iter().map(|a| a.path.clone()).collect();
        if inputs.is_empty() {
            return Err(PipelineError::NoUsableProducts {
                component: request.component,
            });
        }

        if inputs.len() == 1 {
            log::info!(
                "Copying the single {} map to {}",
                request.component,
                request.output.display()
            );
            self.check_cancel()?;
            self.mosaic.copy(&inputs[0], request.output).map_err(engine_error)?;
        } else {
            log::info!(
                "🧩 Coadding {} {} maps into {}",
                inputs.len(),
                request.component,
                request.output.display()
            );
            self.stack(&inputs, request.output, request.variance_policy, true)?;
        }

        if let Some(catalogue_output) = request.catalogue_output {
            match request.catalogue_grid {
                Some(grid) => {
                    if inputs.len() == 1 {
                        self.check_cancel()?;
                        self.mosaic
                            .resample(&inputs[0], grid, catalogue_output)
                            .map_err(engine_error)?;
                    } else {
                        let mut binned = Vec::with_capacity(inputs.len());
                        for input in &inputs {
                            let name = input
                                .file_stem()
                                .map(|s| s.to_string_lossy().into_owned())
                                .unwrap_or_else(|| "map".to_string());
                            let out = request.scratch.join(format!("{}_binned.sdf", name));
                            self.check_cancel()?;
                            self.mosaic.resample(input, grid, &out).map_err(engine_error)?;
                            binned.push(out);
                        }
                        self.stack(&binned, catalogue_output, request.variance_policy, false)?;
                    }
                }
                None => {
                    self.check_cancel()?;
                    self.mosaic.copy(request.output, catalogue_output).map_err(engine_error)?;
                }
            }
        }

        Ok(CoaddProduct {
            component: request.component,
            contributors: request.contributors.to_vec(),
            variance_policy: request.variance_policy,
            output: request.output.to_path_buf(),
            catalogue_output: request.catalogue_output.map(Path::to_path_buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObservationKey;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingMosaic {
        calls: RefCell<Vec<String>>,
    }

    impl MosaicEngine for RecordingMosaic {
        fn mosaic(&self, request: &MosaicRequest<'_>) -> anyhow::Result<()> {
            self.calls.borrow_mut().push(format!(
                "mosaic {:?} n={} genvar={} norm={}",
                request.channel,
                request.inputs.len(),
                request.gen_var,
                request.normalise
            ));
            Ok(())
        }
        fn copy(&self, _input: &Path, _output: &Path) -> anyhow::Result<()> {
            self.calls.borrow_mut().push("copy".to_string());
            Ok(())
        }
        fn resample(&self, _input: &Path, _grid: &Path, _output: &Path) -> anyhow::Result<()> {
            self.calls.borrow_mut().push("resample".to_string());
            Ok(())
        }
        fn make_grid(
            &self,
            _template: &Path,
            _bin_size: f64,
            _output: &Path,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn artifacts(n: u32) -> Vec<Artifact> {
        (1..=n)
            .map(|i| {
                let key =
                    ObservationKey::from_parts("20160101", &format!("{:05}", i), "0001").unwrap();
                let path = PathBuf::from(format!("{}.sdf", i));
                Artifact::map(key, StokesComponent::Intensity, path, None)
            })
            .collect()
    }

    fn request<'a>(contributors: &'a [Artifact], policy: VariancePolicy) -> CoaddRequest<'a> {
        CoaddRequest {
            component: StokesComponent::Intensity,
            contributors,
            variance_policy: policy,
            output: Path::new("coadd.sdf"),
            catalogue_grid: None,
            catalogue_output: None,
            scratch: Path::new("/tmp"),
        }
    }

    #[test]
    fn test_single_map_is_copied() {
        let mosaic = RecordingMosaic::default();
        let cancel = CancelHandle::new();
        let maps = artifacts(1);
        let product = CoaddEngine::new(&mosaic, &cancel)
            .combine(&request(&maps, VariancePolicy::SpreadOfInputs))
            .unwrap();
        assert_eq!(*mosaic.calls.borrow(), vec!["copy".to_string()]);
        assert_eq!(product.contributors.len(), 1);
    }

    #[test]
    fn test_many_maps_mosaic_data_and_sum_aux_channels() {
        let mosaic = RecordingMosaic::default();
        let cancel = CancelHandle::new();
        let maps = artifacts(3);
        CoaddEngine::new(&mosaic, &cancel)
            .combine(&request(&maps, VariancePolicy::SpreadOfInputs))
            .unwrap();
        assert_eq!(
            *mosaic.calls.borrow(),
            vec![
                "mosaic Data n=3 genvar=true norm=true".to_string(),
                "mosaic ExposureTime n=3 genvar=false norm=false".to_string(),
                "mosaic Weights n=3 genvar=false norm=false".to_string(),
            ]
        );
    }

    #[test]
    fn test_catalogue_coadd_is_built_from_binned_inputs() {
        let mosaic = RecordingMosaic::default();
        let cancel = CancelHandle::new();
        let maps = artifacts(2);
        let mut req = request(&maps, VariancePolicy::PropagateFromInputs);
        req.catalogue_grid = Some(Path::new("grid.sdf"));
        req.catalogue_output = Some(Path::new("coadd_cat.sdf"));
        let product = CoaddEngine::new(&mosaic, &cancel).combine(&req).unwrap();

        let calls = mosaic.calls.borrow();
        assert_eq!(calls.iter().filter(|c| *c == "resample").count(), 2);
        assert_eq!(calls.last().unwrap(), "mosaic Data n=2 genvar=false norm=true");
        assert_eq!(product.catalogue_output, Some(PathBuf::from("coadd_cat.sdf")));
    }

    #[test]
    fn test_no_contributors_is_fatal() {
        let mosaic = RecordingMosaic::default();
        let cancel = CancelHandle::new();
        let err = CoaddEngine::new(&mosaic, &cancel)
            .combine(&request(&[], VariancePolicy::PropagateFromInputs))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::NoUsableProducts {
                component: StokesComponent::Intensity
            }
        ));
    }

    #[test]
    fn test_cancel_stops_before_engine_call() {
        let mosaic = RecordingMosaic::default();
        let cancel = CancelHandle::new();
        cancel.cancel();
        let maps = artifacts(2);
        let err = CoaddEngine::new(&mosaic, &cancel)
            .combine(&request(&maps, VariancePolicy::PropagateFromInputs))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted));
        assert!(mosaic.calls.borrow().is_empty());
    }
}

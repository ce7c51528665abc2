//! polmosaic: incremental Q/U/I map-making for spin-and-scan polarimeters
//!
//! Raw exposures are decomposed into Q, U and I time-series, each
//! observation chunk is mapped separately with an adaptive convergence
//! search, and the per-observation maps are coadded and optionally turned
//! into a vector catalogue. Intermediate products are cached so that a
//! rerun with extra observations only maps the new ones.
//!
//! The heavy numerical work (decomposition, map solving, alignment,
//! mosaicking, tabulation) is done by engines plugged in through the
//! traits in [`engines`].

pub mod types;
pub mod engines;
pub mod io;
pub mod core;
pub mod pipeline;

// Re-export main types and functions for easier access
pub use types::{
    Artifact, ArtifactKind, MaskMode, MaskSpec, ObservationError, ObservationKey, PipelineError,
    PipelineResult, StokesComponent, VariancePolicy, Waveband,
};

pub use engines::{Engines, MapImage};
pub use io::{CacheManager, CancelHandle, Classifier, Workspace};
pub use pipeline::{Pipeline, RunConfig, RunReport};

#[cfg(feature = "python")]
mod python {
    use crate::core::config::{ConfigComposer, ConfigOverlay, SolverTarget};
    use crate::io::Classifier;
    use crate::types::{ArtifactKind, MaskMode};
    use pyo3::prelude::*;
    use std::path::PathBuf;

    fn runtime_error(e: impl std::fmt::Display) -> PyErr {
        PyErr::new::<pyo3::exceptions::PyRuntimeError, _>(format!("{}", e))
    }

    /// Python module definition
    #[pymodule]
    fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
        m.add_class::<PyClassifier>()?;
        m.add_function(wrap_pyfunction!(compose_config, m)?)?;
        Ok(())
    }

    /// Python wrapper for Classifier
    #[pyclass(name = "Classifier")]
    struct PyClassifier {
        inner: Classifier,
    }

    #[pymethods]
    impl PyClassifier {
        #[new]
        fn new() -> PyResult<Self> {
            Ok(PyClassifier {
                inner: Classifier::new().map_err(runtime_error)?,
            })
        }

        /// (path, kind, key) for every recognised input
        fn classify(&self, paths: Vec<String>) -> PyResult<Vec<(String, String, String)>> {
            let inputs: Vec<PathBuf> = paths.into_iter().map(PathBuf::from).collect();
            let classification = self.inner.classify(&inputs).map_err(runtime_error)?;
            let kind = |k: ArtifactKind| match k {
                ArtifactKind::RawExposure => "raw",
                ArtifactKind::ComponentSeries => "series",
                ArtifactKind::Map => "map",
            };
            Ok(classification
                .raw
                .iter()
                .chain(&classification.series)
                .chain(&classification.maps)
                .map(|f| {
                    let path = f.path.display().to_string();
                    (path, kind(f.kind).to_string(), f.key.to_string())
                })
                .collect())
        }
    }

    /// Render the solver configuration for a mask mode ("auto", "circle"
    /// or "ext") and target ("I" or "QU")
    #[pyfunction]
    fn compose_config(
        mode: &str,
        target: &str,
        user: &str,
        threshold: Option<f64>,
    ) -> PyResult<String> {
        let mode = MaskMode::from_tag(mode).ok_or_else(|| {
            PyErr::new::<pyo3::exceptions::PyValueError, _>(format!("Invalid mask mode: {}", mode))
        })?;
        let target = match target.to_uppercase().as_str() {
            "I" => SolverTarget::Intensity,
            "QU" => SolverTarget::Polarised,
            _ => {
                return Err(PyErr::new::<pyo3::exceptions::PyValueError, _>(format!(
                    "Invalid solver target: {}",
                    target
                )))
            }
        };
        let user = ConfigOverlay::parse("user", user).map_err(runtime_error)?;
        let composer = ConfigComposer::new(
            mode,
            mode == MaskMode::External,
            user,
            ConfigOverlay::new("user-intensity"),
            ConfigOverlay::new("user-polarised"),
        );
        Ok(composer.compose(target, threshold).render())
    }
}

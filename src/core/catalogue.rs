//! Assembly of the Q/U/I cube handed to the tabulation engine.

use crate::core::units::catalogue_fcf;
use crate::engines::{ImageStore, MapImage, TabulationEngine, TabulationRequest, TanProjection};
use crate::io::workspace::CancelHandle;
use crate::types::{PipelineError, PipelineResult, StokesComponent, Waveband};
use ndarray::{s, Array2, Array3, Axis};
use std::path::{Path, PathBuf};

/// Three stacked components trimmed to their common valid region
#[derive(Debug, Clone, PartialEq)]
pub struct StokesCube {
    /// Planes ordered as `order`, each (ny, nx)
    pub planes: Array3<f64>,
    pub variance: Option<Array3<f64>>,
    pub order: [StokesComponent; 3],
    pub lower_bound: (i64, i64),
    pub projection: TanProjection,
    pub units: String,
}

impl StokesCube {
    pub fn plane(&self, component: StokesComponent) -> Option<ndarray::ArrayView2<'_, f64>> {
        self.order
            .iter()
            .position(|c| *c == component)
            .map(|i| self.planes.index_axis(Axis(0), i))
    }

    /// Multiply values by `factor` (variances by its square)
    pub fn scale(&mut self, factor: f64, units: &str) {
        self.planes.mapv_inplace(|v| v * factor);
        if let Some(variance) = &mut self.variance {
            variance.mapv_inplace(|v| v * factor * factor);
        }
        self.units = units.to_string();
    }
}

fn window(image: &MapImage, lo: (i64, i64), hi: (i64, i64)) -> (usize, usize, usize, usize) {
    let x0 = (lo.0 - image.lower_bound.0) as usize;
    let y0 = (lo.1 - image.lower_bound.1) as usize;
    let x1 = (hi.0 - image.lower_bound.0) as usize + 1;
    let y1 = (hi.1 - image.lower_bound.1) as usize + 1;
    (y0, y1, x0, x1)
}

/// Stack `maps` (given in [`StokesComponent::CUBE_ORDER`]) over the pixels
/// valid in all of them. Pixels outside that set are bad in every plane.
pub fn assemble_cube(maps: &[MapImage; 3]) -> PipelineResult<StokesCube> {
    let scale = maps[0].projection.pixel_scale();
    if maps
        .iter()
        .any(|m| (m.projection.pixel_scale() - scale).abs() > 1e-6 * scale)
    {
        return Err(PipelineError::Consistency(
            "Q, U and I coadds have different pixel sizes".to_string(),
        ));
    }

    let mut lo = maps[0].lower_bound;
    let mut hi = maps[0].upper_bound();
    for m in &maps[1..] {
        let (l, u) = (m.lower_bound, m.upper_bound());
        lo = (lo.0.max(l.0), lo.1.max(l.1));
        hi = (hi.0.min(u.0), hi.1.min(u.1));
    }
    if lo.0 > hi.0 || lo.1 > hi.1 {
        return Err(PipelineError::Consistency(
            "Q, U and I coadds do not overlap".to_string(),
        ));
    }

    let cut = |a: &Array2<f64>, m: &MapImage| {
        let (y0, y1, x0, x1) = window(m, lo, hi);
        a.slice(s![y0..y1, x0..x1]).to_owned()
    };
    let data: Vec<Array2<f64>> = maps.iter().map(|m| cut(&m.data, m)).collect();
    let variance: Option<Vec<Array2<f64>>> = maps
        .iter()
        .map(|m| m.variance.as_ref().map(|v| cut(v, m)))
        .collect();

    let common =
        Array2::from_shape_fn(data[0].dim(), |idx| data.iter().all(|d| d[idx].is_finite()));
    let rows: Vec<usize> = common
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, r)| r.iter().any(|&v| v))
        .map(|(i, _)| i)
        .collect();
    let cols: Vec<usize> = common
        .axis_iter(Axis(1))
        .enumerate()
        .filter(|(_, c)| c.iter().any(|&v| v))
        .map(|(i, _)| i)
        .collect();
    let bounds = (rows.first(), rows.last(), cols.first(), cols.last());
    let (Some(&r0), Some(&r1), Some(&c0), Some(&c1)) = bounds else {
        return Err(PipelineError::Consistency(
            "Q, U and I coadds have no valid pixels in common".to_string(),
        ));
    };

    let (ny, nx) = (r1 - r0 + 1, c1 - c0 + 1);
    let trim = |planes: &[Array2<f64>]| {
        Array3::from_shape_fn((3, ny, nx), |(k, y, x)| {
            if common[[r0 + y, c0 + x]] {
                planes[k][[r0 + y, c0 + x]]
            } else {
                f64::NAN
            }
        })
    };

    Ok(StokesCube {
        planes: trim(&data),
        variance: variance.as_deref().map(trim),
        order: StokesComponent::CUBE_ORDER,
        lower_bound: (lo.0 + c0 as i64, lo.1 + r0 as i64),
        projection: maps[0].projection,
        units: maps[0].units.clone(),
    })
}

#[derive(Debug, Clone)]
pub struct CatalogueOptions {
    pub catalogue: PathBuf,
    pub magnitude_map: Option<PathBuf>,
    pub debias: bool,
    /// Convert pW to mJy/beam before tabulating
    pub jansky: bool,
    /// Jy/beam per pW; the band's standard value when unset
    pub fcf: Option<f64>,
    pub band: Waveband,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogueProduct {
    pub catalogue: PathBuf,
    pub magnitude_map: Option<PathBuf>,
    pub units: String,
}

pub struct CatalogueAssembler<'a> {
    store: &'a dyn ImageStore,
    tabulator: &'a dyn TabulationEngine,
    cancel: &'a CancelHandle,
}

impl<'a> CatalogueAssembler<'a> {
    pub fn new(
        store: &'a dyn ImageStore,
        tabulator: &'a dyn TabulationEngine,
        cancel: &'a CancelHandle,
    ) -> Self {
        Self {
            store,
            tabulator,
            cancel,
        }
    }

    /// Build the cube from the Q, U and I coadds (in that order) and
    /// tabulate it
    pub fn run(
        &self,
        coadds: [&Path; 3],
        options: &CatalogueOptions,
    ) -> PipelineResult<CatalogueProduct> {
        let mut maps = Vec::with_capacity(3);
        for path in coadds {
            let map = self.store.read_map(path).map_err(|e| PipelineError::Engine {
                engine: "image store",
                message: format!("cannot read coadd {}: {:#}", path.display(), e),
            })?;
            maps.push(map);
        }
        let maps: [MapImage; 3] = maps.try_into().map_err(|_| {
            PipelineError::Consistency("Expected exactly three coadds".to_string())
        })?;

        let mut cube = assemble_cube(&maps)?;
        if options.jansky {
            let fcf = options.fcf.unwrap_or_else(|| catalogue_fcf(options.band));
            cube.scale(1000.0 * fcf, "mJy/beam");
        }

        log::info!(
            "📊 Tabulating {}x{} Q/U/I cube into {}",
            cube.planes.dim().2,
            cube.planes.dim().1,
            options.catalogue.display()
        );
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Interrupted);
        }
        self.tabulator
            .tabulate(
                &cube,
                &TabulationRequest {
                    catalogue: &options.catalogue,
                    debias: options.debias,
                    magnitude_map: options.magnitude_map.as_deref(),
                },
            )
            .map_err(|e| PipelineError::Engine {
                engine: "tabulation",
                message: format!("{:#}", e),
            })?;

        Ok(CatalogueProduct {
            catalogue: options.catalogue.clone(),
            magnitude_map: options.magnitude_map.clone(),
            units: cube.units,
        })
    }
}

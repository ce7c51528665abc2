//! In-memory engines shared by the integration tests.
//!
//! Every mock holds the same `World`, so a test can script the engines'
//! behaviour and inspect what the pipeline asked of them afterwards.

#![allow(dead_code)]

use ndarray::Array2;
use polmosaic::core::StokesCube;
use polmosaic::engines::{
    AlignmentEngine, DecompositionEngine, Engines, ImageStore, MapImage, MapSolver, MosaicChannel,
    MosaicEngine, MosaicRequest, SegmentationEngine, SolveReport, SolveRequest, TabulationEngine,
    TabulationRequest, TanProjection,
};
use polmosaic::io::CancelHandle;
use polmosaic::types::{ObservationKey, StokesComponent, Subarray, Waveband};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone)]
pub struct SolverCall {
    pub key: ObservationKey,
    pub component: StokesComponent,
    pub inputs: usize,
    pub threshold: Option<f64>,
    pub abort_soon: bool,
    pub output: PathBuf,
    pub reference: Option<PathBuf>,
    pub ast_mask: Option<PathBuf>,
    pub pca_mask: Option<PathBuf>,
    pub ip_reference: Option<PathBuf>,
    /// Contents of the pointing table, if one was passed
    pub pointing: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MosaicCall {
    pub channel: MosaicChannel,
    pub inputs: usize,
    pub gen_var: bool,
    pub normalise: bool,
    pub output: PathBuf,
}

#[derive(Default)]
pub struct World {
    pub images: HashMap<PathBuf, MapImage>,
    /// Iteration at which each attempt for a key aborts; 0 once exhausted
    pub solver_script: HashMap<String, VecDeque<u32>>,
    pub solver_failures: HashSet<String>,
    /// Fail the solver on this attempt (counting from 1) for a key
    pub solver_fail_on_attempt: HashMap<String, usize>,
    pub solver_calls: Vec<SolverCall>,
    /// Cancel this handle once this many solver calls have been made
    pub cancel_after: Option<(usize, CancelHandle)>,
    pub decompose_failures: HashSet<String>,
    pub decompose_calls: Vec<String>,
    pub shift: (f64, f64),
    pub align_calls: usize,
    pub mosaic_calls: Vec<MosaicCall>,
    pub segment_calls: Vec<(f64, f64)>,
    pub tabulated: Vec<(PathBuf, (usize, usize, usize), String)>,
}

pub type Shared = Rc<RefCell<World>>;

pub fn world() -> Shared {
    Rc::new(RefCell::new(World {
        shift: (0.5, -0.25),
        ..Default::default()
    }))
}

/// A 32x32 pW map with unit variance and a flat exposure
pub fn test_map(value: f64) -> MapImage {
    MapImage::new(
        Array2::from_elem((32, 32), value),
        TanProjection::new([16.0, 16.0], [83.82f64.to_radians(), (-5.39f64).to_radians()], 4.0),
    )
    .with_variance(Array2::from_elem((32, 32), 1.0))
    .with_exposure(Array2::from_elem((32, 32), 2.0))
}

/// A map holding a Gaussian source of peak `peak` sigma in its centre
pub fn source_map(peak: f64, width: f64) -> MapImage {
    let mut map = test_map(0.0);
    map.data = Array2::from_shape_fn((32, 32), |(y, x)| {
        let r2 = (x as f64 - 15.5).powi(2) + (y as f64 - 15.5).powi(2);
        peak * (-r2 / (2.0 * width * width)).exp()
    });
    map
}

fn touch(path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, b"")?;
    Ok(())
}

/// Create the raw exposure files of one observation: every subarray, each
/// of `chunks` subscans
pub fn raw_observation(dir: &Path, date: &str, observation: u32, chunks: u32) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for sub in Subarray::ALL {
        for chunk in 1..=chunks {
            let name = format!("s8{}{}_{:05}_{:04}.sdf", sub.letter(), date, observation, chunk);
            let path = dir.join(name);
            std::fs::write(&path, b"raw").expect("Failed to create raw file");
            files.push(path);
        }
    }
    files
}

pub struct MemoryStore(pub Shared);

impl ImageStore for MemoryStore {
    fn read_map(&self, path: &Path) -> anyhow::Result<MapImage> {
        self.0
            .borrow()
            .images
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no map at {}", path.display()))
    }

    fn write_map(&self, path: &Path, image: &MapImage) -> anyhow::Result<()> {
        touch(path)?;
        self.0.borrow_mut().images.insert(path.to_path_buf(), image.clone());
        Ok(())
    }
}

pub struct MockDecomposer(pub Shared);

impl DecompositionEngine for MockDecomposer {
    fn decompose(
        &self,
        raw: &[PathBuf],
        _north: &str,
        band: Waveband,
        output_dir: &Path,
    ) -> anyhow::Result<Vec<PathBuf>> {
        let keys: std::collections::BTreeSet<ObservationKey> = raw
            .iter()
            .filter_map(|p| p.file_stem()?.to_str()?.get(3..)?.parse().ok())
            .collect();
        let id = keys
            .iter()
            .next()
            .map(|k| k.observation_id().to_string())
            .unwrap_or_default();
        self.0.borrow_mut().decompose_calls.push(id.clone());
        if self.0.borrow().decompose_failures.contains(&id) {
            anyhow::bail!("calcqu failed for {}", id);
        }

        let mut created = Vec::new();
        for key in &keys {
            for sub in Subarray::ALL {
                for component in StokesComponent::CUBE_ORDER {
                    let path = output_dir.join(format!(
                        "s{}{}{}_{}.sdf",
                        band.digit(),
                        sub.letter(),
                        key,
                        component.series_suffix()
                    ));
                    touch(&path)?;
                    created.push(path);
                }
            }
        }
        Ok(created)
    }
}

pub struct MockSolver(pub Shared);

impl MapSolver for MockSolver {
    fn solve(&self, request: &SolveRequest<'_>) -> anyhow::Result<SolveReport> {
        let pointing = request.pointing.and_then(|p| std::fs::read_to_string(p).ok());
        let key = request.key.to_string();
        let mut world = self.0.borrow_mut();
        world.solver_calls.push(SolverCall {
            key: request.key,
            component: request.component,
            inputs: request.inputs.len(),
            threshold: request.config.get_f64("pca.pcathresh"),
            abort_soon: request.abort_soon,
            output: request.output.to_path_buf(),
            reference: request.reference.map(Path::to_path_buf),
            ast_mask: request.ast_mask.map(Path::to_path_buf),
            pca_mask: request.pca_mask.map(Path::to_path_buf),
            ip_reference: request.ip_reference.map(Path::to_path_buf),
            pointing,
        });
        if let Some((after, handle)) = &world.cancel_after {
            if world.solver_calls.len() >= *after {
                handle.cancel();
            }
        }
        let attempt = world.solver_calls.iter().filter(|c| c.key == request.key).count();
        let scripted_failure = world.solver_fail_on_attempt.get(&key) == Some(&attempt);
        if world.solver_failures.contains(&key) || scripted_failure {
            anyhow::bail!("makemap failed for {}", key);
        }

        touch(request.output)?;
        world.images.insert(request.output.to_path_buf(), test_map(1.0));
        let aborted_at = world
            .solver_script
            .get_mut(&key)
            .and_then(|script| script.pop_front())
            .unwrap_or(0);
        Ok(SolveReport { aborted_at })
    }
}

pub struct MockAligner(pub Shared);

impl AlignmentEngine for MockAligner {
    fn align(&self, _reference: &Path, _image: &MapImage) -> anyhow::Result<(f64, f64)> {
        let mut world = self.0.borrow_mut();
        world.align_calls += 1;
        Ok(world.shift)
    }
}

/// Labels every pixel at or above `noise` when the image peaks above
/// `min_height`
pub struct MockSegmenter(pub Shared);

impl SegmentationEngine for MockSegmenter {
    fn segment(
        &self,
        snr: &Array2<f64>,
        noise: f64,
        min_height: f64,
    ) -> anyhow::Result<Array2<u32>> {
        self.0.borrow_mut().segment_calls.push((noise, min_height));
        let peak = snr.iter().cloned().filter(|v| v.is_finite()).fold(f64::MIN, f64::max);
        Ok(snr.mapv(|v| u32::from(peak >= min_height && v.is_finite() && v >= noise)))
    }
}

pub struct MockMosaic(pub Shared);

impl MockMosaic {
    fn copy_image(&self, input: &Path, output: &Path) -> anyhow::Result<()> {
        let image = self
            .0
            .borrow()
            .images
            .get(input)
            .cloned()
            .unwrap_or_else(|| test_map(1.0));
        touch(output)?;
        self.0.borrow_mut().images.insert(output.to_path_buf(), image);
        Ok(())
    }
}

impl MosaicEngine for MockMosaic {
    fn mosaic(&self, request: &MosaicRequest<'_>) -> anyhow::Result<()> {
        self.0.borrow_mut().mosaic_calls.push(MosaicCall {
            channel: request.channel,
            inputs: request.inputs.len(),
            gen_var: request.gen_var,
            normalise: request.normalise,
            output: request.output.to_path_buf(),
        });
        if request.channel == MosaicChannel::Data {
            self.copy_image(&request.inputs[0], request.output)?;
        }
        Ok(())
    }

    fn copy(&self, input: &Path, output: &Path) -> anyhow::Result<()> {
        self.copy_image(input, output)
    }

    fn resample(&self, input: &Path, _grid: &Path, output: &Path) -> anyhow::Result<()> {
        self.copy_image(input, output)
    }

    fn make_grid(&self, template: &Path, bin_size: f64, output: &Path) -> anyhow::Result<()> {
        let mut grid = self
            .0
            .borrow()
            .images
            .get(template)
            .cloned()
            .unwrap_or_else(|| test_map(0.0));
        let (crpix, crval) = (grid.projection.crpix, grid.projection.crval);
        grid.projection = TanProjection::new(crpix, crval, bin_size);
        touch(output)?;
        self.0.borrow_mut().images.insert(output.to_path_buf(), grid);
        Ok(())
    }
}

pub struct MockTabulator(pub Shared);

impl TabulationEngine for MockTabulator {
    fn tabulate(&self, cube: &StokesCube, request: &TabulationRequest<'_>) -> anyhow::Result<()> {
        touch(request.catalogue)?;
        self.0
            .borrow_mut()
            .tabulated
            .push((request.catalogue.to_path_buf(), cube.planes.dim(), cube.units.clone()));
        Ok(())
    }
}

pub fn engines(world: &Shared) -> Engines {
    Engines {
        store: Box::new(MemoryStore(world.clone())),
        decomposer: Box::new(MockDecomposer(world.clone())),
        solver: Box::new(MockSolver(world.clone())),
        aligner: Box::new(MockAligner(world.clone())),
        segmenter: Box::new(MockSegmenter(world.clone())),
        mosaic: Box::new(MockMosaic(world.clone())),
        tabulator: Box::new(MockTabulator(world.clone())),
    }
}

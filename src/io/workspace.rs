//! Scratch directory owned by a single run.

use crate::types::PipelineResult;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Temporary working directory plus the list of transient files created in
/// it. Released exactly once: explicitly via [`Workspace::release`] or,
/// failing that, when dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    retain: bool,
    transient: Vec<PathBuf>,
}

impl Workspace {
    /// Create a fresh scratch directory under the system temp location
    pub fn acquire(retain: bool) -> PipelineResult<Self> {
        let dir = tempfile::Builder::new().prefix("polmosaic-").tempdir()?;
        let path = dir.path().to_path_buf();
        log::debug!("Acquired workspace {}", path.display());
        Ok(Self {
            dir: Some(dir),
            path,
            retain,
            transient: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of a named file inside the workspace
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Record a transient file so it is accounted for at release time
    pub fn register(&mut self, path: PathBuf) {
        self.transient.push(path);
    }

    pub fn transient_files(&self) -> &[PathBuf] {
        &self.transient
    }

    pub fn is_released(&self) -> bool {
        self.dir.is_none()
    }

    /// Remove (or keep, when retaining) the directory. Returns false if the
    /// workspace had already been released.
    pub fn release(&mut self) -> bool {
        let Some(dir) = self.dir.take() else {
            return false;
        };

        if self.retain {
            let kept = dir.into_path();
            log::info!(
                "Retaining workspace {} ({} transient files)",
                kept.display(),
                self.transient.len()
            );
        } else if let Err(e) = dir.close() {
            log::warn!("Failed to remove workspace {}: {}", self.path.display(), e);
        } else {
            log::debug!("Removed workspace {}", self.path.display());
        }
        true
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.release();
    }
}

/// Cooperative cancellation flag shared between a run and its caller
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

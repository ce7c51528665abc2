//! Plain-text list of maps created by a run, one path per line.

use crate::types::PipelineResult;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn write_manifest(path: &Path, maps: &[PathBuf]) -> PipelineResult<()> {
    let mut file = std::fs::File::create(path)?;
    for map in maps {
        writeln!(file, "{}", map.display())?;
    }
    log::info!("📝 Listed {} new maps in {}", maps.len(), path.display());
    Ok(())
}

pub fn read_manifest(path: &Path) -> PipelineResult<Vec<PathBuf>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(PathBuf::from)
        .collect())
}

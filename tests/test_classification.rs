mod common;

use common::*;
use polmosaic::io::classify::{group_raw, group_series};
use polmosaic::types::{ArtifactKind, MaskMode, PipelineError, StokesComponent, Waveband};
use polmosaic::{Classifier, Pipeline, RunConfig};
use std::path::PathBuf;
use tempfile::TempDir;

fn create(dir: &std::path::Path, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            std::fs::write(&path, b"").expect("Failed to create input");
            path
        })
        .collect()
}

#[test]
fn test_mixed_inputs_are_partitioned_and_grouped() {
    init_logging();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let mut inputs = raw_observation(temp_dir.path(), "20161102", 33, 2);
    inputs.extend(create(
        temp_dir.path(),
        &[
            "s8a20161102_00034_0001_QT.sdf",
            "s8a20161102_00034_0001_UT.sdf",
            "s8a20161102_00034_0001_IT.sdf",
            "20161101_00020_0001_ext_qmap.sdf",
            "notes.txt",
        ],
    ));
    // Duplicates are classified once
    inputs.push(inputs[0].clone());

    let classification = Classifier::new().unwrap().classify(&inputs).unwrap();
    println!(
        "📂 {} raw, {} series, {} maps, {} rejects",
        classification.raw.len(),
        classification.series.len(),
        classification.maps.len(),
        classification.rejects.len()
    );
    assert_eq!(classification.raw.len(), 8);
    assert_eq!(classification.series.len(), 3);
    assert_eq!(classification.maps.len(), 1);
    assert_eq!(classification.rejects, vec![temp_dir.path().join("notes.txt")]);
    assert!(classification.missing.is_empty());
    assert_eq!(classification.waveband().unwrap(), Some(Waveband::Band850));

    let map = &classification.maps[0];
    assert_eq!(map.kind, ArtifactKind::Map);
    assert_eq!(map.component, Some(StokesComponent::First));
    assert_eq!(map.mask_mode, Some(MaskMode::External));

    let observations = group_raw(&classification.raw);
    assert_eq!(observations.len(), 1);
    let (id, files) = observations.iter().next().unwrap();
    assert_eq!(id.to_string(), "20161102_00033");
    assert_eq!(files.len(), 8);

    let chunks = group_series(&classification.series);
    let (key, components) = chunks.iter().next().unwrap();
    assert_eq!(key.to_string(), "20161102_00034_0001");
    components.check_consistent(key, &StokesComponent::PROCESSING_ORDER).unwrap();
}

#[test]
fn test_gaps_in_raw_subscans_are_reported() {
    init_logging();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let inputs = create(
        temp_dir.path(),
        &[
            "s8a20161102_00033_0001.sdf",
            "s8a20161102_00033_0003.sdf",
            "s8b20161102_00033_0001.sdf",
            "s8b20161102_00033_0002.sdf",
            "s8b20161102_00033_0003.sdf",
        ],
    );

    let classification = Classifier::new().unwrap().classify(&inputs).unwrap();
    assert_eq!(classification.missing, vec!["s8a20161102_00033_0002.sdf".to_string()]);
}

#[test]
fn test_mixed_wavebands_abort_the_run() {
    init_logging();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let world = world();
    let inputs = create(
        temp_dir.path(),
        &["s8a20161102_00033_0001.sdf", "s4a20161102_00033_0001.sdf"],
    );
    let config = RunConfig {
        intensity_output: Some(temp_dir.path().join("imap.sdf")),
        ..Default::default()
    };

    let err = Pipeline::new(config, engines(&world)).run(&inputs).unwrap_err();
    assert!(matches!(err, PipelineError::Consistency(_)));
    assert!(world.borrow().decompose_calls.is_empty());
}

#[test]
fn test_chunk_without_requested_series_is_ignored() {
    init_logging();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let world = world();
    let mut inputs = raw_observation(temp_dir.path(), "20160412", 10, 1);
    inputs.extend(raw_observation(temp_dir.path(), "20160412", 11, 1));
    inputs.extend(create(
        temp_dir.path(),
        &["s8a20160412_00099_0001_QT.sdf", "s8a20160412_00099_0001_UT.sdf"],
    ));
    let config = RunConfig {
        intensity_output: Some(temp_dir.path().join("imap.sdf")),
        map_dir: Some(temp_dir.path().join("maps")),
        ..Default::default()
    };

    let report = Pipeline::new(config, engines(&world)).run(&inputs).expect("Run failed");

    // Q and U are not being made, so the chunk has nothing to offer
    assert_eq!(report.new_maps.len(), 2);
    assert!(report.skipped_chunks.is_empty());
    assert!(report.warnings.is_empty());
    let w = world.borrow();
    assert!(w.solver_calls.iter().all(|c| c.key.to_string() != "20160412_00099_0001"));
}

#[test]
fn test_incomplete_chunk_is_skipped() {
    init_logging();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let world = world();
    let mut inputs = raw_observation(temp_dir.path(), "20160412", 10, 1);
    inputs.extend(create(
        temp_dir.path(),
        &["s8a20160412_00099_0001_QT.sdf", "s8a20160412_00099_0001_IT.sdf"],
    ));
    let config = RunConfig {
        intensity_output: Some(temp_dir.path().join("imap.sdf")),
        first_output: Some(temp_dir.path().join("qmap.sdf")),
        second_output: Some(temp_dir.path().join("umap.sdf")),
        map_dir: Some(temp_dir.path().join("maps")),
        ip_correction: Some(false),
        ..Default::default()
    };

    let report = Pipeline::new(config, engines(&world)).run(&inputs).expect("Run failed");
    println!("⏭️  skipped {:?}", report.skipped_chunks);

    assert_eq!(report.skipped_chunks.len(), 1);
    assert_eq!(report.skipped_chunks[0].to_string(), "20160412_00099_0001");
    let warnings = report.warnings_for("20160412_00099_0001");
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("U (0)"));

    // The complete observation still yields all three maps
    assert_eq!(report.new_maps.len(), 3);
    assert_eq!(report.coadds.len(), 3);
    let w = world.borrow();
    assert_eq!(w.solver_calls.len(), 3);
    assert!(w.solver_calls.iter().all(|c| c.key.to_string() == "20160412_00010_0001"));
}

#[test]
fn test_unrecognised_inputs_become_run_warnings() {
    init_logging();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let world = world();
    let mut inputs = raw_observation(temp_dir.path(), "20161102", 35, 1);
    inputs.extend(create(temp_dir.path(), &["readme.md"]));
    let config = RunConfig {
        intensity_output: Some(temp_dir.path().join("imap.sdf")),
        map_dir: Some(temp_dir.path().join("maps")),
        series_dir: Some(temp_dir.path().join("series")),
        ..Default::default()
    };

    let report = Pipeline::new(config, engines(&world)).run(&inputs).unwrap();
    assert_eq!(report.run_warnings.len(), 1);
    assert!(report.run_warnings[0].contains("readme.md"));
    assert_eq!(report.new_maps.len(), 1);
}

#[test]
fn test_nonexistent_input_is_fatal() {
    init_logging();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let missing = temp_dir.path().join("s8a20161102_00033_0001.sdf");
    let err = Classifier::new().unwrap().classify(&[missing]).unwrap_err();
    assert!(matches!(err, PipelineError::Classification(_)));
}

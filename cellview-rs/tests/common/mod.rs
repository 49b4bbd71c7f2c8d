#![allow(dead_code)]

use cellview::config::RunConfig;
use cellview::model::{
    ExperimentInfo, FeatureRow, ImageId, ImageKeys, ImageRef, PlateId, PlateMetadata, WellId, WellMetadata,
};
use cellview::source::MemorySource;
use cellview::CellViewStore;
use ndarray::Array2;
use std::collections::BTreeMap;

pub const SIZE: usize = 40;
pub const BACKGROUND: f32 = 10.0;
pub const FOREGROUND: f32 = 1000.0;

/// Background plane with `objects` separated 4x4 bright squares, none on
/// the border.
pub fn plane_with_squares(objects: usize) -> Array2<f32> {
    let mut plane = Array2::from_elem((SIZE, SIZE), BACKGROUND);
    for i in 0..objects {
        let (r, c) = (1 + 6 * (i / 6), 1 + 6 * (i % 6));
        for y in r..r + 4 {
            for x in c..c + 4 {
                plane[[y, x]] = FOREGROUND;
            }
        }
    }
    plane
}

pub fn experiment() -> ExperimentInfo {
    ExperimentInfo {
        name: "screen-2024".into(),
        owner: "hts".into(),
    }
}

pub fn well(id: WellId, row: u32, column: u32) -> WellMetadata {
    WellMetadata {
        id,
        row,
        column,
        conditions: BTreeMap::from([("cell_line".to_string(), "RPE1".to_string())]),
    }
}

pub fn plate(id: PlateId, wells: Vec<WellMetadata>) -> PlateMetadata {
    PlateMetadata {
        id,
        name: format!("plate-{id}"),
        experiment: experiment(),
        rows: 8,
        columns: 12,
        channels: vec!["DAPI".into(), "Tub".into()],
        wells,
    }
}

/// DAPI carries the objects; Tub is DAPI scaled by two.
pub fn add_image(source: &mut MemorySource, id: ImageId, well_id: WellId, objects: usize) -> ImageRef {
    let dapi = plane_with_squares(objects);
    let tub = dapi.mapv(|v| v * 2.0);
    source.add_image(id, well_id, vec![("DAPI", dapi), ("Tub", tub)])
}

/// A well image whose segmentation fails on a non-finite pixel.
pub fn add_broken_image(source: &mut MemorySource, id: ImageId, well_id: WellId) -> ImageRef {
    let mut dapi = plane_with_squares(2);
    dapi[[20, 20]] = f32::NAN;
    let tub = plane_with_squares(2);
    source.add_image(id, well_id, vec![("DAPI", dapi), ("Tub", tub)])
}

/// Plate 1: well A1 (11) with images 101 (5 objects) and 102 (3 objects),
/// well A2 (12) with image 201 (segmentation fails) and 202 (empty).
pub fn screening_plate() -> MemorySource {
    let mut source = MemorySource::new();
    source.add_plate(plate(1, vec![well(11, 0, 0), well(12, 0, 1)]));
    add_image(&mut source, 101, 11, 5);
    add_image(&mut source, 102, 11, 3);
    add_broken_image(&mut source, 201, 12);
    add_image(&mut source, 202, 12, 0);
    source
}

/// Defaults with no waiting between retries.
pub fn test_config() -> RunConfig {
    let mut config = RunConfig::default();
    config.workers = 2;
    config.source.backoff_ms = 0;
    config.storage.backoff_ms = 0;
    config
}

/// Store with plate 1 / well 11 / images 101 and 102 registered.
pub fn seeded_store(store: &CellViewStore) -> (ImageKeys, ImageKeys) {
    let experiment_id = store.ensure_experiment(&experiment()).unwrap();
    let plate = plate(1, vec![well(11, 0, 0)]);
    store.ensure_plate(experiment_id, &plate).unwrap();
    store.ensure_well(1, &plate.wells[0]).unwrap();
    for id in [101, 102] {
        store
            .register_image(&ImageRef {
                id,
                well_id: 11,
                name: format!("image{id}"),
                channels: vec!["DAPI".into()],
                size_y: SIZE,
                size_x: SIZE,
                size_z: 1,
            })
            .unwrap();
    }
    let keys = |image_id| ImageKeys {
        experiment_id,
        plate_id: 1,
        well_id: 11,
        image_id,
    };
    (keys(101), keys(102))
}

/// `n` rows whose area is `base + object_index`.
pub fn rows(keys: ImageKeys, n: u32, base: f64) -> Vec<FeatureRow> {
    (0..n)
        .map(|i| FeatureRow {
            keys,
            object_index: i,
            label: i + 1,
            on_border: false,
            qc_flags: vec![],
            features: BTreeMap::from([
                ("area".to_string(), base + i as f64),
                ("intensity_mean_DAPI".to_string(), 100.0 * (i + 1) as f64),
            ]),
        })
        .collect()
}

//! Well and plate summaries, reduced from feature rows on every call.
//!
//! Wells whose images were processed but yielded no objects still get an
//! aggregate, with zero objects and no feature summaries.

use rusqlite::{params, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::connection::with_snapshot;
use super::query::{query_in, FeatureTable, QueryFilter};
use super::CellViewStore;
use crate::error::StorageError;
use crate::model::{FeatureRow, ImageId, PlateId, WellId};

/// Statistics over the finite values of one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl FeatureSummary {
    fn from_values(mut values: Vec<f64>) -> Option<Self> {
        values.retain(|v| v.is_finite());
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let n = values.len();
        let mean = values.iter().sum::<f64>() / n as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        let median = if n % 2 == 1 {
            values[n / 2]
        } else {
            (values[n / 2 - 1] + values[n / 2]) / 2.0
        };
        Some(Self {
            count: n,
            mean,
            median,
            std: var.sqrt(),
            min: values[0],
            max: values[n - 1],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellAggregate {
    pub well_id: WellId,
    pub plate_id: PlateId,
    pub well: String,
    /// Images that finished processing, with or without objects.
    pub processed_images: usize,
    /// Images contributing at least one row.
    pub images: usize,
    /// Unflagged objects; only these enter `features`.
    pub objects: usize,
    pub flagged: usize,
    pub features: BTreeMap<String, FeatureSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateAggregate {
    pub plate_id: PlateId,
    pub wells: usize,
    pub processed_images: usize,
    pub images: usize,
    pub objects: usize,
    pub flagged: usize,
    pub features: BTreeMap<String, FeatureSummary>,
}

/// Processed images of one well, read from the image states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellProgress {
    pub well_id: WellId,
    pub plate_id: PlateId,
    pub well: String,
    pub processed: BTreeSet<ImageId>,
}

struct Tally<'a> {
    processed: BTreeSet<ImageId>,
    images: BTreeSet<ImageId>,
    objects: usize,
    flagged: usize,
    values: BTreeMap<&'a str, Vec<f64>>,
}

impl<'a> Tally<'a> {
    fn new() -> Self {
        Self {
            processed: BTreeSet::new(),
            images: BTreeSet::new(),
            objects: 0,
            flagged: 0,
            values: BTreeMap::new(),
        }
    }

    fn add(&mut self, row: &'a FeatureRow) {
        self.processed.insert(row.keys.image_id);
        self.images.insert(row.keys.image_id);
        if row.is_flagged() {
            self.flagged += 1;
            return;
        }
        self.objects += 1;
        for (name, &value) in &row.features {
            self.values.entry(name.as_str()).or_default().push(value);
        }
    }

    fn summaries(self) -> BTreeMap<String, FeatureSummary> {
        self.values
            .into_iter()
            .filter_map(|(name, values)| FeatureSummary::from_values(values).map(|s| (name.to_string(), s)))
            .collect()
    }
}

/// Reduce a table to one aggregate per well, in well-id order. Wells in
/// `progress` appear even when they have no rows.
pub fn reduce_wells(table: &FeatureTable, progress: &[WellProgress]) -> Vec<WellAggregate> {
    let mut tallies: BTreeMap<WellId, (PlateId, String, Tally<'_>)> = BTreeMap::new();
    for p in progress {
        let (_, _, tally) = tallies
            .entry(p.well_id)
            .or_insert_with(|| (p.plate_id, p.well.clone(), Tally::new()));
        tally.processed.extend(p.processed.iter().copied());
    }
    for row in &table.rows {
        tallies
            .entry(row.keys.well_id)
            .or_insert_with(|| {
                let name = table.wells.get(&row.keys.well_id).map(|w| w.name.clone()).unwrap_or_default();
                (row.keys.plate_id, name, Tally::new())
            })
            .2
            .add(row);
    }
    tallies
        .into_iter()
        .map(|(well_id, (plate_id, well, tally))| WellAggregate {
            well_id,
            plate_id,
            well,
            processed_images: tally.processed.len(),
            images: tally.images.len(),
            objects: tally.objects,
            flagged: tally.flagged,
            features: tally.summaries(),
        })
        .collect()
}

/// Reduce every row of `plate_id` in the table, pooled across wells.
pub fn reduce_plate(table: &FeatureTable, plate_id: PlateId, progress: &[WellProgress]) -> PlateAggregate {
    let mut tally = Tally::new();
    let mut wells = BTreeSet::new();
    for p in progress.iter().filter(|p| p.plate_id == plate_id && !p.processed.is_empty()) {
        wells.insert(p.well_id);
        tally.processed.extend(p.processed.iter().copied());
    }
    for row in table.rows.iter().filter(|r| r.keys.plate_id == plate_id) {
        wells.insert(row.keys.well_id);
        tally.add(row);
    }
    PlateAggregate {
        plate_id,
        wells: wells.len(),
        processed_images: tally.processed.len(),
        images: tally.images.len(),
        objects: tally.objects,
        flagged: tally.flagged,
        features: tally.summaries(),
    }
}

fn well_progress_in(tx: &Transaction<'_>, plate_id: PlateId) -> Result<Vec<WellProgress>, StorageError> {
    let mut stmt = tx.prepare(
        "SELECT w.id, w.plate_id, w.name, i.id FROM wells w
         JOIN images i ON i.well_id = w.id AND i.status = 'succeeded'
         WHERE w.plate_id = ?1
         ORDER BY w.id, i.id",
    )?;
    let mapped = stmt.query_map(params![plate_id], |row| {
        Ok((
            row.get::<_, WellId>(0)?,
            row.get::<_, PlateId>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, ImageId>(3)?,
        ))
    })?;
    let mut progress: Vec<WellProgress> = Vec::new();
    for item in mapped {
        let (well_id, plate_id, well, image_id) = item?;
        match progress.last_mut() {
            Some(last) if last.well_id == well_id => {
                last.processed.insert(image_id);
            }
            _ => progress.push(WellProgress {
                well_id,
                plate_id,
                well,
                processed: BTreeSet::from([image_id]),
            }),
        }
    }
    Ok(progress)
}

impl CellViewStore {
    /// Wells of a plate with at least one successfully processed image.
    pub fn well_progress(&self, plate_id: PlateId) -> Result<Vec<WellProgress>, StorageError> {
        self.conns
            .with_reader(|conn| with_snapshot(conn, |tx| well_progress_in(tx, plate_id)))
    }

    /// Rows and image states from one snapshot.
    fn aggregate_inputs(&self, plate_id: PlateId) -> Result<(FeatureTable, Vec<WellProgress>), StorageError> {
        self.conns.with_reader(|conn| {
            with_snapshot(conn, |tx| {
                let table = query_in(tx, &QueryFilter::plate(plate_id))?;
                let progress = well_progress_in(tx, plate_id)?;
                Ok((table, progress))
            })
        })
    }

    pub fn well_aggregates(&self, plate_id: PlateId) -> Result<Vec<WellAggregate>, StorageError> {
        let (table, progress) = self.aggregate_inputs(plate_id)?;
        Ok(reduce_wells(&table, &progress))
    }

    pub fn plate_aggregates(&self, plate_id: PlateId) -> Result<PlateAggregate, StorageError> {
        let (table, progress) = self.aggregate_inputs(plate_id)?;
        Ok(reduce_plate(&table, plate_id, &progress))
    }
}

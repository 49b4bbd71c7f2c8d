//! CellView: the local SQLite store of screening results.
//!
//! Experiments own plates own wells own images; feature rows belong to
//! their image and are only ever replaced as a whole image at a time.
//! Aggregates are computed from the rows on every request.

mod aggregates;
mod connection;
mod export;
pub mod migrations;
mod query;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use crate::error::StorageError;
use crate::model::{
    ExperimentId, ExperimentInfo, FeatureRow, ImageId, ImageRef, PlateId, PlateMetadata, WellId, WellMetadata,
};
use crate::quality::ChannelQuality;
use connection::{with_immediate_transaction, with_snapshot, Connections, DEFAULT_READERS, DEFAULT_WRITERS};

pub use aggregates::{reduce_plate, reduce_wells, FeatureSummary, PlateAggregate, WellAggregate, WellProgress};
pub use query::{FeatureRange, FeatureTable, QueryFilter, WellInfo};

/// Persisted processing state of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredStatus {
    /// Known to the store, no committed result.
    Registered,
    /// Rows committed by a successful run (possibly zero rows).
    Succeeded,
}

impl StoredStatus {
    fn as_str(self) -> &'static str {
        match self {
            StoredStatus::Registered => "registered",
            StoredStatus::Succeeded => "succeeded",
        }
    }

    fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "registered" => Ok(StoredStatus::Registered),
            "succeeded" => Ok(StoredStatus::Succeeded),
            other => Err(StorageError::InvalidRow(format!("unknown image status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageState {
    pub image_id: ImageId,
    pub well_id: WellId,
    pub status: StoredStatus,
    pub model_tag: Option<String>,
    pub object_count: Option<u32>,
    /// Image-level flags such as `no_objects`.
    pub qc_flags: Vec<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Everything written for one processed image, in one transaction.
#[derive(Debug, Clone, Copy)]
pub struct ImageCommit<'a> {
    pub image_id: ImageId,
    pub rows: &'a [FeatureRow],
    /// Left unchanged when `None`.
    pub model_tag: Option<&'a str>,
    pub quality: Option<&'a [ChannelQuality]>,
    pub image_flags: Option<&'a [String]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Assigned by the store.
    pub id: Option<i64>,
    pub plate_id: PlateId,
    pub model_tag: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_rows: usize,
    pub cancelled: bool,
    pub summary: serde_json::Value,
}

pub(crate) fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidRow(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StorageError> {
    serde_json::to_string(value).map_err(|e| StorageError::InvalidRow(e.to_string()))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, StorageError> {
    serde_json::from_str(text).map_err(|e| StorageError::InvalidRow(e.to_string()))
}

struct RawImageState {
    image_id: ImageId,
    well_id: WellId,
    status: String,
    model_tag: Option<String>,
    object_count: Option<u32>,
    qc_flags: String,
    processed_at: Option<String>,
}

const IMAGE_STATE_COLUMNS: &str =
    "i.id, i.well_id, i.status, i.model_tag, i.object_count, i.qc_flags, i.processed_at";

fn raw_image_state(row: &Row<'_>) -> rusqlite::Result<RawImageState> {
    Ok(RawImageState {
        image_id: row.get(0)?,
        well_id: row.get(1)?,
        status: row.get(2)?,
        model_tag: row.get(3)?,
        object_count: row.get(4)?,
        qc_flags: row.get(5)?,
        processed_at: row.get(6)?,
    })
}

impl RawImageState {
    fn parse(self) -> Result<ImageState, StorageError> {
        Ok(ImageState {
            image_id: self.image_id,
            well_id: self.well_id,
            status: StoredStatus::parse(&self.status)?,
            model_tag: self.model_tag,
            object_count: self.object_count,
            qc_flags: from_json(&self.qc_flags)?,
            processed_at: self.processed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

pub struct CellViewStore {
    conns: Connections,
    image_locks: Mutex<HashMap<ImageId, Weak<Mutex<()>>>>,
    path: Option<PathBuf>,
}

impl CellViewStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conns = Connections::open(path, DEFAULT_WRITERS, DEFAULT_READERS, migrations::run_migrations)?;
        tracing::info!(path = %path.display(), "opened cellview store");
        Ok(Self {
            conns,
            image_locks: Mutex::new(HashMap::new()),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            conns: Connections::open_in_memory(migrations::run_migrations)?,
            image_locks: Mutex::new(HashMap::new()),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema_version(&self) -> Result<u32, StorageError> {
        self.conns.with_reader(migrations::current_version)
    }

    /// Serializes writers of one image. Writers of different images get
    /// different locks.
    fn image_lock(&self, image_id: ImageId) -> Result<Arc<Mutex<()>>, StorageError> {
        let mut locks = self.image_locks.lock().map_err(|_| StorageError::Sqlite {
            message: "image lock table poisoned".to_string(),
        })?;
        if let Some(lock) = locks.get(&image_id).and_then(Weak::upgrade) {
            return Ok(lock);
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(image_id, Arc::downgrade(&lock));
        Ok(lock)
    }

    pub fn ensure_experiment(&self, info: &ExperimentInfo) -> Result<ExperimentId, StorageError> {
        if info.name.trim().is_empty() {
            return Err(StorageError::InvalidRow("experiment name is empty".into()));
        }
        self.conns.with_writer(|conn| {
            with_immediate_transaction(conn, |tx| {
                tx.execute(
                    "INSERT INTO experiments (name, owner, created_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(name) DO NOTHING",
                    params![info.name, info.owner, timestamp(Utc::now())],
                )?;
                Ok(tx.query_row(
                    "SELECT id FROM experiments WHERE name = ?1",
                    params![info.name],
                    |row| row.get(0),
                )?)
            })
        })
    }

    /// Create the plate or refresh its name and geometry. A plate never
    /// moves between experiments.
    pub fn ensure_plate(&self, experiment_id: ExperimentId, plate: &PlateMetadata) -> Result<(), StorageError> {
        self.conns.with_writer(|conn| {
            with_immediate_transaction(conn, |tx| {
                let owner: Option<ExperimentId> = tx
                    .query_row(
                        "SELECT experiment_id FROM plates WHERE id = ?1",
                        params![plate.id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(owner) = owner {
                    if owner != experiment_id {
                        return Err(StorageError::InvalidRow(format!(
                            "plate {} belongs to experiment {}, not {}",
                            plate.id, owner, experiment_id
                        )));
                    }
                }
                tx.execute(
                    "INSERT INTO plates (id, experiment_id, name, grid_rows, grid_cols, channels, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO UPDATE SET
                        name = excluded.name,
                        grid_rows = excluded.grid_rows,
                        grid_cols = excluded.grid_cols,
                        channels = excluded.channels",
                    params![
                        plate.id,
                        experiment_id,
                        plate.name,
                        plate.rows,
                        plate.columns,
                        to_json(&plate.channels)?,
                        timestamp(Utc::now()),
                    ],
                )?;
                Ok(())
            })
        })
    }

    pub fn ensure_well(&self, plate_id: PlateId, well: &WellMetadata) -> Result<(), StorageError> {
        self.conns.with_writer(|conn| {
            with_immediate_transaction(conn, |tx| {
                tx.execute(
                    "INSERT INTO wells (id, plate_id, well_row, well_col, name, conditions)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET conditions = excluded.conditions",
                    params![
                        well.id,
                        plate_id,
                        well.row,
                        well.column,
                        well.name(),
                        to_json(&well.conditions)?
                    ],
                )?;
                Ok(())
            })
        })
    }

    /// Record an image. Already-known images keep their state.
    pub fn register_image(&self, image: &ImageRef) -> Result<(), StorageError> {
        self.register_images(std::slice::from_ref(image))
    }

    pub fn register_images(&self, images: &[ImageRef]) -> Result<(), StorageError> {
        self.conns.with_writer(|conn| {
            with_immediate_transaction(conn, |tx| {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO images (id, well_id, name, channels, size_y, size_x, size_z)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(id) DO NOTHING",
                )?;
                for image in images {
                    stmt.execute(params![
                        image.id,
                        image.well_id,
                        image.name,
                        to_json(&image.channels)?,
                        image.size_y as i64,
                        image.size_x as i64,
                        image.size_z as i64,
                    ])?;
                }
                Ok(())
            })
        })
    }

    pub fn image_state(&self, image_id: ImageId) -> Result<Option<ImageState>, StorageError> {
        let raw = self.conns.with_reader(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {IMAGE_STATE_COLUMNS} FROM images i WHERE i.id = ?1"),
                    params![image_id],
                    raw_image_state,
                )
                .optional()?)
        })?;
        raw.map(RawImageState::parse).transpose()
    }

    /// State of every registered image on a plate.
    pub fn image_states(&self, plate_id: PlateId) -> Result<BTreeMap<ImageId, ImageState>, StorageError> {
        let raws = self.conns.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {IMAGE_STATE_COLUMNS} FROM images i
                 JOIN wells w ON w.id = i.well_id
                 WHERE w.plate_id = ?1
                 ORDER BY i.id"
            ))?;
            let rows = stmt.query_map(params![plate_id], raw_image_state)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;
        raws.into_iter()
            .map(|raw| raw.parse().map(|state| (state.image_id, state)))
            .collect()
    }

    /// Per-channel quality recorded for an image.
    pub fn image_quality(&self, image_id: ImageId) -> Result<Vec<ChannelQuality>, StorageError> {
        self.conns.with_reader(|conn| {
            with_snapshot(conn, |tx| {
                let mut stmt = tx.prepare_cached(
                    "SELECT channel, intensity_median, saturated_fraction
                     FROM image_quality WHERE image_id = ?1 ORDER BY channel",
                )?;
                let rows = stmt.query_map(params![image_id], |row| {
                    Ok(ChannelQuality {
                        channel: row.get(0)?,
                        intensity_median: row.get::<_, Option<f64>>(1)?.unwrap_or(f64::NAN),
                        saturated_fraction: row.get(2)?,
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
        })
    }

    /// Atomically replace every feature row of `image_id` and mark it
    /// succeeded.
    pub fn upsert_rows(&self, image_id: ImageId, rows: &[FeatureRow]) -> Result<(), StorageError> {
        self.commit_image(&ImageCommit {
            image_id,
            rows,
            model_tag: None,
            quality: None,
            image_flags: None,
        })
    }

    /// Replace an image's rows, quality record and state in one
    /// transaction. Writers of the same image are serialized.
    pub fn commit_image(&self, commit: &ImageCommit<'_>) -> Result<(), StorageError> {
        let image_id = commit.image_id;
        let mut seen = HashSet::with_capacity(commit.rows.len());
        for row in commit.rows {
            if row.keys.image_id != image_id {
                return Err(StorageError::InvalidRow(format!(
                    "row for image {} passed to image {}",
                    row.keys.image_id, image_id
                )));
            }
            if !seen.insert(row.object_index) {
                return Err(StorageError::InvalidRow(format!(
                    "duplicate object_index {} for image {}",
                    row.object_index, image_id
                )));
            }
        }

        let lock = self.image_lock(image_id)?;
        let _guard = lock.lock().map_err(|_| StorageError::Sqlite {
            message: format!("image {image_id} lock poisoned"),
        })?;
        self.conns
            .with_writer(|conn| with_immediate_transaction(conn, |tx| write_image(tx, commit)))?;
        tracing::debug!(image_id, rows = commit.rows.len(), "committed image");
        Ok(())
    }

    /// Delete a plate with its wells, images, rows and run history.
    pub fn delete_plate(&self, plate_id: PlateId) -> Result<bool, StorageError> {
        let deleted = self.conns.with_writer(|conn| {
            with_immediate_transaction(conn, |tx| {
                tx.execute("DELETE FROM runs WHERE plate_id = ?1", params![plate_id])?;
                Ok(tx.execute("DELETE FROM plates WHERE id = ?1", params![plate_id])? > 0)
            })
        })?;
        tracing::info!(plate_id, deleted, "delete plate");
        Ok(deleted)
    }

    /// Administrative removal of an experiment and everything under it.
    pub fn delete_experiment(&self, experiment_id: ExperimentId) -> Result<bool, StorageError> {
        let deleted = self.conns.with_writer(|conn| {
            with_immediate_transaction(conn, |tx| {
                tx.execute(
                    "DELETE FROM runs WHERE plate_id IN (SELECT id FROM plates WHERE experiment_id = ?1)",
                    params![experiment_id],
                )?;
                Ok(tx.execute("DELETE FROM experiments WHERE id = ?1", params![experiment_id])? > 0)
            })
        })?;
        tracing::info!(experiment_id, deleted, "delete experiment");
        Ok(deleted)
    }

    pub fn experiment_id(&self, name: &str) -> Result<Option<ExperimentId>, StorageError> {
        self.conns.with_reader(|conn| {
            Ok(conn
                .query_row("SELECT id FROM experiments WHERE name = ?1", params![name], |row| row.get(0))
                .optional()?)
        })
    }

    pub fn record_run(&self, run: &RunRecord) -> Result<i64, StorageError> {
        self.conns.with_writer(|conn| {
            with_immediate_transaction(conn, |tx| {
                tx.execute(
                    "INSERT INTO runs (plate_id, model_tag, started_at, finished_at, succeeded, failed,
                                       skipped, total_rows, cancelled, summary)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        run.plate_id,
                        run.model_tag,
                        timestamp(run.started_at),
                        timestamp(run.finished_at),
                        run.succeeded as i64,
                        run.failed as i64,
                        run.skipped as i64,
                        run.total_rows as i64,
                        run.cancelled,
                        to_json(&run.summary)?,
                    ],
                )?;
                Ok(tx.last_insert_rowid())
            })
        })
    }

    /// Runs recorded for a plate, oldest first.
    pub fn runs(&self, plate_id: PlateId) -> Result<Vec<RunRecord>, StorageError> {
        type RawRun = (i64, PlateId, String, String, String, i64, i64, i64, i64, bool, String);
        let raws: Vec<RawRun> = self.conns.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id, plate_id, model_tag, started_at, finished_at, succeeded, failed,
                        skipped, total_rows, cancelled, summary
                 FROM runs WHERE plate_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![plate_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                    row.get(10)?,
                ))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;
        raws.into_iter()
            .map(|(id, plate_id, model_tag, started, finished, ok, failed, skipped, rows, cancelled, summary)| {
                Ok(RunRecord {
                    id: Some(id),
                    plate_id,
                    model_tag,
                    started_at: parse_timestamp(&started)?,
                    finished_at: parse_timestamp(&finished)?,
                    succeeded: ok as usize,
                    failed: failed as usize,
                    skipped: skipped as usize,
                    total_rows: rows as usize,
                    cancelled,
                    summary: from_json(&summary)?,
                })
            })
            .collect()
    }
}

fn write_image(tx: &Transaction<'_>, commit: &ImageCommit<'_>) -> Result<(), StorageError> {
    let image_id = commit.image_id;
    let owner: Option<(WellId, PlateId, ExperimentId)> = tx
        .query_row(
            "SELECT w.id, w.plate_id, p.experiment_id
             FROM images i
             JOIN wells w ON w.id = i.well_id
             JOIN plates p ON p.id = w.plate_id
             WHERE i.id = ?1",
            params![image_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let (well_id, plate_id, experiment_id) = owner.ok_or(StorageError::UnknownImage(image_id))?;
    for row in commit.rows {
        let k = &row.keys;
        if (k.well_id, k.plate_id, k.experiment_id) != (well_id, plate_id, experiment_id) {
            return Err(StorageError::InvalidRow(format!(
                "row keys {:?} do not match image {} (well {}, plate {}, experiment {})",
                k, image_id, well_id, plate_id, experiment_id
            )));
        }
    }

    // Cascades to feature_values.
    tx.execute("DELETE FROM feature_rows WHERE image_id = ?1", params![image_id])?;
    {
        let mut insert_row = tx.prepare_cached(
            "INSERT INTO feature_rows (image_id, object_index, experiment_id, plate_id, well_id,
                                       label, on_border, qc_flags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        let mut insert_value = tx.prepare_cached(
            "INSERT INTO feature_values (image_id, object_index, feature, value) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for row in commit.rows {
            insert_row.execute(params![
                image_id,
                row.object_index,
                experiment_id,
                plate_id,
                well_id,
                row.label,
                row.on_border,
                to_json(&row.qc_flags)?,
            ])?;
            for (feature, &value) in &row.features {
                let value = if value.is_nan() { None } else { Some(value) };
                insert_value.execute(params![image_id, row.object_index, feature, value])?;
            }
        }
    }

    if let Some(quality) = commit.quality {
        tx.execute("DELETE FROM image_quality WHERE image_id = ?1", params![image_id])?;
        let mut stmt = tx.prepare_cached(
            "INSERT INTO image_quality (image_id, channel, intensity_median, saturated_fraction)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for q in quality {
            let median = if q.intensity_median.is_nan() { None } else { Some(q.intensity_median) };
            stmt.execute(params![image_id, q.channel, median, q.saturated_fraction])?;
        }
    }

    let flags = commit.image_flags.map(|f| to_json(f)).transpose()?;
    tx.execute(
        "UPDATE images SET
            status = ?2,
            object_count = ?3,
            model_tag = COALESCE(?4, model_tag),
            qc_flags = COALESCE(?5, qc_flags),
            processed_at = ?6
         WHERE id = ?1",
        params![
            image_id,
            StoredStatus::Succeeded.as_str(),
            commit.rows.len() as i64,
            commit.model_tag,
            flags,
            timestamp(Utc::now()),
        ],
    )?;
    Ok(())
}

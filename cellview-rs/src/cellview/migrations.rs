//! Schema migrations keyed on `PRAGMA user_version`.

use rusqlite::Connection;

use crate::error::StorageError;

/// V001: screening hierarchy, per-image state, long-format feature values, runs.
const V001_INITIAL: &str = r#"
CREATE TABLE IF NOT EXISTS experiments (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    owner TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
) STRICT;

-- Plate, well and image ids are the image source's ids.
CREATE TABLE IF NOT EXISTS plates (
    id INTEGER PRIMARY KEY,
    experiment_id INTEGER NOT NULL REFERENCES experiments(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    grid_rows INTEGER NOT NULL,
    grid_cols INTEGER NOT NULL,
    channels TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
) STRICT;

CREATE INDEX IF NOT EXISTS idx_plates_experiment ON plates(experiment_id);

CREATE TABLE IF NOT EXISTS wells (
    id INTEGER PRIMARY KEY,
    plate_id INTEGER NOT NULL REFERENCES plates(id) ON DELETE CASCADE,
    well_row INTEGER NOT NULL,
    well_col INTEGER NOT NULL,
    name TEXT NOT NULL,
    conditions TEXT NOT NULL DEFAULT '{}',
    UNIQUE(plate_id, well_row, well_col)
) STRICT;

CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY,
    well_id INTEGER NOT NULL REFERENCES wells(id) ON DELETE CASCADE,
    name TEXT NOT NULL DEFAULT '',
    channels TEXT NOT NULL DEFAULT '[]',
    size_y INTEGER NOT NULL,
    size_x INTEGER NOT NULL,
    size_z INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'registered'
        CHECK (status IN ('registered', 'succeeded')),
    model_tag TEXT,
    object_count INTEGER,
    qc_flags TEXT NOT NULL DEFAULT '[]',
    processed_at TEXT
) STRICT;

CREATE INDEX IF NOT EXISTS idx_images_well ON images(well_id);

CREATE TABLE IF NOT EXISTS image_quality (
    image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
    channel TEXT NOT NULL,
    intensity_median REAL NOT NULL,
    saturated_fraction REAL NOT NULL,
    PRIMARY KEY (image_id, channel)
) STRICT;

-- One row per object. Keys are denormalised for filtering without joins.
CREATE TABLE IF NOT EXISTS feature_rows (
    image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
    object_index INTEGER NOT NULL,
    experiment_id INTEGER NOT NULL,
    plate_id INTEGER NOT NULL,
    well_id INTEGER NOT NULL,
    label INTEGER NOT NULL,
    on_border INTEGER NOT NULL,
    qc_flags TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (image_id, object_index)
) STRICT;

CREATE INDEX IF NOT EXISTS idx_feature_rows_plate ON feature_rows(plate_id, well_id);
CREATE INDEX IF NOT EXISTS idx_feature_rows_experiment ON feature_rows(experiment_id);

-- NULL value = NaN.
CREATE TABLE IF NOT EXISTS feature_values (
    image_id INTEGER NOT NULL,
    object_index INTEGER NOT NULL,
    feature TEXT NOT NULL,
    value REAL,
    PRIMARY KEY (image_id, object_index, feature),
    FOREIGN KEY (image_id, object_index)
        REFERENCES feature_rows(image_id, object_index) ON DELETE CASCADE
) STRICT, WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    plate_id INTEGER NOT NULL,
    model_tag TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    succeeded INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    skipped INTEGER NOT NULL,
    total_rows INTEGER NOT NULL,
    cancelled INTEGER NOT NULL,
    summary TEXT NOT NULL
) STRICT;

CREATE INDEX IF NOT EXISTS idx_runs_plate ON runs(plate_id);
"#;

/// V002: `image_quality.intensity_median` becomes nullable; NULL = NaN for
/// channels without a finite pixel.
const V002_NULLABLE_MEDIAN: &str = r#"
CREATE TABLE image_quality_v2 (
    image_id INTEGER NOT NULL REFERENCES images(id) ON DELETE CASCADE,
    channel TEXT NOT NULL,
    intensity_median REAL,
    saturated_fraction REAL NOT NULL,
    PRIMARY KEY (image_id, channel)
) STRICT;

INSERT INTO image_quality_v2 (image_id, channel, intensity_median, saturated_fraction)
    SELECT image_id, channel, intensity_median, saturated_fraction FROM image_quality;

DROP TABLE image_quality;
ALTER TABLE image_quality_v2 RENAME TO image_quality;
"#;

const MIGRATIONS: &[(&str, u32)] = &[(V001_INITIAL, 1), (V002_NULLABLE_MEDIAN, 2)];

pub const LATEST_VERSION: u32 = 2;

pub fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    let current = current_version(conn).map_err(|e| StorageError::MigrationFailed {
        version: 0,
        message: e.to_string(),
    })?;
    if current > LATEST_VERSION {
        return Err(StorageError::MigrationFailed {
            version: current,
            message: format!("database schema v{current} is newer than this build (v{LATEST_VERSION})"),
        });
    }

    for &(sql, version) in MIGRATIONS {
        if current >= version {
            continue;
        }
        let fail = |e: rusqlite::Error| StorageError::MigrationFailed {
            version,
            message: e.to_string(),
        };
        // Schema change and version bump commit together.
        let tx = conn.unchecked_transaction().map_err(fail)?;
        tx.execute_batch(sql).map_err(fail)?;
        tx.pragma_update(None, "user_version", version).map_err(fail)?;
        tx.commit().map_err(fail)?;
        tracing::info!(version, "applied migration");
    }
    Ok(())
}

pub fn current_version(conn: &Connection) -> Result<u32, StorageError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

//! Read side: filtered feature tables for plotting and aggregation.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::connection::with_snapshot;
use super::{from_json, CellViewStore};
use crate::error::StorageError;
use crate::model::{ExperimentId, FeatureRow, ImageId, ImageKeys, PlateId, WellId};

/// Inclusive bounds on one feature column. Rows where the feature is
/// missing or NaN never match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRange {
    pub feature: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl FeatureRange {
    fn matches(&self, row: &FeatureRow) -> bool {
        match row.features.get(&self.feature) {
            Some(&v) if !v.is_nan() => {
                self.min.map_or(true, |min| v >= min) && self.max.map_or(true, |max| v <= max)
            }
            _ => false,
        }
    }
}

/// Every field narrows the result; the default selects all rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilter {
    pub experiment_id: Option<ExperimentId>,
    pub plate_id: Option<PlateId>,
    pub well_ids: Vec<WellId>,
    pub image_ids: Vec<ImageId>,
    /// Columns to return; empty means all.
    pub features: Vec<String>,
    pub ranges: Vec<FeatureRange>,
    /// Drop rows tagged by the quality gate.
    pub exclude_flagged: bool,
}

impl QueryFilter {
    pub fn plate(plate_id: PlateId) -> Self {
        Self {
            plate_id: Some(plate_id),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellInfo {
    pub plate_id: PlateId,
    pub name: String,
    pub conditions: BTreeMap<String, String>,
}

/// Query result: rows in (plate, well, image, object_index) order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    /// Sorted feature column names present in `rows`.
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
    pub wells: BTreeMap<WellId, WellInfo>,
}

impl FeatureTable {
    /// One column; `None` where a row lacks the feature.
    pub fn column(&self, feature: &str) -> Vec<Option<f64>> {
        self.rows.iter().map(|r| r.features.get(feature).copied()).collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

struct RawValue {
    keys: ImageKeys,
    object_index: u32,
    label: u32,
    on_border: bool,
    qc_flags: String,
    feature: Option<String>,
    value: Option<f64>,
}

fn in_list(clauses: &mut Vec<String>, params: &mut Vec<Value>, column: &str, ids: &[i64]) {
    let marks = vec!["?"; ids.len()].join(", ");
    clauses.push(format!("{column} IN ({marks})"));
    params.extend(ids.iter().map(|&id| Value::Integer(id)));
}

impl CellViewStore {
    /// One read snapshot, so a concurrent commit is seen entirely or not at all.
    pub fn query(&self, filter: &QueryFilter) -> Result<FeatureTable, StorageError> {
        self.conns.with_reader(|conn| with_snapshot(conn, |tx| query_in(tx, filter)))
    }
}

/// `query` inside a caller's snapshot.
pub(super) fn query_in(tx: &Transaction<'_>, filter: &QueryFilter) -> Result<FeatureTable, StorageError> {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    if let Some(id) = filter.experiment_id {
        clauses.push("r.experiment_id = ?".to_string());
        params.push(Value::Integer(id));
    }
    if let Some(id) = filter.plate_id {
        clauses.push("r.plate_id = ?".to_string());
        params.push(Value::Integer(id));
    }
    if !filter.well_ids.is_empty() {
        in_list(&mut clauses, &mut params, "r.well_id", &filter.well_ids);
    }
    if !filter.image_ids.is_empty() {
        in_list(&mut clauses, &mut params, "r.image_id", &filter.image_ids);
    }
    if filter.exclude_flagged {
        clauses.push("r.qc_flags = '[]'".to_string());
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let rows_sql = format!(
        "SELECT r.experiment_id, r.plate_id, r.well_id, r.image_id, r.object_index,
                r.label, r.on_border, r.qc_flags, v.feature, v.value
         FROM feature_rows r
         LEFT JOIN feature_values v
            ON v.image_id = r.image_id AND v.object_index = r.object_index
         {where_sql}
         ORDER BY r.plate_id, r.well_id, r.image_id, r.object_index, v.feature"
    );
    let wells_sql = format!(
        "SELECT w.id, w.plate_id, w.name, w.conditions FROM wells w
         WHERE w.id IN (SELECT DISTINCT r.well_id FROM feature_rows r {where_sql})
         ORDER BY w.id"
    );

    let mut stmt = tx.prepare(&rows_sql)?;
    let mapped = stmt.query_map(params_from_iter(params.iter()), |row| {
        Ok(RawValue {
            keys: ImageKeys {
                experiment_id: row.get(0)?,
                plate_id: row.get(1)?,
                well_id: row.get(2)?,
                image_id: row.get(3)?,
            },
            object_index: row.get(4)?,
            label: row.get(5)?,
            on_border: row.get(6)?,
            qc_flags: row.get(7)?,
            feature: row.get(8)?,
            value: row.get(9)?,
        })
    })?;
    let raws = mapped.collect::<rusqlite::Result<Vec<_>>>()?;

    let mut stmt = tx.prepare(&wells_sql)?;
    let mapped = stmt.query_map(params_from_iter(params.iter()), |row| {
        Ok((
            row.get::<_, WellId>(0)?,
            row.get::<_, PlateId>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;
    let raw_wells = mapped.collect::<rusqlite::Result<Vec<_>>>()?;

    let mut rows: Vec<FeatureRow> = Vec::new();
    for raw in raws {
        let same = rows
            .last()
            .is_some_and(|r| r.keys.image_id == raw.keys.image_id && r.object_index == raw.object_index);
        if !same {
            rows.push(FeatureRow {
                keys: raw.keys,
                object_index: raw.object_index,
                label: raw.label,
                on_border: raw.on_border,
                qc_flags: from_json(&raw.qc_flags)?,
                features: BTreeMap::new(),
            });
        }
        if let (Some(feature), Some(row)) = (raw.feature, rows.last_mut()) {
            row.features.insert(feature, raw.value.unwrap_or(f64::NAN));
        }
    }

    rows.retain(|row| filter.ranges.iter().all(|range| range.matches(row)));
    if !filter.features.is_empty() {
        let keep: BTreeSet<&str> = filter.features.iter().map(String::as_str).collect();
        for row in &mut rows {
            row.features.retain(|name, _| keep.contains(name.as_str()));
        }
    }

    let columns: BTreeSet<&String> = rows.iter().flat_map(|r| r.features.keys()).collect();
    let columns = columns.into_iter().cloned().collect();
    let present: BTreeSet<WellId> = rows.iter().map(|r| r.keys.well_id).collect();
    let mut wells = BTreeMap::new();
    for (id, plate_id, name, conditions) in raw_wells {
        if !present.contains(&id) {
            continue;
        }
        wells.insert(
            id,
            WellInfo {
                plate_id,
                name,
                conditions: from_json(&conditions)?,
            },
        );
    }
    Ok(FeatureTable { columns, rows, wells })
}

//! Wide CSV export of feature rows, one object per line.

use std::io::Write;
use std::path::Path;

use super::query::{FeatureTable, QueryFilter};
use super::CellViewStore;
use crate::error::StorageError;

const KEY_COLUMNS: [&str; 9] = [
    "experiment_id",
    "plate_id",
    "well_id",
    "well",
    "image_id",
    "object_index",
    "label",
    "on_border",
    "qc_flags",
];

/// Write `table` as CSV. Missing or NaN values are empty cells.
pub fn write_table<W: Write>(table: &FeatureTable, out: W) -> Result<usize, StorageError> {
    let mut writer = csv::Writer::from_writer(out);
    let header: Vec<&str> = KEY_COLUMNS
        .iter()
        .copied()
        .chain(table.columns.iter().map(String::as_str))
        .collect();
    writer.write_record(&header)?;

    for row in &table.rows {
        let k = &row.keys;
        let well = table.wells.get(&k.well_id).map(|w| w.name.as_str()).unwrap_or("");
        let mut record = vec![
            k.experiment_id.to_string(),
            k.plate_id.to_string(),
            k.well_id.to_string(),
            well.to_string(),
            k.image_id.to_string(),
            row.object_index.to_string(),
            row.label.to_string(),
            (row.on_border as u8).to_string(),
            row.qc_flags.join(";"),
        ];
        record.extend(table.columns.iter().map(|c| match row.features.get(c) {
            Some(v) if !v.is_nan() => v.to_string(),
            _ => String::new(),
        }));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(table.rows.len())
}

impl CellViewStore {
    /// Export the rows selected by `filter` to `path`. Returns the row count.
    pub fn export_csv(&self, filter: &QueryFilter, path: &Path) -> Result<usize, StorageError> {
        let table = self.query(filter)?;
        let file = std::fs::File::create(path)?;
        let n = write_table(&table, file)?;
        tracing::info!(rows = n, path = %path.display(), "exported csv");
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cellview::WellInfo;
    use crate::model::{FeatureRow, ImageKeys};
    use std::collections::BTreeMap;

    #[test]
    fn writes_header_and_blank_missing_values() {
        let keys = ImageKeys {
            experiment_id: 1,
            plate_id: 2,
            well_id: 3,
            image_id: 4,
        };
        let table = FeatureTable {
            columns: vec!["area".into(), "solidity".into()],
            rows: vec![FeatureRow {
                keys,
                object_index: 0,
                label: 1,
                on_border: true,
                qc_flags: vec!["area>=20".into()],
                features: BTreeMap::from([("area".to_string(), 12.0)]),
            }],
            wells: BTreeMap::from([(
                3,
                WellInfo {
                    plate_id: 2,
                    name: "B2".into(),
                    conditions: BTreeMap::new(),
                },
            )]),
        };
        let mut buf = Vec::new();
        assert_eq!(write_table(&table, &mut buf).unwrap(), 1);
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "experiment_id,plate_id,well_id,well,image_id,object_index,label,on_border,qc_flags,area,solidity"
        );
        assert_eq!(lines[1], "1,2,3,B2,4,0,1,1,area>=20,12,");
    }
}

//! Screening hierarchy and result records shared by every stage.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub type ExperimentId = i64;
pub type PlateId = i64;
pub type WellId = i64;
pub type ImageId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentInfo {
    pub name: String,
    #[serde(default)]
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellMetadata {
    pub id: WellId,
    pub row: u32,
    pub column: u32,
    /// Condition / treatment annotations (cell line, drug, concentration, ...).
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
}

impl WellMetadata {
    pub fn name(&self) -> String {
        well_name(self.row, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateMetadata {
    pub id: PlateId,
    pub name: String,
    pub experiment: ExperimentInfo,
    pub rows: u32,
    pub columns: u32,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub wells: Vec<WellMetadata>,
}

/// A handle to one acquired image. Pixel data stays on the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: ImageId,
    pub well_id: WellId,
    #[serde(default)]
    pub name: String,
    pub channels: Vec<String>,
    pub size_y: usize,
    pub size_x: usize,
    #[serde(default = "one")]
    pub size_z: usize,
}

fn one() -> usize {
    1
}

/// Foreign keys carried by every feature row of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageKeys {
    pub experiment_id: ExperimentId,
    pub plate_id: PlateId,
    pub well_id: WellId,
    pub image_id: ImageId,
}

/// One quantified object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub keys: ImageKeys,
    /// Rank of the object within its image, in ascending label order.
    pub object_index: u32,
    pub label: u32,
    pub on_border: bool,
    /// Names of the quality rules this row failed while being kept.
    #[serde(default)]
    pub qc_flags: Vec<String>,
    pub features: BTreeMap<String, f64>,
}

impl FeatureRow {
    pub fn is_flagged(&self) -> bool {
        !self.qc_flags.is_empty()
    }
}

/// "A1" style well name. Rows past Z continue as AA, AB, ...
pub fn well_name(row: u32, column: u32) -> String {
    let mut letters = Vec::new();
    let mut r = row as i64;
    loop {
        letters.push((b'A' + (r % 26) as u8) as char);
        r = r / 26 - 1;
        if r < 0 {
            break;
        }
    }
    letters.reverse();
    format!("{}{}", letters.into_iter().collect::<String>(), column + 1)
}

static WELL_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^([A-Za-z]+)0*(\d+)$").ok());

/// Inverse of [`well_name`]; accepts zero-padded columns ("B03"). Names
/// whose row or column does not fit a `u32` are rejected.
pub fn parse_well_name(name: &str) -> Option<(u32, u32)> {
    let cap = WELL_RE.as_ref()?.captures(name.trim())?;
    // Bijective base 26: A = 0, Z = 25, AA = 26.
    let mut row: u32 = 0;
    for ch in cap[1].to_ascii_uppercase().bytes() {
        row = row.checked_mul(26)?.checked_add((ch - b'A') as u32 + 1)?;
    }
    let column: u32 = cap[2].parse().ok()?;
    if column == 0 {
        return None;
    }
    Some((row - 1, column - 1))
}

/// Segmented compartment of a cell. Nucleus-only runs measure `Nucleus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compartment {
    Nucleus,
    Cell,
    /// Cell minus nucleus.
    Cyto,
}

impl Compartment {
    pub const ALL: [Compartment; 3] = [Compartment::Nucleus, Compartment::Cell, Compartment::Cyto];

    pub fn suffix(self) -> &'static str {
        match self {
            Compartment::Nucleus => "nucleus",
            Compartment::Cell => "cell",
            Compartment::Cyto => "cyto",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_names() {
        assert_eq!(well_name(0, 0), "A1");
        assert_eq!(well_name(7, 11), "H12");
        assert_eq!(well_name(26, 0), "AA1");
        assert_eq!(parse_well_name("H12"), Some((7, 11)));
        assert_eq!(parse_well_name("b03"), Some((1, 2)));
        assert_eq!(parse_well_name("AA1"), Some((26, 0)));
        assert_eq!(parse_well_name("A0"), None);
        assert_eq!(parse_well_name("12"), None);
        assert_eq!(parse_well_name("ZZ1"), Some((701, 0)));
        assert_eq!(parse_well_name(&well_name(701, 4)), Some((701, 4)));
    }

    #[test]
    fn oversized_well_names_are_rejected() {
        assert_eq!(parse_well_name("AAAAAAAAAAAAAAAA1"), None);
        assert_eq!(parse_well_name("A99999999999"), None);
        // Largest row that fits.
        assert_eq!(parse_well_name(&well_name(u32::MAX - 1, 0)), Some((u32::MAX - 1, 0)));
    }
}

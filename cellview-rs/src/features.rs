//! Per-object measurements from a label mask and intensity planes.
//!
//! Features are looked up by name in an explicit registry. Shape features
//! produce one column each; intensity features produce one column per
//! channel, named `<feature>_<channel>`.
//!
//! With a cell mask, each nucleus is linked to the cell it overlaps most
//! and every column is measured per compartment, named
//! `<column>_nucleus`, `<column>_cell` and `<column>_cyto`.
//!
//! Objects are visited in ascending label order and pixels in raster order,
//! so the same mask and planes always give bit-identical rows.

use ndarray::Array2;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::config::FeatureConfig;
use crate::error::FeatureError;
use crate::model::{Compartment, FeatureRow, ImageKeys};

/// Pixels of one labelled object.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub label: u32,
    /// (row, col) in raster order.
    pub pixels: Vec<(usize, usize)>,
    pub on_border: bool,
}

pub type ShapeFn = fn(&Region) -> f64;
pub type IntensityFn = fn(&Region, &[f32]) -> f64;

#[derive(Clone, Copy)]
pub enum FeatureFn {
    Shape(ShapeFn),
    Intensity(IntensityFn),
}

#[derive(Clone)]
pub struct FeatureRegistry {
    entries: BTreeMap<String, FeatureFn>,
}

impl FeatureRegistry {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut r = Self::empty();
        r.register_shape("area", area);
        r.register_shape("perimeter", perimeter);
        r.register_shape("eccentricity", eccentricity);
        r.register_shape("solidity", solidity);
        r.register_shape("centroid_row", centroid_row);
        r.register_shape("centroid_col", centroid_col);
        r.register_intensity("intensity_mean", intensity_mean);
        r.register_intensity("intensity_median", intensity_median);
        r.register_intensity("intensity_total", intensity_total);
        r.register_intensity("intensity_min", intensity_min);
        r.register_intensity("intensity_max", intensity_max);
        r.register_intensity("intensity_std", intensity_std);
        r
    }

    pub fn register_shape(&mut self, name: &str, f: ShapeFn) {
        self.entries.insert(name.to_string(), FeatureFn::Shape(f));
    }

    pub fn register_intensity(&mut self, name: &str, f: IntensityFn) {
        self.entries.insert(name.to_string(), FeatureFn::Intensity(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<FeatureFn> {
        self.entries.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Whether an extractor built from `features`/`channels` emits `column`.
    /// With no channel list every channel suffix is accepted. With
    /// `compartments` every column carries a compartment suffix.
    pub fn produces_column(&self, column: &str, features: &[String], channels: &[String], compartments: bool) -> bool {
        if !compartments {
            return self.produces_plain_column(column, features, channels);
        }
        if column == CELL_LABEL_COLUMN {
            return true;
        }
        Compartment::ALL.iter().any(|c| {
            column
                .strip_suffix(c.suffix())
                .and_then(|rest| rest.strip_suffix('_'))
                .is_some_and(|base| self.produces_plain_column(base, features, channels))
        })
    }

    fn produces_plain_column(&self, column: &str, features: &[String], channels: &[String]) -> bool {
        let selected: Vec<&str> = if features.is_empty() {
            self.names().collect()
        } else {
            features.iter().map(String::as_str).collect()
        };
        selected.into_iter().any(|name| match self.get(name) {
            Some(FeatureFn::Shape(_)) => column == name,
            Some(FeatureFn::Intensity(_)) => {
                if channels.is_empty() {
                    column
                        .strip_prefix(name)
                        .and_then(|rest| rest.strip_prefix('_'))
                        .is_some_and(|ch| !ch.is_empty())
                } else {
                    channels.iter().any(|ch| column == intensity_column(name, ch))
                }
            }
            None => false,
        })
    }
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

pub fn intensity_column(feature: &str, channel: &str) -> String {
    format!("{}_{}", feature, channel)
}

pub fn compartment_column(column: &str, compartment: Compartment) -> String {
    format!("{}_{}", column, compartment.suffix())
}

/// Label of the linked cell in compartment rows; NaN when the nucleus lies
/// outside every cell.
pub const CELL_LABEL_COLUMN: &str = "cell_label";

/// For each nucleus label, the cell label it shares the most pixels with.
/// Ties go to the lower cell label.
pub fn link_nuclei(nuclei: &Array2<u32>, cells: &Array2<u32>) -> BTreeMap<u32, u32> {
    let mut overlap: BTreeMap<(u32, u32), usize> = BTreeMap::new();
    for (&n, &c) in nuclei.iter().zip(cells.iter()) {
        if n != 0 && c != 0 {
            *overlap.entry((n, c)).or_default() += 1;
        }
    }
    let mut links: BTreeMap<u32, (u32, usize)> = BTreeMap::new();
    for ((n, c), count) in overlap {
        let best = links.entry(n).or_insert((c, count));
        if count > best.1 {
            *best = (c, count);
        }
    }
    links.into_iter().map(|(n, (c, _))| (n, c)).collect()
}

/// Cell labels with nuclear pixels removed.
pub fn cytoplasm(nuclei: &Array2<u32>, cells: &Array2<u32>) -> Array2<u32> {
    let mut cyto = cells.clone();
    cyto.zip_mut_with(nuclei, |c, &n| {
        if n != 0 {
            *c = 0;
        }
    });
    cyto
}

/// Objects of a mask in ascending label order.
pub fn regions(mask: &Array2<u32>) -> Vec<Region> {
    let (h, w) = mask.dim();
    let mut by_label: BTreeMap<u32, Region> = BTreeMap::new();
    for ((r, c), &label) in mask.indexed_iter() {
        if label == 0 {
            continue;
        }
        let region = by_label.entry(label).or_insert_with(|| Region {
            label,
            pixels: Vec::new(),
            on_border: false,
        });
        region.pixels.push((r, c));
        if r == 0 || c == 0 || r + 1 == h || c + 1 == w {
            region.on_border = true;
        }
    }
    by_label.into_values().collect()
}

pub struct FeatureExtractor {
    shape: Vec<(String, ShapeFn)>,
    intensity: Vec<(String, IntensityFn)>,
    channels: Vec<String>,
}

impl FeatureExtractor {
    pub fn new(registry: &FeatureRegistry, config: &FeatureConfig) -> Result<Self, FeatureError> {
        let names: Vec<String> = if config.features.is_empty() {
            registry.names().map(String::from).collect()
        } else {
            config.features.clone()
        };
        let mut shape = Vec::new();
        let mut intensity = Vec::new();
        for name in names {
            match registry.get(&name) {
                Some(FeatureFn::Shape(f)) => shape.push((name, f)),
                Some(FeatureFn::Intensity(f)) => intensity.push((name, f)),
                None => return Err(FeatureError::UnknownFeature(name)),
            }
        }
        Ok(Self {
            shape,
            intensity,
            channels: config.channels.clone(),
        })
    }

    fn channels<'p>(
        &self,
        planes: &'p BTreeMap<String, Array2<f32>>,
        dim: (usize, usize),
    ) -> Result<Vec<(&'p str, &'p Array2<f32>)>, FeatureError> {
        let channels: Vec<(&str, &Array2<f32>)> = if self.channels.is_empty() {
            planes.iter().map(|(k, v)| (k.as_str(), v)).collect()
        } else {
            self.channels
                .iter()
                .map(|c| {
                    planes
                        .get_key_value(c)
                        .map(|(k, p)| (k.as_str(), p))
                        .ok_or_else(|| FeatureError::MissingChannel(c.clone()))
                })
                .collect::<Result<_, _>>()?
        };
        for (name, plane) in &channels {
            if plane.dim() != dim {
                return Err(FeatureError::ShapeMismatch {
                    channel: name.to_string(),
                    expected: dim,
                    actual: plane.dim(),
                });
            }
        }
        Ok(channels)
    }

    /// Every column one region yields, in a fixed order.
    fn column_names(&self, channels: &[(&str, &Array2<f32>)]) -> Vec<String> {
        let mut names: Vec<String> = self.shape.iter().map(|(name, _)| name.clone()).collect();
        for (channel, _) in channels {
            names.extend(self.intensity.iter().map(|(name, _)| intensity_column(name, channel)));
        }
        names
    }

    fn measure(
        &self,
        region: &Region,
        channels: &[(&str, &Array2<f32>)],
        suffix: Option<Compartment>,
        out: &mut BTreeMap<String, f64>,
    ) {
        let column = |name: String| match suffix {
            Some(c) => compartment_column(&name, c),
            None => name,
        };
        for (name, f) in &self.shape {
            out.insert(column(name.clone()), f(region));
        }
        let mut values: Vec<f32> = Vec::with_capacity(region.pixels.len());
        for (channel, plane) in channels {
            values.clear();
            values.extend(region.pixels.iter().map(|&p| plane[p]));
            for (name, f) in &self.intensity {
                out.insert(column(intensity_column(name, channel)), f(region, &values));
            }
        }
    }

    /// One row per object, in ascending label order.
    pub fn extract(
        &self,
        keys: ImageKeys,
        mask: &Array2<u32>,
        planes: &BTreeMap<String, Array2<f32>>,
    ) -> Result<Vec<FeatureRow>, FeatureError> {
        let channels = self.channels(planes, mask.dim())?;
        let mut rows = Vec::new();
        for (index, region) in regions(mask).into_iter().enumerate() {
            let mut features = BTreeMap::new();
            self.measure(&region, &channels, None, &mut features);
            rows.push(FeatureRow {
                keys,
                object_index: index as u32,
                label: region.label,
                on_border: region.on_border,
                qc_flags: Vec::new(),
                features,
            });
        }
        Ok(rows)
    }

    /// One row per nucleus, in ascending nucleus label order, carrying
    /// nucleus, cell and cytoplasm columns. Cell and cytoplasm columns are
    /// NaN when the nucleus has no cell or the cell has no cytoplasm.
    /// Cells without a nucleus produce no row.
    pub fn extract_compartments(
        &self,
        keys: ImageKeys,
        nuclei: &Array2<u32>,
        cells: &Array2<u32>,
        planes: &BTreeMap<String, Array2<f32>>,
    ) -> Result<Vec<FeatureRow>, FeatureError> {
        if cells.dim() != nuclei.dim() {
            return Err(FeatureError::ShapeMismatch {
                channel: "cell mask".to_string(),
                expected: nuclei.dim(),
                actual: cells.dim(),
            });
        }
        let channels = self.channels(planes, nuclei.dim())?;
        let names = self.column_names(&channels);
        let links = link_nuclei(nuclei, cells);
        let by_label = |mask: &Array2<u32>| -> BTreeMap<u32, Region> {
            regions(mask).into_iter().map(|r| (r.label, r)).collect()
        };
        let cell_regions = by_label(cells);
        let cyto_regions = by_label(&cytoplasm(nuclei, cells));

        let missing = |compartment: Compartment, out: &mut BTreeMap<String, f64>| {
            for name in &names {
                out.insert(compartment_column(name, compartment), f64::NAN);
            }
        };

        let mut rows = Vec::new();
        for (index, nucleus) in regions(nuclei).into_iter().enumerate() {
            let mut features = BTreeMap::new();
            self.measure(&nucleus, &channels, Some(Compartment::Nucleus), &mut features);
            let cell = links.get(&nucleus.label).and_then(|c| cell_regions.get(c));
            match cell {
                Some(cell) => {
                    self.measure(cell, &channels, Some(Compartment::Cell), &mut features);
                    match cyto_regions.get(&cell.label) {
                        Some(cyto) => self.measure(cyto, &channels, Some(Compartment::Cyto), &mut features),
                        None => missing(Compartment::Cyto, &mut features),
                    }
                    features.insert(CELL_LABEL_COLUMN.to_string(), cell.label as f64);
                }
                None => {
                    missing(Compartment::Cell, &mut features);
                    missing(Compartment::Cyto, &mut features);
                    features.insert(CELL_LABEL_COLUMN.to_string(), f64::NAN);
                }
            }
            rows.push(FeatureRow {
                keys,
                object_index: index as u32,
                label: nucleus.label,
                on_border: nucleus.on_border || cell.is_some_and(|c| c.on_border),
                qc_flags: Vec::new(),
                features,
            });
        }
        let linked: BTreeSet<u32> = links.values().copied().collect();
        let orphans = cell_regions.keys().filter(|c| !linked.contains(c)).count();
        if orphans > 0 {
            tracing::debug!(image_id = keys.image_id, orphans, "cells without a nucleus dropped");
        }
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Shape features
// ---------------------------------------------------------------------------

fn area(r: &Region) -> f64 {
    r.pixels.len() as f64
}

fn centroid(r: &Region) -> (f64, f64) {
    let n = r.pixels.len() as f64;
    let (sy, sx) = r
        .pixels
        .iter()
        .fold((0.0, 0.0), |(sy, sx), &(y, x)| (sy + y as f64, sx + x as f64));
    (sy / n, sx / n)
}

fn centroid_row(r: &Region) -> f64 {
    centroid(r).0
}

fn centroid_col(r: &Region) -> f64 {
    centroid(r).1
}

/// Number of pixel edges shared with background (4-neighbourhood).
fn perimeter(r: &Region) -> f64 {
    let members: HashSet<(usize, usize)> = r.pixels.iter().copied().collect();
    let mut edges = 0usize;
    for &(y, x) in &r.pixels {
        let neighbours = [
            y.checked_sub(1).map(|ny| (ny, x)),
            Some((y + 1, x)),
            x.checked_sub(1).map(|nx| (y, nx)),
            Some((y, x + 1)),
        ];
        edges += neighbours
            .iter()
            .filter(|n| n.map_or(true, |p| !members.contains(&p)))
            .count();
    }
    edges as f64
}

/// Eccentricity of the ellipse with the same second central moments.
fn eccentricity(r: &Region) -> f64 {
    let n = r.pixels.len() as f64;
    let (cy, cx) = centroid(r);
    let (mut myy, mut mxx, mut mxy) = (0.0, 0.0, 0.0);
    for &(y, x) in &r.pixels {
        let dy = y as f64 - cy;
        let dx = x as f64 - cx;
        myy += dy * dy;
        mxx += dx * dx;
        mxy += dy * dx;
    }
    let (myy, mxx, mxy) = (myy / n, mxx / n, mxy / n);
    let half_trace = (myy + mxx) / 2.0;
    let root = (((myy - mxx) / 2.0).powi(2) + mxy * mxy).sqrt();
    let l1 = half_trace + root;
    let l2 = half_trace - root;
    if l1 <= 0.0 {
        return 0.0;
    }
    (1.0 - (l2 / l1).max(0.0)).sqrt()
}

fn cross(o: (i64, i64), a: (i64, i64), b: (i64, i64)) -> i64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

/// Area of the convex hull around the pixel squares (monotone chain).
fn convex_area(r: &Region) -> f64 {
    let mut pts: Vec<(i64, i64)> = r
        .pixels
        .iter()
        .flat_map(|&(y, x)| {
            let (y, x) = (y as i64, x as i64);
            [(y, x), (y + 1, x), (y, x + 1), (y + 1, x + 1)]
        })
        .collect();
    pts.sort_unstable();
    pts.dedup();
    if pts.len() < 3 {
        return 0.0;
    }
    let mut hull: Vec<(i64, i64)> = Vec::with_capacity(pts.len() * 2);
    for &p in &pts {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0 {
            hull.pop();
        }
        hull.push(p);
    }
    let lower = hull.len() + 1;
    for &p in pts.iter().rev().skip(1) {
        while hull.len() >= lower && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0 {
            hull.pop();
        }
        hull.push(p);
    }
    hull.pop();
    let twice: i64 = (0..hull.len())
        .map(|i| {
            let (a, b) = (hull[i], hull[(i + 1) % hull.len()]);
            a.0 * b.1 - b.0 * a.1
        })
        .sum();
    twice.abs() as f64 / 2.0
}

fn solidity(r: &Region) -> f64 {
    let hull = convex_area(r);
    if hull <= 0.0 {
        return 0.0;
    }
    area(r) / hull
}

// ---------------------------------------------------------------------------
// Intensity features
// ---------------------------------------------------------------------------

fn intensity_total(_: &Region, v: &[f32]) -> f64 {
    v.iter().map(|&x| x as f64).sum()
}

fn intensity_mean(r: &Region, v: &[f32]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    intensity_total(r, v) / v.len() as f64
}

fn intensity_median(_: &Region, v: &[f32]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let mut sorted = v.to_vec();
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid] as f64
    } else {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    }
}

fn intensity_min(_: &Region, v: &[f32]) -> f64 {
    v.iter().copied().fold(f32::INFINITY, f32::min) as f64
}

fn intensity_max(_: &Region, v: &[f32]) -> f64 {
    v.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64
}

fn intensity_std(r: &Region, v: &[f32]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    let mean = intensity_mean(r, v);
    let var = v.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / v.len() as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const KEYS: ImageKeys = ImageKeys {
        experiment_id: 1,
        plate_id: 2,
        well_id: 3,
        image_id: 4,
    };

    fn fixture() -> (Array2<u32>, BTreeMap<String, Array2<f32>>) {
        let mask = array![
            [0, 0, 0, 0, 0, 0],
            [0, 7, 7, 0, 0, 0],
            [0, 7, 7, 0, 2, 0],
            [0, 0, 0, 0, 2, 0],
            [0, 0, 0, 0, 2, 2],
        ];
        let dapi = Array2::from_shape_fn((5, 6), |(r, c)| (r * 6 + c) as f32);
        let mut planes = BTreeMap::new();
        planes.insert("DAPI".to_string(), dapi);
        (mask, planes)
    }

    #[test]
    fn rows_follow_ascending_labels() {
        let (mask, planes) = fixture();
        let ex = FeatureExtractor::new(&FeatureRegistry::builtin(), &FeatureConfig::default()).unwrap();
        let rows = ex.extract(KEYS, &mask, &planes).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].object_index, rows[0].label), (0, 2));
        assert_eq!((rows[1].object_index, rows[1].label), (1, 7));
        assert!(rows[0].on_border);
        assert!(!rows[1].on_border);
    }

    #[test]
    fn square_measurements() {
        let (mask, planes) = fixture();
        let ex = FeatureExtractor::new(&FeatureRegistry::builtin(), &FeatureConfig::default()).unwrap();
        let rows = ex.extract(KEYS, &mask, &planes).unwrap();
        let sq = &rows[1].features;
        // pixels 7, 8, 13, 14
        assert_eq!(sq["area"], 4.0);
        assert_eq!(sq["perimeter"], 8.0);
        assert_eq!(sq["solidity"], 1.0);
        assert_eq!(sq["eccentricity"], 0.0);
        assert_eq!(sq["centroid_row"], 1.5);
        assert_eq!(sq["centroid_col"], 1.5);
        assert_eq!(sq["intensity_total_DAPI"], 42.0);
        assert_eq!(sq["intensity_mean_DAPI"], 10.5);
        assert_eq!(sq["intensity_median_DAPI"], 10.5);
        assert_eq!(sq["intensity_min_DAPI"], 7.0);
        assert_eq!(sq["intensity_max_DAPI"], 14.0);
        assert!((sq["intensity_std_DAPI"] - 9.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn elongated_objects_are_eccentric_and_l_shapes_not_solid() {
        let (mask, planes) = fixture();
        let ex = FeatureExtractor::new(&FeatureRegistry::builtin(), &FeatureConfig::default()).unwrap();
        let rows = ex.extract(KEYS, &mask, &planes).unwrap();
        let l = &rows[0].features;
        assert!(l["eccentricity"] > 0.8);
        assert!(l["solidity"] < 1.0);
        assert!(l["solidity"] > 0.0);
    }

    #[test]
    fn extraction_is_deterministic() {
        let (mask, planes) = fixture();
        let ex = FeatureExtractor::new(&FeatureRegistry::builtin(), &FeatureConfig::default()).unwrap();
        let a = ex.extract(KEYS, &mask, &planes).unwrap();
        let b = ex.extract(KEYS, &mask, &planes).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.object_index, y.object_index);
            for (k, v) in &x.features {
                assert_eq!(v.to_bits(), y.features[k].to_bits(), "{}", k);
            }
        }
    }

    #[test]
    fn empty_mask_gives_no_rows() {
        let (_, planes) = fixture();
        let mask = Array2::<u32>::zeros((5, 6));
        let ex = FeatureExtractor::new(&FeatureRegistry::builtin(), &FeatureConfig::default()).unwrap();
        assert!(ex.extract(KEYS, &mask, &planes).unwrap().is_empty());
    }

    #[test]
    fn channel_problems_are_errors() {
        let (mask, mut planes) = fixture();
        let cfg = FeatureConfig {
            channels: vec!["DAPI".into(), "EdU".into()],
            features: vec!["area".into(), "intensity_mean".into()],
        };
        let ex = FeatureExtractor::new(&FeatureRegistry::builtin(), &cfg).unwrap();
        assert!(matches!(
            ex.extract(KEYS, &mask, &planes),
            Err(FeatureError::MissingChannel(c)) if c == "EdU"
        ));

        planes.insert("EdU".into(), Array2::zeros((4, 6)));
        assert!(matches!(
            ex.extract(KEYS, &mask, &planes),
            Err(FeatureError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn custom_features_can_be_registered() {
        fn bright_fraction(_: &Region, v: &[f32]) -> f64 {
            v.iter().filter(|&&x| x > 10.0).count() as f64 / v.len() as f64
        }
        let mut registry = FeatureRegistry::builtin();
        registry.register_intensity("bright_fraction", bright_fraction);
        let cfg = FeatureConfig {
            channels: vec!["DAPI".into()],
            features: vec!["bright_fraction".into()],
        };
        assert!(registry.produces_column("bright_fraction_DAPI", &cfg.features, &cfg.channels, false));
        assert!(!registry.produces_column("area", &cfg.features, &cfg.channels, false));
        assert!(registry.produces_column("bright_fraction_DAPI_cyto", &cfg.features, &cfg.channels, true));
        assert!(!registry.produces_column("bright_fraction_DAPI", &cfg.features, &cfg.channels, true));

        let (mask, planes) = fixture();
        let ex = FeatureExtractor::new(&registry, &cfg).unwrap();
        let rows = ex.extract(KEYS, &mask, &planes).unwrap();
        assert_eq!(rows[1].features["bright_fraction_DAPI"], 0.5);
        assert_eq!(rows[1].features.len(), 1);
    }

    /// Two 4x4 nuclei centred in 6x6 cells, plus a nucleus with no cell and
    /// a cell with no nucleus.
    fn compartment_fixture() -> (Array2<u32>, Array2<u32>, BTreeMap<String, Array2<f32>>) {
        let mut nuclei = Array2::<u32>::zeros((20, 30));
        let mut cells = Array2::<u32>::zeros((20, 30));
        for (i, x0) in [2usize, 12].into_iter().enumerate() {
            cells.slice_mut(ndarray::s![2..8, x0..x0 + 6]).fill(10 + i as u32);
            nuclei.slice_mut(ndarray::s![3..7, x0 + 1..x0 + 5]).fill(1 + i as u32);
        }
        nuclei.slice_mut(ndarray::s![12..15, 2..5]).fill(3);
        cells.slice_mut(ndarray::s![12..16, 20..24]).fill(12);
        let mut planes = BTreeMap::new();
        planes.insert("DAPI".to_string(), nuclei.mapv(|l| if l != 0 { 100.0 } else { 0.0 }));
        planes.insert("Actin".to_string(), cells.mapv(|l| if l != 0 { 40.0 } else { 0.0 }));
        (nuclei, cells, planes)
    }

    #[test]
    fn nuclei_link_to_the_most_overlapping_cell() {
        let nuclei = array![[1, 1, 1, 0], [0, 0, 0, 2]];
        let cells = array![[5, 6, 6, 0], [0, 0, 0, 0]];
        let links = link_nuclei(&nuclei, &cells);
        assert_eq!(links.get(&1), Some(&6));
        assert_eq!(links.get(&2), None);

        let tie = link_nuclei(&array![[1, 1]], &array![[9, 4]]);
        assert_eq!(tie.get(&1), Some(&4));
    }

    #[test]
    fn compartments_are_measured_separately() {
        let (nuclei, cells, planes) = compartment_fixture();
        let cfg = FeatureConfig {
            channels: vec!["DAPI".into(), "Actin".into()],
            features: vec!["area".into(), "intensity_mean".into()],
        };
        let ex = FeatureExtractor::new(&FeatureRegistry::builtin(), &cfg).unwrap();
        let rows = ex.extract_compartments(KEYS, &nuclei, &cells, &planes).unwrap();
        assert_eq!(rows.iter().map(|r| r.label).collect::<Vec<_>>(), vec![1, 2, 3]);

        let first = &rows[0].features;
        assert_eq!(first["area_nucleus"], 16.0);
        assert_eq!(first["area_cell"], 36.0);
        assert_eq!(first["area_cyto"], 20.0);
        assert_eq!(first["intensity_mean_DAPI_nucleus"], 100.0);
        assert_eq!(first["intensity_mean_DAPI_cyto"], 0.0);
        assert_eq!(first["intensity_mean_Actin_cyto"], 40.0);
        assert_eq!(first[CELL_LABEL_COLUMN], 10.0);
        assert_eq!(rows[1].features[CELL_LABEL_COLUMN], 11.0);
        assert!(!rows[0].on_border);

        let lonely = &rows[2].features;
        assert_eq!(lonely["area_nucleus"], 9.0);
        assert!(lonely["area_cell"].is_nan());
        assert!(lonely["intensity_mean_Actin_cyto"].is_nan());
        assert!(lonely[CELL_LABEL_COLUMN].is_nan());
        assert_eq!(lonely.len(), first.len());
    }

    #[test]
    fn cell_touching_the_border_flags_its_nucleus() {
        let nuclei = array![[0, 0, 0, 0], [0, 1, 0, 0], [0, 0, 0, 0], [0, 0, 0, 0]];
        let cells = array![[4, 4, 0, 0], [4, 4, 0, 0], [0, 0, 0, 0], [0, 0, 0, 0]];
        let planes: BTreeMap<String, Array2<f32>> = [("DAPI".to_string(), Array2::ones((4, 4)))].into();
        let ex = FeatureExtractor::new(&FeatureRegistry::builtin(), &FeatureConfig::default()).unwrap();
        let rows = ex.extract_compartments(KEYS, &nuclei, &cells, &planes).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].on_border);
        assert_eq!(rows[0].features["area_cyto"], 3.0);
    }
}

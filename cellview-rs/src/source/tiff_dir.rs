//! Filesystem image source over exported plate folders.
//!
//! Layout:
//!   <root>/plate_<id>/plate.json
//!   <root>/plate_<id>/well_<id>/image<id>_<channel>_z<k>.tif

use ndarray::{Array2, Array3};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use super::{ImageSource, Pixels};
use crate::error::SourceError;
use crate::model::{ImageId, ImageRef, PlateId, PlateMetadata, WellId};

const TIFF_RE: &str = r"^image(\d+)_(.+)_z(\d+)\.tiff?$";

pub struct TiffDirSource {
    root: PathBuf,
    tiff_re: Regex,
}

fn unavailable(e: impl std::fmt::Display) -> SourceError {
    SourceError::Unavailable(e.to_string())
}

impl TiffDirSource {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(SourceError::Unavailable(format!(
                "image root not reachable: {}",
                root.display()
            )));
        }
        let tiff_re = Regex::new(TIFF_RE).map_err(unavailable)?;
        Ok(Self { root, tiff_re })
    }

    fn plate_dirs(&self) -> Result<Vec<PathBuf>, SourceError> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.root)
            .map_err(unavailable)?
            .filter_map(|e| {
                let e = e.ok()?;
                let is_plate = e.file_type().ok()?.is_dir()
                    && e.file_name().to_str()?.starts_with("plate_");
                is_plate.then(|| e.path())
            })
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    fn well_dir(&self, well_id: WellId) -> Result<PathBuf, SourceError> {
        let name = format!("well_{}", well_id);
        for plate_dir in self.plate_dirs()? {
            let candidate = plate_dir.join(&name);
            if candidate.is_dir() {
                return Ok(candidate);
            }
        }
        Err(SourceError::NotFound(format!("well {}", well_id)))
    }

    /// (image id, channel) -> [(z, path)], z ascending.
    fn discover_tiffs(
        &self,
        well_dir: &Path,
    ) -> Result<BTreeMap<(ImageId, String), Vec<(u32, PathBuf)>>, SourceError> {
        let mut index: BTreeMap<(ImageId, String), Vec<(u32, PathBuf)>> = BTreeMap::new();
        for entry in fs::read_dir(well_dir).map_err(unavailable)? {
            let entry = entry.map_err(unavailable)?;
            if !entry.file_type().map_err(unavailable)?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let cap = match self.tiff_re.captures(&name) {
                Some(c) => c,
                None => continue,
            };
            let (Ok(id), Ok(z)) = (cap[1].parse::<ImageId>(), cap[3].parse::<u32>()) else {
                continue;
            };
            index
                .entry((id, cap[2].to_string()))
                .or_default()
                .push((z, entry.path()));
        }
        for files in index.values_mut() {
            files.sort();
        }
        Ok(index)
    }
}

/// (height, width) from the TIFF header, without decoding pixels.
fn read_tiff_dimensions(path: &Path) -> Result<(usize, usize), SourceError> {
    let file = fs::File::open(path).map_err(unavailable)?;
    let unreadable =
        |e: tiff::TiffError| SourceError::NotFound(format!("unreadable {}: {}", path.display(), e));
    let mut decoder = tiff::decoder::Decoder::new(file).map_err(unreadable)?;
    let (width, height) = decoder.dimensions().map_err(unreadable)?;
    Ok((height as usize, width as usize))
}

fn read_tiff_plane(path: &Path) -> Result<Array2<f32>, SourceError> {
    let file = fs::File::open(path).map_err(unavailable)?;
    let unreadable =
        |e: tiff::TiffError| SourceError::NotFound(format!("unreadable {}: {}", path.display(), e));
    let mut decoder = tiff::decoder::Decoder::new(file).map_err(unreadable)?;
    let (width, height) = decoder.dimensions().map_err(unreadable)?;
    let data: Vec<f32> = match decoder.read_image().map_err(unreadable)? {
        tiff::decoder::DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        tiff::decoder::DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        tiff::decoder::DecodingResult::F32(v) => v,
        _ => {
            return Err(SourceError::NotFound(format!(
                "unsupported TIFF pixel format (need u8, u16 or f32): {}",
                path.display()
            )))
        }
    };
    Array2::from_shape_vec((height as usize, width as usize), data)
        .map_err(|e| SourceError::NotFound(format!("{}: {}", path.display(), e)))
}

impl ImageSource for TiffDirSource {
    fn fetch_plate(&self, plate_id: PlateId) -> Result<PlateMetadata, SourceError> {
        let path = self
            .root
            .join(format!("plate_{}", plate_id))
            .join("plate.json");
        if !path.exists() {
            return Err(SourceError::NotFound(format!("plate {}", plate_id)));
        }
        let text = fs::read_to_string(&path).map_err(unavailable)?;
        let mut plate: PlateMetadata = serde_json::from_str(&text)
            .map_err(|e| SourceError::NotFound(format!("invalid {}: {}", path.display(), e)))?;
        plate.id = plate_id;
        Ok(plate)
    }

    fn fetch_images(&self, well_id: WellId) -> Result<Vec<ImageRef>, SourceError> {
        let well_dir = self.well_dir(well_id)?;
        let index = self.discover_tiffs(&well_dir)?;

        let mut images: BTreeMap<ImageId, ImageRef> = BTreeMap::new();
        let mut unreadable: BTreeSet<ImageId> = BTreeSet::new();
        for ((id, channel), files) in &index {
            if unreadable.contains(id) {
                continue;
            }
            if !images.contains_key(id) {
                let (size_y, size_x) = match read_tiff_dimensions(&files[0].1) {
                    Ok(dims) => dims,
                    Err(SourceError::NotFound(what)) => {
                        tracing::warn!(well_id, image_id = *id, %what, "skipping unreadable image");
                        unreadable.insert(*id);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                images.insert(
                    *id,
                    ImageRef {
                        id: *id,
                        well_id,
                        name: format!("image{}", id),
                        channels: Vec::new(),
                        size_y,
                        size_x,
                        size_z: files.len(),
                    },
                );
            }
            if let Some(image) = images.get_mut(id) {
                image.channels.push(channel.clone());
            }
        }
        Ok(images.into_values().collect())
    }

    fn fetch_pixels(&self, image: &ImageRef, channel: &str) -> Result<Pixels, SourceError> {
        let well_dir = self.well_dir(image.well_id)?;
        let index = self.discover_tiffs(&well_dir)?;
        let files = index
            .get(&(image.id, channel.to_string()))
            .ok_or_else(|| SourceError::NotFound(format!("image {} channel {}", image.id, channel)))?;

        if files.len() == 1 {
            return Ok(Pixels::Plane(read_tiff_plane(&files[0].1)?));
        }
        let planes = files
            .iter()
            .map(|(_, p)| read_tiff_plane(p))
            .collect::<Result<Vec<_>, _>>()?;
        let (h, w) = planes[0].dim();
        if planes.iter().any(|p| p.dim() != (h, w)) {
            return Err(SourceError::NotFound(format!(
                "image {} channel {}: z-planes differ in size",
                image.id, channel
            )));
        }
        let data: Vec<f32> = planes.into_iter().flat_map(|p| p.into_iter()).collect();
        let stack = Array3::from_shape_vec((files.len(), h, w), data)
            .map_err(|e| SourceError::NotFound(e.to_string()))?;
        Ok(Pixels::Stack(stack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExperimentInfo, WellMetadata};
    use std::io::BufWriter;
    use tiff::encoder::{colortype::Gray16, TiffEncoder};

    fn write_tiff(path: &Path, w: u32, h: u32, value: u16) {
        let file = fs::File::create(path).unwrap();
        let mut enc = TiffEncoder::new(BufWriter::new(file)).unwrap();
        let data = vec![value; (w * h) as usize];
        enc.write_image::<Gray16>(w, h, &data).unwrap();
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let plate_dir = dir.path().join("plate_7");
        let well_dir = plate_dir.join("well_70");
        fs::create_dir_all(&well_dir).unwrap();
        let plate = PlateMetadata {
            id: 7,
            name: "plate seven".into(),
            experiment: ExperimentInfo {
                name: "exp".into(),
                owner: "lab".into(),
            },
            rows: 8,
            columns: 12,
            channels: vec!["DAPI".into(), "Tub".into()],
            wells: vec![WellMetadata {
                id: 70,
                row: 0,
                column: 0,
                conditions: Default::default(),
            }],
        };
        fs::write(plate_dir.join("plate.json"), serde_json::to_string(&plate).unwrap()).unwrap();
        write_tiff(&well_dir.join("image700_DAPI_z0.tif"), 4, 3, 10);
        write_tiff(&well_dir.join("image700_Tub_z0.tif"), 4, 3, 20);
        write_tiff(&well_dir.join("image700_Tub_z1.tif"), 4, 3, 30);
        fs::write(well_dir.join("notes.txt"), "ignored").unwrap();
        dir
    }

    #[test]
    fn enumerates_plate_and_images() {
        let dir = fixture();
        let source = TiffDirSource::open(dir.path()).unwrap();
        let plate = source.fetch_plate(7).unwrap();
        assert_eq!(plate.wells.len(), 1);

        let images = source.fetch_images(70).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, 700);
        assert_eq!(images[0].channels, vec!["DAPI".to_string(), "Tub".to_string()]);
        assert_eq!((images[0].size_y, images[0].size_x), (3, 4));
    }

    #[test]
    fn reads_planes_and_stacks() {
        let dir = fixture();
        let source = TiffDirSource::open(dir.path()).unwrap();
        let image = source.fetch_images(70).unwrap().remove(0);

        let dapi = source.fetch_pixels(&image, "DAPI").unwrap();
        assert!(matches!(dapi, Pixels::Plane(_)));
        let tub = source.fetch_pixels(&image, "Tub").unwrap();
        assert!(matches!(tub, Pixels::Stack(_)));
        assert!(tub.into_plane().iter().all(|&v| v == 30.0));
    }

    #[test]
    fn missing_objects_are_not_found() {
        let dir = fixture();
        let source = TiffDirSource::open(dir.path()).unwrap();
        assert!(matches!(source.fetch_plate(8), Err(SourceError::NotFound(_))));
        assert!(matches!(source.fetch_images(71), Err(SourceError::NotFound(_))));
        let image = source.fetch_images(70).unwrap().remove(0);
        assert!(matches!(
            source.fetch_pixels(&image, "GFP"),
            Err(SourceError::NotFound(_))
        ));
    }

    #[test]
    fn corrupt_image_is_left_out_of_the_well() {
        let dir = fixture();
        let well_dir = dir.path().join("plate_7").join("well_70");
        fs::write(well_dir.join("image701_DAPI_z0.tif"), b"not a tiff at all").unwrap();
        write_tiff(&well_dir.join("image701_Tub_z0.tif"), 4, 3, 5);
        let source = TiffDirSource::open(dir.path()).unwrap();

        let images = source.fetch_images(70).unwrap();
        assert_eq!(images.iter().map(|i| i.id).collect::<Vec<_>>(), vec![700]);
    }

    #[test]
    fn dimensions_come_from_the_header() {
        let dir = fixture();
        let path = dir.path().join("plate_7").join("well_70").join("image700_DAPI_z0.tif");
        assert_eq!(read_tiff_dimensions(&path).unwrap(), (3, 4));
    }

    #[test]
    fn unreachable_root_is_unavailable() {
        let err = TiffDirSource::open("/definitely/not/here").err().unwrap();
        assert!(err.is_retryable());
    }
}

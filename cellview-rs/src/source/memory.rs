//! In-process image source. Used by tests and by embedders that already
//! hold pixel data in memory.

use ndarray::Array2;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{ImageSource, Pixels};
use crate::error::SourceError;
use crate::model::{ImageId, ImageRef, PlateId, PlateMetadata, WellId};

#[derive(Default)]
pub struct MemorySource {
    plates: HashMap<PlateId, PlateMetadata>,
    images: BTreeMap<WellId, Vec<ImageRef>>,
    pixels: HashMap<(ImageId, String), Pixels>,
    /// Remaining injected `Unavailable` failures per image.
    flaky: Mutex<HashMap<ImageId, usize>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_plate(&mut self, plate: PlateMetadata) {
        for well in &plate.wells {
            self.images.entry(well.id).or_default();
        }
        self.plates.insert(plate.id, plate);
    }

    /// Add an image with one plane per channel. The image's channel list and
    /// dimensions are taken from `planes`.
    pub fn add_image(
        &mut self,
        id: ImageId,
        well_id: WellId,
        planes: Vec<(&str, Array2<f32>)>,
    ) -> ImageRef {
        let (size_y, size_x) = planes.first().map(|(_, p)| p.dim()).unwrap_or((0, 0));
        let image = ImageRef {
            id,
            well_id,
            name: format!("image{}", id),
            channels: planes.iter().map(|(c, _)| c.to_string()).collect(),
            size_y,
            size_x,
            size_z: 1,
        };
        for (channel, plane) in planes {
            self.pixels.insert((id, channel.to_string()), Pixels::Plane(plane));
        }
        self.images.entry(well_id).or_default().push(image.clone());
        image
    }

    /// Replace a channel with a z-stack.
    pub fn set_pixels(&mut self, image_id: ImageId, channel: &str, pixels: Pixels) {
        self.pixels.insert((image_id, channel.to_string()), pixels);
    }

    /// The next `failures` pixel fetches for this image report `Unavailable`.
    pub fn fail_transiently(&self, image_id: ImageId, failures: usize) {
        if let Ok(mut flaky) = self.flaky.lock() {
            flaky.insert(image_id, failures);
        }
    }

    /// Drop one channel's pixels while the image stays listed.
    pub fn remove_channel(&mut self, image_id: ImageId, channel: &str) {
        self.pixels.remove(&(image_id, channel.to_string()));
    }

    pub fn remove_image(&mut self, image_id: ImageId) {
        for images in self.images.values_mut() {
            images.retain(|i| i.id != image_id);
        }
        self.pixels.retain(|(id, _), _| *id != image_id);
    }
}

impl ImageSource for MemorySource {
    fn fetch_plate(&self, plate_id: PlateId) -> Result<PlateMetadata, SourceError> {
        self.plates
            .get(&plate_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("plate {}", plate_id)))
    }

    fn fetch_images(&self, well_id: WellId) -> Result<Vec<ImageRef>, SourceError> {
        self.images
            .get(&well_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("well {}", well_id)))
    }

    fn fetch_pixels(&self, image: &ImageRef, channel: &str) -> Result<Pixels, SourceError> {
        {
            let mut flaky = self
                .flaky
                .lock()
                .map_err(|_| SourceError::Unavailable("memory source lock poisoned".into()))?;
            if let Some(left) = flaky.get_mut(&image.id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(SourceError::Unavailable(format!(
                        "injected failure for image {}",
                        image.id
                    )));
                }
            }
        }
        self.pixels
            .get(&(image.id, channel.to_string()))
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("image {} channel {}", image.id, channel)))
    }
}

//! Image source boundary: plate/well/image enumeration and pixel retrieval.
//!
//! Adapters hold no state across calls beyond their connection handle.

pub mod memory;
pub mod tiff_dir;
pub mod timeout;

use ndarray::{Array2, Array3, Axis};

use crate::error::SourceError;
use crate::model::{ImageRef, PlateId, PlateMetadata, WellId};

pub use memory::MemorySource;
pub use tiff_dir::TiffDirSource;
pub use timeout::TimedSource;

/// Pixel data for one channel of one image.
#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    /// (y, x)
    Plane(Array2<f32>),
    /// (z, y, x)
    Stack(Array3<f32>),
}

impl Pixels {
    /// Reduce to a single plane; z-stacks become their maximum-intensity projection.
    pub fn into_plane(self) -> Array2<f32> {
        match self {
            Pixels::Plane(p) => p,
            Pixels::Stack(s) => s.fold_axis(Axis(0), f32::NEG_INFINITY, |&acc, &v| acc.max(v)),
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        match self {
            Pixels::Plane(p) => p.dim(),
            Pixels::Stack(s) => {
                let (_, h, w) = s.dim();
                (h, w)
            }
        }
    }
}

pub trait ImageSource: Send + Sync {
    fn fetch_plate(&self, plate_id: PlateId) -> Result<PlateMetadata, SourceError>;

    fn fetch_images(&self, well_id: WellId) -> Result<Vec<ImageRef>, SourceError>;

    fn fetch_pixels(&self, image: &ImageRef, channel: &str) -> Result<Pixels, SourceError>;
}

impl<S: ImageSource + ?Sized> ImageSource for std::sync::Arc<S> {
    fn fetch_plate(&self, plate_id: PlateId) -> Result<PlateMetadata, SourceError> {
        (**self).fetch_plate(plate_id)
    }

    fn fetch_images(&self, well_id: WellId) -> Result<Vec<ImageRef>, SourceError> {
        (**self).fetch_images(well_id)
    }

    fn fetch_pixels(&self, image: &ImageRef, channel: &str) -> Result<Pixels, SourceError> {
        (**self).fetch_pixels(image, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn stack_projects_to_max() {
        let stack = Array3::from_shape_vec((2, 2, 2), vec![1.0, 5.0, 3.0, 0.0, 4.0, 2.0, 3.0, 7.0])
            .unwrap();
        let px = Pixels::Stack(stack);
        assert_eq!(px.dims(), (2, 2));
        assert_eq!(px.into_plane(), array![[4.0, 5.0], [3.0, 7.0]]);
    }
}

//! Zarr v3 cache of label masks, one `u32` array per image.
//!
//! Layout: `/masks/<image_id>` holds committed nuclear masks and
//! `/masks/<image_id>_cell` cell masks, `/staging/` holds
//! masks being written. A mask is written completely under `staging/` and
//! then renamed into `masks/`, so readers see a whole mask or none.

use ndarray::Array2;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zarrs::array::{data_type, Array, ArrayBuilder};
use zarrs::config::MetadataRetrieveVersion;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::GroupBuilder;
use zarrs::storage::ReadableWritableListableStorageTraits;

use crate::error::MaskCacheError;
use crate::model::{Compartment, ImageId};
use crate::segment::LabelMask;

type Store = Arc<dyn ReadableWritableListableStorageTraits>;

static NONCE: AtomicU64 = AtomicU64::new(0);

fn zarr_err(e: impl std::fmt::Display) -> MaskCacheError {
    MaskCacheError::Zarr(e.to_string())
}

pub struct MaskCache {
    root: PathBuf,
    store: Store,
}

impl MaskCache {
    /// Open or create the cache rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, MaskCacheError> {
        fs::create_dir_all(root)?;
        let store: Store = Arc::new(FilesystemStore::new(root).map_err(zarr_err)?);
        for path in ["/", "/masks", "/staging"] {
            let group = GroupBuilder::new().build(store.clone(), path).map_err(zarr_err)?;
            group.store_metadata().map_err(zarr_err)?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            store,
        })
    }

    fn mask_name(image_id: ImageId, compartment: Compartment) -> String {
        match compartment {
            Compartment::Nucleus => image_id.to_string(),
            other => format!("{}_{}", image_id, other.suffix()),
        }
    }

    fn mask_dir(&self, image_id: ImageId, compartment: Compartment) -> PathBuf {
        self.root.join("masks").join(Self::mask_name(image_id, compartment))
    }

    /// Cached mask for `image_id`, if one exists for this model and shape.
    pub fn load(
        &self,
        image_id: ImageId,
        compartment: Compartment,
        model_tag: &str,
        dims: (usize, usize),
    ) -> Result<Option<Array2<u32>>, MaskCacheError> {
        if !self.mask_dir(image_id, compartment).exists() {
            return Ok(None);
        }
        let path = format!("/masks/{}", Self::mask_name(image_id, compartment));
        let array = Array::open_opt(self.store.clone(), &path, &MetadataRetrieveVersion::V3).map_err(zarr_err)?;

        let tag = array.attributes().get("model").and_then(|v| v.as_str());
        if tag != Some(model_tag) {
            tracing::debug!(image_id, cached = ?tag, model = model_tag, "mask cache miss: model changed");
            return Ok(None);
        }
        if array.shape() != [dims.0 as u64, dims.1 as u64] {
            return Ok(None);
        }

        let data = array.retrieve_chunk::<Vec<u32>>(&[0, 0]).map_err(zarr_err)?;
        let labels = Array2::from_shape_vec(dims, data).map_err(zarr_err)?;
        Ok(Some(labels))
    }

    /// Write `mask` for `image_id`, replacing any earlier one.
    pub fn store(&self, image_id: ImageId, compartment: Compartment, mask: &LabelMask) -> Result<(), MaskCacheError> {
        let (h, w) = mask.labels.dim();
        if h == 0 || w == 0 {
            return Ok(());
        }
        let staged = format!(
            "{}-{}-{}",
            Self::mask_name(image_id, compartment),
            std::process::id(),
            NONCE.fetch_add(1, Ordering::Relaxed)
        );

        let mut attrs = serde_json::Map::new();
        attrs.insert("model".to_string(), serde_json::Value::String(mask.model_tag.clone()));
        attrs.insert("image_id".to_string(), serde_json::Value::from(image_id));
        let shape = vec![h as u64, w as u64];
        let mut builder = ArrayBuilder::new(shape.clone(), shape, data_type::uint32(), 0u32);
        builder.attributes(attrs);
        let array = builder
            .build(self.store.clone(), &format!("/staging/{}", staged))
            .map_err(zarr_err)?;
        array.store_metadata().map_err(zarr_err)?;
        let data: Vec<u32> = mask.labels.iter().copied().collect();
        array.store_chunk(&[0, 0], data.as_slice()).map_err(zarr_err)?;

        let target = self.mask_dir(image_id, compartment);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(self.root.join("staging").join(&staged), &target)?;
        tracing::debug!(image_id, compartment = compartment.suffix(), "cached mask");
        Ok(())
    }
}

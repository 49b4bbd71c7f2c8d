//! Segmentation engine: pooled model instances plus backend-independent
//! mask post-processing.

#[cfg(feature = "cellpose")]
pub mod cellpose;
pub mod labels;
pub mod threshold;

use crossbeam_channel::{Receiver, Sender};
use ndarray::{Array2, ArrayView2};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use crate::config::{Backend, SegmentationConfig};
use crate::error::SegmentationError;
use crate::model::ImageId;

pub use threshold::ThresholdSegmenter;

pub struct SegmentationInput<'a> {
    /// Nuclear channel.
    pub primary: ArrayView2<'a, f32>,
    /// Optional cytoplasm channel, same shape as `primary`.
    pub secondary: Option<ArrayView2<'a, f32>>,
}

/// Raw backend output: any integer labelling, 0 = background.
pub type SegmentResult = Result<Array2<u32>, Box<dyn std::error::Error + Send + Sync>>;

/// One loaded model instance. Not shared between threads while running.
pub trait Segmenter: Send {
    fn segment(&mut self, input: &SegmentationInput<'_>) -> SegmentResult;
}

/// Creates model instances at run start.
pub trait ModelLoader: Send + Sync {
    fn load(&self, config: &SegmentationConfig) -> Result<Box<dyn Segmenter>, SegmentationError>;
}

/// Picks the backend named in the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultModelLoader;

impl ModelLoader for DefaultModelLoader {
    fn load(&self, config: &SegmentationConfig) -> Result<Box<dyn Segmenter>, SegmentationError> {
        match &config.model.backend {
            Backend::Threshold { threshold } => Ok(Box::new(ThresholdSegmenter::new(*threshold))),
            #[cfg(feature = "cellpose")]
            Backend::Cellpose { path, batch_size } => Ok(Box::new(cellpose::CellposeSegmenter::load(
                path,
                config.cpu,
                *batch_size,
            )?)),
            #[cfg(not(feature = "cellpose"))]
            Backend::Cellpose { .. } => Err(SegmentationError::ModelUnavailable(
                "built without the cellpose feature".into(),
            )),
        }
    }
}

/// Final mask: labels `1..=n`, each one 4-connected region.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMask {
    pub labels: Array2<u32>,
    pub model_tag: String,
}

impl LabelMask {
    pub fn object_count(&self) -> usize {
        labels::object_count(&self.labels)
    }
}

/// Model instances for one run, one per device.
pub struct SegmentationEngine {
    slots: Vec<Mutex<Box<dyn Segmenter>>>,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    min_object_size: usize,
    model_tag: String,
}

/// Returns the device to the queue when dropped.
struct Checkout<'a> {
    engine: &'a SegmentationEngine,
    slot: usize,
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        // The receiver lives as long as the engine, so this cannot fail.
        let _ = self.engine.free_tx.send(self.slot);
    }
}

impl SegmentationEngine {
    pub fn acquire(loader: &dyn ModelLoader, config: &SegmentationConfig) -> Result<Self, SegmentationError> {
        let devices = config.devices.max(1);
        let (free_tx, free_rx) = crossbeam_channel::bounded(devices);
        let mut slots = Vec::with_capacity(devices);
        for slot in 0..devices {
            slots.push(Mutex::new(loader.load(config)?));
            free_tx
                .send(slot)
                .map_err(|e| SegmentationError::ModelUnavailable(e.to_string()))?;
        }
        let model_tag = config.model.tag();
        tracing::info!(devices, model = %model_tag, "segmentation engine ready");
        Ok(Self {
            slots,
            free_tx,
            free_rx,
            min_object_size: config.min_object_size,
            model_tag,
        })
    }

    pub fn model_tag(&self) -> &str {
        &self.model_tag
    }

    pub fn devices(&self) -> usize {
        self.slots.len()
    }

    /// Blocks until a device is free. Zero objects is a valid result.
    pub fn segment(
        &self,
        image_id: ImageId,
        primary: ArrayView2<'_, f32>,
        secondary: Option<ArrayView2<'_, f32>>,
    ) -> Result<LabelMask, SegmentationError> {
        let failed = |cause: String| SegmentationError::Failed { image_id, cause };

        if let Some(s) = &secondary {
            if s.dim() != primary.dim() {
                return Err(failed(format!(
                    "channel shapes differ: {:?} vs {:?}",
                    primary.dim(),
                    s.dim()
                )));
            }
        }
        if primary.iter().chain(secondary.iter().flat_map(|s| s.iter())).any(|v| !v.is_finite()) {
            return Err(failed("input contains non-finite intensities".into()));
        }

        let slot = self.free_rx.recv().map_err(|e| failed(e.to_string()))?;
        let checkout = Checkout { engine: self, slot };
        let input = SegmentationInput { primary, secondary };
        let raw = {
            let mut model = self.slots[checkout.slot]
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            catch_unwind(AssertUnwindSafe(|| model.segment(&input)))
        };
        drop(checkout);

        let raw = match raw {
            Ok(Ok(mask)) => mask,
            Ok(Err(e)) => return Err(failed(e.to_string())),
            Err(_) => return Err(failed("segmentation backend panicked".into())),
        };
        if raw.dim() != input.primary.dim() {
            return Err(failed(format!(
                "mask shape {:?} does not match image shape {:?}",
                raw.dim(),
                input.primary.dim()
            )));
        }

        let labels = labels::finalize(&raw, self.min_object_size);
        tracing::debug!(image_id, objects = labels::object_count(&labels), "segmented");
        Ok(LabelMask {
            labels,
            model_tag: self.model_tag.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    struct Fixed(Array2<u32>);

    impl Segmenter for Fixed {
        fn segment(&mut self, _input: &SegmentationInput<'_>) -> SegmentResult {
            Ok(self.0.clone())
        }
    }

    struct FixedLoader(Array2<u32>);

    impl ModelLoader for FixedLoader {
        fn load(&self, _config: &SegmentationConfig) -> Result<Box<dyn Segmenter>, SegmentationError> {
            Ok(Box::new(Fixed(self.0.clone())))
        }
    }

    /// Records the highest number of concurrent calls.
    struct Counting {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Segmenter for Counting {
        fn segment(&mut self, input: &SegmentationInput<'_>) -> SegmentResult {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Array2::zeros(input.primary.dim()))
        }
    }

    struct CountingLoader {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl ModelLoader for CountingLoader {
        fn load(&self, _config: &SegmentationConfig) -> Result<Box<dyn Segmenter>, SegmentationError> {
            Ok(Box::new(Counting {
                active: self.active.clone(),
                peak: self.peak.clone(),
            }))
        }
    }

    #[test]
    fn post_processes_backend_output() {
        // Label 7 has two fragments, label 3 is below the size limit.
        let raw = ndarray::array![
            [7, 7, 0, 0, 7],
            [7, 7, 0, 0, 7],
            [0, 0, 0, 0, 7],
            [3, 0, 5, 5, 0],
            [0, 0, 5, 5, 0],
        ];
        let cfg = SegmentationConfig {
            min_object_size: 2,
            ..Default::default()
        };
        let engine = SegmentationEngine::acquire(&FixedLoader(raw), &cfg).unwrap();
        let img = Array2::<f32>::zeros((5, 5));
        let mask = engine.segment(1, img.view(), None).unwrap();
        assert_eq!(mask.object_count(), 3);
        assert_eq!(mask.model_tag, "threshold:otsu-1");
        assert_eq!(mask.labels[[3, 0]], 0);
        assert_eq!(mask.labels[[3, 2]], 1);
        assert_eq!(mask.labels[[0, 0]], 2);
        assert_eq!(mask.labels[[0, 4]], 3);
    }

    #[test]
    fn rejects_wrong_mask_shape_and_non_finite_input() {
        let engine = SegmentationEngine::acquire(&FixedLoader(Array2::zeros((2, 2))), &Default::default()).unwrap();
        let img = Array2::<f32>::zeros((3, 3));
        assert!(matches!(
            engine.segment(9, img.view(), None),
            Err(SegmentationError::Failed { image_id: 9, .. })
        ));

        let mut img = Array2::<f32>::zeros((2, 2));
        img[[1, 1]] = f32::INFINITY;
        assert!(engine.segment(9, img.view(), None).is_err());
    }

    #[test]
    fn mismatched_secondary_channel_fails() {
        let engine = SegmentationEngine::acquire(&FixedLoader(Array2::zeros((2, 2))), &Default::default()).unwrap();
        let a = Array2::<f32>::zeros((2, 2));
        let b = Array2::<f32>::zeros((2, 3));
        assert!(engine.segment(1, a.view(), Some(b.view())).is_err());
    }

    #[test]
    fn concurrency_bounded_by_devices() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let loader = CountingLoader {
            active: active.clone(),
            peak: peak.clone(),
        };
        let cfg = SegmentationConfig {
            devices: 2,
            ..Default::default()
        };
        let engine = SegmentationEngine::acquire(&loader, &cfg).unwrap();
        assert_eq!(engine.devices(), 2);
        let img = Array2::<f32>::zeros((4, 4));
        thread::scope(|s| {
            for i in 0..8 {
                let engine = &engine;
                let img = &img;
                s.spawn(move || engine.segment(i, img.view(), None).unwrap());
            }
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_loader_builds_threshold_backend() {
        let engine = SegmentationEngine::acquire(&DefaultModelLoader, &Default::default()).unwrap();
        let mut img = Array2::<f32>::zeros((8, 8));
        for y in 2..6 {
            for x in 2..6 {
                img[[y, x]] = 100.0;
            }
        }
        let mask = engine.segment(1, img.view(), None).unwrap();
        assert_eq!(mask.object_count(), 1);
    }
}

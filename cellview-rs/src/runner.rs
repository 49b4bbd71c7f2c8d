//! Run aggregator: drives every image of a plate through source,
//! segmentation, extraction and the quality gate, and commits the rows.
//!
//! Images are independent units of work on a rayon pool. Per-image and
//! per-well failures end up in the summary; only configuration errors,
//! plate enumeration and an unusable store at start abort a run.
//!
//! With flatfield correction on, the per-channel masks are estimated from
//! a sample of the plate's images before any image is processed.

use chrono::Utc;
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::cellview::{CellViewStore, ImageCommit, RunRecord, StoredStatus};
use crate::config::RunConfig;
use crate::error::{ConfigError, ImageError, RunError, SourceError, StorageError};
use crate::features::{FeatureExtractor, FeatureRegistry};
use crate::flatfield::{FlatfieldConfig, FlatfieldMasks};
use crate::mask_cache::MaskCache;
use crate::model::{parse_well_name, Compartment, ImageId, ImageKeys, ImageRef, PlateId, WellMetadata};
use crate::segment::{LabelMask, ModelLoader, SegmentationEngine};
use crate::source::ImageSource;

/// Shared flag; once set, no new image starts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Succeeded in an earlier run and `force` is off.
    AlreadyProcessed,
    NotFound(String),
    Cancelled,
}

/// Terminal state of one image in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageStatus {
    Succeeded { rows: usize },
    Skipped { reason: SkipReason },
    Failed { error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WellCount {
    /// Images that succeeded in this run.
    pub images: usize,
    /// Rows committed in this run.
    pub objects: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFailure {
    pub image_id: ImageId,
    pub well: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSkip {
    pub image_id: ImageId,
    pub well: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellFailure {
    pub well: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub plate_id: PlateId,
    pub model_tag: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_rows: usize,
    pub cancelled: bool,
    pub wells: BTreeMap<String, WellCount>,
    pub failures: Vec<ImageFailure>,
    pub skips: Vec<ImageSkip>,
    /// Wells whose images could not be enumerated or registered.
    pub failed_wells: Vec<WellFailure>,
    pub images: BTreeMap<ImageId, ImageStatus>,
}

struct ImageTask {
    image: ImageRef,
    well: String,
    keys: ImageKeys,
}

/// Channels an image needs: the measured ones plus the segmentation inputs.
fn required_channels<'c>(config: &'c RunConfig, image: &'c ImageRef) -> Vec<&'c String> {
    let seg = &config.segmentation;
    let measured = if config.features.channels.is_empty() {
        &image.channels
    } else {
        &config.features.channels
    };
    let mut channels: Vec<&String> = Vec::new();
    for channel in measured
        .iter()
        .chain(std::iter::once(&seg.nuclear_channel))
        .chain(seg.cyto_channel.as_ref())
    {
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    channels
}

/// `count` indices spread evenly over `0..len`.
fn sample_indices(len: usize, count: usize) -> Vec<usize> {
    let n = count.min(len);
    (0..n).map(|i| i * len / n).collect()
}

/// Retry `f` on `Unavailable` with linear backoff.
fn with_source_retry<T>(
    retries: u32,
    backoff: Duration,
    mut f: impl FnMut() -> Result<T, SourceError>,
) -> Result<T, SourceError> {
    let mut attempt = 0;
    loop {
        match f() {
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "source unavailable, retrying");
                thread::sleep(backoff * attempt);
            }
            other => return other,
        }
    }
}

pub struct RunAggregator<'a> {
    source: &'a dyn ImageSource,
    store: &'a CellViewStore,
    loader: &'a dyn ModelLoader,
    registry: FeatureRegistry,
}

impl<'a> RunAggregator<'a> {
    pub fn new(source: &'a dyn ImageSource, store: &'a CellViewStore, loader: &'a dyn ModelLoader) -> Self {
        Self {
            source,
            store,
            loader,
            registry: FeatureRegistry::builtin(),
        }
    }

    /// Use a registry with custom features.
    pub fn with_registry(mut self, registry: FeatureRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn run(
        &self,
        plate_id: PlateId,
        config: &RunConfig,
        cancel: &CancelToken,
        progress: impl Fn(f64, &str) + Sync,
    ) -> Result<RunSummary, RunError> {
        config.validate(&self.registry)?;
        let extractor = FeatureExtractor::new(&self.registry, &config.features)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("worker pool: {e}")))?;
        let mask_cache = match &config.segmentation.mask_cache {
            Some(path) => Some(MaskCache::open(path).map_err(|e| ConfigError::Invalid(format!("mask cache: {e}")))?),
            None => None,
        };
        // Model instances live for this run only.
        let engine = SegmentationEngine::acquire(self.loader, &config.segmentation).map_err(ConfigError::from)?;
        let cell_engine = match config.segmentation.cell_segmentation() {
            Some(cell_config) => Some(SegmentationEngine::acquire(self.loader, &cell_config).map_err(ConfigError::from)?),
            None => None,
        };
        let model_tag = match &cell_engine {
            Some(cells) => format!("{}+{}", engine.model_tag(), cells.model_tag()),
            None => engine.model_tag().to_string(),
        };
        let started_at = Utc::now();

        progress(0.0, "Enumerating plate");
        let retries = config.source.retries;
        let backoff = Duration::from_millis(config.source.backoff_ms);
        let plate = with_source_retry(retries, backoff, || self.source.fetch_plate(plate_id))?;
        tracing::info!(plate_id, wells = plate.wells.len(), model = %model_tag, "starting run");

        let experiment_id = self.store.ensure_experiment(&plate.experiment)?;
        self.store.ensure_plate(experiment_id, &plate)?;

        let wanted: Option<BTreeSet<(u32, u32)>> = config
            .wells
            .as_ref()
            .map(|names| names.iter().filter_map(|n| parse_well_name(n)).collect());
        let wells: Vec<&WellMetadata> = plate
            .wells
            .iter()
            .filter(|w| wanted.as_ref().map_or(true, |set| set.contains(&(w.row, w.column))))
            .collect();

        let mut summary = RunSummary {
            plate_id,
            model_tag: model_tag.clone(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            total_rows: 0,
            cancelled: false,
            wells: BTreeMap::new(),
            failures: Vec::new(),
            skips: Vec::new(),
            failed_wells: Vec::new(),
            images: BTreeMap::new(),
        };

        let mut tasks = Vec::new();
        for well in wells {
            let name = well.name();
            summary.wells.insert(name.clone(), WellCount::default());
            let registered = self
                .store
                .ensure_well(plate_id, well)
                .map_err(|e| e.to_string())
                .and_then(|_| {
                    with_source_retry(retries, backoff, || self.source.fetch_images(well.id)).map_err(|e| e.to_string())
                })
                .and_then(|images| {
                    self.store
                        .register_images(&images)
                        .map(|_| images)
                        .map_err(|e| e.to_string())
                });
            let images = match registered {
                Ok(images) => images,
                Err(error) => {
                    tracing::warn!(well = %name, %error, "cannot enumerate well");
                    summary.failed_wells.push(WellFailure { well: name, error });
                    continue;
                }
            };
            for image in images {
                let keys = ImageKeys {
                    experiment_id,
                    plate_id,
                    well_id: well.id,
                    image_id: image.id,
                };
                tasks.push(ImageTask {
                    image,
                    well: name.clone(),
                    keys,
                });
            }
        }

        let states = self.store.image_states(plate_id)?;
        let pending = |t: &ImageTask| {
            config.force
                || states
                    .get(&t.image.id)
                    .map_or(true, |s| s.status != StoredStatus::Succeeded)
        };
        // Sampled from the whole plate so resumed runs see the same masks.
        let flatfield = match &config.flatfield {
            Some(ff) if tasks.iter().any(pending) && !cancel.is_cancelled() => {
                progress(0.0, "Estimating flatfield");
                self.estimate_flatfield(config, ff, &tasks)?
            }
            _ => FlatfieldMasks::default(),
        };
        let (todo, done): (Vec<ImageTask>, Vec<ImageTask>) = tasks.into_iter().partition(|t| pending(t));
        let mut outcomes: Vec<(ImageTask, ImageStatus)> = done
            .into_iter()
            .map(|t| {
                (
                    t,
                    ImageStatus::Skipped {
                        reason: SkipReason::AlreadyProcessed,
                    },
                )
            })
            .collect();

        let total = todo.len();
        let finished = AtomicUsize::new(0);
        let ctx = ImageContext {
            config,
            engine: &engine,
            cell_engine: cell_engine.as_ref(),
            model_tag: &model_tag,
            extractor: &extractor,
            flatfield: &flatfield,
            mask_cache: mask_cache.as_ref(),
        };
        let processed: Vec<(ImageTask, ImageStatus)> = pool.install(|| {
            todo.into_par_iter()
                .map(|task| {
                    if cancel.is_cancelled() {
                        return (
                            task,
                            ImageStatus::Skipped {
                                reason: SkipReason::Cancelled,
                            },
                        );
                    }
                    let status = self.image_status(&ctx, &task);
                    let n = finished.fetch_add(1, Ordering::SeqCst) + 1;
                    progress(
                        n as f64 / total.max(1) as f64,
                        &format!("Processed image {} ({}/{})", task.image.id, n, total),
                    );
                    (task, status)
                })
                .collect()
        });
        outcomes.extend(processed);

        for (task, status) in outcomes {
            match &status {
                ImageStatus::Succeeded { rows } => {
                    summary.succeeded += 1;
                    summary.total_rows += rows;
                    let count = summary.wells.entry(task.well.clone()).or_default();
                    count.images += 1;
                    count.objects += rows;
                }
                ImageStatus::Skipped { reason } => {
                    summary.skipped += 1;
                    summary.skips.push(ImageSkip {
                        image_id: task.image.id,
                        well: task.well.clone(),
                        reason: reason.clone(),
                    });
                }
                ImageStatus::Failed { error } => {
                    summary.failed += 1;
                    summary.failures.push(ImageFailure {
                        image_id: task.image.id,
                        well: task.well.clone(),
                        error: error.clone(),
                    });
                }
            }
            summary.images.insert(task.image.id, status);
        }
        summary.failures.sort_by_key(|f| f.image_id);
        summary.skips.sort_by_key(|s| s.image_id);
        summary.cancelled = cancel.is_cancelled();

        self.record(&summary, started_at);
        tracing::info!(
            plate_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            rows = summary.total_rows,
            "run finished"
        );
        progress(1.0, "Done");
        Ok(summary)
    }

    /// Run history is best effort; the rows are already committed.
    fn record(&self, summary: &RunSummary, started_at: chrono::DateTime<Utc>) {
        let record = serde_json::to_value(summary).map(|value| RunRecord {
            id: None,
            plate_id: summary.plate_id,
            model_tag: summary.model_tag.clone(),
            started_at,
            finished_at: Utc::now(),
            succeeded: summary.succeeded,
            failed: summary.failed,
            skipped: summary.skipped,
            total_rows: summary.total_rows,
            cancelled: summary.cancelled,
            summary: value,
        });
        let result = match record {
            Ok(record) => self.store.record_run(&record).map(|_| ()),
            Err(e) => Err(StorageError::InvalidRow(e.to_string())),
        };
        if let Err(e) = result {
            tracing::warn!(plate_id = summary.plate_id, error = %e, "failed to record run");
        }
    }

    /// Flatfield masks from an evenly spaced sample of the plate's images.
    /// Images that cannot be fetched are left out of the sample.
    fn estimate_flatfield(
        &self,
        config: &RunConfig,
        flatfield: &FlatfieldConfig,
        tasks: &[ImageTask],
    ) -> Result<FlatfieldMasks, RunError> {
        let retries = config.source.retries;
        let backoff = Duration::from_millis(config.source.backoff_ms);
        let mut samples: BTreeMap<String, Vec<Array2<f32>>> = BTreeMap::new();
        for index in sample_indices(tasks.len(), flatfield.sample_images) {
            let image = &tasks[index].image;
            for channel in required_channels(config, image) {
                match with_source_retry(retries, backoff, || self.source.fetch_pixels(image, channel)) {
                    Ok(pixels) => {
                        let plane = pixels.into_plane();
                        let planes = samples.entry(channel.clone()).or_default();
                        match planes.first() {
                            Some(first) if first.dim() != plane.dim() => {
                                tracing::warn!(image_id = image.id, %channel, "flatfield sample has a different shape, skipped");
                            }
                            _ => planes.push(plane),
                        }
                    }
                    Err(e) => {
                        tracing::warn!(image_id = image.id, %channel, error = %e, "flatfield sample unavailable");
                    }
                }
            }
        }
        let masks = FlatfieldMasks::estimate(flatfield, &samples)
            .map_err(|e| ConfigError::Invalid(format!("flatfield: {e}")))?;
        tracing::info!(channels = masks.channels().count(), "flatfield masks ready");
        Ok(masks)
    }

    fn image_status(&self, ctx: &ImageContext<'_>, task: &ImageTask) -> ImageStatus {
        let image_id = task.image.id;
        match self.process_image(ctx, task) {
            Ok(rows) => ImageStatus::Succeeded { rows },
            Err(ImageError::Source(SourceError::NotFound(what))) => {
                tracing::warn!(image_id, %what, "image not found, skipping");
                ImageStatus::Skipped {
                    reason: SkipReason::NotFound(what),
                }
            }
            Err(e) => {
                tracing::warn!(image_id, error = %e, "image failed");
                ImageStatus::Failed { error: e.to_string() }
            }
        }
    }

    fn fetch_plane(&self, ctx: &ImageContext<'_>, image: &ImageRef, channel: &str) -> Result<Array2<f32>, SourceError> {
        let retries = ctx.config.source.retries;
        let backoff = Duration::from_millis(ctx.config.source.backoff_ms);
        with_source_retry(retries, backoff, || self.source.fetch_pixels(image, channel)).map(|p| p.into_plane())
    }

    fn process_image(&self, ctx: &ImageContext<'_>, task: &ImageTask) -> Result<usize, ImageError> {
        let config = ctx.config;
        let image = &task.image;
        let seg = &config.segmentation;

        let mut planes: BTreeMap<String, Array2<f32>> = BTreeMap::new();
        for channel in required_channels(config, image) {
            let mut plane = self.fetch_plane(ctx, image, channel)?;
            ctx.flatfield.apply(channel, &mut plane)?;
            planes.insert(channel.clone(), plane);
        }
        let nuclear = planes[&seg.nuclear_channel].view();
        let cyto = seg.cyto_channel.as_ref().map(|c| planes[c].view());

        let nuclei = self.label_mask(ctx, ctx.engine, Compartment::Nucleus, image.id, nuclear, None)?;
        let cells = match (ctx.cell_engine, cyto) {
            (Some(engine), Some(cyto)) => {
                Some(self.label_mask(ctx, engine, Compartment::Cell, image.id, nuclear, Some(cyto))?)
            }
            _ => None,
        };

        // Measure only the configured channels (or the image's own).
        let intensity: BTreeMap<String, Array2<f32>> = if config.features.channels.is_empty() {
            planes
                .iter()
                .filter(|(name, _)| image.channels.contains(*name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            planes
                .iter()
                .filter(|(name, _)| config.features.channels.contains(*name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let rows = match &cells {
            Some(cells) => ctx
                .extractor
                .extract_compartments(task.keys, &nuclei.labels, &cells.labels, &intensity)?,
            None => ctx.extractor.extract(task.keys, &nuclei.labels, &intensity)?,
        };
        let objects = rows.len();
        let gated = config.quality.apply(rows);
        let quality = config.quality.channel_quality(&intensity);
        let flags = config.quality.image_flags(&quality, gated.rows.len());
        tracing::debug!(
            image_id = image.id,
            objects,
            accepted = gated.accepted,
            flagged = gated.flagged,
            rejected = gated.rejected,
            "quality gate"
        );

        let commit = ImageCommit {
            image_id: image.id,
            rows: &gated.rows,
            model_tag: Some(ctx.model_tag),
            quality: Some(quality.as_slice()),
            image_flags: Some(flags.as_slice()),
        };
        let mut attempt = 0;
        loop {
            match self.store.commit_image(&commit) {
                Ok(()) => break,
                Err(e) if attempt < config.storage.retries => {
                    attempt += 1;
                    tracing::warn!(image_id = image.id, attempt, error = %e, "commit failed, retrying");
                    thread::sleep(config.storage.backoff() * attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(gated.rows.len())
    }

    /// Cached mask when valid, otherwise a fresh segmentation.
    fn label_mask(
        &self,
        ctx: &ImageContext<'_>,
        engine: &SegmentationEngine,
        compartment: Compartment,
        image_id: ImageId,
        nuclear: ArrayView2<'_, f32>,
        cyto: Option<ArrayView2<'_, f32>>,
    ) -> Result<LabelMask, ImageError> {
        let tag = engine.model_tag();
        if let (Some(cache), false) = (ctx.mask_cache, ctx.config.force) {
            match cache.load(image_id, compartment, tag, nuclear.dim()) {
                Ok(Some(labels)) => {
                    tracing::debug!(image_id, compartment = compartment.suffix(), "using cached mask");
                    return Ok(LabelMask {
                        labels,
                        model_tag: tag.to_string(),
                    });
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(image_id, error = %e, "mask cache read failed"),
            }
        }
        let mask = engine.segment(image_id, nuclear, cyto)?;
        if let Some(cache) = ctx.mask_cache {
            if let Err(e) = cache.store(image_id, compartment, &mask) {
                tracing::warn!(image_id, error = %e, "mask cache write failed");
            }
        }
        Ok(mask)
    }
}

struct ImageContext<'r> {
    config: &'r RunConfig,
    engine: &'r SegmentationEngine,
    /// Present when cells are segmented alongside nuclei.
    cell_engine: Option<&'r SegmentationEngine>,
    model_tag: &'r str,
    extractor: &'r FeatureExtractor,
    flatfield: &'r FlatfieldMasks,
    mask_cache: Option<&'r MaskCache>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retries_only_unavailable() {
        let calls = Cell::new(0);
        let result: Result<u32, SourceError> = with_source_retry(3, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(SourceError::Unavailable("timeout".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);

        calls.set(0);
        let result: Result<u32, SourceError> = with_source_retry(3, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(SourceError::NotFound("image 1".into()))
        });
        assert!(matches!(result, Err(SourceError::NotFound(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn gives_up_after_retries() {
        let calls = Cell::new(0);
        let result: Result<(), SourceError> = with_source_retry(2, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(SourceError::Unavailable("down".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn samples_are_spread_over_the_plate() {
        assert_eq!(sample_indices(10, 3), vec![0, 3, 6]);
        assert_eq!(sample_indices(2, 20), vec![0, 1]);
        assert!(sample_indices(0, 5).is_empty());
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn statuses_serialize_with_tags() {
        let v = serde_json::to_value(ImageStatus::Skipped {
            reason: SkipReason::NotFound("image 3".into()),
        })
        .unwrap();
        assert_eq!(
            v,
            serde_json::json!({"status": "skipped", "reason": {"reason": "not_found", "detail": "image 3"}})
        );
    }
}

//! Run configuration, loaded from JSON. Every section has defaults so a
//! partial file (or `{}`) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::features::FeatureRegistry;
use crate::flatfield::FlatfieldConfig;
use crate::model::parse_well_name;
use crate::quality::QualityGate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backend {
    /// Cellpose ONNX model directory containing `model.onnx`.
    Cellpose {
        path: PathBuf,
        #[serde(default = "default_batch_size")]
        batch_size: usize,
    },
    /// Global threshold; Otsu when `threshold` is unset.
    Threshold {
        #[serde(default)]
        threshold: Option<f32>,
    },
}

fn default_batch_size() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub backend: Backend,
    pub version: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Threshold { threshold: None },
            version: "otsu-1".to_string(),
        }
    }
}

impl ModelConfig {
    /// Version tag recorded with every mask and image result.
    pub fn tag(&self) -> String {
        let kind = match self.backend {
            Backend::Cellpose { .. } => "cellpose",
            Backend::Threshold { .. } => "threshold",
        };
        format!("{}:{}", kind, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub model: ModelConfig,
    pub nuclear_channel: String,
    /// When set, whole cells are segmented from this channel as well and
    /// features are measured per nucleus, cell and cytoplasm.
    pub cyto_channel: Option<String>,
    /// Model for the cell mask; the nuclear model when unset.
    pub cell_model: Option<ModelConfig>,
    /// Objects smaller than this many pixels are discarded.
    pub min_object_size: usize,
    /// Concurrent model instances (one per accelerator).
    pub devices: usize,
    pub cpu: bool,
    /// Zarr store for computed masks; disabled when unset.
    pub mask_cache: Option<PathBuf>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            nuclear_channel: "DAPI".to_string(),
            cyto_channel: None,
            cell_model: None,
            min_object_size: 10,
            devices: 1,
            cpu: false,
            mask_cache: None,
        }
    }
}

impl SegmentationConfig {
    pub fn compartments(&self) -> bool {
        self.cyto_channel.is_some()
    }

    /// Settings for the cell engine; `None` without a cytoplasm channel.
    pub fn cell_segmentation(&self) -> Option<SegmentationConfig> {
        self.cyto_channel.as_ref()?;
        Some(SegmentationConfig {
            model: self.cell_model.clone().unwrap_or_else(|| self.model.clone()),
            ..self.clone()
        })
    }
}

fn validate_model(model: &ModelConfig, section: &str) -> Result<(), ConfigError> {
    if model.version.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{}.version is empty", section)));
    }
    match &model.backend {
        Backend::Threshold { threshold: Some(t) } if !t.is_finite() => {
            Err(ConfigError::Invalid(format!("threshold {} is not finite", t)))
        }
        Backend::Cellpose { batch_size: 0, .. } => {
            Err(ConfigError::Invalid("cellpose batch_size must be at least 1".into()))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Intensity channels to measure; empty means every channel of the image.
    pub channels: Vec<String>,
    /// Feature names from the registry; empty means all registered features.
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub timeout_ms: u64,
    /// Extra attempts after an `Unavailable` failure.
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            retries: 2,
            backoff_ms: 500,
        }
    }
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Extra attempts after a failed image commit.
    pub retries: u32,
    /// Pause between commit attempts.
    pub backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retries: 1,
            backoff_ms: 200,
        }
    }
}

impl StorageConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub segmentation: SegmentationConfig,
    pub features: FeatureConfig,
    pub quality: QualityGate,
    pub workers: usize,
    /// Reprocess images that already succeeded.
    pub force: bool,
    pub source: SourceConfig,
    pub storage: StorageConfig,
    /// Illumination correction applied to every plane before segmentation;
    /// disabled when unset.
    pub flatfield: Option<FlatfieldConfig>,
    /// Restrict the run to these wells ("A1", "B03", ...).
    pub wells: Option<Vec<String>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            segmentation: SegmentationConfig::default(),
            features: FeatureConfig::default(),
            quality: QualityGate::default(),
            workers: 4,
            force: false,
            source: SourceConfig::default(),
            storage: StorageConfig::default(),
            flatfield: None,
            wells: None,
        }
    }
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Checks run before any image is touched.
    pub fn validate(&self, registry: &FeatureRegistry) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        let seg = &self.segmentation;
        if seg.devices == 0 {
            return Err(ConfigError::Invalid("segmentation.devices must be at least 1".into()));
        }
        if seg.nuclear_channel.trim().is_empty() {
            return Err(ConfigError::Invalid("segmentation.nuclear_channel is empty".into()));
        }
        validate_model(&seg.model, "segmentation.model")?;
        match (&seg.cyto_channel, &seg.cell_model) {
            (Some(cyto), _) if cyto.trim().is_empty() => {
                return Err(ConfigError::Invalid("segmentation.cyto_channel is empty".into()));
            }
            (None, Some(_)) => {
                return Err(ConfigError::Invalid(
                    "segmentation.cell_model requires segmentation.cyto_channel".into(),
                ));
            }
            (Some(_), Some(model)) => validate_model(model, "segmentation.cell_model")?,
            _ => {}
        }
        if let Some(flatfield) = &self.flatfield {
            flatfield.validate()?;
        }

        for name in &self.features.features {
            if !registry.contains(name) {
                return Err(ConfigError::Invalid(format!("unknown feature {}", name)));
            }
        }

        self.quality.validate()?;
        for rule in &self.quality.rules {
            if !registry.produces_column(
                &rule.feature,
                &self.features.features,
                &self.features.channels,
                seg.compartments(),
            ) {
                return Err(ConfigError::UnknownFeature(rule.feature.clone()));
            }
        }

        if let Some(wells) = &self.wells {
            for well in wells {
                if parse_well_name(well).is_none() {
                    return Err(ConfigError::Invalid(format!("malformed well name {:?}", well)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{Comparator, FailAction, QualityRule};

    #[test]
    fn empty_json_is_default() {
        let cfg: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RunConfig::default());
        cfg.validate(&FeatureRegistry::builtin()).unwrap();
    }

    #[test]
    fn parses_cellpose_backend() {
        let cfg: RunConfig = serde_json::from_str(
            r#"{
                "segmentation": {
                    "model": {"backend": {"type": "cellpose", "path": "/models/cpsam"}, "version": "cpsam-3"},
                    "min_object_size": 25
                },
                "quality": {"rules": [{"feature": "area", "op": ">=", "threshold": 30}], "on_fail": "reject"},
                "workers": 8,
                "force": true
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.segmentation.model.tag(), "cellpose:cpsam-3");
        assert_eq!(cfg.segmentation.min_object_size, 25);
        assert_eq!(cfg.segmentation.nuclear_channel, "DAPI");
        assert_eq!(cfg.quality.on_fail, FailAction::Reject);
        assert_eq!(cfg.quality.rules[0].op, Comparator::Ge);
        assert!(cfg.force);
        cfg.validate(&FeatureRegistry::builtin()).unwrap();
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = RunConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(&FeatureRegistry::builtin()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_rules_on_unmeasured_columns() {
        let mut cfg = RunConfig::default();
        cfg.features.channels = vec!["DAPI".into()];
        cfg.quality.rules.push(QualityRule {
            feature: "intensity_mean_EdU".into(),
            op: Comparator::Gt,
            threshold: 1.0,
        });
        assert!(matches!(
            cfg.validate(&FeatureRegistry::builtin()),
            Err(ConfigError::UnknownFeature(_))
        ));

        cfg.quality.rules[0].feature = "intensity_mean_DAPI".into();
        cfg.validate(&FeatureRegistry::builtin()).unwrap();
    }

    #[test]
    fn rejects_non_finite_thresholds_and_bad_wells() {
        let mut cfg = RunConfig::default();
        cfg.quality.rules.push(QualityRule {
            feature: "area".into(),
            op: Comparator::Lt,
            threshold: f64::NAN,
        });
        assert!(cfg.validate(&FeatureRegistry::builtin()).is_err());

        let cfg = RunConfig {
            wells: Some(vec!["A1".into(), "1A".into()]),
            ..Default::default()
        };
        assert!(cfg.validate(&FeatureRegistry::builtin()).is_err());
    }

    #[test]
    fn unknown_feature_names_fail() {
        let mut cfg = RunConfig::default();
        cfg.features.features = vec!["area".into(), "texture_haralick".into()];
        assert!(cfg.validate(&FeatureRegistry::builtin()).is_err());
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(RunConfig::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn compartment_rules_need_suffixed_columns() {
        let mut cfg = RunConfig::default();
        cfg.segmentation.cyto_channel = Some("Actin".into());
        cfg.quality.rules.push(QualityRule {
            feature: "area".into(),
            op: Comparator::Gt,
            threshold: 1.0,
        });
        assert!(matches!(
            cfg.validate(&FeatureRegistry::builtin()),
            Err(ConfigError::UnknownFeature(_))
        ));
        cfg.quality.rules[0].feature = "area_cell".into();
        cfg.validate(&FeatureRegistry::builtin()).unwrap();

        let cell = cfg.segmentation.cell_segmentation().unwrap();
        assert_eq!(cell.model, cfg.segmentation.model);
        assert!(RunConfig::default().segmentation.cell_segmentation().is_none());
    }

    #[test]
    fn cell_model_without_cyto_channel_is_rejected() {
        let mut cfg = RunConfig::default();
        cfg.segmentation.cell_model = Some(ModelConfig::default());
        assert!(cfg.validate(&FeatureRegistry::builtin()).is_err());
    }

    #[test]
    fn storage_backoff_is_separate_from_source_backoff() {
        let cfg: RunConfig =
            serde_json::from_str(r#"{"source": {"backoff_ms": 5000}, "storage": {"backoff_ms": 25}}"#).unwrap();
        assert_eq!(cfg.storage.backoff(), Duration::from_millis(25));
        assert_eq!(cfg.source.backoff_ms, 5000);
        assert_eq!(cfg.storage.retries, 1);
        assert_eq!(StorageConfig::default().backoff(), Duration::from_millis(200));
    }

    #[test]
    fn oversized_well_filters_are_rejected() {
        let cfg = RunConfig {
            wells: Some(vec!["AAAAAAAAAAAAAAAAAAAAAAAA1".into()]),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(&FeatureRegistry::builtin()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn parses_flatfield_section() {
        let cfg: RunConfig = serde_json::from_str(r#"{"flatfield": {"block_size": 32}}"#).unwrap();
        let ff = cfg.flatfield.as_ref().unwrap();
        assert_eq!(ff.block_size, 32);
        assert_eq!(ff.sample_images, 20);
        cfg.validate(&FeatureRegistry::builtin()).unwrap();
    }
}

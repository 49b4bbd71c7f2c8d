//! Quality gate: declarative object rules plus image-level sanity checks.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConfigError;
use crate::model::FeatureRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Lt => value < threshold,
            Comparator::Le => value <= threshold,
            Comparator::Gt => value > threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Eq => value == threshold,
            Comparator::Ne => value != threshold,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

/// A row passes when `row[feature] <op> threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRule {
    pub feature: String,
    pub op: Comparator,
    pub threshold: f64,
}

impl fmt::Display for QualityRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.feature, self.op.symbol(), self.threshold)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailAction {
    /// Keep the row and tag it with the failed rules.
    #[default]
    Flag,
    /// Drop the row.
    Reject,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept,
    Flag(Vec<String>),
    Reject(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGate {
    pub rules: Vec<QualityRule>,
    pub on_fail: FailAction,
    /// Reject objects touching the image border.
    pub exclude_border: bool,
    /// Pixel value considered saturated (65535 for 16-bit cameras).
    pub saturation_level: f32,
    /// Flag an image when a channel's saturated fraction exceeds this.
    pub max_saturated_fraction: Option<f64>,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            on_fail: FailAction::Flag,
            exclude_border: false,
            saturation_level: 65535.0,
            max_saturated_fraction: None,
        }
    }
}

/// Rows that survived the gate, plus counts for reporting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateOutcome {
    pub rows: Vec<FeatureRow>,
    pub accepted: usize,
    pub flagged: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelQuality {
    pub channel: String,
    /// Median of the finite pixels; NaN when there are none.
    pub intensity_median: f64,
    pub saturated_fraction: f64,
}

impl QualityGate {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.rules {
            if rule.feature.trim().is_empty() {
                return Err(ConfigError::Invalid("quality rule without feature".into()));
            }
            if !rule.threshold.is_finite() {
                return Err(ConfigError::Invalid(format!(
                    "quality rule {} has a non-finite threshold",
                    rule.feature
                )));
            }
        }
        if let Some(f) = self.max_saturated_fraction {
            if !(0.0..=1.0).contains(&f) {
                return Err(ConfigError::Invalid(format!(
                    "max_saturated_fraction {} outside [0, 1]",
                    f
                )));
            }
        }
        if !self.saturation_level.is_finite() {
            return Err(ConfigError::Invalid("saturation_level is not finite".into()));
        }
        Ok(())
    }

    /// All rules must pass. A feature missing from the row fails its rule.
    pub fn evaluate(&self, row: &FeatureRow) -> Verdict {
        if self.exclude_border && row.on_border {
            return Verdict::Reject(vec!["on_border".to_string()]);
        }
        let failed: Vec<String> = self
            .rules
            .iter()
            .filter(|rule| {
                !row.features
                    .get(&rule.feature)
                    .is_some_and(|&v| rule.op.holds(v, rule.threshold))
            })
            .map(|rule| rule.to_string())
            .collect();
        if failed.is_empty() {
            Verdict::Accept
        } else {
            match self.on_fail {
                FailAction::Flag => Verdict::Flag(failed),
                FailAction::Reject => Verdict::Reject(failed),
            }
        }
    }

    /// Gate a whole image. Kept rows retain their relative order and
    /// object indices.
    pub fn apply(&self, rows: Vec<FeatureRow>) -> GateOutcome {
        let mut out = GateOutcome::default();
        for mut row in rows {
            match self.evaluate(&row) {
                Verdict::Accept => {
                    out.accepted += 1;
                    out.rows.push(row);
                }
                Verdict::Flag(failed) => {
                    out.flagged += 1;
                    row.qc_flags = failed;
                    out.rows.push(row);
                }
                Verdict::Reject(_) => out.rejected += 1,
            }
        }
        out
    }

    /// Per-channel median intensity and saturated-pixel fraction.
    pub fn channel_quality(&self, planes: &BTreeMap<String, Array2<f32>>) -> Vec<ChannelQuality> {
        planes
            .iter()
            .map(|(channel, plane)| {
                let n = plane.len().max(1) as f64;
                let saturated = plane.iter().filter(|&&v| v >= self.saturation_level).count();
                let mut values: Vec<f32> = plane.iter().copied().filter(|v| v.is_finite()).collect();
                values.sort_unstable_by(|a, b| a.total_cmp(b));
                let intensity_median = match values.len() {
                    0 => f64::NAN,
                    len if len % 2 == 1 => values[len / 2] as f64,
                    len => (values[len / 2 - 1] as f64 + values[len / 2] as f64) / 2.0,
                };
                ChannelQuality {
                    channel: channel.clone(),
                    intensity_median,
                    saturated_fraction: saturated as f64 / n,
                }
            })
            .collect()
    }

    /// Image-level flags; they annotate an image but never fail it.
    pub fn image_flags(&self, quality: &[ChannelQuality], kept_rows: usize) -> Vec<String> {
        let mut flags = Vec::new();
        if kept_rows == 0 {
            flags.push("no_objects".to_string());
        }
        if let Some(max) = self.max_saturated_fraction {
            for q in quality {
                if q.saturated_fraction > max {
                    flags.push(format!("saturated:{}", q.channel));
                }
            }
        }
        flags
    }
}

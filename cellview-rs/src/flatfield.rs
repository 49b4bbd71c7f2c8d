//! Illumination (flatfield) correction.
//!
//! A per-channel mask is estimated from a sample of the plate's images:
//! each image is reduced to its block-wise minima, the reductions are
//! averaged, smoothed and scaled to mean 1. Corrected planes are the raw
//! planes divided by the mask.

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ConfigError, FeatureError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Smoothing {
    /// Gaussian blur, corrected for the zero padding at the edges.
    Gaussian { sigma: f64 },
    /// Median over a disk of the given radius.
    Median { radius: f64 },
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatfieldConfig {
    /// Side of the square blocks whose minimum stands in for the
    /// background; 0 averages the raw images.
    pub block_size: usize,
    pub smoothing: Smoothing,
    /// Images sampled per plate to estimate the masks.
    pub sample_images: usize,
}

impl Default for FlatfieldConfig {
    fn default() -> Self {
        Self {
            block_size: 60,
            smoothing: Smoothing::Gaussian { sigma: 30.0 },
            sample_images: 20,
        }
    }
}

impl FlatfieldConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_images == 0 {
            return Err(ConfigError::Invalid("flatfield.sample_images must be at least 1".into()));
        }
        match self.smoothing {
            Smoothing::Gaussian { sigma } if !(sigma.is_finite() && sigma > 0.0) => Err(ConfigError::Invalid(
                format!("flatfield gaussian sigma {} must be positive", sigma),
            )),
            Smoothing::Median { radius } if !(radius.is_finite() && radius >= 0.0) => Err(ConfigError::Invalid(
                format!("flatfield median radius {} must not be negative", radius),
            )),
            _ => Ok(()),
        }
    }
}

/// Running mean of block-minimum images.
pub struct ImageAggregator {
    block_size: usize,
    sum: Option<Array2<f64>>,
    count: usize,
}

/// Block index of every row (or column) for a dimension of length `len`.
/// The number of blocks is `len / block` (at least one); pixels are spread
/// over them proportionally so the last block absorbs the remainder.
fn block_index(len: usize, block: usize) -> (Vec<usize>, usize) {
    let blocks = (len / block).max(1);
    let index = (0..len).map(|i| i * blocks / len).collect();
    (index, blocks)
}

impl ImageAggregator {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            sum: None,
            count: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn add(&mut self, image: &Array2<f32>) -> Result<(), FeatureError> {
        let reduced = if self.block_size > 0 {
            self.block_minima(image)
        } else {
            image.mapv(f64::from)
        };
        match &mut self.sum {
            Some(sum) if sum.dim() != reduced.dim() => {
                return Err(FeatureError::ShapeMismatch {
                    channel: "flatfield sample".into(),
                    expected: sum.dim(),
                    actual: reduced.dim(),
                });
            }
            Some(sum) => *sum += &reduced,
            None => self.sum = Some(reduced),
        }
        self.count += 1;
        Ok(())
    }

    fn block_minima(&self, image: &Array2<f32>) -> Array2<f64> {
        let (h, w) = image.dim();
        if h == 0 || w == 0 {
            return Array2::zeros((h, w));
        }
        let (rows, nr) = block_index(h, self.block_size);
        let (cols, nc) = block_index(w, self.block_size);
        let mut minima = Array2::<f64>::from_elem((nr, nc), f64::INFINITY);
        for ((r, c), &v) in image.indexed_iter() {
            let m = &mut minima[[rows[r], cols[c]]];
            *m = m.min(f64::from(v));
        }
        Array2::from_shape_fn((h, w), |(r, c)| minima[[rows[r], cols[c]]])
    }

    /// Mean of the added images; `None` before the first one.
    pub fn image(&self) -> Option<Array2<f64>> {
        self.sum.as_ref().map(|s| s / self.count as f64)
    }

    pub fn smoothed(&self, smoothing: &Smoothing) -> Option<Array2<f64>> {
        let image = self.image()?;
        Some(match *smoothing {
            Smoothing::Gaussian { sigma } => gaussian_filter(&image, sigma),
            Smoothing::Median { radius } => median_filter(&image, radius),
            Smoothing::None => image,
        })
    }
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (4.0 * sigma + 0.5) as usize;
    let raw: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (-0.5 * x * x / (sigma * sigma)).exp()
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|k| k / total).collect()
}

/// 1-D convolution along `axis` with zero padding.
fn convolve_axis(image: &Array2<f64>, kernel: &[f64], axis: usize) -> Array2<f64> {
    let radius = kernel.len() / 2;
    let (h, w) = image.dim();
    let len = if axis == 0 { h } else { w };
    Array2::from_shape_fn((h, w), |(r, c)| {
        let at = if axis == 0 { r } else { c };
        let lo = at.saturating_sub(radius);
        let hi = (at + radius).min(len.saturating_sub(1));
        (lo..=hi)
            .map(|j| {
                let v = if axis == 0 { image[[j, c]] } else { image[[r, j]] };
                v * kernel[j + radius - at]
            })
            .sum()
    })
}

/// Gaussian blur divided by the blur of an all-ones image, so the edges
/// are not darkened by the padding.
pub fn gaussian_filter(image: &Array2<f64>, sigma: f64) -> Array2<f64> {
    let kernel = gaussian_kernel(sigma);
    let blur = |im: &Array2<f64>| convolve_axis(&convolve_axis(im, &kernel, 0), &kernel, 1);
    let smoothed = blur(image);
    let bleed = blur(&Array2::ones(image.dim()));
    smoothed / (bleed + f64::EPSILON)
}

/// Median over a disk, using only the pixels inside the image.
pub fn median_filter(image: &Array2<f64>, radius: f64) -> Array2<f64> {
    let r = ((radius + 0.5) as i64).max(1);
    let offsets: Vec<(i64, i64)> = (-r..=r)
        .flat_map(|dy| (-r..=r).map(move |dx| (dy, dx)))
        .filter(|(dy, dx)| dy * dy + dx * dx <= r * r)
        .collect();
    let (h, w) = image.dim();
    let rows: Vec<Vec<f64>> = (0..h)
        .into_par_iter()
        .map(|y| {
            let mut window = Vec::with_capacity(offsets.len());
            (0..w)
                .map(|x| {
                    window.clear();
                    for &(dy, dx) in &offsets {
                        let (ny, nx) = (y as i64 + dy, x as i64 + dx);
                        if ny >= 0 && nx >= 0 && (ny as usize) < h && (nx as usize) < w {
                            window.push(image[[ny as usize, nx as usize]]);
                        }
                    }
                    window.sort_unstable_by(f64::total_cmp);
                    window[window.len() / 2]
                })
                .collect()
        })
        .collect();
    Array2::from_shape_fn((h, w), |(y, x)| rows[y][x])
}

/// Scale to mean 1. Pixels that are not positive and finite become 1.
fn normalize(mask: Array2<f64>) -> Array2<f32> {
    let valid: Vec<f64> = mask.iter().copied().filter(|v| v.is_finite() && *v > 0.0).collect();
    let mean = valid.iter().sum::<f64>() / valid.len().max(1) as f64;
    if valid.is_empty() || !(mean > 0.0) {
        return Array2::ones(mask.dim());
    }
    mask.mapv(|v| {
        let scaled = v / mean;
        if scaled.is_finite() && scaled > 0.0 {
            scaled as f32
        } else {
            1.0
        }
    })
}

/// Flatfield masks per channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatfieldMasks {
    masks: BTreeMap<String, Array2<f32>>,
}

impl FlatfieldMasks {
    /// Build masks from per-channel samples. Channels without samples get
    /// no mask and are left uncorrected.
    pub fn estimate(
        config: &FlatfieldConfig,
        samples: &BTreeMap<String, Vec<Array2<f32>>>,
    ) -> Result<Self, FeatureError> {
        let mut masks = BTreeMap::new();
        for (channel, planes) in samples {
            let mut agg = ImageAggregator::new(config.block_size);
            for plane in planes {
                agg.add(plane)?;
            }
            if let Some(smoothed) = agg.smoothed(&config.smoothing) {
                tracing::debug!(channel = %channel, images = agg.count(), "flatfield mask estimated");
                masks.insert(channel.clone(), normalize(smoothed));
            }
        }
        Ok(Self { masks })
    }

    pub fn get(&self, channel: &str) -> Option<&Array2<f32>> {
        self.masks.get(channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.masks.keys().map(String::as_str)
    }

    /// Divide `plane` by the channel's mask in place.
    pub fn apply(&self, channel: &str, plane: &mut Array2<f32>) -> Result<(), FeatureError> {
        let Some(mask) = self.masks.get(channel) else {
            return Ok(());
        };
        if mask.dim() != plane.dim() {
            return Err(FeatureError::ShapeMismatch {
                channel: channel.to_string(),
                expected: mask.dim(),
                actual: plane.dim(),
            });
        }
        *plane /= mask;
        Ok(())
    }
}

//! Classical segmentation: global threshold (Otsu unless fixed) followed by
//! connected-component labelling. Runs on the CPU without a model file.
//! Thresholds the cytoplasm channel when one is given, so the same backend
//! segments nuclei or whole cells.

use ndarray::{Array2, ArrayView2};

use super::labels::label_foreground;
use super::{SegmentResult, SegmentationInput, Segmenter};

const BINS: usize = 256;

pub struct ThresholdSegmenter {
    threshold: Option<f32>,
}

impl ThresholdSegmenter {
    pub fn new(threshold: Option<f32>) -> Self {
        Self { threshold }
    }
}

/// Otsu threshold over a 256-bin histogram. Returns `None` for flat images.
fn otsu(plane: &ArrayView2<f32>) -> Option<f32> {
    let (min, max) = plane
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !(max > min) {
        return None;
    }
    let width = (max - min) as f64 / (BINS - 1) as f64;
    let bin = |v: f32| (((v - min) as f64 / width).floor() as usize).min(BINS - 1);

    let mut hist = [0u64; BINS];
    for &v in plane.iter() {
        hist[bin(v)] += 1;
    }
    let total: u64 = hist.iter().sum();
    let sum_all: f64 = hist.iter().enumerate().map(|(i, &n)| i as f64 * n as f64).sum();

    let (mut w_bg, mut sum_bg) = (0u64, 0.0f64);
    let (mut best, mut best_var) = (0usize, -1.0f64);
    for (i, &n) in hist.iter().enumerate() {
        w_bg += n;
        if w_bg == 0 {
            continue;
        }
        let w_fg = total - w_bg;
        if w_fg == 0 {
            break;
        }
        sum_bg += i as f64 * n as f64;
        let mean_bg = sum_bg / w_bg as f64;
        let mean_fg = (sum_all - sum_bg) / w_fg as f64;
        let var = w_bg as f64 * w_fg as f64 * (mean_bg - mean_fg).powi(2);
        if var > best_var {
            best_var = var;
            best = i;
        }
    }
    // Lower edge of the first foreground bin.
    Some(min + ((best + 1) as f64 * width) as f32)
}

impl Segmenter for ThresholdSegmenter {
    fn segment(&mut self, input: &SegmentationInput<'_>) -> SegmentResult {
        let plane = input.secondary.unwrap_or(input.primary);
        if plane.iter().any(|v| !v.is_finite()) {
            return Err("input contains non-finite intensities".into());
        }
        let threshold = match self.threshold {
            Some(t) => t,
            None => match otsu(&plane) {
                Some(t) => t,
                None => return Ok(Array2::zeros(plane.dim())),
            },
        };
        let foreground = plane.mapv(|v| v > threshold);
        Ok(label_foreground(&foreground))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::labels::object_count;

    fn squares() -> Array2<f32> {
        let mut img = Array2::<f32>::from_elem((12, 12), 10.0);
        for &(r, c) in &[(1usize, 1usize), (1, 7), (7, 4)] {
            for y in r..r + 3 {
                for x in c..c + 3 {
                    img[[y, x]] = 200.0;
                }
            }
        }
        img
    }

    #[test]
    fn otsu_separates_bright_squares() {
        let img = squares();
        let mut seg = ThresholdSegmenter::new(None);
        let mask = seg
            .segment(&SegmentationInput {
                primary: img.view(),
                secondary: None,
            })
            .unwrap();
        assert_eq!(object_count(&mask), 3);
        assert_eq!(mask[[1, 1]], 1);
        assert_eq!(mask[[1, 7]], 2);
        assert_eq!(mask[[7, 4]], 3);
        assert_eq!(mask.iter().filter(|&&v| v > 0).count(), 27);
    }

    #[test]
    fn flat_image_has_no_objects() {
        let img = Array2::<f32>::from_elem((5, 5), 3.0);
        let mut seg = ThresholdSegmenter::new(None);
        let mask = seg
            .segment(&SegmentationInput {
                primary: img.view(),
                secondary: None,
            })
            .unwrap();
        assert_eq!(object_count(&mask), 0);
    }

    #[test]
    fn fixed_threshold() {
        let img = squares();
        let mut seg = ThresholdSegmenter::new(Some(500.0));
        let mask = seg
            .segment(&SegmentationInput {
                primary: img.view(),
                secondary: None,
            })
            .unwrap();
        assert_eq!(object_count(&mask), 0);
    }

    #[test]
    fn non_finite_input_fails() {
        let mut img = squares();
        img[[0, 0]] = f32::NAN;
        let mut seg = ThresholdSegmenter::new(None);
        assert!(seg
            .segment(&SegmentationInput {
                primary: img.view(),
                secondary: None,
            })
            .is_err());
    }

    #[test]
    fn cytoplasm_channel_takes_precedence() {
        let nuclear = squares();
        let mut cyto = Array2::<f32>::from_elem((12, 12), 5.0);
        for y in 0..6 {
            for x in 0..12 {
                cyto[[y, x]] = 90.0;
            }
        }
        let mut seg = ThresholdSegmenter::new(None);
        let mask = seg
            .segment(&SegmentationInput {
                primary: nuclear.view(),
                secondary: Some(cyto.view()),
            })
            .unwrap();
        assert_eq!(object_count(&mask), 1);
        assert_eq!(mask.iter().filter(|&&v| v > 0).count(), 72);
    }
}

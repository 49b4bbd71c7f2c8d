//! Cellpose (cpsam, ONNX) through cellpose-rs.
//!
//! cellpose-rs handles preprocessing (percentile normalisation, 256×256
//! tiling), inference and flow-following into an integer mask.

use cellpose_rs::{CellposeSession, SegmentParams};
use ndarray::Array2;
use std::path::Path;

use super::{SegmentResult, SegmentationInput, Segmenter};
use crate::error::SegmentationError;

pub struct CellposeSegmenter {
    session: CellposeSession,
    batch_size: usize,
}

impl CellposeSegmenter {
    /// `model_dir` must contain `model.onnx`.
    pub fn load(model_dir: &Path, cpu: bool, batch_size: usize) -> Result<Self, SegmentationError> {
        let model_file = model_dir.join("model.onnx");
        if !model_file.exists() {
            return Err(SegmentationError::ModelUnavailable(format!(
                "model not found at {}",
                model_file.display()
            )));
        }
        let session = CellposeSession::new(&model_file, cpu)
            .map_err(|e| SegmentationError::ModelUnavailable(e.to_string()))?;
        tracing::info!(model = %model_file.display(), cpu, "loaded cellpose model");
        Ok(Self {
            session,
            batch_size: batch_size.max(1),
        })
    }
}

impl Segmenter for CellposeSegmenter {
    fn segment(&mut self, input: &SegmentationInput<'_>) -> SegmentResult {
        let (h, w) = input.primary.dim();
        let nuclear: Vec<f32> = input.primary.iter().copied().collect();
        // Without a cytoplasm channel the nuclear plane fills both inputs.
        let cyto: Vec<f32> = match input.secondary {
            Some(s) => s.iter().copied().collect(),
            None => nuclear.clone(),
        };

        let chw = cellpose_rs::preprocess::build_chw_image(cyto, nuclear, h, w);
        let params = SegmentParams {
            batch_size: self.batch_size,
            ..Default::default()
        };
        let masks = self
            .session
            .segment(&chw, h, w, params)
            .map_err(|e| e.to_string())?;
        Ok(Array2::from_shape_vec((h, w), masks)?)
    }
}

#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::RawDetection;
use crate::detect::yolo;

/// Tract-based backend for YOLOv5-style ONNX models.
///
/// Frames are stretched to the square model input, scaled to `[0, 1]` and run
/// through the network. Output rows are `cx, cy, w, h, objectness, scores...` in
/// model-input pixels; boxes are mapped back to the frame and truncated to whole
/// pixels.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    confidence_floor: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            confidence_floor: 0.0,
        })
    }

    /// Drop rows scoring at or below `floor` before they leave the backend.
    pub fn with_threshold(mut self, floor: f32) -> Self {
        self.confidence_floor = floor;
        self
    }

    fn build_input(&self, pixels: &[u8], width: u32, height: u32) -> Result<Tensor> {
        let expected_len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected_len {
            return Err(anyhow!(
                "expected {} RGB bytes, received {}",
                expected_len,
                pixels.len()
            ));
        }

        let frame = RgbImage::from_raw(width, height, pixels.to_vec())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", width, height))?;
        let resized = image::imageops::resize(
            &frame,
            self.input_size,
            self.input_size,
            FilterType::Triangle,
        );

        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode_output(
        &self,
        outputs: TVec<TValue>,
        width: u32,
        height: u32,
    ) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values = output
            .as_slice::<f32>()
            .context("model output tensor was not f32")?;
        yolo::decode_rows(
            values,
            output.shape(),
            self.input_size,
            (width, height),
            self.confidence_floor,
        )
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<RawDetection>> {
        let input = self.build_input(pixels, width, height)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode_output(outputs, width, height)
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size;
        let blank = vec![0u8; (side as usize) * (side as usize) * 3];
        self.detect(&blank, side, side).map(|_| ())
    }
}

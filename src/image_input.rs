//! Request image decoding.
//!
//! Uploads arrive either as encoded bytes (JPEG/PNG) or as a base64 string,
//! optionally wrapped in a `data:` URL. Frames larger than [`MAX_IMAGE_SIDE`]
//! are downscaled before inference, so detection boxes refer to the resized
//! frame.

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use image::imageops::FilterType;
use image::GenericImageView;

pub const MAX_IMAGE_SIDE: u32 = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImagePayload {
    Bytes(Vec<u8>),
    Base64(String),
}

/// RGB8 frame, row-major.
#[derive(Clone, Debug)]
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl ImagePayload {
    pub fn decode(&self) -> Result<DecodedImage> {
        match self {
            ImagePayload::Bytes(bytes) => decode_bytes(bytes),
            ImagePayload::Base64(text) => decode_bytes(&decode_base64(text)?),
        }
    }
}

fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let data = match text.split_once(',') {
        Some((_, data)) => data,
        None => text,
    };
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .context("decode base64 image")
}

fn decode_bytes(bytes: &[u8]) -> Result<DecodedImage> {
    if bytes.is_empty() {
        return Err(anyhow!("empty image"));
    }
    let mut image = image::load_from_memory(bytes).context("decode image")?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(anyhow!("image has no pixels"));
    }
    if width > MAX_IMAGE_SIDE || height > MAX_IMAGE_SIDE {
        image = image.resize(MAX_IMAGE_SIDE, MAX_IMAGE_SIDE, FilterType::Triangle);
        log::debug!(
            "downscaled {}x{} upload to {}x{}",
            width,
            height,
            image.width(),
            image.height()
        );
    }
    let rgb = image.into_rgb8();
    let (width, height) = rgb.dimensions();
    Ok(DecodedImage {
        pixels: rgb.into_raw(),
        width,
        height,
    })
}

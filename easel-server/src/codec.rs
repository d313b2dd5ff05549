//! Base64 PNG transport of images.

use std::io::Cursor;

use base64::{prelude::BASE64_STANDARD, Engine};
use image::{DynamicImage, ImageFormat};

use crate::error::ApiError;

/// Decodes a standard base64 image, with or without a `data:` URL prefix.
pub fn decode_image(field: &str, encoded: &str) -> Result<DynamicImage, ApiError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    let bytes = BASE64_STANDARD
        .decode(payload.trim())
        .map_err(|e| ApiError::Image(format!("{field} is not valid base64: {e}")))?;
    image::load_from_memory(&bytes)
        .map_err(|e| ApiError::Image(format!("{field} could not be decoded: {e}")))
}

pub fn image_to_base64_png(img: &DynamicImage) -> Result<String, ApiError> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

//! JSON bodies of the HTTP surface. Images travel as base64 PNG strings.

use easel_core::request::{
    ControlNetParams, FaceRestoreParams, Img2ImgUpscaleParams, InpaintParams, OutpaintParams,
    PreprocessParams, TraditionalUpscaleParams, UpscaleParams,
};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::codec::image_to_base64_png;
use crate::error::ApiError;

/// An input image plus the capability's parameters at the top level.
#[derive(Debug, Deserialize)]
pub struct ImageRequest<P> {
    pub image: String,
    #[serde(flatten)]
    pub params: P,
}

pub type OutpaintRequest = ImageRequest<OutpaintParams>;
pub type UpscaleRequest = ImageRequest<UpscaleParams>;
pub type TraditionalUpscaleRequest = ImageRequest<TraditionalUpscaleParams>;
pub type Img2ImgUpscaleRequest = ImageRequest<Img2ImgUpscaleParams>;
pub type FaceRestoreRequest = ImageRequest<FaceRestoreParams>;
pub type PreprocessRequest = ImageRequest<PreprocessParams>;

#[derive(Debug, Deserialize)]
pub struct InpaintRequest {
    pub image: String,
    pub mask: String,
    #[serde(flatten)]
    pub params: InpaintParams,
}

#[derive(Debug, Deserialize)]
pub struct ControlNetRequest {
    #[serde(alias = "image")]
    pub control_image: String,
    #[serde(flatten)]
    pub params: ControlNetParams,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ImageResponse {
    pub image: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

impl ImageResponse {
    pub fn png(image: &DynamicImage) -> Result<Self, ApiError> {
        Ok(Self {
            image: image_to_base64_png(image)?,
            width: image.width(),
            height: image.height(),
            format: "png".to_string(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub device: String,
    pub loaded: usize,
}

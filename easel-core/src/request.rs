//! Request parameters for every capability, with their defaults and bounds.
//!
//! Enumerated values (directions, upscale families, factors, methods and
//! control types) are closed enums, so an unknown value is rejected while the
//! request is parsed and never reaches a dispatcher.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result};

pub mod defaults {
    pub const NUM_INFERENCE_STEPS: usize = 50;
    pub const GUIDANCE_SCALE: f64 = 7.5;
    pub const INPAINT_MODEL: &str = "runwayml/stable-diffusion-inpainting";
    pub const INPAINT_STRENGTH: f64 = 0.8;
    pub const CONTROLNET_STEPS: usize = 30;
    pub const CONTROLNET_CONDITIONING_SCALE: f64 = 1.0;
    pub const IMG2IMG_MODEL: &str = "runwayml/stable-diffusion-v1-5";
    pub const IMG2IMG_STEPS: usize = 20;
    pub const IMG2IMG_DENOISE_STRENGTH: f64 = 0.3;
    pub const FACE_RESTORE_STRENGTH: f32 = 1.0;
    /// Largest width or height accepted for generated images.
    pub const MAX_DIMENSION: usize = 4096;

    pub(crate) fn steps() -> usize {
        NUM_INFERENCE_STEPS
    }
    pub(crate) fn guidance() -> f64 {
        GUIDANCE_SCALE
    }
    pub(crate) fn inpaint_model() -> String {
        INPAINT_MODEL.to_string()
    }
    pub(crate) fn inpaint_strength() -> f64 {
        INPAINT_STRENGTH
    }
    pub(crate) fn controlnet_steps() -> usize {
        CONTROLNET_STEPS
    }
    pub(crate) fn conditioning_scale() -> f64 {
        CONTROLNET_CONDITIONING_SCALE
    }
    pub(crate) fn img2img_model() -> String {
        IMG2IMG_MODEL.to_string()
    }
    pub(crate) fn img2img_steps() -> usize {
        IMG2IMG_STEPS
    }
    pub(crate) fn denoise_strength() -> f64 {
        IMG2IMG_DENOISE_STRENGTH
    }
    pub(crate) fn face_strength() -> f32 {
        FACE_RESTORE_STRENGTH
    }
}

/// Side of the canvas that grows during outpainting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Right,
    Top,
    Bottom,
}

serde_plain::derive_fromstr_from_deserialize!(Direction);
serde_plain::derive_display_from_serialize!(Direction);

/// Super-resolution network family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum UpscaleModel {
    #[serde(rename = "esrgan")]
    Esrgan,
    #[default]
    #[serde(rename = "realesrgan")]
    RealEsrgan,
}

serde_plain::derive_fromstr_from_deserialize!(UpscaleModel);
serde_plain::derive_display_from_serialize!(UpscaleModel);

/// Integer scale factor for the super-resolution networks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum UpscaleFactor {
    #[default]
    X2,
    X4,
}

impl UpscaleFactor {
    pub fn get(self) -> u32 {
        match self {
            Self::X2 => 2,
            Self::X4 => 4,
        }
    }
}

impl TryFrom<u32> for UpscaleFactor {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            2 => Ok(Self::X2),
            4 => Ok(Self::X4),
            other => Err(Error::validation(format!(
                "factor must be 2 or 4, got {other}"
            ))),
        }
    }
}

impl From<UpscaleFactor> for u32 {
    fn from(factor: UpscaleFactor) -> Self {
        factor.get()
    }
}

impl fmt::Display for UpscaleFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// Interpolation kernel for non-learned upscaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpscaleMethod {
    Nearest,
    Bilinear,
    Bicubic,
    #[default]
    Lanczos,
    Area,
}

serde_plain::derive_fromstr_from_deserialize!(UpscaleMethod);
serde_plain::derive_display_from_serialize!(UpscaleMethod);

impl UpscaleMethod {
    pub const ALL: [UpscaleMethod; 5] = [
        Self::Nearest,
        Self::Bilinear,
        Self::Bicubic,
        Self::Lanczos,
        Self::Area,
    ];
}

/// Structural guide a ControlNet is conditioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlType {
    Canny,
    Softedge,
    Scribble,
    Tile,
}

serde_plain::derive_fromstr_from_deserialize!(ControlType);
serde_plain::derive_display_from_serialize!(ControlType);

impl ControlType {
    pub const ALL: [ControlType; 4] = [Self::Canny, Self::Softedge, Self::Scribble, Self::Tile];

    pub fn description(self) -> &'static str {
        match self {
            Self::Canny => "Canny edge map: thin white edges on black",
            Self::Softedge => "Soft edge map: normalised gradient magnitude",
            Self::Scribble => "Scribble: thick white strokes on black",
            Self::Tile => "Tile: blurred low resolution copy for detail regeneration",
        }
    }
}

/// Discovery entry for `/controlnet/types`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlTypeInfo {
    #[serde(rename = "type")]
    pub control_type: ControlType,
    pub description: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TextToImageRequest {
    pub model_id: String,
    pub prompt: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
    #[serde(default = "defaults::steps")]
    pub num_inference_steps: usize,
    #[serde(default = "defaults::guidance")]
    pub guidance_scale: f64,
    pub negative_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl TextToImageRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            width: None,
            height: None,
            num_inference_steps: defaults::NUM_INFERENCE_STEPS,
            guidance_scale: defaults::GUIDANCE_SCALE,
            negative_prompt: None,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_model_id(&self.model_id)?;
        check_steps(self.num_inference_steps)?;
        check_guidance(self.guidance_scale)?;
        check_dimension("width", self.width)?;
        check_dimension("height", self.height)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct InpaintParams {
    pub prompt: String,
    #[serde(default = "defaults::inpaint_model")]
    pub model_id: String,
    #[serde(default = "defaults::inpaint_strength")]
    pub strength: f64,
    pub width: Option<usize>,
    pub height: Option<usize>,
    #[serde(default = "defaults::steps")]
    pub num_inference_steps: usize,
    #[serde(default = "defaults::guidance")]
    pub guidance_scale: f64,
    pub negative_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl InpaintParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model_id: defaults::inpaint_model(),
            strength: defaults::INPAINT_STRENGTH,
            width: None,
            height: None,
            num_inference_steps: defaults::NUM_INFERENCE_STEPS,
            guidance_scale: defaults::GUIDANCE_SCALE,
            negative_prompt: None,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_model_id(&self.model_id)?;
        check_strength("strength", self.strength)?;
        check_steps(self.num_inference_steps)?;
        check_guidance(self.guidance_scale)?;
        check_dimension("width", self.width)?;
        check_dimension("height", self.height)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct OutpaintParams {
    pub direction: Direction,
    pub pixels: u32,
    pub prompt: String,
    #[serde(default = "defaults::inpaint_model")]
    pub model_id: String,
    #[serde(default = "defaults::inpaint_strength")]
    pub strength: f64,
    #[serde(default = "defaults::steps")]
    pub num_inference_steps: usize,
    #[serde(default = "defaults::guidance")]
    pub guidance_scale: f64,
    pub negative_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl OutpaintParams {
    pub fn new(direction: Direction, pixels: u32, prompt: impl Into<String>) -> Self {
        Self {
            direction,
            pixels,
            prompt: prompt.into(),
            model_id: defaults::inpaint_model(),
            strength: defaults::INPAINT_STRENGTH,
            num_inference_steps: defaults::NUM_INFERENCE_STEPS,
            guidance_scale: defaults::GUIDANCE_SCALE,
            negative_prompt: None,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pixels == 0 {
            return Err(Error::validation("pixels must be greater than zero"));
        }
        check_dimension("pixels", Some(self.pixels as usize))?;
        check_model_id(&self.model_id)?;
        check_strength("strength", self.strength)?;
        check_steps(self.num_inference_steps)?;
        check_guidance(self.guidance_scale)
    }

    /// Size of the extended canvas, which must itself be a valid generation size.
    pub(crate) fn canvas_size(&self, width: u32, height: u32) -> Result<(u32, u32)> {
        let grow = |side: u32| side.saturating_add(self.pixels);
        let (width, height) = match self.direction {
            Direction::Left | Direction::Right => (grow(width), height),
            Direction::Top | Direction::Bottom => (width, grow(height)),
        };
        check_dimension("canvas width", Some(width as usize))?;
        check_dimension("canvas height", Some(height as usize))?;
        Ok((width, height))
    }

    /// The inpaint parameters used once the canvas has been extended.
    pub(crate) fn to_inpaint(&self, width: u32, height: u32) -> InpaintParams {
        InpaintParams {
            prompt: self.prompt.clone(),
            model_id: self.model_id.clone(),
            strength: self.strength,
            width: Some(width as usize),
            height: Some(height as usize),
            num_inference_steps: self.num_inference_steps,
            guidance_scale: self.guidance_scale,
            negative_prompt: self.negative_prompt.clone(),
            seed: self.seed,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct UpscaleParams {
    #[serde(default)]
    pub model: UpscaleModel,
    #[serde(default)]
    pub factor: UpscaleFactor,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct TraditionalUpscaleParams {
    #[serde(default)]
    pub method: UpscaleMethod,
    #[serde(default)]
    pub factor: UpscaleFactor,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Img2ImgUpscaleParams {
    pub prompt: String,
    #[serde(default = "defaults::img2img_model")]
    pub model_id: String,
    #[serde(default)]
    pub factor: UpscaleFactor,
    #[serde(default = "defaults::denoise_strength")]
    pub denoise_strength: f64,
    #[serde(default)]
    pub upscale_method: UpscaleMethod,
    #[serde(default = "defaults::img2img_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "defaults::guidance")]
    pub guidance_scale: f64,
    pub negative_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl Img2ImgUpscaleParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model_id: defaults::img2img_model(),
            factor: UpscaleFactor::default(),
            denoise_strength: defaults::IMG2IMG_DENOISE_STRENGTH,
            upscale_method: UpscaleMethod::default(),
            num_inference_steps: defaults::IMG2IMG_STEPS,
            guidance_scale: defaults::GUIDANCE_SCALE,
            negative_prompt: None,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_model_id(&self.model_id)?;
        check_strength("denoise_strength", self.denoise_strength)?;
        check_steps(self.num_inference_steps)?;
        check_guidance(self.guidance_scale)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct FaceRestoreParams {
    #[serde(default = "defaults::face_strength")]
    pub strength: f32,
}

impl Default for FaceRestoreParams {
    fn default() -> Self {
        Self {
            strength: defaults::FACE_RESTORE_STRENGTH,
        }
    }
}

impl FaceRestoreParams {
    pub fn validate(&self) -> Result<()> {
        check_strength("strength", self.strength as f64)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct PreprocessParams {
    pub control_type: ControlType,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ControlNetParams {
    #[serde(alias = "model_id")]
    pub base_model_id: String,
    pub control_type: ControlType,
    pub prompt: String,
    pub width: Option<usize>,
    pub height: Option<usize>,
    #[serde(default = "defaults::controlnet_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "defaults::guidance")]
    pub guidance_scale: f64,
    #[serde(default = "defaults::conditioning_scale")]
    pub controlnet_conditioning_scale: f64,
    pub negative_prompt: Option<String>,
    pub seed: Option<u64>,
}

impl ControlNetParams {
    pub fn new(
        base_model_id: impl Into<String>,
        control_type: ControlType,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            base_model_id: base_model_id.into(),
            control_type,
            prompt: prompt.into(),
            width: None,
            height: None,
            num_inference_steps: defaults::CONTROLNET_STEPS,
            guidance_scale: defaults::GUIDANCE_SCALE,
            controlnet_conditioning_scale: defaults::CONTROLNET_CONDITIONING_SCALE,
            negative_prompt: None,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_model_id(&self.base_model_id)?;
        check_steps(self.num_inference_steps)?;
        check_guidance(self.guidance_scale)?;
        if !(0.0..=2.0).contains(&self.controlnet_conditioning_scale) {
            return Err(Error::validation(
                "controlnet_conditioning_scale must be between 0 and 2",
            ));
        }
        check_dimension("width", self.width)?;
        check_dimension("height", self.height)
    }
}

fn check_model_id(model_id: &str) -> Result<()> {
    if model_id.trim().is_empty() {
        return Err(Error::validation("model_id must not be empty"));
    }
    Ok(())
}

fn check_steps(steps: usize) -> Result<()> {
    if steps == 0 || steps > 1000 {
        return Err(Error::validation(format!(
            "num_inference_steps must be between 1 and 1000, got {steps}"
        )));
    }
    Ok(())
}

fn check_guidance(guidance: f64) -> Result<()> {
    if !guidance.is_finite() || guidance < 0.0 {
        return Err(Error::validation("guidance_scale must be a non-negative number"));
    }
    Ok(())
}

fn check_strength(name: &str, strength: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&strength) {
        return Err(Error::validation(format!(
            "{name} must be between 0 and 1, got {strength}"
        )));
    }
    Ok(())
}

fn check_dimension(name: &str, value: Option<usize>) -> Result<()> {
    match value {
        Some(0) => Err(Error::validation(format!("{name} must be greater than zero"))),
        Some(v) if v > defaults::MAX_DIMENSION => Err(Error::validation(format!(
            "{name} must be at most {}, got {v}",
            defaults::MAX_DIMENSION
        ))),
        _ => Ok(()),
    }
}

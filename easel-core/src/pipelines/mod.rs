//! Loaded pipeline handles and the invocations they accept.
//!
//! Every handle is immutable once built and is shared behind an `Arc`, so
//! implementations guard any model state that needs `&mut` internally.
//! Invocations run on a blocking worker thread.

use std::sync::Arc;

use image::{DynamicImage, GrayImage, RgbImage};

use crate::seed::SeededGenerator;
use crate::Error;

pub mod controlnet;
pub mod esrgan;
pub mod face;
pub mod flux;
#[cfg(feature = "face-restore")]
pub mod gfpgan;
pub mod stable_diffusion;

/// Images produced by one invocation.
#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    pub images: Vec<DynamicImage>,
}

impl PipelineOutput {
    pub fn single(image: DynamicImage) -> Self {
        Self {
            images: vec![image],
        }
    }

    /// The first image, rejecting an empty or zero-sized result.
    pub fn into_first_image(self) -> Result<DynamicImage, Error> {
        let image = self
            .images
            .into_iter()
            .next()
            .ok_or_else(|| Error::UnexpectedOutput("the pipeline returned no images".to_string()))?;
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::UnexpectedOutput(format!(
                "the pipeline returned a {}x{} image",
                image.width(),
                image.height()
            )));
        }
        Ok(image)
    }
}

#[derive(Debug, Clone)]
pub struct TextToImageInvocation {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub generator: Option<SeededGenerator>,
}

#[derive(Debug, Clone)]
pub struct InpaintInvocation {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub image: DynamicImage,
    /// Same size as `image`; white marks the pixels to regenerate.
    pub mask: GrayImage,
    pub strength: f64,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub generator: Option<SeededGenerator>,
}

#[derive(Debug, Clone)]
pub struct ImageToImageInvocation {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub image: DynamicImage,
    pub strength: f64,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub generator: Option<SeededGenerator>,
}

#[derive(Debug, Clone)]
pub struct ControlNetInvocation {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub control_image: DynamicImage,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub conditioning_scale: f64,
    pub generator: Option<SeededGenerator>,
}

pub trait TextToImagePipeline: Send + Sync {
    fn run(&self, invocation: TextToImageInvocation) -> anyhow::Result<PipelineOutput>;
}

pub trait InpaintPipeline: Send + Sync {
    fn run(&self, invocation: InpaintInvocation) -> anyhow::Result<PipelineOutput>;
}

pub trait ImageToImagePipeline: Send + Sync {
    fn run(&self, invocation: ImageToImageInvocation) -> anyhow::Result<PipelineOutput>;
}

pub trait ControlNetPipeline: Send + Sync {
    fn run(&self, invocation: ControlNetInvocation) -> anyhow::Result<PipelineOutput>;
}

/// A super-resolution network with a fixed native scale.
pub trait Upscaler: Send + Sync {
    /// Scale the network produces in one pass.
    fn net_scale(&self) -> u32;

    /// Runs the network on an RGB image.
    fn enhance(&self, image: &RgbImage) -> anyhow::Result<RgbImage>;
}

pub trait FaceRestorer: Send + Sync {
    /// Restores faces and blends the result with the input by `strength`.
    fn restore(&self, image: &RgbImage, strength: f32) -> anyhow::Result<RgbImage>;
}

pub type TextToImageHandle = Arc<dyn TextToImagePipeline>;
pub type InpaintHandle = Arc<dyn InpaintPipeline>;
pub type ImageToImageHandle = Arc<dyn ImageToImagePipeline>;
pub type ControlNetHandle = Arc<dyn ControlNetPipeline>;
pub type UpscalerHandle = Arc<dyn Upscaler>;
pub type FaceRestorerHandle = Arc<dyn FaceRestorer>;

//! Weightless pipelines and a loader that counts constructions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use candle_core::Device;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};

use crate::loader::Loader;
use crate::pipelines::{
    ControlNetHandle, ControlNetInvocation, ControlNetPipeline, FaceRestorer, FaceRestorerHandle,
    ImageToImageHandle, ImageToImageInvocation, ImageToImagePipeline, InpaintHandle,
    InpaintInvocation, InpaintPipeline, PipelineOutput, TextToImageHandle, TextToImageInvocation,
    TextToImagePipeline, Upscaler, UpscalerHandle,
};
use crate::request::{ControlType, UpscaleFactor, UpscaleModel};
use crate::TextToImageFamily;

/// Model identifiers containing this fail to load.
pub const MISSING_MODEL: &str = "missing";
/// Model identifiers containing this load a pipeline that returns no images.
pub const EMPTY_MODEL: &str = "empty";

const DEFAULT_SIZE: usize = 64;

#[derive(Debug, Default)]
pub struct LoadCounts {
    pub text_to_image: AtomicUsize,
    pub inpaint: AtomicUsize,
    pub image_to_image: AtomicUsize,
    pub controlnet: AtomicUsize,
    pub upscaler: AtomicUsize,
    pub face_restorer: AtomicUsize,
}

impl LoadCounts {
    pub fn total(&self) -> usize {
        [
            &self.text_to_image,
            &self.inpaint,
            &self.image_to_image,
            &self.controlnet,
            &self.upscaler,
            &self.face_restorer,
        ]
        .iter()
        .map(|count| count.load(Ordering::SeqCst))
        .sum()
    }
}

/// Solid image of the requested size, or an empty output for [`EMPTY_MODEL`].
struct FlatTextToImage {
    empty: bool,
}

impl TextToImagePipeline for FlatTextToImage {
    fn run(&self, invocation: TextToImageInvocation) -> Result<PipelineOutput> {
        if self.empty {
            return Ok(PipelineOutput::default());
        }
        let width = invocation.width.unwrap_or(DEFAULT_SIZE) as u32;
        let height = invocation.height.unwrap_or(DEFAULT_SIZE) as u32;
        let shade = invocation.generator.map_or(0, |g| (g.seed() % 256) as u8);
        Ok(PipelineOutput::single(DynamicImage::ImageRgb8(
            RgbImage::from_pixel(width, height, Rgb([shade; 3])),
        )))
    }
}

/// Returns the mask it was given, so callers can inspect what reached the model.
struct MaskEcho;

impl InpaintPipeline for MaskEcho {
    fn run(&self, invocation: InpaintInvocation) -> Result<PipelineOutput> {
        if invocation.image.width() != invocation.mask.width()
            || invocation.image.height() != invocation.mask.height()
        {
            bail!("image and mask sizes differ");
        }
        Ok(PipelineOutput::single(DynamicImage::ImageLuma8(
            invocation.mask,
        )))
    }
}

struct Identity;

impl ImageToImagePipeline for Identity {
    fn run(&self, invocation: ImageToImageInvocation) -> Result<PipelineOutput> {
        Ok(PipelineOutput::single(invocation.image))
    }
}

impl ControlNetPipeline for Identity {
    fn run(&self, invocation: ControlNetInvocation) -> Result<PipelineOutput> {
        let width = invocation
            .width
            .unwrap_or(invocation.control_image.width() as usize);
        let height = invocation
            .height
            .unwrap_or(invocation.control_image.height() as usize);
        Ok(PipelineOutput::single(invocation.control_image.resize_exact(
            width as u32,
            height as u32,
            FilterType::Nearest,
        )))
    }
}

impl FaceRestorer for Identity {
    fn restore(&self, image: &RgbImage, _strength: f32) -> Result<RgbImage> {
        Ok(image.clone())
    }
}

/// Nearest neighbour stand-in for a super-resolution network.
pub struct NearestUpscaler {
    pub scale: u32,
}

impl Upscaler for NearestUpscaler {
    fn net_scale(&self) -> u32 {
        self.scale
    }

    fn enhance(&self, image: &RgbImage) -> Result<RgbImage> {
        Ok(imageops::resize(
            image,
            image.width() * self.scale,
            image.height() * self.scale,
            FilterType::Nearest,
        ))
    }
}

/// A [`Loader`] whose pipelines need no weights.
#[derive(Debug, Default)]
pub struct CountingLoader {
    pub counts: LoadCounts,
    face_restore: bool,
    load_delay: Duration,
}

impl CountingLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_face_restore(mut self, available: bool) -> Self {
        self.face_restore = available;
        self
    }

    /// Makes every construction take `delay`, to widen race windows.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    async fn construct(&self, counter: &AtomicUsize, model_id: &str) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if model_id.contains(MISSING_MODEL) {
            bail!("no weights for {model_id}");
        }
        Ok(())
    }
}

impl Loader for CountingLoader {
    async fn load_text_to_image(
        &self,
        family: TextToImageFamily,
        model_id: &str,
        _device: &Device,
    ) -> Result<TextToImageHandle> {
        self.construct(&self.counts.text_to_image, model_id).await?;
        if family == TextToImageFamily::StableDiffusion3 {
            bail!("{family} is recognised but this build has no sampler for it");
        }
        Ok(Arc::new(FlatTextToImage {
            empty: model_id.contains(EMPTY_MODEL),
        }))
    }

    async fn load_inpaint(&self, model_id: &str, _device: &Device) -> Result<InpaintHandle> {
        self.construct(&self.counts.inpaint, model_id).await?;
        Ok(Arc::new(MaskEcho))
    }

    async fn load_image_to_image(
        &self,
        model_id: &str,
        _device: &Device,
    ) -> Result<ImageToImageHandle> {
        self.construct(&self.counts.image_to_image, model_id).await?;
        Ok(Arc::new(Identity))
    }

    async fn load_controlnet(
        &self,
        base_model_id: &str,
        _control_type: ControlType,
        _device: &Device,
    ) -> Result<ControlNetHandle> {
        self.construct(&self.counts.controlnet, base_model_id).await?;
        Ok(Arc::new(Identity))
    }

    async fn load_upscaler(
        &self,
        model: UpscaleModel,
        factor: UpscaleFactor,
        _device: &Device,
    ) -> Result<UpscalerHandle> {
        self.construct(&self.counts.upscaler, &model.to_string()).await?;
        let scale = match model {
            UpscaleModel::RealEsrgan => factor.get(),
            UpscaleModel::Esrgan => 4,
        };
        Ok(Arc::new(NearestUpscaler { scale }))
    }

    fn face_restore_available(&self) -> bool {
        self.face_restore
    }

    async fn load_face_restorer(&self, _device: &Device) -> Result<FaceRestorerHandle> {
        self.construct(&self.counts.face_restorer, "gfpgan").await?;
        Ok(Arc::new(Identity))
    }
}

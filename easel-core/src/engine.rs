use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::Device;
use image::DynamicImage;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::cache::HandleCache;
use crate::dispatch::{self, ControlNetKey, UpscaleKey};
use crate::hub_loader::CandleLoader;
use crate::loader::Loader;
use crate::pipelines::controlnet::preprocess;
use crate::pipelines::{
    ControlNetHandle, FaceRestorerHandle, ImageToImageHandle, InpaintHandle, PipelineOutput,
    TextToImageHandle, UpscalerHandle,
};
use crate::request::{
    ControlNetParams, ControlType, ControlTypeInfo, FaceRestoreParams, Img2ImgUpscaleParams,
    InpaintParams, OutpaintParams, PreprocessParams, TextToImageRequest, TraditionalUpscaleParams,
    UpscaleParams,
};
use crate::transform::{outpaint_canvas, traditional_upscale};
use crate::{
    device_label, select_best_device, EngineConfig, Error, Result, SdVersion, TextToImageFamily,
};

type FaceRestorerSlot = Arc<OnceCell<FaceRestorerHandle>>;

/// Runs a pipeline call on a blocking worker so the runtime keeps serving.
async fn run_blocking<T, F>(call: F) -> Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call).await?.map_err(Error::Generation)
}

/// Owns the device, the handle caches and the loader that fills them.
pub struct Engine<L> {
    loader: L,
    device: Device,
    text_to_image: HandleCache<String, TextToImageHandle>,
    inpaint: HandleCache<String, InpaintHandle>,
    image_to_image: HandleCache<String, ImageToImageHandle>,
    controlnet: HandleCache<ControlNetKey, ControlNetHandle>,
    upscalers: HandleCache<UpscaleKey, UpscalerHandle>,
    face_restorer: Mutex<FaceRestorerSlot>,
}

impl Engine<CandleLoader> {
    /// Selects the device and sets up the hub backed loader.
    pub fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        let device = select_best_device(config.device_map)?;
        info!(device = %device_label(&device), "selected device");
        Ok(Self::new(CandleLoader::new(config)?, device))
    }
}

impl<L: Loader> Engine<L> {
    pub fn new(loader: L, device: Device) -> Self {
        Self {
            loader,
            device,
            text_to_image: HandleCache::new("text-to-image"),
            inpaint: HandleCache::new("inpaint"),
            image_to_image: HandleCache::new("img2img"),
            controlnet: HandleCache::new("controlnet"),
            upscalers: HandleCache::new("upscale"),
            face_restorer: Mutex::new(Arc::default()),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_label(&self) -> String {
        device_label(&self.device)
    }

    fn face_restorer_slot(&self) -> MutexGuard<'_, FaceRestorerSlot> {
        self.face_restorer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of constructed handles across every capability.
    pub fn loaded_count(&self) -> usize {
        self.text_to_image.len()
            + self.inpaint.len()
            + self.image_to_image.len()
            + self.controlnet.len()
            + self.upscalers.len()
            + usize::from(self.face_restorer_slot().initialized())
    }

    pub async fn text_to_image(&self, request: TextToImageRequest) -> Result<DynamicImage> {
        request.validate()?;
        let family = TextToImageFamily::from_model_id(&request.model_id);
        debug!(model_id = %request.model_id, %family, "text-to-image");
        let handle = self
            .text_to_image
            .get_or_create(&request.model_id, || {
                self.loader
                    .load_text_to_image(family, &request.model_id, &self.device)
            })
            .await?;
        let invocation = dispatch::text_to_image_invocation(request, &self.device);
        first_image(run_blocking(move || handle.run(invocation)).await?)
    }

    pub async fn inpaint(
        &self,
        image: DynamicImage,
        mask: DynamicImage,
        params: InpaintParams,
    ) -> Result<DynamicImage> {
        params.validate()?;
        check_not_empty("image", &image)?;
        check_not_empty("mask", &mask)?;
        self.inpaint_with_mask(image, mask.to_luma8(), params).await
    }

    async fn inpaint_with_mask(
        &self,
        image: DynamicImage,
        mask: image::GrayImage,
        params: InpaintParams,
    ) -> Result<DynamicImage> {
        let handle = self
            .inpaint
            .get_or_create(&params.model_id, || {
                self.loader.load_inpaint(&params.model_id, &self.device)
            })
            .await?;
        let device = self.device.clone();
        let output = run_blocking(move || {
            let invocation = dispatch::inpaint_invocation(params, &image, &mask, &device);
            handle.run(invocation)
        })
        .await?;
        first_image(output)
    }

    /// Extends the canvas on one side and inpaints the new strip.
    pub async fn outpaint(&self, image: DynamicImage, params: OutpaintParams) -> Result<DynamicImage> {
        params.validate()?;
        check_not_empty("image", &image)?;
        params.canvas_size(image.width(), image.height())?;
        let (canvas, mask) = outpaint_canvas(&image, params.direction, params.pixels)?;
        debug!(
            direction = %params.direction,
            pixels = params.pixels,
            width = canvas.width(),
            height = canvas.height(),
            "outpaint canvas"
        );
        let inpaint = params.to_inpaint(canvas.width(), canvas.height());
        self.inpaint_with_mask(canvas, mask, inpaint).await
    }

    pub async fn upscale(&self, image: DynamicImage, params: UpscaleParams) -> Result<DynamicImage> {
        check_not_empty("image", &image)?;
        let key = UpscaleKey {
            model: params.model,
            factor: params.factor,
        };
        let handle = self
            .upscalers
            .get_or_create(&key, || {
                self.loader
                    .load_upscaler(params.model, params.factor, &self.device)
            })
            .await?;
        run_blocking(move || dispatch::run_upscaler(handle.as_ref(), &image, params.factor)).await
    }

    pub async fn traditional_upscale(
        &self,
        image: DynamicImage,
        params: TraditionalUpscaleParams,
    ) -> Result<DynamicImage> {
        check_not_empty("image", &image)?;
        tokio::task::spawn_blocking(move || {
            traditional_upscale(&image, params.method, params.factor.get())
        })
        .await?
    }

    /// Interpolates up first, then lets an image-to-image pass add detail.
    pub async fn img2img_upscale(
        &self,
        image: DynamicImage,
        params: Img2ImgUpscaleParams,
    ) -> Result<DynamicImage> {
        params.validate()?;
        let upscaled = self
            .traditional_upscale(
                image,
                TraditionalUpscaleParams {
                    method: params.upscale_method,
                    factor: params.factor,
                },
            )
            .await?;
        let handle = self
            .image_to_image
            .get_or_create(&params.model_id, || {
                self.loader.load_image_to_image(&params.model_id, &self.device)
            })
            .await?;
        let invocation = dispatch::image_to_image_invocation(params, upscaled, &self.device);
        first_image(run_blocking(move || handle.run(invocation)).await?)
    }

    pub async fn face_restore(
        &self,
        image: DynamicImage,
        params: FaceRestoreParams,
    ) -> Result<DynamicImage> {
        if !self.loader.face_restore_available() {
            return Err(Error::CapabilityUnavailable("face restoration".to_string()));
        }
        params.validate()?;
        check_not_empty("image", &image)?;
        let slot = self.face_restorer_slot().clone();
        let handle = slot
            .get_or_try_init(|| async {
                info!("loading face restorer");
                self.loader.load_face_restorer(&self.device).await
            })
            .await
            .map_err(|source| Error::Load {
                key: "face-restorer".to_string(),
                source,
            })?
            .clone();
        let restored = run_blocking(move || handle.restore(&image.to_rgb8(), params.strength)).await?;
        Ok(DynamicImage::ImageRgb8(restored))
    }

    pub fn controlnet_types(&self) -> Vec<ControlTypeInfo> {
        ControlType::ALL
            .into_iter()
            .map(|control_type| ControlTypeInfo {
                control_type,
                description: control_type.description().to_string(),
            })
            .collect()
    }

    pub async fn controlnet_preprocess(
        &self,
        image: DynamicImage,
        params: PreprocessParams,
    ) -> Result<DynamicImage> {
        check_not_empty("image", &image)?;
        Ok(tokio::task::spawn_blocking(move || preprocess(&image, params.control_type)).await?)
    }

    pub async fn controlnet_generate(
        &self,
        control_image: DynamicImage,
        params: ControlNetParams,
    ) -> Result<DynamicImage> {
        params.validate()?;
        check_not_empty("control_image", &control_image)?;
        let family = TextToImageFamily::from_model_id(&params.base_model_id);
        if family != TextToImageFamily::StableDiffusion
            || SdVersion::from_model_id(&params.base_model_id) != SdVersion::V1_5
        {
            return Err(Error::validation(format!(
                "ControlNet needs a Stable Diffusion 1.x base model, `{}` is not one",
                params.base_model_id
            )));
        }
        let key = ControlNetKey {
            base_model_id: params.base_model_id.clone(),
            control_type: params.control_type,
        };
        let handle = self
            .controlnet
            .get_or_create(&key, || {
                self.loader
                    .load_controlnet(&key.base_model_id, key.control_type, &self.device)
            })
            .await?;
        let invocation = dispatch::controlnet_invocation(params, control_image, &self.device);
        first_image(run_blocking(move || handle.run(invocation)).await?)
    }

    /// Releases every loaded handle, returning how many there were.
    pub fn shutdown(&self) -> usize {
        let face_restorer = {
            let mut slot = self.face_restorer_slot();
            let released = usize::from(slot.initialized());
            *slot = Arc::default();
            released
        };
        let released = self.text_to_image.clear()
            + self.inpaint.clear()
            + self.image_to_image.clear()
            + self.controlnet.clear()
            + self.upscalers.clear()
            + face_restorer;
        info!(released, "engine shut down");
        released
    }
}

fn first_image(output: PipelineOutput) -> Result<DynamicImage> {
    output.into_first_image()
}

fn check_not_empty(name: &str, image: &DynamicImage) -> Result<()> {
    if image.width() == 0 || image.height() == 0 {
        return Err(Error::validation(format!("{name} must not be empty")));
    }
    Ok(())
}

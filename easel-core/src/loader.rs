use std::future::Future;

use anyhow::Result;
use candle_core::Device;

use crate::pipelines::{
    ControlNetHandle, FaceRestorerHandle, ImageToImageHandle, InpaintHandle, TextToImageHandle,
    UpscalerHandle,
};
use crate::request::{ControlType, UpscaleFactor, UpscaleModel};
use crate::TextToImageFamily;

/// Builds pipeline handles on a device. Called by the engine on cache misses only.
pub trait Loader: Send + Sync + 'static {
    fn load_text_to_image(
        &self,
        family: TextToImageFamily,
        model_id: &str,
        device: &Device,
    ) -> impl Future<Output = Result<TextToImageHandle>> + Send;

    fn load_inpaint(
        &self,
        model_id: &str,
        device: &Device,
    ) -> impl Future<Output = Result<InpaintHandle>> + Send;

    fn load_image_to_image(
        &self,
        model_id: &str,
        device: &Device,
    ) -> impl Future<Output = Result<ImageToImageHandle>> + Send;

    /// A Stable Diffusion base steered by the ControlNet for `control_type`.
    fn load_controlnet(
        &self,
        base_model_id: &str,
        control_type: ControlType,
        device: &Device,
    ) -> impl Future<Output = Result<ControlNetHandle>> + Send;

    fn load_upscaler(
        &self,
        model: UpscaleModel,
        factor: UpscaleFactor,
        device: &Device,
    ) -> impl Future<Output = Result<UpscalerHandle>> + Send;

    /// Whether [`Loader::load_face_restorer`] can succeed in this deployment.
    fn face_restore_available(&self) -> bool;

    fn load_face_restorer(
        &self,
        device: &Device,
    ) -> impl Future<Output = Result<FaceRestorerHandle>> + Send;
}

//! Loader backed by the Hugging Face hub and candle.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device};
use hf_hub::api::tokio::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use tracing::{debug, info};

use crate::loader::Loader;
use crate::pipelines::controlnet::{self, ControlNetStableDiffusion};
use crate::pipelines::esrgan::{Checkpoint, Esrgan};
use crate::pipelines::flux::{FluxFiles, FluxPipeline};
use crate::pipelines::stable_diffusion::{StableDiffusion, StableDiffusionFiles, UnetInput};
use crate::pipelines::{
    ControlNetHandle, FaceRestorerHandle, ImageToImageHandle, InpaintHandle, TextToImageHandle,
    UpscalerHandle,
};
use crate::request::{ControlType, UpscaleFactor, UpscaleModel};
use crate::{diffusion_dtype, EngineConfig, FluxVariant, SdVersion, TextToImageFamily};

/// Safetensors file under `dir`, half precision variant first when it is usable.
fn weight_candidates(dir: &str, stem: &str, half: bool) -> Vec<String> {
    let prefix = if dir.is_empty() {
        String::new()
    } else {
        format!("{dir}/")
    };
    let mut files = Vec::with_capacity(2);
    if half {
        files.push(format!("{prefix}{stem}.fp16.safetensors"));
    }
    files.push(format!("{prefix}{stem}.safetensors"));
    files
}

/// Runs a constructor on a blocking worker; building pipelines reads gigabytes.
async fn build<T, F>(what: &'static str, constructor: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(constructor)
        .await
        .with_context(|| format!("{what} construction worker failed"))?
}

pub struct CandleLoader {
    api: Api,
    config: EngineConfig,
}

impl CandleLoader {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let token = config
            .hf_token
            .clone()
            .or_else(|| std::env::var("HF_TOKEN").ok());
        let api = ApiBuilder::new()
            .with_token(token)
            .with_progress(false)
            .build()
            .context("failed to set up the hub client")?;
        Ok(Self { api, config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn get(&self, repo: &str, file: &str) -> Result<PathBuf> {
        self.api
            .model(repo.to_string())
            .get(file)
            .await
            .with_context(|| format!("failed to get {file} from {repo}"))
    }

    /// The first of `files` the repository has.
    async fn get_first(&self, repo: &str, files: &[String]) -> Result<PathBuf> {
        let mut last_error = None;
        for file in files {
            match self.get(repo, file).await {
                Ok(path) => return Ok(path),
                Err(e) => {
                    debug!(repo, file = %file, "weights not found, trying next: {e:#}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("no candidate files for {repo}")))
    }

    async fn stable_diffusion_files(
        &self,
        model_id: &str,
        version: SdVersion,
        device: &Device,
    ) -> Result<StableDiffusionFiles> {
        let half = diffusion_dtype(device) == DType::F16;
        let unet = self
            .get_first(model_id, &weight_candidates("unet", "diffusion_pytorch_model", half))
            .await?;
        let vae = match (&self.config.xl_vae_repo, version.is_xl() && half) {
            (Some(repo), true) => self.get(repo, "diffusion_pytorch_model.safetensors").await?,
            _ => {
                self.get_first(model_id, &weight_candidates("vae", "diffusion_pytorch_model", half))
                    .await?
            }
        };

        let mut text_encoders = Vec::new();
        for (index, tokenizer_repo) in version.tokenizer_repos().iter().enumerate() {
            let dir = match index {
                0 => "text_encoder".to_string(),
                n => format!("text_encoder_{}", n + 1),
            };
            let weights = self
                .get_first(model_id, &weight_candidates(&dir, "model", half))
                .await?;
            let tokenizer = self.get(tokenizer_repo, "tokenizer.json").await?;
            text_encoders.push((weights, tokenizer));
        }

        Ok(StableDiffusionFiles {
            unet,
            vae,
            text_encoders,
        })
    }

    async fn stable_diffusion(
        &self,
        model_id: &str,
        input: UnetInput,
        device: &Device,
    ) -> Result<StableDiffusion> {
        let version = SdVersion::from_model_id(model_id);
        info!(model_id, ?version, ?input, "fetching stable diffusion weights");
        let files = self.stable_diffusion_files(model_id, version, device).await?;
        let device = device.clone();
        let use_flash_attn = self.config.use_flash_attn;
        build("stable diffusion", move || {
            StableDiffusion::new(version, input, &files, &device, use_flash_attn)
        })
        .await
    }

    async fn flux_files(&self, variant: FluxVariant) -> Result<FluxFiles> {
        let t5_repo = self.api.repo(Repo::with_revision(
            self.config.flux_t5_repo.clone(),
            RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let t5_model = t5_repo
            .get("model.safetensors")
            .await
            .context("failed to load T5 model file")?;
        let t5_config = t5_repo
            .get("config.json")
            .await
            .context("failed to get T5 config")?;
        let t5_tokenizer = self
            .get(&self.config.flux_t5_tokenizer_repo, "t5-v1_1-xxl.tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let clip_model = self
            .get(&self.config.flux_clip_repo, "model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_tokenizer = self
            .get(&self.config.flux_clip_repo, "tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let autoencoder = self
            .get(variant.repo(), "ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let transformer = self
            .get(variant.repo(), variant.weights_file())
            .await
            .context("failed to get flux model file")?;
        Ok(FluxFiles {
            t5_model,
            t5_config,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            transformer,
        })
    }

    async fn upscale_weights(&self, file: &str) -> Result<PathBuf> {
        match &self.config.upscale_weights_dir {
            Some(dir) => {
                let path = dir.join(file);
                if !path.is_file() {
                    bail!("{} does not exist", path.display());
                }
                Ok(path)
            }
            None => self.get(&self.config.upscale_repo, file).await,
        }
    }
}

impl Loader for CandleLoader {
    async fn load_text_to_image(
        &self,
        family: TextToImageFamily,
        model_id: &str,
        device: &Device,
    ) -> Result<TextToImageHandle> {
        match family {
            TextToImageFamily::Flux => {
                let variant = FluxVariant::from_model_id(model_id);
                info!(model_id, ?variant, "fetching flux weights");
                let files = self.flux_files(variant).await?;
                let device = device.clone();
                let pipeline =
                    build("flux", move || FluxPipeline::new(variant, &files, &device)).await?;
                Ok(Arc::new(pipeline))
            }
            TextToImageFamily::StableDiffusion | TextToImageFamily::StableDiffusionXl => {
                let pipeline = self
                    .stable_diffusion(model_id, UnetInput::Latents, device)
                    .await?;
                Ok(Arc::new(pipeline))
            }
            TextToImageFamily::StableDiffusion3 => {
                bail!("{family} is recognised but this build has no sampler for it")
            }
        }
    }

    async fn load_inpaint(&self, model_id: &str, device: &Device) -> Result<InpaintHandle> {
        let pipeline = self
            .stable_diffusion(model_id, UnetInput::Inpaint, device)
            .await?;
        Ok(Arc::new(pipeline))
    }

    async fn load_image_to_image(
        &self,
        model_id: &str,
        device: &Device,
    ) -> Result<ImageToImageHandle> {
        let pipeline = self
            .stable_diffusion(model_id, UnetInput::Latents, device)
            .await?;
        Ok(Arc::new(pipeline))
    }

    async fn load_controlnet(
        &self,
        base_model_id: &str,
        control_type: ControlType,
        device: &Device,
    ) -> Result<ControlNetHandle> {
        let repo = controlnet::weights_repo(control_type);
        let half = diffusion_dtype(device) == DType::F16;
        let weights = self
            .get_first(repo, &weight_candidates("", "diffusion_pytorch_model", half))
            .await?;
        let base = self
            .stable_diffusion(base_model_id, UnetInput::Latents, device)
            .await?;
        let use_flash_attn = self.config.use_flash_attn;
        info!(base_model_id, %control_type, repo, "building controlnet pipeline");
        let pipeline = build("controlnet", move || {
            ControlNetStableDiffusion::new(base, control_type, &weights, use_flash_attn)
        })
        .await?;
        Ok(Arc::new(pipeline))
    }

    async fn load_upscaler(
        &self,
        model: UpscaleModel,
        factor: UpscaleFactor,
        device: &Device,
    ) -> Result<UpscalerHandle> {
        let checkpoint = Checkpoint::for_model(model, factor);
        let weights = self.upscale_weights(checkpoint.file).await?;
        let device = device.clone();
        let upscaler = build("upscaler", move || Esrgan::new(checkpoint, &weights, &device)).await?;
        Ok(Arc::new(upscaler))
    }

    fn face_restore_available(&self) -> bool {
        self.config.face_restore_available()
    }

    #[cfg(feature = "face-restore")]
    async fn load_face_restorer(&self, _device: &Device) -> Result<FaceRestorerHandle> {
        use crate::pipelines::gfpgan::Gfpgan;

        let model = self
            .config
            .face_restore_model
            .clone()
            .ok_or_else(|| anyhow!("no face restoration model is configured"))?;
        let detector = self
            .config
            .face_detect_model
            .clone()
            .ok_or_else(|| anyhow!("no face detection model is configured"))?;
        let restorer = build("face restorer", move || Gfpgan::new(&model, &detector)).await?;
        Ok(Arc::new(restorer))
    }

    #[cfg(not(feature = "face-restore"))]
    async fn load_face_restorer(&self, _device: &Device) -> Result<FaceRestorerHandle> {
        bail!("built without the `face-restore` feature")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_precision_weights_come_first() {
        assert_eq!(
            weight_candidates("unet", "diffusion_pytorch_model", true),
            vec![
                "unet/diffusion_pytorch_model.fp16.safetensors".to_string(),
                "unet/diffusion_pytorch_model.safetensors".to_string(),
            ]
        );
        assert_eq!(
            weight_candidates("", "diffusion_pytorch_model", false),
            vec!["diffusion_pytorch_model.safetensors".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_local_upscale_weights_fail() {
        let config = EngineConfig {
            upscale_weights_dir: Some(std::env::temp_dir().join("easel-no-such-dir")),
            ..Default::default()
        };
        let loader = CandleLoader::new(config).unwrap();
        let err = loader.upscale_weights("RealESRGAN_x4plus.pth").await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}

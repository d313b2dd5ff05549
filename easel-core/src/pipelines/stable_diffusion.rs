use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::ddim::DDIMSchedulerConfig;
use candle_transformers::models::stable_diffusion::schedulers::{
    PredictionType, Scheduler, SchedulerConfig,
};
use candle_transformers::models::stable_diffusion::{
    self, clip, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::controlnet::ControlNet;
use super::{
    ImageToImageInvocation, ImageToImagePipeline, InpaintInvocation, InpaintPipeline,
    PipelineOutput, TextToImageInvocation, TextToImagePipeline,
};
use crate::seed::{self, SeededGenerator};
use crate::transform::{resize_mask, resize_to, snap_dimension};
use crate::{decoded_to_image, diffusion_dtype, image_to_tensor, mask_to_tensor, SdVersion};

/// Working sizes are snapped to this so every UNet level divides evenly.
const SIZE_MULTIPLE: usize = 64;

/// What the UNet is fed besides the noisy latents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnetInput {
    Latents,
    /// Latents, the downsampled mask and the masked image latents.
    Inpaint,
}

impl UnetInput {
    fn in_channels(self) -> usize {
        match self {
            UnetInput::Latents => 4,
            UnetInput::Inpaint => 9,
        }
    }
}

/// Local paths of everything a pipeline is built from.
#[derive(Debug, Clone)]
pub struct StableDiffusionFiles {
    pub unet: PathBuf,
    pub vae: PathBuf,
    /// Weights and tokenizer per text encoder, in encoder order.
    pub text_encoders: Vec<(PathBuf, PathBuf)>,
}

fn sd_config(version: SdVersion, input: UnetInput) -> StableDiffusionConfig {
    match (version, input) {
        (SdVersion::V1_5, _) => StableDiffusionConfig::v1_5(None, None, None),
        (SdVersion::V2_1, UnetInput::Latents) => StableDiffusionConfig::v2_1(None, None, None),
        // The 2.x inpainting checkpoint is trained at 512 with the 2.1 architecture.
        (SdVersion::V2_1, UnetInput::Inpaint) => {
            StableDiffusionConfig::v2_1(None, Some(512), Some(512))
        }
        (SdVersion::Xl, _) => StableDiffusionConfig::sdxl(None, None, None),
        (SdVersion::XlTurbo, _) => StableDiffusionConfig::sdxl_turbo(None, None, None),
    }
}

/// Scheduler replacing the configuration's own, when the checkpoint needs one.
///
/// The 2.1 configuration samples with v-prediction, but the 2.x inpainting
/// checkpoint predicts noise.
fn scheduler_override(version: SdVersion, input: UnetInput) -> Option<DDIMSchedulerConfig> {
    match (version, input) {
        (SdVersion::V2_1, UnetInput::Inpaint) => Some(DDIMSchedulerConfig {
            prediction_type: PredictionType::Epsilon,
            ..Default::default()
        }),
        _ => None,
    }
}

pub(crate) fn uses_guidance(guidance_scale: f64) -> bool {
    guidance_scale > 1.0
}

/// First scheduler step to run when `strength` of an init image is noised away.
pub(crate) fn start_step(steps: usize, strength: f64) -> usize {
    let kept = (steps as f64 * strength.clamp(0.0, 1.0)) as usize;
    steps - kept.min(steps)
}

struct PromptEncoder {
    tokenizer: Tokenizer,
    /// Token ids (1, max_len) to hidden states (1, max_len, dim).
    model: Box<dyn Module + Send + Sync>,
    max_len: usize,
    pad_id: u32,
}

impl PromptEncoder {
    fn new(
        config: &clip::Config,
        weights: &Path,
        tokenizer: &Path,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer)
            .map_err(anyhow::Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .get_vocab(true)
            .get(pad_token)
            .copied()
            .with_context(|| format!("CLIP tokenizer has no `{pad_token}` token"))?;
        let model = stable_diffusion::build_clip_transformer(config, weights, device, DType::F32)
            .context("failed to build CLIP text encoder")?;
        Ok(Self {
            tokenizer,
            model: Box::new(model),
            max_len: config.max_position_embeddings,
            pad_id,
        })
    }

    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_len {
            debug!(tokens = tokens.len(), max = self.max_len, "truncating prompt");
        }
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

pub(crate) struct InpaintLatents {
    /// (1, 1, h/8, w/8), 1 where the image is regenerated.
    pub mask: Tensor,
    pub masked_latents: Tensor,
}

pub(crate) struct Control<'a> {
    pub net: &'a ControlNet,
    /// (1, 3, h, w) in [0, 1].
    pub image: Tensor,
    pub scale: f64,
}

pub(crate) struct Denoise<'a> {
    pub steps: usize,
    pub guidance_scale: f64,
    pub width: usize,
    pub height: usize,
    pub text_embeddings: Tensor,
    /// Encoded image latents and the strength they are noised with.
    pub init: Option<(Tensor, f64)>,
    pub inpaint: Option<InpaintLatents>,
    pub control: Option<Control<'a>>,
}

pub(crate) struct Denoised {
    pub latents: Tensor,
    pub steps_run: usize,
}

/// Stable Diffusion 1.x, 2.x or XL with its text encoders, VAE and UNet.
pub struct StableDiffusion {
    version: SdVersion,
    input: UnetInput,
    config: StableDiffusionConfig,
    scheduler: Option<DDIMSchedulerConfig>,
    device: Device,
    dtype: DType,
    encoders: Vec<PromptEncoder>,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl StableDiffusion {
    pub fn new(
        version: SdVersion,
        input: UnetInput,
        files: &StableDiffusionFiles,
        device: &Device,
        use_flash_attn: bool,
    ) -> Result<Self> {
        if input == UnetInput::Inpaint && version.is_xl() {
            bail!("inpainting needs a Stable Diffusion 1.x or 2.x checkpoint");
        }
        let dtype = diffusion_dtype(device);
        let config = sd_config(version, input);

        let clip_configs: Vec<&clip::Config> =
            std::iter::once(&config.clip).chain(config.clip2.as_ref()).collect();
        if clip_configs.len() != files.text_encoders.len() {
            bail!(
                "{version:?} uses {} text encoders, got weights for {}",
                clip_configs.len(),
                files.text_encoders.len()
            );
        }
        let encoders = clip_configs
            .into_iter()
            .zip(&files.text_encoders)
            .map(|(clip_config, (weights, tokenizer))| {
                PromptEncoder::new(clip_config, weights, tokenizer, device)
            })
            .collect::<Result<Vec<_>>>()?;

        let vae = config
            .build_vae(&files.vae, device, dtype)
            .context("failed to build autoencoder")?;
        let unet = config
            .build_unet(&files.unet, device, input.in_channels(), use_flash_attn, dtype)
            .context("failed to build unet")?;
        info!(?version, ?input, ?dtype, "stable diffusion pipeline ready");

        Ok(Self {
            version,
            input,
            scheduler: scheduler_override(version, input),
            config,
            device: device.clone(),
            dtype,
            encoders,
            vae,
            unet,
        })
    }

    pub fn version(&self) -> SdVersion {
        self.version
    }

    pub(crate) fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn dtype(&self) -> DType {
        self.dtype
    }

    /// The requested size, or the model's native one, snapped for the UNet.
    pub(crate) fn working_size(&self, width: Option<usize>, height: Option<usize>) -> (usize, usize) {
        (
            snap_dimension(width.unwrap_or(self.config.width), SIZE_MULTIPLE),
            snap_dimension(height.unwrap_or(self.config.height), SIZE_MULTIPLE),
        )
    }

    /// Prompt embeddings, preceded by the negative prompt ones when guidance is on.
    pub(crate) fn text_embeddings(
        &self,
        prompt: &str,
        negative_prompt: Option<&str>,
        guidance_scale: f64,
    ) -> Result<Tensor> {
        let mut per_encoder = Vec::with_capacity(self.encoders.len());
        for encoder in &self.encoders {
            let cond = encoder.encode(prompt, &self.device)?;
            let embeddings = if uses_guidance(guidance_scale) {
                let uncond = encoder.encode(negative_prompt.unwrap_or(""), &self.device)?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            per_encoder.push(embeddings);
        }
        Ok(Tensor::cat(&per_encoder, D::Minus1)?.to_dtype(self.dtype)?)
    }

    fn encode_image(&self, image: &Tensor) -> Result<Tensor> {
        let latents = self.vae.encode(image)?.sample()?;
        Ok((latents * self.version.vae_scale())?)
    }

    pub(crate) fn decode(&self, latents: &Tensor) -> Result<DynamicImage> {
        let decoded = self.vae.decode(&(latents / self.version.vae_scale())?)?;
        decoded_to_image(&decoded)
    }

    fn build_scheduler(&self, steps: usize) -> Result<Box<dyn Scheduler>> {
        let scheduler = match &self.scheduler {
            Some(config) => config.build(steps)?,
            None => self.config.build_scheduler(steps)?,
        };
        Ok(scheduler)
    }

    pub(crate) fn denoise(
        &self,
        job: Denoise<'_>,
        mut generator: Option<&mut SeededGenerator>,
    ) -> Result<Denoised> {
        let guided = uses_guidance(job.guidance_scale);
        let batch = |t: Tensor| -> Result<Tensor> {
            if guided {
                Ok(Tensor::cat(&[&t, &t], 0)?)
            } else {
                Ok(t)
            }
        };

        let mut scheduler = self.build_scheduler(job.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let shape = (1, 4, job.height / 8, job.width / 8);

        let (mut latents, t_start) = match job.init {
            Some((init, strength)) => {
                let t_start = start_step(timesteps.len(), strength);
                let latents = if t_start < timesteps.len() {
                    let noise = seed::noise(generator.as_deref_mut(), shape, self.dtype, &self.device)?;
                    scheduler.add_noise(&init, noise, timesteps[t_start])?
                } else {
                    init
                };
                (latents, t_start)
            }
            None => {
                let noise = seed::noise(generator.as_deref_mut(), shape, self.dtype, &self.device)?;
                ((noise * scheduler.init_noise_sigma())?, 0)
            }
        };

        let inpaint = match job.inpaint {
            Some(InpaintLatents {
                mask,
                masked_latents,
            }) => Some((batch(mask)?, batch(masked_latents)?)),
            None => None,
        };
        let control = match job.control {
            Some(control) => Some(Control {
                image: batch(control.image)?,
                ..control
            }),
            None => None,
        };

        let mut steps_run = 0;
        for (index, &timestep) in timesteps.iter().enumerate().skip(t_start) {
            let input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let unet_input = match &inpaint {
                Some((mask, masked_latents)) => Tensor::cat(&[&input, mask, masked_latents], 1)?,
                None => input.clone(),
            };

            let noise_pred = match &control {
                Some(control) => {
                    let (down, mid) = control.net.forward(
                        &input,
                        timestep as f64,
                        &job.text_embeddings,
                        &control.image,
                        control.scale,
                    )?;
                    self.unet.forward_with_additional_residuals(
                        &unet_input,
                        timestep as f64,
                        &job.text_embeddings,
                        Some(down.as_slice()),
                        Some(&mid),
                    )?
                }
                None => self
                    .unet
                    .forward(&unet_input, timestep as f64, &job.text_embeddings)?,
            };

            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * job.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            steps_run += 1;
            debug!(step = index + 1, total = timesteps.len(), "denoising");
        }
        Ok(Denoised { latents, steps_run })
    }

    fn check_input(&self, expected: UnetInput) -> Result<()> {
        if self.input != expected {
            bail!("pipeline was built for {:?} input, not {expected:?}", self.input);
        }
        Ok(())
    }
}

impl TextToImagePipeline for StableDiffusion {
    fn run(&self, mut invocation: TextToImageInvocation) -> Result<PipelineOutput> {
        self.check_input(UnetInput::Latents)?;
        let (width, height) = self.working_size(invocation.width, invocation.height);
        let text_embeddings = self.text_embeddings(
            &invocation.prompt,
            invocation.negative_prompt.as_deref(),
            invocation.guidance_scale,
        )?;
        let denoised = self.denoise(
            Denoise {
                steps: invocation.num_inference_steps,
                guidance_scale: invocation.guidance_scale,
                width,
                height,
                text_embeddings,
                init: None,
                inpaint: None,
                control: None,
            },
            invocation.generator.as_mut(),
        )?;
        let image = self.decode(&denoised.latents)?;
        let target_width = invocation.width.unwrap_or(width) as u32;
        let target_height = invocation.height.unwrap_or(height) as u32;
        Ok(PipelineOutput::single(resize_to(&image, target_width, target_height)))
    }
}

impl InpaintPipeline for StableDiffusion {
    fn run(&self, mut invocation: InpaintInvocation) -> Result<PipelineOutput> {
        self.check_input(UnetInput::Inpaint)?;
        let (target_width, target_height) = (invocation.image.width(), invocation.image.height());
        let (width, height) =
            self.working_size(Some(target_width as usize), Some(target_height as usize));

        let image = resize_to(&invocation.image, width as u32, height as u32);
        let mask = resize_mask(&invocation.mask, width as u32, height as u32);
        let image = image_to_tensor(&image, &self.device, self.dtype)?;
        let keep = mask_to_tensor(&mask, &self.device, self.dtype)?.affine(-1.0, 1.0)?;
        let masked_latents = self.encode_image(&image.broadcast_mul(&keep)?)?;
        let latent_mask = resize_mask(&mask, (width / 8) as u32, (height / 8) as u32);
        let latent_mask = mask_to_tensor(&latent_mask, &self.device, self.dtype)?;
        let init = self.encode_image(&image)?;

        let text_embeddings = self.text_embeddings(
            &invocation.prompt,
            invocation.negative_prompt.as_deref(),
            invocation.guidance_scale,
        )?;
        let denoised = self.denoise(
            Denoise {
                steps: invocation.num_inference_steps,
                guidance_scale: invocation.guidance_scale,
                width,
                height,
                text_embeddings,
                init: Some((init, invocation.strength)),
                inpaint: Some(InpaintLatents {
                    mask: latent_mask,
                    masked_latents,
                }),
                control: None,
            },
            invocation.generator.as_mut(),
        )?;
        let image = self.decode(&denoised.latents)?;
        Ok(PipelineOutput::single(resize_to(&image, target_width, target_height)))
    }
}

impl ImageToImagePipeline for StableDiffusion {
    fn run(&self, mut invocation: ImageToImageInvocation) -> Result<PipelineOutput> {
        self.check_input(UnetInput::Latents)?;
        let (target_width, target_height) = (invocation.image.width(), invocation.image.height());
        let (width, height) =
            self.working_size(Some(target_width as usize), Some(target_height as usize));

        let image = resize_to(&invocation.image, width as u32, height as u32);
        let init = self.encode_image(&image_to_tensor(&image, &self.device, self.dtype)?)?;
        let text_embeddings = self.text_embeddings(
            &invocation.prompt,
            invocation.negative_prompt.as_deref(),
            invocation.guidance_scale,
        )?;
        let denoised = self.denoise(
            Denoise {
                steps: invocation.num_inference_steps,
                guidance_scale: invocation.guidance_scale,
                width,
                height,
                text_embeddings,
                init: Some((init, invocation.strength)),
                inpaint: None,
                control: None,
            },
            invocation.generator.as_mut(),
        )?;
        let image = self.decode(&denoised.latents)?;
        Ok(PipelineOutput::single(resize_to(&image, target_width, target_height)))
    }
}


#[cfg(test)]
mod tests {
    use image::{GenericImageView, GrayImage, Luma};

    use super::tiny::pipeline;
    use super::*;

    #[test]
    fn guidance_threshold() {
        assert!(uses_guidance(7.5));
        assert!(!uses_guidance(1.0));
        assert!(!uses_guidance(0.0));
    }

    #[test]
    fn inpaint_unet_takes_nine_channels() {
        assert_eq!(UnetInput::Latents.in_channels(), 4);
        assert_eq!(UnetInput::Inpaint.in_channels(), 9);
    }

    #[test]
    fn native_sizes_follow_the_version() {
        assert_eq!(sd_config(SdVersion::V1_5, UnetInput::Latents).width, 512);
        assert_eq!(sd_config(SdVersion::V2_1, UnetInput::Latents).width, 768);
        assert!(sd_config(SdVersion::Xl, UnetInput::Latents).clip2.is_some());
        assert!(sd_config(SdVersion::V1_5, UnetInput::Inpaint).clip2.is_none());
    }

    #[test]
    fn sd2_inpainting_runs_at_512_with_noise_prediction() {
        let config = sd_config(SdVersion::V2_1, UnetInput::Inpaint);
        assert_eq!((config.width, config.height), (512, 512));
        assert!(config.clip2.is_none());
        let scheduler = scheduler_override(SdVersion::V2_1, UnetInput::Inpaint).unwrap();
        assert!(matches!(scheduler.prediction_type, PredictionType::Epsilon));
        assert!(scheduler_override(SdVersion::V2_1, UnetInput::Latents).is_none());
        assert!(scheduler_override(SdVersion::V1_5, UnetInput::Inpaint).is_none());
    }

    #[test]
    fn strength_sets_the_first_step() {
        assert_eq!(start_step(20, 0.3), 14);
        assert_eq!(start_step(20, 1.0), 0);
        assert_eq!(start_step(20, 0.0), 20);
        assert_eq!(start_step(4, 1.5), 0);
    }

    fn invocation(width: Option<usize>, height: Option<usize>) -> TextToImageInvocation {
        TextToImageInvocation {
            prompt: "a lighthouse at dusk".to_string(),
            negative_prompt: None,
            width,
            height,
            num_inference_steps: 3,
            guidance_scale: 7.5,
            generator: Some(SeededGenerator::new(3, &Device::Cpu)),
        }
    }

    #[test]
    fn text_to_image_returns_the_requested_size() {
        let sd = pipeline(UnetInput::Latents);
        let out = TextToImagePipeline::run(&sd, invocation(Some(64), Some(64)))
            .unwrap()
            .into_first_image()
            .unwrap();
        assert_eq!(out.dimensions(), (64, 64));

        // Sampled at the snapped 64x128 and resized back.
        let out = TextToImagePipeline::run(&sd, invocation(Some(70), Some(130)))
            .unwrap()
            .into_first_image()
            .unwrap();
        assert_eq!(out.dimensions(), (70, 130));
    }

    #[test]
    fn text_embeddings_double_up_under_guidance() {
        let sd = pipeline(UnetInput::Latents);
        let guided = sd.text_embeddings("a lighthouse", Some("dusk"), 7.5).unwrap();
        assert_eq!(guided.dims(), &[2, 8, tiny::CONTEXT_DIM]);
        let plain = sd.text_embeddings("a lighthouse", None, 1.0).unwrap();
        assert_eq!(plain.dims(), &[1, 8, tiny::CONTEXT_DIM]);
    }

    #[test]
    fn image_to_image_runs_only_the_kept_steps() {
        let sd = pipeline(UnetInput::Latents);
        let init = Tensor::zeros((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        for (strength, expected) in [(0.5, 2), (1.0, 4), (0.0, 0)] {
            let text_embeddings = sd.text_embeddings("a lighthouse", None, 7.5).unwrap();
            let denoised = sd
                .denoise(
                    Denoise {
                        steps: 4,
                        guidance_scale: 7.5,
                        width: 64,
                        height: 64,
                        text_embeddings,
                        init: Some((init.clone(), strength)),
                        inpaint: None,
                        control: None,
                    },
                    None,
                )
                .unwrap();
            assert_eq!(denoised.steps_run, expected, "strength {strength}");
            assert_eq!(denoised.latents.dims(), &[1, 4, 8, 8]);
        }

        let out = ImageToImagePipeline::run(
            &sd,
            ImageToImageInvocation {
                prompt: "a lighthouse".to_string(),
                negative_prompt: None,
                image: DynamicImage::new_rgb8(96, 64),
                strength: 0.3,
                num_inference_steps: 4,
                guidance_scale: 7.5,
                generator: None,
            },
        )
        .unwrap()
        .into_first_image()
        .unwrap();
        assert_eq!(out.dimensions(), (96, 64));
    }

    #[test]
    fn inpainting_feeds_nine_channels_and_keeps_the_size() {
        let sd = pipeline(UnetInput::Inpaint);
        let out = InpaintPipeline::run(
            &sd,
            InpaintInvocation {
                prompt: "a lighthouse".to_string(),
                negative_prompt: Some("dusk".to_string()),
                image: DynamicImage::new_rgb8(64, 72),
                mask: GrayImage::from_pixel(64, 72, Luma([255])),
                strength: 0.8,
                num_inference_steps: 3,
                guidance_scale: 7.5,
                generator: Some(SeededGenerator::new(1, &Device::Cpu)),
            },
        )
        .unwrap()
        .into_first_image()
        .unwrap();
        assert_eq!(out.dimensions(), (64, 72));
    }

    #[test]
    fn pipelines_refuse_the_wrong_unet_input() {
        let sd = pipeline(UnetInput::Inpaint);
        assert!(TextToImagePipeline::run(&sd, invocation(Some(64), Some(64))).is_err());
    }
}

use anyhow::{bail, Context, Result};
use candle_nn::VarBuilder;
use std::path::Path;

mod model;
mod preprocess;

pub use model::{ControlNet, ControlNetConfig};
pub use preprocess::{preprocess, CANNY_HIGH, CANNY_LOW};

use super::stable_diffusion::{Control, Denoise, StableDiffusion};
use super::{ControlNetInvocation, ControlNetPipeline, PipelineOutput};
use crate::request::ControlType;
use crate::transform::resize_to;
use crate::{image_to_unit_tensor, SdVersion};

/// Default ControlNet weights per control type, for Stable Diffusion 1.5 bases.
pub fn weights_repo(control_type: ControlType) -> &'static str {
    match control_type {
        ControlType::Canny => "lllyasviel/control_v11p_sd15_canny",
        ControlType::Softedge => "lllyasviel/control_v11p_sd15_softedge",
        ControlType::Scribble => "lllyasviel/control_v11p_sd15_scribble",
        ControlType::Tile => "lllyasviel/control_v11f1e_sd15_tile",
    }
}

/// A Stable Diffusion base whose UNet is steered by a ControlNet.
pub struct ControlNetStableDiffusion {
    base: StableDiffusion,
    controlnet: ControlNet,
    control_type: ControlType,
}

impl ControlNetStableDiffusion {
    pub fn new(
        base: StableDiffusion,
        control_type: ControlType,
        weights: &Path,
        use_flash_attn: bool,
    ) -> Result<Self> {
        if base.version() != SdVersion::V1_5 {
            bail!(
                "{control_type} ControlNet weights target Stable Diffusion 1.x, not {:?}",
                base.version()
            );
        }
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], base.dtype(), base.device())
                .context("failed to build controlnet var builder")?
        };
        let controlnet = ControlNet::new(vb, &ControlNetConfig::sd15(), use_flash_attn)
            .context("failed to load controlnet")?;
        Ok(Self {
            base,
            controlnet,
            control_type,
        })
    }

    pub fn control_type(&self) -> ControlType {
        self.control_type
    }
}

impl ControlNetPipeline for ControlNetStableDiffusion {
    fn run(&self, mut invocation: ControlNetInvocation) -> Result<PipelineOutput> {
        let base = &self.base;
        let target_width = invocation
            .width
            .unwrap_or(invocation.control_image.width() as usize);
        let target_height = invocation
            .height
            .unwrap_or(invocation.control_image.height() as usize);
        let (width, height) = base.working_size(Some(target_width), Some(target_height));
        let control_image = resize_to(&invocation.control_image, width as u32, height as u32);
        let control_image = image_to_unit_tensor(&control_image, base.device(), base.dtype())?;

        let text_embeddings = base.text_embeddings(
            &invocation.prompt,
            invocation.negative_prompt.as_deref(),
            invocation.guidance_scale,
        )?;
        let denoised = base.denoise(
            Denoise {
                steps: invocation.num_inference_steps,
                guidance_scale: invocation.guidance_scale,
                width,
                height,
                text_embeddings,
                init: None,
                inpaint: None,
                control: Some(Control {
                    net: &self.controlnet,
                    image: control_image,
                    scale: invocation.conditioning_scale,
                }),
            },
            invocation.generator.as_mut(),
        )?;
        let image = base.decode(&denoised.latents)?;
        Ok(PipelineOutput::single(resize_to(
            &image,
            target_width as u32,
            target_height as u32,
        )))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use image::{DynamicImage, GenericImageView};

    use super::*;
    use crate::pipelines::stable_diffusion::{tiny, UnetInput};
    use crate::seed::SeededGenerator;

    fn tiny_controlnet() -> ControlNet {
        let config = ControlNetConfig {
            in_channels: 4,
            conditioning_channels: 3,
            conditioning_embedding_channels: vec![4, 4, 4, 4],
            blocks: vec![(8, true), (16, true)],
            layers_per_block: 1,
            attention_head_dim: 2,
            cross_attention_dim: tiny::CONTEXT_DIM,
            norm_num_groups: 4,
            ..ControlNetConfig::sd15()
        };
        assert_eq!(config.residual_count(), 4);
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        ControlNet::new(vb, &config, false).unwrap()
    }

    #[test]
    fn residuals_match_the_unet_skips() {
        let controlnet = tiny_controlnet();
        let latents = candle_core::Tensor::zeros((2, 4, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let context =
            candle_core::Tensor::zeros((2, 8, tiny::CONTEXT_DIM), DType::F32, &Device::Cpu).unwrap();
        let control = candle_core::Tensor::zeros((2, 3, 64, 64), DType::F32, &Device::Cpu).unwrap();
        let (down, mid) = controlnet.forward(&latents, 10., &context, &control, 1.0).unwrap();
        let shapes: Vec<Vec<usize>> = down.iter().map(|t| t.dims().to_vec()).collect();
        assert_eq!(
            shapes,
            vec![
                vec![2, 8, 8, 8],
                vec![2, 8, 8, 8],
                vec![2, 8, 4, 4],
                vec![2, 16, 4, 4]
            ]
        );
        assert_eq!(mid.dims(), &[2, 16, 4, 4]);
    }

    #[test]
    fn controlled_generation_runs_through_the_unet() {
        let pipeline = ControlNetStableDiffusion {
            base: tiny::pipeline(UnetInput::Latents),
            controlnet: tiny_controlnet(),
            control_type: ControlType::Canny,
        };
        let invocation = ControlNetInvocation {
            prompt: "a lighthouse".to_string(),
            negative_prompt: None,
            control_image: DynamicImage::new_rgb8(80, 64),
            width: None,
            height: None,
            num_inference_steps: 3,
            guidance_scale: 7.5,
            conditioning_scale: 0.5,
            generator: Some(SeededGenerator::new(5, &Device::Cpu)),
        };
        let out = pipeline.run(invocation).unwrap().into_first_image().unwrap();
        assert_eq!(out.dimensions(), (80, 64));
        assert_eq!(pipeline.control_type(), ControlType::Canny);
    }
}

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::text_model::{
    Activation, ClipTextConfig, ClipTextTransformer,
};
use candle_transformers::models::flux::{autoencoder, model, sampling};
use candle_transformers::models::t5::{self, T5EncoderModel};
use tokenizers::Tokenizer;
use tracing::info;

use super::{PipelineOutput, TextToImageInvocation, TextToImagePipeline};
use crate::seed;
use crate::transform::resize_to;
use crate::{tensor_to_image, FluxVariant};

const T5_TOKENS: usize = 256;

/// Local paths of everything a Flux pipeline is built from.
#[derive(Debug, Clone)]
pub struct FluxFiles {
    pub t5_model: PathBuf,
    pub t5_config: PathBuf,
    pub t5_tokenizer: PathBuf,
    pub clip_model: PathBuf,
    pub clip_tokenizer: PathBuf,
    pub autoencoder: PathBuf,
    pub transformer: PathBuf,
}

fn clip_config() -> ClipTextConfig {
    ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    }
}

fn load_tokenizer(path: &Path, what: &str) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(Error::msg)
        .with_context(|| format!("failed to load {what} tokenizer"))
}

pub struct FluxPipeline {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    // The T5 encoder keeps a position bias cache and needs `&mut` to run.
    t5_model: Mutex<T5EncoderModel>,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    clip_max_len: usize,
    autoencoder: autoencoder::AutoEncoder,
    flux_model: model::Flux,
}

impl FluxPipeline {
    pub fn new(variant: FluxVariant, files: &FluxFiles, device: &Device) -> Result<Self> {
        let dtype = device.bf16_default_to_f32();

        // --- T5 ---
        let t5_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.t5_model], dtype, device)
                .context("failed to build T5 var builder")?
        };
        let config_str =
            std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = load_tokenizer(&files.t5_tokenizer, "T5")?;

        // --- CLIP ---
        let clip_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.clip_model], dtype, device)
                .context("failed to build CLIP var builder")?
        };
        let clip_config = clip_config();
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer = load_tokenizer(&files.clip_tokenizer, "CLIP")?;

        // --- Autoencoder and transformer ---
        let (autoencoder_config, flux_config) = match variant {
            FluxVariant::Schnell => (autoencoder::Config::schnell(), model::Config::schnell()),
            FluxVariant::Dev => (autoencoder::Config::dev(), model::Config::dev()),
        };
        let autoencoder_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.autoencoder], dtype, device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder = autoencoder::AutoEncoder::new(&autoencoder_config, autoencoder_vb)
            .context("failed to load autoencoder")?;
        let flux_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.transformer], dtype, device)
                .context("failed to build flux var builder")?
        };
        let flux_model =
            model::Flux::new(&flux_config, flux_vb).context("failed to load flux model")?;
        info!(?variant, ?dtype, "flux pipeline ready");

        Ok(Self {
            variant,
            device: device.clone(),
            dtype,
            t5_model: Mutex::new(t5_model),
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            clip_max_len: clip_config.max_position_embeddings,
            autoencoder,
            flux_model,
        })
    }

    fn t5_embedding(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(T5_TOKENS, 0);
        let input_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        let mut t5_model = self
            .t5_model
            .lock()
            .map_err(|_| anyhow::anyhow!("T5 encoder lock poisoned"))?;
        Ok(t5_model.forward(&input_ids)?)
    }

    fn clip_embedding(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(self.clip_max_len);
        let input_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&input_ids)?)
    }
}

impl TextToImagePipeline for FluxPipeline {
    fn run(&self, mut invocation: TextToImageInvocation) -> Result<PipelineOutput> {
        let width = invocation.width.unwrap_or(1360);
        let height = invocation.height.unwrap_or(768);

        let noise_shape = (1, 16, height.div_ceil(16) * 2, width.div_ceil(16) * 2);
        let noise_img = seed::noise(
            invocation.generator.as_mut(),
            noise_shape,
            self.dtype,
            &self.device,
        )?;

        let t5_emb = self.t5_embedding(&invocation.prompt)?;
        let clip_emb = self.clip_embedding(&invocation.prompt)?;

        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = match self.variant {
            FluxVariant::Schnell => sampling::get_schedule(invocation.num_inference_steps, None),
            FluxVariant::Dev => sampling::get_schedule(
                invocation.num_inference_steps,
                Some((state.img.dim(1)?, 0.5, 1.15)),
            ),
        };

        let latent_img = sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            invocation.guidance_scale,
        )?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;
        let decoded = self.autoencoder.decode(&unpacked)?;

        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let image = tensor_to_image(&img.i(0)?.to_device(&Device::Cpu)?)?;
        // Latents cover whole 16 pixel patches.
        Ok(PipelineOutput::single(resize_to(&image, width as u32, height as u32)))
    }
}

#[cfg(test)]
mod tests {
    use image::GenericImageView;
    use serde_json::json;

    use super::*;
    use crate::pipelines::stable_diffusion::tiny;
    use crate::seed::SeededGenerator;

    const DIM: usize = 8;

    fn tiny_pipeline(variant: FluxVariant) -> FluxPipeline {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);

        let t5_config: t5::Config = serde_json::from_value(json!({
            "vocab_size": tiny::WORDS.len(),
            "d_model": DIM,
            "d_kv": 4,
            "d_ff": 16,
            "num_layers": 1,
            "num_heads": 2,
            "relative_attention_num_buckets": 32,
            "relative_attention_max_distance": 128,
            "dropout_rate": 0.0,
            "layer_norm_epsilon": 1e-6,
            "initializer_factor": 1.0,
            "feed_forward_proj": "gated-gelu",
            "is_encoder_decoder": true,
            "pad_token_id": 0,
            "eos_token_id": 1
        }))
        .unwrap();
        let t5_model = T5EncoderModel::load(vb.pp("t5"), &t5_config).unwrap();

        let clip_config = ClipTextConfig {
            vocab_size: tiny::WORDS.len(),
            projection_dim: DIM,
            activation: Activation::QuickGelu,
            intermediate_size: 16,
            embed_dim: DIM,
            max_position_embeddings: 8,
            pad_with: None,
            num_hidden_layers: 1,
            num_attention_heads: 2,
        };
        let clip_model = ClipTextTransformer::new(vb.pp("clip"), &clip_config).unwrap();

        let mut autoencoder_config = autoencoder::Config::schnell();
        autoencoder_config.ch = 32;
        autoencoder_config.ch_mult = vec![1, 1, 1, 1];
        autoencoder_config.num_res_blocks = 1;
        let autoencoder = autoencoder::AutoEncoder::new(&autoencoder_config, vb.pp("ae")).unwrap();

        let mut flux_config = match variant {
            FluxVariant::Schnell => model::Config::schnell(),
            FluxVariant::Dev => model::Config::dev(),
        };
        flux_config.vec_in_dim = DIM;
        flux_config.context_in_dim = DIM;
        flux_config.hidden_size = 32;
        flux_config.num_heads = 2;
        flux_config.depth = 1;
        flux_config.depth_single_blocks = 1;
        flux_config.axes_dim = vec![4, 6, 6];
        let flux_model = model::Flux::new(&flux_config, vb.pp("flux")).unwrap();

        FluxPipeline {
            variant,
            device: device.clone(),
            dtype: DType::F32,
            t5_model: Mutex::new(t5_model),
            t5_tokenizer: tiny::tokenizer(),
            clip_model,
            clip_tokenizer: tiny::tokenizer(),
            clip_max_len: clip_config.max_position_embeddings,
            autoencoder,
            flux_model,
        }
    }

    fn invocation(width: usize, height: usize) -> TextToImageInvocation {
        TextToImageInvocation {
            prompt: "a lighthouse at dusk".to_string(),
            negative_prompt: None,
            width: Some(width),
            height: Some(height),
            num_inference_steps: 2,
            guidance_scale: 3.5,
            generator: Some(SeededGenerator::new(11, &Device::Cpu)),
        }
    }

    #[test]
    fn both_variants_decode_to_the_requested_size() {
        for variant in [FluxVariant::Schnell, FluxVariant::Dev] {
            let pipeline = tiny_pipeline(variant);
            let out = pipeline
                .run(invocation(32, 32))
                .unwrap()
                .into_first_image()
                .unwrap();
            assert_eq!(out.dimensions(), (32, 32), "{variant:?}");
        }
    }

    #[test]
    fn sizes_off_the_patch_grid_are_resized_back() {
        let pipeline = tiny_pipeline(FluxVariant::Schnell);
        let out = pipeline
            .run(invocation(40, 24))
            .unwrap()
            .into_first_image()
            .unwrap();
        assert_eq!(out.dimensions(), (40, 24));
    }

    #[test]
    fn long_clip_prompts_are_truncated() {
        let pipeline = tiny_pipeline(FluxVariant::Schnell);
        let prompt = ["a lighthouse at dusk"; 4].join(" ");
        let embedding = pipeline.clip_embedding(&prompt).unwrap();
        assert_eq!(embedding.dims(), &[1, DIM]);
    }
}

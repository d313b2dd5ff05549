//! ControlNet for Stable Diffusion 1.x, in the diffusers weight layout.
//!
//! The encoder half of the UNet plus a small conditioning embedding; each
//! skip connection and the mid block output go through a zero-initialised
//! 1x1 convolution and are added to the UNet's own residuals.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};
use candle_transformers::models::stable_diffusion::embeddings::{TimestepEmbedding, Timesteps};
use candle_transformers::models::stable_diffusion::unet_2d_blocks::{
    CrossAttnDownBlock2D, CrossAttnDownBlock2DConfig, DownBlock2D, DownBlock2DConfig,
    UNetMidBlock2DCrossAttn, UNetMidBlock2DCrossAttnConfig,
};

#[derive(Debug, Clone)]
pub struct ControlNetConfig {
    pub in_channels: usize,
    pub conditioning_channels: usize,
    pub conditioning_embedding_channels: Vec<usize>,
    /// Output channels and whether the block has cross attention.
    pub blocks: Vec<(usize, bool)>,
    pub layers_per_block: usize,
    pub attention_head_dim: usize,
    pub cross_attention_dim: usize,
    pub norm_num_groups: usize,
    pub norm_eps: f64,
    pub downsample_padding: usize,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub use_linear_projection: bool,
}

impl ControlNetConfig {
    pub fn sd15() -> Self {
        Self {
            in_channels: 4,
            conditioning_channels: 3,
            conditioning_embedding_channels: vec![16, 32, 96, 256],
            blocks: vec![(320, true), (640, true), (1280, true), (1280, false)],
            layers_per_block: 2,
            attention_head_dim: 8,
            cross_attention_dim: 768,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            downsample_padding: 1,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            use_linear_projection: false,
        }
    }

    /// Number of zero convolutions on the skip connections.
    pub fn residual_count(&self) -> usize {
        let last = self.blocks.len().saturating_sub(1);
        1 + self
            .blocks
            .iter()
            .enumerate()
            .map(|(i, _)| self.layers_per_block + usize::from(i < last))
            .sum::<usize>()
    }
}

fn conv3x3(in_c: usize, out_c: usize, stride: usize, vs: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    conv2d(in_c, out_c, 3, cfg, vs)
}

fn zero_conv(channels: usize, vs: VarBuilder) -> Result<Conv2d> {
    conv2d(channels, channels, 1, Default::default(), vs)
}

/// Maps the control image down to latent resolution.
struct ConditioningEmbedding {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
}

impl ConditioningEmbedding {
    fn new(vs: VarBuilder, in_c: usize, channels: &[usize], out_c: usize) -> Result<Self> {
        let first = channels[0];
        let last = channels[channels.len() - 1];
        let conv_in = conv3x3(in_c, first, 1, vs.pp("conv_in"))?;
        let vs_b = vs.pp("blocks");
        let mut blocks = Vec::with_capacity(2 * (channels.len() - 1));
        for (i, pair) in channels.windows(2).enumerate() {
            blocks.push(conv3x3(pair[0], pair[0], 1, vs_b.pp((2 * i).to_string()))?);
            blocks.push(conv3x3(pair[0], pair[1], 2, vs_b.pp((2 * i + 1).to_string()))?);
        }
        let conv_out = conv3x3(last, out_c, 1, vs.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = self.conv_in.forward(xs)?.silu()?;
        for block in &self.blocks {
            xs = block.forward(&xs)?.silu()?;
        }
        self.conv_out.forward(&xs)
    }
}

enum DownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

pub struct ControlNet {
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    conv_in: Conv2d,
    cond_embedding: ConditioningEmbedding,
    down_blocks: Vec<DownBlock>,
    zero_convs: Vec<Conv2d>,
    mid_block: UNetMidBlock2DCrossAttn,
    mid_zero_conv: Conv2d,
}

impl ControlNet {
    pub fn new(vs: VarBuilder, config: &ControlNetConfig, use_flash_attn: bool) -> Result<Self> {
        let base_channels = config.blocks[0].0;
        let time_embed_dim = base_channels * 4;
        let time_proj = Timesteps::new(base_channels, config.flip_sin_to_cos, config.freq_shift);
        let time_embedding =
            TimestepEmbedding::new(vs.pp("time_embedding"), base_channels, time_embed_dim)?;
        let conv_in = conv3x3(config.in_channels, base_channels, 1, vs.pp("conv_in"))?;
        let cond_embedding = ConditioningEmbedding::new(
            vs.pp("controlnet_cond_embedding"),
            config.conditioning_channels,
            &config.conditioning_embedding_channels,
            base_channels,
        )?;

        let vs_zero = vs.pp("controlnet_down_blocks");
        let mut zero_convs = vec![zero_conv(base_channels, vs_zero.pp("0"))?];
        let vs_down = vs.pp("down_blocks");
        let n_blocks = config.blocks.len();
        let mut down_blocks = Vec::with_capacity(n_blocks);
        for (i, &(out_channels, cross_attn)) in config.blocks.iter().enumerate() {
            let in_channels = if i > 0 {
                config.blocks[i - 1].0
            } else {
                base_channels
            };
            let add_downsample = i < n_blocks - 1;
            let downblock = DownBlock2DConfig {
                num_layers: config.layers_per_block,
                resnet_eps: config.norm_eps,
                resnet_groups: config.norm_num_groups,
                add_downsample,
                downsample_padding: config.downsample_padding,
                ..Default::default()
            };
            let block = if cross_attn {
                let cfg = CrossAttnDownBlock2DConfig {
                    downblock,
                    attn_num_head_channels: config.attention_head_dim,
                    cross_attention_dim: config.cross_attention_dim,
                    sliced_attention_size: None,
                    use_linear_projection: config.use_linear_projection,
                    transformer_layers_per_block: 1,
                };
                DownBlock::CrossAttn(CrossAttnDownBlock2D::new(
                    vs_down.pp(i.to_string()),
                    in_channels,
                    out_channels,
                    Some(time_embed_dim),
                    use_flash_attn,
                    cfg,
                )?)
            } else {
                DownBlock::Basic(DownBlock2D::new(
                    vs_down.pp(i.to_string()),
                    in_channels,
                    out_channels,
                    Some(time_embed_dim),
                    downblock,
                )?)
            };
            down_blocks.push(block);
            for _ in 0..config.layers_per_block + usize::from(add_downsample) {
                let index = zero_convs.len();
                zero_convs.push(zero_conv(out_channels, vs_zero.pp(index.to_string()))?);
            }
        }

        let mid_channels = config.blocks[n_blocks - 1].0;
        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            output_scale_factor: 1.,
            cross_attn_dim: config.cross_attention_dim,
            attn_num_head_channels: config.attention_head_dim,
            resnet_groups: Some(config.norm_num_groups),
            use_linear_projection: config.use_linear_projection,
            transformer_layers_per_block: 1,
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            vs.pp("mid_block"),
            mid_channels,
            Some(time_embed_dim),
            use_flash_attn,
            mid_cfg,
        )?;
        let mid_zero_conv = zero_conv(mid_channels, vs.pp("controlnet_mid_block"))?;

        Ok(Self {
            time_proj,
            time_embedding,
            conv_in,
            cond_embedding,
            down_blocks,
            zero_convs,
            mid_block,
            mid_zero_conv,
        })
    }

    /// Residuals for the UNet down blocks and mid block, scaled by `scale`.
    pub fn forward(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        control: &Tensor,
        scale: f64,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        let (bsize, _, _, _) = xs.dims4()?;
        let emb = (Tensor::ones(bsize, xs.dtype(), xs.device())? * timestep)?;
        let emb = self.time_proj.forward(&emb)?;
        let emb = self.time_embedding.forward(&emb)?;

        let control = control.to_dtype(xs.dtype())?;
        let mut xs = (self.conv_in.forward(xs)? + self.cond_embedding.forward(&control)?)?;
        let mut residuals = vec![xs.clone()];
        for block in &self.down_blocks {
            let (out, res) = match block {
                DownBlock::Basic(b) => b.forward(&xs, Some(&emb))?,
                DownBlock::CrossAttn(b) => {
                    b.forward(&xs, Some(&emb), Some(encoder_hidden_states))?
                }
            };
            residuals.extend(res);
            xs = out;
        }
        let mid = self
            .mid_block
            .forward(&xs, Some(&emb), Some(encoder_hidden_states))?;

        let down = residuals
            .iter()
            .zip(&self.zero_convs)
            .map(|(res, conv)| conv.forward(res)? * scale)
            .collect::<Result<Vec<_>>>()?;
        let mid = (self.mid_zero_conv.forward(&mid)? * scale)?;
        Ok((down, mid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sd15_has_twelve_skip_residuals() {
        assert_eq!(ControlNetConfig::sd15().residual_count(), 12);
    }
}

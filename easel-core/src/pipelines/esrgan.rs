//! RRDBNet super-resolution, for both ESRGAN checkpoint layouts.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{conv2d, ops::leaky_relu, Conv2d, Conv2dConfig, VarBuilder};
use image::{DynamicImage, RgbImage};
use tracing::{debug, info};

use super::Upscaler;
use crate::request::{UpscaleFactor, UpscaleModel};
use crate::{image_to_unit_tensor, tensor_to_image};

/// Parameter naming of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// `conv_first`, `body.N.rdbM.convK`, ... as written by BasicSR.
    RealEsrgan,
    /// `model.0`, `model.1.sub.N.RDBM.convK.0`, ... from the original ESRGAN release.
    Legacy,
}

impl WeightLayout {
    fn conv_first(self) -> &'static str {
        match self {
            Self::RealEsrgan => "conv_first",
            Self::Legacy => "model.0",
        }
    }

    fn rdb_conv(self, block: usize, rdb: usize, conv: usize) -> String {
        match self {
            Self::RealEsrgan => format!("body.{block}.rdb{rdb}.conv{conv}"),
            Self::Legacy => format!("model.1.sub.{block}.RDB{rdb}.conv{conv}.0"),
        }
    }

    fn conv_body(self, num_block: usize) -> String {
        match self {
            Self::RealEsrgan => "conv_body".to_string(),
            Self::Legacy => format!("model.1.sub.{num_block}"),
        }
    }

    fn tail(self) -> [&'static str; 4] {
        match self {
            Self::RealEsrgan => ["conv_up1", "conv_up2", "conv_hr", "conv_last"],
            Self::Legacy => ["model.3", "model.6", "model.8", "model.10"],
        }
    }
}

/// Which checkpoint serves a model family and factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub file: &'static str,
    pub net_scale: u32,
    pub layout: WeightLayout,
}

impl Checkpoint {
    pub fn for_model(model: UpscaleModel, factor: UpscaleFactor) -> Self {
        match (model, factor) {
            (UpscaleModel::RealEsrgan, UpscaleFactor::X4) => Self {
                file: "RealESRGAN_x4plus.pth",
                net_scale: 4,
                layout: WeightLayout::RealEsrgan,
            },
            (UpscaleModel::RealEsrgan, UpscaleFactor::X2) => Self {
                file: "RealESRGAN_x2plus.pth",
                net_scale: 2,
                layout: WeightLayout::RealEsrgan,
            },
            (UpscaleModel::Esrgan, _) => Self {
                file: "RRDB_ESRGAN_x4.pth",
                net_scale: 4,
                layout: WeightLayout::Legacy,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RrdbConfig {
    pub num_in_ch: usize,
    pub num_out_ch: usize,
    pub num_feat: usize,
    pub num_block: usize,
    pub num_grow_ch: usize,
    pub scale: u32,
}

impl RrdbConfig {
    pub fn esrgan(scale: u32) -> Self {
        Self {
            num_in_ch: 3,
            num_out_ch: 3,
            num_feat: 64,
            num_block: 23,
            num_grow_ch: 32,
            scale,
        }
    }

    /// Pixel-unshuffle factor applied before the first convolution.
    fn unshuffle(&self) -> usize {
        match self.scale {
            1 => 4,
            2 => 2,
            _ => 1,
        }
    }
}

fn conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> candle_core::Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_c, out_c, 3, cfg, vb)
}

fn lrelu(xs: &Tensor) -> candle_core::Result<Tensor> {
    leaky_relu(xs, 0.2)
}

/// (b, c, h, w) -> (b, c * r * r, h / r, w / r).
pub(crate) fn pixel_unshuffle(xs: &Tensor, r: usize) -> candle_core::Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    xs.reshape((b, c, h / r, r, w / r, r))?
        .permute((0, 1, 3, 5, 2, 4))?
        .reshape((b, c * r * r, h / r, w / r))
}

struct ResidualDenseBlock {
    convs: Vec<Conv2d>,
}

impl ResidualDenseBlock {
    fn new(
        num_feat: usize,
        num_grow_ch: usize,
        name: impl Fn(usize) -> String,
        vb: &VarBuilder,
    ) -> candle_core::Result<Self> {
        let convs = (0..5)
            .map(|i| {
                let in_c = num_feat + i * num_grow_ch;
                let out_c = if i == 4 { num_feat } else { num_grow_ch };
                conv3x3(in_c, out_c, vb.pp(name(i + 1)))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { convs })
    }
}

impl Module for ResidualDenseBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut features = vec![xs.clone()];
        for conv in &self.convs[..4] {
            let out = lrelu(&conv.forward(&Tensor::cat(&features, 1)?)?)?;
            features.push(out);
        }
        let out = self.convs[4].forward(&Tensor::cat(&features, 1)?)?;
        (out * 0.2)? + xs
    }
}

struct Rrdb {
    rdbs: Vec<ResidualDenseBlock>,
}

impl Module for Rrdb {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut out = xs.clone();
        for rdb in &self.rdbs {
            out = rdb.forward(&out)?;
        }
        (out * 0.2)? + xs
    }
}

pub struct RrdbNet {
    config: RrdbConfig,
    conv_first: Conv2d,
    body: Vec<Rrdb>,
    conv_body: Conv2d,
    conv_up1: Conv2d,
    conv_up2: Conv2d,
    conv_hr: Conv2d,
    conv_last: Conv2d,
}

impl RrdbNet {
    pub fn new(config: RrdbConfig, layout: WeightLayout, vb: VarBuilder) -> candle_core::Result<Self> {
        let unshuffle = config.unshuffle();
        let num_feat = config.num_feat;
        let conv_first = conv3x3(
            config.num_in_ch * unshuffle * unshuffle,
            num_feat,
            vb.pp(layout.conv_first()),
        )?;
        let body = (0..config.num_block)
            .map(|block| {
                let rdbs = (1..=3)
                    .map(|rdb| {
                        ResidualDenseBlock::new(
                            num_feat,
                            config.num_grow_ch,
                            |conv| layout.rdb_conv(block, rdb, conv),
                            &vb,
                        )
                    })
                    .collect::<candle_core::Result<Vec<_>>>()?;
                Ok(Rrdb { rdbs })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let conv_body = conv3x3(num_feat, num_feat, vb.pp(layout.conv_body(config.num_block)))?;
        let [up1, up2, hr, last] = layout.tail();
        let conv_up1 = conv3x3(num_feat, num_feat, vb.pp(up1))?;
        let conv_up2 = conv3x3(num_feat, num_feat, vb.pp(up2))?;
        let conv_hr = conv3x3(num_feat, num_feat, vb.pp(hr))?;
        let conv_last = conv3x3(num_feat, config.num_out_ch, vb.pp(last))?;
        Ok(Self {
            config,
            conv_first,
            body,
            conv_body,
            conv_up1,
            conv_up2,
            conv_hr,
            conv_last,
        })
    }

    pub fn scale(&self) -> u32 {
        self.config.scale
    }
}

impl Module for RrdbNet {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let unshuffle = self.config.unshuffle();
        let xs = if unshuffle > 1 {
            pixel_unshuffle(xs, unshuffle)?
        } else {
            xs.clone()
        };
        let feat = self.conv_first.forward(&xs)?;
        let mut body = feat.clone();
        for block in &self.body {
            body = block.forward(&body)?;
        }
        let feat = (&feat + self.conv_body.forward(&body)?)?;

        let (_, _, h, w) = feat.dims4()?;
        let feat = lrelu(&self.conv_up1.forward(&feat.upsample_nearest2d(h * 2, w * 2)?)?)?;
        let feat = lrelu(&self.conv_up2.forward(&feat.upsample_nearest2d(h * 4, w * 4)?)?)?;
        self.conv_last.forward(&lrelu(&self.conv_hr.forward(&feat)?)?)
    }
}

/// Reads a `.pth` checkpoint, preferring the EMA parameters.
fn load_checkpoint(path: &Path, device: &Device) -> Result<VarBuilder<'static>> {
    let tensors = ["params_ema", "params"].iter().find_map(|key| {
        candle_core::pickle::read_all_with_key(path, Some(key))
            .ok()
            .filter(|tensors| !tensors.is_empty())
    });
    let tensors = match tensors {
        Some(tensors) => tensors,
        None => candle_core::pickle::read_all(path)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?,
    };
    debug!(tensors = tensors.len(), path = %path.display(), "read checkpoint");
    let tensors: HashMap<String, Tensor> = tensors.into_iter().collect();
    Ok(VarBuilder::from_tensors(tensors, DType::F32, device))
}

/// An RRDBNet checkpoint ready to upscale images, always in full precision.
pub struct Esrgan {
    net: RrdbNet,
    checkpoint: Checkpoint,
    device: Device,
}

impl Esrgan {
    pub fn new(checkpoint: Checkpoint, weights: &Path, device: &Device) -> Result<Self> {
        let vb = load_checkpoint(weights, device)?;
        let net = RrdbNet::new(RrdbConfig::esrgan(checkpoint.net_scale), checkpoint.layout, vb)
            .with_context(|| format!("failed to build RRDBNet from {}", checkpoint.file))?;
        info!(file = checkpoint.file, scale = checkpoint.net_scale, "upscaler ready");
        Ok(Self {
            net,
            checkpoint,
            device: device.clone(),
        })
    }

    pub(crate) fn from_net(net: RrdbNet, checkpoint: Checkpoint, device: &Device) -> Self {
        Self {
            net,
            checkpoint,
            device: device.clone(),
        }
    }
}

impl Upscaler for Esrgan {
    fn net_scale(&self) -> u32 {
        self.net.scale()
    }

    fn enhance(&self, image: &RgbImage) -> Result<RgbImage> {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let multiple = self.net.config.unshuffle();
        let pad_h = (multiple - height % multiple) % multiple;
        let pad_w = (multiple - width % multiple) % multiple;

        let xs = image_to_unit_tensor(
            &DynamicImage::ImageRgb8(image.clone()),
            &self.device,
            DType::F32,
        )?;
        let xs = xs.pad_with_same(2, 0, pad_h)?.pad_with_same(3, 0, pad_w)?;
        let scale = self.net.scale() as usize;
        let out = self
            .net
            .forward(&xs)?
            .narrow(2, 0, height * scale)?
            .narrow(3, 0, width * scale)?;
        let out = (out.clamp(0f32, 1f32)? * 255.)?
            .round()?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::U8)?;
        Ok(tensor_to_image(&out.i(0)?)?.to_rgb8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny(scale: u32) -> RrdbConfig {
        RrdbConfig {
            num_in_ch: 3,
            num_out_ch: 3,
            num_feat: 4,
            num_block: 1,
            num_grow_ch: 2,
            scale,
        }
    }

    #[test]
    fn checkpoints_per_combination() {
        let x4 = Checkpoint::for_model(UpscaleModel::RealEsrgan, UpscaleFactor::X4);
        assert_eq!((x4.file, x4.net_scale), ("RealESRGAN_x4plus.pth", 4));
        let x2 = Checkpoint::for_model(UpscaleModel::RealEsrgan, UpscaleFactor::X2);
        assert_eq!((x2.file, x2.net_scale), ("RealESRGAN_x2plus.pth", 2));
        let legacy = Checkpoint::for_model(UpscaleModel::Esrgan, UpscaleFactor::X2);
        assert_eq!(legacy.net_scale, 4);
        assert_eq!(legacy.layout, WeightLayout::Legacy);
    }

    #[test]
    fn layouts_name_the_same_parameters() {
        assert_eq!(WeightLayout::RealEsrgan.rdb_conv(3, 2, 5), "body.3.rdb2.conv5");
        assert_eq!(WeightLayout::Legacy.rdb_conv(3, 2, 5), "model.1.sub.3.RDB2.conv5.0");
        assert_eq!(WeightLayout::Legacy.conv_body(23), "model.1.sub.23");
    }

    #[test]
    fn pixel_unshuffle_moves_pixels_into_channels() {
        let xs = Tensor::arange(0f32, 16., &Device::Cpu)
            .unwrap()
            .reshape((1, 1, 4, 4))
            .unwrap();
        let ys = pixel_unshuffle(&xs, 2).unwrap();
        assert_eq!(ys.dims(), &[1, 4, 2, 2]);
        let first = ys.i((0, 0)).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(first, vec![vec![0., 2.], vec![8., 10.]]);
    }

    #[test]
    fn output_scales_with_the_network() {
        for (scale, layout) in [(4, WeightLayout::RealEsrgan), (2, WeightLayout::Legacy)] {
            let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
            let net = RrdbNet::new(tiny(scale), layout, vb).unwrap();
            let checkpoint = Checkpoint {
                file: "test.pth",
                net_scale: scale,
                layout,
            };
            let upscaler = Esrgan::from_net(net, checkpoint, &Device::Cpu);
            let out = upscaler.enhance(&RgbImage::new(5, 3)).unwrap();
            assert_eq!(out.dimensions(), (5 * scale, 3 * scale));
        }
    }
}

use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, GrayImage, RgbImage};
use tracing::warn;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("Running on CPU, to run on GPU(metal), build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("Running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Half precision on accelerators, full precision on the CPU.
pub(crate) fn diffusion_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts an image into a (1, 3, height, width) tensor scaled to [-1, 1].
pub fn image_to_tensor(image: &DynamicImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let tensor = Tensor::from_vec(rgb.into_raw(), (height as usize, width as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?
        .to_device(device)?
        .to_dtype(dtype)?;
    Ok(tensor)
}

/// Converts an image into a (1, 3, height, width) tensor scaled to [0, 1].
pub fn image_to_unit_tensor(image: &DynamicImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let tensor = Tensor::from_vec(rgb.into_raw(), (height as usize, width as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?
        .unsqueeze(0)?
        .to_device(device)?
        .to_dtype(dtype)?;
    Ok(tensor)
}

/// Binarises a mask into a (1, 1, height, width) tensor where 1 marks pixels to regenerate.
pub fn mask_to_tensor(mask: &GrayImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = mask.dimensions();
    let tensor = Tensor::from_vec(mask.as_raw().clone(), (1, 1, height as usize, width as usize), &Device::Cpu)?
        .to_dtype(DType::F32)?
        .ge(128f64)?
        .to_dtype(DType::F32)?
        .to_device(device)?
        .to_dtype(dtype)?;
    Ok(tensor)
}

/// Maps a decoded (1, 3, height, width) tensor in [-1, 1] back to an image.
pub(crate) fn decoded_to_image(decoded: &Tensor) -> Result<DynamicImage> {
    // (x + 1) * 127.5, plus a half so the u8 cast rounds instead of truncating.
    let img = decoded
        .to_dtype(DType::F32)?
        .clamp(-1f32, 1f32)?
        .affine(127.5, 128.0)?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::U8)?;
    tensor_to_image(&img.get(0)?)
}

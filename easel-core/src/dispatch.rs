//! Cache keys and the mapping from requests to pipeline invocations.

use std::fmt;

use candle_core::Device;
use image::{DynamicImage, GrayImage};

use crate::pipelines::{
    ControlNetInvocation, ImageToImageInvocation, InpaintInvocation, TextToImageInvocation,
    Upscaler,
};
use crate::request::{
    ControlNetParams, ControlType, Img2ImgUpscaleParams, InpaintParams, TextToImageRequest,
    UpscaleFactor, UpscaleModel,
};
use crate::seed::SeededGenerator;
use crate::transform::{resize_mask, resize_to, scaled_size};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlNetKey {
    pub base_model_id: String,
    pub control_type: ControlType,
}

impl fmt::Display for ControlNetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.base_model_id, self.control_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpscaleKey {
    pub model: UpscaleModel,
    pub factor: UpscaleFactor,
}

impl fmt::Display for UpscaleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_x{}", self.model, self.factor)
    }
}

/// A generator on the engine's device when the request carries a seed.
pub fn generator(seed: Option<u64>, device: &Device) -> Option<SeededGenerator> {
    seed.map(|seed| SeededGenerator::new(seed, device))
}

pub fn text_to_image_invocation(
    request: TextToImageRequest,
    device: &Device,
) -> TextToImageInvocation {
    TextToImageInvocation {
        generator: generator(request.seed, device),
        prompt: request.prompt,
        negative_prompt: request.negative_prompt,
        width: request.width,
        height: request.height,
        num_inference_steps: request.num_inference_steps,
        guidance_scale: request.guidance_scale,
    }
}

/// Brings image and mask to the target size, by default the image's own.
pub fn align_inpaint_inputs(
    image: &DynamicImage,
    mask: &GrayImage,
    width: Option<usize>,
    height: Option<usize>,
) -> (DynamicImage, GrayImage) {
    let width = width.map_or(image.width(), |w| w as u32);
    let height = height.map_or(image.height(), |h| h as u32);
    (
        resize_to(image, width, height),
        resize_mask(mask, width, height),
    )
}

pub fn inpaint_invocation(
    params: InpaintParams,
    image: &DynamicImage,
    mask: &GrayImage,
    device: &Device,
) -> InpaintInvocation {
    let (image, mask) = align_inpaint_inputs(image, mask, params.width, params.height);
    InpaintInvocation {
        generator: generator(params.seed, device),
        prompt: params.prompt,
        negative_prompt: params.negative_prompt,
        image,
        mask,
        strength: params.strength,
        num_inference_steps: params.num_inference_steps,
        guidance_scale: params.guidance_scale,
    }
}

pub fn controlnet_invocation(
    params: ControlNetParams,
    control_image: DynamicImage,
    device: &Device,
) -> ControlNetInvocation {
    ControlNetInvocation {
        generator: generator(params.seed, device),
        prompt: params.prompt,
        negative_prompt: params.negative_prompt,
        control_image,
        width: params.width,
        height: params.height,
        num_inference_steps: params.num_inference_steps,
        guidance_scale: params.guidance_scale,
        conditioning_scale: params.controlnet_conditioning_scale,
    }
}

pub fn image_to_image_invocation(
    params: Img2ImgUpscaleParams,
    image: DynamicImage,
    device: &Device,
) -> ImageToImageInvocation {
    ImageToImageInvocation {
        generator: generator(params.seed, device),
        prompt: params.prompt,
        negative_prompt: params.negative_prompt,
        image,
        strength: params.denoise_strength,
        num_inference_steps: params.num_inference_steps,
        guidance_scale: params.guidance_scale,
    }
}

/// Runs a super-resolution network and brings the result to `factor` times the input.
pub fn run_upscaler(
    upscaler: &dyn Upscaler,
    image: &DynamicImage,
    factor: UpscaleFactor,
) -> anyhow::Result<DynamicImage> {
    let input = image.to_rgb8();
    let (width, height) = scaled_size(input.width(), input.height(), factor.get())?;
    let output = DynamicImage::ImageRgb8(upscaler.enhance(&input)?);
    if upscaler.net_scale() != factor.get() {
        Ok(resize_to(&output, width, height))
    } else {
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{imageops, GenericImageView, Luma, Rgb, RgbImage};

    #[test]
    fn keys_render_stable_names() {
        let key = UpscaleKey {
            model: UpscaleModel::RealEsrgan,
            factor: UpscaleFactor::X4,
        };
        assert_eq!(key.to_string(), "realesrgan_x4");
        let key = ControlNetKey {
            base_model_id: "runwayml/stable-diffusion-v1-5".to_string(),
            control_type: ControlType::Canny,
        };
        assert_eq!(key.to_string(), "runwayml/stable-diffusion-v1-5+canny");
    }

    #[test]
    fn seeded_requests_get_a_generator_on_the_device() {
        let mut request = TextToImageRequest::new("runwayml/stable-diffusion-v1-5", "a fox");
        assert!(text_to_image_invocation(request.clone(), &Device::Cpu).generator.is_none());
        request.seed = Some(1234);
        request.width = Some(640);
        let invocation = text_to_image_invocation(request, &Device::Cpu);
        let generator = invocation.generator.unwrap();
        assert_eq!(generator.seed(), 1234);
        assert!(generator.device().is_cpu());
        assert_eq!(invocation.width, Some(640));
        assert_eq!(invocation.height, None);
        assert_eq!(invocation.negative_prompt, None);
    }

    #[test]
    fn mask_follows_the_image_size() {
        let image = DynamicImage::new_rgb8(64, 32);
        let mask = GrayImage::from_pixel(16, 16, Luma([255]));
        let (image, mask) = align_inpaint_inputs(&image, &mask, None, None);
        assert_eq!(image.dimensions(), (64, 32));
        assert_eq!(mask.dimensions(), (64, 32));

        let (image, mask) = align_inpaint_inputs(&image, &mask, Some(128), Some(96));
        assert_eq!(image.dimensions(), (128, 96));
        assert_eq!(mask.dimensions(), (128, 96));
    }

    #[test]
    fn inpaint_invocation_carries_parameters() {
        let mut params = InpaintParams::new("a boat");
        params.seed = Some(9);
        params.width = Some(48);
        let image = DynamicImage::new_rgb8(32, 32);
        let mask = GrayImage::new(32, 32);
        let invocation = inpaint_invocation(params, &image, &mask, &Device::Cpu);
        assert_eq!(invocation.image.dimensions(), (48, 32));
        assert_eq!(invocation.mask.dimensions(), (48, 32));
        assert_eq!(invocation.strength, crate::request::defaults::INPAINT_STRENGTH);
        assert_eq!(invocation.generator.map(|g| g.seed()), Some(9));
    }

    /// Nearest neighbour x4 that records the first pixel it saw.
    struct NearestX4 {
        seen: std::sync::Mutex<Option<Rgb<u8>>>,
    }

    impl Upscaler for NearestX4 {
        fn net_scale(&self) -> u32 {
            4
        }

        fn enhance(&self, image: &RgbImage) -> anyhow::Result<RgbImage> {
            *self.seen.lock().unwrap() = Some(*image.get_pixel(0, 0));
            Ok(imageops::resize(
                image,
                image.width() * 4,
                image.height() * 4,
                imageops::FilterType::Nearest,
            ))
        }
    }

    #[test]
    fn upscaler_output_is_resized_to_the_factor() {
        let upscaler = NearestX4 {
            seen: Default::default(),
        };
        let image = DynamicImage::new_rgb8(10, 6);
        let out = run_upscaler(&upscaler, &image, UpscaleFactor::X2).unwrap();
        assert_eq!(out.dimensions(), (20, 12));
        let out = run_upscaler(&upscaler, &image, UpscaleFactor::X4).unwrap();
        assert_eq!(out.dimensions(), (40, 24));
    }

    #[test]
    fn networks_see_rgb_input() {
        let upscaler = NearestX4 {
            seen: Default::default(),
        };
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([10, 20, 30])));
        let out = run_upscaler(&upscaler, &image, UpscaleFactor::X4).unwrap();
        assert_eq!(*upscaler.seen.lock().unwrap(), Some(Rgb([10, 20, 30])));
        assert_eq!(out.to_rgb8().get_pixel(5, 5), &Rgb([10, 20, 30]));
    }
}

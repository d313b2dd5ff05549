//! Pure image transforms applied around the pipelines.

use anyhow::anyhow;
use fast_image_resize::images::Image;
use fast_image_resize::{self as fr, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage, RgbaImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use crate::request::{Direction, UpscaleMethod};
use crate::{Error, Result};

/// Fill colour of the area exposed by outpainting.
pub const OUTPAINT_FILL: Rgb<u8> = Rgb([128, 128, 128]);

/// Grows the canvas by `pixels` on one side.
///
/// Returns the extended image, with the original pasted in place and the new
/// strip filled with neutral gray, together with a mask that is white over the
/// new strip and black over the original.
pub fn outpaint_canvas(
    image: &DynamicImage,
    direction: Direction,
    pixels: u32,
) -> Result<(DynamicImage, GrayImage)> {
    if pixels == 0 {
        return Err(Error::validation("pixels must be greater than zero"));
    }
    let (width, height) = (image.width(), image.height());
    let (new_width, new_height, offset_x, offset_y) = match direction {
        Direction::Left => (width + pixels, height, pixels, 0),
        Direction::Right => (width + pixels, height, 0, 0),
        Direction::Top => (width, height + pixels, 0, pixels),
        Direction::Bottom => (width, height + pixels, 0, 0),
    };

    let mut canvas = RgbImage::from_pixel(new_width, new_height, OUTPAINT_FILL);
    imageops::overlay(&mut canvas, &image.to_rgb8(), offset_x as i64, offset_y as i64);

    let mut mask = GrayImage::from_pixel(new_width, new_height, Luma([255]));
    if width > 0 && height > 0 {
        draw_filled_rect_mut(
            &mut mask,
            Rect::at(offset_x as i32, offset_y as i32).of_size(width, height),
            Luma([0]),
        );
    }
    Ok((DynamicImage::ImageRgb8(canvas), mask))
}

/// Lanczos resize, skipped when the image already has the target size.
pub fn resize_to(image: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    if image.width() == width && image.height() == height {
        image.clone()
    } else {
        image.resize_exact(width, height, FilterType::Lanczos3)
    }
}

/// Lanczos resize for masks.
pub fn resize_mask(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    if mask.dimensions() == (width, height) {
        mask.clone()
    } else {
        imageops::resize(mask, width, height, FilterType::Lanczos3)
    }
}

/// Resizes by an integer factor with a classic interpolation kernel.
pub fn traditional_upscale(
    image: &DynamicImage,
    method: UpscaleMethod,
    factor: u32,
) -> Result<DynamicImage> {
    let (width, height) = scaled_size(image.width(), image.height(), factor)?;
    let filter = match method {
        UpscaleMethod::Nearest => FilterType::Nearest,
        UpscaleMethod::Bilinear => FilterType::Triangle,
        UpscaleMethod::Bicubic => FilterType::CatmullRom,
        UpscaleMethod::Lanczos => FilterType::Lanczos3,
        UpscaleMethod::Area => return area_resize(image, width, height),
    };
    Ok(image.resize_exact(width, height, filter))
}

pub(crate) fn scaled_size(width: u32, height: u32, factor: u32) -> Result<(u32, u32)> {
    match (width.checked_mul(factor), height.checked_mul(factor)) {
        (Some(w), Some(h)) => Ok((w, h)),
        _ => Err(Error::validation(format!(
            "{width}x{height} cannot be scaled by {factor}"
        ))),
    }
}

/// Box filter resize: every output pixel is the coverage weighted mean of the
/// source pixels under its footprint.
pub fn area_resize(image: &DynamicImage, width: u32, height: u32) -> Result<DynamicImage> {
    let src = image.to_rgba8();
    let (src_width, src_height) = src.dimensions();
    let src = Image::from_vec_u8(src_width, src_height, src.into_raw(), PixelType::U8x4)
        .map_err(|e| Error::Generation(anyhow!("area resize source: {e}")))?;
    let mut dst = Image::new(width, height, PixelType::U8x4);
    let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(fr::FilterType::Box));
    Resizer::new()
        .resize(&src, &mut dst, &options)
        .map_err(|e| Error::Generation(anyhow!("area resize: {e}")))?;
    let out = RgbaImage::from_raw(width, height, dst.into_vec())
        .ok_or_else(|| Error::Generation(anyhow!("area resize returned a short buffer")))?;
    Ok(finish_like(image, out))
}

fn finish_like(original: &DynamicImage, out: RgbaImage) -> DynamicImage {
    let out = DynamicImage::ImageRgba8(out);
    if original.color().has_alpha() {
        out
    } else {
        DynamicImage::ImageRgb8(out.to_rgb8())
    }
}

/// Rounds a dimension down to a multiple of `multiple`, never below it.
pub(crate) fn snap_dimension(value: usize, multiple: usize) -> usize {
    (value / multiple).max(1) * multiple
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
    }

    #[test]
    fn outpaint_right_extends_width() {
        let image = solid(512, 512, [10, 20, 30]);
        let (canvas, mask) = outpaint_canvas(&image, Direction::Right, 128).unwrap();
        assert_eq!((canvas.width(), canvas.height()), (640, 512));
        assert_eq!(mask.dimensions(), (640, 512));
        let canvas = canvas.to_rgb8();
        assert_eq!(canvas.get_pixel(0, 0), &Rgb([10, 20, 30]));
        assert_eq!(canvas.get_pixel(511, 511), &Rgb([10, 20, 30]));
        assert_eq!(canvas.get_pixel(512, 0), &OUTPAINT_FILL);
        assert_eq!(mask.get_pixel(511, 0), &Luma([0]));
        assert_eq!(mask.get_pixel(512, 0), &Luma([255]));
        assert_eq!(mask.get_pixel(639, 511), &Luma([255]));
    }

    #[test]
    fn outpaint_left_offsets_the_original() {
        let image = solid(64, 32, [200, 0, 0]);
        let (canvas, mask) = outpaint_canvas(&image, Direction::Left, 16).unwrap();
        assert_eq!((canvas.width(), canvas.height()), (80, 32));
        let canvas = canvas.to_rgb8();
        assert_eq!(canvas.get_pixel(15, 0), &OUTPAINT_FILL);
        assert_eq!(canvas.get_pixel(16, 0), &Rgb([200, 0, 0]));
        assert_eq!(mask.get_pixel(15, 31), &Luma([255]));
        assert_eq!(mask.get_pixel(16, 31), &Luma([0]));
        assert_eq!(mask.get_pixel(79, 0), &Luma([0]));
    }

    #[test]
    fn outpaint_top_and_bottom_extend_height() {
        let image = solid(32, 64, [0, 0, 255]);
        let (top, top_mask) = outpaint_canvas(&image, Direction::Top, 8).unwrap();
        assert_eq!((top.width(), top.height()), (32, 72));
        assert_eq!(top_mask.get_pixel(0, 7), &Luma([255]));
        assert_eq!(top_mask.get_pixel(0, 8), &Luma([0]));
        assert_eq!(top.to_rgb8().get_pixel(0, 8), &Rgb([0, 0, 255]));

        let (bottom, bottom_mask) = outpaint_canvas(&image, Direction::Bottom, 8).unwrap();
        assert_eq!((bottom.width(), bottom.height()), (32, 72));
        assert_eq!(bottom_mask.get_pixel(0, 63), &Luma([0]));
        assert_eq!(bottom_mask.get_pixel(0, 64), &Luma([255]));
        assert_eq!(bottom.to_rgb8().get_pixel(31, 71), &OUTPAINT_FILL);
    }

    #[test]
    fn outpaint_rejects_zero_pixels() {
        let image = solid(8, 8, [0, 0, 0]);
        assert!(matches!(
            outpaint_canvas(&image, Direction::Left, 0),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn resize_helpers_hit_the_target() {
        let image = solid(300, 200, [1, 2, 3]);
        let mask = GrayImage::new(150, 100);
        let resized = resize_to(&image, 512, 512);
        let resized_mask = resize_mask(&mask, 512, 512);
        assert_eq!((resized.width(), resized.height()), resized_mask.dimensions());
        assert_eq!(resize_mask(&mask, 150, 100), mask);
    }

    #[test]
    fn every_method_doubles_the_size() {
        let image = solid(100, 100, [50, 100, 150]);
        for method in UpscaleMethod::ALL {
            let out = traditional_upscale(&image, method, 2).unwrap();
            assert_eq!((out.width(), out.height()), (200, 200), "{method}");
        }
    }

    #[test]
    fn area_averages_the_footprint() {
        let mut src = RgbImage::new(2, 2);
        src.put_pixel(0, 0, Rgb([0, 0, 0]));
        src.put_pixel(1, 0, Rgb([100, 100, 100]));
        src.put_pixel(0, 1, Rgb([200, 200, 200]));
        src.put_pixel(1, 1, Rgb([100, 100, 100]));
        let out = area_resize(&DynamicImage::ImageRgb8(src), 1, 1).unwrap().to_rgb8();
        assert_eq!(out.get_pixel(0, 0), &Rgb([100, 100, 100]));

        let up = area_resize(&solid(3, 3, [9, 8, 7]), 6, 6).unwrap();
        assert!(!up.color().has_alpha());
        let up = up.to_rgb8();
        assert!(up.pixels().all(|p| p == &Rgb([9, 8, 7])));
    }

    #[test]
    fn snapping_rounds_down() {
        assert_eq!(snap_dimension(700, 64), 640);
        assert_eq!(snap_dimension(10, 64), 64);
        assert_eq!(snap_dimension(512, 8), 512);
    }
}

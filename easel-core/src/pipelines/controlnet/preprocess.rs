//! Control image extraction. Pure image processing, no model involved.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::gradients::sobel_gradients;
use imageproc::morphology::dilate;

use crate::request::ControlType;

pub const CANNY_LOW: f32 = 100.0;
pub const CANNY_HIGH: f32 = 200.0;
const SOFTEDGE_SIGMA: f32 = 1.5;
/// Stroke half-width of scribbles, in pixels.
const SCRIBBLE_RADIUS: u8 = 2;
const TILE_DOWNSCALE: u32 = 8;

/// Control image for `control_type`, always RGB and the size of `image`.
pub fn preprocess(image: &DynamicImage, control_type: ControlType) -> DynamicImage {
    match control_type {
        ControlType::Canny => gray_to_rgb(canny_edges(image)),
        ControlType::Softedge => gray_to_rgb(soft_edges(image)),
        ControlType::Scribble => gray_to_rgb(dilate(&canny_edges(image), Norm::LInf, SCRIBBLE_RADIUS)),
        ControlType::Tile => tile(image),
    }
}

fn canny_edges(image: &DynamicImage) -> GrayImage {
    canny(&image.to_luma8(), CANNY_LOW, CANNY_HIGH)
}

/// Sobel gradient magnitude of the blurred image, normalised to the full range.
fn soft_edges(image: &DynamicImage) -> GrayImage {
    let smooth = gaussian_blur_f32(&image.to_luma8(), SOFTEDGE_SIGMA);
    let gradients = sobel_gradients(&smooth);
    let max = gradients.pixels().map(|p| p[0]).max().unwrap_or(0);
    let (width, height) = gradients.dimensions();
    if max == 0 {
        return GrayImage::new(width, height);
    }
    GrayImage::from_fn(width, height, |x, y| {
        let value = gradients.get_pixel(x, y)[0] as u32 * 255 / max as u32;
        Luma([value as u8])
    })
}

/// Blurred guide: shrink then grow back to the original size.
fn tile(image: &DynamicImage) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    let small = image.resize_exact(
        (width / TILE_DOWNSCALE).max(1),
        (height / TILE_DOWNSCALE).max(1),
        FilterType::Triangle,
    );
    DynamicImage::ImageRgb8(small.resize_exact(width, height, FilterType::CatmullRom).to_rgb8())
}

fn gray_to_rgb(gray: GrayImage) -> DynamicImage {
    DynamicImage::ImageRgb8(DynamicImage::ImageLuma8(gray).to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// Left half black, right half white.
    fn step_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 48, |x, _| {
            if x < 32 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        }))
    }

    #[test]
    fn every_type_keeps_the_size() {
        let image = step_image();
        for control_type in ControlType::ALL {
            let out = preprocess(&image, control_type);
            assert_eq!((out.width(), out.height()), (64, 48), "{control_type}");
            assert!(matches!(out, DynamicImage::ImageRgb8(_)));
        }
    }

    #[test]
    fn canny_finds_the_step() {
        let edges = preprocess(&step_image(), ControlType::Canny).to_luma8();
        let on_edge = (28..36).any(|x| edges.get_pixel(x, 24)[0] == 255);
        assert!(on_edge);
        assert_eq!(edges.get_pixel(5, 24)[0], 0);
        assert_eq!(edges.get_pixel(60, 24)[0], 0);
    }

    #[test]
    fn scribble_strokes_are_thicker_than_edges() {
        let image = step_image();
        let count = |img: DynamicImage| img.to_luma8().pixels().filter(|p| p[0] > 0).count();
        let edges = count(preprocess(&image, ControlType::Canny));
        let strokes = count(preprocess(&image, ControlType::Scribble));
        assert!(strokes > edges);
    }

    #[test]
    fn softedge_peaks_at_the_step() {
        let soft = preprocess(&step_image(), ControlType::Softedge).to_luma8();
        let peak = (0..64).map(|x| soft.get_pixel(x, 24)[0]).max().unwrap();
        assert_eq!(peak, 255);
        assert_eq!(soft.get_pixel(2, 24)[0], 0);
    }

    #[test]
    fn flat_image_has_no_soft_edges() {
        let flat = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([90, 90, 90])));
        let soft = preprocess(&flat, ControlType::Softedge).to_luma8();
        assert!(soft.pixels().all(|p| p[0] == 0));
    }
}

//! Face detection decoding, alignment and paste back around a face restorer.
//!
//! Faces are found on a letterboxed copy of the frame, aligned to a 512 crop
//! through their five landmarks, restored one by one and warped back under a
//! feathered mask. Pixels outside every crop are left untouched.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::rect::Rect;
use tracing::debug;

/// Side of an aligned face crop.
pub const FACE_SIZE: u32 = 512;

/// Eyes, nose tip and mouth corners of an aligned face in a [`FACE_SIZE`] crop.
pub const FACE_TEMPLATE: [[f32; 2]; 5] = [
    [192.98138, 239.94708],
    [318.90277, 240.1936],
    [256.63416, 314.01935],
    [201.26117, 371.41043],
    [313.08905, 371.15118],
];

/// Side of the square detector input.
pub const DETECT_SIZE: u32 = 640;
pub const DETECT_STRIDES: [usize; 3] = [8, 16, 32];
pub const SCORE_THRESHOLD: f32 = 0.8;
pub const NMS_IOU: f32 = 0.3;

/// Width of the fade at the border of a pasted crop.
const FEATHER: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Face {
    /// Left, top, right, bottom.
    pub bbox: [f32; 4],
    /// Same order as [`FACE_TEMPLATE`].
    pub landmarks: [[f32; 2]; 5],
    pub score: f32,
}

impl Face {
    fn scaled(self, factor: f32) -> Self {
        Self {
            bbox: self.bbox.map(|v| v * factor),
            landmarks: self.landmarks.map(|[x, y]| [x * factor, y * factor]),
            score: self.score,
        }
    }
}

/// One detection head, flattened row major over its anchor grid.
pub struct StrideOutput<'a> {
    pub stride: usize,
    pub cls: &'a [f32],
    pub obj: &'a [f32],
    /// Four values per anchor: centre offset in cells, log width and height.
    pub bbox: &'a [f32],
    /// Ten values per anchor: five landmark offsets in cells.
    pub kps: &'a [f32],
}

/// Appends the anchors of one head scoring at least `threshold`.
pub fn decode_stride(head: &StrideOutput<'_>, input_size: u32, threshold: f32, faces: &mut Vec<Face>) {
    let cols = (input_size as usize / head.stride).max(1);
    let s = head.stride as f32;
    let anchors = head
        .cls
        .iter()
        .zip(head.obj)
        .zip(head.bbox.chunks_exact(4))
        .zip(head.kps.chunks_exact(10));
    for (idx, (((&cls, &obj), bbox), kps)) in anchors.enumerate() {
        let score = (cls.clamp(0.0, 1.0) * obj.clamp(0.0, 1.0)).sqrt();
        if score < threshold {
            continue;
        }
        let (row, col) = ((idx / cols) as f32, (idx % cols) as f32);
        let (cx, cy) = ((col + bbox[0]) * s, (row + bbox[1]) * s);
        let (w, h) = (bbox[2].exp() * s, bbox[3].exp() * s);
        let landmarks =
            std::array::from_fn(|n| [(kps[2 * n] + col) * s, (kps[2 * n + 1] + row) * s]);
        faces.push(Face {
            bbox: [cx - w / 2., cy - h / 2., cx + w / 2., cy + h / 2.],
            landmarks,
            score,
        });
    }
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = w * h;
    let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Keeps the best scoring face of every overlapping group.
pub fn non_max_suppression(mut faces: Vec<Face>, iou_threshold: f32) -> Vec<Face> {
    faces.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Face> = Vec::with_capacity(faces.len());
    for face in faces {
        if kept.iter().all(|k| iou(&k.bbox, &face.bbox) <= iou_threshold) {
            kept.push(face);
        }
    }
    kept
}

/// Fits the image into a `size` square, top left aligned on black.
///
/// Returns the canvas and the scale from image to canvas coordinates.
pub fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, f32) {
    let longest = image.width().max(image.height()).max(1);
    let scale = size as f32 / longest as f32;
    let width = ((image.width() as f32 * scale).round() as u32).clamp(1, size);
    let height = ((image.height() as f32 * scale).round() as u32).clamp(1, size);
    let resized = imageops::resize(image, width, height, FilterType::Triangle);
    let mut canvas = RgbImage::new(size, size);
    imageops::replace(&mut canvas, &resized, 0, 0);
    (canvas, scale)
}

/// Detections on a letterboxed canvas, mapped back to the source image.
pub fn finish_detections(faces: Vec<Face>, scale: f32) -> Vec<Face> {
    non_max_suppression(faces, NMS_IOU)
        .into_iter()
        .map(|face| face.scaled(1.0 / scale))
        .collect()
}

/// Rotation, uniform scale and translation: `(a x - b y + tx, b x + a y + ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least squares fit taking `from` onto `to`, `None` when the points coincide.
    pub fn estimate(from: &[[f32; 2]; 5], to: &[[f32; 2]; 5]) -> Option<Self> {
        let n = from.len() as f32;
        let mean = |points: &[[f32; 2]; 5]| {
            points
                .iter()
                .fold([0.0, 0.0], |acc, p| [acc[0] + p[0] / n, acc[1] + p[1] / n])
        };
        let (mf, mt) = (mean(from), mean(to));
        let (mut num_a, mut num_b, mut den) = (0f32, 0f32, 0f32);
        for (f, t) in from.iter().zip(to) {
            let (x, y) = (f[0] - mf[0], f[1] - mf[1]);
            let (u, v) = (t[0] - mt[0], t[1] - mt[1]);
            num_a += x * u + y * v;
            num_b += x * v - y * u;
            den += x * x + y * y;
        }
        if den <= f32::EPSILON {
            return None;
        }
        let (a, b) = (num_a / den, num_b / den);
        Some(Self {
            a,
            b,
            tx: mt[0] - (a * mf[0] - b * mf[1]),
            ty: mt[1] - (b * mf[0] + a * mf[1]),
        })
    }

    pub fn apply(&self, [x, y]: [f32; 2]) -> [f32; 2] {
        [
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        ]
    }

    pub fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det <= f32::EPSILON {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }

    fn projection(&self) -> Result<Projection> {
        Projection::from_matrix([self.a, -self.b, self.tx, self.b, self.a, self.ty, 0., 0., 1.])
            .ok_or_else(|| anyhow!("face alignment is not invertible"))
    }
}

/// The `size` square crop that `align` maps the image onto.
pub fn warp_crop(image: &RgbImage, align: &Similarity, size: u32) -> Result<RgbImage> {
    let mut crop = RgbImage::new(size, size);
    warp_into(image, &align.projection()?, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut crop);
    Ok(crop)
}

/// White crop fading to black over [`FEATHER`] pixels at its border.
fn feather_mask(width: u32, height: u32) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    let inner_width = width.saturating_sub(2 * FEATHER).max(1);
    let inner_height = height.saturating_sub(2 * FEATHER).max(1);
    draw_filled_rect_mut(
        &mut mask,
        Rect::at(FEATHER as i32, FEATHER as i32).of_size(inner_width, inner_height),
        Luma([255]),
    );
    gaussian_blur_f32(&mask, FEATHER as f32 / 3.0)
}

/// Warps a restored crop back through the inverse of `align` and blends it
/// into `frame` by `strength` under a feathered mask.
pub fn paste_face(
    frame: &mut RgbImage,
    restored: &RgbImage,
    align: &Similarity,
    strength: f32,
) -> Result<()> {
    let back = align
        .inverse()
        .ok_or_else(|| anyhow!("face alignment is not invertible"))?
        .projection()?;
    let (width, height) = frame.dimensions();
    let mut warped = RgbImage::new(width, height);
    warp_into(restored, &back, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut warped);
    let mask = feather_mask(restored.width(), restored.height());
    let mut warped_mask = GrayImage::new(width, height);
    warp_into(&mask, &back, Interpolation::Bilinear, Luma([0]), &mut warped_mask);

    for ((pixel, face), weight) in frame
        .pixels_mut()
        .zip(warped.pixels())
        .zip(warped_mask.pixels())
    {
        let alpha = weight[0] as f32 / 255.0 * strength;
        if alpha <= 0.0 {
            continue;
        }
        for c in 0..3 {
            let value = pixel[c] as f32 * (1.0 - alpha) + face[c] as f32 * alpha;
            pixel[c] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(())
}

/// Restores every face with `restore` and pastes the results into a copy of `image`.
pub fn restore_faces<F>(image: &RgbImage, faces: &[Face], strength: f32, mut restore: F) -> Result<RgbImage>
where
    F: FnMut(&RgbImage) -> Result<RgbImage>,
{
    let strength = strength.clamp(0.0, 1.0);
    let mut out = image.clone();
    for face in faces {
        let Some(align) = Similarity::estimate(&face.landmarks, &FACE_TEMPLATE) else {
            debug!(bbox = ?face.bbox, "skipping face with collapsed landmarks");
            continue;
        };
        let crop = warp_crop(image, &align, FACE_SIZE)?;
        let restored = restore(&crop)?;
        if restored.dimensions() != crop.dimensions() {
            return Err(anyhow!(
                "face restorer returned {:?} for a {:?} crop",
                restored.dimensions(),
                crop.dimensions()
            ));
        }
        paste_face(&mut out, &restored, &align, strength)?;
    }
    Ok(out)
}

//! GFPGAN face restoration through ONNX Runtime, on faces found by YuNet.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use image::{Rgb, RgbImage};
use ndarray::{Array4, Ix4};
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::face::{
    decode_stride, finish_detections, letterbox, restore_faces, Face, StrideOutput, DETECT_SIZE,
    DETECT_STRIDES, FACE_SIZE, SCORE_THRESHOLD,
};
use super::FaceRestorer;

fn open(model: &Path, what: &str) -> Result<Session> {
    Session::builder()?
        .commit_from_file(model)
        .with_context(|| format!("failed to load {what} from {}", model.display()))
}

/// YuNet face detector with one head per stride.
struct FaceDetector {
    session: Mutex<Session>,
    input_name: String,
}

impl FaceDetector {
    const HEADS: [&'static str; 4] = ["cls", "obj", "bbox", "kps"];

    fn new(model: &Path) -> Result<Self> {
        let session = open(model, "face detector")?;
        let input_name = session.inputs()[0].name().to_string();
        let outputs: Vec<&str> = session.outputs().iter().map(|o| o.name()).collect();
        for stride in DETECT_STRIDES {
            for head in Self::HEADS {
                let name = format!("{head}_{stride}");
                if !outputs.contains(&name.as_str()) {
                    bail!("face detector {} has no output {name}", model.display());
                }
            }
        }
        info!(model = %model.display(), "face detector ready");
        Ok(Self {
            session: Mutex::new(session),
            input_name,
        })
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<Face>> {
        let (canvas, scale) = letterbox(image, DETECT_SIZE);
        let size = DETECT_SIZE as usize;
        // BGR in 0..255.
        let input = Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[2 - c] as f32
        });

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("face detector session lock poisoned"))?;
        let input = Tensor::from_array(input)?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &input])?;
        let read = |head: &str, stride: usize| -> Result<Vec<f32>> {
            let name = format!("{head}_{stride}");
            Ok(outputs[name.as_str()].try_extract_array::<f32>()?.iter().copied().collect())
        };

        let mut faces = Vec::new();
        for stride in DETECT_STRIDES {
            let (cls, obj) = (read("cls", stride)?, read("obj", stride)?);
            let (bbox, kps) = (read("bbox", stride)?, read("kps", stride)?);
            let head = StrideOutput {
                stride,
                cls: &cls,
                obj: &obj,
                bbox: &bbox,
                kps: &kps,
            };
            decode_stride(&head, DETECT_SIZE, SCORE_THRESHOLD, &mut faces);
        }
        Ok(finish_detections(faces, scale))
    }
}

pub struct Gfpgan {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    detector: FaceDetector,
}

impl Gfpgan {
    pub fn new(model: &Path, detector: &Path) -> Result<Self> {
        let session = open(model, "face restorer")?;
        let input_name = session.inputs()[0].name().to_string();
        let output_name = session.outputs()[0].name().to_string();
        let detector = FaceDetector::new(detector)?;
        info!(model = %model.display(), input = %input_name, "face restorer ready");
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            detector,
        })
    }

    fn infer(&self, input: Array4<f32>) -> Result<Array4<f32>> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("face restorer session lock poisoned"))?;
        let input = Tensor::from_array(input)?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => &input])?;
        let output = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output.to_owned().into_dimensionality::<Ix4>()?)
    }

    /// Restores one aligned crop, RGB in and out at [`FACE_SIZE`].
    fn restore_crop(&self, crop: &RgbImage) -> Result<RgbImage> {
        let size = FACE_SIZE as usize;
        let input = Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
            crop.get_pixel(x as u32, y as u32)[c] as f32 / 127.5 - 1.0
        });
        let output = self.infer(input)?;
        if output.shape() != [1, 3, size, size] {
            bail!("face restorer returned shape {:?}", output.shape());
        }
        Ok(RgbImage::from_fn(FACE_SIZE, FACE_SIZE, |x, y| {
            Rgb(std::array::from_fn(|c| {
                let value = (output[[0, c, y as usize, x as usize]].clamp(-1.0, 1.0) + 1.0) * 127.5;
                value.round() as u8
            }))
        }))
    }
}

impl FaceRestorer for Gfpgan {
    fn restore(&self, image: &RgbImage, strength: f32) -> Result<RgbImage> {
        let faces = self.detector.detect(image)?;
        debug!(faces = faces.len(), "detected faces");
        restore_faces(image, &faces, strength, |crop| self.restore_crop(crop))
    }
}

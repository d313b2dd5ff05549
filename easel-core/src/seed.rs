use candle_core::{DType, Device, DeviceLocation, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Deterministic noise source bound to a device.
///
/// Noise is drawn on the host from a seeded `StdRng` and then moved to the
/// device, so the same seed yields the same latents on every backend.
#[derive(Debug, Clone)]
pub struct SeededGenerator {
    seed: u64,
    device: Device,
    rng: StdRng,
}

impl SeededGenerator {
    pub fn new(seed: u64, device: &Device) -> Self {
        Self {
            seed,
            device: device.clone(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn location(&self) -> DeviceLocation {
        self.device.location()
    }

    /// Standard normal noise of the given shape on the bound device.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, dtype: DType) -> candle_core::Result<Tensor> {
        let shape = shape.into();
        let values: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect();
        Tensor::from_vec(values, shape, &Device::Cpu)?
            .to_device(&self.device)?
            .to_dtype(dtype)
    }
}

impl PartialEq for SeededGenerator {
    fn eq(&self, other: &Self) -> bool {
        self.seed == other.seed && self.location() == other.location()
    }
}

/// Noise from the generator when one was supplied, otherwise from the device rng.
pub(crate) fn noise<S: Into<Shape>>(
    generator: Option<&mut SeededGenerator>,
    shape: S,
    dtype: DType,
    device: &Device,
) -> candle_core::Result<Tensor> {
    match generator {
        Some(generator) => generator.randn(shape, dtype),
        None => Tensor::randn(0f32, 1f32, shape, device)?.to_dtype(dtype),
    }
}

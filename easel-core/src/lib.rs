pub mod cache;
pub mod config;
pub mod device_map;
pub mod dispatch;
pub mod engine;
mod error;
pub mod hub_loader;
pub mod loader;
mod loader_factory;
pub mod pipelines;
pub mod request;
pub mod seed;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transform;
mod util;

pub use candle_core::Device;
pub use config::EngineConfig;
pub use device_map::*;
pub use engine::Engine;
pub use error::{Error, ErrorKind, Result};
pub use hub_loader::CandleLoader;
pub use loader::Loader;
pub use loader_factory::*;
pub use seed::SeededGenerator;
pub(crate) use util::*;
pub use util::{image_to_tensor, image_to_unit_tensor, mask_to_tensor, select_best_device, tensor_to_image};

use std::path::PathBuf;

use crate::DeviceMap;

/// Repository holding the RRDBNet `.pth` checkpoints.
pub const DEFAULT_UPSCALE_REPO: &str = "easel-rs/esrgan-weights";
/// VAE that stays finite in half precision for XL models.
pub const DEFAULT_XL_VAE_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";
pub const DEFAULT_FLUX_T5_REPO: &str = "google/t5-v1_1-xxl";
pub const DEFAULT_FLUX_T5_TOKENIZER_REPO: &str = "lmz/mt5-tokenizers";
pub const DEFAULT_FLUX_CLIP_REPO: &str = "openai/clip-vit-large-patch14";

/// Everything the engine and its loaders need besides the requests themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub device_map: DeviceMap,
    /// Token for gated or private repositories; `HF_TOKEN` is used when unset.
    pub hf_token: Option<String>,
    pub use_flash_attn: bool,
    pub upscale_repo: String,
    /// Read `.pth` checkpoints from here instead of downloading them.
    pub upscale_weights_dir: Option<PathBuf>,
    /// GFPGAN exported to ONNX. Face restoration is unavailable without it.
    pub face_restore_model: Option<PathBuf>,
    /// YuNet face detector exported to ONNX, needed alongside the restorer.
    pub face_detect_model: Option<PathBuf>,
    pub xl_vae_repo: Option<String>,
    pub flux_t5_repo: String,
    pub flux_t5_tokenizer_repo: String,
    pub flux_clip_repo: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_map: DeviceMap::default(),
            hf_token: None,
            use_flash_attn: false,
            upscale_repo: DEFAULT_UPSCALE_REPO.to_string(),
            upscale_weights_dir: None,
            face_restore_model: None,
            face_detect_model: None,
            xl_vae_repo: Some(DEFAULT_XL_VAE_REPO.to_string()),
            flux_t5_repo: DEFAULT_FLUX_T5_REPO.to_string(),
            flux_t5_tokenizer_repo: DEFAULT_FLUX_T5_TOKENIZER_REPO.to_string(),
            flux_clip_repo: DEFAULT_FLUX_CLIP_REPO.to_string(),
        }
    }
}

impl EngineConfig {
    /// Whether this build and configuration can restore faces at all.
    pub fn face_restore_available(&self) -> bool {
        cfg!(feature = "face-restore")
            && self.face_restore_model.is_some()
            && self.face_detect_model.is_some()
    }
}

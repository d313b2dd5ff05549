use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use easel_core::config::{DEFAULT_UPSCALE_REPO, DEFAULT_XL_VAE_REPO};
use easel_core::{DeviceMap, Engine, EngineConfig};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod codec;
mod error;
mod routes;
mod wire;

const DEFAULT_LOG_FILTER: &str = "easel_server=info,easel_core=info";

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, env = "EASEL_CPU")]
    cpu: bool,

    /// GPU ordinal to place models on
    #[arg(long, env = "EASEL_ORDINAL", default_value_t = 0)]
    ordinal: usize,

    /// Host address to bind the server to
    #[arg(long, env = "EASEL_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "EASEL_PORT", default_value_t = 8000)]
    port: u16,

    /// Hugging Face token for gated repositories
    #[arg(long, env = "EASEL_HF_TOKEN")]
    hf_token: Option<String>,

    /// Use flash attention in the diffusion UNets
    #[arg(long, env = "EASEL_USE_FLASH_ATTN")]
    use_flash_attn: bool,

    /// GFPGAN model exported to ONNX; face restoration is disabled without it
    #[arg(long, env = "EASEL_FACE_RESTORE_MODEL")]
    face_restore_model: Option<PathBuf>,

    /// YuNet face detector exported to ONNX, used with the face restorer
    #[arg(long, env = "EASEL_FACE_DETECT_MODEL")]
    face_detect_model: Option<PathBuf>,

    /// Repository holding the ESRGAN checkpoints
    #[arg(long, env = "EASEL_UPSCALE_REPO", default_value = DEFAULT_UPSCALE_REPO)]
    upscale_repo: String,

    /// Local directory with the ESRGAN checkpoints, instead of the repository
    #[arg(long, env = "EASEL_UPSCALE_WEIGHTS_DIR")]
    upscale_weights_dir: Option<PathBuf>,

    /// Replacement VAE for XL models in half precision, "none" keeps the model's own
    #[arg(long, env = "EASEL_XL_VAE_REPO", default_value = DEFAULT_XL_VAE_REPO)]
    xl_vae_repo: String,

    /// Largest accepted request body, in bytes
    #[arg(long, env = "EASEL_MAX_BODY_BYTES", default_value_t = 64 * 1024 * 1024)]
    max_body_bytes: usize,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            device_map: DeviceMap::from_flags(self.cpu, self.ordinal),
            hf_token: self.hf_token.clone(),
            use_flash_attn: self.use_flash_attn,
            upscale_repo: self.upscale_repo.clone(),
            upscale_weights_dir: self.upscale_weights_dir.clone(),
            face_restore_model: self.face_restore_model.clone(),
            face_detect_model: self.face_detect_model.clone(),
            xl_vae_repo: Some(self.xl_vae_repo.clone()).filter(|repo| repo != "none"),
            ..Default::default()
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    let config = args.engine_config();
    let face_restore = config.face_restore_available();
    let engine = Arc::new(Engine::from_config(config)?);
    info!(
        device = %engine.device_label(),
        face_restore,
        "engine ready"
    );

    let app = routes::router(engine.clone(), args.max_body_bytes);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_become_engine_config() {
        let args = Args::parse_from([
            "easel-server",
            "--cpu",
            "--upscale-weights-dir",
            "/weights",
            "--xl-vae-repo",
            "none",
            "--face-restore-model",
            "gfpgan.onnx",
            "--face-detect-model",
            "yunet.onnx",
        ]);
        let config = args.engine_config();
        assert_eq!(config.device_map, DeviceMap::ForceCpu);
        assert_eq!(config.upscale_weights_dir, Some(PathBuf::from("/weights")));
        assert_eq!(config.xl_vae_repo, None);
        assert_eq!(config.upscale_repo, DEFAULT_UPSCALE_REPO);
        assert_eq!(config.face_restore_model, Some(PathBuf::from("gfpgan.onnx")));
        assert_eq!(config.face_detect_model, Some(PathBuf::from("yunet.onnx")));
        assert_eq!(args.port, 8000);
    }

    #[test]
    fn default_log_filter_names_only_our_crates() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
        for directive in DEFAULT_LOG_FILTER.split(',') {
            assert!(directive.starts_with("easel_"), "{directive}");
        }
    }
}

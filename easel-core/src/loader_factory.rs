use std::fmt;

/// Pipeline family used for text-to-image generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextToImageFamily {
    Flux,
    StableDiffusion3,
    StableDiffusionXl,
    /// Stable Diffusion 1.x and 2.x.
    StableDiffusion,
}

impl TextToImageFamily {
    /// Detect the family from a model identifier.
    ///
    /// Case-insensitive substring matching in a fixed priority order, first
    /// match wins, so `"my-flux-xl"` is a Flux model.
    pub fn from_model_id(model_id: &str) -> Self {
        let name = model_id.to_lowercase();

        if name.contains("flux") {
            TextToImageFamily::Flux
        } else if name.contains("sd3") || name.contains("stable-diffusion-3") {
            TextToImageFamily::StableDiffusion3
        } else if name.contains("xl") {
            TextToImageFamily::StableDiffusionXl
        } else {
            TextToImageFamily::StableDiffusion
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TextToImageFamily::Flux => "flux",
            TextToImageFamily::StableDiffusion3 => "stable-diffusion-3",
            TextToImageFamily::StableDiffusionXl => "stable-diffusion-xl",
            TextToImageFamily::StableDiffusion => "stable-diffusion",
        }
    }
}

impl fmt::Display for TextToImageFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable Diffusion configuration selected from a model identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdVersion {
    V1_5,
    V2_1,
    Xl,
    XlTurbo,
}

impl SdVersion {
    pub fn from_model_id(model_id: &str) -> Self {
        let name = model_id.to_lowercase();

        if name.contains("xl") {
            if name.contains("turbo") {
                SdVersion::XlTurbo
            } else {
                SdVersion::Xl
            }
        } else if name.contains("2-1")
            || name.contains("2.1")
            || name.contains("v2")
            || name.contains("diffusion-2")
        {
            SdVersion::V2_1
        } else {
            SdVersion::V1_5
        }
    }

    pub fn is_xl(self) -> bool {
        matches!(self, SdVersion::Xl | SdVersion::XlTurbo)
    }

    /// Scaling between VAE latents and the UNet latent space.
    pub fn vae_scale(self) -> f64 {
        if self.is_xl() {
            0.13025
        } else {
            0.18215
        }
    }

    /// Tokenizer repositories, one per text encoder.
    pub fn tokenizer_repos(self) -> &'static [&'static str] {
        if self.is_xl() {
            &[
                "openai/clip-vit-large-patch14",
                "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k",
            ]
        } else {
            &["openai/clip-vit-base-patch32"]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    /// Defaults to schnell when the identifier names neither variant.
    pub fn from_model_id(model_id: &str) -> Self {
        let name = model_id.to_lowercase();

        if name.contains("schnell") {
            FluxVariant::Schnell
        } else if name.contains("dev") {
            FluxVariant::Dev
        } else {
            FluxVariant::Schnell
        }
    }

    pub fn repo(self) -> &'static str {
        match self {
            FluxVariant::Schnell => "black-forest-labs/FLUX.1-schnell",
            FluxVariant::Dev => "black-forest-labs/FLUX.1-dev",
        }
    }

    pub fn weights_file(self) -> &'static str {
        match self {
            FluxVariant::Schnell => "flux1-schnell.safetensors",
            FluxVariant::Dev => "flux1-dev.safetensors",
        }
    }
}

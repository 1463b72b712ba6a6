//! Boundary to image resolution.
mod layout;
pub mod reference;

pub use layout::LayoutImageStore;

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("invalid image reference {0:?}")]
    InvalidReference(String),
    #[error("image {0} not found")]
    NotFound(String),
    #[error("image {reference} has no variant for platform {platform}")]
    PlatformNotFound { reference: String, platform: String },
    #[error("pulling {0} is not supported by this image store")]
    PullUnsupported(String),
    #[error("invalid platform {0:?}")]
    InvalidPlatform(String),
    #[error("failed to read image content {path:?}")]
    Content {
        path: PathBuf,
        source: oci_spec::OciSpecError,
    },
    #[error("malformed digest {0:?}")]
    Digest(String),
    #[error("{0}")]
    Other(String),
}

/// When the image collaborator may fetch content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullMode {
    Always,
    #[default]
    Missing,
    Never,
}

impl FromStr for PullMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "missing" => Ok(Self::Missing),
            "never" => Ok(Self::Never),
            _ => Err(ValidationError::Option {
                option: "pull",
                value: s.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub mode: PullMode,
    /// `os/arch[/variant]`, the host platform when unset.
    pub platform: Option<String>,
}

/// The parts of an image configuration the creation pipeline consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub stop_signal: Option<String>,
    pub volumes: Vec<String>,
}

/// A resolved image: where its content lives is the collaborator's
/// business, this is a read-only view of what the pipeline needs.
#[derive(Debug, Clone)]
pub struct EnsuredImage {
    /// Fully qualified reference.
    pub reference: String,
    pub digest: String,
    pub config: ImageConfig,
    pub snapshotter: String,
    pub platform: String,
}

pub trait ImageService {
    fn ensure_image(&self, reference: &str, opts: &PullOptions) -> Result<EnsuredImage, ImageError>;
}

/// The platform of the running host in `os/arch` form.
pub fn host_platform() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    };
    format!("linux/{arch}")
}

/// Normalizes `os/arch[/variant]`, rejecting malformed input.
pub fn normalize_platform(platform: &str) -> Result<String, ImageError> {
    let parts: Vec<&str> = platform.split('/').collect();
    if parts.len() < 2 || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(ImageError::InvalidPlatform(platform.to_owned()));
    }
    Ok(parts.join("/").to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_mode_from_str() {
        assert_eq!("always".parse::<PullMode>().unwrap(), PullMode::Always);
        assert_eq!("never".parse::<PullMode>().unwrap(), PullMode::Never);
        assert!("sometimes".parse::<PullMode>().is_err());
    }

    #[test]
    fn test_normalize_platform() {
        assert_eq!(normalize_platform("linux/AMD64").unwrap(), "linux/amd64");
        assert_eq!(normalize_platform("linux/arm/v7").unwrap(), "linux/arm/v7");
        assert!(normalize_platform("linux").is_err());
        assert!(normalize_platform("linux//").is_err());
    }

    #[test]
    fn test_host_platform() {
        assert!(host_platform().starts_with("linux/"));
    }
}

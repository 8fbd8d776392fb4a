//! Asset requests and their validation

use crate::backend::SourceKind;
use kiln_cache::{CacheKey, GenerationParams, ParamValue};
use kiln_core::{ContentHash, KilnError, Result, Vec3};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Largest accepted target dimension, in meters
pub const MAX_TARGET_DIMENSION: f32 = 1000.0;

pub const DEFAULT_FOREGROUND_RATIO: f64 = 0.85;
pub const DEFAULT_TEXTURE_RESOLUTION: i64 = 1024;
pub const DEFAULT_REMESH: &str = "triangle";
pub const DEFAULT_VERTEX_COUNT: i64 = -1;

/// One model to produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRequest {
    /// Caller-chosen id; names the delivered artifact
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Reference image. Takes precedence over `prompt`.
    #[serde(default)]
    pub image: Option<PathBuf>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub target_size: Option<Vec3>,
    #[serde(default)]
    pub pivot: Option<Vec3>,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub force_regenerate: bool,
}

impl AssetRequest {
    pub fn from_image(id: impl Into<String>, image: impl Into<PathBuf>) -> Self {
        Self {
            image: Some(image.into()),
            ..Self::empty(id.into())
        }
    }

    pub fn from_prompt(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::empty(id.into())
        }
    }

    fn empty(id: String) -> Self {
        Self {
            id,
            session_id: None,
            image: None,
            prompt: None,
            target_size: None,
            pivot: None,
            params: GenerationParams::new(),
            force_regenerate: false,
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_target_size(mut self, size: Vec3) -> Self {
        self.target_size = Some(size);
        self
    }

    pub fn with_pivot(mut self, pivot: Vec3) -> Self {
        self.pivot = Some(pivot);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.set(name, value);
        self
    }

    pub fn force(mut self) -> Self {
        self.force_regenerate = true;
        self
    }

    pub fn source_kind(&self) -> Option<SourceKind> {
        if self.image.is_some() {
            Some(SourceKind::Image)
        } else if self.prompt.is_some() {
            Some(SourceKind::Prompt)
        } else {
            None
        }
    }

    /// Shape checks that need no I/O
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(KilnError::Validation("Request id must not be empty".into()));
        }
        if !is_plain_name(&self.id) {
            return Err(KilnError::Validation(format!(
                "Request id '{}' must be a plain name",
                self.id
            )));
        }
        if let Some(session) = &self.session_id {
            if !is_plain_name(session) {
                return Err(KilnError::Validation(format!(
                    "Session id '{}' must be a plain name",
                    session
                )));
            }
        }

        match (&self.image, &self.prompt) {
            (None, None) => {
                return Err(KilnError::Validation(
                    "Request needs an image or a prompt".into(),
                ))
            }
            (None, Some(prompt)) if prompt.trim().is_empty() => {
                return Err(KilnError::Validation("Prompt must not be empty".into()))
            }
            _ => {}
        }

        if let Some(size) = self.target_size {
            for (axis, value) in ["x", "y", "z"].iter().zip(size.to_array()) {
                if !(value.is_finite() && value > 0.0 && value <= MAX_TARGET_DIMENSION) {
                    return Err(KilnError::ValueOutOfRange {
                        field: format!("target_size.{}", axis),
                        min: 0.0,
                        max: MAX_TARGET_DIMENSION as f64,
                        value: value as f64,
                    });
                }
            }
        }

        if let Some(pivot) = self.pivot {
            for (axis, value) in ["x", "y", "z"].iter().zip(pivot.to_array()) {
                if !(0.0..=1.0).contains(&value) {
                    return Err(KilnError::ValueOutOfRange {
                        field: format!("pivot.{}", axis),
                        min: 0.0,
                        max: 1.0,
                        value: value as f64,
                    });
                }
            }
        }

        if let Some(ratio) = self.params.get_f64("foreground_ratio") {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(KilnError::ValueOutOfRange {
                    field: "foreground_ratio".into(),
                    min: 0.0,
                    max: 1.0,
                    value: ratio,
                });
            }
        }
        if let Some(resolution) = self.params.get_i64("texture_resolution") {
            if resolution <= 0 {
                return Err(KilnError::Validation(format!(
                    "texture_resolution must be positive, got {}",
                    resolution
                )));
            }
        }

        Ok(())
    }

    /// Validate, load the source and compute the cache key.
    ///
    /// Blocking: reads and decodes the reference image.
    pub fn resolve(&self) -> Result<ResolvedRequest> {
        self.validate()?;

        let (source, hash) = match (&self.image, &self.prompt) {
            (Some(path), _) => {
                if !path.is_file() {
                    return Err(KilnError::Validation(format!(
                        "Image not found: {}",
                        path.display()
                    )));
                }
                let hash = ContentHash::from_file(path)?;
                let bytes = std::fs::read(path)?;
                image::load_from_memory(&bytes).map_err(|e| {
                    KilnError::Validation(format!(
                        "Cannot decode image {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                (RequestSource::Image(bytes), hash)
            }
            (None, Some(prompt)) => {
                let prompt = prompt.trim().to_string();
                let hash = ContentHash::from_str(&prompt);
                (RequestSource::Prompt(prompt), hash)
            }
            (None, None) => {
                return Err(KilnError::Validation(
                    "Request needs an image or a prompt".into(),
                ))
            }
        };

        let params = self.effective_params();
        let key = CacheKey::new(&hash, &params);

        Ok(ResolvedRequest {
            source,
            params,
            key,
        })
    }

    /// Parameters with defaults filled in and the size constraints folded
    /// in, since the cached artifact is the normalized one
    pub fn effective_params(&self) -> GenerationParams {
        let mut params = self.params.clone();
        params.set_default("foreground_ratio", DEFAULT_FOREGROUND_RATIO);
        params.set_default("texture_resolution", DEFAULT_TEXTURE_RESOLUTION);
        params.set_default("remesh", DEFAULT_REMESH);
        params.set_default("vertex_count", DEFAULT_VERTEX_COUNT);
        if let Some(size) = self.target_size {
            params.set("target_size", format_vec(size));
        }
        if let Some(pivot) = self.pivot {
            params.set("pivot", format_vec(pivot));
        }
        params
    }
}

/// Usable as a single path component
fn is_plain_name(name: &str) -> bool {
    !name.trim().is_empty() && !name.contains(['/', '\\']) && name != "." && name != ".."
}

fn format_vec(v: Vec3) -> String {
    format!("{}x{}x{}", v.x, v.y, v.z)
}

/// Loaded source input
#[derive(Debug, Clone, PartialEq)]
pub enum RequestSource {
    Image(Vec<u8>),
    Prompt(String),
}

impl RequestSource {
    pub fn kind(&self) -> SourceKind {
        match self {
            RequestSource::Image(_) => SourceKind::Image,
            RequestSource::Prompt(_) => SourceKind::Prompt,
        }
    }
}

/// A validated request ready for cache lookup and generation
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub source: RequestSource,
    pub params: GenerationParams,
    pub key: CacheKey,
}

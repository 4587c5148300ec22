//! Declarative catalog of generation models and their weight files
//!
//! A model is made of three components: diffusion weights and text-encoder
//! weights, each offered in several quantizations, plus a single VAE file.
//! Relative paths are not owned by one model; the same file (typically a text
//! encoder or the VAE) can back several definitions.

use super::status::normalize_relative_path;
use crate::error::{AssetError, AssetResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

/// Weight group of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Diffusion,
    TextEncoder,
    Vae,
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Diffusion => write!(f, "diffusion"),
            Self::TextEncoder => write!(f, "text_encoder"),
            Self::Vae => write!(f, "vae"),
        }
    }
}

impl FromStr for ComponentKind {
    type Err = AssetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "diffusion" => Ok(Self::Diffusion),
            "text_encoder" | "text-encoder" | "textEncoder" => Ok(Self::TextEncoder),
            "vae" => Ok(Self::Vae),
            other => Err(AssetError::InvalidSelection(format!(
                "unknown component '{}'",
                other
            ))),
        }
    }
}

/// Kind of model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    ImageGeneration,
    VideoGeneration,
}

/// One quantization variant of a component, backed by one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quant {
    pub quant_id: String,
    pub relative_file_path: String,
    pub approx_size_bytes: u64,
    /// Explicit source URL; otherwise the backend derives one from its base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// The single VAE file of a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaeFile {
    pub relative_file_path: String,
    pub approx_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Per-model quant choice. Missing or stale ids fall back to the first quant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diffusion_quant: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_encoder_quant: Option<String>,
}

impl QuantSelection {
    pub fn get(&self, component: ComponentKind) -> Option<&str> {
        match component {
            ComponentKind::Diffusion => self.diffusion_quant.as_deref(),
            ComponentKind::TextEncoder => self.text_encoder_quant.as_deref(),
            ComponentKind::Vae => None,
        }
    }

    /// Copy with one component changed
    pub fn with(&self, component: ComponentKind, quant_id: &str) -> AssetResult<Self> {
        let mut next = self.clone();
        match component {
            ComponentKind::Diffusion => next.diffusion_quant = Some(quant_id.to_string()),
            ComponentKind::TextEncoder => next.text_encoder_quant = Some(quant_id.to_string()),
            ComponentKind::Vae => {
                return Err(AssetError::InvalidSelection(
                    "the VAE has no selectable quant".to_string(),
                ));
            }
        }
        Ok(next)
    }
}

/// A concrete file picked from a model definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFile {
    pub component: ComponentKind,
    pub quant_id: Option<String>,
    /// Normalized relative path
    pub relative_path: String,
    pub approx_size_bytes: u64,
    pub url: Option<String>,
}

/// Immutable catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub diffusion: Vec<Quant>,
    pub text_encoder: Vec<Quant>,
    pub vae: VaeFile,
}

impl ModelDefinition {
    /// Quant variants of a component (empty for the VAE)
    pub fn quants(&self, component: ComponentKind) -> &[Quant] {
        match component {
            ComponentKind::Diffusion => &self.diffusion,
            ComponentKind::TextEncoder => &self.text_encoder,
            ComponentKind::Vae => &[],
        }
    }

    fn selected_quant(&self, component: ComponentKind, selection: &QuantSelection) -> Option<&Quant> {
        let quants = self.quants(component);
        selection
            .get(component)
            .and_then(|id| quants.iter().find(|q| q.quant_id == id))
            .or_else(|| quants.first())
    }

    /// Pick the file for a component: explicit quant, else the selection, else the first quant
    pub fn resolve_file(
        &self,
        component: ComponentKind,
        quant_id: Option<&str>,
        selection: &QuantSelection,
    ) -> AssetResult<ResolvedFile> {
        if component == ComponentKind::Vae {
            return Ok(ResolvedFile {
                component,
                quant_id: None,
                relative_path: normalize_relative_path(&self.vae.relative_file_path),
                approx_size_bytes: self.vae.approx_size_bytes,
                url: self.vae.url.clone(),
            });
        }

        let quant = match quant_id {
            Some(id) => self
                .quants(component)
                .iter()
                .find(|q| q.quant_id == id)
                .ok_or_else(|| AssetError::UnknownQuant {
                    model_id: self.id.clone(),
                    component,
                    quant_id: id.to_string(),
                })?,
            None => self.selected_quant(component, selection).ok_or_else(|| {
                AssetError::InvalidCatalog(format!("model '{}' has no {} quants", self.id, component))
            })?,
        };

        Ok(ResolvedFile {
            component,
            quant_id: Some(quant.quant_id.clone()),
            relative_path: normalize_relative_path(&quant.relative_file_path),
            approx_size_bytes: quant.approx_size_bytes,
            url: quant.url.clone(),
        })
    }

    /// Files that must exist for the model to be ready under `selection`
    pub fn required_files(&self, selection: &QuantSelection) -> Vec<String> {
        let mut paths = Vec::with_capacity(3);
        for component in [ComponentKind::Diffusion, ComponentKind::TextEncoder] {
            if let Some(quant) = self.selected_quant(component, selection) {
                paths.push(normalize_relative_path(&quant.relative_file_path));
            }
        }
        paths.push(normalize_relative_path(&self.vae.relative_file_path));
        dedup_in_order(paths)
    }

    /// Every file the model can reference, across all quants
    pub fn file_set(&self) -> Vec<String> {
        let paths = self
            .diffusion
            .iter()
            .chain(self.text_encoder.iter())
            .map(|q| normalize_relative_path(&q.relative_file_path))
            .chain(std::iter::once(normalize_relative_path(
                &self.vae.relative_file_path,
            )))
            .collect();
        dedup_in_order(paths)
    }

    /// Whether `path` (normalized) belongs to any component of this model
    pub fn references(&self, path: &str) -> bool {
        self.file_set().iter().any(|p| p == path)
    }

    /// Approximate download size of the current selection
    pub fn selection_size_bytes(&self, selection: &QuantSelection) -> u64 {
        [ComponentKind::Diffusion, ComponentKind::TextEncoder]
            .into_iter()
            .filter_map(|c| self.selected_quant(c, selection))
            .map(|q| q.approx_size_bytes)
            .sum::<u64>()
            + self.vae.approx_size_bytes
    }

    fn validate(&self) -> AssetResult<()> {
        if self.id.trim().is_empty() {
            return Err(AssetError::InvalidCatalog("model id cannot be empty".to_string()));
        }
        for component in [ComponentKind::Diffusion, ComponentKind::TextEncoder] {
            let quants = self.quants(component);
            if quants.is_empty() {
                return Err(AssetError::InvalidCatalog(format!(
                    "model '{}' has no {} quants",
                    self.id, component
                )));
            }
            let mut seen = HashSet::new();
            for quant in quants {
                if quant.quant_id.trim().is_empty() {
                    return Err(AssetError::InvalidCatalog(format!(
                        "model '{}' has an empty {} quant id",
                        self.id, component
                    )));
                }
                if !seen.insert(quant.quant_id.as_str()) {
                    return Err(AssetError::InvalidCatalog(format!(
                        "model '{}' has duplicate {} quant '{}'",
                        self.id, component, quant.quant_id
                    )));
                }
                validate_relative_path(&quant.relative_file_path)?;
            }
        }
        validate_relative_path(&self.vae.relative_file_path)
    }
}

/// Reject paths that are empty after normalization or escape the models directory
pub fn validate_relative_path(path: &str) -> AssetResult<()> {
    let normalized = normalize_relative_path(path);
    if normalized.is_empty() || normalized.split('/').any(|segment| segment == "..") {
        return Err(AssetError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn dedup_in_order(paths: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    paths.into_iter().filter(|p| seen.insert(p.clone())).collect()
}

/// Validated, read-only set of model definitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetCatalog {
    models: Vec<ModelDefinition>,
}

impl AssetCatalog {
    pub fn new(models: Vec<ModelDefinition>) -> AssetResult<Self> {
        let mut ids = HashSet::new();
        for model in &models {
            model.validate()?;
            if !ids.insert(model.id.as_str()) {
                return Err(AssetError::InvalidCatalog(format!(
                    "duplicate model id '{}'",
                    model.id
                )));
            }
        }
        Ok(Self { models })
    }

    /// Load a catalog from a TOML or JSON file (chosen by extension)
    pub fn from_file(path: &Path) -> AssetResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let catalog: AssetCatalog = if is_json {
            serde_json::from_str(&content).map_err(|e| {
                AssetError::InvalidCatalog(format!("{}: {}", path.display(), e))
            })?
        } else {
            toml::from_str(&content).map_err(|e| {
                AssetError::InvalidCatalog(format!("{}: {}", path.display(), e))
            })?
        };

        tracing::info!(path = ?path, models = catalog.models.len(), "Catalog loaded");

        Self::new(catalog.models)
    }

    pub fn models(&self) -> &[ModelDefinition] {
        &self.models
    }

    pub fn model(&self, model_id: &str) -> AssetResult<&ModelDefinition> {
        self.models
            .iter()
            .find(|m| m.id == model_id)
            .ok_or_else(|| AssetError::UnknownModel(model_id.to_string()))
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.iter().any(|m| m.id == model_id)
    }

    /// Every model whose file set includes `path`
    pub fn models_referencing(&self, path: &str) -> Vec<&ModelDefinition> {
        let path = normalize_relative_path(path);
        self.models.iter().filter(|m| m.references(&path)).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Hardcoded catalog of supported image generation models.
    /// Sizes are approximate; the FLUX variants share the T5 encoder and all
    /// models share the same autoencoder.
    pub fn builtin() -> Self {
        let vae = VaeFile {
            relative_file_path: "vae/ae.safetensors".into(),
            approx_size_bytes: 335_304_388,
            url: None,
        };
        let t5 = vec![
            quant("Q5_K_M", "text-encoders/t5-v1_1-xxl-encoder-Q5_K_M.gguf", 3_390_000_000),
            quant("Q8_0", "text-encoders/t5-v1_1-xxl-encoder-Q8_0.gguf", 5_060_000_000),
        ];

        let models = vec![
            ModelDefinition {
                id: "z-image-turbo".into(),
                name: "Z-Image Turbo".into(),
                model_type: ModelType::ImageGeneration,
                diffusion: vec![
                    quant("Q4_K_M", "z-image-turbo/z_image_turbo-Q4_K_M.gguf", 4_980_000_000),
                    quant("Q8_0", "z-image-turbo/z_image_turbo-Q8_0.gguf", 7_220_000_000),
                ],
                text_encoder: vec![
                    quant("Q4_K_M", "text-encoders/Qwen3-4B-Q4_K_M.gguf", 2_500_000_000),
                    quant("Q8_0", "text-encoders/Qwen3-4B-Q8_0.gguf", 4_280_000_000),
                ],
                vae: vae.clone(),
            },
            ModelDefinition {
                id: "flux-1-schnell".into(),
                name: "FLUX.1 Schnell".into(),
                model_type: ModelType::ImageGeneration,
                diffusion: vec![
                    quant("Q4_K_S", "flux-1-schnell/flux1-schnell-Q4_K_S.gguf", 6_780_000_000),
                    quant("Q8_0", "flux-1-schnell/flux1-schnell-Q8_0.gguf", 12_700_000_000),
                ],
                text_encoder: t5.clone(),
                vae: vae.clone(),
            },
            ModelDefinition {
                id: "flux-1-dev".into(),
                name: "FLUX.1 Dev".into(),
                model_type: ModelType::ImageGeneration,
                diffusion: vec![
                    quant("Q4_K_S", "flux-1-dev/flux1-dev-Q4_K_S.gguf", 6_810_000_000),
                    quant("Q8_0", "flux-1-dev/flux1-dev-Q8_0.gguf", 12_700_000_000),
                ],
                text_encoder: t5,
                vae,
            },
        ];

        Self { models }
    }
}

fn quant(quant_id: &str, relative_file_path: &str, approx_size_bytes: u64) -> Quant {
    Quant {
        quant_id: quant_id.into(),
        relative_file_path: relative_file_path.into(),
        approx_size_bytes,
        url: None,
    }
}

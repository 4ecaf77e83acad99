use std::{fs, path::Path};

use candle_core::DType;
use layers::activations::ActivationKind;
use serde::{Deserialize, Serialize};

use crate::error::{LamdaError, Result};

/// How attention and feed-forward weights are distributed across depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerSharing {
    /// Every depth index owns its own attention and feed-forward weights.
    #[default]
    Independent,
    /// One attention and one feed-forward instance are reused at every depth.
    /// Pre-norm layers stay per depth.
    Shared,
}

/// Storage dtype for model parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterDType {
    #[default]
    F32,
    F16,
    BF16,
}

impl From<ParameterDType> for DType {
    fn from(dtype: ParameterDType) -> Self {
        match dtype {
            ParameterDType::F32 => DType::F32,
            ParameterDType::F16 => DType::F16,
            ParameterDType::BF16 => DType::BF16,
        }
    }
}

/// Non-linearity inside the feed-forward block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedForwardActivation {
    #[default]
    SquaredRelu,
    Geglu,
}

impl From<FeedForwardActivation> for ActivationKind {
    fn from(activation: FeedForwardActivation) -> Self {
        match activation {
            FeedForwardActivation::SquaredRelu => ActivationKind::SquaredRelu,
            FeedForwardActivation::Geglu => ActivationKind::Geglu,
        }
    }
}

/// Hyperparameters of the decoder.
///
/// Every field has a default, so partial JSON or TOML documents are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LamdaConfig {
    #[serde(default = "default_num_tokens")]
    pub num_tokens: usize,
    #[serde(default = "default_dim")]
    pub dim: usize,
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_dim_head")]
    pub dim_head: usize,
    #[serde(default = "default_heads")]
    pub heads: usize,
    #[serde(default = "default_ff_mult")]
    pub ff_mult: f32,
    #[serde(default)]
    pub ff_activation: FeedForwardActivation,
    /// Dropout on attention weights and inside the feed-forward block.
    #[serde(default)]
    pub dropout: f32,
    #[serde(default = "default_num_buckets")]
    pub num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub max_distance: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub layer_sharing: LayerSharing,
    #[serde(default)]
    pub dtype: ParameterDType,
    /// Convert every projection inside the decoder blocks to int8.
    #[serde(default)]
    pub quantize_transformer: bool,
    /// Convert the output projection to int8.
    #[serde(default)]
    pub quantize_logits: bool,
}

impl Default for LamdaConfig {
    fn default() -> Self {
        Self {
            num_tokens: default_num_tokens(),
            dim: default_dim(),
            depth: default_depth(),
            dim_head: default_dim_head(),
            heads: default_heads(),
            ff_mult: default_ff_mult(),
            ff_activation: FeedForwardActivation::default(),
            dropout: 0.0,
            num_buckets: default_num_buckets(),
            max_distance: default_max_distance(),
            layer_norm_eps: default_layer_norm_eps(),
            layer_sharing: LayerSharing::default(),
            dtype: ParameterDType::default(),
            quantize_transformer: false,
            quantize_logits: false,
        }
    }
}

impl LamdaConfig {
    /// Loads a configuration from `path`: JSON for `.json`, TOML for `.toml` or
    /// no extension. The result is validated before it is returned.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: LamdaConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => return Err(LamdaError::UnsupportedConfigFormat(other.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: LamdaConfig = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every field and reports all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("num_tokens", self.num_tokens),
            ("dim", self.dim),
            ("depth", self.depth),
            ("dim_head", self.dim_head),
            ("heads", self.heads),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }

        if !self.ff_mult.is_finite() || self.ff_mult <= 0.0 {
            errors.push("ff_mult must be a positive number".to_string());
        } else if self.dim > 0 && self.ff_inner_dim() == 0 {
            errors.push(format!(
                "ff_mult {} is too small for dim {}: feed-forward width would be 0",
                self.ff_mult, self.dim
            ));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            errors.push(format!("dropout must be in [0, 1), got {}", self.dropout));
        }

        if self.num_buckets < 2 || self.num_buckets % 2 != 0 {
            errors.push(format!(
                "num_buckets must be even and at least 2, got {}",
                self.num_buckets
            ));
        }
        if self.max_distance <= self.num_buckets / 2 {
            errors.push(format!(
                "max_distance ({}) must exceed num_buckets / 2 ({})",
                self.max_distance,
                self.num_buckets / 2
            ));
        }

        if !self.layer_norm_eps.is_finite() || self.layer_norm_eps <= 0.0 {
            errors.push("layer_norm_eps must be a positive number".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LamdaError::Config(errors))
        }
    }

    /// Width of the concatenated attention heads.
    pub fn inner_dim(&self) -> usize {
        self.heads * self.dim_head
    }

    /// Feed-forward expansion width before doubling.
    pub fn ff_inner_dim(&self) -> usize {
        (self.dim as f32 * self.ff_mult) as usize
    }

    /// Candle dtype used for parameters and activations.
    pub fn parameter_dtype(&self) -> DType {
        self.dtype.into()
    }

    /// Dropout probability as passed to the layers (`None` when disabled).
    pub fn dropout_p(&self) -> Option<f32> {
        (self.dropout > 0.0).then_some(self.dropout)
    }
}

fn default_num_tokens() -> usize {
    20_000
}

fn default_dim() -> usize {
    512
}

fn default_depth() -> usize {
    8
}

fn default_dim_head() -> usize {
    64
}

fn default_heads() -> usize {
    8
}

fn default_ff_mult() -> f32 {
    4.0
}

fn default_num_buckets() -> usize {
    32
}

fn default_max_distance() -> usize {
    128
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

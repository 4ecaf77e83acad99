use std::collections::HashSet;

use candle_core::{Device, Tensor, Var};
use embedding::token::{TokenEmbedding, TokenEmbeddingConfig};
use layers::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    norm::{LayerNorm, NormConfig},
    quantized::Projection,
    sublayer::Sublayer,
};

use crate::{config::LamdaConfig, error::Result, transformer::Transformer};

/// Decoder-only language model producing next-token logits.
#[derive(Debug)]
pub struct Lamda {
    config: LamdaConfig,
    policy: PrecisionPolicy,
    token_emb: TokenEmbedding,
    transformer: Transformer,
    norm: LayerNorm,
    to_logits: Projection,
}

impl Lamda {
    /// Validates `config` and builds every component on `device`.
    ///
    /// The model starts in evaluation mode.
    pub fn new(config: LamdaConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let dtype = config.parameter_dtype();
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);

        let token_emb = TokenEmbedding::new(TokenEmbeddingConfig {
            vocab_size: config.num_tokens,
            hidden_dim: config.dim,
            dtype,
            device: device.clone(),
        })?;
        let transformer = Transformer::new(&config, device)?;
        let norm = LayerNorm::identity(
            NormConfig {
                hidden_size: config.dim,
                epsilon: config.layer_norm_eps,
            },
            dtype,
            device,
        )?;
        let mut to_logits: Projection = Linear::with_init(
            LinearConfig::new(config.dim, config.num_tokens),
            &LinearInit::default(),
            device,
            dtype,
        )?
        .into();
        if config.quantize_logits {
            to_logits = to_logits.quantize()?;
        }

        let model = Self {
            config,
            policy,
            token_emb,
            transformer,
            norm,
            to_logits,
        };
        log::info!(
            "lamda model built: num_tokens={} dim={} depth={} heads={} dim_head={} sharing={:?} dtype={:?} quantize_transformer={} quantize_logits={} trainable_parameters={}",
            model.config.num_tokens,
            model.config.dim,
            model.config.depth,
            model.config.heads,
            model.config.dim_head,
            model.config.layer_sharing,
            model.config.dtype,
            model.config.quantize_transformer,
            model.config.quantize_logits,
            model.num_trainable_parameters()
        );
        Ok(model)
    }

    /// Returns the model configuration.
    pub fn config(&self) -> &LamdaConfig {
        &self.config
    }

    /// Produces logits shaped `(batch, seq, num_tokens)` for integer token ids
    /// shaped `(batch, seq)`.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let embedded = self.token_emb.forward(token_ids)?;
        let hidden = self.transformer.forward(&embedded, &self.policy)?;
        let normalized = self.norm.forward(&hidden, &self.policy)?;
        Ok(self.to_logits.forward(&normalized, &self.policy)?)
    }

    /// Trainable parameters by name. Tensors reachable under several names
    /// (shared layers) are reported once, under their first name.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.token_emb.named_parameters("token_emb");
        params.extend(self.transformer.named_parameters("layers"));
        params.extend(self.norm.named_parameters("norm"));
        params.extend(self.to_logits.named_parameters("to_logits"));

        let mut seen = HashSet::new();
        params.retain(|(_, var)| seen.insert(var.id()));
        params
    }

    /// Total number of trainable scalars.
    pub fn num_trainable_parameters(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum()
    }

    /// Enables dropout (`true`) or returns to deterministic evaluation.
    pub fn set_training(&self, training: bool) {
        self.transformer.set_training(training);
    }
}

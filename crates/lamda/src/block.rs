use std::sync::Arc;

use candle_core::{Device, Result, Tensor, Var};
use layers::{
    dtypes::PrecisionPolicy,
    mlp::FeedForward,
    norm::NormConfig,
    residual::{PreNorm, Residual},
    sublayer::{scoped, Sublayer},
};

use crate::{config::LamdaConfig, self_attention::SelfAttention};

/// Pre-norm decoder block: `x + attn(norm(x))`, then `h + ff(norm(h))`.
///
/// The attention and feed-forward sublayers are held through `Arc` so a
/// single instance can sit at several depths; the norms always belong to the
/// block.
#[derive(Debug)]
pub struct DecoderBlock {
    attention: Residual<PreNorm<Arc<SelfAttention>>>,
    feed_forward: Residual<PreNorm<Arc<FeedForward>>>,
}

impl DecoderBlock {
    /// Wraps the given sublayers with fresh pre-norm and residual connections.
    pub fn new(
        attention: Arc<SelfAttention>,
        feed_forward: Arc<FeedForward>,
        config: &LamdaConfig,
        device: &Device,
    ) -> Result<Self> {
        let norm = NormConfig {
            hidden_size: config.dim,
            epsilon: config.layer_norm_eps,
        };
        let dtype = config.parameter_dtype();
        Ok(Self {
            attention: Residual::new(PreNorm::new(norm.clone(), attention, dtype, device)?),
            feed_forward: Residual::new(PreNorm::new(norm, feed_forward, dtype, device)?),
        })
    }

    /// The attention sublayer held by this block.
    pub fn attention(&self) -> &Arc<SelfAttention> {
        self.attention.inner().inner()
    }

    /// The feed-forward sublayer held by this block.
    pub fn feed_forward(&self) -> &Arc<FeedForward> {
        self.feed_forward.inner().inner()
    }
}

impl Sublayer for DecoderBlock {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let after_attention = self.attention.forward(hidden, policy)?;
        self.feed_forward.forward(&after_attention, policy)
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.attention.named_parameters(&scoped(scope, "attention"));
        params.extend(
            self.feed_forward
                .named_parameters(&scoped(scope, "feed_forward")),
        );
        params
    }

    fn set_training(&self, training: bool) {
        self.attention.set_training(training);
        self.feed_forward.set_training(training);
    }
}

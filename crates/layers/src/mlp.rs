//! Position-wise feed-forward block.
//!
//! Hidden states `(batch, seq, hidden)` are expanded by `project_in` to
//! `2 * inner_dim` features, passed through the activation and dropout, then
//! contracted back to `hidden` by `project_out`. With the default squared ReLU
//! the activation keeps the full `2 * inner_dim` width, so there is no gating
//! split; the GEGLU option halves the width and `project_out` reads
//! `inner_dim` features instead.

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::{
    activations::ActivationKind,
    checks,
    dropout::Dropout,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    quantized::Projection,
    sublayer::{scoped, Sublayer},
};

/// Configuration for [`FeedForward`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Expansion factor; `inner_dim = floor(hidden_size * mult)`.
    pub mult: f32,
    /// Activation applied between projections.
    pub activation: ActivationKind,
    /// Dropout applied after the activation during training.
    pub dropout_p: Option<f32>,
}

impl FeedForwardConfig {
    /// Standard block: `mult = 4`, squared ReLU, no dropout.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            mult: 4.0,
            activation: ActivationKind::SquaredRelu,
            dropout_p: None,
        }
    }

    /// Width of the expansion before doubling.
    pub fn inner_dim(&self) -> usize {
        (self.hidden_size as f32 * self.mult) as usize
    }

    fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.inner_dim() == 0 {
            return Err(Error::Msg(format!(
                "feed-forward requires non-zero widths, got hidden {} mult {}",
                self.hidden_size, self.mult
            )));
        }
        Ok(())
    }
}

/// Two projections around an activation, with optional dropout.
#[derive(Debug)]
pub struct FeedForward {
    config: FeedForwardConfig,
    project_in: Projection,
    project_out: Projection,
    dropout: Dropout,
}

impl FeedForward {
    /// Builds the block with freshly initialised projections.
    pub fn new(
        config: FeedForwardConfig,
        init: &LinearInit,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let expanded = 2 * config.inner_dim();
        let project_in = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.inner_dim()).fused(2),
            init,
            device,
            dtype,
        )?;
        let project_out = Linear::with_init(
            LinearConfig::new(config.activation.output_width(expanded), config.hidden_size),
            init,
            device,
            dtype,
        )?;
        let dropout = Dropout::new(config.dropout_p, seed)?;
        Ok(Self {
            config,
            project_in: project_in.into(),
            project_out: project_out.into(),
            dropout,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Converts both projections to int8.
    pub fn quantize(self) -> Result<Self> {
        Ok(Self {
            project_in: self.project_in.quantize()?,
            project_out: self.project_out.quantize()?,
            ..self
        })
    }

    /// Whether the projections run in int8.
    pub fn is_quantized(&self) -> bool {
        self.project_in.is_quantized() && self.project_out.is_quantized()
    }
}

impl Sublayer for FeedForward {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("feed_forward.input", hidden, self.config.hidden_size)?;
        let expanded = self.project_in.forward(hidden, policy)?;
        let activated = self.config.activation.forward(&expanded, policy)?;
        let dropped = self.dropout.forward(&activated, policy)?;
        self.project_out.forward(&dropped, policy)
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.project_in.named_parameters(&scoped(scope, "project_in"));
        params.extend(self.project_out.named_parameters(&scoped(scope, "project_out")));
        params
    }

    fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }
}

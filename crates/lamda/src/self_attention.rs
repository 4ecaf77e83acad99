//! Multi-query causal self-attention with a relative position bias.
//!
//! Queries are projected per head while a single key/value head is shared by
//! all of them. Scores receive a bucketed relative position bias before the
//! causal mask and softmax, which run inside [`ExactAttention`].

use std::sync::atomic::{AtomicBool, Ordering};

use attention::{Attention, Config as AttentionConfig, ExactAttention};
use candle_core::{Device, Error, Result, Tensor, Var};
use embedding::positional::{RelativePositionBias, RelativePositionBiasConfig};
use layers::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    quantized::Projection,
    sublayer::{scoped, Sublayer},
};

use crate::config::LamdaConfig;

/// Self-attention sublayer operating on `(batch, seq, dim)`.
#[derive(Debug)]
pub struct SelfAttention {
    dim: usize,
    heads: usize,
    dim_head: usize,
    scale: f64,
    dropout_p: Option<f32>,
    to_q: Projection,
    to_kv: Projection,
    to_out: Projection,
    rel_pos_bias: RelativePositionBias,
    kernel: ExactAttention,
    training: AtomicBool,
}

impl SelfAttention {
    /// Builds the projections and bias table described by `config`.
    pub fn new(config: &LamdaConfig, device: &Device) -> Result<Self> {
        let dtype = config.parameter_dtype();
        let init = LinearInit::default();
        let (dim, heads, dim_head) = (config.dim, config.heads, config.dim_head);

        let projection = |linear_config: LinearConfig| -> Result<Projection> {
            Ok(Linear::with_init(linear_config, &init, device, dtype)?.into())
        };
        let to_q = projection(LinearConfig::without_bias(dim, heads * dim_head))?;
        let to_kv = projection(LinearConfig::without_bias(dim, dim_head).fused(2))?;
        let to_out = projection(LinearConfig::new(heads * dim_head, dim))?;

        let rel_pos_bias = RelativePositionBias::new(
            RelativePositionBiasConfig {
                num_buckets: config.num_buckets,
                max_distance: config.max_distance,
                heads,
                scale: (dim_head as f64).sqrt(),
            },
            dtype,
            device,
        )?;

        Ok(Self {
            dim,
            heads,
            dim_head,
            scale: (dim_head as f64).powf(-0.5),
            dropout_p: config.dropout_p(),
            to_q,
            to_kv,
            to_out,
            rel_pos_bias,
            kernel: ExactAttention::new(),
            training: AtomicBool::new(false),
        })
    }

    /// Converts the query, key/value and output projections to int8.
    ///
    /// The relative position table stays trainable.
    pub fn quantize(self) -> Result<Self> {
        Ok(Self {
            to_q: self.to_q.quantize()?,
            to_kv: self.to_kv.quantize()?,
            to_out: self.to_out.quantize()?,
            ..self
        })
    }

    /// Whether the projections run in int8.
    pub fn is_quantized(&self) -> bool {
        self.to_q.is_quantized() && self.to_kv.is_quantized() && self.to_out.is_quantized()
    }

    /// Borrows the relative position bias module.
    pub fn relative_position_bias(&self) -> &RelativePositionBias {
        &self.rel_pos_bias
    }

    fn kernel_config(&self) -> AttentionConfig {
        let dropout_p = if self.training.load(Ordering::Relaxed) {
            self.dropout_p
        } else {
            None
        };
        AttentionConfig::with_dropout(dropout_p)
    }
}

impl Sublayer for SelfAttention {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("attention.input", hidden, self.dim)?;
        let (batch, seq, _) = hidden.dims3()?;

        let q = self
            .to_q
            .forward(hidden, policy)?
            .reshape((batch, seq, self.heads, self.dim_head))?
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .affine(self.scale, 0.0)?;

        let kv = self.to_kv.forward(hidden, policy)?;
        let k = kv.narrow(2, 0, self.dim_head)?;
        let v = kv.narrow(2, self.dim_head, self.dim_head)?;

        let bias = self.rel_pos_bias.bias(seq, seq, hidden.device())?;
        let attended = self
            .kernel
            .attend(&q, &k, &v, Some(&bias), &self.kernel_config())
            .map_err(|e| Error::Msg(e.to_string()))?;

        let merged = attended
            .permute((0, 2, 1, 3))?
            .reshape((batch, seq, self.heads * self.dim_head))?;
        self.to_out.forward(&merged, policy)
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.to_q.named_parameters(&scoped(scope, "to_q"));
        params.extend(self.to_kv.named_parameters(&scoped(scope, "to_kv")));
        params.extend(self.to_out.named_parameters(&scoped(scope, "to_out")));
        params.extend(
            self.rel_pos_bias
                .named_parameters(&scoped(scope, "rel_pos_bias")),
        );
        params
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn small_config() -> LamdaConfig {
        LamdaConfig {
            num_tokens: 100,
            dim: 32,
            depth: 2,
            dim_head: 8,
            heads: 4,
            ..LamdaConfig::default()
        }
    }

    fn param_count(attention: &SelfAttention) -> usize {
        attention
            .named_parameters("attn")
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum()
    }

    #[test]
    fn shares_one_key_value_head() -> Result<()> {
        let attention = SelfAttention::new(&small_config(), &Device::Cpu)?;
        let params = attention.named_parameters("attn");
        let kv = params
            .iter()
            .find(|(name, _)| name == "attn.to_kv.weight")
            .map(|(_, var)| var.dims().to_vec());
        assert_eq!(kv, Some(vec![16, 32]));
        // to_q 32*32, to_kv 16*32, to_out 32*32 + 32, bias table 32*4
        assert_eq!(param_count(&attention), 1024 + 512 + 1056 + 128);
        Ok(())
    }

    #[test]
    fn preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let attention = SelfAttention::new(&small_config(), &device)?;
        let input = Tensor::randn(0f32, 1.0, (2, 7, 32), &device)?;
        let out = attention.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(out.dims(), &[2, 7, 32]);
        Ok(())
    }

    #[test]
    fn earlier_positions_ignore_later_tokens() -> Result<()> {
        let device = Device::Cpu;
        let attention = SelfAttention::new(&small_config(), &device)?;
        let policy = PrecisionPolicy::default();
        let input = Tensor::randn(0f32, 1.0, (1, 6, 32), &device)?;
        let altered = Tensor::cat(
            &[
                input.narrow(1, 0, 3)?,
                Tensor::randn(0f32, 1.0, (1, 3, 32), &device)?,
            ],
            1,
        )?;
        let a = attention.forward(&input, &policy)?.narrow(1, 0, 3)?;
        let b = attention.forward(&altered, &policy)?.narrow(1, 0, 3)?;
        let diff = a.sub(&b)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-5, "prefix changed by {diff}");
        Ok(())
    }

    #[test]
    fn quantized_attention_keeps_only_bias_table() -> Result<()> {
        let device = Device::Cpu;
        let attention = SelfAttention::new(&small_config(), &device)?.quantize()?;
        assert!(attention.is_quantized());
        assert_eq!(param_count(&attention), 128);
        let input = Tensor::randn(0f32, 1.0, (1, 4, 32), &device)?;
        let out = attention.forward(&input, &PrecisionPolicy::default())?;
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn rejects_wrong_hidden_size() -> Result<()> {
        let device = Device::Cpu;
        let attention = SelfAttention::new(&small_config(), &device)?;
        let input = Tensor::zeros((1, 4, 16), DType::F32, &device)?;
        assert!(attention.forward(&input, &PrecisionPolicy::default()).is_err());
        Ok(())
    }
}

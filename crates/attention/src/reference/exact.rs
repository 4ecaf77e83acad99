//! Reference attention kernel.
//!
//! The exact path prioritises numerical fidelity and mirrors the semantics
//! described by the [`Attention`](crate::core::Attention) trait.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::core::{Attention, AttentionError, Config, Precision};
use crate::masks::apply_causal_mask;

static KERNEL_INIT: OnceLock<()> = OnceLock::new();

/// Numerically stable, portable multi-query attention kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactAttention;

/// Validated geometry of a `(q, k, v)` triple.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    batch: usize,
    heads: usize,
    q_len: usize,
    k_len: usize,
    head_dim: usize,
}

impl ExactAttention {
    /// Construct the reference kernel.
    pub fn new() -> Self {
        Self
    }

    /// Post-softmax, pre-dropout attention weights shaped
    /// `[batch, heads, q_len, k_len]` in the query dtype.
    pub fn attention_weights(
        &self,
        q: &Tensor,
        k: &Tensor,
        bias: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let geometry = validate_qk(q, k)?;
        let weights = self.weights(q, k, bias, config, geometry)?;
        Ok(weights.to_dtype(q.dtype())?)
    }

    fn weights(
        &self,
        q: &Tensor,
        k: &Tensor,
        bias: Option<&Tensor>,
        config: &Config,
        g: Geometry,
    ) -> Result<Tensor, AttentionError> {
        let q_work = working_copy(q, config.precision)?;
        let k_work = working_copy(k, config.precision)?;

        // Every head reads the same keys, so fold heads into the query rows.
        let q_rows = q_work.reshape((g.batch, g.heads * g.q_len, g.head_dim))?;
        let mut scores = q_rows
            .matmul(&k_work.transpose(1, 2)?)?
            .reshape((g.batch, g.heads, g.q_len, g.k_len))?;

        if let Some(bias) = bias {
            validate_bias(bias, q, g)?;
            scores = scores.broadcast_add(&bias.to_dtype(scores.dtype())?)?;
        }

        let masked = apply_causal_mask(&scores)?;
        Ok(softmax_last_dim(&masked)?)
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if KERNEL_INIT.set(()).is_ok() {
            log::info!(
                "attention::reference init precision={:?} dropout={:?}",
                config.precision,
                config.dropout_p
            );
        }

        let g = validate_qk(q, k)?;
        if v.dtype() != q.dtype() {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must share the same dtype".to_string(),
            });
        }
        if !q.device().same_device(v.device()) {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must reside on the same device".to_string(),
            });
        }
        let (vb, vk, vd) = v.dims3().map_err(|_| AttentionError::InvalidShape {
            context: "v must have shape [batch, seq_len, head_dim]".to_string(),
        })?;
        if vb != g.batch || vk != g.k_len || vd != g.head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "v shape mismatch: expected [{}, {}, {}] got [{vb}, {vk}, {vd}]",
                    g.batch, g.k_len, g.head_dim
                ),
            });
        }

        let probs = self.weights(q, k, bias, config, g)?;
        let probs = match config.dropout_p {
            Some(p) if !(0.0..1.0).contains(&p) => {
                return Err(AttentionError::InvalidShape {
                    context: format!("dropout probability must be in [0, 1), got {p}"),
                });
            }
            Some(p) if p > 0.0 => dropout(&probs, p)?,
            _ => probs,
        };

        let v_work = working_copy(v, config.precision)?;
        let output = probs
            .reshape((g.batch, g.heads * g.q_len, g.k_len))?
            .matmul(&v_work)?
            .reshape((g.batch, g.heads, g.q_len, g.head_dim))?;
        Ok(output.to_dtype(q.dtype())?)
    }
}

fn working_copy(tensor: &Tensor, precision: Precision) -> Result<Tensor, AttentionError> {
    let work = match precision {
        Precision::ForceF32 => tensor.to_dtype(DType::F32)?,
        Precision::Inherit => tensor.clone(),
    };
    Ok(work.contiguous()?)
}

fn validate_qk(q: &Tensor, k: &Tensor) -> Result<Geometry, AttentionError> {
    let dtype = q.dtype();
    if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }
    if k.dtype() != dtype {
        return Err(AttentionError::InvalidShape {
            context: "q, k, v must share the same dtype".to_string(),
        });
    }
    if !q.device().same_device(k.device()) {
        return Err(AttentionError::InvalidShape {
            context: "q, k, v must reside on the same device".to_string(),
        });
    }

    let (batch, heads, q_len, head_dim) =
        q.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "q must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;
    let (kb, k_len, kd) = k.dims3().map_err(|_| AttentionError::InvalidShape {
        context: "k must have shape [batch, seq_len, head_dim]".to_string(),
    })?;
    if kb != batch || kd != head_dim {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "k shape mismatch: expected [{batch}, ?, {head_dim}] got [{kb}, {k_len}, {kd}]"
            ),
        });
    }
    Ok(Geometry {
        batch,
        heads,
        q_len,
        k_len,
        head_dim,
    })
}

fn validate_bias(bias: &Tensor, q: &Tensor, g: Geometry) -> Result<(), AttentionError> {
    if !q.device().same_device(bias.device()) {
        return Err(AttentionError::InvalidShape {
            context: "bias must reside on the same device as q".to_string(),
        });
    }
    let (bb, bh, bq, bk) = bias.dims4().map_err(|_| AttentionError::InvalidShape {
        context: "bias must have shape [batch|1, heads, q_len, k_len]".to_string(),
    })?;
    if (bb != 1 && bb != g.batch) || bh != g.heads || bq != g.q_len || bk != g.k_len {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "bias shape mismatch: expected [1|{}, {}, {}, {}] got [{bb}, {bh}, {bq}, {bk}]",
                g.batch, g.heads, g.q_len, g.k_len
            ),
        });
    }
    Ok(())
}

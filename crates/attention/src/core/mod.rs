//! Core traits and types shared across attention implementations.
//!
//! Queries carry a head axis, `[batch, heads, q_len, head_dim]`, while keys
//! and values are shared by every head, `[batch, k_len, head_dim]`
//! (multi-query attention). The output mirrors the query layout and dtype.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::{Config, Precision};
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, heads, q_len, head_dim]` and already scaled by the caller.
/// * `k` and `v` are `[batch, k_len, head_dim]`.
/// * `bias`, when present, is added to the scores and must be shaped
///   `[1 or batch, heads, q_len, k_len]`.
/// * A causal mask is always applied after the bias.
/// * Dropout is controlled via [`Config::dropout_p`].
pub trait Attention {
    /// Compute causal multi-query attention with an optional additive bias.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        bias: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}

//! Exact causal attention primitives for the decoder.
//!
//! Queries are laid out `[batch, heads, seq_len, head_dim]`; keys and values
//! are a single shared head, `[batch, seq_len, head_dim]`. An additive bias
//! (for example a relative position bias) may be supplied per head. Reductions
//! run in `f32` by default and the output matches the query dtype.
//!
//! Causal masking is always enforced. Masked scores are set to the most
//! negative finite value of the score dtype, so rows never contain `-inf` and
//! softmax never yields `NaN`.
//!
//! Dropout on the attention weights is optional and controlled by [`Config`].

pub mod core;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionError, Config, Precision};
pub use reference::ExactAttention;

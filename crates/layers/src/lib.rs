//! Building blocks for the decoder layers.
//!
//! Everything here operates on Candle tensors laid out as `(batch, seq, hidden)`
//! and shares the [`Sublayer`] capability so blocks can be wrapped uniformly by
//! [`residual::Residual`] and [`residual::PreNorm`]. Affine maps come in two
//! structural flavours, full precision [`linear::Linear`] and int8
//! [`quantized::QuantizedLinear`], unified behind [`quantized::Projection`].

pub mod activations;
pub mod checks;
pub mod dropout;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod quantized;
pub mod residual;
pub mod sublayer;

pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use mlp::{FeedForward, FeedForwardConfig};
pub use norm::{LayerNorm, NormConfig};
pub use quantized::{Projection, QuantizedLinear};
pub use residual::{PreNorm, Residual};
pub use sublayer::{sublayer_fn, FnSublayer, Sublayer};

//! Mask utilities shared by attention implementations.
//!
//! Masks are boolean `u8` tensors shaped `[q_len, k_len]` with `1` marking a
//! discarded position. They are applied by overwriting scores with the most
//! negative finite value of the score dtype rather than adding `-inf`, which
//! keeps fully masked rows finite.

pub mod causal;

use candle_core::DType;

/// Dtype of boolean masks.
pub const MASK_DTYPE: DType = DType::U8;

pub use causal::{apply_causal_mask, causal_mask, mask_fill_value};

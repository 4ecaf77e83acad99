//! Builders for causal attention masks.

use candle_core::{DType, Device, Error, Result, Tensor};

use super::MASK_DTYPE;

/// Most negative finite `bf16`, `-(2 - 2^-7) * 2^127`.
const BF16_MIN: f64 = -3.389_531_389_251_535_5e38;
/// Most negative finite `f16`.
const F16_MIN: f64 = -65_504.0;

/// Construct a `[q_len, k_len]` causal mask (`1` = masked).
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, so query `q` sees keys up to `q + (k_len - q_len)`.
pub fn causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let data: Vec<u8> = (0..q_len)
        .flat_map(|q| (0..k_len).map(move |k| u8::from(k > q + offset)))
        .collect();
    Tensor::from_vec(data, (q_len, k_len), device)?.to_dtype(MASK_DTYPE)
}

/// Most negative finite value representable in `dtype`.
pub fn mask_fill_value(dtype: DType) -> Result<f64> {
    match dtype {
        DType::F32 => Ok(f32::MIN as f64),
        DType::F16 => Ok(F16_MIN),
        DType::BF16 => Ok(BF16_MIN),
        DType::F64 => Ok(f64::MIN),
        other => Err(Error::Msg(format!(
            "causal mask requires a float score dtype, got {other:?}"
        ))),
    }
}

/// Overwrites future positions of `scores` (`[.., q_len, k_len]`) with
/// [`mask_fill_value`].
pub fn apply_causal_mask(scores: &Tensor) -> Result<Tensor> {
    let rank = scores.rank();
    if rank < 2 {
        return Err(Error::Msg(format!(
            "causal mask expects scores of rank >= 2, got {:?}",
            scores.dims()
        )));
    }
    let dims = scores.dims();
    let (q_len, k_len) = (dims[rank - 2], dims[rank - 1]);
    let fill = Tensor::new(mask_fill_value(scores.dtype())?, scores.device())?
        .to_dtype(scores.dtype())?
        .broadcast_as(scores.shape())?;
    causal_mask(scores.device(), q_len, k_len)?
        .broadcast_as(scores.shape())?
        .where_cond(&fill, scores)
}

//! Post-training dynamic int8 quantization of affine projections.
//!
//! [`QuantizedLinear`] stores each output row of a [`Linear`] weight as
//! symmetric int8 values with one `f32` scale per row. The int8 values are kept
//! in a `u8` tensor in offset-binary form (`q + 128`) since Candle has no
//! signed byte dtype. At forward time the activations are quantized on the fly
//! (one symmetric scale per input row), multiplied as integers, and rescaled by
//! the outer product of activation and weight scales before the `f32` bias is
//! added. Quantized layers are frozen: they expose no trainable parameters.
//!
//! [`Projection`] is the structural choice between the two precisions. It is
//! fixed when a block is built; converting is a one-way consuming operation.

use candle_core::{DType, Error, Result, Tensor, Var, D};

use crate::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{self, Linear, LinearConfig},
};

const QMAX: f32 = 127.0;
const ZERO_POINT: f64 = 128.0;
const MIN_SCALE: f32 = 1e-12;

/// Int8 copy of a [`Linear`] layer.
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    config: LinearConfig,
    weight: Tensor,
    weight_scales: Tensor,
    bias: Option<Tensor>,
}

impl QuantizedLinear {
    /// Quantizes `linear` with per-output-channel symmetric scales.
    pub fn from_linear(linear: &Linear) -> Result<Self> {
        let config = linear.config().clone();
        let weight = linear.weight().to_dtype(DType::F32)?;
        let scales = symmetric_scales(&weight)?;
        let quantized = weight
            .broadcast_div(&scales)?
            .round()?
            .clamp(-QMAX, QMAX)?;
        let stored = (quantized + ZERO_POINT)?.to_dtype(DType::U8)?;
        let weight_scales = scales.squeeze(1)?;
        let bias = linear.bias().map(|b| b.to_dtype(DType::F32)).transpose()?;

        log::debug!(
            "quantized linear {}x{} max_scale={:.3e}",
            config.total_output_dim(),
            config.input_dim,
            weight_scales.max_all()?.to_vec0::<f32>()?
        );

        Ok(Self {
            config,
            weight: stored,
            weight_scales,
            bias,
        })
    }

    /// Returns the static configuration inherited from the source layer.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Reconstructs the `f32` weight matrix the int8 values stand for.
    pub fn dequantized_weight(&self) -> Result<Tensor> {
        self.signed_weight()?
            .broadcast_mul(&self.weight_scales.unsqueeze(1)?)
    }

    /// Applies the quantized projection to `(batch, seq, in)` or `(rows, in)`.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        linear::validate_input(&self.config, hidden)?;

        let leading: Vec<usize> = hidden.dims()[..hidden.rank() - 1].to_vec();
        let rows = leading.iter().product::<usize>();
        let input = hidden
            .to_dtype(DType::F32)?
            .reshape((rows, self.config.input_dim))?;

        let input_scales = symmetric_scales(&input)?;
        let input_q = input
            .broadcast_div(&input_scales)?
            .round()?
            .clamp(-QMAX, QMAX)?;

        let accumulated = input_q.matmul(&self.signed_weight()?.t()?)?;
        let mut output = accumulated
            .broadcast_mul(&input_scales)?
            .broadcast_mul(&self.weight_scales.unsqueeze(0)?)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias)?;
        }

        let mut output_dims = leading;
        output_dims.push(self.config.total_output_dim());
        policy.cast_to_storage(&output.reshape(output_dims)?)
    }

    fn signed_weight(&self) -> Result<Tensor> {
        self.weight.to_dtype(DType::F32)? - ZERO_POINT
    }
}

/// One symmetric scale per row: `max(|row|) / 127`, floored away from zero.
fn symmetric_scales(matrix: &Tensor) -> Result<Tensor> {
    checks::expect_rank("quantize.input", matrix, 2)?;
    (matrix.abs()?.max_keepdim(D::Minus1)? / QMAX as f64)?.clamp(MIN_SCALE, f32::MAX)
}

/// Affine projection in either full or int8 precision.
#[derive(Debug, Clone)]
pub enum Projection {
    /// Trainable full-precision layer.
    Full(Linear),
    /// Frozen int8 layer derived from a full one.
    Quantized(QuantizedLinear),
}

impl Projection {
    /// Converts to the int8 variant, consuming the full-precision weights.
    pub fn quantize(self) -> Result<Self> {
        match self {
            Projection::Full(linear) => {
                Ok(Projection::Quantized(QuantizedLinear::from_linear(&linear)?))
            }
            Projection::Quantized(_) => Err(Error::Msg(
                "projection is already quantized".into(),
            )),
        }
    }

    /// Whether this projection runs in int8.
    pub fn is_quantized(&self) -> bool {
        matches!(self, Projection::Quantized(_))
    }

    /// Returns the configuration shared by both variants.
    pub fn config(&self) -> &LinearConfig {
        match self {
            Projection::Full(linear) => linear.config(),
            Projection::Quantized(quantized) => quantized.config(),
        }
    }

    /// Applies whichever variant is held.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self {
            Projection::Full(linear) => linear.forward(hidden, policy),
            Projection::Quantized(quantized) => quantized.forward(hidden, policy),
        }
    }

    /// Trainable parameters; empty once quantized.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        match self {
            Projection::Full(linear) => linear.named_parameters(scope),
            Projection::Quantized(_) => Vec::new(),
        }
    }
}

impl From<Linear> for Projection {
    fn from(linear: Linear) -> Self {
        Projection::Full(linear)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::LinearInit;
    use candle_core::Device;

    fn max_abs(tensor: &Tensor) -> Result<f32> {
        tensor.abs()?.max_all()?.to_vec0::<f32>()
    }

    #[test]
    fn weights_round_trip_within_half_a_step() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(16, 8),
            &LinearInit::FanInUniform,
            &device,
            DType::F32,
        )?;
        let quantized = QuantizedLinear::from_linear(&linear)?;
        assert_eq!(quantized.weight.dtype(), DType::U8);

        let restored = quantized.dequantized_weight()?;
        let step = quantized.weight_scales.unsqueeze(1)?;
        let err = restored.sub(linear.weight())?.abs()?.broadcast_div(&step)?;
        assert!(max_abs(&err)? <= 0.5 + 1e-4);
        Ok(())
    }

    #[test]
    fn quantized_output_tracks_full_precision() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(32, 24),
            &LinearInit::FanInUniform,
            &device,
            DType::F32,
        )?;
        let input = Tensor::randn(0f32, 1.0, (2, 7, 32), &device)?;
        let policy = PrecisionPolicy::default();

        let reference = linear.forward(&input, &policy)?;
        let quantized = Projection::from(linear).quantize()?;
        let output = quantized.forward(&input, &policy)?;

        assert_eq!(output.dims(), reference.dims());
        let diff = max_abs(&output.sub(&reference)?)?;
        let scale = max_abs(&reference)?;
        assert!(diff <= 0.05 * scale + 1e-3, "diff {diff} vs scale {scale}");
        assert!(diff > 0.0, "int8 path should not be bit-identical");
        Ok(())
    }

    #[test]
    fn quantized_projection_is_frozen_and_single_shot() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::without_bias(4, 4),
            &LinearInit::default(),
            &device,
            DType::F32,
        )?;
        let full = Projection::from(linear);
        assert_eq!(full.named_parameters("p").len(), 1);

        let quantized = full.quantize()?;
        assert!(quantized.is_quantized());
        assert!(quantized.named_parameters("p").is_empty());
        assert!(quantized.quantize().is_err());
        Ok(())
    }

    #[test]
    fn zero_rows_do_not_divide_by_zero() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::new(
            LinearConfig::without_bias(3, 2),
            Tensor::zeros((2, 3), DType::F32, &device)?,
            None,
        )?;
        let quantized = QuantizedLinear::from_linear(&linear)?;
        let input = Tensor::zeros((1, 1, 3), DType::F32, &device)?;
        let out = quantized.forward(&input, &PrecisionPolicy::default())?;
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| *v == 0.0));
        Ok(())
    }
}

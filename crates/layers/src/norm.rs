//! Layer normalisation over the trailing feature axis.
//!
//! Inputs follow the `(batch, seq, hidden)` convention. Mean and variance are
//! computed in [`PrecisionPolicy::reduction`], the learned scale and shift are
//! applied in the compute dtype, and the result is cast back to storage.

use candle_core::{DType, Device, Result, Tensor, Var, D};

use crate::{checks, dtypes::PrecisionPolicy, sublayer::scoped};

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration with the usual `1e-5` epsilon.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
        }
    }
}

/// LayerNorm with learnable per-feature scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Var,
    bias: Var,
}

impl LayerNorm {
    /// Constructs a LayerNorm from explicit scale and shift tensors.
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        for (name, tensor) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            checks::expect_shape(name, tensor, &[config.hidden_size])?;
            checks::expect_dtype_in(name, tensor, &[DType::F16, DType::BF16, DType::F32])?;
        }
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
        })
    }

    /// Identity-initialised LayerNorm (scale 1, shift 0).
    pub fn identity(config: NormConfig, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// Trainable scale and shift as `scope.weight` / `scope.bias`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (scoped(scope, "weight"), self.weight.clone()),
            (scoped(scope, "bias"), self.bias.clone()),
        ]
    }

    /// Normalises `hidden` along its last axis.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = policy.cast_for_matmul(&centered.broadcast_div(&denom)?)?;

        let weight = self.weight.as_tensor().to_dtype(normalized.dtype())?;
        let bias = self.bias.as_tensor().to_dtype(normalized.dtype())?;
        let shifted = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;

        policy.cast_to_storage(&shifted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::ops;

    fn build_input(device: &Device, dtype: DType, shape: (usize, usize, usize)) -> Result<Tensor> {
        let total = shape.0 * shape.1 * shape.2;
        let data = (0..total)
            .map(|i| (i as f32 * 0.25_f32) - 1.5_f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, shape, device)?.to_dtype(dtype)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn layer_norm_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 4;
        let config = NormConfig::new(hidden);

        let weight_f32 = Tensor::from_vec(vec![1.0f32, 0.5, -0.25, 1.5], (hidden,), &device)?;
        let bias_f32 = Tensor::from_vec(vec![0.1f32, -0.2, 0.05, 0.0], (hidden,), &device)?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let input = build_input(&device, dtype, (2, 3, hidden))?;
            let weight = weight_f32.to_dtype(dtype)?;
            let bias = bias_f32.to_dtype(dtype)?;
            let layer = LayerNorm::new(weight.clone(), bias.clone(), config.clone())?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = layer.forward(&input, &policy)?;

            assert_eq!(output.dims(), input.dims());
            assert_eq!(output.dtype(), dtype);

            let reference = ops::layer_norm(
                &input.to_dtype(DType::F32)?,
                &weight.to_dtype(DType::F32)?,
                &bias.to_dtype(DType::F32)?,
                config.epsilon as f32,
            )?;
            let tol = match dtype {
                DType::F16 => 5e-3,
                DType::BF16 => 3e-2,
                _ => 5e-4,
            };
            let diff = max_diff(&output, &reference)?;
            assert!(diff < tol, "max diff {} for dtype {:?}", diff, dtype);
        }
        Ok(())
    }

    #[test]
    fn identity_norm_gives_zero_mean_unit_variance_rows() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 8;
        let layer = LayerNorm::identity(NormConfig::new(hidden), DType::F32, &device)?;
        let input = build_input(&device, DType::F32, (1, 3, hidden))?;
        let output = layer.forward(&input, &PrecisionPolicy::default())?;

        for row in output.squeeze(0)?.to_vec2::<f32>()? {
            let mean = row.iter().sum::<f32>() / hidden as f32;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / hidden as f32;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
        assert_eq!(layer.named_parameters("norm").len(), 2);
        Ok(())
    }

    #[test]
    fn layer_norm_handles_edge_shapes() -> Result<()> {
        let device = Device::Cpu;
        for &(batch, seq, hidden) in &[(1, 1, 1), (2, 1, 1), (1, 64, 8), (2, 3, 256)] {
            let input = build_input(&device, DType::F32, (batch, seq, hidden))?;
            let layer = LayerNorm::identity(NormConfig::new(hidden), DType::F32, &device)?;
            let output = layer.forward(&input, &PrecisionPolicy::default())?;
            let weight = Tensor::ones(hidden, DType::F32, &device)?;
            let bias = Tensor::zeros(hidden, DType::F32, &device)?;
            let reference = ops::layer_norm(&input, &weight, &bias, 1e-5)?;
            let diff = max_diff(&output, &reference)?;
            assert!(diff < 5e-4, "shape {:?} diff {}", (batch, seq, hidden), diff);
        }
        Ok(())
    }

    #[test]
    fn rejects_wrong_hidden_size() -> Result<()> {
        let device = Device::Cpu;
        let layer = LayerNorm::identity(NormConfig::new(4), DType::F32, &device)?;
        let input = Tensor::zeros((1, 2, 3), DType::F32, &device)?;
        assert!(layer.forward(&input, &PrecisionPolicy::default()).is_err());
        Ok(())
    }
}

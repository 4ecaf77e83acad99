//! Full-precision affine projections.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` (or `(rows,
//! in_dim)`) and return the same leading layout with `out_dim` features. Fused
//! variants pack several projections side by side as
//! `(batch, seq, fused_projections * output_dim)` so callers can split them, as
//! the attention key/value projection and the feed-forward expansion do.
//! Weights and activations are promoted to [`PrecisionPolicy::compute`] for
//! the matmul and the result is cast back to the storage dtype.

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::{checks, dtypes::PrecisionPolicy, sublayer::scoped};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension per projection shard.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
    /// Number of projections fused together (1 for standard linear).
    pub fused_projections: usize,
}

impl LinearConfig {
    /// Creates a configuration for a single projection layer with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
            fused_projections: 1,
        }
    }

    /// Same as [`LinearConfig::new`] but without a bias vector.
    pub fn without_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            bias: false,
            ..Self::new(input_dim, output_dim)
        }
    }

    /// Packs `count` projections of `output_dim` features each.
    pub fn fused(mut self, count: usize) -> Self {
        self.fused_projections = count;
        self
    }

    /// Total number of output features produced by the layer.
    pub fn total_output_dim(&self) -> usize {
        self.output_dim * self.fused_projections
    }
}

/// Weight initialisation policies.
#[derive(Debug, Clone, Default)]
pub enum LinearInit {
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` for weight and bias.
    #[default]
    FanInUniform,
    /// Xavier/Glorot normal initialisation; bias starts at zero.
    XavierNormal,
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        match self {
            LinearInit::FanInUniform => {
                let bound = (1.0 / fan_in.sqrt()) as f32;
                Tensor::rand(-bound, bound, shape, device)
            }
            LinearInit::XavierNormal => {
                let std = (2.0 / (fan_in + fan_out)).sqrt() as f32;
                Tensor::randn(0f32, std, shape, device)
            }
        }
    }

    fn sample_bias(&self, len: usize, fan_in: usize, device: &Device) -> Result<Tensor> {
        match self {
            LinearInit::FanInUniform => {
                let bound = (1.0 / (fan_in as f64).sqrt()) as f32;
                Tensor::rand(-bound, bound, len, device)
            }
            LinearInit::XavierNormal => Tensor::zeros(len, DType::F32, device),
        }
    }
}

/// Dense affine projection with optional bias and trainable parameters.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    ///
    /// `weight` is shaped `(total_output_dim, input_dim)`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: bias.as_ref().map(Var::from_tensor).transpose()?,
        })
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let shape = (config.total_output_dim(), config.input_dim);
        let weight = init.sample(shape, device)?.to_dtype(dtype)?;
        let bias = if config.bias {
            Some(
                init.sample_bias(config.total_output_dim(), config.input_dim, device)?
                    .to_dtype(dtype)?,
            )
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns the static configuration.
    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns the weight tensor.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Returns the bias tensor if present.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }

    /// Trainable parameters as `scope.weight` / `scope.bias`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = vec![(scoped(scope, "weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((scoped(scope, "bias"), bias.clone()));
        }
        params
    }

    /// Applies the projection, promoting to the compute dtype for the matmul.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        validate_input(&self.config, hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(self.weight.as_tensor())?.t()?;

        let mut output = match input.dims() {
            [batch, seq, _] => {
                let (batch, seq) = (*batch, *seq);
                input
                    .reshape((batch * seq, self.config.input_dim))?
                    .matmul(&weight_t)?
                    .reshape((batch, seq, self.config.total_output_dim()))?
            }
            _ => input.matmul(&weight_t)?,
        };

        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias.as_tensor())?;
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        if config.input_dim == 0 || config.total_output_dim() == 0 {
            return Err(Error::Msg(format!(
                "linear dimensions must be non-zero, got {} -> {}",
                config.input_dim,
                config.total_output_dim()
            )));
        }
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.total_output_dim(), config.input_dim],
        )?;
        checks::expect_dtype_in(
            "linear.weight",
            weight,
            &[DType::F16, DType::BF16, DType::F32],
        )
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.total_output_dim()])?;
                checks::expect_dtype_in(
                    "linear.bias",
                    tensor,
                    &[DType::F16, DType::BF16, DType::F32],
                )
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }
}

/// Shared input validation for full and quantized projections.
pub(crate) fn validate_input(config: &LinearConfig, hidden: &Tensor) -> Result<()> {
    match hidden.dims() {
        [_, _, _] => checks::expect_batch_seq_hidden("linear.input", hidden, config.input_dim),
        [_, _] => checks::expect_last_dim("linear.input", hidden, config.input_dim),
        dims => Err(Error::Msg(format!(
            "linear.input expected [B, T, {}] or [T, {}], got {dims:?}",
            config.input_dim, config.input_dim
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let (batch, seq, hidden) = input.dims3()?;
        let mut out = input
            .reshape((batch * seq, hidden))?
            .matmul(&weight.t()?)?
            .reshape((batch, seq, weight.dims()[0]))?;
        if let Some(bias) = bias {
            out = out.broadcast_add(bias)?;
        }
        Ok(out)
    }

    fn tensor_stats(tensor: &Tensor) -> Result<(f64, f64)> {
        let values = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let n = values.len() as f64;
        let mean = values.iter().copied().map(f64::from).sum::<f64>() / n;
        let var = values
            .iter()
            .map(|v| (f64::from(*v) - mean).powi(2))
            .sum::<f64>()
            / n;
        Ok((mean, var.sqrt()))
    }

    #[test]
    fn forward_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 4).fused(2);
        let weight = Tensor::randn(
            0f32,
            0.05,
            (config.total_output_dim(), config.input_dim),
            &device,
        )?;
        let bias = Tensor::randn(0f32, 0.02, config.total_output_dim(), &device)?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let linear = Linear::new(
                config.clone(),
                weight.to_dtype(dtype)?,
                Some(bias.to_dtype(dtype)?),
            )?;
            let input =
                Tensor::randn(0f32, 1.0, (2, 5, config.input_dim), &device)?.to_dtype(dtype)?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = linear.forward(&input, &policy)?;

            assert_eq!(output.dims(), &[2, 5, 8]);
            assert_eq!(output.dtype(), dtype);

            let reference = reference_linear(&input.to_dtype(DType::F32)?, &weight, Some(&bias))?;
            let max = output
                .to_dtype(DType::F32)?
                .sub(&reference)?
                .abs()?
                .max_all()?
                .to_vec0::<f32>()?;
            let tol = match dtype {
                DType::F16 => 1e-2,
                DType::BF16 => 2e-2,
                _ => 1e-4,
            };
            assert!(max <= tol, "max diff {} for {:?}", max, dtype);
        }
        Ok(())
    }

    #[test]
    fn bias_free_projection_accepts_rows() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::without_bias(3, 2);
        let weight = Tensor::from_vec(vec![1f32, 0., 0., 0., 1., 1.], (2, 3), &device)?;
        let linear = Linear::new(config, weight, None)?;
        let input = Tensor::from_vec(vec![1f32, 2., 3.], (1, 3), &device)?;
        let out = linear.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(out.to_vec2::<f32>()?, vec![vec![1.0, 5.0]]);
        assert_eq!(linear.named_parameters("to_q").len(), 1);
        Ok(())
    }

    #[test]
    fn rejects_mismatched_parameters_and_inputs() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(4, 2);
        let bad_weight = Tensor::zeros((4, 2), DType::F32, &device)?;
        assert!(Linear::new(config.clone(), bad_weight, None).is_err());

        let linear = Linear::with_init(config, &LinearInit::default(), &device, DType::F32)?;
        let input = Tensor::zeros((1, 2, 5), DType::F32, &device)?;
        let err = linear
            .forward(&input, &PrecisionPolicy::default())
            .unwrap_err();
        assert!(err.to_string().contains("linear.input"));
        Ok(())
    }

    #[test]
    fn fan_in_uniform_stays_within_bound() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(64, 32),
            &LinearInit::FanInUniform,
            &device,
            DType::F32,
        )?;
        let bound = 1.0 / 8.0;
        let max = linear.weight().abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(max <= bound);
        let bias_max = linear
            .bias()
            .map(|b| b.abs()?.max_all()?.to_vec0::<f32>())
            .transpose()?
            .unwrap_or(0.0);
        assert!(bias_max <= bound);
        Ok(())
    }

    #[test]
    fn glorot_normal_stats_are_reasonable() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(128, 64),
            &LinearInit::XavierNormal,
            &device,
            DType::F32,
        )?;
        let (mean, std) = tensor_stats(linear.weight())?;
        let expected = (2.0f64 / (128.0 + 64.0)).sqrt();
        assert!(mean.abs() < 5e-3);
        assert!((std - expected).abs() < expected * 0.25);
        Ok(())
    }
}

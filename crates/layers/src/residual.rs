//! Residual and pre-norm wrappers around a [`Sublayer`].
//!
//! Both wrappers are themselves sublayers, so a decoder block composes as
//! `Residual<PreNorm<F>>`: normalise, transform, add back the input. The
//! residual sum is taken in [`PrecisionPolicy::compute`] and cast to storage.

use candle_core::{DType, Device, Result, Tensor, Var};

use crate::{
    checks,
    dtypes::PrecisionPolicy,
    norm::{LayerNorm, NormConfig},
    sublayer::{scoped, Sublayer},
};

/// Computes `f(x) + x`.
#[derive(Debug, Clone)]
pub struct Residual<F> {
    inner: F,
}

impl<F: Sublayer> Residual<F> {
    /// Wraps `inner` with a skip connection.
    pub fn new(inner: F) -> Self {
        Self { inner }
    }

    /// Borrows the wrapped transform.
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: Sublayer> Sublayer for Residual<F> {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let branch = self.inner.forward(hidden, policy)?;
        checks::expect_shape("residual.branch", &branch, hidden.dims())?;
        checks::expect_same_dtype("residual.branch", &branch, "residual.input", hidden)?;

        let added = policy
            .cast_for_matmul(&branch)?
            .add(&policy.cast_for_matmul(hidden)?)?;
        policy.cast_to_storage(&added)
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        self.inner.named_parameters(scope)
    }

    fn set_training(&self, training: bool) {
        self.inner.set_training(training);
    }
}

/// Computes `f(LayerNorm(x))` with a LayerNorm owned by the wrapper.
#[derive(Debug, Clone)]
pub struct PreNorm<F> {
    norm: LayerNorm,
    inner: F,
}

impl<F: Sublayer> PreNorm<F> {
    /// Wraps `inner` behind an identity-initialised LayerNorm over `config.hidden_size`.
    pub fn new(config: NormConfig, inner: F, dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self {
            norm: LayerNorm::identity(config, dtype, device)?,
            inner,
        })
    }

    /// Borrows the normalisation layer.
    pub fn norm(&self) -> &LayerNorm {
        &self.norm
    }

    /// Borrows the wrapped transform.
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: Sublayer> Sublayer for PreNorm<F> {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let normed = self.norm.forward(hidden, policy)?;
        self.inner.forward(&normed, policy)
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.norm.named_parameters(&scoped(scope, "norm"));
        params.extend(self.inner.named_parameters(scope));
        params
    }

    fn set_training(&self, training: bool) {
        self.inner.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sublayer::sublayer_fn;

    fn policy(dtype: DType) -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(dtype)
    }

    #[test]
    fn residual_around_doubling_triples_input() -> Result<()> {
        let device = Device::Cpu;
        let residual = Residual::new(sublayer_fn(|x: &Tensor| x.affine(2.0, 0.0)));
        let input = Tensor::from_slice(&[1.0f32, -2.0, 0.5, 4.0], (1, 2, 2), &device)?;
        let out = residual.forward(&input, &policy(DType::F32))?;
        assert_eq!(
            out.flatten_all()?.to_vec1::<f32>()?,
            vec![3.0, -6.0, 1.5, 12.0]
        );
        Ok(())
    }

    #[test]
    fn residual_preserves_storage_dtype() -> Result<()> {
        let device = Device::Cpu;
        let dtype = DType::F16;
        let residual = Residual::new(sublayer_fn(|x: &Tensor| Ok(x.clone())));
        let input = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?.to_dtype(dtype)?;
        let out = residual.forward(&input, &policy(dtype))?;
        assert_eq!(out.dims(), &[2, 4, 8]);
        assert_eq!(out.dtype(), dtype);
        Ok(())
    }

    #[test]
    fn residual_rejects_shape_changing_branch() -> Result<()> {
        let device = Device::Cpu;
        let residual = Residual::new(sublayer_fn(|x: &Tensor| x.narrow(2, 0, 2)));
        let input = Tensor::zeros((1, 3, 4), DType::F32, &device)?;
        assert!(residual.forward(&input, &policy(DType::F32)).is_err());
        Ok(())
    }

    #[test]
    fn prenorm_normalises_before_inner() -> Result<()> {
        let device = Device::Cpu;
        let prenorm = PreNorm::new(
            NormConfig::new(4),
            sublayer_fn(|x: &Tensor| Ok(x.clone())),
            DType::F32,
            &device,
        )?;
        let input = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0], (1, 1, 4), &device)?;
        let out = prenorm.forward(&input, &policy(DType::F32))?;
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        let mean = values.iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!(values[3] > values[0]);

        let names: Vec<String> = prenorm
            .named_parameters("block")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["block.norm.weight", "block.norm.bias"]);
        Ok(())
    }

    #[test]
    fn composition_adds_normalised_branch() -> Result<()> {
        let device = Device::Cpu;
        let block = Residual::new(PreNorm::new(
            NormConfig::new(2),
            sublayer_fn(|x: &Tensor| Ok(x.clone())),
            DType::F32,
            &device,
        )?);
        let input = Tensor::from_slice(&[0.0f32, 2.0], (1, 1, 2), &device)?;
        let out = block.forward(&input, &policy(DType::F32))?;
        let values = out.flatten_all()?.to_vec1::<f32>()?;
        // LayerNorm([0, 2]) is approximately [-1, 1].
        assert!((values[0] + 1.0).abs() < 1e-3);
        assert!((values[1] - 3.0).abs() < 1e-3);
        Ok(())
    }
}

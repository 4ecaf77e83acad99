//! Activations used by the feed-forward block.
//!
//! * **Squared ReLU** computes `relu(x)^2` elementwise and keeps the width.
//! * **GEGLU** splits the last axis in half into `(x, gate)` and returns
//!   `x * gelu(gate)`, halving the width. GELU is the erf form
//!   `0.5 * x * (1 + erf(x / sqrt(2)))`.
//!
//! Both evaluate in [`PrecisionPolicy::compute`] and cast back to storage.

use candle_core::{Error, Result, Tensor, D};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity sits between the feed-forward projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    /// `relu(x)^2` over the full expanded width.
    #[default]
    SquaredRelu,
    /// Gated GELU over a half split of the expanded width.
    Geglu,
}

impl ActivationKind {
    /// Width of the activation output given the width of its input.
    pub fn output_width(&self, input_width: usize) -> usize {
        match self {
            ActivationKind::SquaredRelu => input_width,
            ActivationKind::Geglu => input_width / 2,
        }
    }

    /// Applies the activation to `input`.
    pub fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let output = match self {
            ActivationKind::SquaredRelu => compute.relu()?.sqr()?,
            ActivationKind::Geglu => {
                let width = compute.dim(D::Minus1)?;
                if width % 2 != 0 {
                    return Err(Error::Msg(format!(
                        "geglu expects an even trailing dimension, got {width}"
                    )));
                }
                let half = width / 2;
                let last = compute.rank() - 1;
                let x = compute.narrow(last, 0, half)?;
                let gates = compute.narrow(last, half, half)?;
                x.mul(&gates.gelu_erf()?)?
            }
        };
        policy.cast_to_storage(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn squared_relu_zeroes_negatives_and_squares_positives() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.0f32, -0.5, 0.0, 1.5, 3.0], (5,), &device)?;
        let output = ActivationKind::SquaredRelu.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(output.to_vec1::<f32>()?, vec![0.0, 0.0, 0.0, 2.25, 9.0]);
        Ok(())
    }

    #[test]
    fn geglu_gates_first_half_with_gelu_of_second() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[2.0f32, -1.0, 1.0, 0.5], (1, 4), &device)?;
        let output = ActivationKind::Geglu.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(output.dims(), &[1, 2]);

        let reference = {
            let x = input.narrow(1, 0, 2)?;
            let gates = input.narrow(1, 2, 2)?;
            let term = gates.affine(1.0 / SQRT_2, 0.0)?.erf()?;
            let inner = (Tensor::ones_like(&term)? + term)?;
            let gelu = gates.affine(0.5, 0.0)?.mul(&inner)?;
            x.mul(&gelu)?
        };
        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        assert_eq!(ActivationKind::Geglu.output_width(8), 4);
        assert_eq!(ActivationKind::SquaredRelu.output_width(8), 8);
        Ok(())
    }

    #[test]
    fn geglu_rejects_odd_width() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::zeros((1, 3), DType::F32, &device)?;
        assert!(ActivationKind::Geglu
            .forward(&input, &PrecisionPolicy::default())
            .is_err());
        Ok(())
    }
}

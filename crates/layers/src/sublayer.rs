//! The uniform transform capability wrapped by residual and pre-norm blocks.

use std::sync::Arc;

use candle_core::{Result, Tensor, Var};

use crate::dtypes::PrecisionPolicy;

/// A tensor-to-tensor transform that keeps the leading `(batch, seq)` layout.
///
/// Attention, feed-forward and the wrappers themselves all implement this, so
/// any of them can be nested inside [`Residual`](crate::residual::Residual) or
/// [`PreNorm`](crate::residual::PreNorm).
pub trait Sublayer: Send + Sync {
    /// Applies the transform.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;

    /// Trainable parameters, each name prefixed with `scope`.
    fn named_parameters(&self, _scope: &str) -> Vec<(String, Var)> {
        Vec::new()
    }

    /// Switches train-only behaviour such as dropout on or off.
    fn set_training(&self, _training: bool) {}
}

impl<T: Sublayer + ?Sized> Sublayer for Arc<T> {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        (**self).forward(hidden, policy)
    }

    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        (**self).named_parameters(scope)
    }

    fn set_training(&self, training: bool) {
        (**self).set_training(training)
    }
}

/// Adapts a plain closure into a parameter-free [`Sublayer`].
pub struct FnSublayer<F> {
    f: F,
}

/// Wraps `f` so it can be nested inside residual or pre-norm blocks.
pub fn sublayer_fn<F>(f: F) -> FnSublayer<F>
where
    F: Fn(&Tensor) -> Result<Tensor> + Send + Sync,
{
    FnSublayer { f }
}

impl<F> Sublayer for FnSublayer<F>
where
    F: Fn(&Tensor) -> Result<Tensor> + Send + Sync,
{
    fn forward(&self, hidden: &Tensor, _policy: &PrecisionPolicy) -> Result<Tensor> {
        (self.f)(hidden)
    }
}

/// Joins a scope prefix and a parameter name with a dot.
pub fn scoped(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}

//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures run-time knobs such as dropout that callers
//! can tune without swapping implementations.

/// Numeric precision used inside the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Upcast scores, softmax and the value reduction to `f32`.
    #[default]
    ForceF32,
    /// Compute in whatever dtype the inputs arrive in.
    Inherit,
}

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Probability for dropout applied to attention weights.
    ///
    /// When `None` or `0.0`, dropout is disabled and the computation is
    /// deterministic. Callers pass `None` outside of training.
    pub dropout_p: Option<f32>,
    /// Working precision for the kernel.
    pub precision: Precision,
}

impl Config {
    /// Configuration with the given dropout probability.
    pub fn with_dropout(dropout_p: Option<f32>) -> Self {
        Self {
            dropout_p,
            ..Self::default()
        }
    }
}

//! Portable, exact implementations of causal attention.
//!
//! These paths favour clarity over absolute performance.

pub mod exact;

pub use exact::ExactAttention;

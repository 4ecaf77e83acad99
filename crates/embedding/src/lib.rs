//! Embedding crate
//!
//! Token lookup tables and the bucketed relative position bias added to
//! attention scores.

pub mod positional;
pub mod token;

pub use positional::*;
pub use token::*;

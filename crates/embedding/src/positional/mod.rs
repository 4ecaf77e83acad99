//! Positional information injected into attention.

pub mod relative;

pub use relative::{
    bucket_cache_counters, relative_position_bucket, reset_bucket_cache_stats,
    RelativePositionBias, RelativePositionBiasConfig,
};

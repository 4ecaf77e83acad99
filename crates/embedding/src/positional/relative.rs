//! T5-style bucketed relative position bias.
//!
//! Each query/key pair is assigned a bucket from the signed distance
//! `key_pos - query_pos`. Only distances into the past are distinguished:
//! future keys collapse onto bucket 0 (they are masked by causal attention
//! anyway). The first `num_buckets / 2` distances get one bucket each; the rest
//! share logarithmically widening buckets up to `max_distance`, after which
//! everything lands in the last bucket. A learned `(num_buckets, heads)` table
//! maps buckets to per-head scalars that are added to the attention scores.

use candle_core::{DType, Device, DeviceLocation, Error, Result, Tensor, Var};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use layers::sublayer::scoped;

const BUCKET_CACHE_CAPACITY: usize = 32;

static BUCKET_CACHE_HITS: AtomicUsize = AtomicUsize::new(0);
static BUCKET_CACHE_MISSES: AtomicUsize = AtomicUsize::new(0);

/// Return the current `(hits, misses)` counters for the shared bucket cache.
pub fn bucket_cache_counters() -> (usize, usize) {
    (
        BUCKET_CACHE_HITS.load(Ordering::Relaxed),
        BUCKET_CACHE_MISSES.load(Ordering::Relaxed),
    )
}

/// Reset the shared bucket cache counters.
pub fn reset_bucket_cache_stats() {
    BUCKET_CACHE_HITS.store(0, Ordering::Relaxed);
    BUCKET_CACHE_MISSES.store(0, Ordering::Relaxed);
}

/// Bounded least-recently-used map from geometry keys to bucket index tensors.
struct BucketCache {
    capacity: usize,
    order: Vec<String>,
    entries: HashMap<String, Tensor>,
}

impl BucketCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key_owned = self.order.remove(pos);
            self.order.push(key_owned);
        }
    }

    fn get(&mut self, key: &str) -> Option<Tensor> {
        let value = self.entries.get(key)?.clone();
        self.touch(key);
        Some(value)
    }

    fn insert(&mut self, key: String, value: Tensor) {
        if self.entries.insert(key.clone(), value).is_some() {
            self.touch(&key);
            return;
        }
        if self.entries.len() > self.capacity && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
        self.order.push(key);
    }
}

fn global_bucket_cache() -> &'static Mutex<BucketCache> {
    static CACHE: OnceLock<Mutex<BucketCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(BucketCache::new(BUCKET_CACHE_CAPACITY)))
}

fn bucket_cache_key(
    q_len: usize,
    k_len: usize,
    num_buckets: usize,
    max_distance: usize,
    device: &Device,
) -> String {
    let device_id = match device.location() {
        DeviceLocation::Cpu => "cpu".to_owned(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal{gpu_id}"),
    };
    format!("q={q_len};k={k_len};nb={num_buckets};md={max_distance};dev={device_id}")
}

/// Maps a signed relative position (`key - query`) to a bucket index.
///
/// The logarithmic branch is evaluated in `f32` and truncated, then clamped to
/// `num_buckets - 1`. Callers must uphold `num_buckets >= 2` and
/// `max_distance > num_buckets / 2`, which [`RelativePositionBiasConfig::validate`]
/// enforces.
pub fn relative_position_bucket(
    relative_position: i64,
    num_buckets: usize,
    max_distance: usize,
) -> usize {
    let n = (-relative_position).max(0) as usize;
    let max_exact = num_buckets / 2;
    if n < max_exact {
        return n;
    }
    let ratio = (n as f32 / max_exact as f32).ln() / (max_distance as f32 / max_exact as f32).ln();
    let large = max_exact + (ratio * (num_buckets - max_exact) as f32) as usize;
    large.min(num_buckets - 1)
}

/// Configuration for [`RelativePositionBias`].
#[derive(Debug, Clone, PartialEq)]
pub struct RelativePositionBiasConfig {
    /// Number of distinct buckets; must be even.
    pub num_buckets: usize,
    /// Distance beyond which all positions share the last bucket.
    pub max_distance: usize,
    /// One bias value per head and bucket.
    pub heads: usize,
    /// Multiplier applied to the looked-up bias.
    pub scale: f64,
}

impl RelativePositionBiasConfig {
    /// Default bucketing (32 buckets, distance 128) for `heads` heads.
    pub fn new(heads: usize, scale: f64) -> Self {
        Self {
            num_buckets: 32,
            max_distance: 128,
            heads,
            scale,
        }
    }

    /// Rejects geometries the bucketing formula is undefined for.
    pub fn validate(&self) -> Result<()> {
        if self.num_buckets < 2 || self.num_buckets % 2 != 0 {
            return Err(Error::Msg(format!(
                "relative_bias.num_buckets must be even and at least 2, got {}",
                self.num_buckets
            )));
        }
        if self.max_distance <= self.num_buckets / 2 {
            return Err(Error::Msg(format!(
                "relative_bias.max_distance must exceed num_buckets / 2 ({}), got {}",
                self.num_buckets / 2,
                self.max_distance
            )));
        }
        if self.heads == 0 {
            return Err(Error::Msg("relative_bias.heads must be non-zero".into()));
        }
        if !self.scale.is_finite() {
            return Err(Error::Msg(format!(
                "relative_bias.scale must be finite, got {}",
                self.scale
            )));
        }
        Ok(())
    }
}

/// Learned per-head bias indexed by relative position bucket.
#[derive(Debug, Clone)]
pub struct RelativePositionBias {
    config: RelativePositionBiasConfig,
    weight: Var,
}

impl RelativePositionBias {
    /// Builds the bias table, sampled from `N(0, 1)`.
    pub fn new(config: RelativePositionBiasConfig, dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;
        let initial = Tensor::randn(0f32, 1f32, (config.num_buckets, config.heads), device)?;
        let weight = Var::from_tensor(&initial.to_dtype(dtype)?)?;
        Ok(Self { config, weight })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &RelativePositionBiasConfig {
        &self.config
    }

    /// Bias table shaped `(num_buckets, heads)`.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Trainable table as `scope.weight`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(scoped(scope, "weight"), self.weight.clone())]
    }

    /// Scaled bias for `q_len` queries against `k_len` keys, shaped
    /// `(1, heads, q_len, k_len)`.
    pub fn bias(&self, q_len: usize, k_len: usize, device: &Device) -> Result<Tensor> {
        let buckets = self.bucket_indices(q_len, k_len, device)?;
        let values = self.weight.as_tensor().index_select(&buckets, 0)?;
        values
            .reshape((q_len, k_len, self.config.heads))?
            .permute((2, 0, 1))?
            .unsqueeze(0)?
            .affine(self.config.scale, 0.0)
    }

    /// Adds the bias to scores shaped `(heads, i, j)` or `(batch, heads, i, j)`.
    pub fn forward(&self, scores: &Tensor) -> Result<Tensor> {
        let dims = scores.dims();
        let rank = dims.len();
        if !(rank == 3 || rank == 4) || dims[rank - 3] != self.config.heads {
            return Err(Error::Msg(format!(
                "relative_bias.scores expected (.., {}, i, j), got {:?}",
                self.config.heads, dims
            )));
        }
        let (q_len, k_len) = (dims[rank - 2], dims[rank - 1]);
        let mut bias = self
            .bias(q_len, k_len, scores.device())?
            .to_dtype(scores.dtype())?;
        if rank == 3 {
            bias = bias.squeeze(0)?;
        }
        scores.broadcast_add(&bias)
    }

    fn bucket_indices(&self, q_len: usize, k_len: usize, device: &Device) -> Result<Tensor> {
        let RelativePositionBiasConfig {
            num_buckets,
            max_distance,
            ..
        } = self.config;
        let key = bucket_cache_key(q_len, k_len, num_buckets, max_distance, device);
        let cache = global_bucket_cache();
        {
            let mut guard = cache
                .lock()
                .map_err(|_| Error::Msg("relative bias bucket cache poisoned".into()))?;
            if let Some(indices) = guard.get(&key) {
                BUCKET_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
                log::debug!("relative bias bucket cache hit: {}", key);
                return Ok(indices);
            }
        }
        BUCKET_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
        log::debug!("relative bias bucket cache miss: {}", key);

        let mut data = Vec::with_capacity(q_len * k_len);
        for q in 0..q_len {
            for k in 0..k_len {
                let relative = k as i64 - q as i64;
                data.push(relative_position_bucket(relative, num_buckets, max_distance) as u32);
            }
        }
        let indices = Tensor::from_vec(data, q_len * k_len, device)?;

        let mut guard = cache
            .lock()
            .map_err(|_| Error::Msg("relative bias bucket cache poisoned".into()))?;
        guard.insert(key, indices.clone());
        Ok(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_evicts_least_recently_used() -> Result<()> {
        let device = Device::Cpu;
        let mut cache = BucketCache::new(2);
        let value = Tensor::zeros(1, DType::U32, &device)?;
        cache.insert("a".into(), value.clone());
        cache.insert("b".into(), value.clone());
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), value);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.entries.len(), 2);
        Ok(())
    }

    #[test]
    fn large_distances_follow_log_spacing() {
        // max_exact = 16; n = 32 is one doubling of the 8x range to 128.
        assert_eq!(relative_position_bucket(-16, 32, 128), 16);
        assert_eq!(relative_position_bucket(-32, 32, 128), 21);
        assert_eq!(relative_position_bucket(-127, 32, 128), 31);
    }
}

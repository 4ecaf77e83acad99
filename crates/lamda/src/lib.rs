//! LaMDA-style decoder-only language model.
//!
//! Token ids are embedded, passed through `depth` pre-norm decoder blocks of
//! multi-query self-attention and a feed-forward network, normalised and
//! projected to vocabulary logits. Projections can be converted to int8 at
//! construction and attention/feed-forward weights can be shared across depth.

pub mod block;
pub mod config;
pub mod error;
pub mod model;
pub mod self_attention;
pub mod transformer;

pub use block::DecoderBlock;
pub use config::{FeedForwardActivation, LamdaConfig, LayerSharing, ParameterDType};
pub use error::{LamdaError, Result};
pub use model::Lamda;
pub use self_attention::SelfAttention;
pub use transformer::Transformer;

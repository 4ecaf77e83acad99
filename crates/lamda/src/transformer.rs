use std::sync::Arc;

use candle_core::{Device, Result, Tensor, Var};
use layers::{
    dtypes::PrecisionPolicy,
    linear::LinearInit,
    mlp::{FeedForward, FeedForwardConfig},
    sublayer::{scoped, Sublayer},
};

use crate::{
    block::DecoderBlock,
    config::{LamdaConfig, LayerSharing},
    self_attention::SelfAttention,
};

/// Stack of `depth` decoder blocks.
#[derive(Debug)]
pub struct Transformer {
    blocks: Vec<DecoderBlock>,
    sharing: LayerSharing,
}

impl Transformer {
    /// Builds the stack. Projections are quantized before the sublayers are
    /// placed, so shared and independent stacks quantize identically.
    pub fn new(config: &LamdaConfig, device: &Device) -> Result<Self> {
        let mut blocks = Vec::with_capacity(config.depth);
        match config.layer_sharing {
            LayerSharing::Independent => {
                for index in 0..config.depth {
                    let (attention, feed_forward) = build_sublayers(config, index, device)?;
                    blocks.push(DecoderBlock::new(attention, feed_forward, config, device)?);
                }
            }
            LayerSharing::Shared => {
                let (attention, feed_forward) = build_sublayers(config, 0, device)?;
                for _ in 0..config.depth {
                    blocks.push(DecoderBlock::new(
                        Arc::clone(&attention),
                        Arc::clone(&feed_forward),
                        config,
                        device,
                    )?);
                }
            }
        }
        Ok(Self {
            blocks,
            sharing: config.layer_sharing,
        })
    }

    /// Decoder blocks in application order.
    pub fn blocks(&self) -> &[DecoderBlock] {
        &self.blocks
    }

    /// How sublayers are distributed across depth.
    pub fn sharing(&self) -> LayerSharing {
        self.sharing
    }
}

fn build_sublayers(
    config: &LamdaConfig,
    index: usize,
    device: &Device,
) -> Result<(Arc<SelfAttention>, Arc<FeedForward>)> {
    let dtype = config.parameter_dtype();
    let mut attention = SelfAttention::new(config, device)?;
    let mut feed_forward = FeedForward::new(
        FeedForwardConfig {
            hidden_size: config.dim,
            mult: config.ff_mult,
            activation: config.ff_activation.into(),
            dropout_p: config.dropout_p(),
        },
        &LinearInit::default(),
        index as u64,
        device,
        dtype,
    )?;
    if config.quantize_transformer {
        attention = attention.quantize()?;
        feed_forward = feed_forward.quantize()?;
    }
    Ok((Arc::new(attention), Arc::new(feed_forward)))
}

impl Sublayer for Transformer {
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.blocks
            .iter()
            .try_fold(hidden.clone(), |hidden, block| block.forward(&hidden, policy))
    }

    /// Parameters per depth; with [`LayerSharing::Shared`] the same tensors
    /// appear under several names.
    fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(index, block)| block.named_parameters(&scoped(scope, &index.to_string())))
            .collect()
    }

    fn set_training(&self, training: bool) {
        for block in &self.blocks {
            block.set_training(training);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(sharing: LayerSharing) -> LamdaConfig {
        LamdaConfig {
            num_tokens: 100,
            dim: 32,
            depth: 3,
            dim_head: 8,
            heads: 4,
            layer_sharing: sharing,
            ..LamdaConfig::default()
        }
    }

    #[test]
    fn shared_stack_reuses_one_instance() -> Result<()> {
        let transformer = Transformer::new(&config(LayerSharing::Shared), &Device::Cpu)?;
        let blocks = transformer.blocks();
        assert_eq!(blocks.len(), 3);
        for block in &blocks[1..] {
            assert!(Arc::ptr_eq(block.attention(), blocks[0].attention()));
            assert!(Arc::ptr_eq(block.feed_forward(), blocks[0].feed_forward()));
        }
        Ok(())
    }

    #[test]
    fn independent_stack_owns_separate_instances() -> Result<()> {
        let transformer = Transformer::new(&config(LayerSharing::Independent), &Device::Cpu)?;
        let blocks = transformer.blocks();
        assert!(!Arc::ptr_eq(blocks[0].attention(), blocks[1].attention()));
        assert!(!Arc::ptr_eq(blocks[1].feed_forward(), blocks[2].feed_forward()));
        Ok(())
    }

    #[test]
    fn quantized_stack_is_quantized_at_every_depth() -> Result<()> {
        let mut cfg = config(LayerSharing::Independent);
        cfg.quantize_transformer = true;
        let transformer = Transformer::new(&cfg, &Device::Cpu)?;
        for block in transformer.blocks() {
            assert!(block.attention().is_quantized());
            assert!(block.feed_forward().is_quantized());
        }
        Ok(())
    }

    #[test]
    fn parameter_names_are_scoped_by_depth() -> Result<()> {
        let transformer = Transformer::new(&config(LayerSharing::Independent), &Device::Cpu)?;
        let names: Vec<String> = transformer
            .named_parameters("layers")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert!(names.contains(&"layers.0.attention.norm.weight".to_string()));
        assert!(names.contains(&"layers.2.attention.to_kv.weight".to_string()));
        assert!(names.contains(&"layers.1.feed_forward.project_out.bias".to_string()));
        assert!(names.contains(&"layers.1.attention.rel_pos_bias.weight".to_string()));
        Ok(())
    }
}

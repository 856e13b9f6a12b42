//! Echo cancellation capability shared by the RLS and neural cancellers.
//!
//! A processor holds exactly one canceller, picked at construction from
//! [`CancellerConfig`].

use crate::config::{AecConfig, CancellerConfig};
use crate::frame_adapter::BlockPair;
use crate::neural::NeuralMaskCanceller;
use crate::rls::RlsCanceller;
use anyhow::Result;

/// One adaptive echo canceller driven hop by hop.
pub trait AdaptiveCanceller: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Cancels echo for one hop.
    ///
    /// # Arguments
    /// * `block` - The aligned mic/reference hop and windows (i16 scale)
    /// * `output` - Receives `block_shift` cleaned samples (i16 scale)
    ///
    /// # Returns
    /// `true` if the canceller processed the block, `false` if it fell back to
    /// passing the microphone through
    fn process_block(&mut self, block: &BlockPair<'_>, output: &mut [f32]) -> bool;

    /// Delay in samples between a hop entering and its cleaned version leaving.
    fn latency_samples(&self) -> usize;

    /// Returns to the freshly constructed state.
    fn reset(&mut self);
}

/// Builds the canceller selected by `config`.
pub fn build_canceller(config: &AecConfig) -> Result<Box<dyn AdaptiveCanceller>> {
    match &config.canceller {
        CancellerConfig::Rls(rls) => Ok(Box::new(RlsCanceller::new(rls)?)),
        CancellerConfig::Neural(neural) => Ok(Box::new(NeuralMaskCanceller::from_config(
            config.block_len,
            config.block_shift,
            neural,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NeuralConfig, RlsConfig};

    #[test]
    fn test_builds_rls_from_config() {
        let config = AecConfig::rls(RlsConfig {
            taps: 16,
            ..Default::default()
        });
        let canceller = build_canceller(&config).unwrap();
        assert_eq!(canceller.name(), "rls");
        assert_eq!(canceller.latency_samples(), 0);
    }

    #[test]
    fn test_neural_without_models_is_a_config_error() {
        let config = AecConfig::neural(NeuralConfig::default());
        assert!(
            build_canceller(&config).is_err(),
            "neural canceller needs a model directory"
        );
    }
}

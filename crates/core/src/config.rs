//! Construction-time configuration for the echo cancellation pipeline.
//!
//! Everything here is fixed once a [`StreamingAecProcessor`](crate::StreamingAecProcessor)
//! is built. Loading from disk is left to the host; any serde format works.

use crate::constants::{
    ms_to_samples, BLOCK_LEN, BLOCK_SHIFT, CAPTURE_RATE, MAX_DELAY_MS, PLAYBACK_RATE,
    RESIDUAL_KEEP_MS, SPEECH_ENERGY_THRESHOLD,
};
use crate::model::ModelVariant;
use crate::resample::ResampleQuality;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AecConfig {
    #[serde(default = "default_block_len")]
    pub block_len: usize,
    #[serde(default = "default_block_shift")]
    pub block_shift: usize,
    #[serde(default = "default_capture_rate")]
    pub capture_rate: u32,
    #[serde(default = "default_playback_rate")]
    pub playback_rate: u32,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u32,
    #[serde(default = "default_residual_keep_ms")]
    pub residual_keep_ms: u32,
    #[serde(default)]
    pub resample: ResampleQuality,
    #[serde(default = "default_speech_energy_threshold")]
    pub speech_energy_threshold: f32,
    #[serde(default)]
    pub canceller: CancellerConfig,
}

fn default_block_len() -> usize {
    BLOCK_LEN
}

fn default_block_shift() -> usize {
    BLOCK_SHIFT
}

fn default_capture_rate() -> u32 {
    CAPTURE_RATE
}

fn default_playback_rate() -> u32 {
    PLAYBACK_RATE
}

fn default_max_delay_ms() -> u32 {
    MAX_DELAY_MS
}

fn default_residual_keep_ms() -> u32 {
    RESIDUAL_KEEP_MS
}

fn default_speech_energy_threshold() -> f32 {
    SPEECH_ENERGY_THRESHOLD
}

impl Default for AecConfig {
    fn default() -> Self {
        Self {
            block_len: BLOCK_LEN,
            block_shift: BLOCK_SHIFT,
            capture_rate: CAPTURE_RATE,
            playback_rate: PLAYBACK_RATE,
            max_delay_ms: MAX_DELAY_MS,
            residual_keep_ms: RESIDUAL_KEEP_MS,
            resample: ResampleQuality::default(),
            speech_energy_threshold: SPEECH_ENERGY_THRESHOLD,
            canceller: CancellerConfig::default(),
        }
    }
}

impl AecConfig {
    /// Default geometry with the RLS canceller.
    pub fn rls(rls: RlsConfig) -> Self {
        Self {
            canceller: CancellerConfig::Rls(rls),
            ..Self::default()
        }
    }

    /// Default geometry with the neural canceller.
    pub fn neural(neural: NeuralConfig) -> Self {
        Self {
            canceller: CancellerConfig::Neural(neural),
            ..Self::default()
        }
    }

    /// Bound of the reference delay buffer in capture-rate samples.
    pub fn max_delay_samples(&self) -> usize {
        ms_to_samples(self.max_delay_ms, self.capture_rate)
    }

    /// Reference tail kept after playback finishes, in capture-rate samples.
    pub fn residual_keep_samples(&self) -> usize {
        ms_to_samples(self.residual_keep_ms, self.capture_rate)
    }

    /// Checks every invariant the processing path relies on.
    pub fn validate(&self) -> Result<()> {
        if self.block_shift == 0 {
            bail!("block_shift must be positive");
        }
        if self.block_len < self.block_shift {
            bail!(
                "block_len ({}) must be at least block_shift ({})",
                self.block_len,
                self.block_shift
            );
        }
        if self.block_len % 2 != 0 {
            bail!("block_len must be even, got {}", self.block_len);
        }
        if self.capture_rate == 0 || self.playback_rate == 0 {
            bail!(
                "sample rates must be positive (capture={}, playback={})",
                self.capture_rate,
                self.playback_rate
            );
        }
        if self.max_delay_samples() == 0 {
            bail!("max_delay_ms of {} holds no samples", self.max_delay_ms);
        }
        if self.residual_keep_ms > self.max_delay_ms {
            bail!(
                "residual_keep_ms ({}) exceeds max_delay_ms ({})",
                self.residual_keep_ms,
                self.max_delay_ms
            );
        }
        if !(self.speech_energy_threshold >= 0.0) {
            bail!("speech_energy_threshold must be non-negative");
        }
        match &self.canceller {
            CancellerConfig::Rls(rls) => rls.validate(),
            CancellerConfig::Neural(_) => Ok(()),
        }
    }
}

/// Which adaptive canceller a processor runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CancellerConfig {
    Rls(RlsConfig),
    Neural(NeuralConfig),
}

impl Default for CancellerConfig {
    fn default() -> Self {
        CancellerConfig::Rls(RlsConfig::default())
    }
}

/// Recursive least squares filter parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlsConfig {
    /// Filter length (256 taps = 16ms at 16kHz)
    #[serde(default = "default_taps")]
    pub taps: usize,
    /// Lambda, 0.95-0.99; higher is more stable
    #[serde(default = "default_forgetting_factor")]
    pub forgetting_factor: f64,
    /// P starts at I / reg_param
    #[serde(default = "default_reg_param")]
    pub reg_param: f64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Geigel window length in samples
    #[serde(default = "default_double_talk_window")]
    pub double_talk_window: usize,
    /// Mic must exceed this multiple of the peak reference to count as double-talk
    #[serde(default = "default_double_talk_ratio")]
    pub double_talk_ratio: f64,
}

fn default_taps() -> usize {
    256
}

fn default_forgetting_factor() -> f64 {
    0.98
}

fn default_reg_param() -> f64 {
    1.0
}

fn default_epsilon() -> f64 {
    1e-10
}

fn default_double_talk_window() -> usize {
    128
}

fn default_double_talk_ratio() -> f64 {
    2.0
}

impl Default for RlsConfig {
    fn default() -> Self {
        Self {
            taps: default_taps(),
            forgetting_factor: default_forgetting_factor(),
            reg_param: default_reg_param(),
            epsilon: default_epsilon(),
            double_talk_window: default_double_talk_window(),
            double_talk_ratio: default_double_talk_ratio(),
        }
    }
}

impl RlsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.taps == 0 {
            bail!("RLS filter needs at least one tap");
        }
        if !(self.forgetting_factor > 0.0 && self.forgetting_factor <= 1.0) {
            bail!(
                "forgetting_factor must lie in (0, 1], got {}",
                self.forgetting_factor
            );
        }
        if !(self.reg_param > 0.0) {
            bail!("reg_param must be positive, got {}", self.reg_param);
        }
        if !(self.epsilon >= 0.0) {
            bail!("epsilon must be non-negative, got {}", self.epsilon);
        }
        if self.double_talk_window == 0 {
            bail!("double_talk_window must be positive");
        }
        if !(self.double_talk_ratio > 0.0) {
            bail!(
                "double_talk_ratio must be positive, got {}",
                self.double_talk_ratio
            );
        }
        Ok(())
    }
}

/// Neural canceller parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NeuralConfig {
    #[serde(default)]
    pub variant: ModelVariant,
    /// Directory holding `dtln_aec_{units}_1.onnx` and `dtln_aec_{units}_2.onnx`
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AecConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_delay_samples(), 8000);
        assert_eq!(config.residual_keep_samples(), 2048);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let mut config = AecConfig::default();
        config.block_shift = 0;
        assert!(config.validate().is_err(), "zero shift must be rejected");

        let mut config = AecConfig::default();
        config.block_len = 64;
        config.block_shift = 128;
        assert!(config.validate().is_err(), "shift longer than block");

        let mut config = AecConfig::default();
        config.block_len = 511;
        assert!(config.validate().is_err(), "odd block length");

        let mut config = AecConfig::default();
        config.capture_rate = 0;
        assert!(config.validate().is_err(), "zero capture rate");
    }

    #[test]
    fn test_rejects_bad_rls_parameters() {
        let bad = [
            RlsConfig { taps: 0, ..Default::default() },
            RlsConfig { forgetting_factor: 0.0, ..Default::default() },
            RlsConfig { forgetting_factor: 1.5, ..Default::default() },
            RlsConfig { reg_param: 0.0, ..Default::default() },
            RlsConfig { double_talk_window: 0, ..Default::default() },
            RlsConfig { double_talk_ratio: -1.0, ..Default::default() },
        ];
        for rls in bad {
            assert!(
                AecConfig::rls(rls.clone()).validate().is_err(),
                "expected rejection for {:?}",
                rls
            );
        }
    }

    #[test]
    fn test_serde_fills_defaults() {
        let config: AecConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AecConfig::default());

        let config: AecConfig =
            serde_json::from_str(r#"{"canceller": {"kind": "rls", "taps": 64}}"#).unwrap();
        match config.canceller {
            CancellerConfig::Rls(rls) => {
                assert_eq!(rls.taps, 64);
                assert_eq!(rls.forgetting_factor, 0.98);
            }
            other => panic!("expected rls, got {:?}", other),
        }
    }

    #[test]
    fn test_serde_neural_variant() {
        let config: AecConfig = serde_json::from_str(
            r#"{"block_shift": 128, "canceller": {"kind": "neural", "variant": "large"}}"#,
        )
        .unwrap();
        assert_eq!(
            config.canceller,
            CancellerConfig::Neural(NeuralConfig {
                variant: ModelVariant::Large,
                model_dir: None,
            })
        );
        let json = serde_json::to_string(&config).unwrap();
        let back: AecConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use talkback_core::AecConfig;

/// Host configuration: devices, chunking and the pipeline settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_device")]
    pub last_input: String,
    #[serde(default = "default_device")]
    pub last_output: String,
    /// Capture chunk handed to the processor per call
    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u32,
    /// Log suppression statistics while the far end talks
    #[serde(default)]
    pub report_stats: bool,
    #[serde(default)]
    pub aec: AecConfig,
}

fn default_device() -> String {
    "default".to_string()
}

fn default_chunk_ms() -> u32 {
    30 // 480 samples at 16 kHz
}

/// Longest capture chunk the host accepts.
const MAX_CHUNK_MS: u32 = 1000;

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            last_input: default_device(),
            last_output: default_device(),
            chunk_ms: default_chunk_ms(),
            report_stats: false,
            aec: AecConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from the user config directory, or returns default if not found.
    pub fn load() -> Self {
        if let Some(path) = config_path() {
            match Self::load_from(&path) {
                Ok(cfg) => return cfg,
                Err(e) if path.exists() => {
                    log::warn!("Ignoring unreadable config {}: {:#}", path.display(), e)
                }
                Err(_) => {}
            }
        }
        Self::default()
    }

    /// Loads configuration from an explicit JSON file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the host settings and the pipeline configuration.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_ms == 0 || self.chunk_ms > MAX_CHUNK_MS {
            bail!(
                "chunk_ms must lie in 1..={}, got {}",
                MAX_CHUNK_MS,
                self.chunk_ms
            );
        }
        if self.chunk_ms > self.aec.max_delay_ms {
            bail!(
                "chunk_ms ({}) exceeds the reference buffer ({} ms)",
                self.chunk_ms,
                self.aec.max_delay_ms
            );
        }
        self.aec.validate()
    }

    /// Saves configuration to disk in JSON format.
    pub fn save(&self) -> Result<PathBuf> {
        let path = config_path().context("Could not determine config directory")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Capture chunk length in samples at the capture rate.
    pub fn chunk_samples(&self) -> usize {
        talkback_core::constants::ms_to_samples(self.chunk_ms, self.aec.capture_rate).max(1)
    }
}

fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "talkback", "talkback").map(|dirs| dirs.config_dir().join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use talkback_core::config::CancellerConfig;

    #[test]
    fn test_default_config_values() {
        let config = AppConfig::default();
        assert_eq!(config.last_input, "default");
        assert_eq!(config.chunk_samples(), 480);
        assert!(!config.report_stats);
        assert!(matches!(config.aec.canceller, CancellerConfig::Rls(_)));
    }

    #[test]
    fn test_config_deserialization_with_defaults() {
        // Minimal JSON - should fill in defaults
        let json = r#"{"last_input":"Mic","aec":{"max_delay_ms":250}}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.last_input, "Mic");
        assert_eq!(config.last_output, "default");
        assert_eq!(config.chunk_ms, 30);
        assert_eq!(config.aec.max_delay_samples(), 4000);
        assert_eq!(config.aec.block_len, 512); // Default
    }

    #[test]
    fn test_config_roundtrip_through_file() {
        let mut original = AppConfig::default();
        original.chunk_ms = 20;
        original.report_stats = true;

        let path = std::env::temp_dir().join(format!("talkback-config-{}.json", std::process::id()));
        fs::write(&path, serde_json::to_string_pretty(&original).unwrap()).unwrap();
        let restored = AppConfig::load_from(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(original, restored);
        assert_eq!(restored.chunk_samples(), 320);
    }

    #[test]
    fn test_chunk_ms_bounds() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.chunk_ms = 0;
        assert!(config.validate().is_err(), "empty chunks are rejected");

        config.chunk_ms = 250;
        assert!(config.validate().is_ok(), "long chunks within the delay bound are fine");
        assert_eq!(config.chunk_samples(), 4000);

        config.chunk_ms = 600;
        assert!(config.validate().is_err(), "chunk longer than the reference buffer");

        config.aec.max_delay_ms = 2000;
        config.chunk_ms = 1500;
        assert!(config.validate().is_err(), "chunk above the host limit");
    }

    #[test]
    fn test_zero_chunk_rejected_at_load() {
        let path = std::env::temp_dir().join(format!("talkback-chunk-{}.json", std::process::id()));
        fs::write(&path, r#"{"chunk_ms":0}"#).unwrap();
        let result = AppConfig::load_from(&path);
        let _ = fs::remove_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_pipeline_config_rejected() {
        let path = std::env::temp_dir().join(format!("talkback-bad-{}.json", std::process::id()));
        fs::write(&path, r#"{"aec":{"block_shift":0}}"#).unwrap();
        let result = AppConfig::load_from(&path);
        let _ = fs::remove_file(&path);
        assert!(result.is_err(), "zero hop must be rejected at load time");
    }
}

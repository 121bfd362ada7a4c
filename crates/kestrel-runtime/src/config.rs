//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use kestrel_core::constants::MAX_CONCURRENT_CONVERSATIONS;
use kestrel_core::{DeviceKind, EngineError, Result};
use kestrel_platform::DeviceConfig;

/// Decode-loop limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Upper bound on tokens produced by one `generate` call.
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    /// Token that ends generation when selected.
    #[serde(default)]
    pub eos_token: Option<u32>,
}

fn default_max_new_tokens() -> usize {
    32
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { max_new_tokens: default_max_new_tokens(), eos_token: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Devices to activate, in priority order.
    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceConfig>,

    /// Cap on live conversations.
    #[serde(default = "default_max_conversations")]
    pub max_concurrent_conversations: usize,

    /// Time every layer dispatch and log it at debug level.
    #[serde(default)]
    pub enable_profiling: bool,

    #[serde(default)]
    pub generation: GenerationConfig,
}

fn default_devices() -> Vec<DeviceConfig> {
    DeviceKind::COMPUTE.into_iter().map(DeviceConfig::new).collect()
}

fn default_max_conversations() -> usize {
    MAX_CONCURRENT_CONVERSATIONS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            max_concurrent_conversations: default_max_conversations(),
            enable_profiling: false,
            generation: GenerationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Request only the CPU.
    pub fn cpu_only() -> Self {
        Self { devices: vec![DeviceConfig::new(DeviceKind::Cpu)], ..Self::default() }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| EngineError::io(format!("read config {}", path.display()), e))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_conversations == 0 {
            return Err(EngineError::InvalidConfig("max_concurrent_conversations must be at least 1".into()));
        }
        if self.generation.max_new_tokens == 0 {
            return Err(EngineError::InvalidConfig("generation.max_new_tokens must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::ErrorKind;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.devices.len(), 3);
        assert!(cfg.devices.iter().all(|d| d.enabled && d.memory_budget_mb == 0));
        assert_eq!(cfg.max_concurrent_conversations, 8);
        assert!(!cfg.enable_profiling);
        assert_eq!(cfg.generation.max_new_tokens, 32);
        assert_eq!(cfg.generation.eos_token, None);
    }

    #[test]
    fn test_empty_json_is_default() {
        assert_eq!(EngineConfig::from_json_str("{}").unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_parse_full() {
        let cfg = EngineConfig::from_json_str(
            r#"{
                "devices": [
                    {"type": "gpu", "memory_budget_mb": 256},
                    {"type": "cpu"},
                    {"type": "npu", "enabled": false}
                ],
                "max_concurrent_conversations": 2,
                "enable_profiling": true,
                "generation": {"max_new_tokens": 4, "eos_token": 2}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.devices[0].kind, DeviceKind::Gpu);
        assert_eq!(cfg.devices[0].budget_bytes(), Some(256 * 1024 * 1024));
        assert!(!cfg.devices[2].enabled);
        assert_eq!(cfg.max_concurrent_conversations, 2);
        assert!(cfg.enable_profiling);
        assert_eq!(cfg.generation, GenerationConfig { max_new_tokens: 4, eos_token: Some(2) });
    }

    #[test]
    fn test_invalid_values() {
        for json in [r#"{"max_concurrent_conversations": 0}"#, r#"{"devices": [{"type": "tpu"}]}"#, "not json"] {
            let err = EngineConfig::from_json_str(json).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Initialization, "{json}");
        }
    }

    #[test]
    fn test_serialize_roundtrip_and_file() {
        let cfg = EngineConfig::cpu_only();
        let json = serde_json::to_string_pretty(&cfg).unwrap();
        assert!(json.contains("\"type\": \"cpu\""));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, json).unwrap();
        assert_eq!(EngineConfig::from_json_file(&path).unwrap(), cfg);
    }
}

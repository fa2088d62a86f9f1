use std::fs;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{
    DEFAULT_ATTEMPTS_PER_SLOT, DEFAULT_CLIENT_PORT, DEFAULT_CONNECT_ATTEMPTS,
    DEFAULT_CONNECT_BACKOFF_MS, DEFAULT_ELEMENTS_PER_ROUND, DEFAULT_FPR,
    DEFAULT_KEYSTREAM_BLOCK_SIZE, DEFAULT_SERVER_PORT, DEFAULT_SLOT_LENGTH, METADATA_BYTES,
};
use crate::control::ControlMode;
use crate::error::{DcNetError, Result};
use crate::scheduler::BloomParameters;

/// Prefix of environment variables that override file settings, e.g.
/// `DCNET_SLOT__ATTEMPTS_PER_SLOT=16`.
pub const ENV_PREFIX: &str = "DCNET";

/// Settings every participant of a deployment must agree on, plus where to find the servers.
///
/// # Examples
///
/// ```rust
/// use dcnet::config::DcNetConfig;
///
/// let config = DcNetConfig::from_toml_str("[slot]\nlength = 256\n").unwrap();
/// assert_eq!(config.slot.length, 256);
/// assert_eq!(config.slot.attempts_per_slot, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DcNetConfig {
    pub slot: SlotConfig,
    pub dcnet: NetworkConfig,
    pub keystream: KeystreamConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotConfig {
    pub estimated_elements_per_round: usize,
    pub fpr: f64,
    pub attempts_per_slot: usize,
    pub control: ControlMode,
    /// Slot length in bytes, header included.
    pub length: usize,
    /// Cap on the slots one element is assigned to; absent or 0 means no cap.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slots_per_element: Option<usize>,
}

impl Default for SlotConfig {
    fn default() -> Self {
        SlotConfig {
            estimated_elements_per_round: DEFAULT_ELEMENTS_PER_ROUND,
            fpr: DEFAULT_FPR,
            attempts_per_slot: DEFAULT_ATTEMPTS_PER_SLOT,
            control: ControlMode::default(),
            length: DEFAULT_SLOT_LENGTH,
            slots_per_element: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server hosts indexed by server id. Empty means every server is on localhost.
    pub servers: Vec<String>,
    pub bind_address: String,
    pub client_port: u16,
    pub server_port: u16,
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            servers: Vec::new(),
            bind_address: "0.0.0.0".to_string(),
            client_port: DEFAULT_CLIENT_PORT,
            server_port: DEFAULT_SERVER_PORT,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_backoff_ms: DEFAULT_CONNECT_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeystreamConfig {
    pub block_size: usize,
}

impl Default for KeystreamConfig {
    fn default() -> Self {
        KeystreamConfig {
            block_size: DEFAULT_KEYSTREAM_BLOCK_SIZE,
        }
    }
}

impl DcNetConfig {
    /// Loads the configuration from an optional TOML file, then `DCNET_` environment
    /// variables, and validates it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            debug!("📝 Loading config from {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: DcNetConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        let config: DcNetConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the default configuration as TOML, creating parent directories as needed.
    pub fn write_default(path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(&DcNetConfig::default())
            .map_err(|err| DcNetError::Serialization(err.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml)?;
        Ok(())
    }

    /// Rejects settings no round could run with.
    pub fn validate(&self) -> Result<()> {
        let slot = &self.slot;
        if slot.estimated_elements_per_round == 0 {
            return Err(config_error("estimated elements per round must be at least 1"));
        }
        if !(slot.fpr > 0.0 && slot.fpr < 1.0) {
            return Err(config_error(format!(
                "false positive rate must be in (0, 1), got {}",
                slot.fpr
            )));
        }
        if slot.attempts_per_slot == 0 {
            return Err(config_error("attempts per slot must be at least 1"));
        }
        if slot.control.has_control_phase() && slot.attempts_per_slot % 8 != 0 {
            return Err(config_error(format!(
                "{} control slots need attempts per slot divisible by 8, got {}",
                slot.control, slot.attempts_per_slot
            )));
        }
        if slot.length <= METADATA_BYTES || slot.length > u32::MAX as usize {
            return Err(config_error(format!(
                "slot length must exceed the {} byte header, got {}",
                METADATA_BYTES, slot.length
            )));
        }
        if self.keystream.block_size == 0 {
            return Err(config_error("keystream block size must be at least 1"));
        }
        Ok(())
    }

    /// Number of data slots every party derives for a round.
    pub fn slot_count(&self) -> usize {
        self.bloom_parameters().slots
    }

    pub fn bloom_parameters(&self) -> BloomParameters {
        BloomParameters::estimate(self.slot.estimated_elements_per_round, self.slot.fpr)
    }
}

fn config_error(msg: impl Into<String>) -> DcNetError {
    DcNetError::Configuration(msg.into())
}

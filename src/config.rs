//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with UEDINST_)
//!
//! # Example
//! ```toml
//! [application]
//! name = "UED lab"
//! log_level = "info"
//!
//! [[instruments]]
//! id = "electrometer"
//! type = "keithley6514"
//! [instruments.config]
//! address = "GPIB::15"
//!
//! [[instruments]]
//! id = "camera"
//! type = "gatan_ultrascan895"
//! [instruments.config]
//! addr = "127.0.0.1"
//! port = 42057
//! ```

use crate::error::{InstrumentError, InstrumentResult};
use crate::instruments::{GatanConfig, InstrumentKind};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/uedinst.toml";

/// Accepted log levels.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Instrument type (e.g., "keithley6514", "gatan_ultrascan895")
    pub r#type: String,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Instrument-specific configuration
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

/// Settings for a GPIB electrometer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeithleySettings {
    /// VISA address, e.g. "GPIB::15"
    pub address: String,
    /// Default time to wait for buffered acquisitions; absent waits forever
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Typed settings of one instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentSettings {
    /// Keithley 6514 settings.
    Keithley6514(KeithleySettings),
    /// Gatan Ultrascan 895 settings.
    GatanUltrascan895(GatanConfig),
}

fn default_name() -> String {
    "uedinst".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl InstrumentDefinition {
    /// Instrument kind named by `type`.
    pub fn kind(&self) -> InstrumentResult<InstrumentKind> {
        self.r#type.parse()
    }

    /// Deserialize and validate the instrument-specific settings.
    pub fn settings(&self) -> InstrumentResult<InstrumentSettings> {
        let invalid = |e: toml::de::Error| {
            InstrumentError::InvalidParameter(format!(
                "Invalid config for instrument '{}': {}",
                self.id, e
            ))
        };

        match self.kind()? {
            InstrumentKind::Keithley6514 => {
                let settings: KeithleySettings = self.config.clone().try_into().map_err(invalid)?;
                if settings.address.trim().is_empty() {
                    return Err(InstrumentError::InvalidParameter(format!(
                        "Instrument '{}' needs a GPIB address",
                        self.id
                    )));
                }
                Ok(InstrumentSettings::Keithley6514(settings))
            }
            InstrumentKind::GatanUltrascan895 => {
                let settings: GatanConfig = self.config.clone().try_into().map_err(invalid)?;
                settings.validate()?;
                Ok(InstrumentSettings::GatanUltrascan895(settings))
            }
        }
    }
}

impl Config {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables can override configuration with prefix UEDINST_
    /// Example: UEDINST_APPLICATION__LOG_LEVEL=debug
    pub fn load() -> InstrumentResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// The file must exist; it is not searched for in parent directories.
    pub fn load_from<P: AsRef<Path>>(path: P) -> InstrumentResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(InstrumentError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Configuration file not found: {}", path.display()),
            )));
        }

        let config: Config = Figment::new()
            .merge(Toml::file_exact(path))
            .merge(Env::prefixed("UEDINST_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> InstrumentResult<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(InstrumentError::InvalidParameter(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        let mut ids = std::collections::HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(&instrument.id) {
                return Err(InstrumentError::InvalidParameter(format!(
                    "Duplicate instrument ID: {}",
                    instrument.id
                )));
            }
            instrument.settings()?;
        }

        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentDefinition> {
        self.instruments
            .iter()
            .filter(|inst| inst.enabled)
            .collect()
    }

    /// Find an instrument by id.
    pub fn instrument(&self, id: &str) -> Option<&InstrumentDefinition> {
        self.instruments.iter().find(|inst| inst.id == id)
    }
}

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_yml;
use std::fs::File;
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::MeterError;
use crate::registers::{ConnectionDefaults, RegisterCatalog};
use crate::transport::{Endpoint, Parity};

/* Places searched when no config file is named */
pub const CONFIG_PATHS: [&str; 2] = ["config/energymeter.yaml", "energymeter.yaml"];

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Rtu {
        port: String,
        #[serde(default)]
        baudrate: Option<u32>,
        #[serde(default)]
        parity: Parity,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Tcp {
        host: String,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

impl ConnectionConfig {
    /// Fill everything left open with the defaults of the meter model
    pub fn endpoint(&self, defaults: &ConnectionDefaults) -> Endpoint {
        match self {
            ConnectionConfig::Rtu { port, baudrate, parity, timeout_ms } => Endpoint::Rtu {
                port: port.clone(),
                baudrate: baudrate.unwrap_or(defaults.baudrate),
                parity: *parity,
                timeout: Duration::from_millis(timeout_ms.unwrap_or(defaults.timeout_ms)),
            },
            ConnectionConfig::Tcp { host, port, timeout_ms } => Endpoint::Tcp {
                host: host.clone(),
                port: port.unwrap_or(defaults.tcp_port),
                timeout: Duration::from_millis(timeout_ms.unwrap_or(defaults.timeout_ms)),
            },
        }
    }
}

fn meter_auto_scale_default() -> bool { return true }
fn meter_fields_default() -> Vec<String> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct MeterConfig {
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub slave_id: Option<u8>,
    /* read scale registers once after connecting, only used by models which have them */
    #[serde(default="meter_auto_scale_default")]
    pub auto_scale: bool,
    /* empty means every register of the model */
    #[serde(default="meter_fields_default")]
    pub fields: Vec<String>,
    pub connection: ConnectionConfig,
}

impl MeterConfig {
    pub fn slave_id(&self, defaults: &ConnectionDefaults) -> u8 {
        self.slave_id.unwrap_or(defaults.slave_id)
    }

    pub fn endpoint(&self, defaults: &ConnectionDefaults) -> Endpoint {
        self.connection.endpoint(defaults)
    }
}

fn meters_default() -> Vec<MeterConfig> { return Vec::new() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,
    #[serde(default="meters_default")]
    pub meters: Vec<MeterConfig>,
}

impl Config {
    pub fn from_yaml(contents: &str) -> Result<Self, MeterError> {
        let config: Config = serde_yml::from_str(contents)
            .map_err(|e| MeterError::config(format!("Unable to parse config: {e}")))?;

        let mut names = std::collections::HashSet::new();
        for meter in config.meters.iter() {
            if !names.insert(meter.name.as_str()) {
                return Err(MeterError::config(format!("Meter {} is configured twice", meter.name)));
            }
        }
        return Ok(config);
    }

    pub fn load(path: &Path) -> Result<Self, MeterError> {
        let mut file = File::open(path)
            .map_err(|e| MeterError::config(format!("Unable to open config {}: {e}", path.display())))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| MeterError::config(format!("Unable to read config {}: {e}", path.display())))?;

        let mut config = Config::from_yaml(&contents)?;

        /* relative definition dirs are meant relative to the config file */
        if let Some(dir) = config.definitions_dir.as_ref() {
            if dir.is_relative() {
                if let Some(parent) = path.parent() {
                    config.definitions_dir = Some(parent.join(dir));
                }
            }
        }

        info!("Loaded config {} with {} meters", path.display(), config.meters.len());
        return Ok(config);
    }

    /// Load the first config file found in the default places
    pub fn find() -> Result<Self, MeterError> {
        for path in CONFIG_PATHS.iter() {
            let path = Path::new(path);
            if path.exists() {
                return Config::load(path);
            }
            debug!("No config at {}", path.display());
        }
        Err(MeterError::config(format!("No config found, tried {}", CONFIG_PATHS.join(" and "))))
    }

    pub fn meter(&self, name: &str) -> Result<&MeterConfig, MeterError> {
        match self.meters.iter().find(|m| m.name == name) {
            Some(m) => Ok(m),
            None => Err(MeterError::config(format!("No meter named {name} in config"))),
        }
    }

    /// Builtin register tables plus the ones from definitions_dir
    pub fn catalog(&self) -> Result<RegisterCatalog, MeterError> {
        let mut catalog = RegisterCatalog::builtin().clone();
        if let Some(dir) = self.definitions_dir.as_ref() {
            catalog.load_dir(dir)?;
        }
        Ok(catalog)
    }
}

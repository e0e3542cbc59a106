//! fieldctl configuration loading
//!
//! Optional YAML file merged with `FIELDCTL_*` environment variables, e.g.
//! `FIELDCTL_MODBUS__HOST=10.0.4.2 fieldctl modbus read holding 0`.

use anyhow::{bail, Context, Result};
use fieldlink_canbus::CanbusNetworkConfig;
use fieldlink_modbus::ModbusNetworkConfig;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FieldctlConfig {
    #[serde(default)]
    pub can: Option<CanbusNetworkConfig>,
    #[serde(default)]
    pub modbus: Option<ModbusNetworkConfig>,
}

pub fn load(path: Option<&Path>) -> Result<FieldctlConfig> {
    let mut figment = Figment::new();
    if let Some(path) = path {
        if !path.exists() {
            bail!("configuration file {} does not exist", path.display());
        }
        figment = figment.merge(Yaml::file(path));
    }
    figment = figment.merge(Env::prefixed("FIELDCTL_").split("__"));
    figment.extract().context("invalid fieldctl configuration")
}

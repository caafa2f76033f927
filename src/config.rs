use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::seatbelt::SANDBOX_EXEC;
use crate::sandbox::wasm::{DEFAULT_FUEL, DEFAULT_MODULE_PATH};

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub seatbelt: SeatbeltConfig,
    pub wasm: WasmConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SeatbeltConfig {
    /// Enforcement front end, looked up on PATH
    #[serde(default = "default_tool")]
    pub tool: String,
    /// Default per-call timeout; none when omitted
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WasmConfig {
    /// Supports ${ENV_VAR} substitution
    #[serde(default = "default_module_path")]
    pub module_path: PathBuf,
    #[serde(default = "default_fuel")]
    pub fuel: u64,
}

fn default_tool() -> String {
    SANDBOX_EXEC.to_string()
}

fn default_module_path() -> PathBuf {
    PathBuf::from(DEFAULT_MODULE_PATH)
}

fn default_fuel() -> u64 {
    DEFAULT_FUEL
}

impl Default for SeatbeltConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            timeout_secs: None,
        }
    }
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            module_path: default_module_path(),
            fuel: default_fuel(),
        }
    }
}

impl SeatbeltConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Loads `path` when given; otherwise uses defaults.
    pub fn load_or_default(path: Option<&str>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${SANDBOX_HOME}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.seatbelt.tool.trim().is_empty() {
            anyhow::bail!("seatbelt.tool must not be empty");
        }
        if self.wasm.fuel == 0 {
            anyhow::bail!("wasm.fuel must be a positive integer");
        }
        Ok(())
    }
}

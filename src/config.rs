//! On-disk configuration (§6): which `JoinEUI` prefixes this instance
//! serves, where its reference RPC transport binds, and log verbosity.

use serde::Deserialize;
use std::path::Path;

use crate::ids::Eui64;
use crate::prefix::{Eui64Prefix, PrefixMatcher};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub rpc: RpcConfig,
    pub lorawan: LorawanConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct RpcConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize)]
pub struct LorawanConfig {
    pub join_eui_prefixes: Vec<PrefixConfig>,
}

/// One `JoinEUI` prefix this instance claims, e.g. `value = "42FF000000000000"`
/// with `length_bits = 8` claims every `JoinEUI` whose top byte is `0x42`.
#[derive(Debug, Deserialize)]
pub struct PrefixConfig {
    pub value: String,
    pub length_bits: u8,
}

impl PrefixConfig {
    fn parse(&self) -> anyhow::Result<Eui64Prefix> {
        let bytes = hex::decode(&self.value).map_err(|e| anyhow::anyhow!("invalid JoinEUI prefix {:?}: {}", self.value, e))?;
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("JoinEUI prefix {:?} must be 16 hex characters", self.value))?;
        // Config text is big-endian like every other EUI printed for humans;
        // wire order (and `Eui64`'s internal storage) is little-endian.
        let mut le = array;
        le.reverse();
        Ok(Eui64Prefix::new(Eui64(le), self.length_bits))
    }
}

impl LorawanConfig {
    pub fn prefix_matcher(&self) -> anyhow::Result<PrefixMatcher> {
        let prefixes = self.join_eui_prefixes.iter().map(PrefixConfig::parse).collect::<anyhow::Result<Vec<_>>>()?;
        Ok(PrefixMatcher::new(prefixes))
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content).map_err(|e| anyhow::anyhow!("failed to parse config file: {}", e))?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc: RpcConfig {
                bind: "0.0.0.0:17801".to_string(),
            },
            lorawan: LorawanConfig { join_eui_prefixes: Vec::new() },
            logging: LoggingConfig { level: "info".to_string() },
        }
    }
}

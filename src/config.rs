//! Broker configuration
//!
//! Brokers and cores are configured from an initialization string of
//! whitespace-separated `key=value` pairs and bare flags. Unknown keys are
//! rejected. The same structure loads from a YAML file for the CLI.

use std::fs;
use std::path::Path;

use eyre::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration accepted by every broker variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Identifier of this node; a random identity is generated when unset.
    pub name: Option<String>,

    /// Minimum number of directly attached federates before this node
    /// reports init-ready.
    #[serde(rename = "min-federates")]
    pub min_federates: u32,

    /// Minimum number of child brokers before a root reports init-ready.
    #[serde(rename = "min-brokers")]
    pub min_brokers: u32,

    /// This node is the root of the federation tree.
    pub root: bool,

    /// Forward all off-node traffic through the parent even when a local
    /// route exists.
    pub gateway: bool,

    /// Transport-specific address of the parent broker.
    #[serde(rename = "broker-address")]
    pub broker_address: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: None,
            min_federates: 1,
            min_brokers: 1,
            root: false,
            gateway: false,
            broker_address: None,
        }
    }
}

impl BrokerConfig {
    /// Parse an initialization string.
    ///
    /// Recognised keys: `name`, `min_federates`, `min_brokers`, `root`,
    /// `gateway`, `broker_address`. `root` and `gateway` may appear as bare
    /// flags. Anything else is an error.
    pub fn from_init_string(init: &str) -> Result<Self> {
        let mut config = Self::default();
        for token in init.split_whitespace() {
            let token = token.trim_start_matches("--");
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };
            match key {
                "name" => config.name = Some(required(key, value)?.to_string()),
                "min_federates" => config.min_federates = parse_count(key, required(key, value)?)?,
                "min_brokers" => config.min_brokers = parse_count(key, required(key, value)?)?,
                "root" => config.root = parse_flag(key, value)?,
                "gateway" => config.gateway = parse_flag(key, value)?,
                "broker_address" => config.broker_address = Some(required(key, value)?.to_string()),
                other => bail!("unknown configuration key: {other}"),
            }
        }
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .context(format!("Failed to read config from {}", path.as_ref().display()))?;
        serde_yaml::from_str(&content).context("Failed to parse config file")
    }
}

fn required<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => bail!("configuration key {key} requires a value"),
    }
}

fn parse_count(key: &str, value: &str) -> Result<u32> {
    match value.parse::<u32>() {
        Ok(n) => Ok(n),
        Err(_) => bail!("configuration key {key} requires an unsigned integer, got {value:?}"),
    }
}

fn parse_flag(key: &str, value: Option<&str>) -> Result<bool> {
    match value {
        None | Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => bail!("configuration key {key} requires true or false, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::from_init_string("").unwrap();
        assert_eq!(config.min_federates, 1);
        assert_eq!(config.min_brokers, 1);
        assert!(!config.root);
        assert!(!config.gateway);
        assert!(config.name.is_none());
    }

    #[test]
    fn test_full_init_string() {
        let config = BrokerConfig::from_init_string(
            "name=hub min_federates=3 min_brokers=2 root gateway=false broker_address=loop://root",
        )
        .unwrap();
        assert_eq!(config.name.as_deref(), Some("hub"));
        assert_eq!(config.min_federates, 3);
        assert_eq!(config.min_brokers, 2);
        assert!(config.root);
        assert!(!config.gateway);
        assert_eq!(config.broker_address.as_deref(), Some("loop://root"));
    }

    #[test]
    fn test_dashed_keys_accepted() {
        let config = BrokerConfig::from_init_string("--name=hub --root").unwrap();
        assert_eq!(config.name.as_deref(), Some("hub"));
        assert!(config.root);
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(BrokerConfig::from_init_string("federates=2").is_err());
        assert!(BrokerConfig::from_init_string("name=a bogus").is_err());
    }

    #[test]
    fn test_malformed_values_rejected() {
        assert!(BrokerConfig::from_init_string("min_federates=many").is_err());
        assert!(BrokerConfig::from_init_string("name=").is_err());
        assert!(BrokerConfig::from_init_string("root=maybe").is_err());
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.yml");
        std::fs::write(&path, "name: hub\nmin-federates: 4\nroot: true\n").unwrap();

        let config = BrokerConfig::load(&path).unwrap();
        assert_eq!(config.name.as_deref(), Some("hub"));
        assert_eq!(config.min_federates, 4);
        assert!(config.root);
        assert_eq!(config.min_brokers, 1);
    }
}

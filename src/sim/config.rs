use std::path::PathBuf;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::*;

use crate::timeq::Cycle;

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value.clone().try_into().expect("cannot deserialize config"),
            None => {
                warn!("config section not found");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub log_level: u64,
    // Hard stop for the cycle loop; a run that reaches it is reported as unfinished.
    pub timeout: Cycle,
    pub stats_json: Option<PathBuf>,
    pub spm_dump: Option<PathBuf>,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            log_level: 0,
            timeout: 10_000_000,
            stats_json: None,
            spm_dump: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, SimConfig};

    #[test]
    fn missing_section_falls_back_to_default() {
        let config = SimConfig::from_section(None);
        assert_eq!(10_000_000, config.timeout);
        assert!(config.stats_json.is_none());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let table: toml::Table = toml::from_str("[sim]\nlog_level = 2\n").unwrap();
        let config = SimConfig::from_section(table.get("sim"));
        assert_eq!(2, config.log_level);
        assert_eq!(10_000_000, config.timeout);
    }
}

//! YAML settings for the daemon.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::retry::RetryPolicy;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of executor workers.
    pub workers: usize,
    pub inter_unit_delay_ms: u64,
    /// How often unreported jobs are swept for completion notices.
    pub sweep_interval_ms: u64,
    pub retry: RetryPolicy,
    /// Printer references mapped to `host:port` socket addresses.
    pub printers: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 2,
            inter_unit_delay_ms: 100,
            sweep_interval_ms: 5000,
            retry: RetryPolicy::default(),
            printers: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;

        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn inter_unit_delay(&self) -> Duration {
        Duration::from_millis(self.inter_unit_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Parses the printer map. Addresses must be literal `ip:port` pairs.
    pub fn printer_addrs(
        &self,
    ) -> Result<HashMap<String, SocketAddr>, ConfigError> {
        self.printers
            .iter()
            .map(|(name, addr)| match addr.parse() {
                Ok(sa) => Ok((name.clone(), sa)),
                Err(_) => Err(ConfigError::InvalidPrinterAddr {
                    name: name.clone(),
                    addr: addr.clone(),
                }),
            })
            .collect()
    }
}

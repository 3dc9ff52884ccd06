//! Configuration management.
//!
//! Settings are loaded from TOML via the `config` crate. The exporter side
//! describes the driver tree to export (`[export]`); the client side carries
//! the controller endpoint, access token and lease policy. Channel security
//! (TLS, token verification) is a collaborator concern: the endpoint and
//! token are handed to the channel factory as-is.

use crate::error::BenchError;
use config::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub log_level: String,
    /// Identity this process presents to the controller.
    pub client_id: String,
    pub controller: ControllerSettings,
    pub lease: LeaseSettings,
    /// Driver tree to export: name -> driver instance description.
    #[serde(default)]
    pub export: HashMap<String, DriverInstance>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerSettings {
    pub endpoint: String,
    pub token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LeaseSettings {
    /// "fail" returns NoMatch immediately; "wait" leaves the request pending
    /// until an exporter frees up or the acquire timeout fires.
    #[serde(default = "default_no_match_policy")]
    pub no_match_policy: String,
    #[serde(with = "humantime_serde", default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_lease_ttl")]
    pub ttl: Duration,
}

fn default_no_match_policy() -> String {
    "fail".to_string()
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(1800)
}

/// One driver instance in the exported tree. The capability names a factory
/// known to this process; `config` is passed to it verbatim.
#[derive(Debug, Deserialize, Clone)]
pub struct DriverInstance {
    pub capability: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub config: HashMap<String, toml::Value>,
    #[serde(default)]
    pub children: HashMap<String, DriverInstance>,
}

impl Settings {
    pub fn new(config_name: Option<&str>) -> Result<Self, BenchError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()
            .map_err(BenchError::Config)?;

        s.try_deserialize().map_err(BenchError::Config)
    }

    /// Load settings from an explicit file path.
    pub fn from_file(path: &std::path::Path) -> Result<Self, BenchError> {
        let s = Config::builder()
            .add_source(config::File::from(path))
            .build()
            .map_err(BenchError::Config)?;

        s.try_deserialize().map_err(BenchError::Config)
    }
}

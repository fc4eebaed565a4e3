//! Layered settings: defaults, then an optional TOML file, then
//! `VEILNET__*` environment variables, then command-line overrides.
//!
//! Nested keys use a double underscore, e.g. `VEILNET__NODE__ROUTER__HOP_COUNT=3`.

use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use veilnet_routing::NodeConfig;

const ENV_PREFIX: &str = "VEILNET";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub node: NodeConfig,
    /// Actors allowed to change blocked destinations
    #[serde(default)]
    pub admins: Vec<String>,
}

/// Values given on the command line win over every other layer.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub role: Option<String>,
    pub node_id: Option<u64>,
    pub port: Option<u16>,
    pub advertise_host: Option<String>,
}

impl AppConfig {
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<Self> {
        let mut builder = Config::builder().set_default("node.role", "entry")?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        if let Some(role) = &overrides.role {
            builder = builder.set_override("node.role", role.as_str())?;
        }
        if let Some(node_id) = overrides.node_id {
            builder = builder.set_override("node.node_id", node_id)?;
        }
        if let Some(port) = overrides.port {
            builder = builder.set_override("node.port", u64::from(port))?;
        }
        if let Some(host) = &overrides.advertise_host {
            builder = builder.set_override("node.advertise_host", host.as_str())?;
        }

        let settings: AppConfig = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        settings.node.validate()?;
        Ok(settings)
    }
}

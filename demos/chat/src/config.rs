use std::path::Path;

use anyhow::Context;
use mesa_core::{ClientConfig, ServerConfig};
use serde::Deserialize;

/// Both halves of the demo read the same file; each uses its own section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl ChatConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&data).with_context(|| format!("parsing {}", path.display()))
    }

    fn parse(data: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(data)?;
        config.server.validate()?;
        config.client.validate()?;
        Ok(config)
    }
}

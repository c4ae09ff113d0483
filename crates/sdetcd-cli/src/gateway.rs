//! Gateway configuration file.
//!
//! Only the top-level `extra_config` object is read; the discovery block sits
//! inside it under the namespace key.

use anyhow::Context;
use sdetcd_core::ExtraConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct GatewayFile {
    #[serde(default)]
    extra_config: ExtraConfig,
}

pub fn load_extra_config(path: &Path) -> anyhow::Result<ExtraConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading gateway config {}", path.display()))?;
    let file: GatewayFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing gateway config {}", path.display()))?;
    Ok(file.extra_config)
}

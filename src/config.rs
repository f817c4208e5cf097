//! Optional TOML configuration for edgerunner.
//!
//! Everything here has a CLI or built-in default; the file exists so that
//! deployments driving many targets can keep the port/stats knobs out of the
//! agent's command lines.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HarnessConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "ServerConfig::default_bind")]
    pub bind: String,
    /// Port the agent connects to.
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
}

impl ServerConfig {
    fn default_bind() -> String {
        "0.0.0.0".into()
    }
    fn default_port() -> u16 {
        2300
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: Self::default_bind(),
            port: Self::default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Seconds between fuzzer_stats / plot_data flushes during a session.
    #[serde(default = "StatsConfig::default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

impl StatsConfig {
    fn default_flush_interval_secs() -> u64 {
        60
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: Self::default_flush_interval_secs(),
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_gets_defaults() {
        let cfg: HarnessConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0");
        assert_eq!(cfg.server.port, 2300);
        assert_eq!(cfg.stats.flush_interval_secs, 60);
    }

    #[test]
    fn test_partial_override() {
        let cfg: HarnessConfig = toml::from_str(
            "[server]\n\
             port = 4100\n",
        )
        .unwrap();
        assert_eq!(cfg.server.port, 4100);
        assert_eq!(cfg.server.bind, "0.0.0.0");
    }
}

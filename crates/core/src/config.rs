use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub hub: HubConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open config file {}", path.display()))?;
        serde_yaml::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Fallback when no config file is present: token from `HUB_TOKEN` (or
    /// `GITHUB_TOKEN`), everything else defaulted.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("HUB_TOKEN")
            .or_else(|_| std::env::var("GITHUB_TOKEN"))
            .context("Neither HUB_TOKEN nor GITHUB_TOKEN is set")?;
        let base_url = std::env::var("HUB_API_URL").unwrap_or_else(|_| default_base_url());
        Ok(Self { api: ApiConfig { base_url, token }, hub: HubConfig::default() })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    /// Artifact names are expected to end in this suffix; resolution degrades
    /// to looser matches when they don't.
    #[serde(default = "default_report_artifact_suffix")]
    pub report_artifact_suffix: String,
    /// Per-repo wall-clock limit for polling a run to a terminal state.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Bound on the worker pool fanning out across repos. All workers share
    /// one credential and one API quota, so keep this small.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            report_artifact_suffix: default_report_artifact_suffix(),
            poll_timeout_secs: default_poll_timeout_secs(),
            workers: default_workers(),
        }
    }
}

fn default_base_url() -> String { "https://api.github.com".to_string() }

fn default_report_artifact_suffix() -> String { "-hub-report".to_string() }

fn default_poll_timeout_secs() -> u64 { 1800 }

fn default_workers() -> usize { 4 }

/// Gating policy, read-only input to the aggregator.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Thresholds {
    #[serde(default)]
    pub max_critical_vulns: u64,
    #[serde(default = "default_max_high_vulns")]
    pub max_high_vulns: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { max_critical_vulns: 0, max_high_vulns: default_max_high_vulns() }
    }
}

fn default_max_high_vulns() -> u64 { 5 }

/// Wrapper matching the on-disk thresholds document.
#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdsDoc {
    pub thresholds: Thresholds,
}

impl ThresholdsDoc {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open thresholds file {}", path.display()))?;
        serde_yaml::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to parse thresholds file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_doc() {
        let doc: ThresholdsDoc =
            serde_yaml::from_str("thresholds:\n  max_critical_vulns: 1\n  max_high_vulns: 3\n")
                .unwrap();
        assert_eq!(doc.thresholds.max_critical_vulns, 1);
        assert_eq!(doc.thresholds.max_high_vulns, 3);
    }

    #[test]
    fn test_thresholds_defaults() {
        let doc: ThresholdsDoc = serde_yaml::from_str("thresholds: {}\n").unwrap();
        assert_eq!(doc.thresholds.max_critical_vulns, 0);
        assert_eq!(doc.thresholds.max_high_vulns, 5);
    }

    #[test]
    fn test_config_defaults() {
        let config: Config = serde_yaml::from_str("api:\n  token: abc\n").unwrap();
        assert_eq!(config.api.base_url, "https://api.github.com");
        assert_eq!(config.hub.report_artifact_suffix, "-hub-report");
        assert_eq!(config.hub.workers, 4);
    }
}

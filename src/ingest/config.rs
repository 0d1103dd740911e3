// src/ingest/config.rs
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::{BackoffPolicy, PipelinePolicy, RateBudget};

const ENV_PATH: &str = "SOCIAL_ANALYZER_CONFIG";

/// Top-level configuration: where to serve the API and what to ingest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rss,
    HttpJson,
}

/// One configured source. Credentials are never stored here, only the name
/// of the environment variable that holds them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub kind: SourceKind,
    /// Feed/API URL. `file://` serves a local file (rss only).
    pub endpoint: String,
    #[serde(default)]
    pub bearer_token_env: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_fetch_deadline_secs")]
    pub fetch_deadline_secs: Option<u64>,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default)]
    pub rate_limit: RateBudget,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_batch_size() -> usize {
    50
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_fetch_deadline_secs() -> Option<u64> {
    Some(30)
}
fn default_max_consecutive_failures() -> u32 {
    5
}

impl SourceConfig {
    pub fn policy(&self) -> PipelinePolicy {
        PipelinePolicy {
            batch_size: self.batch_size,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            fetch_deadline: self.fetch_deadline_secs.map(Duration::from_secs),
            max_consecutive_failures: self.max_consecutive_failures,
            backoff: self.backoff,
        }
    }

    /// Resolve the bearer token from the environment, if one is configured.
    pub fn bearer_token(&self) -> Result<Option<String>> {
        match &self.bearer_token_env {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .with_context(|| format!("source {}: env var {var} is not set", self.id)),
        }
    }

    fn validate(&self) -> Result<()> {
        let id = &self.id;
        if id.trim().is_empty() {
            bail!("source id must not be empty");
        }
        if self.endpoint.trim().is_empty() {
            bail!("source {id}: endpoint must not be empty");
        }
        if self.batch_size == 0 {
            bail!("source {id}: batch_size must be >= 1");
        }
        if self.max_consecutive_failures == 0 {
            bail!("source {id}: max_consecutive_failures must be >= 1");
        }
        if self.rate_limit.capacity == 0 {
            bail!("source {id}: rate_limit.capacity must be >= 1");
        }
        let refill = self.rate_limit.refill_per_sec;
        if !refill.is_finite() || refill <= 0.0 {
            bail!("source {id}: rate_limit.refill_per_sec must be > 0");
        }
        let mult = self.backoff.multiplier;
        if !mult.is_finite() || mult < 1.0 {
            bail!("source {id}: backoff.multiplier must be >= 1");
        }
        if self.backoff.base_ms > self.backoff.max_ms {
            bail!("source {id}: backoff.base_ms must be <= backoff.max_ms");
        }
        if self.kind == SourceKind::HttpJson && self.endpoint.starts_with("file://") {
            bail!("source {id}: file:// endpoints are only supported for rss");
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for s in &self.sources {
            s.validate()?;
            if !seen.insert(s.id.as_str()) {
                bail!("duplicate source id {:?}", s.id);
            }
        }
        Ok(())
    }
}

/// Load configuration from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let cfg = parse_config(&content, ext.as_str())
        .with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load configuration using env var + fallbacks:
/// 1) $SOCIAL_ANALYZER_CONFIG
/// 2) config/sources.toml
/// 3) config/sources.json
/// 4) built-in default (no sources)
pub fn load_config_default() -> Result<AppConfig> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_config_from(&pb);
        } else {
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
    }
    let toml_p = PathBuf::from("config/sources.toml");
    if toml_p.exists() {
        return load_config_from(&toml_p);
    }
    let json_p = PathBuf::from("config/sources.json");
    if json_p.exists() {
        return load_config_from(&json_p);
    }
    Ok(AppConfig::default())
}

fn parse_config(s: &str, hint_ext: &str) -> Result<AppConfig> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s)?),
        "json" => Ok(serde_json::from_str(s)?),
        // No usable extension: JSON starts with '{', anything else is TOML.
        _ if s.trim_start().starts_with('{') => Ok(serde_json::from_str(s)?),
        _ => Ok(toml::from_str(s)?),
    }
}

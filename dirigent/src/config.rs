//! Control-plane configuration stored as TOML next to the project root.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Control-plane configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum automatic design retries before a run is rejected.
    pub max_retries: u32,

    pub stages: StageCommands,
    pub providers: ProviderConfig,
    pub cache: CacheConfig,
    pub credentials: CredentialConfig,
    pub local_models: LocalModelConfig,
}

/// Worker executables per pipeline stage.
///
/// Each entry is the argv prefix for one stage worker; the supervisor appends
/// `--run-id`, `--input-path` and (when retrying) `--feedback`. An empty
/// `execution` command means the run completes once validation passes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StageCommands {
    pub requirements: Vec<String>,
    pub design: Vec<String>,
    pub validation: Vec<String>,
    pub execution: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base priority order of backend names. Reordered per task class.
    pub priority: Vec<String>,
    /// Backend used as the emergency path when a cloud provider rate-limits.
    pub local_fallback: String,
    /// Timeout for cloud provider calls.
    pub request_timeout_secs: u64,
    /// Timeout for local model calls (slow backends get minutes).
    pub local_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cached responses before bulk eviction.
    pub capacity: usize,
    /// How many leading characters of each prompt feed the cache key.
    pub key_prefix_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CredentialConfig {
    /// Cooldown applied to a credential after a rate-limit failure.
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LocalModelConfig {
    /// Ceiling on concurrently running managed backends.
    pub max_concurrent: usize,
    /// Evict a backend after this long without use.
    pub idle_timeout_secs: u64,
    /// How many times to poll the runtime while a backend starts.
    pub start_poll_attempts: u32,
    /// Spacing between start polls.
    pub start_poll_interval_secs: u64,
    /// Interval of the background idle sweep.
    pub sweep_interval_secs: u64,
}

impl Default for StageCommands {
    fn default() -> Self {
        Self {
            requirements: vec!["agents/requirements".to_string()],
            design: vec!["agents/planner".to_string()],
            validation: vec!["agents/validator".to_string()],
            execution: Vec::new(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            priority: vec!["gemini".to_string(), "local".to_string()],
            local_fallback: "local".to_string(),
            request_timeout_secs: 60,
            local_timeout_secs: 15 * 60,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            key_prefix_chars: 200,
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self { cooldown_secs: 300 }
    }
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            idle_timeout_secs: 300,
            start_poll_attempts: 12,
            start_poll_interval_secs: 5,
            sweep_interval_secs: 30,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stages: StageCommands::default(),
            providers: ProviderConfig::default(),
            cache: CacheConfig::default(),
            credentials: CredentialConfig::default(),
            local_models: LocalModelConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stages.requirements.is_empty()
            || self.stages.design.is_empty()
            || self.stages.validation.is_empty()
        {
            return Err(anyhow!(
                "stages.requirements/design/validation must be non-empty commands"
            ));
        }
        if self.providers.priority.is_empty() {
            return Err(anyhow!("providers.priority must list at least one backend"));
        }
        if self.providers.request_timeout_secs == 0 || self.providers.local_timeout_secs == 0 {
            return Err(anyhow!("provider timeouts must be > 0"));
        }
        if self.cache.capacity == 0 || self.cache.key_prefix_chars == 0 {
            return Err(anyhow!("cache.capacity and cache.key_prefix_chars must be > 0"));
        }
        if self.local_models.max_concurrent == 0 {
            return Err(anyhow!("local_models.max_concurrent must be > 0"));
        }
        if self.local_models.start_poll_attempts == 0 {
            return Err(anyhow!("local_models.start_poll_attempts must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = OrchestratorConfig::default();
        cfg.max_retries = 5;
        cfg.providers.priority = vec!["openai".to_string(), "local".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn empty_stage_command_is_rejected() {
        let mut cfg = OrchestratorConfig::default();
        cfg.stages.design = Vec::new();
        assert!(cfg.validate().is_err());
    }
}

//! Configuration loading from TOML files

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use shardline_core::PipelineConfig;
use shardline_store::{Location, RepoInfo};

/// Global configuration for shardline
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub workers: WorkersConfig,
    pub repo: RepoConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub project: String,
    pub branch: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            project: "default".to_string(),
            branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub default: usize,
    pub max: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            default: cpus.min(8),
            max: 16,
        }
    }
}

/// Provenance stamped into DefFiles; values may reference `${VAR}`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RepoConfig {
    #[serde(deserialize_with = "deserialize_env_var")]
    pub branch: Option<String>,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub commit_hash: Option<String>,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub commit_message: Option<String>,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub committer_name: Option<String>,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub committer_email: Option<String>,
}

impl RepoConfig {
    pub fn to_repo_info(&self) -> RepoInfo {
        let field = |v: &Option<String>| v.clone().unwrap_or_default();
        RepoInfo {
            branch: field(&self.branch),
            commit_hash: field(&self.commit_hash),
            commit_message: field(&self.commit_message),
            committer_name: field(&self.committer_name),
            committer_email: field(&self.committer_email),
        }
    }
}

/// Deserialize a string that may contain environment variable reference like ${VAR}
fn deserialize_env_var<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.and_then(|s| expand_env_var(&s)))
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./shardline.toml (current directory)
    /// 2. ~/.config/shardline/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("shardline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "shardline") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Storage location the commands operate on.
    pub fn location(&self) -> Location {
        Location::new(
            &self.storage.root,
            &self.storage.project,
            &self.storage.branch,
        )
        .with_repo(self.repo.to_repo_info())
    }

    /// Settings handed to pipelines built against this config.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::default().with_workers(self.workers.default.min(self.workers.max))
    }
}

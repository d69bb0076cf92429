//! Merge configuration loading
//!
//! Loads `hyaline-merge.toml` from the working directory (or the path in
//! `HYALINE_MERGE_CONFIG`), then overlays the GitHub Actions environment.
//! Secrets never come from the file.

use std::path::{Path, PathBuf};

use hyaline_artifact_store::{GitHubConfig, MAX_PER_PAGE, github::DEFAULT_API_BASE};
use serde::Deserialize;

use crate::error::{MergeError, Result};

/// Root configuration for a merge deployment
#[derive(Debug, Deserialize, Clone, Default)]
pub struct MergeConfig {
    /// Where artifacts live
    #[serde(default)]
    pub store: StoreSettings,

    /// Artifact names and merge parameters
    #[serde(default)]
    pub merge: MergeSettings,

    /// External fold command
    #[serde(default)]
    pub fold: FoldSettings,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Github,
    Local,
}

/// Artifact store settings
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Root directory of the local backend
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,

    /// Repository owner; falls back to `GITHUB_REPOSITORY`
    #[serde(default)]
    pub owner: Option<String>,

    /// Repository name; falls back to `GITHUB_REPOSITORY`
    #[serde(default)]
    pub repo: Option<String>,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// REST token (`HYALINE_CONFIG_GITHUB_TOKEN`)
    #[serde(skip)]
    pub token: String,

    /// `ACTIONS_RESULTS_URL`
    #[serde(skip)]
    pub results_url: Option<String>,

    /// `ACTIONS_RUNTIME_TOKEN`
    #[serde(skip)]
    pub runtime_token: Option<String>,

    /// `GITHUB_RUN_ID`
    #[serde(skip)]
    pub run_id: u64,
}

fn default_local_root() -> PathBuf {
    PathBuf::from("./_artifacts")
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            local_root: default_local_root(),
            owner: None,
            repo: None,
            api_base: default_api_base(),
            token: String::new(),
            results_url: None,
            runtime_token: None,
            run_id: 0,
        }
    }
}

impl StoreSettings {
    /// Connection settings for the GitHub backend.
    pub fn github_config(&self) -> Result<GitHubConfig> {
        let (Some(owner), Some(repo)) = (self.owner.as_deref(), self.repo.as_deref()) else {
            return Err(MergeError::config(
                "github backend needs store.owner and store.repo (or GITHUB_REPOSITORY)",
            ));
        };

        let mut config = GitHubConfig::new(owner, repo, self.token.clone());
        config.api_base = self.api_base.clone();
        config.results_url = self.results_url.clone();
        config.runtime_token = self.runtime_token.clone();
        config.run_id = self.run_id;
        Ok(config)
    }
}

/// Settings that drive a single merge run
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct MergeSettings {
    /// Name shared by every extraction artifact
    #[serde(default = "default_extract_artifact_name")]
    pub extract_artifact_name: String,

    /// Name of the published snapshot + checkpoint artifact
    #[serde(default = "default_current_artifact_name")]
    pub current_artifact_name: String,

    /// Snapshot file name inside both kinds of artifact
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,

    /// Listing page size
    #[serde(default = "default_per_page")]
    pub per_page: u32,

    /// Scratch space for downloads, fold output and publish staging
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_extract_artifact_name() -> String {
    "_extracted-documentation".to_string()
}

fn default_current_artifact_name() -> String {
    "_current-documentation".to_string()
}

fn default_snapshot_file() -> String {
    "documentation.db".to_string()
}

fn default_per_page() -> u32 {
    MAX_PER_PAGE
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./_tmp")
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            extract_artifact_name: default_extract_artifact_name(),
            current_artifact_name: default_current_artifact_name(),
            snapshot_file: default_snapshot_file(),
            per_page: default_per_page(),
            work_dir: default_work_dir(),
        }
    }
}

impl MergeSettings {
    pub fn validate(&self) -> Result<()> {
        if self.extract_artifact_name.trim().is_empty() {
            return Err(MergeError::config("extract_artifact_name must not be empty"));
        }
        if self.current_artifact_name.trim().is_empty() {
            return Err(MergeError::config("current_artifact_name must not be empty"));
        }
        if self.extract_artifact_name == self.current_artifact_name {
            return Err(MergeError::config(format!(
                "extract and current artifact names must differ (both are {})",
                self.extract_artifact_name
            )));
        }
        if self.snapshot_file.trim().is_empty() || self.snapshot_file == crate::CHECKPOINT_FILE {
            return Err(MergeError::config(format!(
                "invalid snapshot_file: {:?}",
                self.snapshot_file
            )));
        }
        if !(1..=MAX_PER_PAGE).contains(&self.per_page) {
            return Err(MergeError::config(format!(
                "per_page must be between 1 and {MAX_PER_PAGE}, got {}",
                self.per_page
            )));
        }
        Ok(())
    }
}

/// External fold command settings
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct FoldSettings {
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments placed before the subcommand, e.g. `program = "npx"`
    /// with `args = ["hyaline"]`
    #[serde(default)]
    pub args: Vec<String>,

    /// Pass `--debug` to the fold command
    #[serde(default)]
    pub debug: bool,

    /// Kill the fold command after this many seconds (0 disables)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_program() -> String {
    "hyaline".to_string()
}

fn default_timeout_secs() -> u64 {
    1800
}

impl Default for FoldSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            debug: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl MergeConfig {
    /// Environment variable to override config path
    pub const ENV_CONFIG_PATH: &'static str = "HYALINE_MERGE_CONFIG";

    /// Default config file name, looked up in the working directory
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "hyaline-merge.toml";

    /// Load configuration
    ///
    /// Resolution order:
    /// 1. `explicit` (from `--config`); must exist
    /// 2. `HYALINE_MERGE_CONFIG` environment variable; must exist
    /// 3. `./hyaline-merge.toml`; defaults are used when it is missing
    ///
    /// The process environment is overlaid afterwards.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = match Self::resolve_config_path(explicit) {
            (path, true) => Self::load_from_path(&path)?,
            (path, false) if path.exists() => Self::load_from_path(&path)?,
            (path, false) => {
                tracing::info!(
                    path = %path.display(),
                    "merge config not found, using defaults"
                );
                Self::default()
            }
        };

        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MergeError::config_with_source(
                format!("failed to read config at {}", path.display()),
                e,
            )
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| MergeError::config_with_source("failed to parse config", e))
    }

    /// Returns the path and whether it was asked for explicitly.
    fn resolve_config_path(explicit: Option<&Path>) -> (PathBuf, bool) {
        if let Some(path) = explicit {
            return (path.to_path_buf(), true);
        }
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return (PathBuf::from(path), true);
        }
        (PathBuf::from(Self::DEFAULT_CONFIG_FILENAME), false)
    }

    /// Overlay GitHub Actions environment variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let store = &mut self.store;

        if let Some(token) = lookup("HYALINE_CONFIG_GITHUB_TOKEN") {
            store.token = token;
        }
        if let Some(repository) = lookup("GITHUB_REPOSITORY")
            && let Some((owner, repo)) = repository.split_once('/')
        {
            store.owner.get_or_insert_with(|| owner.to_string());
            store.repo.get_or_insert_with(|| repo.to_string());
        }
        if let Some(api) = lookup("GITHUB_API_URL")
            && store.api_base == DEFAULT_API_BASE
        {
            store.api_base = api;
        }
        if let Some(url) = lookup("ACTIONS_RESULTS_URL") {
            store.results_url = Some(url);
        }
        if let Some(token) = lookup("ACTIONS_RUNTIME_TOKEN") {
            store.runtime_token = Some(token);
        }
        if let Some(run_id) = lookup("GITHUB_RUN_ID") {
            match run_id.parse() {
                Ok(id) => store.run_id = id,
                Err(_) => tracing::warn!(run_id, "ignoring unparseable GITHUB_RUN_ID"),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.merge.validate()?;

        if self.fold.program.trim().is_empty() {
            return Err(MergeError::config("fold.program must not be empty"));
        }

        if self.store.backend == StoreBackend::Github {
            self.store.github_config()?;
            if self.store.token.is_empty() {
                tracing::warn!(
                    "HYALINE_CONFIG_GITHUB_TOKEN is not set; GitHub requests will be unauthenticated"
                );
            }
        }

        Ok(())
    }
}

//! Evaluation settings: model loading, batch size, generation limit and the
//! partial-result log.
//!
//! `config/default.toml` is embedded in the binary. A user file only needs
//! the keys it changes: its `[model]`, `[eval]` and `[cache]` tables are
//! laid over the embedded ones key by key, and command-line flags win over
//! both (see `Args::settings`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::ValueEnum;
use directories::ProjectDirs;
use lmeval_engine::{EvalConfig, LlamaCppOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default configuration TOML embedded from config/default.toml
const DEFAULT_CONFIG_TOML: &str = include_str!("../../../config/default.toml");

/// Configuration settings for lmeval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Model loading settings
    pub model: ModelSettings,
    /// Scoring and generation settings
    pub eval: EvalConfig,
    /// Partial-result log settings
    pub cache: CacheSettings,
}

/// Which model backend to load
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// GGUF model through llama.cpp
    #[default]
    Llama,
    /// JSON lookup-table model
    Table,
}

/// Model-related settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default)]
    pub backend: BackendKind,
    /// HuggingFace repository id
    pub repo: Option<String>,
    /// HuggingFace revision (branch, tag or commit)
    pub revision: String,
    /// GGUF file name in `repo`, or a local path
    pub gguf: Option<String>,
    /// Local tokenizer.json path
    pub tokenizer_json: Option<String>,
    /// Table model JSON path
    pub table: Option<String>,
    pub n_gpu_layers: u32,
    pub n_threads: u32,
    /// Context window override
    pub max_length: Option<usize>,
}

impl ModelSettings {
    pub fn llama_options(&self) -> LlamaCppOptions {
        LlamaCppOptions {
            n_gpu_layers: self.n_gpu_layers,
            n_threads: self.n_threads,
            max_length: self.max_length,
        }
    }
}

/// Partial-result log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// JSON Lines file receiving every finished generation
    pub partial_results: Option<PathBuf>,
    /// Skip generations already present in `partial_results`
    pub resume: bool,
}

impl Default for Settings {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG_TOML).expect("embedded default.toml must be valid")
    }
}

/// Top-level tables a settings file may contain.
const SECTIONS: [&str; 3] = ["model", "eval", "cache"];

/// Lay `user` over `defaults`. Tables merge per key, so `[model] backend`
/// alone keeps the default revision; any other value replaces the default.
fn overlay(defaults: &mut toml::Value, user: &toml::Value) {
    match (defaults, user) {
        (toml::Value::Table(defaults), toml::Value::Table(user)) => {
            for (key, value) in user {
                match defaults.get_mut(key) {
                    Some(default) => overlay(default, value),
                    None => {
                        defaults.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (default, value) => *default = value.clone(),
    }
}

/// Build [`Settings`] from the contents of a user settings file.
fn settings_from_user_toml(content: &str) -> Result<Settings> {
    let user: toml::Value = toml::from_str(content)?;
    if let Some(table) = user.as_table() {
        for section in table.keys().filter(|k| !SECTIONS.contains(&k.as_str())) {
            warn!("Ignoring unknown settings table [{}]", section);
        }
    }
    let mut merged: toml::Value = toml::from_str(DEFAULT_CONFIG_TOML)?;
    overlay(&mut merged, &user);
    let settings: Settings = merged.try_into()?;
    Ok(settings)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "lmeval")
}

impl Settings {
    /// Get the configuration file path (`~/.config/lmeval/config.toml` on Linux)
    pub fn config_file() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load settings from the default configuration file.
    /// Falls back to embedded default.toml if the config file does not exist.
    pub fn load() -> Result<Self> {
        let Some(config_file) = Self::config_file() else {
            warn!("Could not determine config directory, using defaults");
            return Ok(Self::default());
        };

        if !config_file.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        debug!("Loading config from {:?}", config_file);
        let content = fs::read_to_string(&config_file)?;
        settings_from_user_toml(&content)
    }

    /// Load settings from a specific file, merged on top of defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        settings_from_user_toml(&content)
    }
}

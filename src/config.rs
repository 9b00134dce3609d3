//! Configuration loader and validator for the Twitter→Mastodon relay.
use crate::model::Account;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_LANGUAGE: &str = "en";
pub const MIN_BATCH_SIZE: u32 = 5;
pub const MAX_BATCH_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Invalid account entry {0:?}")]
    InvalidAccount(String),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub state: State,
    pub twitter: Twitter,
    pub mastodon: Mastodon,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default = "default_account_delay")]
    pub account_delay_secs: u64,
    #[serde(default = "default_cycle_delay")]
    pub cycle_delay_secs: u64,
}

/// Where cursors are persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct State {
    #[serde(default)]
    pub backend: StateBackend,
    /// Overrides the default file under `app.data_dir`.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Sqlite,
    File,
}

/// Source API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Twitter {
    pub bearer_token: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Newline-separated `handle` or `handle:language` entries.
    #[serde(default)]
    pub accounts: String,
}

/// Destination instance settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mastodon {
    pub instance: String,
    pub access_token: String,
}

fn default_account_delay() -> u64 {
    5
}

fn default_cycle_delay() -> u64 {
    300
}

fn default_batch_size() -> u32 {
    MIN_BATCH_SIZE
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Parsed account table in configuration order.
    pub fn accounts(&self) -> Result<Vec<Account>, ConfigError> {
        parse_account_list(&self.twitter.accounts)
    }

    /// Resolved location of the cursor state for the configured backend.
    pub fn state_path(&self) -> PathBuf {
        if let Some(path) = self.state.path.as_deref().filter(|p| !p.trim().is_empty()) {
            return PathBuf::from(path);
        }
        let file = match self.state.backend {
            StateBackend::Sqlite => "cursors.db",
            StateBackend::File => "cursors.json",
        };
        Path::new(&self.app.data_dir).join(file)
    }

    /// `https://` base URL of the destination instance.
    pub fn mastodon_base_url(&self) -> String {
        let instance = self.mastodon.instance.trim().trim_end_matches('/');
        if instance.starts_with("http://") || instance.starts_with("https://") {
            format!("{}/", instance)
        } else {
            format!("https://{}/", instance)
        }
    }
}

/// Parse newline-separated `handle[:language]` entries.
/// Blank lines are skipped, a leading `@` is dropped, and the language
/// defaults to `en`. Duplicate handles are rejected.
pub fn parse_account_list(raw: &str) -> Result<Vec<Account>, ConfigError> {
    let mut seen = HashSet::new();
    let mut accounts = Vec::new();
    for line in raw.lines() {
        let entry = line.trim();
        if entry.is_empty() {
            continue;
        }
        let (handle, language) = match entry.split_once(':') {
            Some((h, l)) => (h.trim(), l.trim()),
            None => (entry, DEFAULT_LANGUAGE),
        };
        let handle = handle.trim_start_matches('@');
        if handle.is_empty() || language.is_empty() || language.contains(':') {
            return Err(ConfigError::InvalidAccount(entry.to_string()));
        }
        if !seen.insert(handle.to_ascii_lowercase()) {
            return Err(ConfigError::InvalidAccount(entry.to_string()));
        }
        accounts.push(Account {
            handle: handle.to_string(),
            language: language.to_string(),
        });
    }
    Ok(accounts)
}

/// Load configuration from a YAML file, apply environment overrides, and
/// validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

/// Secrets and the account list may come from the environment instead of
/// the YAML file; non-empty environment values win.
pub fn apply_env_overrides<F>(cfg: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    if let Some(v) = get("TWITTER_BEARER_TOKEN") {
        cfg.twitter.bearer_token = v;
    }
    if let Some(v) = get("TWITTER_ACCOUNT_LIST") {
        cfg.twitter.accounts = v;
    }
    if let Some(v) = get("MASTODON_INSTANCE") {
        cfg.mastodon.instance = v;
    }
    if let Some(v) = get("MASTODON_ACCESS_TOKEN") {
        cfg.mastodon.access_token = v;
    }
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.cycle_delay_secs == 0 {
        return Err(ConfigError::Invalid("app.cycle_delay_secs must be > 0"));
    }

    if cfg.twitter.bearer_token.trim().is_empty() {
        return Err(ConfigError::Invalid("twitter.bearer_token must be non-empty"));
    }
    if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&cfg.twitter.batch_size) {
        return Err(ConfigError::Invalid(
            "twitter.batch_size must be between 5 and 100",
        ));
    }
    if cfg.accounts()?.is_empty() {
        return Err(ConfigError::Invalid("twitter.accounts must list at least one account"));
    }

    if cfg.mastodon.instance.trim().is_empty() {
        return Err(ConfigError::Invalid("mastodon.instance must be non-empty"));
    }
    if cfg.mastodon.access_token.trim().is_empty() {
        return Err(ConfigError::Invalid("mastodon.access_token must be non-empty"));
    }

    Ok(())
}

/// Returns the example YAML shipped in the README.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  account_delay_secs: 5
  cycle_delay_secs: 300

state:
  backend: sqlite

twitter:
  bearer_token: "YOUR_TWITTER_BEARER_TOKEN"
  batch_size: 5
  accounts: |
    alice
    bob:ja

mastodon:
  instance: "mastodon.example"
  access_token: "YOUR_MASTODON_ACCESS_TOKEN"
"#
}

//! Configuration management for quill
//!
//! Stores settings in ~/.config/quill/config.json

use crate::chat::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

fn default_auto_commit() -> bool {
    true
}

fn default_attribute_commits() -> bool {
    true
}

fn default_max_repair_attempts() -> usize {
    3
}

fn default_edit_format() -> String {
    "search-replace".to_string()
}

fn default_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_context_window() -> usize {
    128_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Commit applied edits automatically at the end of each turn.
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,
    /// Append the tool-attribution suffix to commit identities.
    #[serde(default = "default_attribute_commits")]
    pub attribute_commits: bool,
    /// Edit format name; see EditFormat::from_name.
    #[serde(default = "default_edit_format")]
    pub edit_format: String,
    #[serde(default = "default_max_repair_attempts")]
    pub max_repair_attempts: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Run post-apply checks and feed failures back to the model.
    #[serde(default)]
    pub run_checks: bool,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_commit: default_auto_commit(),
            attribute_commits: default_attribute_commits(),
            edit_format: default_edit_format(),
            max_repair_attempts: default_max_repair_attempts(),
            overflow_policy: OverflowPolicy::default(),
            run_checks: false,
            api_url: default_api_url(),
            model: default_model(),
            context_window: default_context_window(),
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("quill"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if let Ok(content) = fs::read_to_string(&path) {
                match serde_json::from_str::<Config>(&content) {
                    Ok(config) => return config,
                    Err(err) => {
                        preserve_corrupt_config(&path, &content);
                        tracing::warn!(
                            "config file was corrupted ({err}); backup saved, defaults loaded"
                        );
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to disk
    pub fn save(&self) -> Result<(), String> {
        let dir =
            Self::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;

        fs::create_dir_all(&dir)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        #[cfg(unix)]
        {
            write_config_atomic(&path, &content)
                .map_err(|e| format!("Failed to write config: {}", e))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
        }

        Ok(())
    }

    /// API key from the environment; quill never persists keys to disk.
    pub fn api_key(&self) -> Option<String> {
        std::env::var("QUILL_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

fn preserve_corrupt_config(path: &std::path::Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(unix)]
fn write_config_atomic(path: &std::path::Path, content: &str) -> Result<(), String> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::PermissionsExt;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
        tracing::warn!("failed to set temp config file permissions: {e}");
    }

    file.write_all(content.as_bytes())
        .map_err(|e| e.to_string())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}

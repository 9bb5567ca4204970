use crate::error::SyncError;
use crate::integrations::todoist::DEFAULT_BASE_URL;
use directories::ProjectDirs;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_SYNC_MARKER: &str = "#todoist";
const MARKER_PREFIX: char = '#';

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "notesync", "notesync")
}

pub fn default_data_dir() -> PathBuf {
    if let Some(path) = std::env::var_os("NOTESYNC_DATA_DIR") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.data_dir().to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".notesync")
}

fn default_vault_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("NOTESYNC_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.config_dir().join("config.toml");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".notesync-config.toml")
}

/// How the engine settles a task that differs between the vault and Todoist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    LocalWins,
    #[default]
    RemoteWins,
    Ask,
}

impl ConflictPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::LocalWins => "local-wins",
            ConflictPolicy::RemoteWins => "remote-wins",
            ConflictPolicy::Ask => "ask",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "local-wins" | "local_wins" => Ok(ConflictPolicy::LocalWins),
            "remote-wins" | "remote_wins" => Ok(ConflictPolicy::RemoteWins),
            "ask" => Ok(ConflictPolicy::Ask),
            other => Err(SyncError::Config(format!(
                "Unknown conflict policy {other:?} (expected local-wins, remote-wins or ask)"
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub vault: VaultConfig,
    pub todoist: TodoistConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VaultConfig {
    pub path: PathBuf,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: default_vault_dir(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TodoistConfig {
    pub api_token: String,
    pub sync_marker: String,
    /// Project id for new tasks; empty means the inbox.
    pub default_project: String,
    /// Minutes between passes in watch mode; 0 turns periodic sync off.
    pub sync_interval_minutes: u64,
    pub conflict_policy: ConflictPolicy,
    pub base_url: String,
}

impl Default for TodoistConfig {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            sync_marker: DEFAULT_SYNC_MARKER.to_string(),
            default_project: String::new(),
            sync_interval_minutes: 0,
            conflict_policy: ConflictPolicy::default(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl TodoistConfig {
    pub fn default_project_id(&self) -> Option<String> {
        let trimmed = self.default_project.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// The config value, or `TODOIST_API_TOKEN` when the config leaves it blank.
    pub fn resolved_token(&self) -> String {
        if !self.api_token.trim().is_empty() {
            return self.api_token.trim().to_string();
        }
        std::env::var("TODOIST_API_TOKEN").unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: PathBuf,
    pub to_stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: default_data_dir().join("logs"),
            to_stderr: false,
        }
    }
}

pub fn normalize_marker(marker: &str) -> String {
    let trimmed = marker.trim();
    if trimmed.trim_start_matches(MARKER_PREFIX).is_empty() {
        return DEFAULT_SYNC_MARKER.to_string();
    }
    if trimmed.starts_with(MARKER_PREFIX) {
        trimmed.to_string()
    } else {
        format!("{MARKER_PREFIX}{trimmed}")
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = config_path();
        let mut config = Self::load_from_path(&config_path);

        let changed = config.normalize();
        if changed || !config_path.exists() {
            let _ = config.save_to_path(&config_path);
        }
        config
    }

    pub fn load_from_path(path: &Path) -> Self {
        let mut config = if let Ok(content) = fs::read_to_string(path) {
            match toml::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Failed to parse config.toml ({path:?}), using defaults: {e}");
                    Config::default()
                }
            }
        } else {
            Config::default()
        };
        config.normalize();
        config
    }

    pub fn save_to_path(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }

    pub fn state_path(&self) -> PathBuf {
        default_data_dir().join("sync_state.json")
    }

    /// Changes one setting by its dotted key, validating the value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SyncError> {
        match key {
            "vault.path" => self.vault.path = PathBuf::from(value.trim()),
            "todoist.api_token" => self.todoist.api_token = value.trim().to_string(),
            "todoist.sync_marker" => self.todoist.sync_marker = normalize_marker(value),
            "todoist.default_project" => self.todoist.default_project = value.trim().to_string(),
            "todoist.sync_interval_minutes" => {
                self.todoist.sync_interval_minutes = value.trim().parse().map_err(|_| {
                    SyncError::Config(format!(
                        "sync_interval_minutes must be a non-negative integer, got {value:?}"
                    ))
                })?;
            }
            "todoist.conflict_policy" => self.todoist.conflict_policy = value.parse()?,
            "todoist.base_url" => self.todoist.base_url = value.trim().to_string(),
            "logging.level" => self.logging.level = value.trim().to_lowercase(),
            "logging.log_dir" => self.logging.log_dir = PathBuf::from(value.trim()),
            "logging.to_stderr" => {
                self.logging.to_stderr = value.trim().parse().map_err(|_| {
                    SyncError::Config(format!("logging.to_stderr must be true or false, got {value:?}"))
                })?;
            }
            other => return Err(SyncError::Config(format!("Unknown setting {other:?}"))),
        }
        self.normalize();
        Ok(())
    }

    fn normalize(&mut self) -> bool {
        let mut changed = false;

        let marker = normalize_marker(&self.todoist.sync_marker);
        if marker != self.todoist.sync_marker {
            self.todoist.sync_marker = marker;
            changed = true;
        }

        if self.todoist.base_url.trim().is_empty() {
            self.todoist.base_url = DEFAULT_BASE_URL.to_string();
            changed = true;
        }

        if self.logging.log_dir.as_os_str().is_empty() {
            self.logging.log_dir = default_data_dir().join("logs");
            changed = true;
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_is_normalized_to_hashtag() {
        assert_eq!(normalize_marker("todo"), "#todo");
        assert_eq!(normalize_marker("  #sync "), "#sync");
        assert_eq!(normalize_marker(""), DEFAULT_SYNC_MARKER);
        assert_eq!(normalize_marker("#"), DEFAULT_SYNC_MARKER);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[todoist]\napi_token = \"abc\"\nsync_marker = \"tasks\"\nconflict_policy = \"ask\"\n",
        )
        .expect("write");

        let config = Config::load_from_path(&path);
        assert_eq!(config.todoist.api_token, "abc");
        assert_eq!(config.todoist.sync_marker, "#tasks");
        assert_eq!(config.todoist.conflict_policy, ConflictPolicy::Ask);
        assert_eq!(config.todoist.sync_interval_minutes, 0);
        assert_eq!(config.todoist.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.todoist.default_project_id(), None);
    }

    #[test]
    fn unparsable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[todoist\nbroken").expect("write");
        let config = Config::load_from_path(&path);
        assert_eq!(config.todoist.sync_marker, DEFAULT_SYNC_MARKER);
        assert_eq!(config.todoist.conflict_policy, ConflictPolicy::RemoteWins);
    }

    #[test]
    fn set_validates_and_round_trips_through_toml() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.set("todoist.conflict_policy", "local-wins").expect("policy");
        config.set("todoist.sync_marker", "work").expect("marker");
        config.set("todoist.sync_interval_minutes", "15").expect("interval");
        config.set("todoist.default_project", " 2203306141 ").expect("project");
        assert!(config.set("todoist.sync_interval_minutes", "-1").is_err());
        assert!(config.set("todoist.conflict_policy", "merge").is_err());
        assert!(config.set("nope", "x").is_err());

        config.save_to_path(&path).expect("save");
        let loaded = Config::load_from_path(&path);
        assert_eq!(loaded.todoist.conflict_policy, ConflictPolicy::LocalWins);
        assert_eq!(loaded.todoist.sync_marker, "#work");
        assert_eq!(loaded.todoist.sync_interval_minutes, 15);
        assert_eq!(loaded.todoist.default_project_id(), Some("2203306141".to_string()));
    }
}

use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use todo_core::DeleteMode;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "todo.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteMode {
    Simulated,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub remote: RemoteMode,
    pub remote_delay_ms: u64,
    pub remote_error_percent: u32,
    pub delete_mode: DeleteMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/todo.db".into(),
            remote: RemoteMode::Simulated,
            remote_delay_ms: 2000,
            remote_error_percent: 40,
            delete_mode: DeleteMode::Soft,
        }
    }
}

impl Settings {
    pub fn remote_delay(&self) -> Duration {
        Duration::from_millis(self.remote_delay_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    database_url: Option<String>,
    remote: Option<RemoteMode>,
    remote_delay_ms: Option<u64>,
    remote_error_percent: Option<u32>,
    delete_mode: Option<DeleteMode>,
}

/// Defaults, then `path` if it exists, then the process environment.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.remote {
        settings.remote = v;
    }
    if let Some(v) = file_cfg.remote_delay_ms {
        settings.remote_delay_ms = v;
    }
    if let Some(v) = file_cfg.remote_error_percent {
        settings.remote_error_percent = v.min(100);
    }
    if let Some(v) = file_cfg.delete_mode {
        settings.delete_mode = v;
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = var("APP__REMOTE") {
        match v.trim().to_ascii_lowercase().as_str() {
            "simulated" => settings.remote = RemoteMode::Simulated,
            "offline" => settings.remote = RemoteMode::Offline,
            other => warn!(value = other, "ignoring unknown APP__REMOTE"),
        }
    }

    if let Some(v) = var("APP__REMOTE_DELAY_MS") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.remote_delay_ms = parsed,
            Err(_) => warn!(value = %v, "ignoring non-numeric APP__REMOTE_DELAY_MS"),
        }
    }

    if let Some(v) = var("APP__REMOTE_ERROR_PERCENT") {
        match v.parse::<u32>() {
            Ok(parsed) => settings.remote_error_percent = parsed.min(100),
            Err(_) => warn!(value = %v, "ignoring non-numeric APP__REMOTE_ERROR_PERCENT"),
        }
    }

    if let Some(v) = var("APP__DELETE_MODE") {
        match v.trim().to_ascii_lowercase().as_str() {
            "soft" => settings.delete_mode = DeleteMode::Soft,
            "hard" => settings.delete_mode = DeleteMode::Hard,
            other => warn!(value = other, "ignoring unknown APP__DELETE_MODE"),
        }
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        return sqlite_url_for_path(path);
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return sqlite_url_for_path(path);
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    sqlite_url_for_path(raw_database_url)
}

fn sqlite_url_for_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    if has_windows_drive_prefix(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_windows_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes.len() == 2 || bytes[2] == b'/')
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;

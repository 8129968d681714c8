//! Persistent server settings (JSON file, env overrides).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ServerSettings {
    /// WebSocket listen address.
    pub listen_addr: String,
    /// Cue-file catalogue directory. Empty means the platform default.
    pub catalog_dir: String,
    /// Path to a custom lexicon document. Empty means the built-in list.
    pub wordlist_path: String,
    /// Ollama endpoint for the contextual advisor. Empty disables it.
    pub advisor_url: String,
    pub advisor_model: String,
    /// Wire a scripted transcriber so precision recording can be exercised
    /// without a speech engine.
    pub stub_transcriber: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8765".into(),
            catalog_dir: String::new(),
            wordlist_path: String::new(),
            advisor_url: String::new(),
            advisor_model: "llama3.2:3b".into(),
            stub_transcriber: false,
        }
    }
}

impl ServerSettings {
    pub fn normalize(&mut self) {
        self.listen_addr = self.listen_addr.trim().to_string();
        if self.listen_addr.is_empty() {
            self.listen_addr = "127.0.0.1:8765".into();
        }
        self.advisor_url = self.advisor_url.trim().trim_end_matches('/').to_string();
    }

    pub fn catalog_dir(&self) -> PathBuf {
        if self.catalog_dir.trim().is_empty() {
            default_catalog_dir()
        } else {
            PathBuf::from(self.catalog_dir.trim())
        }
    }
}

pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("opencue")
        .join("server.json")
}

pub fn default_catalog_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("opencue")
        .join("cues")
}

/// Load settings from `path`, falling back to defaults on a missing or
/// unreadable file, then apply environment overrides.
pub fn load_settings(path: &Path) -> ServerSettings {
    let mut settings = std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<ServerSettings>(&raw).ok())
        .unwrap_or_default();

    if let Ok(addr) = std::env::var("OPENCUE_LISTEN_ADDR") {
        settings.listen_addr = addr;
    }
    if let Ok(dir) = std::env::var("OPENCUE_CATALOG_DIR") {
        settings.catalog_dir = dir;
    }
    if let Ok(url) = std::env::var("OPENCUE_ADVISOR_URL") {
        settings.advisor_url = url;
    }
    if std::env::var("OPENCUE_STUB_TRANSCRIBER").map(|v| v == "1").unwrap_or(false) {
        settings.stub_transcriber = true;
    }

    settings.normalize();
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = ServerSettings::default();
        assert_eq!(settings.listen_addr, "127.0.0.1:8765");
        assert!(settings.advisor_url.is_empty());
    }

    #[test]
    fn normalize_repairs_blank_listen_addr() {
        let mut settings = ServerSettings {
            listen_addr: "   ".into(),
            ..ServerSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.listen_addr, "127.0.0.1:8765");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = load_settings(Path::new("/nonexistent/opencue/server.json"));
        assert_eq!(settings.advisor_model, "llama3.2:3b");
    }
}

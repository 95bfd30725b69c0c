use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tunnelforge_terminal::{FlowControlConfig, TerminalSettings};

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnelforge")
}

pub fn config_path() -> PathBuf {
    config_dir().join("server.json")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Directory holding one subdirectory per session.
    pub control_dir: PathBuf,
    /// Act as HQ: accept remote registrations and proxy their sessions.
    pub hq_mode: bool,
    /// Bearer token required on protected routes. Open when unset.
    pub auth_token: Option<String>,
    pub peer_connect_timeout_secs: u64,
    pub flow_control: FlowControlConfig,
    pub terminal: TerminalSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4020".to_string(),
            control_dir: config_dir().join("control"),
            hq_mode: false,
            auth_token: None,
            peer_connect_timeout_secs: 5,
            flow_control: FlowControlConfig::default(),
            terminal: TerminalSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load from the default location, then apply environment overrides.
    /// A missing file is created with the defaults.
    pub fn load() -> Self {
        let path = config_path();
        let mut config = Self::load_from(&path);
        if !path.exists() {
            if let Err(e) = config.save_to(&path) {
                log::warn!("Failed to write default config to {}: {:#}", path.display(), e);
            }
        }
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Read a config file. Missing or broken files fall back to defaults.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            log::info!("Config file not found at {}, using defaults", path.display());
            return Self::default();
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                log::error!("Failed to read config file {}: {}", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("TUNNELFORGE_CONTROL_DIR") {
            self.control_dir = PathBuf::from(dir);
        }
        if let Some(addr) = var("TUNNELFORGE_LISTEN") {
            self.listen_addr = addr;
        }
        if let Some(hq) = var("TUNNELFORGE_HQ") {
            self.hq_mode = matches!(hq.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(token) = var("TUNNELFORGE_TOKEN") {
            self.auth_token = Some(token).filter(|t| !t.is_empty());
        }
    }

    /// Write atomically (temp file + rename), readable only by the owner.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        crate::persistence::write_atomic(path, content.as_bytes())
    }
}

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Persisted user configuration: currently just the last target host, so a
/// restarted bridge reconnects without retyping it.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    pub target: Option<String>,
}

impl Config {
    fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("padlink").join("config.toml"))
    }

    /// Loads the saved configuration; a missing or unreadable file yields
    /// the default.
    pub fn load() -> Self {
        let Some(path) = Self::path() else {
            return Self::default();
        };

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Ignoring unparsable config {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                debug!("No config at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self) -> io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(io::Error::other("no config directory on this platform"));
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(&path, content)
    }
}

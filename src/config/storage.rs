//! Configuration Storage
//!
//! Reads and writes the forwarding configuration as JSON.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::types::{ForwardingConfig, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

impl ForwardingConfig {
    /// Load configuration from `path`.
    ///
    /// A missing file yields the defaults. A corrupted file is backed up
    /// and replaced by the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };

        match serde_json::from_str::<Self>(&contents) {
            Ok(config) => {
                if config.version > CONFIG_VERSION {
                    return Err(ConfigError::VersionTooNew {
                        found: config.version,
                        supported: CONFIG_VERSION,
                    });
                }
                Ok(config)
            }
            Err(e) => {
                tracing::warn!("Config file corrupted: {}", e);
                match backup(path) {
                    Ok(backup_path) => tracing::warn!(
                        "Corrupted config backed up to {:?}, using defaults",
                        backup_path
                    ),
                    Err(backup_err) => {
                        tracing::error!("Failed to backup corrupted config: {}", backup_err)
                    }
                }
                Ok(Self::default())
            }
        }
    }

    /// Save configuration to `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write to temp file first, then rename (atomic write)
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self)?;

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;

        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

fn backup(path: &Path) -> Result<PathBuf, ConfigError> {
    let backup_path = path.with_extension("json.backup");
    fs::copy(path, &backup_path)?;
    Ok(backup_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let config = ForwardingConfig::load(&temp.path().join("forwarding.json")).unwrap();
        assert_eq!(config, ForwardingConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("etc").join("forwarding.json");

        let config = ForwardingConfig {
            listen_fwd_all: true,
            disable_ip_tos: true,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = ForwardingConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_corrupted_file_falls_back() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("forwarding.json");
        fs::write(&path, "{ not json").unwrap();

        let config = ForwardingConfig::load(&path).unwrap();
        assert_eq!(config, ForwardingConfig::default());
        assert!(path.with_extension("json.backup").exists());
    }

    #[test]
    fn test_newer_version_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("forwarding.json");
        fs::write(&path, format!(r#"{{"version": {}}}"#, CONFIG_VERSION + 1)).unwrap();

        assert!(matches!(
            ForwardingConfig::load(&path),
            Err(ConfigError::VersionTooNew { .. })
        ));
    }
}

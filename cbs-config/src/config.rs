use std::path::{Path, PathBuf};

use cbs_types::Error;
use serde::Deserialize;

/// Configuration consumed by the path resolver (spec §6.4).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root directory under which per-user backup files are created.
    pub backup_root: PathBuf,
    /// Explicit path to the user→path mapping database. Defaults to
    /// `<config_dir>/backups.db` when absent.
    #[serde(default)]
    pub backups_db: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from a TOML file, resolving `backups_db`
    /// relative to the file's own directory when it is given as a
    /// relative path.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|err| Error::Config(format!("invalid config file {path:?} - {err}")))?;

        if config.backup_root.as_os_str().is_empty() {
            return Err(Error::Config("backup_root must not be empty".into()));
        }

        if let Some(db) = &config.backups_db {
            if db.is_relative() {
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                config.backups_db = Some(dir.join(db));
            }
        }

        Ok(config)
    }

    /// Path to the user→path mapping database, applying the documented
    /// default relative to `config_dir`.
    pub fn backups_db_path(&self, config_dir: &Path) -> PathBuf {
        self.backups_db
            .clone()
            .unwrap_or_else(|| config_dir.join("backups.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyrus-backup.toml");
        std::fs::write(&path, "backup_root = \"/var/backups/cyrus\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.backup_root, PathBuf::from("/var/backups/cyrus"));
        assert_eq!(
            config.backups_db_path(dir.path()),
            dir.path().join("backups.db")
        );
    }

    #[test]
    fn rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyrus-backup.toml");
        std::fs::write(&path, "backup_root = \"\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}

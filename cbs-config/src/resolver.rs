use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use cbs_types::Error;

use crate::config::Config;
use crate::user_map::UserPathMap;

/// The `{data, index}` file pair for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPaths {
    pub data: PathBuf,
    pub index: PathBuf,
}

/// Maps user identifiers to their backup file pair (spec §4.3).
pub struct PathResolver {
    config: Config,
    config_dir: PathBuf,
}

impl PathResolver {
    pub fn new(config: Config, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            config_dir: config_dir.into(),
        }
    }

    /// Resolves `userid` to its backup file pair, creating one atomically
    /// on first use.
    pub fn resolve(&self, userid: &str) -> Result<UserPaths, Error> {
        if self.config.backup_root.as_os_str().is_empty() {
            return Err(Error::Config("no backup root directory configured".into()));
        }

        let db_path = self.config.backups_db_path(&self.config_dir);
        let mut map = UserPathMap::open(&db_path)?;

        if let Some(existing) = map.fetch(userid)? {
            return Ok(Self::paths_for(PathBuf::from(existing)));
        }

        let data_path = self.create_unique_path(userid)?;
        let data_fname = data_path
            .to_str()
            .ok_or_else(|| Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "backup path is not valid UTF-8",
            )))?
            .to_owned();

        if let Err(err) = map.create(userid, &data_fname) {
            // Lost a race with another process creating the same mapping,
            // or the insert otherwise failed: the file we just created is
            // now orphaned, so remove it and let the caller retry.
            let _ = std::fs::remove_file(&data_path);
            log::warn!("discarding orphaned backup file {data_path:?} after mapping failure");
            return Err(err);
        }

        Ok(Self::paths_for(data_path))
    }

    fn paths_for(data: PathBuf) -> UserPaths {
        let mut index = data.clone().into_os_string();
        index.push(".index");
        UserPaths {
            data,
            index: PathBuf::from(index),
        }
    }

    /// Creates `<root>/<2-char-hash>/<user>_XXXXXX` atomically, the way
    /// `mkstemp(3)` guarantees a fresh, exclusively-owned name even under
    /// concurrent creation from other processes.
    fn create_unique_path(&self, userid: &str) -> Result<PathBuf, Error> {
        let prefix = Self::hash_prefix(userid);
        let dir = self.config.backup_root.join(prefix);
        std::fs::create_dir_all(&dir)?;

        let named = tempfile::Builder::new()
            .prefix(&format!("{userid}_"))
            .rand_bytes(6)
            .tempfile_in(&dir)
            .map_err(Error::from)?;

        let (_file, path) = named.keep().map_err(|err| Error::Io(err.error))?;
        Ok(path)
    }

    fn hash_prefix(userid: &str) -> String {
        let mut hasher = DefaultHasher::new();
        userid.hash(&mut hasher);
        format!("{:02x}", (hasher.finish() & 0xff) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(root: &Path) -> PathResolver {
        let config = Config {
            backup_root: root.to_path_buf(),
            backups_db: None,
        };
        PathResolver::new(config, root.to_path_buf())
    }

    #[test]
    fn creates_path_pair_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());
        let paths = resolver.resolve("alice").unwrap();
        assert!(paths.data.exists());
        assert_eq!(paths.index.extension().unwrap(), "index");
    }

    #[test]
    fn second_resolve_returns_same_pair() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = resolver(dir.path());
        let first = resolver.resolve("alice").unwrap();
        let second = resolver.resolve("alice").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_empty_root() {
        let config = Config {
            backup_root: PathBuf::new(),
            backups_db: None,
        };
        let resolver = PathResolver::new(config, PathBuf::from("."));
        assert!(resolver.resolve("alice").is_err());
    }
}

//! Storage root holding the encrypted safes
//!
//! Each safe lives at `<root>/<safe path>`. The root and every directory
//! created beneath it are private to the owner. The config file and the
//! fallback agent socket may share the root, so their names are not
//! available as top-level safes.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use kickpass_agent::SafePath;
use tracing::{debug, info};

use crate::config::{CONFIG_FILE_NAME, SOCKET_FILE_NAME};
use crate::error::Error;

pub const DIR_MODE: u32 = 0o700;

/// Top-level names kickpass keeps for its own files
pub const RESERVED_NAMES: &[&str] = &[CONFIG_FILE_NAME, SOCKET_FILE_NAME];

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Initialize a new storage root
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        if root.exists() {
            return Err(Error::AlreadyExists(format!("storage {}", root.display())));
        }
        private_dir(&root)?;
        info!(storage = %root.display(), "storage initialized");
        Ok(Self { root })
    }

    /// Open an existing storage root
    pub fn init(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::NotFound(format!(
                "storage {} (run `kickpass init`)",
                root.display()
            )));
        }
        debug!(storage = %root.display(), "storage opened");
        Ok(Self { root })
    }

    pub fn fini(self) {
        debug!(storage = %self.root.display(), "storage closed");
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn engine(&self) -> &'static str {
        kickpass_crypto::engine()
    }

    pub fn version(&self) -> String {
        kickpass_crypto::version()
    }

    /// Refuse safe paths that would land on one of kickpass's own files
    pub fn check_name(&self, path: &SafePath) -> Result<(), Error> {
        let mut components = path.components();
        if let (Some(first), None) = (components.next(), components.next()) {
            if RESERVED_NAMES.contains(&first) {
                return Err(Error::InvalidInput(format!(
                    "safe name {} is reserved",
                    path
                )));
            }
        }
        Ok(())
    }

    pub fn safe_file(&self, path: &SafePath) -> PathBuf {
        path.components().fold(self.root.clone(), |file, c| file.join(c))
    }

    pub fn exists(&self, path: &SafePath) -> bool {
        self.safe_file(path).symlink_metadata().is_ok()
    }
}

/// Create `dir` and any missing parents with owner-only permissions
pub(crate) fn private_dir(dir: &Path) -> Result<(), Error> {
    DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|e| Error::io(format!("cannot create {}", dir.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_create_then_init() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");

        let storage = Storage::create(&root).unwrap();
        let mode = std::fs::metadata(storage.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, DIR_MODE);
        storage.fini();

        let storage = Storage::init(&root).unwrap();
        assert_eq!(storage.path(), root);
        assert_eq!(storage.engine(), "chacha20poly1305");
        assert_eq!(storage.version(), "1");
    }

    #[test]
    fn test_create_twice() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        Storage::create(&root).unwrap();
        let err = Storage::create(&root).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_init_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = Storage::init(dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_safe_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::create(dir.path().join("s")).unwrap();
        let path = SafePath::new("email/gmail").unwrap();

        assert_eq!(
            storage.safe_file(&path),
            dir.path().join("s").join("email").join("gmail")
        );
        assert!(!storage.exists(&path));
    }

    #[test]
    fn test_reserved_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::create(dir.path().join("s")).unwrap();

        for name in ["config.json", "agent.sock"] {
            let err = storage.check_name(&SafePath::new(name).unwrap()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
        }
        for name in ["config", "web/config.json", "agent.sock/home"] {
            assert!(storage.check_name(&SafePath::new(name).unwrap()).is_ok());
        }
    }
}

//! User configuration
//!
//! Read from `~/.kickpass/config.json` unless another file is given. A
//! missing file is not an error. `KP_STORAGE` and `KP_AGENT_SOCK` override
//! the file; `EDITOR` is only used when the file names no editor.

use std::ffi::OsString;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kickpass_crypto::envelope::{DEFAULT_ITERATIONS, MAX_ITERATIONS};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;

pub const STORAGE_DIR_NAME: &str = ".kickpass";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const SOCKET_FILE_NAME: &str = "agent.sock";
pub const DEFAULT_EDITOR: &str = "vi";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory holding the safes
    pub storage_dir: Option<PathBuf>,

    /// Editor command line, split on whitespace
    pub editor: Option<String>,

    pub agent_socket: Option<PathBuf>,

    /// PBKDF2 rounds used when a safe is written
    pub kdf_iterations: u32,

    /// Where plaintext temp files are created
    pub tmp_dir: Option<PathBuf>,

    /// Disconnect agent clients idle for this long; unset means never
    pub agent_idle_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: None,
            editor: None,
            agent_socket: None,
            kdf_iterations: DEFAULT_ITERATIONS,
            tmp_dir: None,
            agent_idle_timeout_secs: None,
        }
    }
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(STORAGE_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load `path`, or the default location when `None`, then apply the
    /// environment
    pub fn load(path: Option<&Path>) -> Result<Self, Error> {
        let config = match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        let config = config.with_overrides(|key| std::env::var_os(key));
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            debug!(config = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
        serde_json::from_str(&content).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides read through `lookup`
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let set = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(dir) = set("KP_STORAGE") {
            self.storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(sock) = set("KP_AGENT_SOCK") {
            self.agent_socket = Some(PathBuf::from(sock));
        }
        if self.editor.is_none() {
            self.editor = set("EDITOR").map(|e| e.to_string_lossy().into_owned());
        }
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.kdf_iterations == 0 || self.kdf_iterations > MAX_ITERATIONS {
            return Err(Error::InvalidInput(format!(
                "kdf_iterations must be between 1 and {}",
                MAX_ITERATIONS
            )));
        }
        if self.agent_idle_timeout_secs == Some(0) {
            return Err(Error::InvalidInput(
                "agent_idle_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn storage_dir(&self) -> Result<PathBuf, Error> {
        match &self.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::home_dir()
                .map(|home| home.join(STORAGE_DIR_NAME))
                .ok_or_else(|| Error::InvalidInput("no home directory".into())),
        }
    }

    /// `$XDG_RUNTIME_DIR/kickpass/agent.sock`, else `<storage>/agent.sock`
    pub fn agent_socket(&self) -> Result<PathBuf, Error> {
        if let Some(sock) = &self.agent_socket {
            return Ok(sock.clone());
        }
        match dirs::runtime_dir() {
            Some(run) => Ok(run.join("kickpass").join(SOCKET_FILE_NAME)),
            None => Ok(self.storage_dir()?.join(SOCKET_FILE_NAME)),
        }
    }

    pub fn editor_command(&self) -> &str {
        self.editor.as_deref().unwrap_or(DEFAULT_EDITOR)
    }

    pub fn iterations(&self) -> NonZeroU32 {
        NonZeroU32::new(self.kdf_iterations).unwrap_or(NonZeroU32::MIN)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.agent_idle_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("none.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.kdf_iterations, DEFAULT_ITERATIONS);
        assert!(config.idle_timeout().is_none());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"editor": "nano -w", "kdf_iterations": 5000}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.editor_command(), "nano -w");
        assert_eq!(config.iterations().get(), 5000);
        assert!(config.storage_dir.is_none());
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config {
            storage_dir: Some("/from/file".into()),
            ..Config::default()
        }
        .with_overrides(env(&[
            ("KP_STORAGE", "/from/env"),
            ("KP_AGENT_SOCK", "/run/kp.sock"),
            ("EDITOR", "ed"),
        ]));

        assert_eq!(config.storage_dir().unwrap(), PathBuf::from("/from/env"));
        assert_eq!(config.agent_socket().unwrap(), PathBuf::from("/run/kp.sock"));
        assert_eq!(config.editor_command(), "ed");
    }

    #[test]
    fn test_configured_editor_beats_env() {
        let config = Config {
            editor: Some("emacs".into()),
            ..Config::default()
        }
        .with_overrides(env(&[("EDITOR", "ed")]));
        assert_eq!(config.editor_command(), "emacs");

        let config = Config::default().with_overrides(env(&[]));
        assert_eq!(config.editor_command(), DEFAULT_EDITOR);
    }

    #[test]
    fn test_iteration_bounds() {
        let mut config = Config::default();
        config.kdf_iterations = 0;
        assert!(config.validate().is_err());
        config.kdf_iterations = MAX_ITERATIONS + 1;
        assert!(config.validate().is_err());
        config.kdf_iterations = MAX_ITERATIONS;
        assert!(config.validate().is_ok());
    }
}

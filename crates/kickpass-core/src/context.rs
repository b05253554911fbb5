//! Per-command context: storage root, configuration, editor and passphrase

use std::num::NonZeroU32;
use std::path::Path;

use secrecy::SecretString;

use crate::config::Config;
use crate::editor::Editor;
use crate::error::Error;
use crate::storage::Storage;

pub struct Context {
    storage: Storage,
    config: Config,
    editor: Editor,
    passphrase: Option<SecretString>,
}

impl Context {
    pub fn new(storage: Storage, config: Config) -> Result<Self, Error> {
        let editor = Editor::from_command(config.editor_command())?;
        Ok(Self {
            storage,
            config,
            editor,
            passphrase: None,
        })
    }

    pub fn with_editor(mut self, editor: Editor) -> Self {
        self.editor = editor;
        self
    }

    pub fn with_passphrase(mut self, passphrase: SecretString) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    pub fn set_passphrase(&mut self, passphrase: SecretString) {
        self.passphrase = Some(passphrase);
    }

    pub fn has_passphrase(&self) -> bool {
        self.passphrase.is_some()
    }

    pub fn passphrase(&self) -> Result<&SecretString, Error> {
        self.passphrase
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("passphrase required".into()))
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn editor(&self) -> &Editor {
        &self.editor
    }

    pub fn iterations(&self) -> NonZeroU32 {
        self.config.iterations()
    }

    pub fn tmp_dir(&self) -> Option<&Path> {
        self.config.tmp_dir.as_deref()
    }

    pub fn fini(self) {
        self.storage.fini();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("storage", &self.storage)
            .field("editor", &self.editor)
            .field("has_passphrase", &self.has_passphrase())
            .finish_non_exhaustive()
    }
}

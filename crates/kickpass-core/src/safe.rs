//! Safe lifecycle
//!
//! A safe is open while it owns a plaintext temp file. `create`, `open` and
//! `open_cached` produce an open safe; `close` writes any change back
//! through encryption and then erases the plaintext, whatever happened
//! before. Dropping an open safe erases the plaintext too.
//!
//! ```text
//! Closed --create/open/open_cached--> Open --edit*--> Open --close--> Closed
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use kickpass_agent::{SafePath, METADATA_MAX_LEN, PASSWORD_MAX_LEN};
use kickpass_crypto::envelope;
use ring::digest;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::contents::{SafeContents, RENDER_OVERHEAD, TEMPLATE};
use crate::context::Context;
use crate::error::Error;
use crate::storage::private_dir;

/// Largest plaintext body read back from the editor
///
/// Only a first guard; the password and metadata are bounded separately
/// once the body is parsed.
pub const MAX_BODY_LEN: usize = PASSWORD_MAX_LEN + METADATA_MAX_LEN + RENDER_OVERHEAD;

const WIPE_CHUNK: usize = 4096;

/// Decrypted form of a safe while it is open
pub enum Plaintext {
    File(PlaintextFile),
}

impl Plaintext {
    pub fn path(&self) -> &Path {
        match self {
            Plaintext::File(file) => file.path(),
        }
    }

    fn read(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        match self {
            Plaintext::File(file) => file.read(),
        }
    }

    fn wipe(self) -> Result<(), Error> {
        match self {
            Plaintext::File(file) => file.wipe(),
        }
    }
}

/// Owner-only temp file holding the plaintext for an external editor
pub struct PlaintextFile {
    temp: NamedTempFile,
}

impl PlaintextFile {
    fn create(dir: Option<&Path>, body: &[u8]) -> Result<Self, Error> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kickpass-");
        let temp = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(|e| Error::io("cannot create plaintext file", e))?;

        let plaintext = Self { temp };
        let mut file = plaintext.temp.as_file();
        if let Err(e) = file.write_all(body).and_then(|_| file.sync_all()) {
            if let Err(cleanup) = plaintext.wipe() {
                error!(error = %cleanup, "cannot erase partial plaintext");
            }
            return Err(Error::io("cannot write plaintext file", e));
        }
        Ok(plaintext)
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Read back what is at the path now; editors often replace the file
    fn read(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        let path = self.temp.path();
        let context = || format!("cannot read {}", path.display());

        let mut file = File::open(path).map_err(|e| Error::io(context(), e))?;
        let len = file.metadata().map_err(|e| Error::io(context(), e))?.len();
        if len > MAX_BODY_LEN as u64 {
            return Err(Error::InvalidInput(format!(
                "safe is {} bytes long, at most {} allowed",
                len, MAX_BODY_LEN
            )));
        }

        let mut body = Zeroizing::new(vec![0u8; len as usize]);
        file.read_exact(&mut body)
            .map_err(|e| Error::io(context(), e))?;
        Ok(body)
    }

    /// Overwrite with zeros, sync, then unlink
    ///
    /// Both the inode behind the path and the one we hold open are zeroed,
    /// since they differ once an editor has replaced the file.
    fn wipe(self) -> Result<(), Error> {
        let path = self.temp.path().to_path_buf();

        let by_path = match OpenOptions::new().write(true).open(&path) {
            Ok(file) => zero_fill(&file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        let by_handle = zero_fill(self.temp.as_file());
        let removed = match self.temp.close() {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        };

        by_path
            .and(by_handle)
            .and(removed)
            .map_err(|source| Error::Cleanup {
                path: path.clone(),
                source,
            })?;
        debug!(plaintext = %path.display(), "plaintext erased");
        Ok(())
    }
}

fn zero_fill(mut file: &File) -> io::Result<()> {
    let mut left = file.metadata()?.len();
    let zeros = [0u8; WIPE_CHUNK];

    file.seek(SeekFrom::Start(0))?;
    while left > 0 {
        let n = left.min(WIPE_CHUNK as u64) as usize;
        file.write_all(&zeros[..n])?;
        left -= n as u64;
    }
    file.sync_all()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// First write of a new safe; an existing file is never clobbered
    Create,
    Replace,
}

/// Encrypted on-disk form of a safe
#[derive(Debug)]
pub struct Ciphertext {
    file: PathBuf,
    mode: PersistMode,
    /// Passphrase known to decrypt the current file
    verified: bool,
}

impl Ciphertext {
    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn mode(&self) -> PersistMode {
        self.mode
    }

    fn read(&self, path: &SafePath) -> Result<Vec<u8>, Error> {
        std::fs::read(&self.file).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(format!("safe {}", path)),
            _ => Error::io(format!("cannot read {}", self.file.display()), e),
        })
    }

    /// Atomically replace the file through a sibling temp file
    fn write(&self, path: &SafePath, sealed: &[u8]) -> Result<(), Error> {
        let dir = self
            .file
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("safe {} has no parent", path)))?;
        private_dir(dir)?;

        let context = || format!("cannot write {}", self.file.display());
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(context(), e))?;
        tmp.write_all(sealed)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Error::io(context(), e))?;

        let persisted = match self.mode {
            PersistMode::Create => tmp.persist_noclobber(&self.file),
            PersistMode::Replace => tmp.persist(&self.file),
        };
        persisted.map_err(|e| match e.error.kind() {
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(format!("safe {}", path)),
            _ => Error::io(context(), e.error),
        })?;
        Ok(())
    }
}

pub struct Safe {
    path: SafePath,
    ciphertext: Ciphertext,
    plaintext: Option<Plaintext>,
    /// Digest of the plaintext as opened; `None` for a new safe
    baseline: Option<digest::Digest>,
}

impl Safe {
    /// Start a new safe from the template
    ///
    /// Nothing is written to storage before `close`.
    pub fn create(ctx: &Context, path: &str) -> Result<Self, Error> {
        let path = safe_path(ctx, path)?;
        if ctx.storage().exists(&path) {
            return Err(Error::AlreadyExists(format!("safe {}", path)));
        }

        let plaintext = PlaintextFile::create(ctx.tmp_dir(), TEMPLATE.as_bytes())?;
        debug!(safe = %path, "safe created");
        Ok(Self {
            ciphertext: Ciphertext {
                file: ctx.storage().safe_file(&path),
                mode: PersistMode::Create,
                verified: true,
            },
            path,
            plaintext: Some(Plaintext::File(plaintext)),
            baseline: None,
        })
    }

    /// Decrypt a stored safe with the context passphrase
    pub fn open(ctx: &Context, path: &str) -> Result<Self, Error> {
        let path = safe_path(ctx, path)?;
        let ciphertext = Ciphertext {
            file: ctx.storage().safe_file(&path),
            mode: PersistMode::Replace,
            verified: true,
        };

        let sealed = ciphertext.read(&path)?;
        let body = envelope::open(ctx.passphrase()?, &sealed)?;
        debug!(safe = %path, "safe decrypted");
        Self::opened(ctx, path, ciphertext, &body)
    }

    /// Open a stored safe from contents the agent had cached
    pub fn open_cached(ctx: &Context, path: &str, contents: &SafeContents) -> Result<Self, Error> {
        let path = safe_path(ctx, path)?;
        if !ctx.storage().exists(&path) {
            return Err(Error::NotFound(format!("safe {}", path)));
        }
        let ciphertext = Ciphertext {
            file: ctx.storage().safe_file(&path),
            mode: PersistMode::Replace,
            verified: false,
        };

        debug!(safe = %path, "safe opened from agent cache");
        Self::opened(ctx, path, ciphertext, &contents.render())
    }

    fn opened(
        ctx: &Context,
        path: SafePath,
        ciphertext: Ciphertext,
        body: &[u8],
    ) -> Result<Self, Error> {
        let plaintext = PlaintextFile::create(ctx.tmp_dir(), body)?;
        Ok(Self {
            path,
            ciphertext,
            plaintext: Some(Plaintext::File(plaintext)),
            baseline: Some(digest::digest(&digest::SHA256, body)),
        })
    }

    pub fn path(&self) -> &SafePath {
        &self.path
    }

    pub fn ciphertext(&self) -> &Ciphertext {
        &self.ciphertext
    }

    pub fn is_open(&self) -> bool {
        self.plaintext.is_some()
    }

    pub fn plaintext_path(&self) -> Option<&Path> {
        self.plaintext.as_ref().map(Plaintext::path)
    }

    /// Hand the plaintext to the configured editor and wait for it
    pub async fn edit(&mut self, ctx: &Context) -> Result<(), Error> {
        let plaintext = self.plaintext.as_ref().ok_or_else(|| self.not_open())?;
        ctx.editor().edit(plaintext.path()).await
    }

    pub fn contents(&self) -> Result<SafeContents, Error> {
        let plaintext = self.plaintext.as_ref().ok_or_else(|| self.not_open())?;
        let contents = SafeContents::parse(&plaintext.read()?);
        contents.check_bounds()?;
        Ok(contents)
    }

    /// Save changes and erase the plaintext
    ///
    /// The plaintext is erased even when saving fails; the save error is
    /// the one returned. Closing a closed safe does nothing.
    pub fn close(&mut self, ctx: &Context) -> Result<(), Error> {
        let Some(plaintext) = self.plaintext.take() else {
            return Ok(());
        };

        let saved = self.save(ctx, &plaintext);
        let wiped = plaintext.wipe();
        close_outcome(&self.path, saved, wiped)
    }

    /// Whether `close` would write the safe back to storage
    pub fn is_modified(&self) -> Result<bool, Error> {
        let plaintext = self.plaintext.as_ref().ok_or_else(|| self.not_open())?;
        Ok(self.differs(&plaintext.read()?))
    }

    fn differs(&self, body: &[u8]) -> bool {
        match &self.baseline {
            Some(baseline) => digest::digest(&digest::SHA256, body).as_ref() != baseline.as_ref(),
            None => true,
        }
    }

    fn save(&mut self, ctx: &Context, plaintext: &Plaintext) -> Result<(), Error> {
        let body = plaintext.read()?;
        if !self.differs(&body) {
            debug!(safe = %self.path, "unchanged, not re-encrypting");
            return Ok(());
        }
        SafeContents::parse(&body).check_bounds()?;

        let passphrase = ctx.passphrase()?;
        if !self.ciphertext.verified {
            envelope::open(passphrase, &self.ciphertext.read(&self.path)?)?;
            self.ciphertext.verified = true;
        }

        let sealed = envelope::seal(passphrase, &body, ctx.iterations())?;
        self.ciphertext.write(&self.path, &sealed)?;
        info!(safe = %self.path, "safe saved");
        Ok(())
    }

    fn not_open(&self) -> Error {
        Error::InvalidInput(format!("safe {} is not open", self.path))
    }
}

fn safe_path(ctx: &Context, raw: &str) -> Result<SafePath, Error> {
    let path = SafePath::new(raw)?;
    ctx.storage().check_name(&path)?;
    Ok(path)
}

/// Merge the save and wipe results of `close`; the save error wins
fn close_outcome(
    path: &SafePath,
    saved: Result<(), Error>,
    wiped: Result<(), Error>,
) -> Result<(), Error> {
    match (saved, wiped) {
        (Ok(()), wiped) => wiped,
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => {
            error!(safe = %path, error = %cleanup, "plaintext left behind");
            Err(e)
        }
    }
}

impl Drop for Safe {
    fn drop(&mut self) {
        if let Some(plaintext) = self.plaintext.take() {
            warn!(safe = %self.path, "safe dropped while open, discarding changes");
            if let Err(e) = plaintext.wipe() {
                error!(safe = %self.path, error = %e, "plaintext left behind");
            }
        }
    }
}

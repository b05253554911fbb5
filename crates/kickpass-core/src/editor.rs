//! External editor invocation
//!
//! The editor is run on the plaintext temp file with the terminal inherited,
//! and the caller waits for it to exit. What the user writes is not
//! inspected here.

use std::path::Path;

use tracing::debug;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Editor {
    program: String,
    args: Vec<String>,
}

impl Editor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse an editor command line such as `"code --wait"`
    pub fn from_command(command: &str) -> Result<Self, Error> {
        let mut words = command.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| Error::InvalidInput("empty editor command".into()))?;
        Ok(Self::new(program, words.map(str::to_string).collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the editor on `file` and wait for it
    pub async fn edit(&self, file: &Path) -> Result<(), Error> {
        debug!(editor = %self.program, "spawning editor");

        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(file)
            .status()
            .await
            .map_err(|e| Error::io(format!("cannot spawn editor {}", self.program), e))?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::Editor {
                program: self.program.clone(),
                status: status.to_string(),
            })
        }
    }
}

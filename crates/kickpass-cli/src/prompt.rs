//! Passphrase prompts on the controlling terminal

use anyhow::{bail, Context, Result};
use kickpass_core::Error;
use secrecy::{ExposeSecret, SecretString};

pub fn passphrase() -> Result<SecretString> {
    read("passphrase: ")
}

/// Ask twice and insist on a match
pub fn new_passphrase() -> Result<SecretString> {
    let first = read("passphrase: ")?;
    let second = read("confirm passphrase: ")?;
    check_confirmation(first, &second)
}

fn read(prompt: &str) -> Result<SecretString> {
    let input = rpassword::prompt_password(prompt).context("cannot read passphrase")?;
    let input = SecretString::new(input);
    if input.expose_secret().is_empty() {
        bail!(Error::InvalidInput("empty passphrase".into()));
    }
    Ok(input)
}

fn check_confirmation(first: SecretString, second: &SecretString) -> Result<SecretString> {
    if first.expose_secret() != second.expose_secret() {
        bail!(Error::InvalidInput("passphrases do not match".into()));
    }
    Ok(first)
}

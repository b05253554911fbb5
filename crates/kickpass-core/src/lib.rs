//! kickpass core
//!
//! Safe lifecycle on top of the storage root: create, open, edit and close
//! encrypted safes, with the agent as an optional cache in front.

pub mod agent_link;
pub mod config;
pub mod contents;
pub mod context;
pub mod editor;
pub mod error;
pub mod safe;
pub mod storage;

pub use agent_link::AgentLink;
pub use config::Config;
pub use contents::{SafeContents, TEMPLATE};
pub use context::Context;
pub use editor::Editor;
pub use error::{Error, ErrorKind};
pub use safe::{Ciphertext, PersistMode, Plaintext, Safe};
pub use storage::Storage;

pub use kickpass_agent::SafePath;

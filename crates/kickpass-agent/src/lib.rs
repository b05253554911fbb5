//! kickpass agent
//!
//! A per-user daemon that keeps decrypted safes in guarded memory so they
//! can be reopened without retyping the passphrase. Clients talk to it
//! over a Unix socket using length-prefixed frames.

pub mod cache;
pub mod channel;
pub mod codec;
pub mod error;
pub mod message;
pub mod path;
pub mod server;

pub use cache::{AgentSafe, SecretCache};
pub use channel::{AgentChannel, Received};
pub use codec::{Frame, FrameCodec, MessageType};
pub use error::{AgentError, ProtocolError};
pub use message::{Message, SafeRecord};
pub use path::{PathError, SafePath, METADATA_MAX_LEN, PASSWORD_MAX_LEN, PATH_MAX_LEN};
pub use server::AgentServer;

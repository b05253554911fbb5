//! Agent connection
//!
//! An `AgentChannel` is one conversation with the agent over its Unix
//! socket. Clients create one with `init` + `connect`; the server wraps
//! every accepted stream in one as well. Each message is a single frame;
//! `send` returns once the frame is flushed to the socket, not once the
//! peer has processed it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::codec::FrameCodec;
use crate::error::{AgentError, ProtocolError};
use crate::message::{Message, SafeRecord};
use crate::path::SafePath;

static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

fn next_message_id() -> u32 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Longest path `sockaddr_un` can hold, terminating NUL excluded
fn sun_path_max() -> usize {
    // Safety: sockaddr_un is plain old data, all-zero is a valid value
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len() - 1
}

/// Reject socket paths the kernel would refuse
pub fn check_socket_path(path: &Path) -> Result<(), AgentError> {
    if path.as_os_str().is_empty() || path.as_os_str().len() > sun_path_max() {
        return Err(AgentError::PathTooLong(path.to_path_buf()));
    }
    Ok(())
}

/// A message read off the channel with its frame header fields
#[derive(Debug)]
pub struct Received {
    pub id: u32,
    pub pid: u32,
    pub message: Message,
}

pub struct AgentChannel {
    socket_path: PathBuf,
    framed: Option<Framed<UnixStream, FrameCodec>>,
}

impl AgentChannel {
    /// Prepare a channel to the agent listening on `socket_path`
    pub fn init(socket_path: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let socket_path = socket_path.into();
        check_socket_path(&socket_path)?;
        Ok(Self {
            socket_path,
            framed: None,
        })
    }

    /// Wrap a stream accepted by the server
    pub(crate) fn accepted(stream: UnixStream, socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            framed: Some(Framed::new(stream, FrameCodec)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.framed.is_some()
    }

    pub async fn connect(&mut self) -> Result<(), AgentError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| AgentError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        self.framed = Some(Framed::new(stream, FrameCodec));
        debug!(socket = %self.socket_path.display(), "connected to agent");
        Ok(())
    }

    /// Send one message with a fresh id, returning that id
    pub async fn send(&mut self, message: &Message) -> Result<u32, AgentError> {
        let id = next_message_id();
        self.send_with_id(id, message).await?;
        Ok(id)
    }

    /// Send a reply correlated to request `id`
    pub async fn reply(&mut self, id: u32, message: &Message) -> Result<(), AgentError> {
        self.send_with_id(id, message).await
    }

    async fn send_with_id(&mut self, id: u32, message: &Message) -> Result<(), AgentError> {
        let framed = self.framed.as_mut().ok_or(AgentError::NotConnected)?;
        let frame = message.to_frame(id, std::process::id())?;
        framed.send(frame).await?;
        debug!(id, kind = message.kind().name(), safe = %message.path(), "sent message");
        Ok(())
    }

    /// Wait for the next message; `None` once the peer has hung up
    pub async fn recv(&mut self) -> Result<Option<Received>, AgentError> {
        let framed = self.framed.as_mut().ok_or(AgentError::NotConnected)?;
        let frame = match framed.next().await {
            Some(frame) => frame?,
            None => return Ok(None),
        };
        let message = Message::from_frame(&frame)?;
        Ok(Some(Received {
            id: frame.id,
            pid: frame.pid,
            message,
        }))
    }

    /// Flush and shut the connection down; closing twice is harmless
    pub async fn close(&mut self) -> Result<(), AgentError> {
        if let Some(mut framed) = self.framed.take() {
            SinkExt::<crate::codec::Frame>::close(&mut framed).await?;
        }
        Ok(())
    }

    /// Ask the agent to remember a decrypted safe
    pub async fn store(&mut self, record: SafeRecord) -> Result<(), AgentError> {
        self.send(&Message::Store(record)).await?;
        Ok(())
    }

    /// Ask the agent for a cached safe
    pub async fn fetch(&mut self, path: &SafePath) -> Result<Option<SafeRecord>, AgentError> {
        let id = self.send(&Message::Fetch(path.clone())).await?;

        let received = self
            .recv()
            .await?
            .ok_or(ProtocolError::Unexpected("end of stream"))?;
        if received.id != id {
            return Err(ProtocolError::Uncorrelated {
                expected: id,
                got: received.id,
            }
            .into());
        }

        match received.message {
            Message::Found(record) if &record.path == path => Ok(Some(record)),
            Message::Missing(missing) if &missing == path => Ok(None),
            other => Err(ProtocolError::Unexpected(other.kind().name()).into()),
        }
    }

    /// Ask the agent to forget a cached safe
    pub async fn discard(&mut self, path: &SafePath) -> Result<(), AgentError> {
        self.send(&Message::Discard(path.clone())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_bounds() {
        assert!(check_socket_path(Path::new("/tmp/kickpass/agent.sock")).is_ok());
        let long = PathBuf::from(format!("/tmp/{}", "x".repeat(200)));
        assert!(matches!(
            AgentChannel::init(long),
            Err(AgentError::PathTooLong(_))
        ));
    }

    #[test]
    fn test_message_ids_increase() {
        let a = next_message_id();
        let b = next_message_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let mut channel = AgentChannel::init("/tmp/kickpass-test.sock").unwrap();
        assert!(!channel.is_connected());
        let err = channel
            .send(&Message::Fetch(SafePath::new("a").unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_without_agent() {
        let dir = tempfile::tempdir().unwrap();
        let mut channel = AgentChannel::init(dir.path().join("none.sock")).unwrap();
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, AgentError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_close_twice() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut channel = AgentChannel::accepted(a, Path::new("/tmp/pair.sock"));
        assert!(channel.is_connected());
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_fetch_correlates_reply() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut client = AgentChannel::accepted(client, Path::new("/tmp/pair.sock"));
        let mut server = AgentChannel::accepted(server, Path::new("/tmp/pair.sock"));

        let responder = tokio::spawn(async move {
            let request = server.recv().await.unwrap().unwrap();
            assert_eq!(request.pid, std::process::id());
            let record = SafeRecord::new(request.message.path().clone(), b"p@ss", b"url: x");
            server
                .reply(request.id, &Message::Found(record))
                .await
                .unwrap();
        });

        let path = SafePath::new("email/gmail").unwrap();
        let record = client.fetch(&path).await.unwrap().unwrap();
        assert_eq!(record.password.as_slice(), b"p@ss");
        responder.await.unwrap();
    }
}

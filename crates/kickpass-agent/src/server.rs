//! Agent server
//!
//! Listens on a Unix socket and serves cached safes to local clients.
//! Each accepted connection runs in its own task; they all share one
//! `SecretCache`. A client that breaks the protocol is disconnected
//! without touching the cache or the other clients.

use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::SecretCache;
use crate::channel::{check_socket_path, AgentChannel, Received};
use crate::error::{AgentError, ProtocolError};
use crate::message::{Message, SafeRecord};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct AgentServer {
    listener: UnixListener,
    socket_path: PathBuf,
    cache: Arc<SecretCache>,
    idle_timeout: Option<Duration>,
}

impl AgentServer {
    /// Bind the agent socket
    ///
    /// A leftover socket file nobody listens on is replaced; a live one
    /// makes this fail with `AlreadyRunning`.
    pub async fn bind(
        socket_path: impl Into<PathBuf>,
        cache: Arc<SecretCache>,
    ) -> Result<Self, AgentError> {
        let socket_path = socket_path.into();
        check_socket_path(&socket_path)?;
        let listen_err = |source: std::io::Error| AgentError::Listen {
            path: socket_path.clone(),
            source,
        };

        if socket_path.exists() {
            if UnixStream::connect(&socket_path).await.is_ok() {
                return Err(AgentError::AlreadyRunning(socket_path.clone()));
            }
            debug!(socket = %socket_path.display(), "removing stale socket");
            std::fs::remove_file(&socket_path).map_err(listen_err)?;
        }

        if let Some(parent) = socket_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(parent)
                .map_err(listen_err)?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(listen_err)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(listen_err)?;

        info!(socket = %socket_path.display(), "agent listening");
        Ok(Self {
            listener,
            socket_path,
            cache,
            idle_timeout: None,
        })
    }

    /// Drop clients that stay silent for longer than `timeout`
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn cache(&self) -> &Arc<SecretCache> {
        &self.cache
    }

    /// Serve clients until `shutdown` is cancelled, then wipe the cache
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let mut connections = JoinSet::new();
        let mut next_conn: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        next_conn += 1;
                        let peer_pid = stream
                            .peer_cred()
                            .ok()
                            .and_then(|cred| cred.pid())
                            .and_then(|pid| u32::try_from(pid).ok());
                        let session = Session {
                            conn: next_conn,
                            peer_pid,
                            channel: AgentChannel::accepted(stream, &self.socket_path),
                            cache: Arc::clone(&self.cache),
                            idle_timeout: self.idle_timeout,
                        };
                        connections.spawn(session.run(shutdown.child_token()));
                    }
                    Err(e) => {
                        // Usually descriptor exhaustion
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }

        info!("agent shutting down");
        connections.shutdown().await;
        let wiped = self.cache.clear();
        debug!(wiped, "cache cleared");
        Ok(())
    }
}

impl Drop for AgentServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!(socket = %self.socket_path.display(), error = %e, "socket already gone");
        }
    }
}

/// Per-client state on the server side
struct Session {
    conn: u64,
    peer_pid: Option<u32>,
    channel: AgentChannel,
    cache: Arc<SecretCache>,
    idle_timeout: Option<Duration>,
}

impl Session {
    async fn run(mut self, shutdown: CancellationToken) {
        let conn = self.conn;
        debug!(conn, peer_pid = ?self.peer_pid, "client connected");

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = self.recv() => next,
            };

            let Received { id, pid, message } = match next {
                Ok(Some(received)) => received,
                Ok(None) => {
                    debug!(conn, "client disconnected");
                    break;
                }
                Err(e) => {
                    warn!(conn, error = %e, "dropping client");
                    break;
                }
            };

            if let Some(peer) = self.peer_pid.filter(|peer| *peer != pid) {
                warn!(conn, claimed = pid, peer, "frame pid does not match peer");
            }
            debug!(conn, id, kind = message.kind().name(), safe = %message.path(), "request");

            match respond(&self.cache, message) {
                Ok(Some(reply)) => {
                    if let Err(e) = self.channel.reply(id, &reply).await {
                        warn!(conn, error = %e, "cannot reply to client");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(conn, error = %e, "dropping client after protocol violation");
                    break;
                }
            }
        }

        if let Err(e) = self.channel.close().await {
            debug!(conn, error = %e, "close failed");
        }
    }

    async fn recv(&mut self) -> Result<Option<Received>, AgentError> {
        match self.idle_timeout {
            None => self.channel.recv().await,
            Some(limit) => match tokio::time::timeout(limit, self.channel.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    debug!(conn = self.conn, "client idle, disconnecting");
                    Ok(None)
                }
            },
        }
    }
}

/// Apply one request to the cache and build the reply, if the request has one
///
/// Store and Discard are fire and forget. Found and Missing are replies and
/// never valid as requests.
pub fn respond(cache: &SecretCache, message: Message) -> Result<Option<Message>, ProtocolError> {
    match message {
        Message::Store(record) => {
            let path = record.path.clone();
            match cache.allocate(record.path, &record.password, &record.metadata) {
                Ok(safe) => {
                    cache.store(safe);
                }
                Err(e) => warn!(safe = %path, error = %e, "cannot cache safe"),
            }
            Ok(None)
        }
        Message::Fetch(path) => {
            let found = cache.lookup(path.as_str(), |safe| {
                SafeRecord::new(safe.path().clone(), safe.password(), safe.metadata())
            });
            Ok(Some(match found {
                Some(record) => Message::Found(record),
                None => Message::Missing(path),
            }))
        }
        Message::Discard(path) => {
            cache.remove(path.as_str());
            Ok(None)
        }
        other @ (Message::Found(_) | Message::Missing(_)) => {
            Err(ProtocolError::Unexpected(other.kind().name()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{SafePath, PASSWORD_MAX_LEN};

    fn path(p: &str) -> SafePath {
        SafePath::new(p).unwrap()
    }

    fn store(cache: &SecretCache, p: &str, pw: &str, md: &str) {
        let reply = respond(
            cache,
            Message::Store(SafeRecord::new(path(p), pw.as_bytes(), md.as_bytes())),
        )
        .unwrap();
        assert!(reply.is_none());
    }

    #[test]
    fn test_store_then_fetch() {
        let cache = SecretCache::new();
        store(&cache, "email/gmail", "p@ss", "url: gmail.com");

        let reply = respond(&cache, Message::Fetch(path("email/gmail"))).unwrap();
        match reply {
            Some(Message::Found(record)) => {
                assert_eq!(record.password.as_slice(), b"p@ss");
                assert_eq!(record.metadata.as_slice(), b"url: gmail.com");
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_fetch_unknown_is_missing() {
        let cache = SecretCache::new();
        let reply = respond(&cache, Message::Fetch(path("nope"))).unwrap();
        assert_eq!(reply, Some(Message::Missing(path("nope"))));
    }

    #[test]
    fn test_discard() {
        let cache = SecretCache::new();
        store(&cache, "a", "1", "");
        assert!(respond(&cache, Message::Discard(path("a"))).unwrap().is_none());
        assert!(cache.is_empty());
        // discarding again is not an error
        assert!(respond(&cache, Message::Discard(path("a"))).unwrap().is_none());
    }

    #[test]
    fn test_replies_are_not_requests() {
        let cache = SecretCache::new();
        let err = respond(&cache, Message::Missing(path("a"))).unwrap_err();
        assert_eq!(err, ProtocolError::Unexpected("missing"));
        let found = Message::Found(SafeRecord::new(path("a"), b"x", b""));
        assert!(respond(&cache, found).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_uncacheable_store_is_dropped() {
        let cache = SecretCache::new();
        let record = SafeRecord {
            path: path("a"),
            password: zeroize::Zeroizing::new(vec![b'x'; PASSWORD_MAX_LEN + 1]),
            metadata: zeroize::Zeroizing::new(Vec::new()),
        };
        assert!(respond(&cache, Message::Store(record)).unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_second_agent_refused() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("agent.sock");
        let first = AgentServer::bind(&sock, Arc::new(SecretCache::new()))
            .await
            .unwrap();

        let err = AgentServer::bind(&sock, Arc::new(SecretCache::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::AlreadyRunning(_)));
        drop(first);
        assert!(!sock.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("agent.sock");
        // bound then dropped without unlinking leaves a dead socket file
        drop(std::os::unix::net::UnixListener::bind(&sock).unwrap());
        assert!(sock.exists());

        let server = AgentServer::bind(&sock, Arc::new(SecretCache::new()))
            .await
            .unwrap();
        let mode = std::fs::metadata(server.socket_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_idle_client_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("agent.sock");
        let server = AgentServer::bind(&sock, Arc::new(SecretCache::new()))
            .await
            .unwrap()
            .with_idle_timeout(Some(Duration::from_millis(50)));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));

        let mut client = AgentChannel::init(&sock).unwrap();
        client.connect().await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_none());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}

//! End-to-end agent exchanges over a real Unix socket

use std::sync::Arc;
use std::time::Duration;

use kickpass_agent::{AgentChannel, AgentServer, SafePath, SafeRecord, SecretCache};
use tokio_util::sync::CancellationToken;

struct Running {
    _dir: tempfile::TempDir,
    socket: std::path::PathBuf,
    cache: Arc<SecretCache>,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<Result<(), kickpass_agent::AgentError>>,
}

async fn start_agent() -> Running {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("agent.sock");
    let cache = Arc::new(SecretCache::new());
    let server = AgentServer::bind(&socket, Arc::clone(&cache)).await.unwrap();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(server.run(shutdown.clone()));
    Running {
        _dir: dir,
        socket,
        cache,
        shutdown,
        task,
    }
}

async fn client(agent: &Running) -> AgentChannel {
    let mut channel = AgentChannel::init(&agent.socket).unwrap();
    channel.connect().await.unwrap();
    channel
}

#[tokio::test]
async fn test_store_then_fetch_over_socket() {
    let agent = start_agent().await;
    let gmail = SafePath::new("email/gmail").unwrap();

    let mut channel = client(&agent).await;
    channel
        .store(SafeRecord::new(gmail.clone(), b"p@ss", b"url: gmail.com"))
        .await
        .unwrap();

    // requests on one connection are served in order, so the store has landed
    let record = channel.fetch(&gmail).await.unwrap().unwrap();
    assert_eq!(record.password.as_slice(), b"p@ss");
    assert_eq!(record.metadata.as_slice(), b"url: gmail.com");

    let cached = agent.cache.lookup("email/gmail", |s| s.password().to_vec());
    assert_eq!(cached.as_deref(), Some(&b"p@ss"[..]));

    channel.close().await.unwrap();
    agent.shutdown.cancel();
    agent.task.await.unwrap().unwrap();
    assert!(agent.cache.is_empty());
    assert!(!agent.socket.exists());
}

#[tokio::test]
async fn test_cache_shared_between_clients() {
    let agent = start_agent().await;
    let bank = SafePath::new("bank").unwrap();

    let mut writer = client(&agent).await;
    writer
        .store(SafeRecord::new(bank.clone(), b"1234", b""))
        .await
        .unwrap();
    writer.close().await.unwrap();

    let mut reader = client(&agent).await;
    let mut found = None;
    for _ in 0..50 {
        found = reader.fetch(&bank).await.unwrap();
        if found.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(found.unwrap().password.as_slice(), b"1234");

    reader.discard(&bank).await.unwrap();
    assert!(reader.fetch(&bank).await.unwrap().is_none());

    agent.shutdown.cancel();
    agent.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_misbehaving_client_does_not_disturb_others() {
    use tokio::io::AsyncWriteExt;

    let agent = start_agent().await;
    let path = SafePath::new("a").unwrap();

    let mut good = client(&agent).await;
    good.store(SafeRecord::new(path.clone(), b"pw", b""))
        .await
        .unwrap();
    assert!(good.fetch(&path).await.unwrap().is_some());

    // a frame header announcing a huge length gets the sender dropped
    let mut bad = tokio::net::UnixStream::connect(&agent.socket).await.unwrap();
    bad.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
    bad.write_all(&[0u8; 12]).await.unwrap();

    let record = good.fetch(&path).await.unwrap().unwrap();
    assert_eq!(record.password.as_slice(), b"pw");

    agent.shutdown.cancel();
    agent.task.await.unwrap().unwrap();
}

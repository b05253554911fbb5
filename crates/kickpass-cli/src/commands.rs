//! Command implementations
//!
//! Every command that reads a safe asks the agent first and falls back to
//! decrypting from storage. Refreshing the agent afterwards is best effort.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use kickpass_agent::{AgentServer, SecretCache};
use kickpass_core::{AgentLink, Config, Context, Error, Safe, SafeContents, SafePath, Storage};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::prompt;

fn context(config: Config) -> Result<Context> {
    let storage = Storage::init(config.storage_dir()?)?;
    Ok(Context::new(storage, config)?)
}

async fn agent_link(config: &Config) -> Option<AgentLink> {
    let socket = match config.agent_socket() {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "no agent socket");
            return None;
        }
    };
    match AgentLink::connect(&socket).await {
        Ok(link) => link,
        Err(e) => {
            warn!(error = %e, "agent unavailable");
            None
        }
    }
}

async fn cached(link: &mut Option<AgentLink>, path: &SafePath) -> Option<SafeContents> {
    let agent = link.as_mut()?;
    match agent.fetch(path).await {
        Ok(found) => found,
        Err(e) => {
            warn!(safe = %path, error = %e, "agent lookup failed");
            *link = None;
            None
        }
    }
}

async fn remember(link: Option<AgentLink>, path: &SafePath, contents: &SafeContents) {
    let Some(mut agent) = link else { return };
    if let Err(e) = agent.remember(path, contents).await {
        warn!(safe = %path, error = %e, "cannot refresh agent cache");
    }
    if let Err(e) = agent.close().await {
        warn!(error = %e, "cannot close agent connection");
    }
}

pub fn init(config: &Config) -> Result<()> {
    let storage = Storage::create(config.storage_dir()?)?;
    println!("storage initialized in {}", storage.path().display());
    storage.fini();
    Ok(())
}

pub async fn create(config: Config, name: &str) -> Result<()> {
    let mut ctx = context(config)?;
    let mut safe = Safe::create(&ctx, name)?;

    ctx.set_passphrase(prompt::new_passphrase()?);
    safe.edit(&ctx).await?;
    let contents = safe.contents()?;
    safe.close(&ctx)
        .with_context(|| format!("cannot save safe {}", name))?;

    let link = agent_link(ctx.config()).await;
    remember(link, safe.path(), &contents).await;
    ctx.fini();
    Ok(())
}

pub async fn edit(config: Config, name: &str) -> Result<()> {
    let mut ctx = context(config)?;
    let path = SafePath::new(name).map_err(Error::from)?;
    let mut link = agent_link(ctx.config()).await;

    let mut safe = match cached(&mut link, &path).await {
        Some(contents) => Safe::open_cached(&ctx, name, &contents)?,
        None => {
            ctx.set_passphrase(prompt::passphrase()?);
            Safe::open(&ctx, name)?
        }
    };

    safe.edit(&ctx).await?;
    if safe.is_modified()? && !ctx.has_passphrase() {
        ctx.set_passphrase(prompt::passphrase()?);
    }
    let contents = safe.contents()?;
    safe.close(&ctx)
        .with_context(|| format!("cannot save safe {}", name))?;

    remember(link, &path, &contents).await;
    ctx.fini();
    Ok(())
}

pub async fn cat(config: Config, name: &str, password: bool) -> Result<()> {
    let mut ctx = context(config)?;
    let path = SafePath::new(name).map_err(Error::from)?;
    let mut link = agent_link(ctx.config()).await;

    let contents = match cached(&mut link, &path).await {
        Some(contents) => contents,
        None => {
            ctx.set_passphrase(prompt::passphrase()?);
            let mut safe = Safe::open(&ctx, name)?;
            let contents = safe.contents();
            safe.close(&ctx)?;
            let contents = contents?;
            remember(link, &path, &contents).await;
            contents
        }
    };

    let mut out = std::io::stdout().lock();
    if password {
        out.write_all(contents.password())?;
        out.write_all(b"\n")?;
    } else {
        out.write_all(contents.metadata())?;
    }
    out.flush()?;
    ctx.fini();
    Ok(())
}

pub async fn forget(config: &Config, name: &str) -> Result<()> {
    let path = SafePath::new(name).map_err(Error::from)?;
    match agent_link(config).await {
        Some(mut agent) => {
            agent.forget(&path).await?;
            agent.close().await?;
        }
        None => println!("no agent running"),
    }
    Ok(())
}

pub async fn agent(config: &Config) -> Result<()> {
    let socket = config.agent_socket()?;
    let cache = Arc::new(SecretCache::new());
    let server = AgentServer::bind(&socket, cache)
        .await
        .map_err(Error::from)?
        .with_idle_timeout(config.idle_timeout());

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });

    info!(socket = %socket.display(), "agent started");
    server.run(shutdown).await.map_err(Error::from)?;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot watch SIGTERM");
            if let Err(e) = ctrl_c.await {
                warn!(error = %e, "cannot watch ctrl-c");
            }
        }
    }
}

pub fn version(config: &Config) -> Result<()> {
    println!("kickpass version {}", env!("CARGO_PKG_VERSION"));

    let root = config.storage_dir()?;
    match Storage::init(&root) {
        Ok(storage) => {
            println!("storage engine {} {}", storage.engine(), storage.version());
            storage.fini();
        }
        Err(_) => println!("storage not initialized in {}", root.display()),
    }
    Ok(())
}

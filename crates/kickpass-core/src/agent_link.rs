//! Client side of the agent cache
//!
//! The agent is an optimization: no agent running means every lookup
//! misses, never that a command fails.

use std::path::Path;

use kickpass_agent::{AgentChannel, AgentError, SafePath, SafeRecord};
use tracing::{debug, warn};

use crate::contents::SafeContents;
use crate::error::Error;

pub struct AgentLink {
    channel: AgentChannel,
}

impl AgentLink {
    /// Connect to the agent at `socket`; `None` when nothing listens there
    pub async fn connect(socket: &Path) -> Result<Option<Self>, Error> {
        let mut channel = AgentChannel::init(socket)?;
        match channel.connect().await {
            Ok(()) => Ok(Some(Self { channel })),
            Err(AgentError::Connect { source, .. }) => {
                debug!(socket = %socket.display(), error = %source, "no agent");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn fetch(&mut self, path: &SafePath) -> Result<Option<SafeContents>, Error> {
        let record = self.channel.fetch(path).await?;
        Ok(record.map(|r| SafeContents::new(&r.password, &r.metadata)))
    }

    /// Cache `contents` for `path`
    ///
    /// On failure the agent is told to drop whatever it holds for `path`,
    /// so it never answers with a copy older than the one on disk.
    pub async fn remember(&mut self, path: &SafePath, contents: &SafeContents) -> Result<(), Error> {
        let stored = match contents.check_bounds() {
            Ok(()) => {
                let record =
                    SafeRecord::new(path.clone(), contents.password(), contents.metadata());
                self.channel.store(record).await.map_err(Error::from)
            }
            Err(e) => Err(e),
        };

        if let Err(e) = stored {
            if let Err(discard) = self.channel.discard(path).await {
                warn!(safe = %path, error = %discard, "cannot drop stale agent entry");
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn forget(&mut self, path: &SafePath) -> Result<(), Error> {
        self.channel.discard(path).await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), Error> {
        self.channel.close().await?;
        Ok(())
    }
}

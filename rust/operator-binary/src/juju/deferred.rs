//! Persistent queue of events that asked to be re-delivered on a later dispatch.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::{DeferralQueueFormatSnafu, DeferralQueueIoSnafu, Result};
use crate::events::Event;

pub const DEFERRED_EVENTS_FILE: &str = ".deferred.json";

#[derive(Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DeferredQueue {
    #[serde(skip)]
    path: PathBuf,
    events: Vec<Event>,
}

impl DeferredQueue {
    /// Loads the queue stored in the charm directory. A missing file is an empty queue.
    pub async fn load(charm_dir: &Path) -> Result<Self> {
        let path = charm_dir.join(DEFERRED_EVENTS_FILE);
        let events = match tokio::fs::read(&path).await {
            Ok(content) if content.is_empty() => Vec::new(),
            Ok(content) => serde_json::from_slice(&content).context(DeferralQueueFormatSnafu)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(error) => {
                return Err(error).context(DeferralQueueIoSnafu {
                    path: path.display().to_string(),
                })
            }
        };
        Ok(Self { path, events })
    }

    /// Removes and returns every queued event, oldest first.
    pub fn drain(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn push(&mut self, event: Event) {
        if !self.events.contains(&event) {
            self.events.push(event);
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub async fn save(&self) -> Result<()> {
        let content = serde_json::to_vec(&self.events).context(DeferralQueueFormatSnafu)?;
        tokio::fs::write(&self.path, content)
            .await
            .context(DeferralQueueIoSnafu {
                path: self.path.display().to_string(),
            })
    }
}

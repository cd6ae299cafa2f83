//! Status observability (§4.G): the worker may update an external status
//! record on each state transition. The record itself — and any host agent
//! that reads it to answer "am I working?" — is explicitly out of scope
//! (§1); the broker only needs a consistent seam to call into it.

use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Offered,
    Working,
    Completed,
}

pub trait StatusSink: Send + Sync {
    fn publish(&self, state: WorkerState);
}

/// Writes the current state as a small JSON document, matching
/// `AGENTPAY_STATUS_FILE`'s contract: always consistent with the latest
/// transition, never read back by this process.
pub struct FileStatusSink {
    path: PathBuf,
}

impl FileStatusSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl StatusSink for FileStatusSink {
    fn publish(&self, state: WorkerState) {
        let body = serde_json::json!({ "state": state });
        if let Err(e) = std::fs::write(&self.path, body.to_string()) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to publish status");
        }
    }
}

pub struct NoopStatusSink;

impl StatusSink for NoopStatusSink {
    fn publish(&self, _state: WorkerState) {}
}

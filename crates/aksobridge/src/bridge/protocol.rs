//! Control message types for supervisor-worker communication.
//!
//! The channel is FIFO in both directions:
//! - supervisor → worker: `Init` (always first), `Close`
//! - worker → supervisor: `Listening` once bound, `Closed` after a close grace period

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Process-wide configuration handed to a worker at startup.
///
/// Read-only for the lifetime of the worker; every connection shares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInit {
    /// Slot index; determines the socket path.
    pub slot: usize,
    /// Shared socket directory.
    pub dir: PathBuf,
    /// Upstream API base URL.
    pub host: String,
    pub user_agent: String,
}

/// Control messages from supervisor to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Must be the first message on the channel.
    Init(WorkerInit),

    /// Stop accepting connections and acknowledge with `Closed`.
    Close,
}

/// Control messages from worker to supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Listener is bound and accepting.
    Listening { path: PathBuf },

    /// Listener stopped and grace period elapsed; safe to terminate.
    Closed,
}

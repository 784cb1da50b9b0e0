//! Per-record reconciliation status and its published snapshot.

use crate::record::RecordState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Where a record stands in the reconciliation state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    /// Not yet compared against a resolved address.
    Unknown,
    /// Provider holds the current address.
    Synced,
    /// Resolved address differs from the last applied one; update pending.
    Diverged,
    /// Last attempt failed transiently; next attempt not before `next_attempt_at`.
    Retrying { next_attempt_at: DateTime<Utc> },
    /// Automatic attempts stopped.
    ///
    /// `fatal` failures (auth, not found, rejected) wait for a new address or a
    /// restart; threshold failures are re-evaluated on the next full cycle.
    Failed {
        reason: String,
        fatal: bool,
        address: IpAddr,
    },
}

impl RecordStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RecordStatus::Unknown => "unknown",
            RecordStatus::Synced => "synced",
            RecordStatus::Diverged => "diverged",
            RecordStatus::Retrying { .. } => "retrying",
            RecordStatus::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Serializable view of one record, as served on `/status`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecordStatusView {
    pub key: String,
    pub status: &'static str,
    pub last_applied: Option<IpAddr>,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RecordStatusView {
    pub fn new(state: &RecordState, status: &RecordStatus) -> Self {
        let (next_attempt_at, last_error) = match status {
            RecordStatus::Retrying { next_attempt_at } => (Some(*next_attempt_at), None),
            RecordStatus::Failed { reason, .. } => (None, Some(reason.clone())),
            _ => (None, None),
        };

        Self {
            key: state.key(),
            status: status.label(),
            last_applied: state.last_applied,
            last_applied_at: state.last_applied_at,
            consecutive_failures: state.consecutive_failures,
            next_attempt_at,
            last_error,
        }
    }
}

/// Shared, read-mostly snapshot of every record's status.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    inner: Arc<RwLock<Vec<RecordStatusView>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, views: Vec<RecordStatusView>) {
        *self.inner.write().await = views;
    }

    pub async fn snapshot(&self) -> Vec<RecordStatusView> {
        self.inner.read().await.clone()
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication lifecycle state.
//!
//! ```text
//!                +--------------+
//!                | Initializing |
//!                +------+-------+
//!                       |
//!                +------v-------+     +------------+
//!        +-------+   Running    +----->  Crashed   |
//!        |       +------+-------+     +------------+
//!        |              |
//!  +-----v----+  +------v-------+
//!  | Stopped  |  |  Completing  |
//!  +----------+  +------+-------+
//!                       |
//!                +------v-------+
//!                |  Completed   |
//!                +--------------+
//! ```
//!
//! `Error`, `Crashed`, `Completed`, and `Stopped` are terminal; a new run
//! of the same replication id starts over from `Initializing` (resuming
//! from the checkpoint, not from scratch).
//!
//! Progress counters live here too, behind one lock, so a status read
//! always sees a consistent pairing of status and counters.

use crate::metrics;
use crate::worker::BatchStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::RwLock;
use tracing::info;

/// Where a replication run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    /// Validating peers and loading checkpoints.
    Initializing,
    /// Moving documents.
    Running,
    /// Feed exhausted; draining workers and writing the final checkpoint.
    Completing,
    /// One-shot run finished cleanly.
    Completed,
    /// Stopped by operator request.
    Stopped,
    /// Failed on a fatal error.
    Error,
    /// A pipeline task panicked; the run ended abnormally.
    Crashed,
}

impl ReplicationStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Stopped | Self::Error | Self::Crashed
        )
    }

    fn can_transition_to(&self, next: ReplicationStatus) -> bool {
        use ReplicationStatus::*;
        match (self, next) {
            (Initializing, Running | Stopped | Error) => true,
            (Running, Completing | Stopped | Error | Crashed) => true,
            (Completing, Completed | Stopped | Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a replication run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub rep_id: String,
    pub session_id: String,
    pub status: ReplicationStatus,
    /// Source tip as of the last `info` call.
    pub source_seq: u64,
    /// Watermark position: everything at or below is fully written.
    pub through_seq: u64,
    /// Last checkpoint written to both peers.
    pub checkpointed_seq: u64,
    pub stats: BatchStats,
    /// Populated in the `Error` state.
    pub error: Option<String>,
    /// When this run was launched.
    pub started_at: DateTime<Utc>,
}

struct StateInner {
    status: ReplicationStatus,
    source_seq: u64,
    through_seq: u64,
    checkpointed_seq: u64,
    stats: BatchStats,
    error: Option<String>,
}

/// Shared, lock-guarded lifecycle and progress of one replication run.
pub struct ReplicationState {
    rep_id: String,
    session_id: String,
    started_at: DateTime<Utc>,
    inner: RwLock<StateInner>,
}

impl ReplicationState {
    pub fn new(rep_id: String, session_id: String) -> Self {
        Self {
            rep_id,
            session_id,
            started_at: Utc::now(),
            inner: RwLock::new(StateInner {
                status: ReplicationStatus::Initializing,
                source_seq: 0,
                through_seq: 0,
                checkpointed_seq: 0,
                stats: BatchStats::default(),
                error: None,
            }),
        }
    }

    pub fn rep_id(&self) -> &str {
        &self.rep_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn status(&self) -> ReplicationStatus {
        self.inner.read().await.status
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read().await;
        StateSnapshot {
            rep_id: self.rep_id.clone(),
            session_id: self.session_id.clone(),
            status: inner.status,
            source_seq: inner.source_seq,
            through_seq: inner.through_seq,
            checkpointed_seq: inner.checkpointed_seq,
            stats: inner.stats,
            error: inner.error.clone(),
            started_at: self.started_at,
        }
    }

    /// Move to `next`, rejecting transitions the lifecycle doesn't allow.
    pub async fn transition(&self, next: ReplicationStatus) -> crate::error::Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.status.can_transition_to(next) {
            return Err(crate::error::ReplicationError::InvalidState {
                expected: format!("state that allows {}", next),
                actual: inner.status.to_string(),
            });
        }
        info!(
            rep_id = %self.rep_id,
            from = %inner.status,
            to = %next,
            "replication state change"
        );
        metrics::record_state_transition(&self.rep_id, &next.to_string());
        inner.status = next;
        Ok(())
    }

    /// Record a fatal error and move to `Error` (from any non-terminal state).
    pub async fn fail(&self, message: String) {
        let mut inner = self.inner.write().await;
        if inner.status.is_terminal() {
            return;
        }
        info!(rep_id = %self.rep_id, from = %inner.status, error = %message, "replication failed");
        metrics::record_state_transition(&self.rep_id, "error");
        inner.status = ReplicationStatus::Error;
        inner.error = Some(message);
    }

    /// Record an abnormal end (worker or reader panic) as `Crashed`.
    pub async fn crash(&self, message: String) {
        let mut inner = self.inner.write().await;
        if inner.status.is_terminal() {
            return;
        }
        info!(rep_id = %self.rep_id, from = %inner.status, error = %message, "replication crashed");
        metrics::record_state_transition(&self.rep_id, "crashed");
        inner.status = ReplicationStatus::Crashed;
        inner.error = Some(message);
    }

    pub async fn set_source_seq(&self, seq: u64) {
        let mut inner = self.inner.write().await;
        if seq > inner.source_seq {
            inner.source_seq = seq;
        }
    }

    /// Record watermark advance plus the batch's counters.
    pub async fn record_progress(&self, through_seq: u64, stats: BatchStats) {
        let mut inner = self.inner.write().await;
        debug_assert!(through_seq >= inner.through_seq, "watermark went backwards");
        inner.through_seq = through_seq;
        // A live feed outruns the tip captured at startup; a committed
        // position is itself an observed source position, so the tip
        // tracks it and `through_seq <= source_seq` holds
        if through_seq > inner.source_seq {
            inner.source_seq = through_seq;
        }
        inner.stats += stats;
        metrics::record_committed_seq(&self.rep_id, through_seq);
        metrics::record_lag(&self.rep_id, inner.source_seq, inner.checkpointed_seq);
    }

    /// Seed counters and positions from a resumed checkpoint.
    pub async fn restore(&self, seq: u64, stats: BatchStats) {
        let mut inner = self.inner.write().await;
        inner.through_seq = seq;
        inner.checkpointed_seq = seq;
        inner.stats = stats;
    }

    pub async fn set_checkpointed_seq(&self, seq: u64) {
        let mut inner = self.inner.write().await;
        debug_assert!(
            seq <= inner.through_seq,
            "checkpoint ahead of the watermark"
        );
        inner.checkpointed_seq = seq;
    }
}

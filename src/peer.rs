// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer capability traits and wire value types.
//!
//! The engine never touches HTTP verbs, headers, or body encodings: it
//! talks to peers exclusively through [`SourcePeer`] and [`TargetPeer`].
//! Two implementations ship with the crate:
//!
//! - [`crate::http_peer`]: HTTP-backed, one shared client session
//! - [`crate::memory_peer`]: in-memory double for tests
//!
//! # Checkpoint symmetry
//!
//! Both traits expose `read_checkpoint`/`write_checkpoint`. Checkpoints
//! are stored on *both* peers so either side can resume an interrupted
//! replication, and losing one peer's storage does not lose history.
//! Writes are conditional on the stored document revision: a conflict
//! means another manager instance is running the same replication id,
//! which is fatal to this run.

use crate::config::PeerInfo;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Checkpoint token: a sequence qualified by the epoch in which it is valid.
///
/// A source's sequence counter is not guaranteed monotonic across its own
/// restarts or compactions, so a bare number is unsafe to resume from.
/// `epoch` records when the source's sequence space was last known valid;
/// a mismatch on resume means the stored `seq` is meaningless and the
/// replication restarts from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TsSeq {
    /// Wall-clock epoch of the source's sequence space (e.g. its
    /// instance start time), in milliseconds.
    pub epoch: i64,
    /// The source's native change-feed position.
    pub seq: u64,
}

impl TsSeq {
    pub fn new(epoch: i64, seq: u64) -> Self {
        Self { epoch, seq }
    }
}

/// Peer metadata returned by [`SourcePeer::info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMeta {
    /// Highest sequence the peer has assigned.
    pub update_seq: u64,
    /// Epoch of the peer's sequence space, in milliseconds.
    pub epoch: i64,
}

/// One event from a source's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Feed position of this event.
    pub seq: u64,
    /// Document the event concerns.
    pub doc_id: String,
    /// Leaf revisions changed by this event.
    pub revs: Vec<String>,
    /// Whether the document was deleted.
    #[serde(default)]
    pub deleted: bool,
}

/// Parameters for opening a change feed.
#[derive(Debug, Clone, Default)]
pub struct ChangesRequest {
    /// Resume position; events with `seq <= since` are not delivered.
    pub since: u64,
    /// Keep the feed open at the tip instead of ending it.
    pub continuous: bool,
    /// Filter function name, if any.
    pub filter: Option<String>,
    /// Query parameters for the filter function.
    pub query_params: Option<std::collections::BTreeMap<String, String>>,
    /// Document id allowlist (with the `_doc_ids` filter).
    pub doc_ids: Option<Vec<String>>,
    /// Keepalive period for continuous feeds.
    pub heartbeat: Duration,
}

/// A document revision in transit, revision history included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Document id.
    #[serde(rename = "_id")]
    pub id: String,
    /// This revision.
    #[serde(rename = "_rev")]
    pub rev: String,
    /// Deletion tombstone marker.
    #[serde(rename = "_deleted", default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// Ancestor revisions, newest first, starting with `rev` itself.
    /// Written through verbatim so the target's tree mirrors the source's.
    /// On the wire this is the `{"start": N, "ids": [...]}` pair.
    #[serde(rename = "_revisions", default, with = "rev_tree")]
    pub rev_history: Vec<String>,
    /// Document content.
    #[serde(default)]
    pub body: serde_json::Value,
}

/// Serde adapter between `rev_history`'s full `gen-hash` revision ids and
/// the wire `_revisions` form, `{"start": N, "ids": ["hash", ...]}` with
/// hashes newest first and generations counting down from `start`.
mod rev_tree {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct RevTree {
        start: u64,
        ids: Vec<String>,
    }

    pub fn serialize<S: Serializer>(revs: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        let start = revs
            .first()
            .and_then(|rev| rev.split_once('-'))
            .and_then(|(generation, _)| generation.parse().ok())
            .unwrap_or(0);
        let ids = revs
            .iter()
            .map(|rev| match rev.split_once('-') {
                Some((_, id)) => id.to_string(),
                None => rev.clone(),
            })
            .collect();
        RevTree { start, ids }.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<String>, D::Error> {
        let tree = RevTree::deserialize(deserializer)?;
        Ok(tree
            .ids
            .into_iter()
            .enumerate()
            .map(|(offset, id)| format!("{}-{}", tree.start.saturating_sub(offset as u64), id))
            .collect())
    }
}

/// Per-document outcome of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Revision stored (or already present).
    Ok,
    /// Revision rejected as conflicting.
    Conflict,
    /// Peer-reported error for this document only.
    Error(String),
}

/// Outcome of one document in a [`TargetPeer::bulk_write`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocWriteOutcome {
    pub doc_id: String,
    pub rev: String,
    pub outcome: WriteOutcome,
}

impl DocWriteOutcome {
    pub fn is_ok(&self) -> bool {
        self.outcome == WriteOutcome::Ok
    }
}

/// Checkpoint document, one per peer per replication id.
///
/// Carries the counters needed to resume progress reporting, not just the
/// sequence: a restarted replication keeps counting from where it left off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointDoc {
    /// Random id of the session that wrote this checkpoint.
    pub session_id: String,
    /// The committed position.
    pub ts: TsSeq,
    pub docs_read: u64,
    pub docs_written: u64,
    pub doc_write_failures: u64,
    /// Stored document revision; `None` on first write. Writes are
    /// conditional on this to detect a concurrent writer.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
}

/// Lazily-produced sequence of change events.
///
/// `next` returning `Ok(None)` means the feed ended (non-continuous feed
/// exhausted, or the peer closed it). Continuous feeds swallow heartbeats
/// internally and only yield real events.
#[async_trait]
pub trait ChangeFeed: Send {
    async fn next(&mut self) -> Result<Option<ChangeEvent>>;
}

/// Read capability over a replication source.
#[async_trait]
pub trait SourcePeer: Send + Sync + 'static {
    /// Peer metadata: current update seq and sequence-space epoch.
    async fn info(&self) -> Result<PeerMeta>;

    /// Open the change feed at `request.since`, restartable from any seq.
    async fn open_changes(&self, request: ChangesRequest) -> Result<Box<dyn ChangeFeed>>;

    /// Fetch specific revisions of a document, history included.
    ///
    /// With `include_attachments` the peer is asked for a representation
    /// that streams attachment bodies rather than buffering them.
    async fn fetch(
        &self,
        doc_id: &str,
        revs: &[String],
        include_attachments: bool,
    ) -> Result<Vec<Document>>;

    /// Read this replication's checkpoint, if one was ever written.
    async fn read_checkpoint(&self, rep_id: &str) -> Result<Option<CheckpointDoc>>;

    /// Conditionally write this replication's checkpoint.
    ///
    /// Returns the new stored revision. A revision mismatch yields
    /// [`crate::ReplicationError::CheckpointConflict`].
    async fn write_checkpoint(&self, rep_id: &str, doc: &CheckpointDoc) -> Result<String>;
}

/// Write capability over a replication target.
#[async_trait]
pub trait TargetPeer: Send + Sync + 'static {
    /// Check the target database exists, creating it when asked.
    /// Returns whether it exists after the call.
    async fn ensure_exists(&self, create_if_missing: bool) -> Result<bool>;

    /// For each document, which of the given revisions the target lacks.
    /// Documents with nothing missing are absent from the result.
    async fn revs_diff(
        &self,
        revs: HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, Vec<String>>>;

    /// Write documents. With `preserve_rev_history` the target stores the
    /// revisions verbatim, minting nothing new: a straight copy of the
    /// source's tree, not a user edit.
    async fn bulk_write(
        &self,
        docs: Vec<Document>,
        preserve_rev_history: bool,
    ) -> Result<Vec<DocWriteOutcome>>;

    /// Read this replication's checkpoint, if one was ever written.
    async fn read_checkpoint(&self, rep_id: &str) -> Result<Option<CheckpointDoc>>;

    /// Conditionally write this replication's checkpoint.
    async fn write_checkpoint(&self, rep_id: &str, doc: &CheckpointDoc) -> Result<String>;
}

/// Constructs peers from descriptors.
///
/// Owned by the manager and injected into every replication, so session
/// state (connection pools, credentials) lives in one explicit place
/// instead of process-wide globals.
pub trait PeerBuilder: Send + Sync + 'static {
    fn source(&self, info: &PeerInfo) -> Result<Arc<dyn SourcePeer>>;
    fn target(&self, info: &PeerInfo) -> Result<Arc<dyn TargetPeer>>;
}

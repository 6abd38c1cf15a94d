// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory peer double.
//!
//! Implements both [`SourcePeer`] and [`TargetPeer`] over a shared
//! in-process revision store. Used by the test suite and by standalone
//! examples; also handy as a reference for what the capability contract
//! actually requires of a real peer.
//!
//! Cloning a [`MemoryPeer`] clones a handle to the same database. The
//! double supports fault injection (`fail_writes`, `conflict_writes`,
//! `fail_fetch`, `reject_auth`) and epoch bumps to simulate a source
//! whose sequence space was reset.

use crate::config::PeerInfo;
use crate::error::{ReplicationError, Result};
use crate::peer::{
    ChangeEvent, ChangeFeed, ChangesRequest, CheckpointDoc, Document, DocWriteOutcome, PeerBuilder,
    PeerMeta, SourcePeer, TargetPeer, WriteOutcome,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct DocRevs {
    /// Every stored revision, keyed by rev id.
    revs: HashMap<String, Document>,
    /// Winning-leaf history, newest first.
    leaf_history: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    exists: bool,
    epoch: i64,
    update_seq: u64,
    docs: HashMap<String, DocRevs>,
    changes: Vec<ChangeEvent>,
    checkpoints: HashMap<String, CheckpointDoc>,
    checkpoint_rev_counter: u64,
    fail_writes: HashSet<String>,
    conflict_writes: HashSet<String>,
    fail_fetch: HashSet<String>,
    reject_auth: bool,
    bulk_written_docs: u64,
    fetched_docs: u64,
    attachment_fetches: u64,
}

/// Shared-handle in-memory database acting as source and/or target.
#[derive(Clone)]
pub struct MemoryPeer {
    inner: Arc<Mutex<Inner>>,
    changed: Arc<Notify>,
}

impl MemoryPeer {
    /// An existing, empty database.
    pub fn new() -> Self {
        Self::with_epoch(1)
    }

    /// An existing, empty database with a specific sequence-space epoch.
    pub fn with_epoch(epoch: i64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                exists: true,
                epoch,
                ..Inner::default()
            })),
            changed: Arc::new(Notify::new()),
        }
    }

    /// A database that does not exist yet (`create_target` scenarios).
    pub fn absent() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                exists: false,
                epoch: 1,
                ..Inner::default()
            })),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Write a new revision on top of the current winning leaf.
    /// Returns the new rev id.
    pub fn update_doc(&self, doc_id: &str, body: Value) -> String {
        let mut inner = self.inner.lock().expect("memory peer poisoned");
        let entry = inner.docs.entry(doc_id.to_string()).or_default();
        let gen = entry.leaf_history.len() as u64 + 1;
        let rev = format!("{}-{:08x}", gen, fastrand(doc_id, gen));
        let mut history = vec![rev.clone()];
        history.extend(entry.leaf_history.iter().cloned());
        let doc = Document {
            id: doc_id.to_string(),
            rev: rev.clone(),
            deleted: false,
            rev_history: history.clone(),
            body,
        };
        entry.revs.insert(rev.clone(), doc);
        entry.leaf_history = history;
        inner.update_seq += 1;
        let seq = inner.update_seq;
        inner.changes.push(ChangeEvent {
            seq,
            doc_id: doc_id.to_string(),
            revs: vec![rev.clone()],
            deleted: false,
        });
        drop(inner);
        self.changed.notify_waiters();
        rev
    }

    /// Tombstone the document's winning leaf.
    pub fn delete_doc(&self, doc_id: &str) -> String {
        let mut inner = self.inner.lock().expect("memory peer poisoned");
        let entry = inner.docs.entry(doc_id.to_string()).or_default();
        let gen = entry.leaf_history.len() as u64 + 1;
        let rev = format!("{}-{:08x}", gen, fastrand(doc_id, gen));
        let mut history = vec![rev.clone()];
        history.extend(entry.leaf_history.iter().cloned());
        let doc = Document {
            id: doc_id.to_string(),
            rev: rev.clone(),
            deleted: true,
            rev_history: history.clone(),
            body: Value::Null,
        };
        entry.revs.insert(rev.clone(), doc);
        entry.leaf_history = history;
        inner.update_seq += 1;
        let seq = inner.update_seq;
        inner.changes.push(ChangeEvent {
            seq,
            doc_id: doc_id.to_string(),
            revs: vec![rev.clone()],
            deleted: true,
        });
        drop(inner);
        self.changed.notify_waiters();
        rev
    }

    /// Move the epoch, invalidating any checkpoint that recorded the old
    /// one. Stored documents and sequences are untouched.
    pub fn bump_epoch(&self) {
        let mut inner = self.inner.lock().expect("memory peer poisoned");
        inner.epoch += 1;
        self.changed.notify_waiters();
    }

    /// Inject a per-document write error for `bulk_write`.
    pub fn fail_writes(&self, doc_id: &str) {
        self.inner
            .lock()
            .expect("memory peer poisoned")
            .fail_writes
            .insert(doc_id.to_string());
    }

    /// Inject a per-document conflict for `bulk_write`.
    pub fn conflict_writes(&self, doc_id: &str) {
        self.inner
            .lock()
            .expect("memory peer poisoned")
            .conflict_writes
            .insert(doc_id.to_string());
    }

    /// Inject a transport failure for every `fetch` of this document.
    pub fn fail_fetch(&self, doc_id: &str) {
        self.inner
            .lock()
            .expect("memory peer poisoned")
            .fail_fetch
            .insert(doc_id.to_string());
    }

    /// Reject every `revs_diff` call as unauthorized.
    pub fn reject_auth(&self) {
        self.inner.lock().expect("memory peer poisoned").reject_auth = true;
    }

    /// All stored revisions of a document, unordered.
    pub fn stored_revs(&self, doc_id: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("memory peer poisoned");
        inner
            .docs
            .get(doc_id)
            .map(|d| d.revs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Winning-leaf revision history of a document, newest first.
    pub fn leaf_history(&self, doc_id: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("memory peer poisoned");
        inner
            .docs
            .get(doc_id)
            .map(|d| d.leaf_history.clone())
            .unwrap_or_default()
    }

    /// Total documents accepted through `bulk_write` (test counter).
    pub fn bulk_written_docs(&self) -> u64 {
        self.inner.lock().expect("memory peer poisoned").bulk_written_docs
    }

    /// Total document revisions served through `fetch` (test counter).
    pub fn fetched_docs(&self) -> u64 {
        self.inner.lock().expect("memory peer poisoned").fetched_docs
    }

    /// Number of `fetch` calls that asked for attachment bodies.
    pub fn attachment_fetches(&self) -> u64 {
        self.inner.lock().expect("memory peer poisoned").attachment_fetches
    }

    /// Stored checkpoint for a replication id (test accessor).
    pub fn checkpoint(&self, rep_id: &str) -> Option<CheckpointDoc> {
        self.inner
            .lock()
            .expect("memory peer poisoned")
            .checkpoints
            .get(rep_id)
            .cloned()
    }

    pub fn doc_count(&self) -> usize {
        self.inner.lock().expect("memory peer poisoned").docs.len()
    }

    pub fn update_seq(&self) -> u64 {
        self.inner.lock().expect("memory peer poisoned").update_seq
    }

    fn read_checkpoint_impl(&self, rep_id: &str) -> Option<CheckpointDoc> {
        self.checkpoint(rep_id)
    }

    fn write_checkpoint_impl(&self, rep_id: &str, doc: &CheckpointDoc) -> Result<String> {
        let mut inner = self.inner.lock().expect("memory peer poisoned");
        let stored_rev = inner.checkpoints.get(rep_id).and_then(|c| c.rev.clone());
        if stored_rev != doc.rev {
            return Err(ReplicationError::CheckpointConflict {
                rep_id: rep_id.to_string(),
                peer: "memory".to_string(),
            });
        }
        inner.checkpoint_rev_counter += 1;
        let new_rev = format!("0-{}", inner.checkpoint_rev_counter);
        let mut stored = doc.clone();
        stored.rev = Some(new_rev.clone());
        inner.checkpoints.insert(rep_id.to_string(), stored);
        Ok(new_rev)
    }
}

impl Default for MemoryPeer {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic pseudo-hash for generated rev ids.
fn fastrand(doc_id: &str, gen: u64) -> u64 {
    let mut acc: u64 = 0xcbf2_9ce4_8422_2325;
    for b in doc_id.bytes() {
        acc ^= b as u64;
        acc = acc.wrapping_mul(0x0000_0100_0000_01b3);
    }
    acc ^ gen
}

struct MemoryChangeFeed {
    peer: MemoryPeer,
    cursor: u64,
    continuous: bool,
    /// Feed end for non-continuous reads: update_seq at open time.
    snapshot_seq: u64,
    doc_ids: Option<HashSet<String>>,
}

impl MemoryChangeFeed {
    fn poll_next(&mut self) -> Option<ChangeEvent> {
        let inner = self.peer.inner.lock().expect("memory peer poisoned");
        for event in &inner.changes {
            if event.seq <= self.cursor {
                continue;
            }
            if let Some(allow) = &self.doc_ids {
                if !allow.contains(&event.doc_id) {
                    // Filtered out, but the position still advances
                    self.cursor = event.seq;
                    continue;
                }
            }
            self.cursor = event.seq;
            return Some(event.clone());
        }
        None
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn next(&mut self) -> Result<Option<ChangeEvent>> {
        loop {
            // Register for wakeups before scanning, on an owned handle so
            // the scan can borrow self mutably
            let changed = Arc::clone(&self.peer.changed);
            let notified = changed.notified();
            if let Some(event) = self.poll_next() {
                return Ok(Some(event));
            }
            if !self.continuous && self.cursor >= self.snapshot_seq {
                return Ok(None);
            }
            notified.await;
        }
    }
}

#[async_trait]
impl SourcePeer for MemoryPeer {
    async fn info(&self) -> Result<PeerMeta> {
        let inner = self.inner.lock().expect("memory peer poisoned");
        Ok(PeerMeta {
            update_seq: inner.update_seq,
            epoch: inner.epoch,
        })
    }

    async fn open_changes(&self, request: ChangesRequest) -> Result<Box<dyn ChangeFeed>> {
        let snapshot_seq = self.update_seq();
        Ok(Box::new(MemoryChangeFeed {
            peer: self.clone(),
            cursor: request.since,
            continuous: request.continuous,
            snapshot_seq,
            doc_ids: request.doc_ids.map(|ids| ids.into_iter().collect()),
        }))
    }

    async fn fetch(
        &self,
        doc_id: &str,
        revs: &[String],
        include_attachments: bool,
    ) -> Result<Vec<Document>> {
        let mut inner = self.inner.lock().expect("memory peer poisoned");
        if inner.fail_fetch.contains(doc_id) {
            return Err(ReplicationError::transport(
                "fetch_docs",
                "injected fetch failure",
            ));
        }
        if include_attachments {
            inner.attachment_fetches += 1;
        }
        let mut found = Vec::new();
        if let Some(entry) = inner.docs.get(doc_id) {
            for rev in revs {
                if let Some(doc) = entry.revs.get(rev) {
                    found.push(doc.clone());
                }
            }
        }
        inner.fetched_docs += found.len() as u64;
        Ok(found)
    }

    async fn read_checkpoint(&self, rep_id: &str) -> Result<Option<CheckpointDoc>> {
        Ok(self.read_checkpoint_impl(rep_id))
    }

    async fn write_checkpoint(&self, rep_id: &str, doc: &CheckpointDoc) -> Result<String> {
        self.write_checkpoint_impl(rep_id, doc)
    }
}

#[async_trait]
impl TargetPeer for MemoryPeer {
    async fn ensure_exists(&self, create_if_missing: bool) -> Result<bool> {
        let mut inner = self.inner.lock().expect("memory peer poisoned");
        if !inner.exists && create_if_missing {
            inner.exists = true;
        }
        Ok(inner.exists)
    }

    async fn revs_diff(
        &self,
        revs: HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, Vec<String>>> {
        let inner = self.inner.lock().expect("memory peer poisoned");
        if inner.reject_auth {
            return Err(ReplicationError::Unauthorized("memory".to_string()));
        }
        let mut missing = HashMap::new();
        for (doc_id, candidate_revs) in revs {
            let have = inner.docs.get(&doc_id);
            let lacking: Vec<String> = candidate_revs
                .into_iter()
                .filter(|rev| !have.map(|d| d.revs.contains_key(rev)).unwrap_or(false))
                .collect();
            if !lacking.is_empty() {
                missing.insert(doc_id, lacking);
            }
        }
        Ok(missing)
    }

    async fn bulk_write(
        &self,
        docs: Vec<Document>,
        preserve_rev_history: bool,
    ) -> Result<Vec<DocWriteOutcome>> {
        let mut inner = self.inner.lock().expect("memory peer poisoned");
        let mut outcomes = Vec::with_capacity(docs.len());
        for doc in docs {
            if inner.fail_writes.contains(&doc.id) {
                outcomes.push(DocWriteOutcome {
                    doc_id: doc.id,
                    rev: doc.rev,
                    outcome: WriteOutcome::Error("injected write failure".to_string()),
                });
                continue;
            }
            if inner.conflict_writes.contains(&doc.id) {
                outcomes.push(DocWriteOutcome {
                    doc_id: doc.id,
                    rev: doc.rev,
                    outcome: WriteOutcome::Conflict,
                });
                continue;
            }
            if !preserve_rev_history {
                // The engine always copies trees verbatim; refusing here
                // keeps the double honest about the contract
                outcomes.push(DocWriteOutcome {
                    doc_id: doc.id,
                    rev: doc.rev,
                    outcome: WriteOutcome::Error("edit writes not supported".to_string()),
                });
                continue;
            }
            let entry = inner.docs.entry(doc.id.clone()).or_default();
            let already_present = entry.revs.contains_key(&doc.rev);
            if !already_present {
                entry.revs.insert(doc.rev.clone(), doc.clone());
                // Longest history wins the leaf, same generation rule as
                // a real revision tree's deterministic winner
                if doc.rev_history.len() > entry.leaf_history.len() {
                    entry.leaf_history = doc.rev_history.clone();
                }
                inner.update_seq += 1;
                let seq = inner.update_seq;
                inner.changes.push(ChangeEvent {
                    seq,
                    doc_id: doc.id.clone(),
                    revs: vec![doc.rev.clone()],
                    deleted: doc.deleted,
                });
                inner.bulk_written_docs += 1;
            }
            outcomes.push(DocWriteOutcome {
                doc_id: doc.id,
                rev: doc.rev,
                outcome: WriteOutcome::Ok,
            });
        }
        drop(inner);
        self.changed.notify_waiters();
        Ok(outcomes)
    }

    async fn read_checkpoint(&self, rep_id: &str) -> Result<Option<CheckpointDoc>> {
        Ok(self.read_checkpoint_impl(rep_id))
    }

    async fn write_checkpoint(&self, rep_id: &str, doc: &CheckpointDoc) -> Result<String> {
        self.write_checkpoint_impl(rep_id, doc)
    }
}

/// Registry-backed builder handing out [`MemoryPeer`] handles by URL.
///
/// Unknown target URLs materialize as absent databases so that
/// `create_target` paths can be exercised end to end.
#[derive(Default)]
pub struct MemoryPeerBuilder {
    peers: Mutex<HashMap<String, MemoryPeer>>,
}

impl MemoryPeerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a database under a URL.
    pub fn register(&self, url: impl Into<String>, peer: MemoryPeer) {
        self.peers
            .lock()
            .expect("builder poisoned")
            .insert(url.into(), peer);
    }

    fn lookup(&self, url: &str, create_absent: bool) -> Result<MemoryPeer> {
        let mut peers = self.peers.lock().expect("builder poisoned");
        if let Some(peer) = peers.get(url) {
            return Ok(peer.clone());
        }
        if create_absent {
            let peer = MemoryPeer::absent();
            peers.insert(url.to_string(), peer.clone());
            return Ok(peer);
        }
        Err(ReplicationError::Config(format!(
            "unknown memory peer: {}",
            url
        )))
    }
}

impl PeerBuilder for MemoryPeerBuilder {
    fn source(&self, info: &PeerInfo) -> Result<Arc<dyn SourcePeer>> {
        Ok(Arc::new(self.lookup(&info.url, false)?))
    }

    fn target(&self, info: &PeerInfo) -> Result<Arc<dyn TargetPeer>> {
        Ok(Arc::new(self.lookup(&info.url, true)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_update_doc_assigns_sequences() {
        let peer = MemoryPeer::new();
        peer.update_doc("a", json!({"v": 1}));
        peer.update_doc("b", json!({"v": 2}));
        peer.update_doc("a", json!({"v": 3}));

        let meta = SourcePeer::info(&peer).await.unwrap();
        assert_eq!(meta.update_seq, 3);
        assert_eq!(peer.leaf_history("a").len(), 2);
    }

    #[tokio::test]
    async fn test_feed_delivers_from_since() {
        let peer = MemoryPeer::new();
        peer.update_doc("a", json!({}));
        peer.update_doc("b", json!({}));
        peer.update_doc("c", json!({}));

        let mut feed = peer
            .open_changes(ChangesRequest {
                since: 1,
                ..Default::default()
            })
            .await
            .unwrap();

        let first = feed.next().await.unwrap().unwrap();
        assert_eq!(first.seq, 2);
        assert_eq!(first.doc_id, "b");
        let second = feed.next().await.unwrap().unwrap();
        assert_eq!(second.seq, 3);
        assert_eq!(feed.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_feed_doc_ids_filter() {
        let peer = MemoryPeer::new();
        peer.update_doc("keep", json!({}));
        peer.update_doc("drop", json!({}));
        peer.update_doc("keep", json!({"v": 2}));

        let mut feed = peer
            .open_changes(ChangesRequest {
                doc_ids: Some(vec!["keep".to_string()]),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(feed.next().await.unwrap().unwrap().doc_id, "keep");
        assert_eq!(feed.next().await.unwrap().unwrap().doc_id, "keep");
        assert_eq!(feed.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_continuous_feed_waits_for_updates() {
        let peer = MemoryPeer::new();
        peer.update_doc("a", json!({}));

        let mut feed = peer
            .open_changes(ChangesRequest {
                continuous: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(feed.next().await.unwrap().unwrap().seq, 1);

        let writer = peer.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            writer.update_doc("late", json!({}));
        });

        let event = feed.next().await.unwrap().unwrap();
        assert_eq!(event.doc_id, "late");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_revs_diff_reports_only_missing() {
        let peer = MemoryPeer::new();
        let rev = peer.update_doc("a", json!({}));

        let mut ask = HashMap::new();
        ask.insert("a".to_string(), vec![rev.clone(), "9-none".to_string()]);
        ask.insert("ghost".to_string(), vec!["1-x".to_string()]);

        let missing = peer.revs_diff(ask).await.unwrap();
        assert_eq!(missing["a"], vec!["9-none".to_string()]);
        assert_eq!(missing["ghost"], vec!["1-x".to_string()]);
        assert_eq!(missing.len(), 2);

        // Nothing missing: doc absent from the result entirely
        let mut ask = HashMap::new();
        ask.insert("a".to_string(), vec![rev]);
        assert!(peer.revs_diff(ask).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_write_preserves_history() {
        let source = MemoryPeer::new();
        source.update_doc("a", json!({"v": 1}));
        let rev2 = source.update_doc("a", json!({"v": 2}));
        let docs = source.fetch("a", &[rev2.clone()], false).await.unwrap();

        let target = MemoryPeer::new();
        let outcomes = target.bulk_write(docs, true).await.unwrap();
        assert!(outcomes[0].is_ok());
        assert_eq!(target.leaf_history("a"), source.leaf_history("a"));

        // Idempotent: writing the same rev again stores nothing new
        let docs = source.fetch("a", &[rev2], false).await.unwrap();
        let written_before = target.bulk_written_docs();
        let outcomes = target.bulk_write(docs, true).await.unwrap();
        assert!(outcomes[0].is_ok());
        assert_eq!(target.bulk_written_docs(), written_before);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let target = MemoryPeer::new();
        target.fail_writes("bad");
        let doc = Document {
            id: "bad".to_string(),
            rev: "1-a".to_string(),
            deleted: false,
            rev_history: vec!["1-a".to_string()],
            body: json!({}),
        };
        let outcomes = target.bulk_write(vec![doc], true).await.unwrap();
        assert!(matches!(outcomes[0].outcome, WriteOutcome::Error(_)));
        assert_eq!(target.bulk_written_docs(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_conditional_write() {
        let peer = MemoryPeer::new();
        let doc = CheckpointDoc {
            session_id: "s1".to_string(),
            ts: crate::peer::TsSeq::new(1, 10),
            docs_read: 0,
            docs_written: 0,
            doc_write_failures: 0,
            rev: None,
        };
        let rev1 = SourcePeer::write_checkpoint(&peer, "rep1", &doc).await.unwrap();

        // Write with the stored rev succeeds
        let mut next = doc.clone();
        next.rev = Some(rev1);
        next.ts.seq = 20;
        let _rev2 = SourcePeer::write_checkpoint(&peer, "rep1", &next).await.unwrap();

        // Stale rev conflicts
        let stale = doc.clone();
        let err = SourcePeer::write_checkpoint(&peer, "rep1", &stale)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReplicationError::CheckpointConflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_ensure_exists_creates_absent() {
        let peer = MemoryPeer::absent();
        assert!(!peer.ensure_exists(false).await.unwrap());
        assert!(peer.ensure_exists(true).await.unwrap());
        assert!(peer.ensure_exists(false).await.unwrap());
    }

    #[test]
    fn test_builder_registry() {
        let builder = MemoryPeerBuilder::new();
        builder.register("mem://src", MemoryPeer::new());

        let info = PeerInfo::new("mem://src");
        assert!(builder.source(&info).is_ok());

        // Unknown source is an error, unknown target materializes absent
        let unknown = PeerInfo::new("mem://nope");
        assert!(builder.source(&unknown).is_err());
        assert!(builder.target(&unknown).is_ok());
    }
}

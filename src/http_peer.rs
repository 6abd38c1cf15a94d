// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTP-backed peer adapter.
//!
//! Maps the [`SourcePeer`]/[`TargetPeer`] capability traits onto a
//! CouchDB-style HTTP surface:
//!
//! | Capability          | Endpoint                               |
//! |---------------------|----------------------------------------|
//! | `info`              | `GET /`                                |
//! | `open_changes`      | `GET /_changes`                        |
//! | `fetch`             | `GET /{doc_id}?open_revs=...`          |
//! | `revs_diff`         | `POST /_revs_diff`                     |
//! | `bulk_write`        | `POST /_bulk_docs` (`new_edits=false`) |
//! | checkpoints         | `GET`/`PUT /_local/{rep_id}`           |
//!
//! One [`reqwest::Client`] is shared across every peer built by the same
//! [`HttpPeerBuilder`], so connection pools and TLS sessions are reused
//! across replications. Credentials ride on each request as basic auth,
//! never in logged URLs.
//!
//! This layer does no retries of its own; transient failures surface as
//! retryable [`ReplicationError::Transport`] values and the caller's
//! retry policy decides.

use crate::config::{Credentials, PeerInfo};
use crate::error::{ReplicationError, Result};
use crate::peer::{
    ChangeEvent, ChangeFeed, ChangesRequest, CheckpointDoc, Document, DocWriteOutcome, PeerBuilder,
    PeerMeta, SourcePeer, TargetPeer, WriteOutcome,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A single database behind an HTTP endpoint.
#[derive(Clone)]
pub struct HttpPeer {
    client: reqwest::Client,
    /// Database URL with a trailing slash.
    base: String,
    credentials: Option<Credentials>,
}

impl HttpPeer {
    pub fn new(client: reqwest::Client, info: &PeerInfo) -> Self {
        Self {
            client,
            base: info.normalized_url(),
            credentials: info.credentials.clone(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base, path);
        let mut builder = self.client.request(method, url);
        if let Some(creds) = &self.credentials {
            builder = builder.basic_auth(&creds.username, Some(&creds.password));
        }
        builder
    }

    /// Map a non-success status onto the error taxonomy. `operation` names
    /// the failed capability for logs.
    fn status_error(&self, operation: &'static str, status: StatusCode) -> ReplicationError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                ReplicationError::Unauthorized(format!("{} rejected: {}", operation, status))
            }
            StatusCode::NOT_FOUND => {
                ReplicationError::MissingTarget(format!("{}: database not found", operation))
            }
            // 5xx and 429 are worth retrying, everything else is not
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                ReplicationError::transport(operation, format!("http status {}", s))
            }
            s => ReplicationError::Internal(format!("{}: unexpected http status {}", operation, s)),
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| ReplicationError::transport_from(operation, e))?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(self.status_error(operation, response.status()))
        }
    }
}

#[derive(Debug, Deserialize)]
struct DbInfoBody {
    update_seq: u64,
    /// Start time of the database instance, milliseconds as a string.
    #[serde(default)]
    instance_start_time: String,
}

#[derive(Debug, Deserialize)]
struct ChangeLine {
    seq: u64,
    id: String,
    changes: Vec<ChangeRevEntry>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct ChangeRevEntry {
    rev: String,
}

#[derive(Debug, Deserialize)]
struct ChangesBody {
    results: Vec<ChangeLine>,
}

#[derive(Debug, Deserialize)]
struct MissingRevsEntry {
    missing: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRevEntry {
    ok: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct BulkDocsEntry {
    id: String,
    #[serde(default)]
    rev: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocalDocRev {
    rev: String,
}

impl From<ChangeLine> for ChangeEvent {
    fn from(line: ChangeLine) -> Self {
        ChangeEvent {
            seq: line.seq,
            doc_id: line.id,
            revs: line.changes.into_iter().map(|c| c.rev).collect(),
            deleted: line.deleted,
        }
    }
}

fn changes_query(request: &ChangesRequest) -> Vec<(String, String)> {
    let mut query = vec![
        ("since".to_string(), request.since.to_string()),
        ("style".to_string(), "all_docs".to_string()),
    ];
    if request.continuous {
        query.push(("feed".to_string(), "continuous".to_string()));
        query.push((
            "heartbeat".to_string(),
            request.heartbeat.as_millis().to_string(),
        ));
    }
    if let Some(filter) = &request.filter {
        query.push(("filter".to_string(), filter.clone()));
    }
    if let Some(params) = &request.query_params {
        // Filter params ride as plain query parameters; the peer hands
        // them to the filter function untouched
        for (key, value) in params {
            query.push((key.clone(), value.clone()));
        }
    }
    query
}

/// Buffered feed for normal (non-continuous) reads: the whole response
/// body is one JSON document.
struct BufferedFeed {
    events: VecDeque<ChangeEvent>,
}

#[async_trait]
impl ChangeFeed for BufferedFeed {
    async fn next(&mut self) -> Result<Option<ChangeEvent>> {
        Ok(self.events.pop_front())
    }
}

/// Line-delimited streaming feed for continuous reads. Heartbeat lines
/// are empty and skipped here, so callers only ever see real events.
struct StreamingFeed {
    response: reqwest::Response,
    buffer: Vec<u8>,
    ended: bool,
}

impl StreamingFeed {
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }
}

#[async_trait]
impl ChangeFeed for StreamingFeed {
    async fn next(&mut self) -> Result<Option<ChangeEvent>> {
        loop {
            while let Some(line) = self.take_line() {
                if line.is_empty() {
                    // Heartbeat
                    continue;
                }
                let value: serde_json::Value = serde_json::from_slice(&line)
                    .map_err(|e| ReplicationError::FeedParse(e.to_string()))?;
                if value.get("last_seq").is_some() {
                    self.ended = true;
                    return Ok(None);
                }
                let parsed: ChangeLine = serde_json::from_value(value)
                    .map_err(|e| ReplicationError::FeedParse(e.to_string()))?;
                return Ok(Some(parsed.into()));
            }
            if self.ended {
                return Ok(None);
            }
            match self
                .response
                .chunk()
                .await
                .map_err(|e| ReplicationError::transport_from("changes_feed", e))?
            {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => {
                    self.ended = true;
                    // Trailing partial line without a newline
                    if !self.buffer.is_empty() {
                        let line = std::mem::take(&mut self.buffer);
                        if let Ok(parsed) = serde_json::from_slice::<ChangeLine>(&line) {
                            return Ok(Some(parsed.into()));
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }
}

#[async_trait]
impl SourcePeer for HttpPeer {
    async fn info(&self) -> Result<PeerMeta> {
        let body: DbInfoBody = self
            .send("info", self.request(reqwest::Method::GET, ""))
            .await?
            .json()
            .await
            .map_err(|e| ReplicationError::transport_from("info", e))?;
        Ok(PeerMeta {
            update_seq: body.update_seq,
            epoch: body.instance_start_time.parse().unwrap_or(0),
        })
    }

    async fn open_changes(&self, request: ChangesRequest) -> Result<Box<dyn ChangeFeed>> {
        let mut builder = self
            .request(reqwest::Method::GET, "_changes")
            .query(&changes_query(&request));
        if let Some(doc_ids) = &request.doc_ids {
            // _doc_ids filters POST the id list in the body
            builder = self
                .request(reqwest::Method::POST, "_changes")
                .query(&changes_query(&request))
                .json(&serde_json::json!({ "doc_ids": doc_ids }));
        }
        let response = self.send("changes_feed", builder).await?;

        if request.continuous {
            Ok(Box::new(StreamingFeed {
                response,
                buffer: Vec::new(),
                ended: false,
            }))
        } else {
            let body: ChangesBody = response
                .json()
                .await
                .map_err(|e| ReplicationError::transport_from("changes_feed", e))?;
            Ok(Box::new(BufferedFeed {
                events: body.results.into_iter().map(Into::into).collect(),
            }))
        }
    }

    async fn fetch(
        &self,
        doc_id: &str,
        revs: &[String],
        include_attachments: bool,
    ) -> Result<Vec<Document>> {
        let open_revs = serde_json::to_string(revs)
            .map_err(|e| ReplicationError::Internal(format!("open_revs encode: {}", e)))?;
        let mut query = vec![
            ("revs", "true".to_string()),
            ("latest", "true".to_string()),
            ("open_revs", open_revs),
        ];
        if include_attachments {
            query.push(("attachments", "true".to_string()));
        }
        let entries: Vec<OpenRevEntry> = self
            .send(
                "fetch_docs",
                self.request(reqwest::Method::GET, doc_id)
                    .query(&query)
                    .header(reqwest::header::ACCEPT, "application/json"),
            )
            .await?
            .json()
            .await
            .map_err(|e| ReplicationError::transport_from("fetch_docs", e))?;
        // Revisions purged between revs_diff and fetch come back without
        // an "ok" member; they are simply no longer ours to copy
        Ok(entries.into_iter().filter_map(|e| e.ok).collect())
    }

    async fn read_checkpoint(&self, rep_id: &str) -> Result<Option<CheckpointDoc>> {
        read_checkpoint_http(self, rep_id).await
    }

    async fn write_checkpoint(&self, rep_id: &str, doc: &CheckpointDoc) -> Result<String> {
        write_checkpoint_http(self, rep_id, doc).await
    }
}

#[async_trait]
impl TargetPeer for HttpPeer {
    async fn ensure_exists(&self, create_if_missing: bool) -> Result<bool> {
        let response = self
            .request(reqwest::Method::HEAD, "")
            .send()
            .await
            .map_err(|e| ReplicationError::transport_from("ensure_exists", e))?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND if create_if_missing => {
                self.send("create_target", self.request(reqwest::Method::PUT, ""))
                    .await?;
                Ok(true)
            }
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(self.status_error("ensure_exists", s)),
        }
    }

    async fn revs_diff(
        &self,
        revs: HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, Vec<String>>> {
        let body: HashMap<String, MissingRevsEntry> = self
            .send(
                "revs_diff",
                self.request(reqwest::Method::POST, "_revs_diff").json(&revs),
            )
            .await?
            .json()
            .await
            .map_err(|e| ReplicationError::transport_from("revs_diff", e))?;
        Ok(body.into_iter().map(|(id, e)| (id, e.missing)).collect())
    }

    async fn bulk_write(
        &self,
        docs: Vec<Document>,
        preserve_rev_history: bool,
    ) -> Result<Vec<DocWriteOutcome>> {
        let payload = serde_json::json!({
            "docs": &docs,
            "new_edits": !preserve_rev_history,
        });
        let entries: Vec<BulkDocsEntry> = self
            .send(
                "bulk_write",
                self.request(reqwest::Method::POST, "_bulk_docs").json(&payload),
            )
            .await?
            .json()
            .await
            .map_err(|e| ReplicationError::transport_from("bulk_write", e))?;

        Ok(merge_bulk_outcomes(&docs, entries))
    }

    async fn read_checkpoint(&self, rep_id: &str) -> Result<Option<CheckpointDoc>> {
        read_checkpoint_http(self, rep_id).await
    }

    async fn write_checkpoint(&self, rep_id: &str, doc: &CheckpointDoc) -> Result<String> {
        write_checkpoint_http(self, rep_id, doc).await
    }
}

/// Match `_bulk_docs` failure entries back to the submitted documents.
///
/// With `new_edits=false` only failures are reported back; everything
/// absent from the response was stored. Entries carry a rev when the peer
/// reports one, so two revisions of the same document submitted in one
/// call resolve independently; an entry without a rev applies to every
/// submitted revision of that id.
fn merge_bulk_outcomes(docs: &[Document], entries: Vec<BulkDocsEntry>) -> Vec<DocWriteOutcome> {
    let mut by_id_rev: HashMap<(String, String), WriteOutcome> = HashMap::new();
    let mut by_id: HashMap<String, WriteOutcome> = HashMap::new();
    for entry in entries {
        let outcome = match entry.error.as_deref() {
            Some("conflict") => WriteOutcome::Conflict,
            Some(error) => WriteOutcome::Error(format!(
                "{}: {}",
                error,
                entry.reason.unwrap_or_default()
            )),
            None => WriteOutcome::Ok,
        };
        match entry.rev {
            Some(rev) => {
                by_id_rev.insert((entry.id, rev), outcome);
            }
            None => {
                by_id.insert(entry.id, outcome);
            }
        }
    }
    docs.iter()
        .map(|doc| {
            let outcome = by_id_rev
                .get(&(doc.id.clone(), doc.rev.clone()))
                .or_else(|| by_id.get(&doc.id))
                .cloned()
                .unwrap_or(WriteOutcome::Ok);
            DocWriteOutcome {
                doc_id: doc.id.clone(),
                rev: doc.rev.clone(),
                outcome,
            }
        })
        .collect()
}

async fn read_checkpoint_http(peer: &HttpPeer, rep_id: &str) -> Result<Option<CheckpointDoc>> {
    let path = format!("_local/{}", rep_id);
    let response = peer
        .request(reqwest::Method::GET, &path)
        .send()
        .await
        .map_err(|e| ReplicationError::transport_from("read_checkpoint", e))?;
    match response.status() {
        StatusCode::NOT_FOUND => Ok(None),
        s if s.is_success() => {
            let doc: CheckpointDoc = response
                .json()
                .await
                .map_err(|e| ReplicationError::transport_from("read_checkpoint", e))?;
            Ok(Some(doc))
        }
        s => Err(peer.status_error("read_checkpoint", s)),
    }
}

async fn write_checkpoint_http(
    peer: &HttpPeer,
    rep_id: &str,
    doc: &CheckpointDoc,
) -> Result<String> {
    let path = format!("_local/{}", rep_id);
    let response = peer
        .request(reqwest::Method::PUT, &path)
        .json(doc)
        .send()
        .await
        .map_err(|e| ReplicationError::transport_from("write_checkpoint", e))?;
    match response.status() {
        StatusCode::CONFLICT => Err(ReplicationError::CheckpointConflict {
            rep_id: rep_id.to_string(),
            peer: peer.base.clone(),
        }),
        s if s.is_success() => {
            let body: LocalDocRev = response
                .json()
                .await
                .map_err(|e| ReplicationError::transport_from("write_checkpoint", e))?;
            Ok(body.rev)
        }
        s => Err(peer.status_error("write_checkpoint", s)),
    }
}

/// Builds [`HttpPeer`]s over one shared client session.
pub struct HttpPeerBuilder {
    client: reqwest::Client,
}

impl HttpPeerBuilder {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .build()
            .map_err(|e| ReplicationError::Config(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl PeerBuilder for HttpPeerBuilder {
    fn source(&self, info: &PeerInfo) -> Result<Arc<dyn SourcePeer>> {
        Ok(Arc::new(HttpPeer::new(self.client.clone(), info)))
    }

    fn target(&self, info: &PeerInfo) -> Result<Arc<dyn TargetPeer>> {
        Ok(Arc::new(HttpPeer::new(self.client.clone(), info)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::TsSeq;
    use std::time::Duration;

    #[test]
    fn test_change_line_parse() {
        let line = r#"{"seq":42,"id":"doc1","changes":[{"rev":"3-c"},{"rev":"3-x"}],"deleted":false}"#;
        let parsed: ChangeLine = serde_json::from_str(line).unwrap();
        let event: ChangeEvent = parsed.into();
        assert_eq!(event.seq, 42);
        assert_eq!(event.doc_id, "doc1");
        assert_eq!(event.revs, vec!["3-c".to_string(), "3-x".to_string()]);
        assert!(!event.deleted);
    }

    #[test]
    fn test_change_line_deleted_default() {
        let line = r#"{"seq":7,"id":"gone","changes":[{"rev":"2-b"}],"deleted":true}"#;
        let parsed: ChangeLine = serde_json::from_str(line).unwrap();
        assert!(parsed.deleted);

        let line = r#"{"seq":8,"id":"here","changes":[{"rev":"1-a"}]}"#;
        let parsed: ChangeLine = serde_json::from_str(line).unwrap();
        assert!(!parsed.deleted);
    }

    #[test]
    fn test_changes_query_continuous() {
        let request = ChangesRequest {
            since: 99,
            continuous: true,
            heartbeat: Duration::from_secs(10),
            ..Default::default()
        };
        let query = changes_query(&request);
        assert!(query.contains(&("since".to_string(), "99".to_string())));
        assert!(query.contains(&("feed".to_string(), "continuous".to_string())));
        assert!(query.contains(&("heartbeat".to_string(), "10000".to_string())));
    }

    #[test]
    fn test_changes_query_normal_has_no_feed() {
        let request = ChangesRequest {
            since: 0,
            ..Default::default()
        };
        let query = changes_query(&request);
        assert!(!query.iter().any(|(k, _)| *k == "feed"));
    }

    #[test]
    fn test_db_info_epoch_parse() {
        let body: DbInfoBody =
            serde_json::from_str(r#"{"update_seq":10,"instance_start_time":"1700000000000"}"#)
                .unwrap();
        assert_eq!(body.instance_start_time.parse::<i64>().unwrap(), 1_700_000_000_000);
        assert_eq!(body.update_seq, 10);
    }

    #[test]
    fn test_checkpoint_doc_wire_shape() {
        let doc = CheckpointDoc {
            session_id: "abc".to_string(),
            ts: TsSeq::new(5, 17),
            docs_read: 3,
            docs_written: 3,
            doc_write_failures: 0,
            rev: None,
        };
        let json = serde_json::to_value(&doc).unwrap();
        // First write carries no _rev at all
        assert!(json.get("_rev").is_none());
        assert_eq!(json["ts"]["seq"], 17);
    }

    #[test]
    fn test_open_revs_entry_parse() {
        // Revision history arrives in the start/ids wire form
        let body = r#"[
            {"ok":{"_id":"doc1","_rev":"2-b","_revisions":{"start":2,"ids":["b","a"]}}},
            {"missing":"1-x"}
        ]"#;
        let entries: Vec<OpenRevEntry> = serde_json::from_str(body).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[1].ok.is_none());
        let doc = entries.into_iter().find_map(|e| e.ok).unwrap();
        assert_eq!(doc.rev, "2-b");
        assert_eq!(
            doc.rev_history,
            vec!["2-b".to_string(), "1-a".to_string()]
        );
    }

    fn submitted(rev: &str) -> Document {
        Document {
            id: "a".to_string(),
            rev: rev.to_string(),
            deleted: false,
            rev_history: vec![rev.to_string()],
            body: serde_json::json!({}),
        }
    }

    #[test]
    fn test_bulk_outcomes_keyed_by_rev() {
        // Two revisions of one document in a single call: the reported
        // conflict applies only to the revision it names
        let docs = vec![submitted("1-a"), submitted("2-b")];
        let entries: Vec<BulkDocsEntry> = serde_json::from_str(
            r#"[{"id":"a","rev":"2-b","error":"conflict","reason":"rejected"}]"#,
        )
        .unwrap();
        let outcomes = merge_bulk_outcomes(&docs, entries);
        assert_eq!(outcomes[0].rev, "1-a");
        assert_eq!(outcomes[0].outcome, WriteOutcome::Ok);
        assert_eq!(outcomes[1].rev, "2-b");
        assert_eq!(outcomes[1].outcome, WriteOutcome::Conflict);
    }

    #[test]
    fn test_bulk_outcomes_entry_without_rev_matches_by_id() {
        let docs = vec![submitted("1-a"), submitted("2-b")];
        let entries: Vec<BulkDocsEntry> = serde_json::from_str(
            r#"[{"id":"a","error":"forbidden","reason":"validation"}]"#,
        )
        .unwrap();
        let outcomes = merge_bulk_outcomes(&docs, entries);
        assert!(matches!(outcomes[0].outcome, WriteOutcome::Error(_)));
        assert!(matches!(outcomes[1].outcome, WriteOutcome::Error(_)));
    }

    #[tokio::test]
    async fn test_buffered_feed_drains_and_ends() {
        let mut feed = BufferedFeed {
            events: vec![
                ChangeEvent {
                    seq: 1,
                    doc_id: "a".to_string(),
                    revs: vec!["1-a".to_string()],
                    deleted: false,
                },
            ]
            .into(),
        };
        assert_eq!(feed.next().await.unwrap().unwrap().seq, 1);
        assert!(feed.next().await.unwrap().is_none());
    }
}

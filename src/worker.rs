// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch worker: turns a slice of the change feed into documents on the
//! target.
//!
//! Each worker loops on the shared [`WorkQueue`], and for every batch:
//!
//! 1. deduplicates `(doc_id, rev)` pairs across the batch's events
//! 2. asks the target which of those revisions it lacks (`revs_diff`)
//! 3. fetches only the missing revisions from the source
//! 4. writes them to the target in small buffered flushes
//! 5. reports the batch's sequence range and counters to the reports
//!    channel, where the replication's watermark loop commits it
//!
//! Step 2 is what makes re-running a range harmless: revisions the target
//! already holds are filtered out before any document bytes move, so a
//! replayed batch settles into a no-op.
//!
//! Per-document write failures are counted, logged, and tolerated; the
//! batch still completes and the failed revisions surface again on the
//! next run from an older checkpoint only if the operator restarts the
//! replication. Transport failures are retried per the worker's
//! [`RetryConfig`] and, once retries are exhausted, fail the affected
//! documents rather than the batch. Only fatal peer errors (bad
//! credentials, checkpoint ownership) fail the whole replication, and a
//! worker hitting one closes the queue so the rest of the pipeline
//! stops with it.

use crate::error::Result;
use crate::metrics;
use crate::peer::{ChangeEvent, Document, SourcePeer, TargetPeer};
use crate::resilience::{with_retry, RetryConfig};
use crate::watermark::SeqRange;
use crate::work_queue::{Dequeued, WorkQueue};
use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Documents buffered per `bulk_write` call.
const DOCS_BUFFER_SIZE: usize = 10;

/// One reader-sliced slice of the change feed.
///
/// `range.since` abuts the previous batch's `range.through` exactly, so
/// the watermark can coalesce completed batches back into a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBatch {
    pub range: SeqRange,
    pub events: Vec<ChangeEvent>,
}

/// Counters accumulated while processing batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Revisions offered to `revs_diff`.
    pub missing_checked: u64,
    /// Revisions the target reported missing.
    pub missing_found: u64,
    /// Documents fetched from the source.
    pub docs_read: u64,
    /// Documents accepted by the target.
    pub docs_written: u64,
    /// Documents the target rejected individually.
    pub doc_write_failures: u64,
}

impl AddAssign for BatchStats {
    fn add_assign(&mut self, other: Self) {
        self.missing_checked += other.missing_checked;
        self.missing_found += other.missing_found;
        self.docs_read += other.docs_read;
        self.docs_written += other.docs_written;
        self.doc_write_failures += other.doc_write_failures;
    }
}

/// A completed batch, sent to the replication's reports loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub range: SeqRange,
    pub stats: BatchStats,
}

/// One member of a replication's worker pool.
pub struct ReplicationWorker {
    /// Short random id for log correlation.
    id: String,
    rep_id: String,
    source: Arc<dyn SourcePeer>,
    target: Arc<dyn TargetPeer>,
    queue: Arc<WorkQueue<ChangeBatch>>,
    reports: mpsc::Sender<BatchReport>,
    retry: RetryConfig,
}

impl ReplicationWorker {
    pub fn new(
        rep_id: String,
        source: Arc<dyn SourcePeer>,
        target: Arc<dyn TargetPeer>,
        queue: Arc<WorkQueue<ChangeBatch>>,
        reports: mpsc::Sender<BatchReport>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            id: format!("{:04x}", rand::random::<u16>()),
            rep_id,
            source,
            target,
            queue,
            reports,
            retry,
        }
    }

    /// Consume batches until the queue closes.
    pub async fn run(self) -> Result<()> {
        debug!(worker = %self.id, rep_id = %self.rep_id, "worker started");
        loop {
            match self.queue.get(1).await {
                Dequeued::Items(batches) => {
                    for batch in batches {
                        let report = match self.process_batch(batch).await {
                            Ok(report) => report,
                            Err(e) => {
                                // Fatal peer error: bring the whole
                                // pipeline down, not just this worker
                                self.queue.close().await;
                                return Err(e);
                            }
                        };
                        if self.reports.send(report).await.is_err() {
                            // Reports loop is gone; the replication is
                            // shutting down
                            return Ok(());
                        }
                    }
                }
                Dequeued::Closed => {
                    debug!(worker = %self.id, rep_id = %self.rep_id, "queue closed, worker done");
                    return Ok(());
                }
            }
        }
    }

    async fn process_batch(&self, batch: ChangeBatch) -> Result<BatchReport> {
        let started = Instant::now();
        let range = batch.range;
        let mut stats = BatchStats::default();

        let by_doc = dedup_revs(&batch.events);
        stats.missing_checked = by_doc.values().map(|revs| revs.len() as u64).sum();
        metrics::record_missing_checked(&self.rep_id, stats.missing_checked as usize);

        if by_doc.is_empty() {
            // Nothing but filtered-out positions; still reported so the
            // watermark can advance past this range
            return Ok(BatchReport { range, stats });
        }

        let missing = match with_retry(&self.retry, "revs_diff", || {
            self.target.revs_diff(by_doc.clone())
        })
        .await
        {
            Ok(missing) => missing,
            Err(e) if !e.is_fatal() => {
                // Without a diff every offered revision is unaccounted
                // for; count them all failed and let the batch complete
                stats.doc_write_failures = stats.missing_checked;
                warn!(
                    worker = %self.id,
                    rep_id = %self.rep_id,
                    error = %e,
                    "revs_diff exhausted retries, skipping batch documents"
                );
                metrics::record_doc_write_failures(&self.rep_id, stats.doc_write_failures as usize);
                return Ok(BatchReport { range, stats });
            }
            Err(e) => return Err(e),
        };
        stats.missing_found = missing.values().map(|revs| revs.len() as u64).sum();
        metrics::record_missing_found(&self.rep_id, stats.missing_found as usize);

        let mut buffer: Vec<Document> = Vec::with_capacity(DOCS_BUFFER_SIZE);
        for (doc_id, revs) in &missing {
            let docs = match with_retry(&self.retry, "fetch_docs", || {
                self.source.fetch(doc_id, revs, true)
            })
            .await
            {
                Ok(docs) => docs,
                Err(e) if !e.is_fatal() => {
                    stats.doc_write_failures += revs.len() as u64;
                    warn!(
                        worker = %self.id,
                        rep_id = %self.rep_id,
                        doc_id = %doc_id,
                        error = %e,
                        "fetch exhausted retries, skipping document"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            stats.docs_read += docs.len() as u64;
            buffer.extend(docs);
            while buffer.len() >= DOCS_BUFFER_SIZE {
                let flush: Vec<Document> = buffer.drain(..DOCS_BUFFER_SIZE).collect();
                self.flush(flush, &mut stats).await?;
            }
        }
        if !buffer.is_empty() {
            self.flush(buffer, &mut stats).await?;
        }

        metrics::record_docs_read(&self.rep_id, stats.docs_read as usize);
        metrics::record_docs_written(&self.rep_id, stats.docs_written as usize);
        metrics::record_doc_write_failures(&self.rep_id, stats.doc_write_failures as usize);
        metrics::record_batch_duration(&self.rep_id, started.elapsed());

        debug!(
            worker = %self.id,
            rep_id = %self.rep_id,
            since = range.since,
            through = range.through,
            missing_checked = stats.missing_checked,
            missing_found = stats.missing_found,
            docs_written = stats.docs_written,
            "batch complete"
        );
        Ok(BatchReport { range, stats })
    }

    async fn flush(&self, docs: Vec<Document>, stats: &mut BatchStats) -> Result<()> {
        let outcomes = match with_retry(&self.retry, "bulk_write", || {
            self.target.bulk_write(docs.clone(), true)
        })
        .await
        {
            Ok(outcomes) => outcomes,
            Err(e) if !e.is_fatal() => {
                stats.doc_write_failures += docs.len() as u64;
                warn!(
                    worker = %self.id,
                    rep_id = %self.rep_id,
                    count = docs.len(),
                    error = %e,
                    "bulk_write exhausted retries, documents skipped"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        for outcome in outcomes {
            if outcome.is_ok() {
                stats.docs_written += 1;
            } else {
                stats.doc_write_failures += 1;
                warn!(
                    worker = %self.id,
                    rep_id = %self.rep_id,
                    doc_id = %outcome.doc_id,
                    rev = %outcome.rev,
                    outcome = ?outcome.outcome,
                    "target rejected document"
                );
            }
        }
        Ok(())
    }
}

/// Merge a batch's events into per-document revision lists, dropping
/// duplicate `(doc_id, rev)` pairs while keeping first-seen order.
fn dedup_revs(events: &[ChangeEvent]) -> HashMap<String, Vec<String>> {
    let mut by_doc: HashMap<String, Vec<String>> = HashMap::new();
    for event in events {
        let revs = by_doc.entry(event.doc_id.clone()).or_default();
        for rev in &event.revs {
            if !revs.contains(rev) {
                revs.push(rev.clone());
            }
        }
    }
    by_doc
}

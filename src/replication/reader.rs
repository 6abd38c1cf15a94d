// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change reader: the single producer feeding the worker pool.
//!
//! Slices the source's change feed into [`ChangeBatch`]es whose sequence
//! ranges abut exactly: each batch's `since` is the previous batch's
//! `through`. The watermark depends on that to stitch completed batches
//! back into a contiguous prefix.
//!
//! The reader owns reconnection. A dropped feed is reopened from the last
//! *flushed* position with exponential backoff; events buffered but not
//! yet handed to the queue are discarded and redelivered by the reopened
//! feed. Replaying a range is harmless downstream (`revs_diff` filters
//! already-copied revisions), losing one is not.

use crate::error::Result;
use crate::peer::{ChangeEvent, ChangeFeed, ChangesRequest, SourcePeer};
use crate::resilience::{with_retry, RetryConfig};
use crate::watermark::SeqRange;
use crate::work_queue::WorkQueue;
use crate::worker::ChangeBatch;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// How long a continuous reader holds a partial batch before flushing it.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

enum FeedEnd {
    /// Feed exhausted, or a live connection closed cleanly.
    Finished,
    /// The queue closed under us; the replication is shutting down.
    QueueClosed,
}

pub struct ChangeReader {
    rep_id: String,
    source: Arc<dyn SourcePeer>,
    queue: Arc<WorkQueue<ChangeBatch>>,
    request: ChangesRequest,
    batch_size: usize,
    retry: RetryConfig,
}

impl ChangeReader {
    pub fn new(
        rep_id: String,
        source: Arc<dyn SourcePeer>,
        queue: Arc<WorkQueue<ChangeBatch>>,
        request: ChangesRequest,
        batch_size: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            rep_id,
            source,
            queue,
            request,
            batch_size,
            retry,
        }
    }

    /// Pump the feed until it ends (non-continuous) or the queue closes.
    pub async fn run(self) -> Result<()> {
        let mut position = self.request.since;
        let mut attempt = 1usize;
        let mut position_at_last_error = u64::MAX;

        loop {
            let open_result = with_retry(&self.retry, "open_changes", || {
                let mut request = self.request.clone();
                request.since = position;
                self.source.open_changes(request)
            })
            .await;
            let mut feed = match open_result {
                Ok(feed) => feed,
                Err(e) => return self.bail(e).await,
            };
            debug!(rep_id = %self.rep_id, since = position, "change feed open");

            match self.pump(feed.as_mut(), &mut position).await {
                Ok(FeedEnd::Finished) if !self.request.continuous => {
                    debug!(rep_id = %self.rep_id, through = position, "change feed exhausted");
                    self.queue.close().await;
                    return Ok(());
                }
                Ok(FeedEnd::Finished) => {
                    // The peer closed a live feed cleanly; treat it like a
                    // dropped connection and reopen from the flushed
                    // position
                    if position != position_at_last_error {
                        attempt = 1;
                        position_at_last_error = position;
                    } else {
                        attempt += 1;
                    }
                    if attempt >= self.retry.max_attempts {
                        return self
                            .bail(crate::error::ReplicationError::transport(
                                "changes_feed",
                                "continuous feed kept closing",
                            ))
                            .await;
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        rep_id = %self.rep_id,
                        since = position,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "continuous change feed ended, reopening"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(FeedEnd::QueueClosed) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    // Progress since the last drop resets the backoff
                    if position != position_at_last_error {
                        attempt = 1;
                        position_at_last_error = position;
                    } else {
                        attempt += 1;
                    }
                    if attempt >= self.retry.max_attempts {
                        return self.bail(e).await;
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        rep_id = %self.rep_id,
                        since = position,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "change feed dropped, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return self.bail(e).await,
            }
        }
    }

    /// Close the queue so the workers drain, then surface the error.
    /// Leaving the queue open would park the workers forever.
    async fn bail(&self, e: crate::error::ReplicationError) -> Result<()> {
        self.queue.close().await;
        Err(e)
    }

    async fn pump(&self, feed: &mut dyn ChangeFeed, position: &mut u64) -> Result<FeedEnd> {
        let mut events = Vec::with_capacity(self.batch_size);
        let mut through = *position;

        loop {
            // A continuous feed can sit at the tip indefinitely; don't let
            // a partial batch sit with it
            let next = if self.request.continuous && !events.is_empty() {
                match timeout(FLUSH_INTERVAL, feed.next()).await {
                    Ok(result) => result?,
                    Err(_) => {
                        if self
                            .flush(&mut events, position, through)
                            .await
                            .is_err()
                        {
                            return Ok(FeedEnd::QueueClosed);
                        }
                        continue;
                    }
                }
            } else {
                feed.next().await?
            };

            match next {
                Some(event) => {
                    crate::metrics::record_changes_read(&self.rep_id, 1);
                    through = event.seq;
                    events.push(event);
                    if events.len() >= self.batch_size
                        && self
                            .flush(&mut events, position, through)
                            .await
                            .is_err()
                    {
                        return Ok(FeedEnd::QueueClosed);
                    }
                }
                None => {
                    if self.flush(&mut events, position, through).await.is_err() {
                        return Ok(FeedEnd::QueueClosed);
                    }
                    return Ok(FeedEnd::Finished);
                }
            }
        }
    }

    /// Hand the buffered events to the queue as one batch and advance the
    /// flushed position. Err means the queue closed.
    async fn flush(
        &self,
        events: &mut Vec<ChangeEvent>,
        position: &mut u64,
        through: u64,
    ) -> std::result::Result<(), crate::work_queue::QueueClosed> {
        if events.is_empty() {
            return Ok(());
        }
        let batch = ChangeBatch {
            range: SeqRange::new(*position, through),
            events: std::mem::take(events),
        };
        self.queue.put(batch).await?;
        *position = through;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplicationError;
    use crate::memory_peer::MemoryPeer;
    use crate::peer::{CheckpointDoc, Document, PeerMeta};
    use crate::work_queue::Dequeued;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Source whose live feed ends after each scripted connection, like a
    /// peer dropping the connection cleanly.
    struct FlakySource {
        connections: Mutex<VecDeque<Vec<ChangeEvent>>>,
        opens: AtomicUsize,
    }

    impl FlakySource {
        fn new(connections: Vec<Vec<ChangeEvent>>) -> Self {
            Self {
                connections: Mutex::new(connections.into_iter().collect()),
                opens: AtomicUsize::new(0),
            }
        }
    }

    struct ScriptedFeed {
        events: VecDeque<ChangeEvent>,
    }

    #[async_trait]
    impl ChangeFeed for ScriptedFeed {
        async fn next(&mut self) -> Result<Option<ChangeEvent>> {
            Ok(self.events.pop_front())
        }
    }

    #[async_trait]
    impl SourcePeer for FlakySource {
        async fn info(&self) -> Result<PeerMeta> {
            Ok(PeerMeta {
                update_seq: 0,
                epoch: 1,
            })
        }

        async fn open_changes(&self, request: ChangesRequest) -> Result<Box<dyn ChangeFeed>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let script = self
                .connections
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();
            let events = script
                .into_iter()
                .filter(|e| e.seq > request.since)
                .collect();
            Ok(Box::new(ScriptedFeed { events }))
        }

        async fn fetch(
            &self,
            _doc_id: &str,
            _revs: &[String],
            _include_attachments: bool,
        ) -> Result<Vec<Document>> {
            Ok(Vec::new())
        }

        async fn read_checkpoint(&self, _rep_id: &str) -> Result<Option<CheckpointDoc>> {
            Ok(None)
        }

        async fn write_checkpoint(&self, _rep_id: &str, _doc: &CheckpointDoc) -> Result<String> {
            Err(ReplicationError::Internal(
                "not a checkpoint peer".to_string(),
            ))
        }
    }

    fn change(seq: u64, doc_id: &str) -> ChangeEvent {
        ChangeEvent {
            seq,
            doc_id: doc_id.to_string(),
            revs: vec![format!("{}-r", seq)],
            deleted: false,
        }
    }

    fn reader(
        source: &MemoryPeer,
        queue: &Arc<WorkQueue<ChangeBatch>>,
        request: ChangesRequest,
        batch_size: usize,
    ) -> ChangeReader {
        ChangeReader::new(
            "rep-test".to_string(),
            Arc::new(source.clone()),
            Arc::clone(queue),
            request,
            batch_size,
            RetryConfig::testing(),
        )
    }

    #[tokio::test]
    async fn test_reader_slices_into_abutting_batches() {
        let source = MemoryPeer::new();
        for i in 0..5 {
            source.update_doc(&format!("doc{}", i), json!({}));
        }
        let queue = Arc::new(WorkQueue::new(8));
        reader(&source, &queue, ChangesRequest::default(), 2)
            .run()
            .await
            .unwrap();

        let mut batches = Vec::new();
        loop {
            match queue.get(1).await {
                Dequeued::Items(items) => batches.extend(items),
                Dequeued::Closed => break,
            }
        }
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].range, SeqRange::new(0, 2));
        assert_eq!(batches[1].range, SeqRange::new(2, 4));
        assert_eq!(batches[2].range, SeqRange::new(4, 5));
        assert_eq!(batches[2].events.len(), 1);
        // Ranges abut pairwise
        for pair in batches.windows(2) {
            assert_eq!(pair[0].range.through, pair[1].range.since);
        }
    }

    #[tokio::test]
    async fn test_reader_starts_from_since() {
        let source = MemoryPeer::new();
        for i in 0..4 {
            source.update_doc(&format!("doc{}", i), json!({}));
        }
        let queue = Arc::new(WorkQueue::new(8));
        let request = ChangesRequest {
            since: 2,
            ..Default::default()
        };
        reader(&source, &queue, request, 10).run().await.unwrap();

        match queue.get(10).await {
            Dequeued::Items(batches) => {
                assert_eq!(batches.len(), 1);
                assert_eq!(batches[0].range, SeqRange::new(2, 4));
                assert_eq!(batches[0].events[0].seq, 3);
            }
            Dequeued::Closed => panic!("expected a batch"),
        }
    }

    #[tokio::test]
    async fn test_reader_closes_queue_on_empty_feed() {
        let source = MemoryPeer::new();
        let queue = Arc::new(WorkQueue::new(8));
        reader(&source, &queue, ChangesRequest::default(), 10)
            .run()
            .await
            .unwrap();
        assert_eq!(queue.get(1).await, Dequeued::Closed);
    }

    #[tokio::test]
    async fn test_reader_stops_when_queue_closed() {
        let source = MemoryPeer::new();
        source.update_doc("a", json!({}));
        let queue = Arc::new(WorkQueue::new(1));
        queue.close().await;
        // Should return cleanly instead of erroring
        reader(&source, &queue, ChangesRequest::default(), 1)
            .run()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_continuous_reader_reopens_cleanly_closed_feed() {
        let source = std::sync::Arc::new(FlakySource::new(vec![
            vec![change(1, "a")],
            vec![change(2, "b")],
        ]));
        let queue = Arc::new(WorkQueue::new(8));
        let r = ChangeReader::new(
            "rep-test".to_string(),
            Arc::clone(&source) as Arc<dyn SourcePeer>,
            Arc::clone(&queue),
            ChangesRequest {
                continuous: true,
                ..Default::default()
            },
            1,
            RetryConfig::testing(),
        );
        let result = r.run().await;

        // Events from both connections arrived as abutting batches; the
        // run did not complete after the first clean close
        let batch = match queue.get(1).await {
            Dequeued::Items(mut items) => items.remove(0),
            Dequeued::Closed => panic!("queue closed before first batch"),
        };
        assert_eq!(batch.range, SeqRange::new(0, 1));
        let batch = match queue.get(1).await {
            Dequeued::Items(mut items) => items.remove(0),
            Dequeued::Closed => panic!("queue closed before second batch"),
        };
        assert_eq!(batch.range, SeqRange::new(1, 2));
        assert_eq!(queue.get(1).await, Dequeued::Closed);

        // Reopened past the scripted connections until the empty reopens
        // exhausted the bounded test retry budget
        assert!(source.opens.load(Ordering::SeqCst) > 2);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_continuous_reader_flushes_partial_batches() {
        let source = MemoryPeer::new();
        source.update_doc("a", json!({}));
        let queue = Arc::new(WorkQueue::new(8));
        let request = ChangesRequest {
            continuous: true,
            ..Default::default()
        };
        let r = reader(&source, &queue, request, 100);
        let handle = tokio::spawn(r.run());

        // Batch size is 100 but the flush interval hands over the single
        // event anyway
        let batch = match queue.get(1).await {
            Dequeued::Items(mut items) => items.remove(0),
            Dequeued::Closed => panic!("queue closed early"),
        };
        assert_eq!(batch.range, SeqRange::new(0, 1));

        // A later write shows up as a follow-on abutting batch
        source.update_doc("b", json!({}));
        let batch = match queue.get(1).await {
            Dequeued::Items(mut items) => items.remove(0),
            Dequeued::Closed => panic!("queue closed early"),
        };
        assert_eq!(batch.range, SeqRange::new(1, 2));

        handle.abort();
    }
}

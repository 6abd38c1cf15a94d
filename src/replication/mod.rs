// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! One replication run: reader, worker pool, watermark, checkpoints.
//!
//! # Pipeline
//!
//! ```text
//!   source feed                bounded queue             target
//!  +-----------+   batches   +-----------+   batches   +--------+
//!  |  reader   +------------->  WorkQueue +------------->workers |
//!  +-----------+             +-----------+             +---+----+
//!                                                          | reports
//!                                                 +--------v--------+
//!                                                 |  reports loop   |
//!                                                 | watermark +     |
//!                                                 | checkpointer    |
//!                                                 +-----------------+
//! ```
//!
//! The reports loop is the only writer of the watermark and the only
//! checkpoint author, so "what is committed" has a single owner.
//!
//! # Checkpoint protocol
//!
//! Checkpoints are written to the source first, then the target, each
//! conditional on the revision read back from the previous write. A
//! revision conflict means another process owns this replication id and
//! is fatal. On resume the run takes the *lower* of the two stored
//! sequences; re-copying a range is a no-op, skipping one loses data.
//!
//! A stored checkpoint whose epoch differs from the source's current
//! epoch is discarded and the run restarts from sequence zero: the
//! source's sequence space was reset and the old number is meaningless.

pub mod reader;
pub mod state;

pub use reader::ChangeReader;
pub use state::{ReplicationState, ReplicationStatus, StateSnapshot};

use crate::config::ReplicationTask;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::peer::{ChangesRequest, CheckpointDoc, PeerBuilder, SourcePeer, TargetPeer, TsSeq};
use crate::resilience::{with_retry, RetryConfig};
use crate::watermark::Watermark;
use crate::work_queue::WorkQueue;
use crate::worker::{BatchStats, ReplicationWorker};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle to a running (or finished) replication.
pub struct Replication {
    rep_id: String,
    task: ReplicationTask,
    state: Arc<ReplicationState>,
    shutdown_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Replication {
    /// Build peers, then construct and spawn the run.
    pub fn launch(task: ReplicationTask, builder: &dyn PeerBuilder) -> Result<Arc<Self>> {
        task.validate()?;
        let source = builder.source(&task.source)?;
        let target = builder.target(&task.target)?;
        let rep_id = task.replication_id();
        let session_id = format!("{:016x}", rand::random::<u64>());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        let replication = Arc::new(Self {
            rep_id: rep_id.clone(),
            state: Arc::new(ReplicationState::new(rep_id.clone(), session_id)),
            task,
            shutdown_tx,
            done_rx,
        });

        let driver = Driver {
            rep_id,
            task: replication.task.clone(),
            state: Arc::clone(&replication.state),
            source,
            target,
            shutdown_rx,
            done_tx,
        };
        tokio::spawn(driver.drive());
        Ok(replication)
    }

    pub fn rep_id(&self) -> &str {
        &self.rep_id
    }

    pub fn task(&self) -> &ReplicationTask {
        &self.task
    }

    pub async fn status(&self) -> ReplicationStatus {
        self.state.status().await
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot().await
    }

    /// Request a drain and wait for the run to finish.
    ///
    /// In-flight batches complete and a final checkpoint is written
    /// before the state lands on `Stopped`.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }

    /// Wait for the run to end, however it ends. Safe to call from any
    /// number of tasks.
    pub async fn join(&self) -> Result<()> {
        let mut done = self.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                // Driver gone without signalling: it was torn down with
                // the runtime
                break;
            }
        }
        Ok(())
    }
}

/// The spawned task that owns the run end to end.
struct Driver {
    rep_id: String,
    task: ReplicationTask,
    state: Arc<ReplicationState>,
    source: Arc<dyn SourcePeer>,
    target: Arc<dyn TargetPeer>,
    shutdown_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
}

impl Driver {
    async fn drive(self) {
        match self.run().await {
            Ok(()) => {}
            Err(ReplicationError::Internal(message)) if message.starts_with("task panicked") => {
                self.state.crash(message).await;
            }
            Err(e) => {
                self.state.fail(e.to_string()).await;
            }
        }
        let _ = self.done_tx.send(true);
    }

    async fn run(&self) -> Result<()> {
        let retry = if self.task.continuous {
            RetryConfig::daemon()
        } else {
            RetryConfig::per_request(self.task.retries_per_request as u32)
        };

        let exists = with_retry(&retry, "ensure_exists", || {
            self.target.ensure_exists(self.task.create_target)
        })
        .await?;
        if !exists {
            return Err(ReplicationError::MissingTarget(self.task.target.url.clone()));
        }

        let meta = with_retry(&retry, "source_info", || self.source.info()).await?;
        self.state.set_source_seq(meta.update_seq).await;

        let (mut checkpointer, start_seq, restored) =
            self.load_checkpoints(&retry, meta.epoch).await?;
        self.state.restore(start_seq, restored).await;
        info!(
            rep_id = %self.rep_id,
            since = start_seq,
            source_seq = meta.update_seq,
            continuous = self.task.continuous,
            "replication starting"
        );

        self.state.transition(ReplicationStatus::Running).await?;

        let queue = Arc::new(WorkQueue::new(self.task.queue_capacity));
        let (report_tx, mut report_rx) = mpsc::channel(self.task.worker_count * 2);

        let request = ChangesRequest {
            since: start_seq,
            continuous: self.task.continuous,
            filter: self.task.filter.clone(),
            query_params: self.task.query_params.clone(),
            doc_ids: self.task.doc_ids.clone(),
            heartbeat: self.task.heartbeat,
        };
        let reader = ChangeReader::new(
            self.rep_id.clone(),
            Arc::clone(&self.source),
            Arc::clone(&queue),
            request,
            self.task.batch_size,
            retry.clone(),
        );
        let reader_handle = tokio::spawn(reader.run());

        let mut worker_handles = Vec::with_capacity(self.task.worker_count);
        for _ in 0..self.task.worker_count {
            let worker = ReplicationWorker::new(
                self.rep_id.clone(),
                Arc::clone(&self.source),
                Arc::clone(&self.target),
                Arc::clone(&queue),
                report_tx.clone(),
                retry.clone(),
            );
            worker_handles.push(tokio::spawn(worker.run()));
        }
        // The reports channel must close once every worker is done
        drop(report_tx);

        let mut watermark = Watermark::new(start_seq);
        let mut stopping = false;
        let mut ticker = tokio::time::interval(self.task.checkpoint_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown_rx.clone();

        let pumped: Result<()> = loop {
            tokio::select! {
                report = report_rx.recv() => match report {
                    Some(report) => {
                        let through = watermark
                            .complete(report.range)
                            .unwrap_or_else(|| watermark.through_seq());
                        self.state.record_progress(through, report.stats).await;
                        checkpointer.on_progress(report.stats);
                        if checkpointer.doc_threshold_reached(watermark.through_seq()) {
                            if let Err(e) = self.commit(&mut checkpointer, watermark.through_seq()).await {
                                break Err(e);
                            }
                        }
                    }
                    None => break Ok(()),
                },
                _ = ticker.tick() => {
                    if checkpointer.behind(watermark.through_seq()) {
                        if let Err(e) = self.commit(&mut checkpointer, watermark.through_seq()).await {
                            break Err(e);
                        }
                    }
                },
                changed = shutdown.changed(), if !stopping => {
                    // A dropped handle counts as a stop request
                    if changed.is_err() || *shutdown.borrow() {
                        stopping = true;
                        info!(rep_id = %self.rep_id, "stop requested, draining");
                        queue.close().await;
                    }
                },
            }
        };

        if let Err(e) = pumped {
            // Fatal mid-run (e.g. checkpoint conflict): tear the whole
            // pipeline down rather than leak it
            queue.close().await;
            reader_handle.abort();
            let _ = reader_handle.await;
            for handle in worker_handles {
                handle.abort();
                let _ = handle.await;
            }
            return Err(e);
        }

        // Reports channel closed: every worker has exited
        let mut failure = None;
        for handle in worker_handles {
            if let Err(e) = join_task(handle).await {
                failure.get_or_insert(e);
            }
        }
        if stopping || failure.is_some() {
            // A continuous reader may be parked at the feed tip
            reader_handle.abort();
            let _ = reader_handle.await;
        } else if let Err(e) = join_task(reader_handle).await {
            failure.get_or_insert(e);
        }
        if let Some(e) = failure {
            return Err(e);
        }

        if !stopping {
            self.state.transition(ReplicationStatus::Completing).await?;
        }
        if checkpointer.behind(watermark.through_seq()) {
            self.commit(&mut checkpointer, watermark.through_seq()).await?;
        }
        let final_status = if stopping {
            ReplicationStatus::Stopped
        } else {
            ReplicationStatus::Completed
        };
        self.state.transition(final_status).await?;
        info!(
            rep_id = %self.rep_id,
            through = watermark.through_seq(),
            status = %final_status,
            "replication finished"
        );
        Ok(())
    }

    /// Read both peers' checkpoints and derive the resume point.
    async fn load_checkpoints(
        &self,
        retry: &RetryConfig,
        epoch: i64,
    ) -> Result<(Checkpointer, u64, BatchStats)> {
        let mut checkpointer = Checkpointer {
            rep_id: self.rep_id.clone(),
            session_id: self.state.session_id().to_string(),
            source: Arc::clone(&self.source),
            target: Arc::clone(&self.target),
            epoch,
            enabled: self.task.use_checkpoints,
            source_rev: None,
            target_rev: None,
            committed_seq: 0,
            docs_since_commit: 0,
            docs_threshold: self.task.checkpoint_docs,
            stats_total: BatchStats::default(),
            retry: retry.clone(),
        };

        if !self.task.use_checkpoints {
            let start = self.task.since_seq.unwrap_or(0);
            checkpointer.committed_seq = start;
            return Ok((checkpointer, start, BatchStats::default()));
        }

        let source_cp = with_retry(retry, "read_checkpoint", || {
            self.source.read_checkpoint(&self.rep_id)
        })
        .await?;
        let target_cp = with_retry(retry, "read_checkpoint", || {
            self.target.read_checkpoint(&self.rep_id)
        })
        .await?;
        checkpointer.source_rev = source_cp.as_ref().and_then(|c| c.rev.clone());
        checkpointer.target_rev = target_cp.as_ref().and_then(|c| c.rev.clone());

        let (mut start, mut stats) = resume_point(source_cp.as_ref(), target_cp.as_ref(), epoch);
        if source_cp.is_some() && start == 0 {
            warn!(
                rep_id = %self.rep_id,
                epoch,
                "stored checkpoint unusable, restarting from zero"
            );
        }
        if let Some(override_seq) = self.task.since_seq {
            // Operator override: counters restart along with the position
            start = override_seq;
            stats = BatchStats::default();
        }
        checkpointer.committed_seq = start;
        Ok((checkpointer, start, stats))
    }

    async fn commit(&self, checkpointer: &mut Checkpointer, seq: u64) -> Result<()> {
        match checkpointer.commit(seq).await {
            Ok(()) => {
                self.state.set_checkpointed_seq(seq).await;
                metrics::record_checkpoint(&self.rep_id, true);
                Ok(())
            }
            Err(e) => {
                metrics::record_checkpoint(&self.rep_id, false);
                Err(e)
            }
        }
    }
}

/// Writes the paired checkpoint documents, source first.
struct Checkpointer {
    rep_id: String,
    session_id: String,
    source: Arc<dyn SourcePeer>,
    target: Arc<dyn TargetPeer>,
    epoch: i64,
    enabled: bool,
    source_rev: Option<String>,
    target_rev: Option<String>,
    committed_seq: u64,
    docs_since_commit: u64,
    docs_threshold: u64,
    /// Cumulative counters, restored stats included.
    stats_total: BatchStats,
    retry: RetryConfig,
}

impl Checkpointer {
    fn on_progress(&mut self, stats: BatchStats) {
        self.docs_since_commit += stats.docs_written;
        self.stats_total += stats;
    }

    /// Enough committed documents to warrant an early checkpoint.
    fn doc_threshold_reached(&self, seq: u64) -> bool {
        self.behind(seq) && self.docs_since_commit >= self.docs_threshold
    }

    /// The watermark has moved past the last checkpoint.
    fn behind(&self, seq: u64) -> bool {
        self.enabled && seq > self.committed_seq
    }

    async fn commit(&mut self, seq: u64) -> Result<()> {
        if !self.behind(seq) {
            return Ok(());
        }
        let mut doc = CheckpointDoc {
            session_id: self.session_id.clone(),
            ts: TsSeq::new(self.epoch, seq),
            docs_read: self.stats_total.docs_read,
            docs_written: self.stats_total.docs_written,
            doc_write_failures: self.stats_total.doc_write_failures,
            rev: self.source_rev.clone(),
        };
        let source_doc = doc.clone();
        self.source_rev = Some(
            with_retry(&self.retry, "write_checkpoint", || {
                self.source.write_checkpoint(&self.rep_id, &source_doc)
            })
            .await?,
        );
        doc.rev = self.target_rev.clone();
        let target_doc = doc.clone();
        self.target_rev = Some(
            with_retry(&self.retry, "write_checkpoint", || {
                self.target.write_checkpoint(&self.rep_id, &target_doc)
            })
            .await?,
        );
        self.committed_seq = seq;
        self.docs_since_commit = 0;
        Ok(())
    }
}

/// Derive the resume sequence and restored counters from the two stored
/// checkpoints. Either checkpoint is unusable if its epoch differs from
/// the source's current one; any unusable or missing checkpoint forces a
/// restart from zero.
fn resume_point(
    source_cp: Option<&CheckpointDoc>,
    target_cp: Option<&CheckpointDoc>,
    epoch: i64,
) -> (u64, BatchStats) {
    fn valid(cp: Option<&CheckpointDoc>, epoch: i64) -> Option<&CheckpointDoc> {
        cp.filter(|c| c.ts.epoch == epoch)
    }
    match (valid(source_cp, epoch), valid(target_cp, epoch)) {
        (Some(source), Some(target)) => {
            // The lower of the two: re-copying is a no-op, skipping is not
            let cp = if source.ts.seq <= target.ts.seq {
                source
            } else {
                target
            };
            (
                cp.ts.seq,
                BatchStats {
                    docs_read: cp.docs_read,
                    docs_written: cp.docs_written,
                    doc_write_failures: cp.doc_write_failures,
                    ..BatchStats::default()
                },
            )
        }
        _ => (0, BatchStats::default()),
    }
}

async fn join_task(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(ReplicationError::Internal(format!("task panicked: {}", e))),
        // Cancelled tasks were aborted on purpose
        Err(_) => Ok(()),
    }
}

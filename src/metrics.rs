//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Change feed throughput
//! - Worker batch outcomes
//! - Checkpoint writes and lag
//! - Replication lifecycle transitions
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions.
//!
//! Labels use the replication id, never peer URLs (URLs may embed
//! credentials).

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record change events read from the source feed.
pub fn record_changes_read(rep_id: &str, count: usize) {
    counter!("replication_changes_read_total", "rep_id" => rep_id.to_string())
        .increment(count as u64);
}

/// Record revisions checked against the target (`revs_diff` input size).
pub fn record_missing_checked(rep_id: &str, count: usize) {
    counter!("replication_missing_checked_total", "rep_id" => rep_id.to_string())
        .increment(count as u64);
}

/// Record revisions the target reported missing.
pub fn record_missing_found(rep_id: &str, count: usize) {
    counter!("replication_missing_found_total", "rep_id" => rep_id.to_string())
        .increment(count as u64);
}

/// Record documents read from the source.
pub fn record_docs_read(rep_id: &str, count: usize) {
    counter!("replication_docs_read_total", "rep_id" => rep_id.to_string())
        .increment(count as u64);
}

/// Record documents written to the target.
pub fn record_docs_written(rep_id: &str, count: usize) {
    counter!("replication_docs_written_total", "rep_id" => rep_id.to_string())
        .increment(count as u64);
}

/// Record per-document write failures the run tolerated.
pub fn record_doc_write_failures(rep_id: &str, count: usize) {
    if count > 0 {
        counter!("replication_doc_write_failures_total", "rep_id" => rep_id.to_string())
            .increment(count as u64);
    }
}

/// Record a worker batch duration.
pub fn record_batch_duration(rep_id: &str, duration: Duration) {
    histogram!("replication_batch_duration_seconds", "rep_id" => rep_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record a checkpoint write.
pub fn record_checkpoint(rep_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_checkpoints_total", "rep_id" => rep_id.to_string(), "status" => status)
        .increment(1);
}

/// Record the committed sequence (watermark position).
pub fn record_committed_seq(rep_id: &str, seq: u64) {
    gauge!("replication_committed_seq", "rep_id" => rep_id.to_string()).set(seq as f64);
}

/// Record how far the committed sequence trails the source tip.
pub fn record_lag(rep_id: &str, source_seq: u64, committed_seq: u64) {
    gauge!("replication_lag_seqs", "rep_id" => rep_id.to_string())
        .set(source_seq.saturating_sub(committed_seq) as f64);
}

/// Record a replication lifecycle transition.
pub fn record_state_transition(rep_id: &str, state: &str) {
    counter!("replication_state_transitions_total", "rep_id" => rep_id.to_string(), "state" => state.to_string())
        .increment(1);
}

/// Record a task-store SQLite retry (SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_task_store_retry(operation: &str) {
    counter!("replication_task_store_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record transient peer failures that were retried.
pub fn record_retry(operation: &str) {
    counter!("replication_retries_total", "operation" => operation.to_string()).increment(1);
}

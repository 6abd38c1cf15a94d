//! # Doc Replicator
//!
//! A document replication engine: makes a target database converge to a
//! source database by copying document revisions, resumably and with
//! bounded memory.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             Manager                                  │
//! │  registry: one live run per replication id   TaskStore (SQLite)      │
//! │                                                                      │
//! │  ┌────────────────────────── Replication ──────────────────────────┐ │
//! │  │                                                                 │ │
//! │  │  ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌──────────────┐  │ │
//! │  │  │ reader   │──►│ WorkQueue │──►│ workers │──►│ reports loop │  │ │
//! │  │  │ _changes │   │ (bounded) │   │ (pool)  │   │ watermark +  │  │ │
//! │  │  └──────────┘   └───────────┘   └─────────┘   │ checkpoints  │  │ │
//! │  │                                               └──────────────┘  │ │
//! │  └─────────────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │                                                  │
//!   SourcePeer (read)                                TargetPeer (write)
//! ```
//!
//! ## Guarantees
//!
//! - **Idempotent convergence**: every batch asks the target what it is
//!   missing (`revs_diff`) before moving bytes, so replaying any part of
//!   the feed is a no-op.
//! - **Crash-safe resume**: checkpoints are only written at the
//!   watermark, the end of the longest unbroken prefix of completed
//!   batches, and are stored on both peers.
//! - **Bounded memory**: the queue between the reader and the workers is
//!   bounded, so pipeline memory does not scale with database size.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use doc_replicator::{Manager, ReplicationTask, TaskStore};
//! use doc_replicator::http_peer::HttpPeerBuilder;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> doc_replicator::Result<()> {
//!     let builder = Arc::new(HttpPeerBuilder::new()?);
//!     let store = TaskStore::open("tasks.db").await?;
//!     let manager = Manager::new(builder, store);
//!
//!     manager.recover().await?;
//!
//!     let task = ReplicationTask::new(
//!         "http://a:5984/source",
//!         "http://b:5984/target",
//!     )?
//!     .with_continuous(true);
//!     let rep_id = manager.start(task).await?;
//!     println!("replicating as {}", rep_id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod http_peer;
pub mod manager;
pub mod memory_peer;
pub mod metrics;
pub mod peer;
pub mod replication;
pub mod resilience;
pub mod task_store;
pub mod watermark;
pub mod work_queue;
pub mod worker;

// Re-exports for convenience
pub use config::{Credentials, PeerInfo, ReplicationTask};
pub use error::{ReplicationError, Result};
pub use manager::Manager;
pub use peer::{ChangeEvent, Document, PeerBuilder, SourcePeer, TargetPeer};
pub use replication::{Replication, ReplicationStatus, StateSnapshot};
pub use task_store::TaskStore;
pub use watermark::{SeqRange, Watermark};
pub use work_queue::{Dequeued, WorkQueue};

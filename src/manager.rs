// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication manager: the registry of running replications.
//!
//! One manager owns the peer session ([`PeerBuilder`]) and the persisted
//! task registry ([`TaskStore`]), and enforces the single invariant the
//! rest of the engine relies on: at most one live run per replication id.
//! Starting a task whose id is already running is idempotent and returns
//! the existing id instead of a second pipeline.
//!
//! # Recovery
//!
//! [`Manager::recover`] replays the persisted tasks after a process
//! restart. Continuous tasks come back up and stay; one-shot tasks get
//! one more run to reach completion (resuming from their peers'
//! checkpoints) and are retired from the store when they complete.

use crate::config::ReplicationTask;
use crate::error::{ReplicationError, Result};
use crate::peer::PeerBuilder;
use crate::replication::{Replication, StateSnapshot};
use crate::task_store::TaskStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct Manager {
    builder: Arc<dyn PeerBuilder>,
    store: Arc<TaskStore>,
    registry: RwLock<HashMap<String, Arc<Replication>>>,
}

impl Manager {
    pub fn new(builder: Arc<dyn PeerBuilder>, store: TaskStore) -> Self {
        Self {
            builder,
            store: Arc::new(store),
            registry: RwLock::new(HashMap::new()),
        }
    }

    /// Register and start a replication. Returns its replication id.
    ///
    /// Idempotent: if the same id is already live, the existing run is
    /// kept and its id returned. A terminal previous run (completed,
    /// stopped, failed) is replaced by a fresh one.
    pub async fn start(&self, task: ReplicationTask) -> Result<String> {
        task.validate()?;
        let rep_id = task.replication_id();

        let mut registry = self.registry.write().await;
        if let Some(existing) = registry.get(&rep_id) {
            if !existing.status().await.is_terminal() {
                info!(rep_id = %rep_id, "replication already live, reusing");
                return Ok(rep_id);
            }
        }

        self.store.save(&task).await?;
        let continuous = task.continuous;
        let replication = Replication::launch(task, self.builder.as_ref())?;
        registry.insert(rep_id.clone(), Arc::clone(&replication));
        drop(registry);

        if !continuous {
            // One-shot tasks retire themselves from the store once done;
            // anything short of Completed stays persisted for recovery
            let store = Arc::clone(&self.store);
            let rep = Arc::clone(&replication);
            tokio::spawn(async move {
                let _ = rep.join().await;
                if rep.status().await == crate::replication::ReplicationStatus::Completed {
                    if let Err(e) = store.remove(rep.rep_id()).await {
                        warn!(rep_id = %rep.rep_id(), error = %e, "failed to retire completed task");
                    }
                }
            });
        }
        info!(rep_id = %rep_id, continuous, "replication registered");
        Ok(rep_id)
    }

    /// Stop a replication and retire it from the store.
    ///
    /// An explicit stop is an operator decision to drop the task; it will
    /// not be recovered on the next boot.
    pub async fn stop(&self, rep_id: &str) -> Result<()> {
        let replication = self
            .registry
            .read()
            .await
            .get(rep_id)
            .cloned()
            .ok_or_else(|| ReplicationError::Config(format!("unknown replication: {}", rep_id)))?;
        replication.stop().await?;
        self.store.remove(rep_id).await?;
        Ok(())
    }

    /// Snapshot one replication's state.
    pub async fn status(&self, rep_id: &str) -> Option<StateSnapshot> {
        let replication = self.registry.read().await.get(rep_id).cloned()?;
        Some(replication.snapshot().await)
    }

    /// Snapshot every registered replication, terminal runs included.
    pub async fn list(&self) -> Vec<StateSnapshot> {
        let replications: Vec<Arc<Replication>> =
            self.registry.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(replications.len());
        for replication in replications {
            snapshots.push(replication.snapshot().await);
        }
        snapshots
    }

    /// Restart every persisted task after a process restart.
    ///
    /// Returns the number of replications started. Tasks that fail to
    /// start (e.g. an unknown peer scheme) are logged and skipped so one
    /// bad descriptor doesn't block recovery of the rest.
    pub async fn recover(&self) -> Result<usize> {
        let tasks = self.store.load_all().await?;
        let total = tasks.len();
        let mut started = 0;
        for task in tasks {
            let rep_id = task.replication_id();
            match self.start(task).await {
                Ok(_) => started += 1,
                Err(e) => warn!(rep_id = %rep_id, error = %e, "task recovery failed"),
            }
        }
        info!(started, total, "recovery complete");
        Ok(started)
    }

    /// Drain every live replication for process shutdown.
    ///
    /// Tasks stay persisted; a later [`recover`](Self::recover) resumes
    /// them from their checkpoints.
    pub async fn shutdown(&self) -> Result<()> {
        let replications: Vec<Arc<Replication>> =
            self.registry.read().await.values().cloned().collect();
        for replication in replications {
            if !replication.status().await.is_terminal() {
                if let Err(e) = replication.stop().await {
                    warn!(rep_id = %replication.rep_id(), error = %e, "stop during shutdown failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_peer::{MemoryPeer, MemoryPeerBuilder};
    use crate::replication::ReplicationStatus;
    use serde_json::json;
    use std::time::Duration;

    async fn manager_with(source: &MemoryPeer, target: &MemoryPeer) -> Manager {
        let builder = MemoryPeerBuilder::new();
        builder.register("mem://source", source.clone());
        builder.register("mem://target", target.clone());
        Manager::new(
            Arc::new(builder),
            TaskStore::in_memory().await.unwrap(),
        )
    }

    fn task() -> ReplicationTask {
        ReplicationTask::new("mem://source", "mem://target").unwrap()
    }

    async fn wait_terminal(manager: &Manager, rep_id: &str) -> StateSnapshot {
        for _ in 0..200 {
            if let Some(snap) = manager.status(rep_id).await {
                if snap.status.is_terminal() {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("replication {} never reached a terminal state", rep_id);
    }

    #[tokio::test]
    async fn test_start_runs_to_completion() {
        let source = MemoryPeer::new();
        source.update_doc("a", json!({}));
        let target = MemoryPeer::new();
        let manager = manager_with(&source, &target).await;

        let rep_id = manager.start(task()).await.unwrap();
        let snap = wait_terminal(&manager, &rep_id).await;
        assert_eq!(snap.status, ReplicationStatus::Completed);
        assert_eq!(target.stored_revs("a").len(), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_live() {
        let source = MemoryPeer::new();
        source.update_doc("a", json!({}));
        let manager = manager_with(&source, &MemoryPeer::new()).await;

        let continuous = task().with_continuous(true);
        let first = manager.start(continuous.clone()).await.unwrap();
        // Same semantics, different tuning: still the same id, no second run
        let second = manager
            .start(continuous.with_workers(16, 500))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.list().await.len(), 1);

        manager.stop(&first).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_run_can_be_restarted() {
        let source = MemoryPeer::new();
        source.update_doc("a", json!({}));
        let manager = manager_with(&source, &MemoryPeer::new()).await;

        let rep_id = manager.start(task()).await.unwrap();
        wait_terminal(&manager, &rep_id).await;

        // New document, same task: a fresh run picks it up
        source.update_doc("b", json!({}));
        let again = manager.start(task()).await.unwrap();
        assert_eq!(again, rep_id);
        let snap = wait_terminal(&manager, &rep_id).await;
        assert_eq!(snap.status, ReplicationStatus::Completed);
    }

    #[tokio::test]
    async fn test_stop_unknown_id_errors() {
        let manager = manager_with(&MemoryPeer::new(), &MemoryPeer::new()).await;
        assert!(matches!(
            manager.stop("missing").await,
            Err(ReplicationError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_completed_one_shot_retires_from_store() {
        let source = MemoryPeer::new();
        source.update_doc("a", json!({}));
        let manager = manager_with(&source, &MemoryPeer::new()).await;

        let rep_id = manager.start(task()).await.unwrap();
        wait_terminal(&manager, &rep_id).await;
        // Retirement runs in a background task
        for _ in 0..100 {
            if manager.store.get(&rep_id).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("completed one-shot still persisted");
    }

    #[tokio::test]
    async fn test_recover_restarts_persisted_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let source = MemoryPeer::new();
        source.update_doc("a", json!({}));
        let target = MemoryPeer::new();

        // First process: register a continuous task, then go away without
        // stopping it
        {
            let builder = MemoryPeerBuilder::new();
            builder.register("mem://source", source.clone());
            builder.register("mem://target", target.clone());
            let manager = Manager::new(
                Arc::new(builder),
                TaskStore::open(&path).await.unwrap(),
            );
            let rep_id = manager.start(task().with_continuous(true)).await.unwrap();
            for _ in 0..100 {
                if let Some(snap) = manager.status(&rep_id).await {
                    if snap.through_seq >= 1 {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            manager.shutdown().await.unwrap();
        }

        // Second process: recovery brings the task back
        let builder = MemoryPeerBuilder::new();
        builder.register("mem://source", source.clone());
        builder.register("mem://target", target.clone());
        let manager = Manager::new(
            Arc::new(builder),
            TaskStore::open(&path).await.unwrap(),
        );
        let recovered = manager.recover().await.unwrap();
        assert_eq!(recovered, 1);

        // And it picks up new writes
        source.update_doc("post-restart", json!({}));
        for _ in 0..200 {
            if !target.stored_revs("post-restart").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(target.stored_revs("post-restart").len(), 1);
        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_keeps_tasks_persisted() {
        let source = MemoryPeer::new();
        source.update_doc("a", json!({}));
        let manager = manager_with(&source, &MemoryPeer::new()).await;

        let rep_id = manager.start(task().with_continuous(true)).await.unwrap();
        manager.shutdown().await.unwrap();

        let snap = manager.status(&rep_id).await.unwrap();
        assert_eq!(snap.status, ReplicationStatus::Stopped);
        // Still in the store, unlike an explicit stop()
        assert!(manager.store.get(&rep_id).await.unwrap().is_some());
    }
}

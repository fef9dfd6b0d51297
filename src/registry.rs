//! # Syncer Registry
//!
//! The explicit registry mapping client groups to running syncer tasks: an
//! object constructed at startup and passed by reference into connection
//! handlers, with an explicit lifecycle (`get_or_create`, `get`,
//! `evict_idle`, `shutdown`) instead of process-global ambient state.
//!
//! Syncer tasks exit on their own when their last connection closes; the
//! registry lazily prunes finished entries and recreates tasks on demand.
//! Upstream changes are routed only to groups that are currently live, so an
//! unserved group's TTL clock stays paused.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::collab::UpstreamChange;
use crate::error::Result;
use crate::ownership::OwnershipManager;
use crate::store::StoreHandle;
use crate::syncer::{spawn_syncer, Collaborators, SyncerConfig, SyncerHandle};
use crate::ttl::Clock;
use crate::types::{ClientGroupId, TaskId};

/// Registry of live view syncers for one server task.
pub struct SyncerRegistry {
    task_id: TaskId,
    store: StoreHandle,
    collab: Collaborators,
    clock: Arc<dyn Clock>,
    config: SyncerConfig,
    groups: Mutex<HashMap<ClientGroupId, SyncerHandle>>,
}

impl SyncerRegistry {
    pub fn new(
        task_id: TaskId,
        store: StoreHandle,
        collab: Collaborators,
        clock: Arc<dyn Clock>,
        config: SyncerConfig,
    ) -> Self {
        Self {
            task_id,
            store,
            collab,
            clock,
            config,
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// The live syncer for a group, spawning one if absent or finished.
    pub async fn get_or_create(&self, group: &ClientGroupId) -> SyncerHandle {
        let mut groups = self.groups.lock().await;
        if let Some(handle) = groups.get(group) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }
        debug!(group = %group, "spawning view syncer");
        let handle = spawn_syncer(
            group.clone(),
            self.store.clone(),
            OwnershipManager::new(self.task_id.clone(), self.store.clone()),
            self.collab.clone(),
            Arc::clone(&self.clock),
            self.config.clone(),
        );
        groups.insert(group.clone(), handle.clone());
        handle
    }

    /// The live syncer for a group, if one is running.
    pub async fn get(&self, group: &ClientGroupId) -> Option<SyncerHandle> {
        let groups = self.groups.lock().await;
        groups.get(group).filter(|h| !h.is_closed()).cloned()
    }

    /// Routes an upstream transaction to a group, only if it is live.
    /// Unserved groups pick the change up from the store when they next
    /// load.
    pub async fn apply_upstream_change(
        &self,
        group: &ClientGroupId,
        change: UpstreamChange,
    ) -> Result<()> {
        match self.get(group).await {
            Some(handle) => handle.apply_upstream_change(change).await,
            None => Ok(()),
        }
    }

    /// Prunes finished syncers from the map; returns how many were removed.
    pub async fn evict_idle(&self) -> usize {
        let mut groups = self.groups.lock().await;
        let before = groups.len();
        groups.retain(|_, handle| !handle.is_closed());
        before - groups.len()
    }

    /// Number of live syncers.
    pub async fn len(&self) -> usize {
        let groups = self.groups.lock().await;
        groups.values().filter(|h| !h.is_closed()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stops every syncer (each performs its final clock flush).
    pub async fn shutdown(&self) {
        let handles: Vec<SyncerHandle> = {
            let mut groups = self.groups.lock().await;
            groups.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.stop().await;
        }
    }
}

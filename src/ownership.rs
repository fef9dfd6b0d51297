//! # Ownership Manager
//!
//! Arbitrates which server task is authoritative for a client group's CVR,
//! so rolling restarts can hand groups between instances without
//! coordination.
//!
//! This is deliberately not a consensus protocol. On any externally
//! triggered write to the CVR (new connection, explicit client deletion) the
//! manager unconditionally writes `owner = this task`; last writer wins.
//! Staleness is bounded by the version compare-and-swap on flushes: once the
//! winner persists anything, the loser's next flush conflicts, it reloads,
//! sees a foreign owner, and stops serving the group.

use crate::error::{Error, Result};
use crate::store::StoreHandle;
use crate::types::{ClientGroupId, ReplicaVersion, TaskId};

/// Claims client groups for one server task.
#[derive(Clone)]
pub struct OwnershipManager {
    task_id: TaskId,
    store: StoreHandle,
}

impl OwnershipManager {
    pub fn new(task_id: TaskId, store: StoreHandle) -> Self {
        Self { task_id, store }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Fire-and-forget takeover of a group. Creates the group's instance
    /// row, bound to the serving replica, if this is the first claim ever.
    pub async fn take(
        &self,
        group: &ClientGroupId,
        replica_version: &ReplicaVersion,
        now_ms: u64,
    ) -> Result<()> {
        self.store
            .take_ownership(group, &self.task_id, replica_version, now_ms)
            .await
    }

    /// Interprets a freshly loaded owner: a foreign task in the instance row
    /// after a write conflict means this task lost the group.
    pub fn check_owner(&self, owner: Option<&TaskId>) -> Result<()> {
        match owner {
            Some(other) if *other != self.task_id => Err(Error::OwnershipLost {
                owner: other.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

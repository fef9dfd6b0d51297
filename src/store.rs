//! # Versioned CVR Store
//!
//! Durable, transactional persistence of CVRs, keyed by client group. The
//! store is the single source of truth across server instances; in-memory
//! CVRs are caches owned by the currently-serving task.
//!
//! ## Architecture
//!
//! `rusqlite::Connection` is `!Sync`, so a dedicated OS thread owns it and
//! serves requests from async tasks over a channel:
//!
//! ```text
//! syncer tasks ──mpsc──► store thread (owns Connection) ──► SQLite (WAL)
//!      ▲                      │
//!      └──────oneshot─────────┘
//! ```
//!
//! ## Optimistic concurrency
//!
//! Every flush is a compare-and-swap: the instance row is updated only where
//! `(state_version, minor_version)` still equals the version the writer last
//! read. A failed swap returns [`Error::WriteConflict`]; the caller reloads
//! the CVR and retries the whole logical operation. Ownership takeover is
//! deliberately *not* guarded: last writer wins, and the loser is fenced by
//! its next failed swap.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::cvr::{Cvr, CvrChanges, DesiredState, QueryDef, QueryRecord, RowRecord};
use crate::error::{Error, Result};
use crate::poke::{CatchupPatch, QueryPatch, RowPatch};
use crate::types::{
    ClientGroupId, ClientId, ClientSchema, CvrVersion, QueryHash, ReplicaVersion, RowRef,
    StateVersion, TaskId,
};

// =============================================================================
// Configuration
// =============================================================================

/// Bound of the store request channel.
const STORE_CHANNEL_SIZE: usize = 256;

// =============================================================================
// Snapshots
// =============================================================================

/// A CVR as loaded from the store.
#[derive(Debug)]
pub struct CvrSnapshot {
    pub group: ClientGroupId,
    pub owner: Option<TaskId>,
    pub ownership_time_ms: u64,
    pub version: CvrVersion,
    pub replica_version: ReplicaVersion,
    pub ttl_clock_ms: u64,
    pub last_active_ms: u64,
    pub client_schema: Option<ClientSchema>,
    pub clients: BTreeSet<ClientId>,
    pub queries: BTreeMap<QueryHash, QueryRecord>,
    pub rows: HashMap<RowRef, RowRecord>,
}

impl CvrSnapshot {
    /// Builds the in-memory CVR, resuming (not advancing) the TTL clock.
    pub fn into_cvr(self, now_ms: u64) -> Cvr {
        Cvr::from_parts(
            self.group,
            self.version,
            self.replica_version,
            self.owner,
            self.ttl_clock_ms,
            self.last_active_ms,
            self.client_schema,
            self.clients,
            self.queries,
            self.rows,
            now_ms,
        )
    }
}

// =============================================================================
// Requests and Handle
// =============================================================================

/// A request served by the store thread.
enum StoreRequest {
    Load {
        group: ClientGroupId,
        respond: oneshot::Sender<Result<Option<CvrSnapshot>>>,
    },
    Flush {
        changes: CvrChanges,
        respond: oneshot::Sender<Result<()>>,
    },
    TakeOwnership {
        group: ClientGroupId,
        owner: TaskId,
        replica_version: ReplicaVersion,
        now_ms: u64,
        respond: oneshot::Sender<Result<()>>,
    },
    CatchupSince {
        group: ClientGroupId,
        base: CvrVersion,
        client_id: ClientId,
        respond: oneshot::Sender<Result<Vec<CatchupPatch>>>,
    },
    Shutdown {
        respond: oneshot::Sender<()>,
    },
}

/// Cloneable async handle to the store thread.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreRequest>,
}

impl StoreHandle {
    /// Loads a client group's CVR, or `None` if the group has never been
    /// seen.
    pub async fn load(&self, group: &ClientGroupId) -> Result<Option<CvrSnapshot>> {
        self.request(|respond| StoreRequest::Load {
            group: group.clone(),
            respond,
        })
        .await
    }

    /// Persists one write-set under the version compare-and-swap.
    pub async fn flush(&self, changes: CvrChanges) -> Result<()> {
        self.request(|respond| StoreRequest::Flush { changes, respond })
            .await
    }

    /// Unconditionally claims ownership of a group, creating its instance
    /// row (bound to `replica_version`) if this is the first claim ever.
    pub async fn take_ownership(
        &self,
        group: &ClientGroupId,
        owner: &TaskId,
        replica_version: &ReplicaVersion,
        now_ms: u64,
    ) -> Result<()> {
        self.request(|respond| StoreRequest::TakeOwnership {
            group: group.clone(),
            owner: owner.clone(),
            replica_version: replica_version.clone(),
            now_ms,
            respond,
        })
        .await
    }

    /// Every persisted patch newer than `base`, for catch-up of one client.
    pub async fn catchup_since(
        &self,
        group: &ClientGroupId,
        base: &CvrVersion,
        client_id: &ClientId,
    ) -> Result<Vec<CatchupPatch>> {
        self.request(|respond| StoreRequest::CatchupSince {
            group: group.clone(),
            base: base.clone(),
            client_id: client_id.clone(),
            respond,
        })
        .await
    }

    /// Stops the store thread after draining queued requests.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(StoreRequest::Shutdown { respond: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> StoreRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| Error::Stopped("cvr store"))?;
        rx.await.map_err(|_| Error::Stopped("cvr store"))?
    }
}

/// Spawns the store thread for an initialized database connection.
pub fn spawn_store(conn: Connection) -> StoreHandle {
    let (tx, mut rx) = mpsc::channel(STORE_CHANNEL_SIZE);

    std::thread::Builder::new()
        .name("viewsync-store".to_string())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("failed to create store runtime");
            rt.block_on(async move {
                while let Some(request) = rx.recv().await {
                    match request {
                        StoreRequest::Load { group, respond } => {
                            let _ = respond.send(load_snapshot(&conn, &group));
                        }
                        StoreRequest::Flush { changes, respond } => {
                            let _ = respond.send(flush_changes(&conn, &changes));
                        }
                        StoreRequest::TakeOwnership {
                            group,
                            owner,
                            replica_version,
                            now_ms,
                            respond,
                        } => {
                            let _ = respond.send(take_ownership(
                                &conn,
                                &group,
                                &owner,
                                &replica_version,
                                now_ms,
                            ));
                        }
                        StoreRequest::CatchupSince {
                            group,
                            base,
                            client_id,
                            respond,
                        } => {
                            let _ = respond.send(catchup_since(&conn, &group, &base, &client_id));
                        }
                        StoreRequest::Shutdown { respond } => {
                            let _ = respond.send(());
                            break;
                        }
                    }
                }
            });
        })
        .expect("failed to spawn store thread");

    StoreHandle { tx }
}

// =============================================================================
// Load
// =============================================================================

fn load_snapshot(conn: &Connection, group: &ClientGroupId) -> Result<Option<CvrSnapshot>> {
    let instance = conn
        .query_row(
            "SELECT owner, ownership_time, state_version, minor_version, replica_version,
                    ttl_clock, last_active, client_schema
             FROM instances WHERE client_group_id = ?1",
            [group.as_str()],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()?;

    let Some((owner, ownership_time, state, minor, replica, ttl_clock, last_active, schema)) =
        instance
    else {
        return Ok(None);
    };

    let client_schema = schema
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| Error::Schema(format!("corrupt client_schema: {}", e)))?;

    let mut clients = BTreeSet::new();
    {
        let mut stmt =
            conn.prepare("SELECT client_id FROM clients WHERE client_group_id = ?1")?;
        let ids = stmt.query_map([group.as_str()], |row| row.get::<_, String>(0))?;
        for id in ids {
            clients.insert(ClientId::new(id?));
        }
    }

    let mut queries: BTreeMap<QueryHash, QueryRecord> = BTreeMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT query_hash, query_type, definition, got, state_version, minor_version
             FROM queries WHERE client_group_id = ?1 AND deleted = 0",
        )?;
        let rows = stmt.query_map([group.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        for row in rows {
            let (hash, query_type, definition, got, pv_state, pv_minor) = row?;
            let def: QueryDef = serde_json::from_str(&definition)
                .map_err(|e| Error::Schema(format!("corrupt query definition: {}", e)))?;
            let patch_version =
                CvrVersion::new(StateVersion::from_raw(pv_state), pv_minor as u64);
            let record = match query_type.as_str() {
                "internal" => QueryRecord::Internal { def, patch_version },
                _ => QueryRecord::Client {
                    def,
                    client_state: BTreeMap::new(),
                    got,
                    patch_version,
                },
            };
            queries.insert(QueryHash::new(hash), record);
        }
    }

    {
        let mut stmt = conn.prepare(
            "SELECT client_id, query_hash, ttl, inactivated_at, state_version, minor_version
             FROM desires WHERE client_group_id = ?1 AND deleted = 0",
        )?;
        let rows = stmt.query_map([group.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        for row in rows {
            let (client_id, hash, ttl_ms, inactivated_at, pv_state, pv_minor) = row?;
            let Some(QueryRecord::Client { client_state, .. }) =
                queries.get_mut(&QueryHash::new(hash.as_str()))
            else {
                warn!(group = %group, query = %hash, "desire references missing query; skipping");
                continue;
            };
            client_state.insert(
                ClientId::new(client_id),
                DesiredState {
                    ttl_ms,
                    inactivated_at: inactivated_at.map(|v| v as u64),
                    patch_version: CvrVersion::new(
                        StateVersion::from_raw(pv_state),
                        pv_minor as u64,
                    ),
                },
            );
        }
    }

    let mut rows_map: HashMap<RowRef, RowRecord> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT table_name, row_key, row_version, ref_counts, value,
                    state_version, minor_version
             FROM rows WHERE client_group_id = ?1",
        )?;
        let rows = stmt.query_map([group.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;
        for row in rows {
            let (table, key, row_version, refs, value, pv_state, pv_minor) = row?;
            let refs = refs
                .map(|r| serde_json::from_str::<BTreeMap<QueryHash, i64>>(&r))
                .transpose()
                .map_err(|e| Error::Schema(format!("corrupt ref_counts: {}", e)))?;
            let value = value
                .map(|v| serde_json::from_str(&v))
                .transpose()
                .map_err(|e| Error::Schema(format!("corrupt row value: {}", e)))?;
            rows_map.insert(
                RowRef::new(table, key),
                RowRecord {
                    patch_version: CvrVersion::new(
                        StateVersion::from_raw(pv_state),
                        pv_minor as u64,
                    ),
                    row_version,
                    refs,
                    value,
                },
            );
        }
    }

    Ok(Some(CvrSnapshot {
        group: group.clone(),
        owner: owner.map(TaskId::new),
        ownership_time_ms: ownership_time as u64,
        version: CvrVersion::new(StateVersion::from_raw(state), minor as u64),
        replica_version: ReplicaVersion::new(replica),
        ttl_clock_ms: ttl_clock as u64,
        last_active_ms: last_active as u64,
        client_schema,
        clients,
        queries,
        rows: rows_map,
    }))
}

// =============================================================================
// Flush
// =============================================================================

fn flush_changes(conn: &Connection, changes: &CvrChanges) -> Result<()> {
    // rusqlite transactions need &mut; an explicit BEGIN keeps the borrow
    // shared across the helper functions below.
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = flush_changes_inner(conn, changes);
    match &result {
        Ok(()) => conn.execute_batch("COMMIT")?,
        Err(_) => {
            let _ = conn.execute_batch("ROLLBACK");
        }
    }
    result
}

fn flush_changes_inner(conn: &Connection, changes: &CvrChanges) -> Result<()> {
    let group = changes.group.as_str();
    let expected = &changes.expected_version;
    let client_schema = changes
        .client_schema
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Schema(format!("client_schema serialization: {}", e)))?;

    let current: Option<(String, i64)> = conn
        .query_row(
            "SELECT state_version, minor_version FROM instances WHERE client_group_id = ?1",
            [group],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match current {
        None => {
            if *expected != CvrVersion::initial() {
                return Err(Error::WriteConflict {
                    expected: expected.cookie(),
                    actual: "(missing)".to_string(),
                });
            }
            conn.execute(
                "INSERT INTO instances (client_group_id, owner, ownership_time, state_version,
                                        minor_version, replica_version, ttl_clock, last_active,
                                        client_schema)
                 VALUES (?1, NULL, 0, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    group,
                    changes.version.state_version.as_str(),
                    changes.version.minor_version as i64,
                    changes.replica_version.as_str(),
                    changes.ttl_clock_ms as i64,
                    changes.last_active_ms as i64,
                    client_schema,
                ],
            )?;
        }
        Some((state, minor)) => {
            let actual = CvrVersion::new(StateVersion::from_raw(state), minor as u64);
            if actual != *expected {
                return Err(Error::WriteConflict {
                    expected: expected.cookie(),
                    actual: actual.cookie(),
                });
            }
            conn.execute(
                "UPDATE instances
                 SET state_version = ?2, minor_version = ?3, replica_version = ?4,
                     ttl_clock = ?5, last_active = ?6, client_schema = ?7
                 WHERE client_group_id = ?1
                   AND state_version = ?8 AND minor_version = ?9",
                params![
                    group,
                    changes.version.state_version.as_str(),
                    changes.version.minor_version as i64,
                    changes.replica_version.as_str(),
                    changes.ttl_clock_ms as i64,
                    changes.last_active_ms as i64,
                    client_schema,
                    expected.state_version.as_str(),
                    expected.minor_version as i64,
                ],
            )?;
        }
    }

    for client in &changes.put_clients {
        conn.execute(
            "INSERT OR IGNORE INTO clients (client_group_id, client_id) VALUES (?1, ?2)",
            params![group, client.as_str()],
        )?;
    }
    for client in &changes.del_clients {
        conn.execute(
            "DELETE FROM clients WHERE client_group_id = ?1 AND client_id = ?2",
            params![group, client.as_str()],
        )?;
    }

    for query in &changes.queries {
        conn.execute(
            "INSERT INTO queries (client_group_id, query_hash, query_type, definition, got,
                                  deleted, state_version, minor_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (client_group_id, query_hash) DO UPDATE SET
                 query_type = excluded.query_type,
                 definition = excluded.definition,
                 got = excluded.got,
                 deleted = excluded.deleted,
                 state_version = excluded.state_version,
                 minor_version = excluded.minor_version",
            params![
                group,
                query.hash.as_str(),
                query.query_type,
                query.definition,
                query.got,
                query.deleted,
                query.patch_version.state_version.as_str(),
                query.patch_version.minor_version as i64,
            ],
        )?;
    }

    for desire in &changes.desires {
        conn.execute(
            "INSERT INTO desires (client_group_id, client_id, query_hash, ttl, inactivated_at,
                                  deleted, state_version, minor_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (client_group_id, client_id, query_hash) DO UPDATE SET
                 ttl = excluded.ttl,
                 inactivated_at = excluded.inactivated_at,
                 deleted = excluded.deleted,
                 state_version = excluded.state_version,
                 minor_version = excluded.minor_version",
            params![
                group,
                desire.client_id.as_str(),
                desire.hash.as_str(),
                desire.ttl_ms,
                desire.inactivated_at.map(|v| v as i64),
                desire.deleted,
                desire.patch_version.state_version.as_str(),
                desire.patch_version.minor_version as i64,
            ],
        )?;
    }

    for row in &changes.rows {
        let refs = row
            .refs
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Schema(format!("ref_counts serialization: {}", e)))?;
        let value = row
            .value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::Schema(format!("row value serialization: {}", e)))?;
        conn.execute(
            "INSERT INTO rows (client_group_id, table_name, row_key, row_version, ref_counts,
                               value, state_version, minor_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (client_group_id, table_name, row_key) DO UPDATE SET
                 row_version = excluded.row_version,
                 ref_counts = excluded.ref_counts,
                 value = excluded.value,
                 state_version = excluded.state_version,
                 minor_version = excluded.minor_version",
            params![
                group,
                row.row.table,
                row.row.key,
                row.row_version,
                refs,
                value,
                row.patch_version.state_version.as_str(),
                row.patch_version.minor_version as i64,
            ],
        )?;
    }

    debug!(
        group = %changes.group,
        version = %changes.version,
        queries = changes.queries.len(),
        desires = changes.desires.len(),
        rows = changes.rows.len(),
        "flushed CVR changes"
    );
    Ok(())
}

// =============================================================================
// Ownership
// =============================================================================

fn take_ownership(
    conn: &Connection,
    group: &ClientGroupId,
    owner: &TaskId,
    replica_version: &ReplicaVersion,
    now_ms: u64,
) -> Result<()> {
    let initial = CvrVersion::initial();
    conn.execute(
        "INSERT INTO instances (client_group_id, owner, ownership_time, state_version,
                                minor_version, replica_version, ttl_clock, last_active,
                                client_schema)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?3, NULL)
         ON CONFLICT (client_group_id) DO UPDATE SET
             owner = excluded.owner,
             ownership_time = excluded.ownership_time",
        params![
            group.as_str(),
            owner.as_str(),
            now_ms as i64,
            initial.state_version.as_str(),
            initial.minor_version as i64,
            replica_version.as_str(),
        ],
    )?;
    Ok(())
}

// =============================================================================
// Catch-Up
// =============================================================================

fn catchup_since(
    conn: &Connection,
    group: &ClientGroupId,
    base: &CvrVersion,
    client_id: &ClientId,
) -> Result<Vec<CatchupPatch>> {
    let mut patches = Vec::new();
    let base_state = base.state_version.as_str();
    let base_minor = base.minor_version as i64;

    {
        let mut stmt = conn.prepare(
            "SELECT query_hash, got, deleted, state_version, minor_version
             FROM queries
             WHERE client_group_id = ?1 AND query_type = 'client'
               AND (state_version > ?2 OR (state_version = ?2 AND minor_version > ?3))",
        )?;
        let rows = stmt.query_map(params![group.as_str(), base_state, base_minor], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, bool>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        for row in rows {
            let (hash, got, deleted, pv_state, pv_minor) = row?;
            let version = CvrVersion::new(StateVersion::from_raw(pv_state), pv_minor as u64);
            let hash = QueryHash::new(hash);
            let patch = if deleted {
                QueryPatch::del(hash)
            } else if got {
                QueryPatch::put(hash)
            } else {
                // Registered but not yet hydrated: nothing to tell the
                // client yet.
                continue;
            };
            patches.push(CatchupPatch::Query { version, patch });
        }
    }

    {
        let mut stmt = conn.prepare(
            "SELECT query_hash, inactivated_at, deleted, state_version, minor_version
             FROM desires
             WHERE client_group_id = ?1 AND client_id = ?2
               AND (state_version > ?3 OR (state_version = ?3 AND minor_version > ?4))",
        )?;
        let rows = stmt.query_map(
            params![group.as_str(), client_id.as_str(), base_state, base_minor],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            },
        )?;
        for row in rows {
            let (hash, inactivated_at, deleted, pv_state, pv_minor) = row?;
            let version = CvrVersion::new(StateVersion::from_raw(pv_state), pv_minor as u64);
            let hash = QueryHash::new(hash);
            let patch = if deleted || inactivated_at.is_some() {
                QueryPatch::del(hash)
            } else {
                QueryPatch::put(hash)
            };
            patches.push(CatchupPatch::Desire {
                version,
                client_id: client_id.clone(),
                patch,
            });
        }
    }

    {
        let mut stmt = conn.prepare(
            "SELECT table_name, row_key, ref_counts, value, state_version, minor_version
             FROM rows
             WHERE client_group_id = ?1
               AND (state_version > ?2 OR (state_version = ?2 AND minor_version > ?3))",
        )?;
        let rows = stmt.query_map(params![group.as_str(), base_state, base_minor], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        for row in rows {
            let (table, key, refs, value, pv_state, pv_minor) = row?;
            let version = CvrVersion::new(StateVersion::from_raw(pv_state), pv_minor as u64);
            let rref = RowRef::new(table, key);
            let patch = match (refs, value) {
                (Some(_), Some(value)) => RowPatch::Put {
                    table_name: rref.table.clone(),
                    value: serde_json::from_str(&value)
                        .map_err(|e| Error::Schema(format!("corrupt row value: {}", e)))?,
                },
                _ => RowPatch::Del {
                    table_name: rref.table.clone(),
                    id: rref.id_value(),
                },
            };
            patches.push(CatchupPatch::Row { version, patch });
        }
    }

    Ok(patches)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cvr::DesiredQueryPatch;
    use crate::schema::Database;
    use serde_json::json;

    fn group() -> ClientGroupId {
        ClientGroupId::new("g1")
    }

    fn replica() -> ReplicaVersion {
        ReplicaVersion::new("r1")
    }

    async fn fresh_store() -> StoreHandle {
        let db = Database::open_in_memory().unwrap();
        spawn_store(db.into_connection())
    }

    /// Builds a CVR with one client and one desired+hydrated query, flushed.
    async fn seeded_cvr(store: &StoreHandle) -> Cvr {
        let task = TaskId::new("t1");
        store
            .take_ownership(&group(), &task, &replica(), 1_000)
            .await
            .unwrap();
        let snapshot = store.load(&group()).await.unwrap().unwrap();
        let mut cvr = snapshot.into_cvr(1_000);
        cvr.ensure_client(&ClientId::new("c1"));
        let def = QueryDef::ast(json!({"table": "issue"}));
        cvr.change_desired_queries(
            &ClientId::new("c1"),
            &[DesiredQueryPatch::put(def.clone(), 100)],
        )
        .unwrap();
        cvr.hydrate_query(
            &def.hash(),
            vec![crate::collab::SourceRow::new(
                "issue",
                "a",
                "v1",
                json!({"id": "a"}),
            )],
        )
        .unwrap();
        store.flush(cvr.take_changes()).await.unwrap();
        cvr
    }

    #[tokio::test]
    async fn test_load_missing_group_is_none() {
        let store = fresh_store().await;
        assert!(store.load(&group()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ownership_creates_instance() {
        let store = fresh_store().await;
        store
            .take_ownership(&group(), &TaskId::new("t1"), &replica(), 1_000)
            .await
            .unwrap();
        let snapshot = store.load(&group()).await.unwrap().unwrap();
        assert_eq!(snapshot.owner, Some(TaskId::new("t1")));
        assert_eq!(snapshot.version, CvrVersion::initial());
        assert_eq!(snapshot.ttl_clock_ms, 0);

        // A second claim flips the owner and nothing else.
        store
            .take_ownership(&group(), &TaskId::new("t2"), &replica(), 2_000)
            .await
            .unwrap();
        let snapshot = store.load(&group()).await.unwrap().unwrap();
        assert_eq!(snapshot.owner, Some(TaskId::new("t2")));
        assert_eq!(snapshot.version, CvrVersion::initial());
    }

    #[tokio::test]
    async fn test_flush_and_reload_roundtrip() {
        let store = fresh_store().await;
        let cvr = seeded_cvr(&store).await;
        let expected_version = cvr.version().clone();

        let snapshot = store.load(&group()).await.unwrap().unwrap();
        assert_eq!(snapshot.version, expected_version);
        assert!(snapshot.clients.contains(&ClientId::new("c1")));
        // The internal lmids query plus the client query.
        assert_eq!(snapshot.queries.len(), 2);
        let rec = snapshot.rows.get(&RowRef::new("issue", "a")).unwrap();
        assert_eq!(rec.row_version, "v1");
        assert!(rec.refs.is_some());
        assert_eq!(rec.value, Some(json!({"id": "a"})));
    }

    #[tokio::test]
    async fn test_flush_conflict_on_stale_version() {
        let store = fresh_store().await;
        let mut cvr = seeded_cvr(&store).await;

        // A second writer flushes first.
        let mut other = store
            .load(&group())
            .await
            .unwrap()
            .unwrap()
            .into_cvr(2_000);
        other.ensure_client(&ClientId::new("c2"));
        store.flush(other.take_changes()).await.unwrap();

        // The first writer's CAS now fails.
        cvr.ensure_client(&ClientId::new("c3"));
        let err = store.flush(cvr.take_changes()).await.unwrap_err();
        assert!(matches!(err, Error::WriteConflict { .. }));
    }

    #[tokio::test]
    async fn test_clock_only_flush_keeps_version() {
        let store = fresh_store().await;
        let mut cvr = seeded_cvr(&store).await;
        let version = cvr.version().clone();
        cvr.touch(5_000);
        store.flush(cvr.take_changes()).await.unwrap();

        let snapshot = store.load(&group()).await.unwrap().unwrap();
        assert_eq!(snapshot.version, version);
        assert_eq!(snapshot.ttl_clock_ms, 4_000);
    }

    #[tokio::test]
    async fn test_catchup_replays_full_state_from_initial() {
        let store = fresh_store().await;
        let cvr = seeded_cvr(&store).await;
        let hash = QueryDef::ast(json!({"table": "issue"})).hash();

        let patches = store
            .catchup_since(&group(), &CvrVersion::initial(), &ClientId::new("c1"))
            .await
            .unwrap();
        let diff = crate::poke::catchup_diff(patches);
        assert_eq!(diff.got, vec![QueryPatch::put(hash.clone())]);
        assert_eq!(
            diff.desired.get(&ClientId::new("c1")),
            Some(&vec![QueryPatch::put(hash)])
        );
        assert_eq!(diff.rows.len(), 1);
        assert!(matches!(diff.rows[0], RowPatch::Put { .. }));
        drop(cvr);
    }

    #[tokio::test]
    async fn test_catchup_from_current_version_is_empty() {
        let store = fresh_store().await;
        let cvr = seeded_cvr(&store).await;
        let patches = store
            .catchup_since(&group(), cvr.version(), &ClientId::new("c1"))
            .await
            .unwrap();
        assert!(patches.is_empty());
    }

    #[tokio::test]
    async fn test_catchup_replays_tombstones_as_deletes() {
        let store = fresh_store().await;
        let mut cvr = seeded_cvr(&store).await;
        let base = cvr.version().clone();
        let hash = QueryDef::ast(json!({"table": "issue"})).hash();

        cvr.change_desired_queries(&ClientId::new("c1"), &[DesiredQueryPatch::del(hash.clone())])
            .unwrap();
        store.flush(cvr.take_changes()).await.unwrap();
        let diff = cvr.evict_queries(&[hash.clone()]);
        assert!(!diff.is_empty());
        store.flush(cvr.take_changes()).await.unwrap();

        let patches = store
            .catchup_since(&group(), &base, &ClientId::new("c1"))
            .await
            .unwrap();
        let diff = crate::poke::catchup_diff(patches);
        assert_eq!(diff.got, vec![QueryPatch::del(hash.clone())]);
        assert_eq!(
            diff.desired.get(&ClientId::new("c1")),
            Some(&vec![QueryPatch::del(hash)])
        );
        assert!(matches!(diff.rows[0], RowPatch::Del { .. }));
    }
}

//! # Client View Record Engine
//!
//! The in-memory CVR for one client group and every mutation it supports:
//! desired-query changes, query hydration, upstream change application,
//! schema reconciliation, eviction, and client deletion.
//!
//! Each mutation produces a [`PokeDiff`] (the payload broadcast to connected
//! clients) and marks the touched records dirty; [`Cvr::take_changes`]
//! drains the dirty set into one [`CvrChanges`] write-set, which the store
//! persists under an optimistic compare-and-swap on the CVR version.
//!
//! ## Versioning
//!
//! - Upstream changes set `version = (state_version, 0)`; the watermark must
//!   strictly advance.
//! - CVR-only mutations (desires, hydrations, evictions, client membership)
//!   bump `minor_version`, at most once per flush cycle, so any number of
//!   mutations between flushes share one version.
//! - Clock touches and schema reconciliation persist without a version bump.
//!
//! ## Reference counts
//!
//! A row is visible while any query holds a positive reference count on it.
//! Counts that reach zero are dropped; a row whose last count drops is
//! tombstoned (`refs = None`) and its delete patch is emitted in the same
//! flush. Tombstones are retained so catch-up replays are idempotent.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::collab::{SourceRow, UpstreamChange};
use crate::error::{Error, Result};
use crate::poke::{PokeDiff, QueryPatch, RowPatch};
use crate::ttl::TtlClock;
use crate::types::{
    ClientGroupId, ClientId, ClientSchema, CvrVersion, QueryHash, ReplicaVersion, RowRef, TaskId,
};

// =============================================================================
// Query Records
// =============================================================================

/// A query definition: a direct AST, or a named custom query resolved
/// through the query transformer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueryDef {
    Ast { ast: Value },
    Named { name: String, args: Vec<Value> },
}

impl QueryDef {
    pub fn ast(ast: Value) -> Self {
        Self::Ast { ast }
    }

    pub fn named(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self::Named {
            name: name.into(),
            args,
        }
    }

    pub fn hash(&self) -> QueryHash {
        match self {
            Self::Ast { ast } => QueryHash::of_ast(ast),
            Self::Named { name, args } => QueryHash::of_named(name, args),
        }
    }

    pub fn is_named(&self) -> bool {
        matches!(self, Self::Named { .. })
    }
}

/// Per-client desire state for one query.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    /// Requested TTL in milliseconds; negative means "default".
    pub ttl_ms: i64,
    /// TTL-clock value at which the client deactivated the query; `None`
    /// while the client still desires it.
    pub inactivated_at: Option<u64>,
    /// Version at which this state last changed.
    pub patch_version: CvrVersion,
}

/// A query tracked by the CVR.
///
/// `Client` queries carry per-client desire state and are subject to TTL
/// eviction. `Internal` queries are system-owned (last-mutation-ID tracking)
/// and never evicted.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRecord {
    Client {
        def: QueryDef,
        client_state: BTreeMap<ClientId, DesiredState>,
        /// True once the query has been hydrated (the server holds its
        /// result rows).
        got: bool,
        patch_version: CvrVersion,
    },
    Internal {
        def: QueryDef,
        patch_version: CvrVersion,
    },
}

impl QueryRecord {
    pub fn def(&self) -> &QueryDef {
        match self {
            Self::Client { def, .. } | Self::Internal { def, .. } => def,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    pub fn got(&self) -> bool {
        match self {
            Self::Client { got, .. } => *got,
            Self::Internal { .. } => true,
        }
    }
}

/// A row tracked by the CVR.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    pub patch_version: CvrVersion,
    pub row_version: String,
    /// Positive reference counts per query; `None` once the row has been
    /// deleted from the visible set (its delete patch was emitted).
    pub refs: Option<BTreeMap<QueryHash, i64>>,
    /// Last known payload, retained for catch-up; `None` once tombstoned.
    pub value: Option<Value>,
}

impl RowRecord {
    fn visible(&self) -> bool {
        self.refs.as_ref().is_some_and(|r| !r.is_empty())
    }
}

// =============================================================================
// Inputs and Outcomes
// =============================================================================

/// One entry of a `changeDesiredQueries` request.
#[derive(Debug, Clone)]
pub enum DesiredQueryPatch {
    Put {
        hash: QueryHash,
        def: QueryDef,
        ttl_ms: i64,
    },
    Del {
        hash: QueryHash,
    },
}

impl DesiredQueryPatch {
    /// A `put` whose hash is derived from the definition.
    pub fn put(def: QueryDef, ttl_ms: i64) -> Self {
        Self::Put {
            hash: def.hash(),
            def,
            ttl_ms,
        }
    }

    pub fn del(hash: QueryHash) -> Self {
        Self::Del { hash }
    }
}

/// Result of a desired-query change: the patches to broadcast plus the
/// queries that now need hydration.
#[derive(Debug, Default)]
pub struct DesiredChangeOutcome {
    pub diff: PokeDiff,
    pub hydrate: Vec<(QueryHash, QueryDef)>,
}

// =============================================================================
// Write-Set
// =============================================================================

/// Upsert of one `queries` row.
#[derive(Debug, Clone)]
pub struct QueryWrite {
    pub hash: QueryHash,
    pub query_type: &'static str,
    pub definition: String,
    pub got: bool,
    pub deleted: bool,
    pub patch_version: CvrVersion,
}

/// Upsert of one `desires` row.
#[derive(Debug, Clone)]
pub struct DesireWrite {
    pub client_id: ClientId,
    pub hash: QueryHash,
    pub ttl_ms: i64,
    pub inactivated_at: Option<u64>,
    pub deleted: bool,
    pub patch_version: CvrVersion,
}

/// Upsert of one `rows` row.
#[derive(Debug, Clone)]
pub struct RowWrite {
    pub row: RowRef,
    pub patch_version: CvrVersion,
    pub row_version: String,
    pub refs: Option<BTreeMap<QueryHash, i64>>,
    pub value: Option<Value>,
}

/// Everything one flush persists, CAS-guarded by `expected_version`.
#[derive(Debug, Clone)]
pub struct CvrChanges {
    pub group: ClientGroupId,
    pub expected_version: CvrVersion,
    pub version: CvrVersion,
    pub replica_version: ReplicaVersion,
    pub ttl_clock_ms: u64,
    pub last_active_ms: u64,
    pub client_schema: Option<ClientSchema>,
    pub put_clients: Vec<ClientId>,
    pub del_clients: Vec<ClientId>,
    pub queries: Vec<QueryWrite>,
    pub desires: Vec<DesireWrite>,
    pub rows: Vec<RowWrite>,
}

// =============================================================================
// CVR
// =============================================================================

/// The authoritative in-memory Client View Record for one client group.
#[derive(Debug)]
pub struct Cvr {
    group: ClientGroupId,
    version: CvrVersion,
    /// Version last persisted (or loaded); the CAS expectation of the next
    /// flush.
    base_version: CvrVersion,
    replica_version: ReplicaVersion,
    ttl: TtlClock,
    client_schema: Option<ClientSchema>,
    owner: Option<TaskId>,
    clients: BTreeSet<ClientId>,
    queries: BTreeMap<QueryHash, QueryRecord>,
    rows: HashMap<RowRef, RowRecord>,
    /// Rows currently referenced per query; drives empty↔non-empty `got`
    /// transitions.
    query_rows: HashMap<QueryHash, u64>,
    lmids_hash: QueryHash,

    dirty_queries: BTreeSet<QueryHash>,
    dead_queries: Vec<QueryWrite>,
    dirty_desires: BTreeSet<(ClientId, QueryHash)>,
    dead_desires: Vec<DesireWrite>,
    dirty_rows: HashSet<RowRef>,
    added_clients: BTreeSet<ClientId>,
    removed_clients: BTreeSet<ClientId>,
    instance_dirty: bool,
}

fn lmids_query_def() -> QueryDef {
    QueryDef::ast(json!({ "system": "lastMutationIDs" }))
}

impl Cvr {
    /// A fresh CVR for a group never seen before, bound to the serving
    /// replica.
    pub fn new(group: ClientGroupId, replica_version: ReplicaVersion, now_ms: u64) -> Self {
        let def = lmids_query_def();
        let lmids_hash = def.hash();
        let version = CvrVersion::initial();
        let mut queries = BTreeMap::new();
        queries.insert(
            lmids_hash.clone(),
            QueryRecord::Internal {
                def,
                patch_version: version.clone(),
            },
        );
        let mut cvr = Self {
            group,
            version: version.clone(),
            base_version: version,
            replica_version,
            ttl: TtlClock::new(now_ms),
            client_schema: None,
            owner: None,
            clients: BTreeSet::new(),
            queries,
            rows: HashMap::new(),
            query_rows: HashMap::new(),
            lmids_hash: lmids_hash.clone(),
            dirty_queries: BTreeSet::new(),
            dead_queries: Vec::new(),
            dirty_desires: BTreeSet::new(),
            dead_desires: Vec::new(),
            dirty_rows: HashSet::new(),
            added_clients: BTreeSet::new(),
            removed_clients: BTreeSet::new(),
            instance_dirty: true,
        };
        cvr.dirty_queries.insert(lmids_hash);
        cvr
    }

    /// Rebuilds a CVR from persisted state. The TTL clock is *resumed*, not
    /// advanced: downtime between `last_active` and `now` does not count as
    /// serving time.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        group: ClientGroupId,
        version: CvrVersion,
        replica_version: ReplicaVersion,
        owner: Option<TaskId>,
        ttl_clock_ms: u64,
        last_active_ms: u64,
        client_schema: Option<ClientSchema>,
        clients: BTreeSet<ClientId>,
        queries: BTreeMap<QueryHash, QueryRecord>,
        rows: HashMap<RowRef, RowRecord>,
        now_ms: u64,
    ) -> Self {
        let mut query_rows: HashMap<QueryHash, u64> = HashMap::new();
        for rec in rows.values() {
            if let Some(refs) = &rec.refs {
                for hash in refs.keys() {
                    *query_rows.entry(hash.clone()).or_default() += 1;
                }
            }
        }
        let lmids_hash = lmids_query_def().hash();
        let mut ttl = TtlClock::from_parts(ttl_clock_ms, last_active_ms);
        ttl.resume(now_ms);
        let mut cvr = Self {
            group,
            base_version: version.clone(),
            version,
            replica_version,
            ttl,
            client_schema,
            owner,
            clients,
            queries,
            rows,
            query_rows,
            lmids_hash,
            dirty_queries: BTreeSet::new(),
            dead_queries: Vec::new(),
            dirty_desires: BTreeSet::new(),
            dead_desires: Vec::new(),
            dirty_rows: HashSet::new(),
            added_clients: BTreeSet::new(),
            removed_clients: BTreeSet::new(),
            instance_dirty: true,
        };
        // Groups created by an ownership claim have an instance row but no
        // internal queries yet; register the last-mutation-ID query here.
        if !cvr.queries.contains_key(&cvr.lmids_hash) {
            let hash = cvr.lmids_hash.clone();
            cvr.queries.insert(
                hash.clone(),
                QueryRecord::Internal {
                    def: lmids_query_def(),
                    patch_version: cvr.version.clone(),
                },
            );
            cvr.dirty_queries.insert(hash);
        }
        cvr
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn group(&self) -> &ClientGroupId {
        &self.group
    }

    pub fn version(&self) -> &CvrVersion {
        &self.version
    }

    pub fn replica_version(&self) -> &ReplicaVersion {
        &self.replica_version
    }

    pub fn owner(&self) -> Option<&TaskId> {
        self.owner.as_ref()
    }

    pub fn ttl_clock(&self) -> &TtlClock {
        &self.ttl
    }

    pub fn has_client(&self, client: &ClientId) -> bool {
        self.clients.contains(client)
    }

    pub fn queries(&self) -> impl Iterator<Item = (&QueryHash, &QueryRecord)> {
        self.queries.iter()
    }

    pub fn row(&self, row: &RowRef) -> Option<&RowRecord> {
        self.rows.get(row)
    }

    /// The hash of the group's internal last-mutation-ID query.
    pub fn lmids_hash(&self) -> &QueryHash {
        &self.lmids_hash
    }

    /// Queries whose results must be re-fetched when a CVR is loaded on a
    /// new task: every hydrated client query plus the internal queries.
    pub fn queries_to_rehydrate(&self) -> Vec<(QueryHash, QueryDef)> {
        self.queries
            .iter()
            .filter(|(_, q)| q.got())
            .map(|(h, q)| (h.clone(), q.def().clone()))
            .collect()
    }

    // =========================================================================
    // Clock
    // =========================================================================

    /// Advances the TTL clock to `now_ms` and returns the new value.
    pub fn touch(&mut self, now_ms: u64) -> u64 {
        self.instance_dirty = true;
        self.ttl.advance(now_ms)
    }

    // =========================================================================
    // Clients and Schema
    // =========================================================================

    /// Registers a client in the group. Returns true (and bumps the minor
    /// version) if the client was new.
    pub fn ensure_client(&mut self, client: &ClientId) -> bool {
        if !self.clients.insert(client.clone()) {
            return false;
        }
        self.added_clients.insert(client.clone());
        self.removed_clients.remove(client);
        self.bump_minor();
        true
    }

    /// Validates a client's declared schema against the replica's and
    /// records it on the instance.
    pub fn reconcile_client_schema(
        &mut self,
        declared: &ClientSchema,
        replica: &ClientSchema,
    ) -> Result<()> {
        if let Some(unsupported) = replica.first_unsupported(declared) {
            return Err(Error::ClientSchemaMismatch(unsupported));
        }
        if self.client_schema.as_ref() != Some(declared) {
            self.client_schema = Some(declared.clone());
            self.instance_dirty = true;
        }
        Ok(())
    }

    /// Removes clients and their desires. Queries left with no referencing
    /// client are evicted in the same flush.
    pub fn delete_clients(&mut self, ids: &[ClientId]) -> PokeDiff {
        let mut diff = PokeDiff::default();
        let mut touched = false;
        for id in ids {
            if self.clients.remove(id) {
                touched = true;
                self.removed_clients.insert(id.clone());
                self.added_clients.remove(id);
            }
        }
        if !touched {
            return diff;
        }
        self.bump_minor();
        let version = self.version.clone();

        let mut orphaned = Vec::new();
        for (hash, query) in self.queries.iter_mut() {
            let QueryRecord::Client { client_state, .. } = query else {
                continue;
            };
            for id in ids {
                if let Some(state) = client_state.remove(id) {
                    self.dead_desires.push(DesireWrite {
                        client_id: id.clone(),
                        hash: hash.clone(),
                        ttl_ms: state.ttl_ms,
                        inactivated_at: state.inactivated_at,
                        deleted: true,
                        patch_version: version.clone(),
                    });
                    diff.push_desired(id, QueryPatch::del(hash.clone()));
                    self.dirty_desires.remove(&(id.clone(), hash.clone()));
                }
            }
            if client_state.is_empty() {
                orphaned.push(hash.clone());
            }
        }
        diff.merge(self.evict_queries(&orphaned));
        diff
    }

    // =========================================================================
    // Desired Queries
    // =========================================================================

    /// Applies a `changeDesiredQueries` request for one client.
    ///
    /// `put` creates or updates the query and the client's desire; `del`
    /// stamps `inactivated_at` with the current TTL-clock value without
    /// deleting anything. The returned patches are broadcast to every
    /// connected client of the group so tabs stay consistent with each
    /// other's desires.
    pub fn change_desired_queries(
        &mut self,
        client_id: &ClientId,
        patches: &[DesiredQueryPatch],
    ) -> Result<DesiredChangeOutcome> {
        if !self.clients.contains(client_id) {
            return Err(Error::ClientNotFound {
                client_id: client_id.to_string(),
                reason: "client is not registered in this group".to_string(),
            });
        }
        for patch in patches {
            let hash = match patch {
                DesiredQueryPatch::Put { hash, .. } | DesiredQueryPatch::Del { hash } => hash,
            };
            if self.queries.get(hash).is_some_and(QueryRecord::is_internal) {
                return Err(Error::QueryError {
                    hash: hash.clone(),
                    message: "internal queries cannot be desired by clients".to_string(),
                });
            }
        }
        if patches.is_empty() {
            return Ok(DesiredChangeOutcome::default());
        }

        self.bump_minor();
        let version = self.version.clone();
        let mut outcome = DesiredChangeOutcome::default();

        for patch in patches {
            match patch {
                DesiredQueryPatch::Put { hash, def, ttl_ms } => {
                    match self.queries.get_mut(hash) {
                        None => {
                            let mut client_state = BTreeMap::new();
                            client_state.insert(
                                client_id.clone(),
                                DesiredState {
                                    ttl_ms: *ttl_ms,
                                    inactivated_at: None,
                                    patch_version: version.clone(),
                                },
                            );
                            self.queries.insert(
                                hash.clone(),
                                QueryRecord::Client {
                                    def: def.clone(),
                                    client_state,
                                    got: false,
                                    patch_version: version.clone(),
                                },
                            );
                            outcome.hydrate.push((hash.clone(), def.clone()));
                        }
                        Some(QueryRecord::Client {
                            client_state,
                            got,
                            def: existing_def,
                            ..
                        }) => match client_state.get_mut(client_id) {
                            None => {
                                client_state.insert(
                                    client_id.clone(),
                                    DesiredState {
                                        ttl_ms: *ttl_ms,
                                        inactivated_at: None,
                                        patch_version: version.clone(),
                                    },
                                );
                                if !*got {
                                    outcome.hydrate.push((hash.clone(), existing_def.clone()));
                                }
                            }
                            Some(state) => {
                                if state.inactivated_at.is_some() {
                                    // Reactivation: the new TTL replaces the
                                    // old one, longer or shorter.
                                    state.inactivated_at = None;
                                    state.ttl_ms = *ttl_ms;
                                    if !*got || existing_def.is_named() {
                                        outcome
                                            .hydrate
                                            .push((hash.clone(), existing_def.clone()));
                                    }
                                } else {
                                    // A continuously-desired query's window
                                    // only widens.
                                    state.ttl_ms = crate::ttl::max_ttl(state.ttl_ms, *ttl_ms);
                                }
                                state.patch_version = version.clone();
                            }
                        },
                        Some(QueryRecord::Internal { .. }) => unreachable!("pre-validated"),
                    }
                    self.dirty_queries.insert(hash.clone());
                    self.dirty_desires.insert((client_id.clone(), hash.clone()));
                    outcome
                        .diff
                        .push_desired(client_id, QueryPatch::put(hash.clone()));
                }
                DesiredQueryPatch::Del { hash } => {
                    let Some(QueryRecord::Client { client_state, .. }) =
                        self.queries.get_mut(hash)
                    else {
                        continue;
                    };
                    let Some(state) = client_state.get_mut(client_id) else {
                        continue;
                    };
                    if state.inactivated_at.is_none() {
                        state.inactivated_at = Some(self.ttl.value_ms());
                        state.patch_version = version.clone();
                        self.dirty_desires.insert((client_id.clone(), hash.clone()));
                    }
                    outcome
                        .diff
                        .push_desired(client_id, QueryPatch::del(hash.clone()));
                }
            }
        }
        Ok(outcome)
    }

    // =========================================================================
    // Hydration
    // =========================================================================

    /// Installs the (permission-filtered) result rows of a query, diffing
    /// against whatever the query referenced before. Used for newly added
    /// queries, re-activated custom queries, and re-hydration after a CVR
    /// load.
    pub fn hydrate_query(&mut self, hash: &QueryHash, rows: Vec<SourceRow>) -> Result<PokeDiff> {
        if !self.queries.contains_key(hash) {
            return Err(Error::QueryError {
                hash: hash.clone(),
                message: "query is not registered in this CVR".to_string(),
            });
        }

        self.bump_minor();
        let version = self.version.clone();
        let mut diff = PokeDiff::default();

        // Count multiplicity per row in the new result set.
        let mut new_rows: BTreeMap<RowRef, (i64, SourceRow)> = BTreeMap::new();
        for row in rows {
            let rref = RowRef::new(row.table.clone(), row.key.clone());
            new_rows
                .entry(rref)
                .and_modify(|(count, _)| *count += 1)
                .or_insert((1, row));
        }

        // Drop references the query no longer produces.
        let stale: Vec<RowRef> = self
            .rows
            .iter()
            .filter(|(rref, rec)| {
                rec.refs.as_ref().is_some_and(|r| r.contains_key(hash))
                    && !new_rows.contains_key(rref)
            })
            .map(|(rref, _)| rref.clone())
            .collect();
        for rref in stale {
            self.remove_query_ref(&rref, hash, &version, &mut diff);
        }

        // Install or refresh the new result set.
        for (rref, (count, src)) in new_rows {
            let rec = self.rows.entry(rref.clone()).or_insert_with(|| RowRecord {
                patch_version: version.clone(),
                row_version: String::new(),
                refs: Some(BTreeMap::new()),
                value: None,
            });
            let was_visible = rec.visible();
            let refs = rec.refs.get_or_insert_with(BTreeMap::new);
            if refs.insert(hash.clone(), count).is_none() {
                *self.query_rows.entry(hash.clone()).or_default() += 1;
            }
            if !was_visible || rec.row_version != src.row_version {
                rec.row_version = src.row_version;
                rec.value = Some(src.value.clone());
                rec.patch_version = version.clone();
                diff.rows.push(RowPatch::Put {
                    table_name: rref.table.clone(),
                    value: src.value,
                });
            }
            self.dirty_rows.insert(rref);
        }

        // First hydration marks the query as got.
        if let Some(QueryRecord::Client {
            got, patch_version, ..
        }) = self.queries.get_mut(hash)
        {
            if !*got {
                *got = true;
                *patch_version = version.clone();
                diff.got.push(QueryPatch::put(hash.clone()));
            }
        }
        self.dirty_queries.insert(hash.clone());
        Ok(diff)
    }

    // =========================================================================
    // Upstream Changes
    // =========================================================================

    /// Applies one upstream transaction: per-row reference-count deltas,
    /// row patches, `got` transitions for queries whose result sets become
    /// empty or non-empty, and last-mutation-ID passthrough. Advances the
    /// state version and resets the minor version.
    pub fn apply_upstream_change(&mut self, change: UpstreamChange) -> Result<PokeDiff> {
        if change.state_version <= self.version.state_version {
            return Err(Error::StaleWatermark {
                received: change.state_version.to_string(),
                current: self.version.state_version.to_string(),
            });
        }
        self.version = CvrVersion::with_state(change.state_version);
        self.instance_dirty = true;
        let version = self.version.clone();

        let mut diff = PokeDiff::default();
        let mut old_counts: HashMap<QueryHash, u64> = HashMap::new();

        for row_diff in change.row_diffs {
            let rref = RowRef::new(row_diff.table.clone(), row_diff.key.clone());
            let existed = self.rows.contains_key(&rref);
            let rec = self.rows.entry(rref.clone()).or_insert_with(|| RowRecord {
                patch_version: version.clone(),
                row_version: String::new(),
                refs: Some(BTreeMap::new()),
                value: None,
            });
            let was_visible = rec.visible();
            let refs = rec.refs.get_or_insert_with(BTreeMap::new);

            for (hash, delta) in &row_diff.refs {
                old_counts
                    .entry(hash.clone())
                    .or_insert_with(|| self.query_rows.get(hash).copied().unwrap_or(0));
                let current = refs.get(hash).copied().unwrap_or(0);
                let next = current + delta;
                if next > 0 {
                    refs.insert(hash.clone(), next);
                    if current == 0 {
                        *self.query_rows.entry(hash.clone()).or_default() += 1;
                    }
                } else {
                    refs.remove(hash);
                    if current > 0 {
                        if let Some(n) = self.query_rows.get_mut(hash) {
                            *n = n.saturating_sub(1);
                        }
                    }
                }
            }

            let now_visible = !refs.is_empty();
            match (now_visible, &row_diff.value) {
                (true, Some(value)) => {
                    if !was_visible || rec.row_version != row_diff.row_version {
                        rec.row_version = row_diff.row_version.clone();
                        rec.value = Some(value.clone());
                        rec.patch_version = version.clone();
                        diff.rows.push(RowPatch::Put {
                            table_name: rref.table.clone(),
                            value: value.clone(),
                        });
                    }
                    self.dirty_rows.insert(rref);
                }
                (true, None) => {
                    // The row is gone upstream but deltas left references
                    // behind; drop them and tombstone.
                    for hash in rec.refs.take().unwrap_or_default().into_keys() {
                        if let Some(n) = self.query_rows.get_mut(&hash) {
                            *n = n.saturating_sub(1);
                        }
                    }
                    rec.value = None;
                    rec.patch_version = version.clone();
                    diff.rows.push(RowPatch::Del {
                        table_name: rref.table.clone(),
                        id: rref.id_value(),
                    });
                    self.dirty_rows.insert(rref);
                }
                (false, _) => {
                    if was_visible {
                        rec.refs = None;
                        rec.value = None;
                        rec.patch_version = version.clone();
                        diff.rows.push(RowPatch::Del {
                            table_name: rref.table.clone(),
                            id: rref.id_value(),
                        });
                        self.dirty_rows.insert(rref);
                    } else if !existed {
                        // A no-op diff for a row we never tracked.
                        self.rows.remove(&rref);
                    } else {
                        rec.refs = None;
                    }
                }
            }
        }

        // got transitions for queries whose result sets crossed empty.
        for (hash, old) in old_counts {
            let new = self.query_rows.get(&hash).copied().unwrap_or(0);
            let Some(QueryRecord::Client {
                got, patch_version, ..
            }) = self.queries.get_mut(&hash)
            else {
                continue;
            };
            if old == 0 && new > 0 && !*got {
                *got = true;
                *patch_version = version.clone();
                self.dirty_queries.insert(hash.clone());
                diff.got.push(QueryPatch::put(hash));
            } else if old > 0 && new == 0 && *got {
                *got = false;
                *patch_version = version.clone();
                self.dirty_queries.insert(hash.clone());
                diff.got.push(QueryPatch::del(hash));
            }
        }

        diff.lmid_changes = change.lmid_changes;
        diff.mutations = change.mutations;
        Ok(diff)
    }

    // =========================================================================
    // Eviction
    // =========================================================================

    /// Evicts queries whose TTL windows have closed: removes their client
    /// state, tombstones their desire and query records, zeroes their row
    /// references, and emits `got`/row delete patches. One call produces one
    /// poke.
    pub fn evict_queries(&mut self, hashes: &[QueryHash]) -> PokeDiff {
        let mut diff = PokeDiff::default();
        if hashes.is_empty() {
            return diff;
        }
        self.bump_minor();
        let version = self.version.clone();

        let mut evicted: BTreeSet<QueryHash> = BTreeSet::new();
        for hash in hashes {
            let Some(record) = self.queries.get(hash) else {
                continue;
            };
            if record.is_internal() {
                continue;
            }
            let Some(QueryRecord::Client {
                def,
                client_state,
                got,
                ..
            }) = self.queries.remove(hash)
            else {
                unreachable!("checked above");
            };
            for (client_id, state) in client_state {
                self.dead_desires.push(DesireWrite {
                    client_id: client_id.clone(),
                    hash: hash.clone(),
                    ttl_ms: state.ttl_ms,
                    inactivated_at: state.inactivated_at,
                    deleted: true,
                    patch_version: version.clone(),
                });
                self.dirty_desires.remove(&(client_id, hash.clone()));
            }
            self.dead_queries.push(QueryWrite {
                hash: hash.clone(),
                query_type: "client",
                definition: serde_json::to_string(&def).expect("query definitions serialize"),
                got: false,
                deleted: true,
                patch_version: version.clone(),
            });
            self.dirty_queries.remove(hash);
            if got {
                diff.got.push(QueryPatch::del(hash.clone()));
            }
            self.query_rows.remove(hash);
            evicted.insert(hash.clone());
        }

        if evicted.is_empty() {
            return diff;
        }

        // One pass over the rows drops every evicted query's references.
        let mut tombstoned = Vec::new();
        for (rref, rec) in self.rows.iter_mut() {
            let Some(refs) = rec.refs.as_mut() else {
                continue;
            };
            let before = refs.len();
            refs.retain(|hash, _| !evicted.contains(hash));
            if refs.len() == before {
                continue;
            }
            if refs.is_empty() {
                rec.refs = None;
                rec.value = None;
                rec.patch_version = version.clone();
                diff.rows.push(RowPatch::Del {
                    table_name: rref.table.clone(),
                    id: rref.id_value(),
                });
            }
            tombstoned.push(rref.clone());
        }
        for rref in tombstoned {
            self.dirty_rows.insert(rref);
        }
        diff
    }

    // =========================================================================
    // Versioning and Flush
    // =========================================================================

    /// Bumps the minor version, at most once per flush cycle.
    fn bump_minor(&mut self) {
        if self.version == self.base_version {
            self.version = self.version.next_minor();
        }
        self.instance_dirty = true;
    }

    /// True if a flush would write anything.
    pub fn has_changes(&self) -> bool {
        self.instance_dirty
            || !self.dirty_queries.is_empty()
            || !self.dead_queries.is_empty()
            || !self.dirty_desires.is_empty()
            || !self.dead_desires.is_empty()
            || !self.dirty_rows.is_empty()
            || !self.added_clients.is_empty()
            || !self.removed_clients.is_empty()
    }

    /// Drains the dirty set into one write-set and advances the CAS base to
    /// the current version. On flush conflict the whole CVR is reloaded, so
    /// the drained state needs no recovery path.
    pub fn take_changes(&mut self) -> CvrChanges {
        let mut queries: Vec<QueryWrite> = std::mem::take(&mut self.dead_queries);
        for hash in std::mem::take(&mut self.dirty_queries) {
            let Some(record) = self.queries.get(&hash) else {
                continue;
            };
            let (query_type, got, patch_version) = match record {
                QueryRecord::Client {
                    got, patch_version, ..
                } => ("client", *got, patch_version.clone()),
                QueryRecord::Internal { patch_version, .. } => {
                    ("internal", true, patch_version.clone())
                }
            };
            queries.push(QueryWrite {
                hash: hash.clone(),
                query_type,
                definition: serde_json::to_string(record.def())
                    .expect("query definitions serialize"),
                got,
                deleted: false,
                patch_version,
            });
        }

        let mut desires: Vec<DesireWrite> = std::mem::take(&mut self.dead_desires);
        for (client_id, hash) in std::mem::take(&mut self.dirty_desires) {
            let Some(QueryRecord::Client { client_state, .. }) = self.queries.get(&hash) else {
                continue;
            };
            let Some(state) = client_state.get(&client_id) else {
                continue;
            };
            desires.push(DesireWrite {
                client_id,
                hash,
                ttl_ms: state.ttl_ms,
                inactivated_at: state.inactivated_at,
                deleted: false,
                patch_version: state.patch_version.clone(),
            });
        }

        let rows = std::mem::take(&mut self.dirty_rows)
            .into_iter()
            .filter_map(|rref| {
                self.rows.get(&rref).map(|rec| RowWrite {
                    row: rref,
                    patch_version: rec.patch_version.clone(),
                    row_version: rec.row_version.clone(),
                    refs: rec.refs.clone(),
                    value: rec.value.clone(),
                })
            })
            .collect();

        let changes = CvrChanges {
            group: self.group.clone(),
            expected_version: self.base_version.clone(),
            version: self.version.clone(),
            replica_version: self.replica_version.clone(),
            ttl_clock_ms: self.ttl.value_ms(),
            last_active_ms: self.ttl.last_active_ms(),
            client_schema: self.client_schema.clone(),
            put_clients: std::mem::take(&mut self.added_clients).into_iter().collect(),
            del_clients: std::mem::take(&mut self.removed_clients)
                .into_iter()
                .collect(),
            queries,
            desires,
            rows,
        };
        self.base_version = self.version.clone();
        self.instance_dirty = false;
        changes
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn remove_query_ref(
        &mut self,
        rref: &RowRef,
        hash: &QueryHash,
        version: &CvrVersion,
        diff: &mut PokeDiff,
    ) {
        let Some(rec) = self.rows.get_mut(rref) else {
            return;
        };
        let Some(refs) = rec.refs.as_mut() else {
            return;
        };
        if refs.remove(hash).is_some() {
            if let Some(n) = self.query_rows.get_mut(hash) {
                *n = n.saturating_sub(1);
            }
        }
        if refs.is_empty() {
            rec.refs = None;
            rec.value = None;
            rec.patch_version = version.clone();
            diff.rows.push(RowPatch::Del {
                table_name: rref.table.clone(),
                id: rref.id_value(),
            });
        }
        self.dirty_rows.insert(rref.clone());
    }
}

// =============================================================================
// Tests
// =============================================================================

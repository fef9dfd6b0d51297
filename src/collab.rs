//! # Collaborator Interfaces
//!
//! Traits for the external collaborators the syncer consumes, and the value
//! types that cross those seams. Query execution, row-level permissions, and
//! custom-query transformation are out of scope for this crate; the syncer
//! only depends on these interfaces.
//!
//! The traits are object-safe and async so callers can inject network-backed
//! implementations; tests use in-memory fakes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{ClientId, QueryHash, StateVersion};

// =============================================================================
// Rows
// =============================================================================

/// One row as produced by query execution: identity, content version, and
/// the payload sent to clients.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub table: String,
    pub key: String,
    pub row_version: String,
    pub value: Value,
}

impl SourceRow {
    pub fn new(
        table: impl Into<String>,
        key: impl Into<String>,
        row_version: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
            row_version: row_version.into(),
            value,
        }
    }
}

// =============================================================================
// Upstream Changes
// =============================================================================

/// Per-row effect of an upstream transaction on the queries of one client
/// group.
///
/// The change ingestion pipeline (out of scope) runs the group's queries
/// incrementally and reports, for each touched row, the reference-count
/// delta per query. `value = None` means the row no longer exists upstream.
#[derive(Debug, Clone)]
pub struct RowDiff {
    pub table: String,
    pub key: String,
    pub row_version: String,
    pub value: Option<Value>,
    /// `(query, delta)` reference-count changes caused by this row change.
    pub refs: Vec<(QueryHash, i64)>,
}

/// An upstream transaction applied to one client group's CVR, identified by
/// its replication watermark.
#[derive(Debug, Clone)]
pub struct UpstreamChange {
    pub state_version: StateVersion,
    pub row_diffs: Vec<RowDiff>,
    /// Per-client last-mutation-ID confirmations carried by this
    /// transaction.
    pub lmid_changes: BTreeMap<ClientId, u64>,
    /// Opaque custom-mutator results to relay in the same poke.
    pub mutations: Vec<Value>,
}

impl UpstreamChange {
    pub fn new(state_version: StateVersion) -> Self {
        Self {
            state_version,
            row_diffs: Vec::new(),
            lmid_changes: BTreeMap::new(),
            mutations: Vec::new(),
        }
    }

    pub fn with_row_diff(mut self, diff: RowDiff) -> Self {
        self.row_diffs.push(diff);
        self
    }

    pub fn with_lmid(mut self, client: ClientId, lmid: u64) -> Self {
        self.lmid_changes.insert(client, lmid);
        self
    }
}

// =============================================================================
// Collaborator Traits
// =============================================================================

/// Executes a query AST against the serving replica.
#[async_trait]
pub trait RowSource: Send + Sync + 'static {
    /// Returns the current result set of `ast`. Duplicate `(table, key)`
    /// entries are meaningful: a row appearing N times in the result
    /// contributes a reference count of N.
    async fn fetch(&self, ast: &Value) -> Result<Vec<SourceRow>>;
}

/// Row-level access control. Rows a client may not see are dropped before
/// they enter the CVR.
#[async_trait]
pub trait PermissionFilter: Send + Sync + 'static {
    async fn filter(&self, rows: Vec<SourceRow>, auth: Option<&Value>) -> Result<Vec<SourceRow>>;
}

/// Resolves a named custom query to an AST, typically by consulting an
/// application server.
#[async_trait]
pub trait QueryTransformer: Send + Sync + 'static {
    async fn transform(&self, name: &str, args: &[Value]) -> Result<Value>;
}

/// A permission filter that admits every row. Useful when permissions are
/// enforced upstream or in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermitAll;

#[async_trait]
impl PermissionFilter for PermitAll {
    async fn filter(&self, rows: Vec<SourceRow>, _auth: Option<&Value>) -> Result<Vec<SourceRow>> {
        Ok(rows)
    }
}

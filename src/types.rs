//! # Domain Types
//!
//! Core types for the view-synchronization domain: client groups, clients,
//! query hashes, CVR versions and their cookie encoding, the replication
//! watermark encoding, and client schema declarations.
//!
//! ## Invariants
//!
//! - [`CvrVersion`]: non-decreasing across all persisted writes for a client
//!   group; `state_version` advances only with a replication watermark,
//!   `minor_version` counts CVR-only changes within one `state_version`.
//! - [`StateVersion`]: lexicographically ordered; `from_watermark` produces
//!   strings whose string order matches the numeric order of the watermark.
//! - [`QueryHash`]: deterministic XXH3-64 of the normalized query
//!   definition, stable across platforms and versions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// =============================================================================
// Identifiers
// =============================================================================

/// Stable identifier shared by all tabs/clients of one logical session.
///
/// Every CVR is keyed by a client group; all clients of the group observe the
/// same versioned view state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientGroupId(String);

impl ClientGroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientGroupId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ClientGroupId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a single client (one tab) within a client group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a server task that can own a client group's CVR.
///
/// Ownership is last-writer-wins; the losing task is fenced by the version
/// compare-and-swap on its next flush, not by this identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a process-unique task identifier.
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        Self(format!("task-{}-{}", std::process::id(), n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the upstream replica snapshot a CVR is consistent with.
///
/// A CVR whose replica version differs from the serving replica's cannot be
/// caught up; the client must reset from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaVersion(String);

impl ReplicaVersion {
    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Query Hashes
// =============================================================================

/// Identifier of a query within a client group.
///
/// Computed as the XXH3-64 of the normalized query definition: the canonical
/// JSON of the AST, or `name(argsJson)` for named custom queries. Clients
/// compute the same hash client-side, so the encoding is part of the
/// protocol surface and must stay stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryHash(String);

impl QueryHash {
    /// Wraps an externally supplied hash string.
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Hash of a query AST.
    pub fn of_ast(ast: &Value) -> Self {
        Self::digest(ast.to_string().as_bytes())
    }

    /// Hash of a named custom query and its arguments.
    pub fn of_named(name: &str, args: &[Value]) -> Self {
        let args = Value::Array(args.to_vec());
        Self::digest(format!("{}({})", name, args).as_bytes())
    }

    fn digest(bytes: &[u8]) -> Self {
        Self(format!("{:016x}", xxhash_rust::xxh3::xxh3_64(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QueryHash {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// State Versions and Cookies
// =============================================================================

/// A position in the upstream change stream, as a lexicographically ordered
/// string.
///
/// Replication sources emit numeric offsets; [`StateVersion::from_watermark`]
/// encodes them with a base-36 digit-count prefix so that string comparison
/// matches numeric comparison for any `u64` (`"00" < "01" < … < "0z" <
/// "110" < …`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVersion(String);

impl StateVersion {
    /// The version of a freshly created CVR, ordered before every watermark.
    pub fn initial() -> Self {
        Self::from_watermark(0)
    }

    /// Length-prefixed base-36 encoding of a numeric watermark.
    pub fn from_watermark(watermark: u64) -> Self {
        let digits = to_base36(watermark);
        let mut s = String::with_capacity(digits.len() + 1);
        s.push(BASE36[digits.len() - 1] as char);
        s.push_str(&digits);
        Self(s)
    }

    /// Wraps an already-encoded version string.
    pub fn from_raw(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

/// A CVR version: `(state_version, minor_version)`.
///
/// `state_version` advances only on confirmed upstream changes;
/// `minor_version` counts CVR-only changes (query add/remove, TTL changes,
/// hydrations, evictions) within the same `state_version` and resets to 0
/// when the state version advances.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CvrVersion {
    pub state_version: StateVersion,
    pub minor_version: u64,
}

impl CvrVersion {
    /// The version of a freshly created CVR.
    pub fn initial() -> Self {
        Self {
            state_version: StateVersion::initial(),
            minor_version: 0,
        }
    }

    pub fn new(state_version: StateVersion, minor_version: u64) -> Self {
        Self {
            state_version,
            minor_version,
        }
    }

    /// The cookie encoding: `"<state>"` when minor is 0, else
    /// `"<state>:<minor>"`.
    pub fn cookie(&self) -> String {
        if self.minor_version == 0 {
            self.state_version.as_str().to_string()
        } else {
            format!("{}:{}", self.state_version, self.minor_version)
        }
    }

    /// Parses a cookie string. Malformed cookies are protocol violations.
    pub fn parse(cookie: &str) -> Result<Self> {
        if cookie.is_empty() {
            return Err(Error::BadCookie(cookie.to_string()));
        }
        match cookie.split_once(':') {
            None => Ok(Self::new(StateVersion::from_raw(cookie), 0)),
            Some((state, minor)) => {
                let minor: u64 = minor
                    .parse()
                    .map_err(|_| Error::BadCookie(cookie.to_string()))?;
                if state.is_empty() || minor == 0 {
                    return Err(Error::BadCookie(cookie.to_string()));
                }
                Ok(Self::new(StateVersion::from_raw(state), minor))
            }
        }
    }

    /// The next CVR-only version within the current state version.
    pub fn next_minor(&self) -> Self {
        Self::new(self.state_version.clone(), self.minor_version + 1)
    }

    /// The version reached by applying an upstream change.
    pub fn with_state(state_version: StateVersion) -> Self {
        Self::new(state_version, 0)
    }
}

impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cookie())
    }
}

// =============================================================================
// Schemas
// =============================================================================

/// The tables and columns a set of clients declared support for, or the
/// shape the serving replica actually provides.
///
/// Used to reject stale clients on schema drift: every table and column a
/// client declares must exist in the replica schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSchema {
    pub tables: BTreeMap<String, Vec<String>>,
}

impl ClientSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(
        mut self,
        table: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.tables
            .insert(table.into(), columns.into_iter().map(Into::into).collect());
        self
    }

    /// Returns the first table/column the declared schema references that
    /// this schema does not provide, if any.
    pub fn first_unsupported(&self, declared: &ClientSchema) -> Option<String> {
        for (table, columns) in &declared.tables {
            let Some(provided) = self.tables.get(table) else {
                return Some(format!("table \"{}\"", table));
            };
            for column in columns {
                if !provided.contains(column) {
                    return Some(format!("column \"{}.{}\"", table, column));
                }
            }
        }
        None
    }
}

/// The inclusive range of client schema versions a server supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersions {
    pub min_supported_version: u32,
    pub max_supported_version: u32,
}

impl SchemaVersions {
    pub fn new(min: u32, max: u32) -> Self {
        Self {
            min_supported_version: min,
            max_supported_version: max,
        }
    }

    pub fn supports(&self, version: u32) -> bool {
        (self.min_supported_version..=self.max_supported_version).contains(&version)
    }
}

impl Default for SchemaVersions {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

// =============================================================================
// Rows
// =============================================================================

/// Identifies a row in the replicated database: table name plus the
/// canonical serialization of its primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowRef {
    pub table: String,
    pub key: String,
}

impl RowRef {
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }

    /// The row key as a JSON value for `rowsPatch: del` entries. Keys that
    /// are themselves canonical JSON round-trip; anything else is carried as
    /// a JSON string.
    pub fn id_value(&self) -> Value {
        serde_json::from_str(&self.key).unwrap_or_else(|_| Value::String(self.key.clone()))
    }
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.key)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_hash_deterministic() {
        let ast = json!({"table": "issue", "where": {"open": true}});
        assert_eq!(QueryHash::of_ast(&ast), QueryHash::of_ast(&ast));
        assert_ne!(
            QueryHash::of_ast(&ast),
            QueryHash::of_ast(&json!({"table": "issue"}))
        );
    }

    #[test]
    fn test_query_hash_named_distinguishes_args() {
        let a = QueryHash::of_named("issuesByOwner", &[json!("alice")]);
        let b = QueryHash::of_named("issuesByOwner", &[json!("bob")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_version_orders_like_watermarks() {
        let marks = [0u64, 1, 35, 36, 1000, 46655, 46656, u64::MAX - 1, u64::MAX];
        for w in marks.windows(2) {
            let a = StateVersion::from_watermark(w[0]);
            let b = StateVersion::from_watermark(w[1]);
            assert!(a < b, "{} should order before {}", a, b);
        }
    }

    #[test]
    fn test_state_version_initial_is_00() {
        assert_eq!(StateVersion::initial().as_str(), "00");
    }

    #[test]
    fn test_cookie_omits_zero_minor() {
        let v = CvrVersion::new(StateVersion::from_watermark(37), 0);
        assert_eq!(v.cookie(), "111");
        assert_eq!(v.next_minor().cookie(), "111:1");
    }

    #[test]
    fn test_cookie_roundtrip() {
        for v in [
            CvrVersion::initial(),
            CvrVersion::new(StateVersion::from_watermark(12345), 0),
            CvrVersion::new(StateVersion::from_watermark(12345), 7),
        ] {
            assert_eq!(CvrVersion::parse(&v.cookie()).unwrap(), v);
        }
    }

    #[test]
    fn test_cookie_rejects_malformed() {
        for c in ["", "00:", "00:0", "00:x", ":3"] {
            assert!(CvrVersion::parse(c).is_err(), "cookie {:?} should fail", c);
        }
    }

    #[test]
    fn test_version_ordering() {
        let a = CvrVersion::new(StateVersion::from_watermark(5), 2);
        let b = CvrVersion::new(StateVersion::from_watermark(5), 10);
        let c = CvrVersion::new(StateVersion::from_watermark(6), 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_client_schema_reconciliation() {
        let replica = ClientSchema::new()
            .with_table("issue", ["id", "title", "owner"])
            .with_table("comment", ["id", "body"]);

        let ok = ClientSchema::new().with_table("issue", ["id", "title"]);
        assert_eq!(replica.first_unsupported(&ok), None);

        let bad_table = ClientSchema::new().with_table("label", ["id"]);
        assert_eq!(
            replica.first_unsupported(&bad_table),
            Some("table \"label\"".to_string())
        );

        let bad_column = ClientSchema::new().with_table("comment", ["id", "author"]);
        assert_eq!(
            replica.first_unsupported(&bad_column),
            Some("column \"comment.author\"".to_string())
        );
    }

    #[test]
    fn test_row_ref_id_value() {
        let json_key = RowRef::new("issue", r#"{"id":7}"#);
        assert_eq!(json_key.id_value(), json!({"id": 7}));

        let plain_key = RowRef::new("issue", "issue-7");
        assert_eq!(plain_key.id_value(), json!("issue-7"));
    }

    #[test]
    fn test_schema_versions_range() {
        let v = SchemaVersions::new(2, 4);
        assert!(!v.supports(1));
        assert!(v.supports(2));
        assert!(v.supports(4));
        assert!(!v.supports(5));
    }
}

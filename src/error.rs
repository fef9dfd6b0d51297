//! # Error Handling
//!
//! One [`Error`] enum covers every failure mode in the crate, derived with
//! `thiserror`. The taxonomy splits into:
//!
//! | Category | Examples | Response |
//! |----------|----------|----------|
//! | Protocol violation | base cookie ahead of CVR, unknown client | fatal to the connection |
//! | Version incompatibility | schema version out of range, schema drift | fatal, message names the range |
//! | Replica mismatch | CVR built against a different replica | fatal, client resets |
//! | Write conflict | concurrent flush or ownership takeover | reload CVR and retry locally |
//! | Per-query failure | row source / transformer error | poke-level, connection survives |
//! | Internal | SQLite error, closed channel | log and investigate |
//!
//! Fatal errors are mapped onto a wire-level [`ErrorKind`] + message body;
//! recoverable ones never reach the client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::QueryHash;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur while serving a client group.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Protocol violations (fatal to the connection)
    // =========================================================================
    /// The client presented a cookie ahead of the stored CVR version.
    ///
    /// The client claims to have seen state this server never produced;
    /// it must reconnect from scratch.
    #[error("base cookie {base_cookie} is ahead of CVR version {cvr_version}")]
    InvalidBaseCookie {
        base_cookie: String,
        cvr_version: String,
    },

    /// A cookie string that does not parse as `<state>[:<minor>]`.
    #[error("malformed cookie {0:?}")]
    BadCookie(String),

    /// A client reconnected with a cookie but the CVR has no record of it,
    /// or the CVR was built against a different replica than the one now
    /// serving.
    #[error("client {client_id} not found: {reason}")]
    ClientNotFound { client_id: String, reason: String },

    // =========================================================================
    // Version incompatibility (fatal)
    // =========================================================================
    /// The client's declared schema version is outside the supported range.
    #[error("schema version {version} is not in the supported range [{min}, {max}]")]
    SchemaVersionNotSupported { version: u32, min: u32, max: u32 },

    /// The client declared a table or column the replica does not provide.
    #[error("client schema references unsupported {0}")]
    ClientSchemaMismatch(String),

    // =========================================================================
    // Recoverable (handled locally, never surfaced to clients)
    // =========================================================================
    /// Optimistic flush conflict: the persisted CVR version no longer
    /// matches the version this task last read. The in-memory CVR must be
    /// reloaded and the operation retried.
    #[error("CVR write conflict: expected version {expected}, found {actual}")]
    WriteConflict { expected: String, actual: String },

    /// A reload after a write conflict revealed a different owner; this
    /// task must stop serving the group.
    #[error("ownership of client group lost to task {owner}")]
    OwnershipLost { owner: String },

    /// An upstream change arrived with a watermark at or behind the CVR's
    /// current state version.
    #[error("stale watermark {received}: CVR is already at {current}")]
    StaleWatermark { received: String, current: String },

    // =========================================================================
    // Per-query failures (poke-level, connection survives)
    // =========================================================================
    /// A collaborator (row source, permission filter, query transformer)
    /// failed for one query. Only that query is affected.
    #[error("query {hash} failed: {message}")]
    QueryError { hash: QueryHash, message: String },

    // =========================================================================
    // Internal
    // =========================================================================
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Persisted schema version mismatch or corrupted metadata.
    #[error("schema error: {0}")]
    Schema(String),

    /// A store or syncer channel closed while a request was in flight.
    #[error("{0} is no longer running")]
    Stopped(&'static str),
}

impl Error {
    /// True if this error must terminate the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidBaseCookie { .. }
                | Error::BadCookie(_)
                | Error::ClientNotFound { .. }
                | Error::SchemaVersionNotSupported { .. }
                | Error::ClientSchemaMismatch(_)
        )
    }

    /// The wire-level kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidBaseCookie { .. } | Error::BadCookie(_) => {
                ErrorKind::InvalidConnectionRequestBaseCookie
            }
            Error::ClientNotFound { .. } => ErrorKind::ClientNotFound,
            Error::SchemaVersionNotSupported { .. } | Error::ClientSchemaMismatch(_) => {
                ErrorKind::SchemaVersionNotSupported
            }
            Error::QueryError { .. } => ErrorKind::Query,
            _ => ErrorKind::Internal,
        }
    }

    /// The structured body sent to a client before closing on this error.
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

// =============================================================================
// Wire-Level Taxonomy
// =============================================================================

/// Error kinds as they appear on the wire.
///
/// Clients reset local state (clearing their cookie) on `ClientNotFound` and
/// `InvalidConnectionRequestBaseCookie`; other kinds are surfaced to the
/// application or retried by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ClientNotFound,
    InvalidConnectionRequestBaseCookie,
    SchemaVersionNotSupported,
    Query,
    Internal,
}

/// The structured error body delivered downstream before a close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// A `Result` alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

//! # viewsync: Real-Time View Synchronization
//!
//! A view-synchronization engine: it keeps each connected client's local
//! query results consistent with an upstream database, using an
//! incrementally-maintained per-client-group snapshot (the CVR, Client
//! View Record) and a diff-based wire protocol (pokes). It survives
//! disconnect/reconnect, multi-tab clients sharing one logical group, and
//! server restarts with hand-offs between instances, and expires unused
//! queries automatically.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        SyncerRegistry                            │
//! │   client group ──► ViewSyncer (one task per group)               │
//! │                        │                                         │
//! │      ┌─────────────────┼──────────────────┐                      │
//! │      ▼                 ▼                  ▼                      │
//! │   CVR engine       TTL clock and      poke protocol              │
//! │   versioned        lifecycle          catch-up plus live         │
//! │   diffs            scheduler          diff streams               │
//! │      │                                                           │
//! │      ▼                                                           │
//! │   VersionedStore (SQLite, optimistic CAS, dedicated thread)      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Version monotonicity**: a group's persisted CVR version never
//!    decreases; every flush is a compare-and-swap against the last-read
//!    version.
//! 2. **Cookie ordering**: per client, each poke's `baseCookie` equals the
//!    previous poke's `cookie`.
//! 3. **Reference counting**: a row is visible while some query references
//!    it; zeroing a row's last reference emits its delete patch in the same
//!    flush.
//! 4. **Serving time**: TTL countdowns run on a logical clock that pauses
//!    while nothing serves the group.
//! 5. **Single writer**: one task owns a group at a time; takeover is
//!    last-writer-wins and the loser is fenced by its next failed swap.
//!
//! ## Module Organization
//!
//! - [`types`]: newtype domain model (groups, clients, hashes, versions,
//!   cookies, schemas)
//! - [`error`]: error taxonomy and wire error kinds
//! - [`schema`]: SQLite DDL and database initialization
//! - [`store`]: durable CVR store behind a dedicated connection thread
//! - [`cvr`]: the CVR engine: diffs, hydration, upstream changes, eviction
//! - [`ttl`]: TTL clock, eviction deadlines, injectable time source
//! - [`poke`]: poke wire protocol and catch-up assembly
//! - [`ownership`]: last-writer-wins group ownership
//! - [`syncer`]: the per-group actor and its connection surface
//! - [`registry`]: explicit group → syncer registry
//! - [`collab`]: collaborator traits (row source, permissions, transformer)

pub mod collab;
pub mod cvr;
pub mod error;
pub mod ownership;
pub mod poke;
pub mod registry;
pub mod schema;
pub mod store;
pub mod syncer;
pub mod ttl;
pub mod types;

pub use error::{Error, ErrorBody, ErrorKind, Result};
pub use schema::Database;

pub use collab::{PermissionFilter, QueryTransformer, RowSource, SourceRow, UpstreamChange};
pub use cvr::{Cvr, DesiredQueryPatch, QueryDef};
pub use poke::{PokeMessage, QueryPatch, RowPatch};
pub use registry::SyncerRegistry;
pub use store::{spawn_store, StoreHandle};
pub use syncer::{
    ClientConnection, Collaborators, ConnectRequest, Downstream, SyncerConfig, SyncerHandle,
};
pub use ttl::{Clock, ManualClock, SystemClock};
pub use types::{
    ClientGroupId, ClientId, ClientSchema, CvrVersion, QueryHash, ReplicaVersion, SchemaVersions,
    StateVersion, TaskId,
};

#![allow(dead_code)]

//! Shared fixtures for the integration suites: fake collaborators, a
//! temp-file store + registry harness driven by a [`ManualClock`], and a
//! small client-side view that applies pokes the way a real client would
//! (buffering parts, enforcing cookie chaining).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use viewsync::collab::{PermitAll, QueryTransformer, RowSource, SourceRow};
use viewsync::poke::{PokeMessage, PokePart};
use viewsync::syncer::{ClientConnection, Collaborators, ConnectRequest, Downstream, SyncerConfig};
use viewsync::ttl::ManualClock;
use viewsync::{
    ClientId, ClientSchema, CvrVersion, Database, ReplicaVersion, Result, SchemaVersions,
    StoreHandle, SyncerHandle, SyncerRegistry, TaskId,
};

// =============================================================================
// Fake Collaborators
// =============================================================================

/// A row source backed by a mutable map keyed on the query AST.
#[derive(Default)]
pub struct FakeRowSource {
    results: Mutex<HashMap<String, Vec<SourceRow>>>,
}

impl FakeRowSource {
    /// Sets the result set the given AST will return from now on.
    pub fn set(&self, ast: &Value, rows: Vec<SourceRow>) {
        self.results
            .lock()
            .unwrap()
            .insert(ast.to_string(), rows);
    }
}

#[async_trait]
impl RowSource for FakeRowSource {
    async fn fetch(&self, ast: &Value) -> Result<Vec<SourceRow>> {
        Ok(self
            .results
            .lock()
            .unwrap()
            .get(&ast.to_string())
            .cloned()
            .unwrap_or_default())
    }
}

/// A transformer backed by a name → AST map; unknown names fail.
#[derive(Default)]
pub struct FakeTransformer {
    asts: Mutex<HashMap<String, Value>>,
}

impl FakeTransformer {
    pub fn define(&self, name: &str, ast: Value) {
        self.asts.lock().unwrap().insert(name.to_string(), ast);
    }
}

#[async_trait]
impl QueryTransformer for FakeTransformer {
    async fn transform(&self, name: &str, _args: &[Value]) -> Result<Value> {
        self.asts
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| viewsync::Error::Schema(format!("unknown custom query '{}'", name)))
    }
}

/// A row whose payload carries its own id, the way replicated rows do.
pub fn source_row(table: &str, id: &str, version: &str) -> SourceRow {
    SourceRow::new(table, id, version, json!({ "id": id, "v": version }))
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    _dir: tempfile::TempDir,
    pub path: PathBuf,
    pub store: StoreHandle,
    pub clock: Arc<ManualClock>,
    pub rows: Arc<FakeRowSource>,
    pub transformer: Arc<FakeTransformer>,
    pub registry: SyncerRegistry,
}

pub fn default_config() -> SyncerConfig {
    SyncerConfig {
        replica_version: ReplicaVersion::new("r1"),
        replica_schema: ClientSchema::new()
            .with_table("issue", ["id", "v"])
            .with_table("comment", ["id", "v"]),
        schema_versions: SchemaVersions::new(1, 1),
        ..SyncerConfig::default()
    }
}

pub fn collaborators(
    rows: Arc<FakeRowSource>,
    transformer: Arc<FakeTransformer>,
) -> Collaborators {
    Collaborators {
        row_source: rows,
        permission_filter: Arc::new(PermitAll),
        query_transformer: transformer,
    }
}

pub fn build_registry(
    task: &str,
    store: StoreHandle,
    rows: Arc<FakeRowSource>,
    transformer: Arc<FakeTransformer>,
    clock: Arc<ManualClock>,
    config: SyncerConfig,
) -> SyncerRegistry {
    SyncerRegistry::new(
        TaskId::new(task),
        store,
        collaborators(rows, transformer),
        clock,
        config,
    )
}

/// Opt-in log output for debugging test runs (`RUST_LOG=debug cargo test`).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// A temp-file database, store thread, manual clock, and one registry.
pub async fn harness() -> Harness {
    harness_with_config(default_config()).await
}

pub async fn harness_with_config(config: SyncerConfig) -> Harness {
    init_tracing();
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join("cvr.db");
    let db = Database::open(&path).expect("initialize database");
    let store = viewsync::spawn_store(db.into_connection());
    let clock = Arc::new(ManualClock::new(0));
    let rows = Arc::new(FakeRowSource::default());
    let transformer = Arc::new(FakeTransformer::default());
    let registry = build_registry(
        "task-a",
        store.clone(),
        Arc::clone(&rows),
        Arc::clone(&transformer),
        Arc::clone(&clock),
        config,
    );
    Harness {
        _dir: dir,
        path,
        store,
        clock,
        rows,
        transformer,
        registry,
    }
}

pub async fn connect(
    handle: &SyncerHandle,
    client: &str,
    base_cookie: Option<String>,
) -> Result<ClientConnection> {
    handle
        .connect(ConnectRequest {
            client_id: ClientId::new(client),
            schema_version: 1,
            base_cookie,
            client_schema: None,
            auth: None,
        })
        .await
}

/// Polls until `f` returns `Some`, panicking after `timeout`.
pub async fn eventually<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Client-Side View
// =============================================================================

/// A minimal client: buffers poke parts and applies them atomically at
/// `pokeEnd`, enforcing that every poke's base cookie chains from the last
/// applied cookie and that cookies strictly advance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientView {
    pub cookie: Option<String>,
    pub got: BTreeSet<String>,
    pub desired: BTreeMap<String, BTreeSet<String>>,
    pub rows: BTreeMap<String, Value>,
    pub lmids: BTreeMap<String, u64>,
    pending: Option<Pending>,
}

#[derive(Debug, Clone, PartialEq)]
struct Pending {
    poke_id: String,
    parts: Vec<PokePart>,
}

impl ClientView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, message: &PokeMessage) {
        match message {
            PokeMessage::Start(start) => {
                assert!(self.pending.is_none(), "pokeStart inside an open poke");
                assert_eq!(
                    start.base_cookie, self.cookie,
                    "poke base cookie must equal the last applied cookie"
                );
                self.pending = Some(Pending {
                    poke_id: start.poke_id.clone(),
                    parts: Vec::new(),
                });
            }
            PokeMessage::Part(part) => {
                let pending = self.pending.as_mut().expect("pokePart outside a poke");
                assert_eq!(pending.poke_id, part.poke_id);
                pending.parts.push(part.clone());
            }
            PokeMessage::End(end) => {
                let pending = self.pending.take().expect("pokeEnd outside a poke");
                assert_eq!(pending.poke_id, end.poke_id);
                if end.cancel {
                    return;
                }
                for part in &pending.parts {
                    self.apply_part(part);
                }
                if let Some(previous) = &self.cookie {
                    let prev = CvrVersion::parse(previous).unwrap();
                    let next = CvrVersion::parse(&end.cookie).unwrap();
                    assert!(prev < next, "cookies must strictly advance");
                }
                self.cookie = Some(end.cookie.clone());
            }
        }
    }

    fn apply_part(&mut self, part: &PokePart) {
        if let Some(lmids) = &part.last_mutation_id_changes {
            for (client, lmid) in lmids {
                self.lmids.insert(client.to_string(), *lmid);
            }
        }
        if let Some(desired) = &part.desired_queries_patches {
            for (client, patches) in desired {
                let entry = self.desired.entry(client.to_string()).or_default();
                for patch in patches {
                    match patch {
                        viewsync::QueryPatch::Put { hash } => {
                            entry.insert(hash.to_string());
                        }
                        viewsync::QueryPatch::Del { hash } => {
                            entry.remove(hash.as_str());
                        }
                    }
                }
            }
        }
        if let Some(got) = &part.got_queries_patch {
            for patch in got {
                match patch {
                    viewsync::QueryPatch::Put { hash } => {
                        self.got.insert(hash.to_string());
                    }
                    viewsync::QueryPatch::Del { hash } => {
                        self.got.remove(hash.as_str());
                    }
                }
            }
        }
        if let Some(rows) = &part.rows_patch {
            for patch in rows {
                match patch {
                    viewsync::RowPatch::Put { table_name, value } => {
                        let id = value.get("id").expect("test rows carry their id");
                        self.rows
                            .insert(format!("{}/{}", table_name, id), value.clone());
                    }
                    viewsync::RowPatch::Del { table_name, id } => {
                        self.rows.remove(&format!("{}/{}", table_name, id));
                    }
                }
            }
        }
    }

    /// The synchronized slice of state shared by every client of a group,
    /// for cross-client equivalence assertions (desired sets are per client
    /// and excluded).
    pub fn synced_state(&self) -> (Option<String>, BTreeSet<String>, BTreeMap<String, Value>) {
        (self.cookie.clone(), self.got.clone(), self.rows.clone())
    }
}

// =============================================================================
// Receiving Helpers
// =============================================================================

/// Receives one full poke (start through end), failing on downstream errors.
pub async fn recv_poke(conn: &mut ClientConnection) -> Vec<PokeMessage> {
    let mut messages = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), conn.receiver.recv())
            .await
            .expect("timed out waiting for a poke")
            .expect("connection closed while waiting for a poke");
        match message {
            Downstream::Poke(message) => {
                let end = matches!(message, PokeMessage::End(_));
                messages.push(message);
                if end {
                    return messages;
                }
            }
            Downstream::Error(body) => panic!("unexpected downstream error: {:?}", body),
        }
    }
}

/// Receives and applies one full poke.
pub async fn apply_next_poke(view: &mut ClientView, conn: &mut ClientConnection) {
    for message in recv_poke(conn).await {
        view.apply(&message);
    }
}

/// Asserts that no downstream message arrives within `window`.
pub async fn expect_no_message(conn: &mut ClientConnection, window: Duration) {
    if let Ok(message) = tokio::time::timeout(window, conn.receiver.recv()).await {
        panic!("expected silence, received {:?}", message.map(describe));
    }
}

fn describe(message: Downstream) -> String {
    match message {
        Downstream::Poke(m) => format!("poke message {:?}", m.poke_id()),
        Downstream::Error(body) => format!("error {:?}", body.kind),
    }
}

//! # View Syncer
//!
//! One `ViewSyncer` task serves one client group: it owns the in-memory CVR,
//! serializes every mutation for the group, and fans pokes out to the
//! group's connected clients.
//!
//! ```text
//! connect / changeDesiredQueries / upstream change / deleteClients
//!        │
//!        ▼
//! ┌─────────────────────────────────────────────┐
//! │ ViewSyncer (one tokio task per client group)│
//! │                                             │
//! │   CVR ──take_changes──► StoreHandle (CAS)   │
//! │    │                                        │
//! │    └──PokeDiff──► pokes ──► client channels │
//! │                                             │
//! │   single eviction timer + clock-touch tick  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Mutations run to completion before the next is admitted; persistence
//! waits are the only suspension points. A flush that loses the version
//! compare-and-swap discards the in-memory CVR, reloads, and retries the
//! whole logical operation; if the reload reveals a foreign owner the task
//! stops serving the group and every connection is closed.
//!
//! The task exits when its last connection closes (after a final clock
//! flush), so the TTL clock never advances while a group is unserved.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::collab::{PermissionFilter, QueryTransformer, RowSource, SourceRow, UpstreamChange};
use crate::cvr::{Cvr, DesiredQueryPatch, QueryDef};
use crate::error::{Error, ErrorBody, Result};
use crate::ownership::OwnershipManager;
use crate::poke::{
    build_poke, cancel_poke, catchup_diff, PokeDiff, PokeMessage, POKE_PART_MAX_PATCHES,
};
use crate::store::StoreHandle;
use crate::ttl::{self, Clock, TTL_CLOCK_INTERVAL_MS, TTL_TIMER_HYSTERESIS_MS};
use crate::types::{
    ClientGroupId, ClientId, ClientSchema, CvrVersion, QueryHash, ReplicaVersion, SchemaVersions,
};

// =============================================================================
// Configuration
// =============================================================================

/// Bound of the syncer request channel.
const SYNCER_CHANNEL_SIZE: usize = 64;

/// How often a flush is retried after an optimistic write conflict before
/// the operation is surfaced as transient.
pub const FLUSH_RETRY_LIMIT: usize = 3;

/// Tunables for one view-syncer task.
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// The replica snapshot this server serves. CVRs bound to a different
    /// replica cannot be caught up.
    pub replica_version: ReplicaVersion,
    /// Tables/columns the replica provides; client declarations are checked
    /// against this.
    pub replica_schema: ClientSchema,
    /// Client schema versions this server accepts.
    pub schema_versions: SchemaVersions,
    pub ttl_clock_interval_ms: u64,
    pub ttl_timer_hysteresis_ms: u64,
    pub flush_retry_limit: usize,
    pub poke_part_max_patches: usize,
    /// Slack capacity of each client's downstream channel beyond its
    /// catch-up backlog.
    pub downstream_capacity: usize,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            replica_version: ReplicaVersion::new("0"),
            replica_schema: ClientSchema::new(),
            schema_versions: SchemaVersions::default(),
            ttl_clock_interval_ms: TTL_CLOCK_INTERVAL_MS,
            ttl_timer_hysteresis_ms: TTL_TIMER_HYSTERESIS_MS,
            flush_retry_limit: FLUSH_RETRY_LIMIT,
            poke_part_max_patches: POKE_PART_MAX_PATCHES,
            downstream_capacity: 256,
        }
    }
}

/// The external collaborators a syncer consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub row_source: Arc<dyn RowSource>,
    pub permission_filter: Arc<dyn PermissionFilter>,
    pub query_transformer: Arc<dyn QueryTransformer>,
}

// =============================================================================
// Connection Surface
// =============================================================================

/// A client's connection request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub client_id: ClientId,
    pub schema_version: u32,
    /// Cookie of the last poke the client applied, if reconnecting.
    pub base_cookie: Option<String>,
    pub client_schema: Option<ClientSchema>,
    /// Opaque auth data handed to the permission filter.
    pub auth: Option<Value>,
}

/// Messages delivered to one connected client.
#[derive(Debug, Clone)]
pub enum Downstream {
    Poke(PokeMessage),
    /// A structured error body. Fatal kinds are followed by channel close.
    Error(ErrorBody),
}

/// An established connection: the stream of downstream messages for one
/// client. Dropping the receiver disconnects.
#[derive(Debug)]
pub struct ClientConnection {
    pub client_id: ClientId,
    pub receiver: mpsc::Receiver<Downstream>,
}

impl futures::Stream for ClientConnection {
    type Item = Downstream;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Downstream>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

struct Connection {
    tx: mpsc::Sender<Downstream>,
    cookie: CvrVersion,
    auth: Option<Value>,
}

// =============================================================================
// Requests and Handle
// =============================================================================

enum SyncerRequest {
    Connect {
        req: ConnectRequest,
        respond: oneshot::Sender<Result<ClientConnection>>,
    },
    Disconnect {
        client_id: ClientId,
    },
    ChangeDesiredQueries {
        client_id: ClientId,
        patches: Vec<DesiredQueryPatch>,
        respond: oneshot::Sender<Result<()>>,
    },
    ApplyUpstreamChange {
        change: UpstreamChange,
        respond: oneshot::Sender<Result<()>>,
    },
    DeleteClients {
        client_ids: Vec<ClientId>,
        respond: oneshot::Sender<Result<()>>,
    },
    Stop {
        respond: oneshot::Sender<()>,
    },
}

/// Cloneable handle to one client group's syncer task.
#[derive(Clone)]
pub struct SyncerHandle {
    group: ClientGroupId,
    tx: mpsc::Sender<SyncerRequest>,
}

impl SyncerHandle {
    pub fn group(&self) -> &ClientGroupId {
        &self.group
    }

    /// True once the syncer task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Registers a client connection and returns its downstream stream,
    /// primed with the catch-up poke when the client is behind.
    pub async fn connect(&self, req: ConnectRequest) -> Result<ClientConnection> {
        self.request(|respond| SyncerRequest::Connect { req, respond })
            .await
    }

    /// Drops a client's connection. In-flight flushes are unaffected.
    pub async fn disconnect(&self, client_id: &ClientId) {
        let _ = self
            .tx
            .send(SyncerRequest::Disconnect {
                client_id: client_id.clone(),
            })
            .await;
    }

    /// Applies a desired-query patch set for one client.
    pub async fn change_desired_queries(
        &self,
        client_id: &ClientId,
        patches: Vec<DesiredQueryPatch>,
    ) -> Result<()> {
        self.request(|respond| SyncerRequest::ChangeDesiredQueries {
            client_id: client_id.clone(),
            patches,
            respond,
        })
        .await
    }

    /// Feeds one upstream transaction into the group's CVR.
    pub async fn apply_upstream_change(&self, change: UpstreamChange) -> Result<()> {
        self.request(|respond| SyncerRequest::ApplyUpstreamChange { change, respond })
            .await
    }

    /// Deletes clients and the queries only they desired.
    pub async fn delete_clients(&self, client_ids: Vec<ClientId>) -> Result<()> {
        self.request(|respond| SyncerRequest::DeleteClients {
            client_ids,
            respond,
        })
        .await
    }

    /// Stops the task after a final clock flush.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(SyncerRequest::Stop { respond: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> SyncerRequest,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| Error::Stopped("view syncer"))?;
        rx.await.map_err(|_| Error::Stopped("view syncer"))?
    }
}

/// Spawns the syncer task for one client group.
pub fn spawn_syncer(
    group: ClientGroupId,
    store: StoreHandle,
    ownership: OwnershipManager,
    collab: Collaborators,
    clock: Arc<dyn Clock>,
    config: SyncerConfig,
) -> SyncerHandle {
    let (tx, rx) = mpsc::channel(SYNCER_CHANNEL_SIZE);
    let syncer = ViewSyncer {
        group: group.clone(),
        store,
        ownership,
        collab,
        clock,
        config,
        cvr: None,
        rehydrated: false,
        connections: HashMap::new(),
        had_connection: false,
        eviction_at_wall: None,
        next_touch_wall: u64::MAX,
    };
    tokio::spawn(syncer.run(rx));
    SyncerHandle { group, tx }
}

// =============================================================================
// The Syncer Task
// =============================================================================

struct ViewSyncer {
    group: ClientGroupId,
    store: StoreHandle,
    ownership: OwnershipManager,
    collab: Collaborators,
    clock: Arc<dyn Clock>,
    config: SyncerConfig,
    cvr: Option<Cvr>,
    /// Whether hydrated queries have been re-fetched since this task loaded
    /// the CVR.
    rehydrated: bool,
    connections: HashMap<ClientId, Connection>,
    had_connection: bool,
    /// Wall-clock deadline of the single eviction timer.
    eviction_at_wall: Option<u64>,
    /// Wall-clock deadline of the next background clock touch.
    next_touch_wall: u64,
}

impl ViewSyncer {
    async fn run(mut self, mut rx: mpsc::Receiver<SyncerRequest>) {
        info!(group = %self.group, task = %self.ownership.task_id(), "view syncer starting");
        loop {
            let clock = Arc::clone(&self.clock);
            let eviction_enabled = self.eviction_at_wall.is_some();
            let eviction_at = self.eviction_at_wall.unwrap_or(u64::MAX);
            let touch_enabled = self.cvr.is_some();
            let touch_at = self.next_touch_wall;

            let stop = tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => self.handle(req).await,
                    None => true,
                },
                _ = clock.sleep_until(eviction_at), if eviction_enabled => {
                    self.on_eviction_timer().await
                }
                _ = clock.sleep_until(touch_at), if touch_enabled => {
                    self.on_clock_tick().await
                }
            };

            if stop {
                break;
            }
            if self.had_connection && self.connections.is_empty() {
                // Last connection gone: stop serving so the TTL clock
                // pauses. The final flush persists the clock's position.
                self.final_flush().await;
                break;
            }
        }
        info!(group = %self.group, "view syncer stopped");
    }

    /// Handles one request; returns true when the task must stop.
    async fn handle(&mut self, req: SyncerRequest) -> bool {
        match req {
            SyncerRequest::Connect { req, respond } => {
                let result = self.handle_connect(req).await;
                let stop = matches!(result, Err(Error::OwnershipLost { .. }));
                let _ = respond.send(result);
                if stop {
                    return self.fail_group();
                }
                false
            }
            SyncerRequest::Disconnect { client_id } => {
                if self.connections.remove(&client_id).is_some() {
                    debug!(group = %self.group, client = %client_id, "client disconnected");
                }
                false
            }
            SyncerRequest::ChangeDesiredQueries {
                client_id,
                patches,
                respond,
            } => {
                let result = self.handle_change_desired(&client_id, &patches).await;
                let stop = matches!(result, Err(Error::OwnershipLost { .. }));
                let _ = respond.send(result);
                if stop {
                    return self.fail_group();
                }
                false
            }
            SyncerRequest::ApplyUpstreamChange { change, respond } => {
                let result = self.run_op(|cvr| cvr.apply_upstream_change(change.clone())).await;
                let stop = matches!(result, Err(Error::OwnershipLost { .. }));
                let _ = respond.send(result);
                if stop {
                    return self.fail_group();
                }
                false
            }
            SyncerRequest::DeleteClients {
                client_ids,
                respond,
            } => {
                let result = self.handle_delete_clients(&client_ids).await;
                let stop = matches!(result, Err(Error::OwnershipLost { .. }));
                let _ = respond.send(result);
                if stop {
                    return self.fail_group();
                }
                false
            }
            SyncerRequest::Stop { respond } => {
                self.final_flush().await;
                let _ = respond.send(());
                true
            }
        }
    }

    // =========================================================================
    // Connect
    // =========================================================================

    async fn handle_connect(&mut self, req: ConnectRequest) -> Result<ClientConnection> {
        if !self.config.schema_versions.supports(req.schema_version) {
            return Err(Error::SchemaVersionNotSupported {
                version: req.schema_version,
                min: self.config.schema_versions.min_supported_version,
                max: self.config.schema_versions.max_supported_version,
            });
        }
        let base = req
            .base_cookie
            .as_deref()
            .map(CvrVersion::parse)
            .transpose()?;

        // Unconditional takeover: from here on this task is the writer.
        self.ownership
            .take(&self.group, &self.config.replica_version, self.clock.now_ms())
            .await?;

        let mut attempt = 0;
        loop {
            self.ensure_loaded().await?;
            let now = self.clock.now_ms();
            let cvr = self.cvr.as_mut().expect("loaded above");
            cvr.touch(now);

            if cvr.replica_version() != &self.config.replica_version {
                return Err(Error::ClientNotFound {
                    client_id: req.client_id.to_string(),
                    reason: format!(
                        "CVR is bound to replica {} but this server serves {}; reset required",
                        cvr.replica_version(),
                        self.config.replica_version
                    ),
                });
            }
            if let Some(declared) = &req.client_schema {
                cvr.reconcile_client_schema(declared, &self.config.replica_schema)?;
            }
            if let Some(base) = &base {
                if *base > *cvr.version() {
                    return Err(Error::InvalidBaseCookie {
                        base_cookie: base.cookie(),
                        cvr_version: cvr.version().cookie(),
                    });
                }
                if !cvr.has_client(&req.client_id) {
                    return Err(Error::ClientNotFound {
                        client_id: req.client_id.to_string(),
                        reason: "client reconnected with a cookie but has no record".to_string(),
                    });
                }
            }
            cvr.ensure_client(&req.client_id);

            let mut diff = PokeDiff::default();
            if !self.rehydrated {
                diff.merge(self.rehydrate(req.auth.as_ref()).await?);
                self.rehydrated = true;
            }

            match self.flush_and_poke(diff).await {
                Ok(()) => break,
                Err(Error::WriteConflict { expected, actual }) => {
                    attempt += 1;
                    warn!(
                        group = %self.group, expected, actual, attempt,
                        "flush conflict during connect; reloading CVR"
                    );
                    self.on_write_conflict();
                    if attempt > self.config.flush_retry_limit {
                        return Err(Error::WriteConflict { expected, actual });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        // Catch-up: replay everything newer than the client's cookie as one
        // synthetic poke, pre-queued on the connection channel.
        let cvr = self.cvr.as_ref().expect("loaded above");
        let cookie = cvr.version().clone();
        let effective_base = base.clone().unwrap_or_else(CvrVersion::initial);
        let mut backlog = Vec::new();
        if effective_base < cookie {
            let patches = self
                .store
                .catchup_since(&self.group, &effective_base, &req.client_id)
                .await?;
            let diff = catchup_diff(patches);
            backlog = build_poke(
                &cookie.cookie(),
                base.as_ref(),
                &cookie,
                self.config.schema_versions,
                &diff,
                self.config.poke_part_max_patches,
            );
        }

        let (tx, receiver) = mpsc::channel(backlog.len() + self.config.downstream_capacity);
        for message in backlog {
            tx.try_send(Downstream::Poke(message))
                .expect("catch-up backlog fits freshly sized channel");
        }
        self.connections.insert(
            req.client_id.clone(),
            Connection {
                tx,
                cookie,
                auth: req.auth.clone(),
            },
        );
        self.had_connection = true;
        self.reschedule_eviction();
        info!(group = %self.group, client = %req.client_id, "client connected");
        Ok(ClientConnection {
            client_id: req.client_id,
            receiver,
        })
    }

    // =========================================================================
    // Desired Queries
    // =========================================================================

    async fn handle_change_desired(
        &mut self,
        client_id: &ClientId,
        patches: &[DesiredQueryPatch],
    ) -> Result<()> {
        let auth = self
            .connections
            .get(client_id)
            .and_then(|c| c.auth.clone());
        let mut attempt = 0;
        loop {
            self.ensure_loaded().await?;
            let now = self.clock.now_ms();
            let cvr = self.cvr.as_mut().expect("loaded above");
            cvr.touch(now);

            let outcome = cvr.change_desired_queries(client_id, patches)?;
            let mut diff = outcome.diff;
            for (hash, def) in &outcome.hydrate {
                match self.resolve_and_fetch(hash, def, auth.as_ref()).await {
                    Ok(rows) => {
                        let cvr = self.cvr.as_mut().expect("loaded above");
                        diff.merge(cvr.hydrate_query(hash, rows)?);
                    }
                    Err(e) => {
                        // One query's collaborators failed; the connection
                        // and the rest of the patch set are unaffected.
                        warn!(group = %self.group, query = %hash, error = %e, "query hydration failed");
                        self.send_to(client_id, Downstream::Error(e.body()));
                    }
                }
            }

            match self.flush_and_poke(diff).await {
                Ok(()) => return Ok(()),
                Err(Error::WriteConflict { expected, actual }) => {
                    attempt += 1;
                    warn!(
                        group = %self.group, expected, actual, attempt,
                        "flush conflict; reloading CVR and retrying"
                    );
                    self.on_write_conflict();
                    if attempt > self.config.flush_retry_limit {
                        return Err(Error::WriteConflict { expected, actual });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn resolve_and_fetch(
        &self,
        hash: &QueryHash,
        def: &QueryDef,
        auth: Option<&Value>,
    ) -> Result<Vec<SourceRow>> {
        let query_error = |e: Error| Error::QueryError {
            hash: hash.clone(),
            message: e.to_string(),
        };
        let ast = match def {
            QueryDef::Ast { ast } => ast.clone(),
            QueryDef::Named { name, args } => self
                .collab
                .query_transformer
                .transform(name, args)
                .await
                .map_err(query_error)?,
        };
        let rows = self
            .collab
            .row_source
            .fetch(&ast)
            .await
            .map_err(query_error)?;
        self.collab
            .permission_filter
            .filter(rows, auth)
            .await
            .map_err(query_error)
    }

    /// Re-runs every hydrated query after a CVR load, bringing the row set
    /// up to date with the replica this task serves. A CVR-only change: the
    /// state version is untouched.
    async fn rehydrate(&mut self, auth: Option<&Value>) -> Result<PokeDiff> {
        let queries = self
            .cvr
            .as_ref()
            .expect("loaded")
            .queries_to_rehydrate();
        let mut diff = PokeDiff::default();
        for (hash, def) in queries {
            match self.resolve_and_fetch(&hash, &def, auth).await {
                Ok(rows) => {
                    let cvr = self.cvr.as_mut().expect("loaded");
                    diff.merge(cvr.hydrate_query(&hash, rows)?);
                }
                Err(e) => {
                    warn!(group = %self.group, query = %hash, error = %e, "re-hydration failed");
                }
            }
        }
        Ok(diff)
    }

    // =========================================================================
    // Deletion, Timers
    // =========================================================================

    async fn handle_delete_clients(&mut self, client_ids: &[ClientId]) -> Result<()> {
        // Client deletion is an externally-triggered CVR write: take
        // ownership first, like a connect.
        self.ownership
            .take(&self.group, &self.config.replica_version, self.clock.now_ms())
            .await?;
        self.run_op(|cvr| Ok(cvr.delete_clients(client_ids))).await?;
        for client_id in client_ids {
            self.connections.remove(client_id);
        }
        Ok(())
    }

    /// The single per-group eviction timer fired: evict everything whose
    /// deadline has passed, in one poke.
    async fn on_eviction_timer(&mut self) -> bool {
        self.eviction_at_wall = None;
        if self.cvr.is_none() {
            return false;
        }
        let result = self
            .run_op(|cvr| {
                let now_ttl = cvr.ttl_clock().value_ms();
                let expired = ttl::expired_queries(cvr, now_ttl);
                if !expired.is_empty() {
                    debug!(count = expired.len(), now_ttl, "evicting expired queries");
                }
                Ok(cvr.evict_queries(&expired))
            })
            .await;
        match result {
            Ok(()) => {
                self.reschedule_eviction();
                false
            }
            Err(Error::OwnershipLost { .. }) => self.fail_group(),
            Err(e) => {
                warn!(group = %self.group, error = %e, "eviction flush failed");
                self.reschedule_eviction();
                false
            }
        }
    }

    /// Periodic touch: long idle connected periods still count toward TTLs,
    /// and the clock's position is persisted.
    async fn on_clock_tick(&mut self) -> bool {
        self.next_touch_wall = self.clock.now_ms() + self.config.ttl_clock_interval_ms;
        if self.cvr.is_none() {
            return false;
        }
        match self.run_op(|_| Ok(PokeDiff::default())).await {
            Ok(()) => false,
            Err(Error::OwnershipLost { .. }) => self.fail_group(),
            Err(e) => {
                warn!(group = %self.group, error = %e, "clock flush failed");
                false
            }
        }
    }

    async fn final_flush(&mut self) {
        if self.cvr.is_none() {
            return;
        }
        if let Err(e) = self.run_op(|_| Ok(PokeDiff::default())).await {
            warn!(group = %self.group, error = %e, "final clock flush failed");
        }
    }

    /// Closes every connection after an unrecoverable group-level failure.
    fn fail_group(&mut self) -> bool {
        warn!(group = %self.group, "stopping; ownership moved to another task");
        let body = ErrorBody {
            kind: crate::error::ErrorKind::Internal,
            message: "client group moved to another server task".to_string(),
        };
        for conn in self.connections.values() {
            let _ = conn.tx.try_send(Downstream::Error(body.clone()));
        }
        self.connections.clear();
        true
    }

    // =========================================================================
    // CVR Plumbing
    // =========================================================================

    /// Loads the CVR if absent and verifies this task still owns it.
    async fn ensure_loaded(&mut self) -> Result<()> {
        if self.cvr.is_some() {
            return Ok(());
        }
        let now = self.clock.now_ms();
        let cvr = match self.store.load(&self.group).await? {
            Some(snapshot) => snapshot.into_cvr(now),
            None => Cvr::new(
                self.group.clone(),
                self.config.replica_version.clone(),
                now,
            ),
        };
        self.ownership.check_owner(cvr.owner())?;
        self.cvr = Some(cvr);
        self.rehydrated = false;
        if self.next_touch_wall == u64::MAX {
            self.next_touch_wall = now + self.config.ttl_clock_interval_ms;
        }
        Ok(())
    }

    fn on_write_conflict(&mut self) {
        self.cvr = None;
    }

    /// Runs one replayable mutation with conflict-reload-retry.
    async fn run_op<F>(&mut self, mut op: F) -> Result<()>
    where
        F: FnMut(&mut Cvr) -> Result<PokeDiff>,
    {
        let mut attempt = 0;
        loop {
            self.ensure_loaded().await?;
            let now = self.clock.now_ms();
            let cvr = self.cvr.as_mut().expect("loaded above");
            cvr.touch(now);
            let diff = op(cvr)?;
            match self.flush_and_poke(diff).await {
                Ok(()) => return Ok(()),
                Err(Error::WriteConflict { expected, actual }) => {
                    attempt += 1;
                    warn!(
                        group = %self.group, expected, actual, attempt,
                        "flush conflict; reloading CVR and retrying"
                    );
                    self.on_write_conflict();
                    if attempt > self.config.flush_retry_limit {
                        return Err(Error::WriteConflict { expected, actual });
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persists pending changes and broadcasts the resulting poke. A flush
    /// that does not change the version (clock touches) produces no poke.
    async fn flush_and_poke(&mut self, diff: PokeDiff) -> Result<()> {
        let cvr = self.cvr.as_mut().expect("flush without CVR");
        if !cvr.has_changes() {
            return Ok(());
        }
        let changes = cvr.take_changes();
        let base = changes.expected_version.clone();
        let cookie = changes.version.clone();
        self.store.flush(changes).await?;

        if cookie != base {
            self.broadcast_poke(&base, &cookie, &diff).await;
        }
        self.reschedule_eviction();
        Ok(())
    }

    /// Sends one poke to every connected client. Every live connection sits
    /// at `base`; each moves to `cookie`. A client that cannot keep up is
    /// disconnected and will catch up on reconnect.
    async fn broadcast_poke(&mut self, base: &CvrVersion, cookie: &CvrVersion, diff: &PokeDiff) {
        let messages = build_poke(
            &cookie.cookie(),
            Some(base),
            cookie,
            self.config.schema_versions,
            diff,
            self.config.poke_part_max_patches,
        );
        let mut dead = Vec::new();
        for (client_id, conn) in self.connections.iter_mut() {
            if conn.cookie != *base {
                warn!(
                    group = %self.group, client = %client_id,
                    at = %conn.cookie, expected = %base,
                    "connection cookie out of step; dropping"
                );
                dead.push(client_id.clone());
                continue;
            }
            let mut failed = false;
            for message in &messages {
                if conn
                    .tx
                    .try_send(Downstream::Poke(message.clone()))
                    .is_err()
                {
                    failed = true;
                    break;
                }
            }
            if failed {
                // Abort the partial poke before the channel closes; the
                // receiver discards everything since pokeStart.
                let _ = conn
                    .tx
                    .try_send(Downstream::Poke(cancel_poke(&cookie.cookie(), base)));
                warn!(group = %self.group, client = %client_id, "client cannot keep up; dropping");
                dead.push(client_id.clone());
            } else {
                conn.cookie = cookie.clone();
            }
        }
        for client_id in dead {
            self.connections.remove(&client_id);
        }
    }

    fn send_to(&self, client_id: &ClientId, message: Downstream) {
        if let Some(conn) = self.connections.get(client_id) {
            let _ = conn.tx.try_send(message);
        }
    }

    /// Reprograms the single eviction timer from the current inactive-query
    /// set. Fires `hysteresis` late so deadlines within that window land in
    /// one batch.
    fn reschedule_eviction(&mut self) {
        let Some(cvr) = &self.cvr else {
            self.eviction_at_wall = None;
            return;
        };
        match ttl::next_eviction_deadline(cvr) {
            None => self.eviction_at_wall = None,
            Some(deadline) => {
                let now = self.clock.now_ms();
                let ttl_now = cvr.ttl_clock().projected(now);
                let fire_in = (deadline + self.config.ttl_timer_hysteresis_ms)
                    .saturating_sub(ttl_now);
                self.eviction_at_wall = Some(now + fire_in);
            }
        }
    }
}

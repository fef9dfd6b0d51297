mod common;

use serde_json::json;

use viewsync::cvr::{DesiredQueryPatch, QueryDef};
use viewsync::syncer::ConnectRequest;
use viewsync::{ClientGroupId, ClientId, ClientSchema, Error, ErrorKind, StateVersion, UpstreamChange};

fn group() -> ClientGroupId {
    ClientGroupId::new("g1")
}

/// A client reconnecting at an old cookie replays exactly what it missed
/// and lands on the same state as a client that never disconnected, and
/// replaying the same catch-up twice is idempotent.
#[tokio::test]
async fn reconnect_catches_up_to_live_state_idempotently() {
    let h = common::harness().await;
    let ast_a = json!({"table": "issue"});
    let ast_b = json!({"table": "comment"});
    h.rows.set(
        &ast_a,
        vec![
            common::source_row("issue", "a", "v1"),
            common::source_row("issue", "b", "v1"),
        ],
    );
    h.rows
        .set(&ast_b, vec![common::source_row("comment", "x", "v1")]);

    let handle = h.registry.get_or_create(&group()).await;
    let mut conn1 = common::connect(&handle, "c1", None).await.unwrap();
    let mut live = common::ClientView::new();
    common::apply_next_poke(&mut live, &mut conn1).await;
    let mut conn2 = common::connect(&handle, "c2", None).await.unwrap();
    let mut away = common::ClientView::new();
    common::apply_next_poke(&mut away, &mut conn2).await;
    common::apply_next_poke(&mut live, &mut conn1).await;

    let qa = QueryDef::ast(ast_a);
    handle
        .change_desired_queries(
            &ClientId::new("c1"),
            vec![DesiredQueryPatch::put(qa.clone(), 60_000)],
        )
        .await
        .unwrap();
    common::apply_next_poke(&mut live, &mut conn1).await;
    common::apply_next_poke(&mut away, &mut conn2).await;

    // c2 goes away at this cookie.
    let parked = away.clone();
    handle.disconnect(&ClientId::new("c2")).await;
    drop(conn2);

    // Life goes on: a second query and an upstream transaction.
    let qb = QueryDef::ast(ast_b);
    handle
        .change_desired_queries(
            &ClientId::new("c1"),
            vec![DesiredQueryPatch::put(qb.clone(), 60_000)],
        )
        .await
        .unwrap();
    common::apply_next_poke(&mut live, &mut conn1).await;

    let change = UpstreamChange::new(StateVersion::from_watermark(11)).with_row_diff(
        viewsync::collab::RowDiff {
            table: "issue".into(),
            key: "a".into(),
            row_version: "v2".into(),
            value: Some(json!({"id": "a", "v": "v2"})),
            refs: vec![],
        },
    );
    h.registry
        .apply_upstream_change(&group(), change)
        .await
        .unwrap();
    common::apply_next_poke(&mut live, &mut conn1).await;

    // First reconnect from the parked cookie.
    let mut replay_one = parked.clone();
    let mut conn2 = common::connect(&handle, "c2", parked.cookie.clone())
        .await
        .unwrap();
    common::apply_next_poke(&mut replay_one, &mut conn2).await;
    assert_eq!(replay_one.synced_state(), live.synced_state());
    assert_eq!(replay_one.rows["issue/\"a\""]["v"], json!("v2"));

    // Second replay from the very same cookie: identical outcome.
    handle.disconnect(&ClientId::new("c2")).await;
    drop(conn2);
    let mut replay_two = parked.clone();
    let mut conn2 = common::connect(&handle, "c2", parked.cookie.clone())
        .await
        .unwrap();
    common::apply_next_poke(&mut replay_two, &mut conn2).await;
    assert_eq!(replay_two.synced_state(), live.synced_state());
    assert_eq!(replay_one, replay_two);
}

/// Catch-up across an eviction replays the tombstones: the reconnecting
/// client deletes the evicted query and its rows.
#[tokio::test]
async fn catchup_replays_evictions() {
    let h = common::harness().await;
    let ast = json!({"table": "issue"});
    h.rows.set(&ast, vec![common::source_row("issue", "a", "v1")]);

    let handle = h.registry.get_or_create(&group()).await;
    let mut conn1 = common::connect(&handle, "c1", None).await.unwrap();
    let mut live = common::ClientView::new();
    common::apply_next_poke(&mut live, &mut conn1).await;
    let mut conn2 = common::connect(&handle, "c2", None).await.unwrap();
    let mut away = common::ClientView::new();
    common::apply_next_poke(&mut away, &mut conn2).await;
    common::apply_next_poke(&mut live, &mut conn1).await;

    let def = QueryDef::ast(ast);
    let hash = def.hash();
    handle
        .change_desired_queries(
            &ClientId::new("c1"),
            vec![
                DesiredQueryPatch::put(def, 100),
                DesiredQueryPatch::del(hash.clone()),
            ],
        )
        .await
        .unwrap();
    common::apply_next_poke(&mut live, &mut conn1).await;
    common::apply_next_poke(&mut away, &mut conn2).await;
    assert!(away.got.contains(hash.as_str()));

    let parked = away.clone();
    handle.disconnect(&ClientId::new("c2")).await;
    drop(conn2);

    h.clock.advance(250);
    common::apply_next_poke(&mut live, &mut conn1).await;
    assert!(!live.got.contains(hash.as_str()));

    let mut replay = parked.clone();
    let mut conn2 = common::connect(&handle, "c2", parked.cookie.clone())
        .await
        .unwrap();
    common::apply_next_poke(&mut replay, &mut conn2).await;
    assert_eq!(replay.synced_state(), live.synced_state());
    assert!(!replay.got.contains(hash.as_str()));
    assert!(replay.rows.is_empty());
}

// =============================================================================
// Fatal connection errors
// =============================================================================

#[tokio::test]
async fn base_cookie_ahead_of_cvr_is_fatal() {
    let h = common::harness().await;
    let handle = h.registry.get_or_create(&group()).await;
    let mut conn = common::connect(&handle, "c1", None).await.unwrap();
    let mut view = common::ClientView::new();
    common::apply_next_poke(&mut view, &mut conn).await;

    let err = common::connect(&handle, "c1", Some("zz".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBaseCookie { .. }));
    assert!(err.is_fatal());
    assert_eq!(err.kind(), ErrorKind::InvalidConnectionRequestBaseCookie);
}

#[tokio::test]
async fn malformed_cookie_is_fatal() {
    let h = common::harness().await;
    let handle = h.registry.get_or_create(&group()).await;
    let err = common::connect(&handle, "c1", Some("00:0".to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadCookie(_)));
    assert_eq!(err.kind(), ErrorKind::InvalidConnectionRequestBaseCookie);
}

#[tokio::test]
async fn unknown_client_reconnecting_with_cookie_is_rejected() {
    let h = common::harness().await;
    let handle = h.registry.get_or_create(&group()).await;
    let mut conn = common::connect(&handle, "c1", None).await.unwrap();
    let mut view = common::ClientView::new();
    common::apply_next_poke(&mut view, &mut conn).await;

    let err = common::connect(&handle, "ghost", view.cookie.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClientNotFound { .. }));
    assert_eq!(err.kind(), ErrorKind::ClientNotFound);
}

#[tokio::test]
async fn unsupported_schema_version_names_the_range() {
    let h = common::harness().await;
    let handle = h.registry.get_or_create(&group()).await;
    let err = handle
        .connect(ConnectRequest {
            client_id: ClientId::new("c1"),
            schema_version: 9,
            base_cookie: None,
            client_schema: None,
            auth: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SchemaVersionNotSupported { .. }));
    assert!(err.to_string().contains("[1, 1]"));
    assert_eq!(err.kind(), ErrorKind::SchemaVersionNotSupported);
}

#[tokio::test]
async fn client_schema_drift_is_fatal() {
    let h = common::harness().await;
    let handle = h.registry.get_or_create(&group()).await;
    let err = handle
        .connect(ConnectRequest {
            client_id: ClientId::new("c1"),
            schema_version: 1,
            base_cookie: None,
            client_schema: Some(ClientSchema::new().with_table("label", ["id"])),
            auth: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClientSchemaMismatch(_)));
    assert!(err.to_string().contains("label"));
}

#[tokio::test]
async fn replica_mismatch_requires_reset() {
    let h = common::harness().await;
    let handle = h.registry.get_or_create(&group()).await;
    let mut conn = common::connect(&handle, "c1", None).await.unwrap();
    let mut view = common::ClientView::new();
    common::apply_next_poke(&mut view, &mut conn).await;
    handle.disconnect(&ClientId::new("c1")).await;
    drop(conn);

    // A server bound to a newer replica cannot catch this CVR up.
    let mut config = common::default_config();
    config.replica_version = viewsync::ReplicaVersion::new("r2");
    let registry = common::build_registry(
        "task-b",
        h.store.clone(),
        h.rows.clone(),
        h.transformer.clone(),
        h.clock.clone(),
        config,
    );
    let handle = registry.get_or_create(&group()).await;
    let err = common::connect(&handle, "c1", view.cookie.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClientNotFound { .. }));
    assert!(err.to_string().contains("reset"));
}

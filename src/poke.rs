//! # Poke Protocol
//!
//! Wire types and assembly for the poke protocol: every CVR change reaches
//! clients as a `pokeStart` / `pokePart`* / `pokeEnd` sequence that moves
//! the client from `baseCookie` to `cookie` atomically.
//!
//! ```text
//! ["pokeStart", {pokeID, baseCookie, schemaVersions?, timestamp?}]
//! ["pokePart",  {pokeID, lastMutationIDChanges?, desiredQueriesPatches?,
//!                gotQueriesPatch?, rowsPatch?, mutationsPatch?}]
//! ["pokeEnd",   {pokeID, cookie, cancel?}]
//! ```
//!
//! Parts are independently mergeable; the receiver buffers them and applies
//! everything at `pokeEnd`. `cancel: true` tells the receiver to discard the
//! buffered parts (used when an in-flight poke must be aborted).
//!
//! Catch-up for a reconnecting client replays every persisted patch newer
//! than its cookie, in version order, as one synthetic poke, after which
//! the client rides normal live pokes.
//!
//! Ordering guarantee: per client, pokes are strictly cookie-ordered; a
//! poke's `baseCookie` always equals the previous poke's `cookie`.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::types::{ClientId, CvrVersion, QueryHash, SchemaVersions};

// =============================================================================
// Configuration
// =============================================================================

/// Maximum patch entries per `pokePart`. Large row diffs are chunked so a
/// slow client never has to buffer one giant frame.
pub const POKE_PART_MAX_PATCHES: usize = 512;

// =============================================================================
// Patches
// =============================================================================

/// A put/del entry in `desiredQueriesPatches` or `gotQueriesPatch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum QueryPatch {
    #[serde(rename = "put")]
    Put { hash: QueryHash },
    #[serde(rename = "del")]
    Del { hash: QueryHash },
}

impl QueryPatch {
    pub fn put(hash: QueryHash) -> Self {
        Self::Put { hash }
    }

    pub fn del(hash: QueryHash) -> Self {
        Self::Del { hash }
    }

    pub fn hash(&self) -> &QueryHash {
        match self {
            Self::Put { hash } | Self::Del { hash } => hash,
        }
    }
}

/// A put/del entry in `rowsPatch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum RowPatch {
    #[serde(rename = "put")]
    Put {
        #[serde(rename = "tableName")]
        table_name: String,
        value: Value,
    },
    #[serde(rename = "del")]
    Del {
        #[serde(rename = "tableName")]
        table_name: String,
        id: Value,
    },
}

impl RowPatch {
    pub fn table_name(&self) -> &str {
        match self {
            Self::Put { table_name, .. } | Self::Del { table_name, .. } => table_name,
        }
    }
}

// =============================================================================
// Wire Messages
// =============================================================================

/// Body of `pokeStart`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PokeStart {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    #[serde(rename = "baseCookie")]
    pub base_cookie: Option<String>,
    /// Present only when a `rowsPatch` follows in this poke.
    #[serde(rename = "schemaVersions", skip_serializing_if = "Option::is_none")]
    pub schema_versions: Option<SchemaVersions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

/// Body of `pokePart`. Every field is optional; any subset may appear and
/// parts merge by concatenation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PokePart {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    #[serde(
        rename = "lastMutationIDChanges",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_mutation_id_changes: Option<BTreeMap<ClientId, u64>>,
    #[serde(
        rename = "desiredQueriesPatches",
        skip_serializing_if = "Option::is_none"
    )]
    pub desired_queries_patches: Option<BTreeMap<ClientId, Vec<QueryPatch>>>,
    #[serde(rename = "gotQueriesPatch", skip_serializing_if = "Option::is_none")]
    pub got_queries_patch: Option<Vec<QueryPatch>>,
    #[serde(rename = "rowsPatch", skip_serializing_if = "Option::is_none")]
    pub rows_patch: Option<Vec<RowPatch>>,
    #[serde(rename = "mutationsPatch", skip_serializing_if = "Option::is_none")]
    pub mutations_patch: Option<Vec<Value>>,
}

/// Body of `pokeEnd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PokeEnd {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    pub cookie: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancel: bool,
}

fn is_false(b: &bool) -> bool {
    !b
}

/// One poke-protocol message, encoded on the wire as a `[tag, body]` tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum PokeMessage {
    Start(PokeStart),
    Part(PokePart),
    End(PokeEnd),
}

impl PokeMessage {
    pub fn poke_id(&self) -> &str {
        match self {
            Self::Start(b) => &b.poke_id,
            Self::Part(b) => &b.poke_id,
            Self::End(b) => &b.poke_id,
        }
    }
}

impl Serialize for PokeMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        match self {
            Self::Start(body) => {
                tuple.serialize_element("pokeStart")?;
                tuple.serialize_element(body)?;
            }
            Self::Part(body) => {
                tuple.serialize_element("pokePart")?;
                tuple.serialize_element(body)?;
            }
            Self::End(body) => {
                tuple.serialize_element("pokeEnd")?;
                tuple.serialize_element(body)?;
            }
        }
        tuple.end()
    }
}

impl<'de> Deserialize<'de> for PokeMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, body): (String, Value) = Deserialize::deserialize(deserializer)?;
        match tag.as_str() {
            "pokeStart" => serde_json::from_value(body)
                .map(Self::Start)
                .map_err(D::Error::custom),
            "pokePart" => serde_json::from_value(body)
                .map(Self::Part)
                .map_err(D::Error::custom),
            "pokeEnd" => serde_json::from_value(body)
                .map(Self::End)
                .map_err(D::Error::custom),
            other => Err(D::Error::custom(format!(
                "unknown poke message tag {:?}",
                other
            ))),
        }
    }
}

// =============================================================================
// Diffs
// =============================================================================

/// The accumulated payload of one poke: everything a flush changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PokeDiff {
    pub desired: BTreeMap<ClientId, Vec<QueryPatch>>,
    pub got: Vec<QueryPatch>,
    pub rows: Vec<RowPatch>,
    pub lmid_changes: BTreeMap<ClientId, u64>,
    pub mutations: Vec<Value>,
}

impl PokeDiff {
    pub fn is_empty(&self) -> bool {
        self.desired.is_empty()
            && self.got.is_empty()
            && self.rows.is_empty()
            && self.lmid_changes.is_empty()
            && self.mutations.is_empty()
    }

    /// Appends another diff produced within the same flush.
    pub fn merge(&mut self, other: PokeDiff) {
        for (client, patches) in other.desired {
            self.desired.entry(client).or_default().extend(patches);
        }
        self.got.extend(other.got);
        self.rows.extend(other.rows);
        self.lmid_changes.extend(other.lmid_changes);
        self.mutations.extend(other.mutations);
    }

    pub fn push_desired(&mut self, client: &ClientId, patch: QueryPatch) {
        self.desired.entry(client.clone()).or_default().push(patch);
    }
}

// =============================================================================
// Catch-Up Patches
// =============================================================================

/// One persisted patch replayed during catch-up, tagged with the version at
/// which it was written.
#[derive(Debug, Clone, PartialEq)]
pub enum CatchupPatch {
    Query {
        version: CvrVersion,
        patch: QueryPatch,
    },
    Desire {
        version: CvrVersion,
        client_id: ClientId,
        patch: QueryPatch,
    },
    Row {
        version: CvrVersion,
        patch: RowPatch,
    },
}

impl CatchupPatch {
    pub fn version(&self) -> &CvrVersion {
        match self {
            Self::Query { version, .. }
            | Self::Desire { version, .. }
            | Self::Row { version, .. } => version,
        }
    }

    fn kind_rank(&self) -> u8 {
        // Within one version: query state first, then desires, then rows, so
        // a client learns about a query before receiving its rows.
        match self {
            Self::Query { .. } => 0,
            Self::Desire { .. } => 1,
            Self::Row { .. } => 2,
        }
    }
}

/// Folds version-ordered catch-up patches into a single poke diff.
pub fn catchup_diff(mut patches: Vec<CatchupPatch>) -> PokeDiff {
    patches.sort_by(|a, b| {
        a.version()
            .cmp(b.version())
            .then_with(|| a.kind_rank().cmp(&b.kind_rank()))
    });
    let mut diff = PokeDiff::default();
    for patch in patches {
        match patch {
            CatchupPatch::Query { patch, .. } => diff.got.push(patch),
            CatchupPatch::Desire {
                client_id, patch, ..
            } => diff.push_desired(&client_id, patch),
            CatchupPatch::Row { patch, .. } => diff.rows.push(patch),
        }
    }
    diff
}

// =============================================================================
// Poke Assembly
// =============================================================================

/// Builds the full message sequence for one poke.
///
/// `schema_versions` is attached to `pokeStart` only when the diff carries
/// row patches. Row patches are chunked into parts of at most `max_patches`
/// entries; all other patch kinds ride in the first part.
pub fn build_poke(
    poke_id: &str,
    base_cookie: Option<&CvrVersion>,
    cookie: &CvrVersion,
    schema_versions: SchemaVersions,
    diff: &PokeDiff,
    max_patches: usize,
) -> Vec<PokeMessage> {
    let mut messages = Vec::new();

    messages.push(PokeMessage::Start(PokeStart {
        poke_id: poke_id.to_string(),
        base_cookie: base_cookie.map(CvrVersion::cookie),
        schema_versions: (!diff.rows.is_empty()).then_some(schema_versions),
        timestamp: None,
    }));

    let mut meta = PokePart {
        poke_id: poke_id.to_string(),
        ..PokePart::default()
    };
    if !diff.lmid_changes.is_empty() {
        meta.last_mutation_id_changes = Some(diff.lmid_changes.clone());
    }
    if !diff.desired.is_empty() {
        meta.desired_queries_patches = Some(diff.desired.clone());
    }
    if !diff.got.is_empty() {
        meta.got_queries_patch = Some(diff.got.clone());
    }
    if !diff.mutations.is_empty() {
        meta.mutations_patch = Some(diff.mutations.clone());
    }

    let has_meta = meta.last_mutation_id_changes.is_some()
        || meta.desired_queries_patches.is_some()
        || meta.got_queries_patch.is_some()
        || meta.mutations_patch.is_some();

    let mut row_chunks = diff.rows.chunks(max_patches.max(1));
    if has_meta {
        // First row chunk rides with the metadata part.
        if let Some(chunk) = row_chunks.next() {
            meta.rows_patch = Some(chunk.to_vec());
        }
        messages.push(PokeMessage::Part(meta));
    }
    for chunk in row_chunks {
        messages.push(PokeMessage::Part(PokePart {
            poke_id: poke_id.to_string(),
            rows_patch: Some(chunk.to_vec()),
            ..PokePart::default()
        }));
    }

    messages.push(PokeMessage::End(PokeEnd {
        poke_id: poke_id.to_string(),
        cookie: cookie.cookie(),
        cancel: false,
    }));

    messages
}

/// The `pokeEnd` that aborts an in-flight poke: the receiver discards every
/// part buffered since `pokeStart`.
pub fn cancel_poke(poke_id: &str, cookie: &CvrVersion) -> PokeMessage {
    PokeMessage::End(PokeEnd {
        poke_id: poke_id.to_string(),
        cookie: cookie.cookie(),
        cancel: true,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StateVersion;
    use serde_json::json;

    fn version(watermark: u64, minor: u64) -> CvrVersion {
        CvrVersion::new(StateVersion::from_watermark(watermark), minor)
    }

    #[test]
    fn test_poke_start_wire_shape() {
        let msg = PokeMessage::Start(PokeStart {
            poke_id: "05:2".to_string(),
            base_cookie: Some("05:1".to_string()),
            schema_versions: None,
            timestamp: None,
        });
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"["pokeStart",{"pokeID":"05:2","baseCookie":"05:1"}]"#
        );
    }

    #[test]
    fn test_poke_start_null_base_cookie() {
        let msg = PokeMessage::Start(PokeStart {
            poke_id: "00:1".to_string(),
            base_cookie: None,
            schema_versions: Some(SchemaVersions::new(1, 2)),
            timestamp: None,
        });
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"["pokeStart",{"pokeID":"00:1","baseCookie":null,"schemaVersions":{"minSupportedVersion":1,"maxSupportedVersion":2}}]"#
        );
    }

    #[test]
    fn test_poke_part_wire_shape() {
        let mut desired = BTreeMap::new();
        desired.insert(
            ClientId::new("c1"),
            vec![QueryPatch::put(QueryHash::new("q1"))],
        );
        let msg = PokeMessage::Part(PokePart {
            poke_id: "05".to_string(),
            desired_queries_patches: Some(desired),
            rows_patch: Some(vec![
                RowPatch::Put {
                    table_name: "issue".to_string(),
                    value: json!({"id": 1, "title": "hi"}),
                },
                RowPatch::Del {
                    table_name: "issue".to_string(),
                    id: json!({"id": 2}),
                },
            ]),
            ..PokePart::default()
        });
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"["pokePart",{"pokeID":"05","desiredQueriesPatches":{"c1":[{"op":"put","hash":"q1"}]},"rowsPatch":[{"op":"put","tableName":"issue","value":{"id":1,"title":"hi"}},{"op":"del","tableName":"issue","id":{"id":2}}]}]"#
        );
    }

    #[test]
    fn test_poke_end_omits_false_cancel() {
        let end = PokeMessage::End(PokeEnd {
            poke_id: "05".to_string(),
            cookie: "05".to_string(),
            cancel: false,
        });
        assert_eq!(
            serde_json::to_string(&end).unwrap(),
            r#"["pokeEnd",{"pokeID":"05","cookie":"05"}]"#
        );

        let cancel = cancel_poke("05", &version(5, 0));
        let encoded = serde_json::to_string(&cancel).unwrap();
        assert!(encoded.contains(r#""cancel":true"#));
    }

    #[test]
    fn test_poke_message_roundtrip() {
        let messages = vec![
            PokeMessage::Start(PokeStart {
                poke_id: "p".into(),
                base_cookie: Some("00".into()),
                schema_versions: Some(SchemaVersions::default()),
                timestamp: Some(123),
            }),
            PokeMessage::Part(PokePart {
                poke_id: "p".into(),
                last_mutation_id_changes: Some(BTreeMap::from([(ClientId::new("c1"), 7)])),
                got_queries_patch: Some(vec![QueryPatch::del(QueryHash::new("q"))]),
                ..PokePart::default()
            }),
            PokeMessage::End(PokeEnd {
                poke_id: "p".into(),
                cookie: "01".into(),
                cancel: true,
            }),
        ];
        for msg in messages {
            let encoded = serde_json::to_string(&msg).unwrap();
            let decoded: PokeMessage = serde_json::from_str(&encoded).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = serde_json::from_str::<PokeMessage>(r#"["pokeSurprise",{}]"#).unwrap_err();
        assert!(err.to_string().contains("pokeSurprise"));
    }

    #[test]
    fn test_build_poke_schema_versions_only_with_rows() {
        let mut diff = PokeDiff::default();
        diff.got.push(QueryPatch::put(QueryHash::new("q1")));

        let messages = build_poke(
            "p1",
            Some(&version(1, 0)),
            &version(1, 1),
            SchemaVersions::default(),
            &diff,
            POKE_PART_MAX_PATCHES,
        );
        let PokeMessage::Start(start) = &messages[0] else {
            panic!("expected pokeStart");
        };
        assert!(start.schema_versions.is_none());

        diff.rows.push(RowPatch::Put {
            table_name: "issue".into(),
            value: json!({"id": 1}),
        });
        let messages = build_poke(
            "p2",
            Some(&version(1, 0)),
            &version(1, 1),
            SchemaVersions::default(),
            &diff,
            POKE_PART_MAX_PATCHES,
        );
        let PokeMessage::Start(start) = &messages[0] else {
            panic!("expected pokeStart");
        };
        assert!(start.schema_versions.is_some());
    }

    #[test]
    fn test_build_poke_chunks_rows() {
        let mut diff = PokeDiff::default();
        for i in 0..5 {
            diff.rows.push(RowPatch::Put {
                table_name: "issue".into(),
                value: json!({ "id": i }),
            });
        }
        let messages = build_poke(
            "p",
            None,
            &version(2, 0),
            SchemaVersions::default(),
            &diff,
            2,
        );
        // start + 3 parts (2 + 2 + 1 rows) + end
        assert_eq!(messages.len(), 5);
        let row_counts: Vec<usize> = messages
            .iter()
            .filter_map(|m| match m {
                PokeMessage::Part(p) => Some(p.rows_patch.as_ref().map_or(0, Vec::len)),
                _ => None,
            })
            .collect();
        assert_eq!(row_counts, vec![2, 2, 1]);
    }

    #[test]
    fn test_build_empty_poke_is_start_end() {
        let messages = build_poke(
            "p",
            Some(&version(1, 1)),
            &version(1, 2),
            SchemaVersions::default(),
            &PokeDiff::default(),
            POKE_PART_MAX_PATCHES,
        );
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], PokeMessage::Start(_)));
        assert!(matches!(messages[1], PokeMessage::End(_)));
    }

    #[test]
    fn test_catchup_diff_orders_by_version_then_kind() {
        let q = QueryHash::new("q1");
        let patches = vec![
            CatchupPatch::Row {
                version: version(3, 0),
                patch: RowPatch::Del {
                    table_name: "issue".into(),
                    id: json!("k2"),
                },
            },
            CatchupPatch::Row {
                version: version(2, 1),
                patch: RowPatch::Put {
                    table_name: "issue".into(),
                    value: json!({"id": "k1"}),
                },
            },
            CatchupPatch::Query {
                version: version(2, 1),
                patch: QueryPatch::put(q.clone()),
            },
            CatchupPatch::Desire {
                version: version(2, 1),
                client_id: ClientId::new("c1"),
                patch: QueryPatch::put(q.clone()),
            },
        ];
        let diff = catchup_diff(patches);
        assert_eq!(diff.got, vec![QueryPatch::put(q.clone())]);
        assert_eq!(
            diff.desired.get(&ClientId::new("c1")),
            Some(&vec![QueryPatch::put(q)])
        );
        // Rows keep version order: the older put before the newer del.
        assert!(matches!(diff.rows[0], RowPatch::Put { .. }));
        assert!(matches!(diff.rows[1], RowPatch::Del { .. }));
    }

    #[test]
    fn test_diff_merge() {
        let c1 = ClientId::new("c1");
        let mut a = PokeDiff::default();
        a.push_desired(&c1, QueryPatch::put(QueryHash::new("q1")));
        let mut b = PokeDiff::default();
        b.push_desired(&c1, QueryPatch::del(QueryHash::new("q2")));
        b.got.push(QueryPatch::put(QueryHash::new("q1")));
        a.merge(b);
        assert_eq!(a.desired.get(&c1).unwrap().len(), 2);
        assert_eq!(a.got.len(), 1);
        assert!(!a.is_empty());
    }
}

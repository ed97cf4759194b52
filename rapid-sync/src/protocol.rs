//! JSON wire protocol.
//!
//! Every frame is a text WebSocket message holding one envelope, or a JSON
//! array of envelopes (a batch):
//! ```text
//! { "event": "sub", "id": "<correlation-id>", "data": { "sub_id": ..., "collection": ... } }
//!    ──┬──           ──────────┬─────────         ───────────────┬──────────────────
//!    kind         matches ack/err replies             kind-specific payload
//! ```
//!
//! Client requests are the [`ClientRequest`] sum type; server frames decode
//! into [`ServerMessage`]. Both directions live here so the reference server
//! speaks exactly the same dialect.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::document::{DocumentChange, DocumentSnapshot, JsonObject};
use crate::error::{RapidError, Result, WireError};
use crate::query::{validate_identifier, Query};

/// Frame kinds in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "sub")]
    Subscribe,
    #[serde(rename = "unsub")]
    Unsubscribe,
    #[serde(rename = "mut")]
    Mutate,
    #[serde(rename = "merge")]
    Merge,
    #[serde(rename = "del")]
    Delete,
    #[serde(rename = "fetch")]
    Fetch,
    #[serde(rename = "on-con")]
    OnConnectAction,
    #[serde(rename = "on-dis")]
    OnDisconnectAction,
    #[serde(rename = "on-dis-cancel")]
    CancelOnDisconnect,
    #[serde(rename = "con")]
    Connect,
    #[serde(rename = "auth")]
    Authorize,
    #[serde(rename = "deauth")]
    Deauthorize,
    #[serde(rename = "nop")]
    NoOperation,
    #[serde(rename = "ack")]
    Ack,
    #[serde(rename = "err")]
    Error,
    #[serde(rename = "val")]
    Value,
    #[serde(rename = "upd")]
    Update,
    #[serde(rename = "ca")]
    SubscriptionCancelled,
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: EventKind,
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: EventKind, id: impl Into<String>, data: Value) -> Self {
        Self {
            event,
            id: id.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a frame holding one envelope or a batch array.
    pub fn decode_frame(text: &str) -> Result<Vec<Envelope>> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| serde_json::from_value(item).map_err(RapidError::from))
                .collect(),
            single => Ok(vec![serde_json::from_value(single)?]),
        }
    }

    /// Encode several envelopes as one batch frame.
    pub fn encode_batch(envelopes: &[Envelope]) -> Result<String> {
        Ok(serde_json::to_string(envelopes)?)
    }
}

/// Which write a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    #[serde(rename = "mut")]
    Mutate,
    #[serde(rename = "merge")]
    Merge,
    #[serde(rename = "del")]
    Delete,
}

impl WriteKind {
    fn event(self) -> EventKind {
        match self {
            Self::Mutate => EventKind::Mutate,
            Self::Merge => EventKind::Merge,
            Self::Delete => EventKind::Delete,
        }
    }
}

/// Precondition on the document's current etag.
///
/// On the wire: field absent for `Any`, a string for `Match`, `null` for
/// `Absent` (the document must not exist).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EtagCondition {
    #[default]
    Any,
    Match(String),
    Absent,
}

impl EtagCondition {
    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// Whether a document with `current` etag satisfies the condition.
    pub fn allows(&self, current: Option<&str>) -> bool {
        match self {
            Self::Any => true,
            Self::Match(expected) => current == Some(expected.as_str()),
            Self::Absent => current.is_none(),
        }
    }
}

impl Serialize for EtagCondition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Match(etag) => serializer.serialize_str(etag),
            Self::Any | Self::Absent => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for EtagCondition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(match Option::<String>::deserialize(deserializer)? {
            Some(etag) => Self::Match(etag),
            None => Self::Absent,
        })
    }
}

/// A single-document write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOp {
    #[serde(skip, default = "default_write_kind")]
    pub kind: WriteKind,
    pub collection: String,
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "EtagCondition::is_any")]
    pub etag: EtagCondition,
}

fn default_write_kind() -> WriteKind {
    WriteKind::Mutate
}

impl WriteOp {
    pub fn mutate(collection: impl Into<String>, doc_id: impl Into<String>, value: JsonObject) -> Self {
        Self::new(WriteKind::Mutate, collection, doc_id, Some(value))
    }

    pub fn merge(collection: impl Into<String>, doc_id: impl Into<String>, partial: JsonObject) -> Self {
        Self::new(WriteKind::Merge, collection, doc_id, Some(partial))
    }

    pub fn delete(collection: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self::new(WriteKind::Delete, collection, doc_id, None)
    }

    fn new(
        kind: WriteKind,
        collection: impl Into<String>,
        doc_id: impl Into<String>,
        value: Option<JsonObject>,
    ) -> Self {
        Self {
            kind,
            collection: collection.into(),
            doc_id: doc_id.into(),
            value,
            etag: EtagCondition::Any,
        }
    }

    pub fn with_etag(mut self, etag: EtagCondition) -> Self {
        self.etag = etag;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.collection)?;
        validate_identifier(&self.doc_id)?;
        if self.kind != WriteKind::Delete && self.value.is_none() {
            return Err(RapidError::InvalidQuery(format!(
                "{:?} of {}/{} carries no value",
                self.kind, self.collection, self.doc_id
            )));
        }
        Ok(())
    }

    fn from_data(kind: WriteKind, data: &Value) -> Result<Self> {
        let mut op: WriteOp = serde_json::from_value(data.clone())?;
        op.kind = kind;
        Ok(op)
    }
}

/// Payload of action registrations: the write plus its kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActionPayload {
    action_id: String,
    write: WriteKind,
    #[serde(flatten)]
    op: WriteOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubscribePayload {
    sub_id: String,
    #[serde(flatten)]
    query: Query,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FetchPayload {
    #[serde(flatten)]
    query: Query,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    doc_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubIdPayload {
    sub_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentsPayload {
    sub_id: String,
    #[serde(default)]
    documents: Vec<DocumentChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CancelledPayload {
    sub_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// Outbound request, dispatched by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Connect { connection_id: String },
    Authorize { token: String },
    Deauthorize,
    Subscribe { subscription_id: String, query: Query },
    Unsubscribe { subscription_id: String },
    Write(WriteOp),
    Fetch { query: Query, doc_id: Option<String> },
    OnConnectAction { action_id: String, write: WriteOp },
    OnDisconnectAction { action_id: String, write: WriteOp },
    CancelOnDisconnect { action_id: String },
    NoOperation,
}

impl ClientRequest {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connect { .. } => EventKind::Connect,
            Self::Authorize { .. } => EventKind::Authorize,
            Self::Deauthorize => EventKind::Deauthorize,
            Self::Subscribe { .. } => EventKind::Subscribe,
            Self::Unsubscribe { .. } => EventKind::Unsubscribe,
            Self::Write(op) => op.kind.event(),
            Self::Fetch { .. } => EventKind::Fetch,
            Self::OnConnectAction { .. } => EventKind::OnConnectAction,
            Self::OnDisconnectAction { .. } => EventKind::OnDisconnectAction,
            Self::CancelOnDisconnect { .. } => EventKind::CancelOnDisconnect,
            Self::NoOperation => EventKind::NoOperation,
        }
    }

    /// Heartbeats are fire-and-forget; everything else expects ack or err.
    pub fn needs_acknowledgement(&self) -> bool {
        !matches!(self, Self::NoOperation)
    }

    /// Requests that time out even without a configured default and
    /// survive connection loss by being re-queued.
    pub fn always_timeout(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Authorize { .. } | Self::Deauthorize | Self::Fetch { .. }
        )
    }

    /// Requests that only make sense on the connection they were sent on.
    pub fn connection_scoped(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Authorize { .. } | Self::NoOperation)
    }

    pub fn to_envelope(&self, correlation_id: &str) -> Result<Envelope> {
        let data = match self {
            Self::Connect { connection_id } => serde_json::json!({ "con_id": connection_id }),
            Self::Authorize { token } => serde_json::json!({ "token": token }),
            Self::Deauthorize | Self::NoOperation => Value::Object(JsonObject::new()),
            Self::Subscribe { subscription_id, query } => serde_json::to_value(SubscribePayload {
                sub_id: subscription_id.clone(),
                query: query.clone(),
            })?,
            Self::Unsubscribe { subscription_id } => serde_json::to_value(SubIdPayload {
                sub_id: subscription_id.clone(),
            })?,
            Self::Write(op) => serde_json::to_value(op)?,
            Self::Fetch { query, doc_id } => serde_json::to_value(FetchPayload {
                query: query.clone(),
                doc_id: doc_id.clone(),
            })?,
            Self::OnConnectAction { action_id, write } | Self::OnDisconnectAction { action_id, write } => {
                serde_json::to_value(ActionPayload {
                    action_id: action_id.clone(),
                    write: write.kind,
                    op: write.clone(),
                })?
            }
            Self::CancelOnDisconnect { action_id } => serde_json::json!({ "action_id": action_id }),
        };
        Ok(Envelope::new(self.kind(), correlation_id, data))
    }

    pub fn encode(&self, correlation_id: &str) -> Result<String> {
        self.to_envelope(correlation_id)?.encode()
    }

    /// Decode a client envelope (server side).
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let data = &envelope.data;
        let field = |name: &str| -> Result<String> {
            data.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| RapidError::Codec(format!("missing '{name}' in {:?}", envelope.event)))
        };
        Ok(match envelope.event {
            EventKind::Connect => Self::Connect { connection_id: field("con_id")? },
            EventKind::Authorize => Self::Authorize { token: field("token")? },
            EventKind::Deauthorize => Self::Deauthorize,
            EventKind::NoOperation => Self::NoOperation,
            EventKind::Subscribe => {
                let payload: SubscribePayload = serde_json::from_value(data.clone())?;
                Self::Subscribe {
                    subscription_id: payload.sub_id,
                    query: payload.query,
                }
            }
            EventKind::Unsubscribe => Self::Unsubscribe { subscription_id: field("sub_id")? },
            EventKind::Mutate => Self::Write(WriteOp::from_data(WriteKind::Mutate, data)?),
            EventKind::Merge => Self::Write(WriteOp::from_data(WriteKind::Merge, data)?),
            EventKind::Delete => Self::Write(WriteOp::from_data(WriteKind::Delete, data)?),
            EventKind::Fetch => {
                let payload: FetchPayload = serde_json::from_value(data.clone())?;
                Self::Fetch {
                    query: payload.query,
                    doc_id: payload.doc_id,
                }
            }
            EventKind::OnConnectAction | EventKind::OnDisconnectAction => {
                let payload: ActionPayload = serde_json::from_value(data.clone())?;
                let mut write = payload.op;
                write.kind = payload.write;
                if envelope.event == EventKind::OnConnectAction {
                    Self::OnConnectAction { action_id: payload.action_id, write }
                } else {
                    Self::OnDisconnectAction { action_id: payload.action_id, write }
                }
            }
            EventKind::CancelOnDisconnect => Self::CancelOnDisconnect { action_id: field("action_id")? },
            other => return Err(RapidError::Codec(format!("{other:?} is not a client request"))),
        })
    }
}

/// Payload of a successful acknowledgement.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<DocumentChange>,
}

impl Ack {
    pub fn with_etag(etag: impl Into<String>) -> Self {
        Self {
            etag: Some(etag.into()),
            documents: Vec::new(),
        }
    }

    pub fn with_documents(documents: Vec<DocumentChange>) -> Self {
        Self { etag: None, documents }
    }

    /// Documents of a fetch reply as snapshots of `collection`.
    pub fn into_snapshots(self, collection: &str) -> Vec<DocumentSnapshot> {
        self.documents
            .into_iter()
            .filter_map(|change| change.into_snapshot(collection))
            .collect()
    }
}

/// Decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Ack { correlation_id: String, ack: Ack },
    Error { correlation_id: String, error: RapidError },
    /// Full result set of a subscription
    Value { subscription_id: String, documents: Vec<DocumentChange> },
    /// Incremental changes to a subscription
    Update { subscription_id: String, documents: Vec<DocumentChange> },
    SubscriptionCancelled { subscription_id: String, reason: Option<String> },
}

impl ServerMessage {
    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        Ok(match envelope.event {
            EventKind::Ack => Self::Ack {
                correlation_id: envelope.id,
                ack: if envelope.data.is_null() {
                    Ack::default()
                } else {
                    serde_json::from_value(envelope.data)?
                },
            },
            EventKind::Error => {
                let wire: WireError = serde_json::from_value(envelope.data)?;
                Self::Error {
                    correlation_id: envelope.id,
                    error: RapidError::from_wire(wire),
                }
            }
            EventKind::Value => {
                let payload: DocumentsPayload = serde_json::from_value(envelope.data)?;
                Self::Value {
                    subscription_id: payload.sub_id,
                    documents: payload.documents,
                }
            }
            EventKind::Update => {
                let payload: DocumentsPayload = serde_json::from_value(envelope.data)?;
                Self::Update {
                    subscription_id: payload.sub_id,
                    documents: payload.documents,
                }
            }
            EventKind::SubscriptionCancelled => {
                let payload: CancelledPayload = serde_json::from_value(envelope.data)?;
                Self::SubscriptionCancelled {
                    subscription_id: payload.sub_id,
                    reason: payload.reason,
                }
            }
            other => return Err(RapidError::Codec(format!("{other:?} is not a server message"))),
        })
    }

    pub fn to_envelope(&self) -> Result<Envelope> {
        Ok(match self {
            Self::Ack { correlation_id, ack } => {
                Envelope::new(EventKind::Ack, correlation_id.clone(), serde_json::to_value(ack)?)
            }
            Self::Error { correlation_id, error } => Envelope::new(
                EventKind::Error,
                correlation_id.clone(),
                serde_json::to_value(error.to_wire())?,
            ),
            Self::Value { subscription_id, documents } => Envelope::new(
                EventKind::Value,
                Uuid::new_v4().to_string(),
                serde_json::to_value(DocumentsPayload {
                    sub_id: subscription_id.clone(),
                    documents: documents.clone(),
                })?,
            ),
            Self::Update { subscription_id, documents } => Envelope::new(
                EventKind::Update,
                Uuid::new_v4().to_string(),
                serde_json::to_value(DocumentsPayload {
                    sub_id: subscription_id.clone(),
                    documents: documents.clone(),
                })?,
            ),
            Self::SubscriptionCancelled { subscription_id, reason } => Envelope::new(
                EventKind::SubscriptionCancelled,
                Uuid::new_v4().to_string(),
                serde_json::to_value(CancelledPayload {
                    sub_id: subscription_id.clone(),
                    reason: reason.clone(),
                })?,
            ),
        })
    }

    pub fn encode(&self) -> Result<String> {
        self.to_envelope()?.encode()
    }

    /// Decode a frame and merge result-set messages per subscription.
    ///
    /// Within one batch, updates for the same subscription are concatenated
    /// into the first message for it, and a later full value replaces
    /// whatever was collected before. Malformed envelopes are skipped.
    pub fn parse_frame(text: &str) -> Result<Vec<ServerMessage>> {
        let envelopes = Envelope::decode_frame(text)?;
        let mut merged: Vec<ServerMessage> = Vec::with_capacity(envelopes.len());
        let mut slot_by_subscription: HashMap<String, usize> = HashMap::new();

        for envelope in envelopes {
            let message = match ServerMessage::from_envelope(envelope) {
                Ok(message) => message,
                Err(e) => {
                    log::warn!("Skipping malformed server envelope: {e}");
                    continue;
                }
            };
            match message {
                ServerMessage::Value { subscription_id, documents } => {
                    let replacement = ServerMessage::Value {
                        subscription_id: subscription_id.clone(),
                        documents,
                    };
                    match slot_by_subscription.get(&subscription_id) {
                        Some(&slot) => merged[slot] = replacement,
                        None => {
                            slot_by_subscription.insert(subscription_id, merged.len());
                            merged.push(replacement);
                        }
                    }
                }
                ServerMessage::Update { subscription_id, documents } => {
                    match slot_by_subscription.get(&subscription_id) {
                        Some(&slot) => match &mut merged[slot] {
                            ServerMessage::Value { documents: existing, .. }
                            | ServerMessage::Update { documents: existing, .. } => {
                                existing.extend(documents)
                            }
                            _ => {}
                        },
                        None => {
                            slot_by_subscription.insert(subscription_id.clone(), merged.len());
                            merged.push(ServerMessage::Update { subscription_id, documents });
                        }
                    }
                }
                other => merged.push(other),
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::object;
    use crate::query::Filter;
    use serde_json::json;

    #[test]
    fn test_subscribe_envelope_shape() {
        let request = ClientRequest::Subscribe {
            subscription_id: "s1".into(),
            query: Query::new("tasks").filter(Filter::equal("done", false)).limit(3),
        };
        let text = request.encode("c1").unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "sub");
        assert_eq!(value["id"], "c1");
        assert_eq!(value["data"]["sub_id"], "s1");
        assert_eq!(value["data"]["collection"], "tasks");
        assert_eq!(value["data"]["limit"], 3);
    }

    #[test]
    fn test_etag_condition_wire_forms() {
        let any = WriteOp::mutate("tasks", "a", object(json!({"n": 1})));
        let value = serde_json::to_value(&any).unwrap();
        assert!(value.get("etag").is_none());

        let matching = any.clone().with_etag(EtagCondition::Match("e1".into()));
        assert_eq!(serde_json::to_value(&matching).unwrap()["etag"], "e1");

        let absent = any.clone().with_etag(EtagCondition::Absent);
        let value = serde_json::to_value(&absent).unwrap();
        assert!(value.get("etag").is_some_and(Value::is_null));
    }

    #[test]
    fn test_write_decodes_etag_conditions() {
        let decode = |data: Value| {
            let envelope = Envelope::new(EventKind::Merge, "c", data);
            match ClientRequest::from_envelope(&envelope).unwrap() {
                ClientRequest::Write(op) => op,
                other => panic!("expected write, got {other:?}"),
            }
        };
        let op = decode(json!({"collection": "t", "doc_id": "a", "value": {}}));
        assert_eq!(op.kind, WriteKind::Merge);
        assert_eq!(op.etag, EtagCondition::Any);
        let op = decode(json!({"collection": "t", "doc_id": "a", "value": {}, "etag": null}));
        assert_eq!(op.etag, EtagCondition::Absent);
        let op = decode(json!({"collection": "t", "doc_id": "a", "value": {}, "etag": "x"}));
        assert_eq!(op.etag, EtagCondition::Match("x".into()));
    }

    #[test]
    fn test_action_request_keeps_write_kind() {
        let request = ClientRequest::OnDisconnectAction {
            action_id: "a1".into(),
            write: WriteOp::delete("presence", "ana"),
        };
        let envelope = request.to_envelope("c9").unwrap();
        assert_eq!(envelope.data["write"], "del");
        let decoded = ClientRequest::from_envelope(&envelope).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_request_flags() {
        assert!(!ClientRequest::NoOperation.needs_acknowledgement());
        assert!(ClientRequest::Deauthorize.needs_acknowledgement());
        let fetch = ClientRequest::Fetch { query: Query::new("t"), doc_id: None };
        assert!(fetch.always_timeout());
        assert!(!fetch.connection_scoped());
        assert!(!ClientRequest::Write(WriteOp::delete("t", "a")).always_timeout());
        assert!(ClientRequest::Connect { connection_id: "x".into() }.connection_scoped());
    }

    #[test]
    fn test_write_validation() {
        assert!(WriteOp::delete("tasks", "a").validate().is_ok());
        let mut op = WriteOp::mutate("tasks", "a", JsonObject::new());
        op.value = None;
        assert!(op.validate().is_err());
        assert!(WriteOp::delete("tasks", "a/b").validate().is_err());
    }

    #[test]
    fn test_parse_error_frame() {
        let text = r#"{"event":"err","id":"c1","data":{"kind":"permission-denied","message":"rules"}}"#;
        let messages = ServerMessage::parse_frame(text).unwrap();
        assert_eq!(
            messages,
            vec![ServerMessage::Error {
                correlation_id: "c1".into(),
                error: RapidError::PermissionDenied("rules".into()),
            }]
        );
    }

    #[test]
    fn test_parse_ack_without_data() {
        let messages = ServerMessage::parse_frame(r#"{"event":"ack","id":"c2"}"#).unwrap();
        assert_eq!(
            messages,
            vec![ServerMessage::Ack { correlation_id: "c2".into(), ack: Ack::default() }]
        );
    }

    #[test]
    fn test_batch_merges_updates_per_subscription() {
        let text = json!([
            {"event": "upd", "id": "e1", "data": {"sub_id": "s1", "documents": [{"id": "a", "value": {"n": 1}}]}},
            {"event": "ack", "id": "c1", "data": {}},
            {"event": "upd", "id": "e2", "data": {"sub_id": "s1", "documents": [{"id": "b"}]}},
            {"event": "upd", "id": "e3", "data": {"sub_id": "s2", "documents": []}}
        ])
        .to_string();
        let messages = ServerMessage::parse_frame(&text).unwrap();
        assert_eq!(messages.len(), 3);
        match &messages[0] {
            ServerMessage::Update { subscription_id, documents } => {
                assert_eq!(subscription_id, "s1");
                assert_eq!(documents.len(), 2);
                assert!(documents[1].is_removal());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_batch_value_overrides_earlier_updates() {
        let text = json!([
            {"event": "upd", "id": "e1", "data": {"sub_id": "s1", "documents": [{"id": "a", "value": {}}]}},
            {"event": "val", "id": "e2", "data": {"sub_id": "s1", "documents": [{"id": "z", "value": {}}]}},
            {"event": "upd", "id": "e3", "data": {"sub_id": "s1", "documents": [{"id": "y", "value": {}}]}}
        ])
        .to_string();
        let messages = ServerMessage::parse_frame(&text).unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::Value { documents, .. } => {
                let ids: Vec<&str> = documents.iter().map(|d| d.id.as_str()).collect();
                assert_eq!(ids, vec!["z", "y"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_envelope_in_batch_is_skipped() {
        let text = json!([
            {"event": "val", "id": "e1", "data": {"documents": []}},
            {"event": "ack", "id": "c1"}
        ])
        .to_string();
        let messages = ServerMessage::parse_frame(&text).unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn test_garbage_frame_is_codec_error() {
        assert!(matches!(ServerMessage::parse_frame("not json"), Err(RapidError::Codec(_))));
    }

    #[test]
    fn test_server_message_encode_decode() {
        let message = ServerMessage::SubscriptionCancelled {
            subscription_id: "s1".into(),
            reason: Some("revoked".into()),
        };
        let text = message.encode().unwrap();
        assert_eq!(ServerMessage::parse_frame(&text).unwrap(), vec![message]);
    }
}

//! Document values as seen by subscriptions, fetches and executions.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON object holding a document's value.
pub type JsonObject = serde_json::Map<String, Value>;

/// Key path resolving to the document id.
pub const ID_KEY: &str = "$id";
/// Key path resolving to the creation timestamp, when the server provides one.
pub const CREATED_KEY: &str = "$created";
/// Key path resolving to the modification timestamp, when the server provides one.
pub const MODIFIED_KEY: &str = "$modified";

/// Immutable snapshot of a document.
///
/// A newer snapshot with the same id replaces the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub collection: String,
    pub id: String,
    pub value: JsonObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl DocumentSnapshot {
    pub fn new(collection: impl Into<String>, id: impl Into<String>, value: JsonObject) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            value,
            etag: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    /// Resolve a dotted key path (`address.city`) or a special key.
    ///
    /// `$created` and `$modified` resolve to fields of the same name stored
    /// in the value, if the server filled them in.
    pub fn field(&self, key_path: &str) -> Option<Cow<'_, Value>> {
        if key_path == ID_KEY {
            return Some(Cow::Owned(Value::String(self.id.clone())));
        }
        if key_path == CREATED_KEY || key_path == MODIFIED_KEY {
            return self.value.get(key_path).map(Cow::Borrowed);
        }
        let mut segments = key_path.split('.');
        let first = segments.next()?;
        let mut current = self.value.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(Cow::Borrowed(current))
    }
}

/// A document as it travels inside `val`, `upd` and `fetch` payloads.
///
/// A change without a `value` marks the document as removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

impl DocumentChange {
    pub fn upsert(id: impl Into<String>, value: JsonObject, etag: Option<String>) -> Self {
        Self {
            id: id.into(),
            value: Some(value),
            etag,
        }
    }

    pub fn removal(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: None,
            etag: None,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.value.is_none()
    }

    /// Turn into a snapshot of `collection`; removals yield `None`.
    pub fn into_snapshot(self, collection: &str) -> Option<DocumentSnapshot> {
        let value = self.value?;
        Some(DocumentSnapshot {
            collection: collection.to_string(),
            id: self.id,
            value,
            etag: self.etag,
        })
    }
}

impl From<&DocumentSnapshot> for DocumentChange {
    fn from(snapshot: &DocumentSnapshot) -> Self {
        Self::upsert(snapshot.id.clone(), snapshot.value.clone(), snapshot.etag.clone())
    }
}

/// Build a [`JsonObject`] from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty object.
pub fn object(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}

/// Merge `partial` into `target`.
///
/// Nested objects merge recursively, `null` removes the key and any other
/// value replaces what was there.
pub fn merge_into(target: &mut JsonObject, partial: JsonObject) {
    for (key, value) in partial {
        match value {
            Value::Null => {
                target.remove(&key);
            }
            Value::Object(inner) => match target.get_mut(&key) {
                Some(Value::Object(existing)) => merge_into(existing, inner),
                _ => {
                    let mut fresh = JsonObject::new();
                    merge_into(&mut fresh, inner);
                    target.insert(key, Value::Object(fresh));
                }
            },
            other => {
                target.insert(key, other);
            }
        }
    }
}

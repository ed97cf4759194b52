//! Collection and document references.
//!
//! ```text
//! client.collection("tasks")            CollectionRef (query builder)
//!       .filter(..).order(..).limit(..)
//!       .subscribe() / .fetch()
//!       .document("42")                 DocumentRef
//!           .merge(..) / .execute_optimistic(..) / .on_disconnect(..)
//! ```

use std::future::Future;

use uuid::Uuid;

use crate::client::{ActionHandle, RapidClient, RequestFuture, SubscriptionHandle};
use crate::document::{DocumentSnapshot, JsonObject, ID_KEY};
use crate::error::Result;
use crate::mutation::ExecutionResult;
use crate::protocol::{WriteKind, WriteOp};
use crate::query::{Direction, Filter, Query};

/// A collection plus the query built on it so far.
#[derive(Clone)]
pub struct CollectionRef {
    client: RapidClient,
    query: Query,
}

impl CollectionRef {
    pub(crate) fn new(client: RapidClient, name: impl Into<String>) -> Self {
        Self {
            client,
            query: Query::new(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.query.collection
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Narrow the result; repeated calls are combined with AND.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.query = self.query.filter(filter);
        self
    }

    pub fn order(mut self, key_path: impl Into<String>, direction: Direction) -> Self {
        self.query = self.query.order_by(key_path, direction);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query = self.query.limit(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.query = self.query.skip(skip);
        self
    }

    pub fn subscribe(&self) -> Result<SubscriptionHandle> {
        self.client.subscribe(self.query.clone())
    }

    pub fn fetch(&self) -> impl Future<Output = Result<Vec<DocumentSnapshot>>> + Send + 'static {
        self.client.fetch(self.query.clone())
    }

    pub fn document(&self, id: impl Into<String>) -> DocumentRef {
        DocumentRef {
            client: self.client.clone(),
            collection: self.query.collection.clone(),
            id: id.into(),
        }
    }

    /// Reference to a document with a fresh random id.
    pub fn new_document(&self) -> DocumentRef {
        self.document(Uuid::new_v4().to_string())
    }
}

/// A single document.
#[derive(Clone)]
pub struct DocumentRef {
    client: RapidClient,
    collection: String,
    id: String,
}

impl DocumentRef {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Replace the whole value.
    pub fn mutate(&self, value: JsonObject) -> RequestFuture {
        self.client.write(WriteOp::mutate(&self.collection, &self.id, value))
    }

    /// Merge `partial` into the stored value; `null` fields are removed.
    pub fn merge(&self, partial: JsonObject) -> RequestFuture {
        self.client.write(WriteOp::merge(&self.collection, &self.id, partial))
    }

    pub fn delete(&self) -> RequestFuture {
        self.client.write(WriteOp::delete(&self.collection, &self.id))
    }

    pub fn fetch(&self) -> impl Future<Output = Result<Option<DocumentSnapshot>>> + Send + 'static {
        self.client.fetch_document(&self.collection, &self.id)
    }

    pub fn execute_optimistic<F>(&self, transform: F) -> RequestFuture
    where
        F: FnMut(Option<&DocumentSnapshot>) -> ExecutionResult + Send + 'static,
    {
        self.client
            .execute_optimistic(&self.collection, &self.id, transform)
    }

    /// Live view of this one document.
    pub fn subscribe(&self) -> Result<SubscriptionHandle> {
        self.client
            .subscribe(Query::new(self.collection.clone()).filter(Filter::equal(ID_KEY, self.id.clone())))
    }

    /// Write to apply every time the connection comes up.
    pub fn on_connect(&self, kind: WriteKind, value: Option<JsonObject>, persistent: bool) -> Result<ActionHandle> {
        self.client.register_on_connect(self.write_op(kind, value), persistent)
    }

    /// Write for the server to apply when this connection goes away.
    pub fn on_disconnect(&self, kind: WriteKind, value: Option<JsonObject>) -> Result<ActionHandle> {
        self.client.register_on_disconnect(self.write_op(kind, value))
    }

    fn write_op(&self, kind: WriteKind, value: Option<JsonObject>) -> WriteOp {
        match (kind, value) {
            (WriteKind::Delete, _) => WriteOp::delete(&self.collection, &self.id),
            (WriteKind::Merge, value) => WriteOp::merge(&self.collection, &self.id, value.unwrap_or_default()),
            (WriteKind::Mutate, value) => WriteOp::mutate(&self.collection, &self.id, value.unwrap_or_default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::document::object;
    use crate::transport::ChannelConnector;
    use serde_json::json;
    use std::sync::Arc;

    fn client() -> RapidClient {
        let (connector, _accepted) = ChannelConnector::new();
        RapidClient::new(ClientConfig::default(), Arc::new(connector))
    }

    #[test]
    fn test_collection_builder_accumulates_query() {
        let tasks = client()
            .collection("tasks")
            .filter(Filter::equal("done", false))
            .filter(Filter::equal("owner", "ana"))
            .order("createdAt", Direction::Desc)
            .limit(10)
            .skip(5);
        let query = tasks.query();
        assert_eq!(tasks.name(), "tasks");
        assert!(matches!(query.filter, Some(Filter::And(_))));
        assert_eq!(query.order.len(), 1);
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.skip, Some(5));
    }

    #[test]
    fn test_document_refs() {
        let tasks = client().collection("tasks");
        let doc = tasks.document("42");
        assert_eq!(doc.id(), "42");
        assert_eq!(doc.collection(), "tasks");
        assert_ne!(tasks.new_document().id(), tasks.new_document().id());
    }

    #[test]
    fn test_write_op_kinds() {
        let doc = client().collection("presence").document("ana");
        let merge = doc.write_op(WriteKind::Merge, Some(object(json!({"online": false}))));
        assert_eq!(merge.kind, WriteKind::Merge);
        let delete = doc.write_op(WriteKind::Delete, Some(object(json!({"ignored": 1}))));
        assert!(delete.value.is_none());
    }

    #[tokio::test]
    async fn test_invalid_query_rejected_locally() {
        let err = client().collection("tasks").limit(0).subscribe().unwrap_err();
        assert!(matches!(err, crate::error::RapidError::InvalidQuery(_)));
    }
}

//! End-to-end tests against the reference server over real WebSockets.
//!
//! Each test starts a server on a free port and drives one or more clients
//! through the full pipeline: handshake, subscriptions, writes, optimistic
//! executions and connection-scoped actions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rapid_sync::{
    object, ClientConfig, Diff, Direction, DocumentSnapshot, ExecutionResult, Filter, Query,
    RapidClient, RapidError, ServerConfig, SubscriptionEvent, SubscriptionHandle, SyncServer,
    WriteKind,
};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Duration};

const WAIT: Duration = Duration::from_secs(3);

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port; returns it with its URL.
async fn start_test_server(config: ServerConfig) -> (SyncServer, String) {
    let port = free_port().await;
    let server = SyncServer::new(config.with_bind_addr(format!("127.0.0.1:{port}")));
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    sleep(Duration::from_millis(50)).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

async fn connected_client(url: &str, config: ClientConfig) -> RapidClient {
    let client = RapidClient::websocket(config);
    timeout(WAIT, client.connect(url)).await.unwrap().unwrap();
    client
}

async fn next_diff(handle: &mut SubscriptionHandle) -> Arc<Diff> {
    match timeout(WAIT, handle.next()).await {
        Ok(Some(SubscriptionEvent::Changed(diff))) => diff,
        other => panic!("expected a diff, got {other:?}"),
    }
}

fn ids(docs: &[DocumentSnapshot]) -> Vec<&str> {
    docs.iter().map(|d| d.id.as_str()).collect()
}

/// Poll the server until the stored document satisfies `check`.
async fn wait_for_document<F>(server: &SyncServer, collection: &str, id: &str, check: F) -> Option<DocumentSnapshot>
where
    F: Fn(Option<&DocumentSnapshot>) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let doc = server.document(collection, id).await;
        if check(doc.as_ref()) {
            return doc;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{collection}/{id} never reached the expected state, last seen {doc:?}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");

    let _client = connected_client(&url, ClientConfig::default()).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(server.stats().await.total_connections, 2);
}

#[tokio::test]
async fn test_tasks_subscription_sees_changes_from_another_client() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    server.seed("tasks", "A", object(json!({"createdAt": 1, "done": false}))).await.unwrap();
    server.seed("tasks", "B", object(json!({"createdAt": 2, "done": false}))).await.unwrap();
    server.seed("tasks", "C", object(json!({"createdAt": 3, "done": true}))).await.unwrap();

    let reader = connected_client(&url, ClientConfig::default()).await;
    let mut handle = reader
        .collection("tasks")
        .filter(Filter::equal("done", false))
        .order("createdAt", Direction::Desc)
        .subscribe()
        .unwrap();
    let initial = next_diff(&mut handle).await;
    assert_eq!(ids(&initial.documents), vec!["B", "A"]);
    assert_eq!(ids(&initial.added), vec!["B", "A"]);

    let writer = connected_client(&url, ClientConfig::default()).await;
    let tasks = writer.collection("tasks");
    timeout(WAIT, tasks.document("B").merge(object(json!({"done": true}))))
        .await
        .unwrap()
        .unwrap();
    timeout(WAIT, tasks.document("D").mutate(object(json!({"createdAt": 4, "done": false}))))
        .await
        .unwrap()
        .unwrap();

    let mut added = Vec::new();
    let mut removed = Vec::new();
    loop {
        let diff = next_diff(&mut handle).await;
        added.extend(diff.added.iter().map(|d| d.id.clone()));
        removed.extend(diff.removed.iter().map(|d| d.id.clone()));
        if ids(&diff.documents) == vec!["D", "A"] {
            break;
        }
    }
    assert_eq!(added, vec!["D"]);
    assert_eq!(removed, vec!["B"]);
}

#[tokio::test]
async fn test_identical_queries_share_one_server_subscription() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    server.seed("tasks", "A", object(json!({"done": false}))).await.unwrap();

    let client = connected_client(&url, ClientConfig::default()).await;
    let query = Query::new("tasks").filter(Filter::equal("done", false));
    let mut first = client.subscribe(query.clone()).unwrap();
    let mut second = client.subscribe(query).unwrap();

    assert_eq!(ids(&next_diff(&mut first).await.documents), vec!["A"]);
    assert_eq!(ids(&next_diff(&mut second).await.documents), vec!["A"]);
    assert_eq!(server.stats().await.subscribe_requests, 1);

    // One handle going away keeps the subscription alive for the other
    first.unsubscribe();
    server.seed("tasks", "B", object(json!({"done": false}))).await.unwrap();
    let diff = next_diff(&mut second).await;
    assert_eq!(ids(&diff.added), vec!["B"]);
}

#[tokio::test]
async fn test_equivalent_filters_share_one_server_subscription() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    server.seed("tasks", "A", object(json!({"done": false, "priority": 5, "owner": "ana"}))).await.unwrap();
    server.seed("tasks", "B", object(json!({"done": false, "priority": 1, "owner": "bo"}))).await.unwrap();

    let client = connected_client(&url, ClientConfig::default()).await;
    let owners = |first: &str, second: &str| {
        Filter::or(vec![Filter::equal("owner", first), Filter::equal("owner", second)])
    };
    let chained = Query::new("tasks")
        .filter(Filter::equal("done", false))
        .filter(Filter::equal("priority", 5))
        .filter(owners("ana", "bo"));
    let nested = Query::new("tasks").filter(Filter::and(vec![
        Filter::or(vec![Filter::equal("owner", "bo"), Filter::or(vec![Filter::equal("owner", "ana")])]),
        Filter::and(vec![Filter::equal("priority", 5.0), Filter::equal("done", false)]),
    ]));
    let appended = Query::new("tasks")
        .filter(owners("bo", "ana"))
        .filter(Filter::and(vec![Filter::equal("done", false), Filter::equal("priority", 5)]));

    let mut handles = vec![
        client.subscribe(chained).unwrap(),
        client.subscribe(nested).unwrap(),
        client.subscribe(appended).unwrap(),
    ];
    for handle in &mut handles {
        assert_eq!(ids(&next_diff(handle).await.documents), vec!["A"]);
    }
    assert_eq!(server.stats().await.subscribe_requests, 1);
}

#[tokio::test]
async fn test_optimistic_execution_survives_conflicts() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    server.seed("counters", "hits", object(json!({"n": 0}))).await.unwrap();
    server.inject_conflicts(3);

    let client = connected_client(&url, ClientConfig::default()).await;
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = runs.clone();
    let result = client
        .collection("counters")
        .document("hits")
        .execute_optimistic(move |current| {
            counted.fetch_add(1, Ordering::SeqCst);
            let n = current
                .and_then(|doc| doc.value.get("n"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            ExecutionResult::Write(object(json!({"n": n + 1})))
        });
    timeout(WAIT, result).await.unwrap().unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 4);
    let doc = server.document("counters", "hits").await.unwrap();
    assert_eq!(doc.value.get("n"), Some(&json!(1)));
    assert_eq!(server.stats().await.conflicts, 3);
}

#[tokio::test]
async fn test_optimistic_execution_gives_up_after_max_retries() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    server.inject_conflicts(5);

    let client = connected_client(&url, ClientConfig::default().with_optimistic_max_retries(2)).await;
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = runs.clone();
    let result = client.execute_optimistic("counters", "hits", move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        ExecutionResult::Write(object(json!({"n": 1})))
    });
    let err = timeout(WAIT, result).await.unwrap().unwrap_err();

    assert_eq!(err, RapidError::Conflict);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert!(server.document("counters", "hits").await.is_none());
}

#[tokio::test]
async fn test_aborted_execution_writes_nothing() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let client = connected_client(&url, ClientConfig::default()).await;
    let result = client.execute_optimistic("counters", "hits", |_| ExecutionResult::Abort);
    assert_eq!(timeout(WAIT, result).await.unwrap(), Err(RapidError::Aborted));
    assert_eq!(server.stats().await.write_requests, 0);
}

#[tokio::test]
async fn test_concurrent_merges_keep_both_fields() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    server.seed("docs", "42", object(json!({"title": "draft"}))).await.unwrap();

    let ana = connected_client(&url, ClientConfig::default()).await;
    let bo = connected_client(&url, ClientConfig::default()).await;
    let (left, right) = tokio::join!(
        ana.merge("docs", "42", object(json!({"reviewer": "ana"}))),
        bo.merge("docs", "42", object(json!({"status": "approved"}))),
    );
    left.unwrap();
    right.unwrap();

    let doc = server.document("docs", "42").await.unwrap();
    assert_eq!(
        Value::Object(doc.value),
        json!({"title": "draft", "reviewer": "ana", "status": "approved"})
    );
}

#[tokio::test]
async fn test_writes_require_authorization() {
    let (server, url) = start_test_server(ServerConfig::default().with_required_token("secret")).await;
    let client = connected_client(&url, ClientConfig::default()).await;

    let denied = timeout(WAIT, client.mutate("tasks", "a", object(json!({"n": 1})))).await.unwrap();
    assert!(matches!(denied, Err(RapidError::PermissionDenied(_))));

    let wrong = timeout(WAIT, client.authorize("guess")).await.unwrap();
    assert!(matches!(wrong, Err(RapidError::PermissionDenied(_))));

    timeout(WAIT, client.authorize("secret")).await.unwrap().unwrap();
    let ack = timeout(WAIT, client.mutate("tasks", "a", object(json!({"n": 1})))).await.unwrap().unwrap();
    assert!(ack.etag.is_some());
    assert!(server.document("tasks", "a").await.is_some());
}

#[tokio::test]
async fn test_subscription_denied_without_token() {
    let (_server, url) = start_test_server(ServerConfig::default().with_required_token("secret")).await;
    let client = connected_client(&url, ClientConfig::default()).await;
    let mut handle = client.subscribe(Query::new("tasks")).unwrap();
    match timeout(WAIT, handle.next()).await.unwrap() {
        Some(SubscriptionEvent::Failed(RapidError::PermissionDenied(_))) => {}
        other => panic!("expected permission denied, got {other:?}"),
    }
}

#[tokio::test]
async fn test_token_is_replayed_in_handshake() {
    let (server, url) = start_test_server(ServerConfig::default().with_required_token("secret")).await;
    let client = RapidClient::websocket(ClientConfig::default());
    timeout(WAIT, client.connect_with_token(&url, "secret")).await.unwrap().unwrap();
    timeout(WAIT, client.mutate("tasks", "a", object(json!({}))))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(server.stats().await.write_requests, 1);
}

#[tokio::test]
async fn test_on_disconnect_write_applied_when_client_leaves() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    server.seed("presence", "ana", object(json!({"online": true}))).await.unwrap();

    let client = connected_client(&url, ClientConfig::default()).await;
    let presence = client.collection("presence").document("ana");
    let _last_will = presence
        .on_disconnect(WriteKind::Merge, Some(object(json!({"online": false}))))
        .unwrap();
    // Let the registration reach the server before going away
    timeout(WAIT, presence.fetch()).await.unwrap().unwrap();
    client.disconnect();

    wait_for_document(&server, "presence", "ana", |doc| {
        doc.and_then(|d| d.value.get("online")) == Some(&json!(false))
    })
    .await;
    assert_eq!(server.stats().await.last_wills_applied, 1);
}

#[tokio::test]
async fn test_cancelled_on_disconnect_write_is_not_applied() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let client = connected_client(&url, ClientConfig::default()).await;
    let presence = client.collection("presence").document("ana");
    let action = presence.on_disconnect(WriteKind::Delete, None).unwrap();
    assert!(action.cancel());
    timeout(WAIT, presence.mutate(object(json!({"online": true}))))
        .await
        .unwrap()
        .unwrap();
    client.disconnect();

    sleep(Duration::from_millis(100)).await;
    assert!(server.document("presence", "ana").await.is_some());
    assert_eq!(server.stats().await.last_wills_applied, 0);
}

#[tokio::test]
async fn test_on_connect_write_replayed_on_connect() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    let client = RapidClient::websocket(ClientConfig::default());
    let mut action = client
        .collection("presence")
        .document("ana")
        .on_connect(WriteKind::Merge, Some(object(json!({"online": true}))), true)
        .unwrap();

    timeout(WAIT, client.connect(&url)).await.unwrap().unwrap();
    assert_eq!(
        timeout(WAIT, action.next()).await.unwrap(),
        Some(rapid_sync::ActionEvent::Executed)
    );
    let doc = server.document("presence", "ana").await.unwrap();
    assert_eq!(doc.value.get("online"), Some(&json!(true)));
}

#[tokio::test]
async fn test_fetch_query_and_document() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    for (id, score) in [("a", 3), ("b", 9), ("c", 5)] {
        server.seed("scores", id, object(json!({"score": score}))).await.unwrap();
    }
    let client = connected_client(&url, ClientConfig::default()).await;

    let top = client
        .collection("scores")
        .filter(Filter::greater_than("score", 4))
        .order("score", Direction::Desc)
        .fetch();
    let top = timeout(WAIT, top).await.unwrap().unwrap();
    assert_eq!(ids(&top), vec!["b", "c"]);

    let one = timeout(WAIT, client.collection("scores").document("a").fetch())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(one.value.get("score"), Some(&json!(3)));
    assert!(one.etag.is_some());

    let missing = timeout(WAIT, client.collection("scores").document("zz").fetch())
        .await
        .unwrap()
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_resubscribe_after_reconnect_reports_only_new_documents() {
    let (server, url) = start_test_server(ServerConfig::default()).await;
    server.seed("tasks", "A", object(json!({"done": false}))).await.unwrap();

    let client = connected_client(&url, ClientConfig::default()).await;
    let mut handle = client.subscribe(Query::new("tasks")).unwrap();
    assert_eq!(ids(&next_diff(&mut handle).await.added), vec!["A"]);

    client.disconnect();
    server.seed("tasks", "B", object(json!({"done": false}))).await.unwrap();
    timeout(WAIT, client.connect(&url)).await.unwrap().unwrap();

    let diff = next_diff(&mut handle).await;
    assert_eq!(ids(&diff.added), vec!["B"]);
    assert_eq!(ids(&diff.documents), vec!["A", "B"]);
}

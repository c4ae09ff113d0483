//! v2 client against an in-process fake of the keys API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use sdetcd_core::config::NAMESPACE;
use sdetcd_core::{
    new_client, Credentials, Error, ExtraConfig, RegistryClient, ResubscribePolicy, SubscriberFactory,
    TimeoutPolicy, V2Client,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const INDEX_HEADER: &str = "X-Etcd-Index";

#[derive(Default)]
struct Store {
    index: u64,
    /// Insertion order, like an unsorted v2 directory listing
    entries: Vec<(String, String, u64)>,
    events: Vec<(u64, String, String)>,
    empty_polls: usize,
}

#[derive(Clone)]
struct FakeEtcd {
    store: Arc<Mutex<Store>>,
    changed: Arc<watch::Sender<u64>>,
    hits: Arc<AtomicUsize>,
}

impl FakeEtcd {
    fn new() -> Self {
        let store = Store {
            index: 10,
            ..Default::default()
        };
        Self {
            store: Arc::new(Mutex::new(store)),
            changed: Arc::new(watch::channel(10).0),
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn put(&self, key: &str, value: &str) {
        let index = {
            let mut store = self.store.lock().unwrap();
            store.index += 1;
            let index = store.index;
            match store.entries.iter_mut().find(|(k, _, _)| k == key) {
                Some(entry) => {
                    entry.1 = value.to_string();
                    entry.2 = index;
                }
                None => store.entries.push((key.to_string(), value.to_string(), index)),
            }
            store.events.push((index, key.to_string(), value.to_string()));
            index
        };
        self.changed.send_replace(index);
    }

    fn expire_next_polls(&self, count: usize) {
        self.store.lock().unwrap().empty_polls = count;
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn under(key: &str, prefix: &str) -> bool {
    prefix == "/" || key == prefix || key.starts_with(&format!("{prefix}/"))
}

async fn root(
    State(etcd): State<FakeEtcd>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    keys(etcd, String::new(), params).await
}

async fn nested(
    State(etcd): State<FakeEtcd>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    keys(etcd, key, params).await
}

async fn keys(etcd: FakeEtcd, key: String, params: HashMap<String, String>) -> Response {
    etcd.hits.fetch_add(1, Ordering::SeqCst);
    let key = format!("/{}", key.trim_matches('/'));

    if params.get("wait").map(String::as_str) == Some("true") {
        return wait(etcd, key, params).await;
    }

    let store = etcd.store.lock().unwrap();
    let index = store.index.to_string();

    if let Some((_, value, modified)) = store.entries.iter().find(|(k, _, _)| *k == key) {
        let body = json!({
            "action": "get",
            "node": { "key": key, "value": value, "modifiedIndex": modified, "createdIndex": modified }
        });
        return ([(INDEX_HEADER, index)], Json(body)).into_response();
    }

    let nodes: Vec<_> = store
        .entries
        .iter()
        .filter(|(k, _, _)| under(k, &key))
        .map(|(k, v, i)| json!({ "key": k, "value": v, "modifiedIndex": i, "createdIndex": i }))
        .collect();
    if nodes.is_empty() {
        let body = json!({ "errorCode": 100, "message": "Key not found", "cause": key, "index": store.index });
        return (StatusCode::NOT_FOUND, [(INDEX_HEADER, index)], Json(body)).into_response();
    }

    let body = json!({ "action": "get", "node": { "key": key, "dir": true, "nodes": nodes } });
    ([(INDEX_HEADER, index)], Json(body)).into_response()
}

async fn wait(etcd: FakeEtcd, key: String, params: HashMap<String, String>) -> Response {
    let mut changed = etcd.changed.subscribe();

    let wait_index = {
        let mut store = etcd.store.lock().unwrap();
        if store.empty_polls > 0 {
            store.empty_polls -= 1;
            return ([(INDEX_HEADER, store.index.to_string())], "").into_response();
        }
        params
            .get("waitIndex")
            .and_then(|i| i.parse::<u64>().ok())
            .unwrap_or(store.index + 1)
    };

    loop {
        let found = {
            let store = etcd.store.lock().unwrap();
            store
                .events
                .iter()
                .find(|(i, k, _)| *i >= wait_index && under(k, &key))
                .cloned()
                .map(|event| (event, store.index))
        };
        if let Some(((modified, k, v), index)) = found {
            let body = json!({
                "action": "set",
                "node": { "key": k, "value": v, "modifiedIndex": modified, "createdIndex": modified }
            });
            return ([(INDEX_HEADER, index.to_string())], Json(body)).into_response();
        }
        if changed.changed().await.is_err() {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_store(etcd: FakeEtcd) -> String {
    let app = Router::new()
        .route("/v2/keys", get(root))
        .route("/v2/keys/{*key}", get(nested))
        .with_state(etcd);
    serve(app).await
}

async fn spawn_unavailable(hits: Arc<AtomicUsize>) -> String {
    let app = Router::new().fallback(move || {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            (StatusCode::SERVICE_UNAVAILABLE, "raft: leader unknown")
        }
    });
    serve(app).await
}

async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

fn client(machines: &[String], cancel: CancellationToken) -> V2Client {
    V2Client::new(
        cancel,
        machines,
        TimeoutPolicy::uniform(Duration::from_secs(2)),
        &Credentials::default(),
    )
    .unwrap()
}

async fn next_signal(signals: &mut mpsc::Receiver<()>) {
    tokio::time::timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("no signal within 5s")
        .expect("signal channel closed");
}

#[tokio::test]
async fn test_list_returns_values_in_store_order() {
    let etcd = FakeEtcd::new();
    etcd.put("/services/api/b", "10.0.0.2:80");
    etcd.put("/services/api/a", "10.0.0.1:80");
    etcd.put("/services/api/c", "10.0.0.3:80");
    etcd.put("/services/other/x", "10.9.9.9:80");
    let url = spawn_store(etcd).await;

    let client = client(&[url], CancellationToken::new());
    let hosts = client.list("/services/api").await.unwrap();
    assert_eq!(hosts, vec!["10.0.0.2:80", "10.0.0.1:80", "10.0.0.3:80"]);
}

#[tokio::test]
async fn test_list_single_value_key() {
    let etcd = FakeEtcd::new();
    etcd.put("/services/api", "10.0.0.1:80");
    let url = spawn_store(etcd).await;

    let client = client(&[url], CancellationToken::new());
    assert_eq!(client.list("/services/api").await.unwrap(), vec!["10.0.0.1:80"]);
}

#[tokio::test]
async fn test_list_missing_prefix_is_store_error() {
    let url = spawn_store(FakeEtcd::new()).await;

    let client = client(&[url], CancellationToken::new());
    match client.list("/services/api").await {
        Err(Error::Store(err)) => {
            assert!(err.is_key_not_found());
            assert_eq!(err.index, 10);
        }
        other => panic!("expected a store error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_list_fails_over_and_pins_endpoint() {
    let etcd = FakeEtcd::new();
    etcd.put("/services/api/a", "10.0.0.1:80");
    let unavailable_hits = Arc::new(AtomicUsize::new(0));
    let machines = vec![
        closed_port().await,
        spawn_unavailable(unavailable_hits.clone()).await,
        spawn_store(etcd.clone()).await,
    ];

    let client = client(&machines, CancellationToken::new());
    assert_eq!(client.list("/services/api").await.unwrap(), vec!["10.0.0.1:80"]);
    assert_eq!(unavailable_hits.load(Ordering::SeqCst), 1);

    // The answering endpoint is tried first from now on
    assert_eq!(client.list("/services/api").await.unwrap(), vec!["10.0.0.1:80"]);
    assert_eq!(unavailable_hits.load(Ordering::SeqCst), 1);
    assert_eq!(etcd.hits(), 2);
}

#[tokio::test]
async fn test_list_all_endpoints_down() {
    let unavailable_hits = Arc::new(AtomicUsize::new(0));
    let machines = vec![closed_port().await, spawn_unavailable(unavailable_hits.clone()).await];

    let client = client(&machines, CancellationToken::new());
    let err = client.list("/services/api").await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedStatus(503)), "{err}");
}

#[tokio::test]
async fn test_list_times_out() {
    let app = Router::new().fallback(|| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        StatusCode::OK
    });
    let url = serve(app).await;

    let client = V2Client::new(
        CancellationToken::new(),
        &[url],
        TimeoutPolicy::uniform(Duration::from_millis(100)),
        &Credentials::default(),
    )
    .unwrap();
    assert!(matches!(client.list("/services/api").await, Err(Error::Timeout)));
}

#[tokio::test]
async fn test_watch_sends_sentinel_then_one_signal_per_change() {
    let etcd = FakeEtcd::new();
    etcd.put("/services/api/a", "10.0.0.1:80");
    let url = spawn_store(etcd.clone()).await;

    let cancel = CancellationToken::new();
    let client = client(&[url], cancel.clone());
    let (tx, mut signals) = mpsc::channel(1);
    let watcher = tokio::spawn(async move { client.watch("/services/api", &tx).await });

    next_signal(&mut signals).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(signals.try_recv().is_err(), "signal without a store change");

    etcd.put("/services/api/b", "10.0.0.2:80");
    next_signal(&mut signals).await;

    // Outside the prefix: no signal
    etcd.put("/services/other/x", "10.9.9.9:80");
    etcd.put("/services/api/a", "10.0.0.5:80");
    etcd.put("/services/api/b", "10.0.0.6:80");
    next_signal(&mut signals).await;
    next_signal(&mut signals).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(signals.try_recv().is_err());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), watcher)
        .await
        .expect("watch did not stop on cancel")
        .unwrap();
}

#[tokio::test]
async fn test_watch_catches_change_right_after_sentinel() {
    let etcd = FakeEtcd::new();
    let url = spawn_store(etcd.clone()).await;

    let client = client(&[url], CancellationToken::new());
    let (tx, mut signals) = mpsc::channel(1);
    tokio::spawn(async move { client.watch("/services/api", &tx).await });

    // Prefix did not exist when the watch was established
    next_signal(&mut signals).await;
    etcd.put("/services/api/a", "10.0.0.1:80");
    next_signal(&mut signals).await;
}

#[tokio::test]
async fn test_watch_reissues_expired_long_polls() {
    let etcd = FakeEtcd::new();
    etcd.put("/services/api/a", "10.0.0.1:80");
    let url = spawn_store(etcd.clone()).await;

    let client = client(&[url], CancellationToken::new());
    let (tx, mut signals) = mpsc::channel(1);
    etcd.expire_next_polls(3);
    tokio::spawn(async move { client.watch("/services/api", &tx).await });

    next_signal(&mut signals).await;
    etcd.put("/services/api/b", "10.0.0.2:80");
    next_signal(&mut signals).await;
    assert!(signals.try_recv().is_err());
}

#[tokio::test]
async fn test_watch_ends_when_store_is_unreachable() {
    let machines = vec![closed_port().await];
    let client = client(&machines, CancellationToken::new());
    let (tx, mut signals) = mpsc::channel(1);

    tokio::time::timeout(Duration::from_secs(5), client.watch("/services/api", &tx))
        .await
        .expect("watch must give up on an unreachable store");
    assert!(signals.try_recv().is_err());
}

#[tokio::test]
async fn test_subscriber_tracks_store() {
    let etcd = FakeEtcd::new();
    etcd.put("/services/api/a", "10.0.0.1:80");
    let url = spawn_store(etcd.clone()).await;

    let extra = ExtraConfig::from([(
        NAMESPACE.to_string(),
        json!({ "machines": [url], "options": { "header_timeout": "1s" } }),
    )]);
    let cancel = CancellationToken::new();
    let client: Arc<dyn RegistryClient> = new_client(cancel.clone(), &extra).await.unwrap();

    let policy = ResubscribePolicy {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(100),
        multiplier: 2.0,
    };
    let factory = SubscriberFactory::with_policy(client, cancel.clone(), policy);
    let subscriber = factory.subscriber("/services/api").await.unwrap();
    assert_eq!(subscriber.hosts(), vec!["10.0.0.1:80"]);

    let mut changes = subscriber.changes();
    etcd.put("/services/api/b", "10.0.0.2:80");
    tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|hosts| hosts.len() == 2))
        .await
        .expect("snapshot not refreshed")
        .unwrap();
    assert_eq!(subscriber.hosts(), vec!["10.0.0.1:80", "10.0.0.2:80"]);

    cancel.cancel();
}

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use pocketbase_sdk::realtime::{RealtimeOptions, SseError};
use pocketbase_sdk::retry::ReconnectPolicy;
use pocketbase_sdk::services::record::OAuth2Options;
use pocketbase_sdk::{
    AuthStore, ClientError, ClientOptions, FilePart, PocketBase, RequestOptions, SubscribeOptions,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

const CLIENT_ID: &str = "client-1";
const WAIT: Duration = Duration::from_secs(3);

type FrameSender = Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>;

#[derive(Clone)]
struct Backend {
    token: String,
    connects: Arc<AtomicUsize>,
    frames: FrameSender,
    observed_tx: mpsc::UnboundedSender<(String, Value)>,
}

impl Backend {
    fn observe(&self, what: &str, value: Value) {
        let _ = self.observed_tx.send((what.to_string(), value));
    }
}

fn push_frame(frames: &FrameSender, frame: String) {
    if let Some(tx) = frames.lock().expect("frames lock").as_ref() {
        let _ = tx.send(frame);
    }
}

fn token_with(payload: Value) -> String {
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(payload.to_string())
    )
}

async fn next_observed(
    observed_rx: &mut mpsc::UnboundedReceiver<(String, Value)>,
    what: &str,
) -> Value {
    loop {
        let (name, value) = timeout(WAIT, observed_rx.recv())
            .await
            .expect("timed out waiting for backend observation")
            .expect("observation channel closed");
        if name == what {
            return value;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_responses_surface_status_and_message() {
    let (backend, _observed_rx) = backend();
    let (addr, shutdown_tx, server_task) = spawn_server(router(backend)).await;

    let client = PocketBase::new(format!("http://{addr}")).expect("build client");
    let err = client
        .collection("posts")
        .get_one("missing", &RequestOptions::new())
        .await
        .expect_err("missing record should fail");

    assert_eq!(err.status_code(), 404);
    assert_eq!(err.response()["message"], json!("not found"));
    assert!(err.url().is_some_and(|url| url.ends_with("/api/collections/posts/records/missing")));

    let blank = client
        .collection("posts")
        .get_one("  ", &RequestOptions::new())
        .await
        .expect_err("blank id should fail locally");
    assert_eq!(blank.status_code(), 404);

    stop(shutdown_tx, server_task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn password_auth_saves_token_and_authorizes_paged_listing() {
    let (backend, mut observed_rx) = backend();
    let token = backend.token.clone();
    let (addr, shutdown_tx, server_task) = spawn_server(router(backend)).await;

    let client = PocketBase::new(format!("http://{addr}")).expect("build client");
    let auth = client
        .collection("users")
        .auth_with_password("a@example.com", "secret", &RequestOptions::new())
        .await
        .expect("password auth");

    assert_eq!(auth.token, token);
    assert_eq!(client.auth_store().token(), token);
    assert!(client.auth_store().is_valid());
    assert_eq!(client.auth_store().record().map(|r| r.id().to_string()).as_deref(), Some("u1"));

    let body = next_observed(&mut observed_rx, "auth-with-password").await;
    assert_eq!(body, json!({"identity": "a@example.com", "password": "secret"}));

    let items = client
        .collection("posts")
        .get_full_list(2, &RequestOptions::new().sort("-created"))
        .await
        .expect("full list");
    assert_eq!(items.len(), 3);
    assert_eq!(items[2].id(), "p3");

    let first_page = next_observed(&mut observed_rx, "list").await;
    assert_eq!(first_page["authorization"], json!(token));
    assert_eq!(first_page["query"]["page"], json!("1"));
    assert_eq!(first_page["query"]["perPage"], json!("2"));
    assert_eq!(first_page["query"]["sort"], json!("-created"));
    let second_page = next_observed(&mut observed_rx, "list").await;
    assert_eq!(second_page["query"]["page"], json!("2"));

    stop(shutdown_tx, server_task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn realtime_subscriptions_share_one_session_and_close_when_empty() {
    let (backend, mut observed_rx) = backend();
    let connects = backend.connects.clone();
    let frames = backend.frames.clone();
    let (addr, shutdown_tx, server_task) = spawn_server(router(backend)).await;

    let client = PocketBase::new(format!("http://{addr}")).expect("build client");
    let disconnects = Arc::new(AtomicUsize::new(0));
    let hook_disconnects = disconnects.clone();
    client.realtime().set_on_disconnect(move |_keys| {
        hook_disconnects.fetch_add(1, Ordering::SeqCst);
    });

    let posts = client.collection("posts");
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let all_tx = events_tx.clone();
    let all = posts
        .subscribe("*", SubscribeOptions::new(), move |event| {
            let _ = all_tx.send(("all", event));
        })
        .await
        .expect("subscribe posts/*");
    assert_eq!(client.realtime().client_id(), CLIENT_ID);

    let first = next_observed(&mut observed_rx, "realtime").await;
    assert_eq!(first, json!({"clientId": CLIENT_ID, "subscriptions": ["posts/*"]}));

    let one = posts
        .subscribe("p1", SubscribeOptions::new(), move |event| {
            let _ = events_tx.send(("one", event));
        })
        .await
        .expect("subscribe posts/p1");
    let second = next_observed(&mut observed_rx, "realtime").await;
    assert_eq!(second["subscriptions"], json!(["posts/*", "posts/p1"]));

    push_frame(
        &frames,
        "event:posts/*\ndata:{\"action\":\"create\",\"record\":{\"id\":\"p9\",\"collectionName\":\"posts\"}}\n\n"
            .to_string(),
    );
    let (listener, event) = timeout(WAIT, events_rx.recv())
        .await
        .expect("timed out waiting for record event")
        .expect("event channel closed");
    assert_eq!(listener, "all");
    assert_eq!(event.action, "create");
    assert_eq!(event.record.id(), "p9");
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    one.unsubscribe().await.expect("unsubscribe posts/p1");
    let third = next_observed(&mut observed_rx, "realtime").await;
    assert_eq!(third["subscriptions"], json!(["posts/*"]));
    assert!(client.realtime().is_connected());

    drop(all);
    posts.unsubscribe(None).await.expect("unsubscribe collection");
    assert!(client.realtime().subscription_keys().is_empty());
    assert!(!client.realtime().is_connected());
    assert_eq!(client.realtime().client_id(), "");
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    stop(shutdown_tx, server_task).await;
}

fn fast_reconnect_client(addr: SocketAddr) -> PocketBase {
    let options = ClientOptions {
        realtime: RealtimeOptions {
            policy: ReconnectPolicy::with_delays(vec![Duration::from_millis(10)]),
            ..RealtimeOptions::default()
        },
        ..ClientOptions::default()
    };
    PocketBase::with_options(format!("http://{addr}"), options, AuthStore::new())
        .expect("build client")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_fails_when_stream_is_refused_but_keeps_the_key() {
    let app = Router::new().route(
        "/api/realtime",
        get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
    );
    let (addr, shutdown_tx, server_task) = spawn_server(app).await;

    let client = fast_reconnect_client(addr);
    let err = client
        .collection("posts")
        .subscribe("*", SubscribeOptions::new(), |_event| {})
        .await
        .expect_err("refused stream should fail the subscribe");

    assert!(matches!(
        err,
        ClientError::Realtime {
            source: SseError::Status(500),
            ..
        }
    ));
    assert_eq!(client.realtime().subscription_keys(), ["posts/*"]);
    assert!(!client.realtime().is_connected());
    assert_eq!(client.realtime().client_id(), "");

    stop(shutdown_tx, server_task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_session_reconnects_and_resubmits_every_key() {
    let (backend, mut observed_rx) = backend();
    let connects = backend.connects.clone();
    let frames = backend.frames.clone();
    let (addr, shutdown_tx, server_task) = spawn_server(router(backend)).await;

    let client = fast_reconnect_client(addr);
    let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
    client.realtime().set_on_disconnect(move |keys| {
        let _ = lost_tx.send(keys.to_vec());
    });

    let _tags = client
        .collection("tags")
        .subscribe("*", SubscribeOptions::new(), |_event| {})
        .await
        .expect("subscribe tags/*");
    next_observed(&mut observed_rx, "realtime").await;
    let _posts = client
        .collection("posts")
        .subscribe("*", SubscribeOptions::new(), |_event| {})
        .await
        .expect("subscribe posts/*");

    // Keys are submitted sorted, not in subscribe order.
    let submitted = next_observed(&mut observed_rx, "realtime").await;
    assert_eq!(submitted["subscriptions"], json!(["posts/*", "tags/*"]));
    assert_eq!(client.realtime().subscription_keys(), ["posts/*", "tags/*"]);

    // Ending the response body drops the established session.
    drop(frames.lock().expect("frames lock").take());

    let lost_keys = timeout(WAIT, lost_rx.recv())
        .await
        .expect("timed out waiting for disconnect hook")
        .expect("hook channel closed");
    assert_eq!(lost_keys, ["posts/*", "tags/*"]);

    let resubmitted = next_observed(&mut observed_rx, "realtime").await;
    assert_eq!(
        resubmitted,
        json!({"clientId": CLIENT_ID, "subscriptions": ["posts/*", "tags/*"]})
    );
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(client.realtime().client_id(), CLIENT_ID);

    stop(shutdown_tx, server_task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_with_files_sends_indexed_multipart_fields() {
    let (backend, mut observed_rx) = backend();
    let (addr, shutdown_tx, server_task) = spawn_server(router(backend)).await;

    let client = PocketBase::new(format!("http://{addr}")).expect("build client");
    let mut batch = client.create_batch();
    batch.collection("posts").create(
        json!({"title": "hello"}),
        vec![FilePart::new("cover", "cover.png", vec![1, 2, 3]).with_mime("image/png")],
        &RequestOptions::new(),
    );
    batch.collection("posts").delete("p2", &RequestOptions::new());

    let results = batch.send(&RequestOptions::new()).await.expect("send batch");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, 200);
    assert_eq!(results[0].body["id"], json!("p1"));
    assert_eq!(results[1].status, 204);

    let observed = next_observed(&mut observed_rx, "batch").await;
    let content_type = observed["content_type"].as_str().unwrap_or_default();
    let body = observed["body"].as_str().unwrap_or_default();
    assert!(content_type.starts_with("multipart/form-data"));
    assert!(body.contains("name=\"@jsonPayload\""));
    assert!(body.contains("name=\"requests.0.cover\""));
    assert!(body.contains("\"url\":\"/api/collections/posts/records/p2\""));

    stop(shutdown_tx, server_task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oauth2_flow_exchanges_redirect_code() {
    let (backend, mut observed_rx) = backend();
    let frames = backend.frames.clone();
    let token = backend.token.clone();
    let (addr, shutdown_tx, server_task) = spawn_server(router(backend)).await;

    let client = PocketBase::new(format!("http://{addr}")).expect("build client");
    let (url_tx, url_rx) = oneshot::channel();
    let auth = client
        .collection("users")
        .auth_with_oauth2(
            "github",
            move |url| {
                let state = url
                    .query_pairs()
                    .find(|(key, _)| key == "state")
                    .map(|(_, value)| value.into_owned())
                    .unwrap_or_default();
                push_frame(
                    &frames,
                    format!("event:@oauth2\ndata:{{\"state\":\"{state}\",\"code\":\"code-1\"}}\n\n"),
                );
                let _ = url_tx.send(url);
            },
            OAuth2Options {
                scopes: vec!["read:user".to_string()],
                ..OAuth2Options::default()
            },
        )
        .await
        .expect("oauth2 auth");

    assert_eq!(auth.token, token);
    assert_eq!(client.auth_store().token(), token);
    assert!(client.realtime().subscription_keys().is_empty());

    let url = url_rx.await.expect("auth url");
    let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
    assert_eq!(pairs["state"], CLIENT_ID);
    assert_eq!(pairs["scope"], "read:user");
    assert_eq!(pairs["redirect_uri"], format!("http://{addr}/api/oauth2-redirect"));

    let exchanged = next_observed(&mut observed_rx, "auth-with-oauth2").await;
    assert_eq!(exchanged["provider"], json!("github"));
    assert_eq!(exchanged["code"], json!("code-1"));
    assert_eq!(exchanged["codeVerifier"], json!("verifier-1"));

    stop(shutdown_tx, server_task).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oauth2_flow_rejects_foreign_state() {
    let (backend, _observed_rx) = backend();
    let frames = backend.frames.clone();
    let (addr, shutdown_tx, server_task) = spawn_server(router(backend)).await;

    let client = PocketBase::new(format!("http://{addr}")).expect("build client");
    let err = client
        .collection("users")
        .auth_with_oauth2(
            "github",
            move |_url| {
                push_frame(
                    &frames,
                    "event:@oauth2\ndata:{\"state\":\"someone-else\",\"code\":\"code-1\"}\n\n"
                        .to_string(),
                );
            },
            OAuth2Options::default(),
        )
        .await
        .expect_err("state mismatch should fail");

    assert_eq!(err.to_string(), "State parameters don't match.");
    assert_eq!(client.auth_store().token(), "");
    assert!(client.realtime().subscription_keys().is_empty());

    let unknown = client
        .collection("users")
        .auth_with_oauth2("gitlab", |_url| {}, OAuth2Options::default())
        .await
        .expect_err("unknown provider should fail");
    assert!(unknown.to_string().contains("gitlab"));

    stop(shutdown_tx, server_task).await;
}

fn backend() -> (Backend, mpsc::UnboundedReceiver<(String, Value)>) {
    let (observed_tx, observed_rx) = mpsc::unbounded_channel();
    let backend = Backend {
        token: token_with(json!({"id": "u1", "collectionId": "_pb_users", "exp": 4_102_444_800_i64})),
        connects: Arc::new(AtomicUsize::new(0)),
        frames: Arc::new(Mutex::new(None)),
        observed_tx,
    };
    (backend, observed_rx)
}

fn router(backend: Backend) -> Router {
    Router::new()
        .route("/api/realtime", get(realtime_stream).post(realtime_submit))
        .route("/api/collections/posts/records", get(list_posts))
        .route("/api/collections/posts/records/:id", get(missing_post))
        .route(
            "/api/collections/users/auth-with-password",
            post(auth_with_password),
        )
        .route("/api/collections/users/auth-methods", get(auth_methods))
        .route("/api/collections/users/auth-with-oauth2", post(auth_with_oauth2))
        .route("/api/batch", post(batch))
        .with_state(backend)
}

async fn realtime_stream(State(backend): State<Backend>) -> impl IntoResponse {
    backend.connects.fetch_add(1, Ordering::SeqCst);
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let _ = tx.send(format!(
        "id:{CLIENT_ID}\nevent:PB_CONNECT\ndata:{{\"clientId\":\"{CLIENT_ID}\"}}\n\n"
    ));
    *backend.frames.lock().expect("frames lock") = Some(tx);

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(Bytes::from(frame)), rx))
    });
    ([(CONTENT_TYPE, "text/event-stream")], Body::from_stream(stream))
}

async fn realtime_submit(State(backend): State<Backend>, Json(payload): Json<Value>) -> StatusCode {
    backend.observe("realtime", payload);
    StatusCode::NO_CONTENT
}

async fn list_posts(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let authorization = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    backend.observe("list", json!({"authorization": authorization, "query": query}));

    let page = query.get("page").map(String::as_str).unwrap_or("1");
    let items = match page {
        "1" => json!([{"id": "p1"}, {"id": "p2"}]),
        "2" => json!([{"id": "p3"}]),
        _ => json!([]),
    };
    Json(json!({"page": page.parse::<u32>().unwrap_or(1), "perPage": 2, "totalItems": -1, "totalPages": -1, "items": items}))
}

async fn missing_post() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"message": "not found"})),
    )
}

async fn auth_with_password(State(backend): State<Backend>, Json(payload): Json<Value>) -> impl IntoResponse {
    backend.observe("auth-with-password", payload.clone());
    if payload["password"] != json!("secret") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"code": 400, "message": "Failed to authenticate.", "data": {}})),
        );
    }
    (StatusCode::OK, Json(auth_response(&backend)))
}

async fn auth_methods() -> Json<Value> {
    Json(json!({
        "password": {"enabled": true, "identityFields": ["email"]},
        "oauth2": {
            "enabled": true,
            "providers": [{
                "name": "github",
                "displayName": "GitHub",
                "state": "ignored",
                "codeVerifier": "verifier-1",
                "authUrl": "https://github.test/login/oauth/authorize?client_id=abc&scope=user&redirect_uri="
            }]
        }
    }))
}

async fn auth_with_oauth2(State(backend): State<Backend>, Json(payload): Json<Value>) -> Json<Value> {
    backend.observe("auth-with-oauth2", payload);
    Json(auth_response(&backend))
}

async fn batch(State(backend): State<Backend>, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    backend.observe(
        "batch",
        json!({
            "content_type": content_type,
            "body": String::from_utf8_lossy(&body),
        }),
    );
    Json(json!([
        {"status": 200, "body": {"id": "p1", "title": "hello"}},
        {"status": 204, "body": null}
    ]))
}

fn auth_response(backend: &Backend) -> Value {
    json!({
        "token": backend.token,
        "record": {"id": "u1", "collectionId": "_pb_users", "collectionName": "users", "email": "a@example.com"}
    })
}

async fn stop(shutdown_tx: oneshot::Sender<()>, server_task: tokio::task::JoinHandle<()>) {
    let _ = shutdown_tx.send(());
    // An idle event stream can keep graceful shutdown waiting.
    let _ = timeout(WAIT, server_task).await;
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}

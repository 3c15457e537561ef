//! Integration tests for the serving engine
//!
//! Records are written into an in-memory cache and requested through the
//! engine's router with `tower::ServiceExt::oneshot`.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{TimeDelta, Utc};
use site_mirror::cache::{CacheEntry, CacheStore, FileSystem, MemoryFs};
use site_mirror::server::{IssueAction, IssueHandler};
use site_mirror::{Issue, IssueKind, ServeEngine, ServeMode};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;
use url::Url;

const ORIGIN: &str = "https://example.com";

/// Records every issue and answers with the default
struct Recorder {
    issues: mpsc::UnboundedSender<Issue>,
}

#[async_trait]
impl IssueHandler for Recorder {
    async fn on_issue(&self, issue: &Issue) -> IssueAction {
        let _ = self.issues.send(issue.clone());
        IssueAction::Default
    }
}

struct Harness {
    fs: MemoryFs,
    store: Arc<CacheStore>,
    engine: Arc<ServeEngine>,
    issues: mpsc::UnboundedReceiver<Issue>,
}

fn harness(mode: ServeMode) -> Harness {
    let fs = MemoryFs::new();
    let store = Arc::new(
        CacheStore::new(Arc::new(fs.clone()), "/cache").expect("Failed to create store"),
    );
    let engine = Arc::new(ServeEngine::new(Arc::clone(&store), mode));
    let (tx, issues) = mpsc::unbounded_channel();
    engine.set_issue_handler(Arc::new(Recorder { issues: tx }));
    Harness {
        fs,
        store,
        engine,
        issues,
    }
}

fn bound() -> Harness {
    harness(ServeMode::Bound(Url::parse(ORIGIN).expect("Failed to parse origin")))
}

fn url(s: &str) -> Url {
    Url::parse(s).expect("Failed to parse URL")
}

fn page(url_str: &str, body: &str, expires_in: TimeDelta) -> CacheEntry {
    CacheEntry::new(url(url_str), 200)
        .with_body(Some("text/html".to_string()), body)
        .with_expires(Utc::now() + expires_in)
}

async fn send(engine: &Arc<ServeEngine>, method: Method, uri: &str) -> Response {
    engine
        .router()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .expect("Failed to build request"),
        )
        .await
        .expect("Router failed")
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    String::from_utf8(bytes.to_vec()).expect("Body is not UTF-8")
}

async fn next_issue(issues: &mut mpsc::UnboundedReceiver<Issue>) -> Issue {
    tokio::time::timeout(Duration::from_secs(5), issues.recv())
        .await
        .expect("No issue raised")
        .expect("Issue channel closed")
}

async fn assert_no_issue(issues: &mut mpsc::UnboundedReceiver<Issue>) {
    let outcome = tokio::time::timeout(Duration::from_millis(200), issues.recv()).await;
    assert!(outcome.is_err(), "unexpected issue: {:?}", outcome);
}

#[tokio::test]
async fn test_fresh_record_is_served_without_internal_headers() {
    let mut h = bound();
    h.store
        .write(&page("https://example.com/docs/", "hello", TimeDelta::hours(1)))
        .expect("Failed to write record");

    let response = send(&h.engine, Method::GET, "/docs/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/html");
    assert_eq!(response.headers()["content-length"], "5");
    assert!(response
        .headers()
        .keys()
        .all(|name| !name.as_str().starts_with("x-")));
    assert_eq!(body_text(response).await, "hello");

    assert_no_issue(&mut h.issues).await;
}

#[tokio::test]
async fn test_expired_record_is_served_then_reported() {
    let mut h = bound();
    h.store
        .write(&page("https://example.com/old", "stale", -TimeDelta::hours(1)))
        .expect("Failed to write record");

    let response = send(&h.engine, Method::GET, "/old").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "stale");

    let issue = next_issue(&mut h.issues).await;
    assert_eq!(issue.kind, IssueKind::CacheExpired);
    assert_eq!(issue.path, "/old");
    assert_eq!(issue.url, Some(url("https://example.com/old")));
    assert!(issue.state.committed);
    assert_eq!(issue.state.status, Some(200));
    assert_eq!(issue.state.content_length, Some(5));
    assert_eq!(issue.state.bytes_written, 5);
}

#[tokio::test]
async fn test_missing_record_is_not_found() {
    let mut h = bound();

    let response = send(&h.engine, Method::GET, "/missing?x=1").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let issue = next_issue(&mut h.issues).await;
    assert_eq!(issue.kind, IssueKind::CacheNotFound);
    assert_eq!(issue.url, Some(url("https://example.com/missing?x=1")));
    assert!(!issue.state.committed);
}

#[tokio::test]
async fn test_placeholder_is_not_found() {
    let mut h = bound();
    h.store
        .write_placeholder(&url("https://example.com/pending"), Duration::from_secs(60))
        .expect("Failed to write placeholder");

    let response = send(&h.engine, Method::GET, "/pending").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(next_issue(&mut h.issues).await.kind, IssueKind::CacheNotFound);
}

#[tokio::test]
async fn test_other_methods_are_rejected() {
    let mut h = bound();

    let response = send(&h.engine, Method::POST, "/form").await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let issue = next_issue(&mut h.issues).await;
    assert_eq!(issue.kind, IssueKind::MethodNotAllowed);
    assert_eq!(issue.url, None);
}

#[tokio::test]
async fn test_head_sends_headers_only() {
    let h = bound();
    h.store
        .write(&page("https://example.com/", "hello", TimeDelta::hours(1)))
        .expect("Failed to write record");

    let response = send(&h.engine, Method::HEAD, "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "5");
    assert_eq!(body_text(response).await, "");
}

#[tokio::test]
async fn test_redirect_record_keeps_location() {
    let h = bound();
    h.store
        .write(
            &CacheEntry::new(url("https://example.com/old"), 301)
                .with_location("./new")
                .with_expires(Utc::now() + TimeDelta::hours(1)),
        )
        .expect("Failed to write record");

    let response = send(&h.engine, Method::GET, "/old").await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers()["location"], "./new");
}

fn write_raw(h: &Harness, url_str: &str, data: &[u8]) {
    let path = h.store.path_for(&url(url_str));
    if let Some(parent) = path.parent() {
        h.fs.mkdir_all(parent).expect("Failed to create directories");
    }
    let mut writer = h.fs.create_new(&path).expect("Failed to create record");
    writer.write_all(data).expect("Failed to write record");
}

#[tokio::test]
async fn test_malformed_record_is_a_cache_error() {
    let mut h = bound();
    write_raw(&h, "https://example.com/broken", b"garbage\n\nbody");

    let response = send(&h.engine, Method::GET, "/broken").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let issue = next_issue(&mut h.issues).await;
    assert_eq!(issue.kind, IssueKind::CacheError);
    assert!(!issue.state.committed);
}

#[tokio::test]
async fn test_truncated_body_is_reported_after_commit() {
    let mut h = bound();
    write_raw(
        &h,
        "https://example.com/short",
        b"HTTP 200\nContent-Length: 10\n\nabc",
    );

    let response = send(&h.engine, Method::GET, "/short").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .is_err());

    let issue = next_issue(&mut h.issues).await;
    assert_eq!(issue.kind, IssueKind::CacheError);
    assert!(issue.state.committed);
    assert_eq!(issue.state.content_length, Some(10));
    assert_eq!(issue.state.bytes_written, 3);
}

#[tokio::test]
async fn test_cross_host_paths() {
    let mut h = harness(ServeMode::CrossHost);
    h.store
        .write(
            &page("https://example.com/a/b", "cross", TimeDelta::hours(1)).with_cross_host(true),
        )
        .expect("Failed to write record");

    let response = send(&h.engine, Method::GET, "/https/example.com/a/b").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "cross");

    let response = send(&h.engine, Method::GET, "/https/example.com").await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers()["location"], "/https/example.com/");

    let response = send(&h.engine, Method::GET, "/gopher/example.com/").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let issue = next_issue(&mut h.issues).await;
    assert_eq!(issue.kind, IssueKind::CrossHostInvalidPath);
}

#[tokio::test]
async fn test_mode_mismatch_counts_as_expired() {
    let mut h = harness(ServeMode::CrossHost);
    // Written by a bound mirror: links are not in the cross-host layout
    h.store
        .write(&page("https://example.com/", "bound", TimeDelta::hours(1)))
        .expect("Failed to write record");

    let response = send(&h.engine, Method::GET, "/https/example.com/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "bound");
    assert_eq!(next_issue(&mut h.issues).await.kind, IssueKind::CacheExpired);
}

/// Fills the cache on a miss and asks for a retry
struct Filler {
    store: Arc<CacheStore>,
}

#[async_trait]
impl IssueHandler for Filler {
    async fn on_issue(&self, issue: &Issue) -> IssueAction {
        match (&issue.kind, &issue.url) {
            (IssueKind::CacheNotFound, Some(url)) => {
                let entry = CacheEntry::new(url.clone(), 200)
                    .with_body(Some("text/plain".to_string()), "filled");
                match self.store.write(&entry) {
                    Ok(()) => IssueAction::Retry,
                    Err(_) => IssueAction::Default,
                }
            }
            (IssueKind::MethodNotAllowed, _) => {
                IssueAction::Respond((StatusCode::IM_A_TEAPOT, "no").into_response())
            }
            _ => IssueAction::Default,
        }
    }
}

#[tokio::test]
async fn test_handler_retry_and_respond() {
    let h = bound();
    h.engine.set_issue_handler(Arc::new(Filler {
        store: Arc::clone(&h.store),
    }));

    let response = send(&h.engine, Method::GET, "/lazy").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "filled");

    let response = send(&h.engine, Method::DELETE, "/lazy").await;
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
}

#[tokio::test]
async fn test_start_and_idempotent_stop() {
    let h = bound();
    h.store
        .write(&page("https://example.com/", "live", TimeDelta::hours(1)))
        .expect("Failed to write record");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local address");
    let engine = Arc::clone(&h.engine);
    let server = tokio::spawn(async move { engine.start(listener).await });

    let body = reqwest::get(format!("http://{}/", addr))
        .await
        .expect("Request failed")
        .text()
        .await
        .expect("Failed to read body");
    assert_eq!(body, "live");

    h.engine.stop();
    h.engine.stop();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("Server did not shut down")
        .expect("Server task panicked")
        .expect("Server failed");
}

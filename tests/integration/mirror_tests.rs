//! Integration tests for the mirror orchestration
//!
//! A wiremock origin is crawled into an in-memory cache, and the cache is
//! served back through the mirror's router.

use crate::test_client;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use chrono::{TimeDelta, Utc};
use site_mirror::cache::{CacheEntry, CacheStore, MemoryFs};
use site_mirror::config::{
    CacheConfig, Config, CrawlerConfig, ServerConfig, SiteEntry, UserAgentConfig,
};
use site_mirror::crawler::Crawler;
use site_mirror::Mirror;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration mirroring `origin`
fn create_test_config(origin: &str, seeds: Vec<String>, cross_host: bool) -> Config {
    let host = Url::parse(origin)
        .expect("Failed to parse origin")
        .host_str()
        .expect("Origin has no host")
        .to_string();

    Config {
        crawler: CrawlerConfig {
            workers: 2,
            auto_download_depth: 1,
            queue_capacity: 16,
        },
        user_agent: UserAgentConfig {
            crawler_name: "TestBot".to_string(),
            crawler_version: "1.0.0".to_string(),
            contact_url: "https://example.com/contact".to_string(),
            contact_email: "test@example.com".to_string(),
        },
        cache: CacheConfig {
            root: "/cache".to_string(),
            ttl: 3600,
            placeholder_ttl: 30,
        },
        server: ServerConfig {
            listen: "127.0.0.1:0".to_string(),
            cross_host,
            origin: (!cross_host).then(|| origin.to_string()),
            inline_timeout: 5,
        },
        site: vec![SiteEntry { host, seeds }],
        rewrite: vec![],
    }
}

fn create_mirror(config: Config) -> Mirror {
    let store = Arc::new(
        CacheStore::new(Arc::new(MemoryFs::new()), &config.cache.root)
            .expect("Failed to create store"),
    );
    let crawler = Crawler::new(test_client(), config.crawler.queue_capacity);
    crawler
        .set_worker_count(config.crawler.workers as usize)
        .expect("Failed to set worker count");
    crawler.set_auto_download_depth(config.crawler.auto_download_depth);

    let mirror = Mirror::new(config, store, crawler).expect("Failed to create mirror");
    mirror.crawler().start();
    mirror
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/html")
}

async fn get(mirror: &Mirror, uri: &str) -> Response {
    mirror
        .router()
        .oneshot(
            Request::builder()
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

async fn crawl(mirror: &Mirror) {
    mirror.seed().await.expect("Failed to seed");
    tokio::time::timeout(Duration::from_secs(10), mirror.crawler().wait_idle())
        .await
        .expect("Crawler did not become idle");
}

#[tokio::test]
async fn test_crawl_then_serve_with_local_links() {
    let server = MockServer::start().await;
    let origin = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!(
            r#"<html><body><a href="{}/docs/page.html">Docs</a> <a href="https://other.example/">Out</a></body></html>"#,
            origin
        )))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/docs/page.html"))
        .respond_with(html(r#"<a href="/">Home</a>"#.to_string()))
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config(&origin, vec![format!("{}/", origin)], false);
    let mirror = create_mirror(config);
    crawl(&mirror).await;

    assert_eq!(mirror.crawler().downloaded_count(), 2);

    let response = get(&mirror, "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.contains(r#"href="./docs/page.html""#), "{}", body);
    assert!(body.contains(r#"href="https://other.example/""#), "{}", body);

    let response = get(&mirror, "/docs/page.html").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, r#"<a href="../">Home</a>"#);

    mirror.stop().await;
}

#[tokio::test]
async fn test_cross_host_layout() {
    let server = MockServer::start().await;
    let origin = server.uri();
    let authority = origin.trim_start_matches("http://").to_string();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!(r#"<a href="{}/docs/">Docs</a>"#, origin)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/docs/"))
        .respond_with(html("docs".to_string()))
        .mount(&server)
        .await;

    let config = create_test_config(&origin, vec![format!("{}/", origin)], true);
    let mirror = create_mirror(config);
    crawl(&mirror).await;

    let response = get(&mirror, &format!("/http/{}/", authority)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, r#"<a href="./docs/">Docs</a>"#);

    let response = get(&mirror, &format!("/http/{}/docs/", authority)).await;
    assert_eq!(body_text(response).await, "docs");

    mirror.stop().await;
}

#[tokio::test]
async fn test_miss_is_fetched_inline_once() {
    let server = MockServer::start().await;
    let origin = server.uri();

    Mock::given(method("GET"))
        .and(path("/lazy"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("lazy", "text/plain")
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config(&origin, vec![], false);
    let mirror = create_mirror(config);

    let (first, second) = tokio::join!(get(&mirror, "/lazy"), get(&mirror, "/lazy"));
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_text(first).await, "lazy");
    assert_eq!(body_text(second).await, "lazy");

    mirror.stop().await;
}

#[tokio::test]
async fn test_origin_status_is_cached() {
    let server = MockServer::start().await;
    let origin = server.uri();

    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config(&origin, vec![], false);
    let mirror = create_mirror(config);

    assert_eq!(get(&mirror, "/gone").await.status(), StatusCode::NOT_FOUND);
    // Served from the cached 404 record the second time
    assert_eq!(get(&mirror, "/gone").await.status(), StatusCode::NOT_FOUND);

    mirror.stop().await;
}

#[tokio::test]
async fn test_unreachable_origin_is_bad_gateway() {
    let config = create_test_config("http://127.0.0.1:9", vec![], false);
    let mirror = create_mirror(config);

    let response = get(&mirror, "/anything").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    mirror.stop().await;
}

#[tokio::test]
async fn test_expired_record_is_refreshed() {
    let server = MockServer::start().await;
    let origin = server.uri();

    Mock::given(method("GET"))
        .and(path("/news"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("fresh", "text/plain"))
        .expect(1)
        .mount(&server)
        .await;

    let config = create_test_config(&origin, vec![], false);
    let mirror = create_mirror(config);
    let news = Url::parse(&format!("{}/news", origin)).expect("Failed to parse URL");
    mirror
        .store()
        .write(
            &CacheEntry::new(news, 200)
                .with_body(Some("text/plain".to_string()), "stale")
                .with_expires(Utc::now() - TimeDelta::hours(1)),
        )
        .expect("Failed to write record");

    let response = get(&mirror, "/news").await;
    assert_eq!(body_text(response).await, "stale");

    let refreshed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let body = body_text(get(&mirror, "/news").await).await;
            if body == "fresh" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(refreshed.is_ok(), "Expired record was not refreshed");

    mirror.stop().await;
}

//! Integration tests for the crawler
//!
//! These tests use wiremock to create mock HTTP servers and test
//! the download, link discovery and requeue cycle end-to-end.

use crate::test_client;
use site_mirror::crawler::{Crawler, CrawlerError, Downloaded, LinkContext, QueueItem};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html")
}

async fn mount_page(server: &MockServer, route: &str, template: ResponseTemplate, hits: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(template)
        .expect(hits)
        .mount(server)
        .await;
}

fn crawler(depth: u32) -> Crawler {
    let crawler = Crawler::new(test_client(), 16);
    crawler
        .set_worker_count(2)
        .expect("Failed to set worker count");
    crawler.set_auto_download_depth(depth);
    crawler
}

fn url(server: &MockServer, route: &str) -> Url {
    Url::parse(&format!("{}{}", server.uri(), route)).expect("Failed to parse URL")
}

fn drain(crawler: &Crawler) -> Vec<Downloaded> {
    let mut results = Vec::new();
    while let Some(result) = crawler.next_or_none() {
        results.push(result);
    }
    results
}

async fn wait_idle(crawler: &Crawler) {
    tokio::time::timeout(Duration::from_secs(10), crawler.wait_idle())
        .await
        .expect("Crawler did not become idle");
}

#[tokio::test]
async fn test_depth_one_crawl_counts() {
    let server = MockServer::start().await;
    mount_page(&server, "/a", html(r#"<a href="/b">b</a>"#), 1).await;
    mount_page(&server, "/b", html("<p>leaf</p>"), 1).await;

    let crawler = crawler(1);
    crawler.start();
    crawler
        .enqueue(QueueItem::new(url(&server, "/a"), 0))
        .await
        .expect("Failed to enqueue");

    wait_idle(&crawler).await;
    crawler.stop().await;

    assert_eq!(crawler.downloaded_count(), 2);
    assert_eq!(crawler.link_found_count(), 1);
    assert_eq!(crawler.queued_count(), 2);

    let results = drain(&crawler);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == Some(200)));
}

#[tokio::test]
async fn test_children_beyond_depth_are_not_queued() {
    let server = MockServer::start().await;
    mount_page(&server, "/a", html(r#"<a href="/b">b</a>"#), 1).await;
    mount_page(&server, "/b", html(r#"<a href="/c">c</a>"#), 1).await;
    mount_page(&server, "/c", html("<p>too deep</p>"), 0).await;

    let crawler = crawler(1);
    crawler.start();
    crawler
        .enqueue(QueueItem::new(url(&server, "/a"), 0))
        .await
        .expect("Failed to enqueue");

    wait_idle(&crawler).await;
    crawler.stop().await;

    assert_eq!(crawler.downloaded_count(), 2);
    assert_eq!(crawler.link_found_count(), 2);
}

#[tokio::test]
async fn test_redirects_are_reported_not_followed() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "/old",
        ResponseTemplate::new(301).insert_header("Location", "/new"),
        1,
    )
    .await;
    mount_page(&server, "/new", html("<p>new</p>"), 0).await;

    let crawler = crawler(2);
    crawler.start();
    crawler
        .enqueue(QueueItem::new(url(&server, "/old"), 0))
        .await
        .expect("Failed to enqueue");

    let result = tokio::time::timeout(Duration::from_secs(10), crawler.next())
        .await
        .expect("No result")
        .expect("Result channel closed");
    crawler.stop().await;

    assert_eq!(result.status, Some(301));
    assert!(result.is_redirect());
    assert_eq!(result.redirect, Some(url(&server, "/new")));
    assert!(result.body.is_empty());
}

#[tokio::test]
async fn test_stylesheet_links_are_followed() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "/",
        html(r#"<link rel="stylesheet" href="/css/site.css"><img src="logo.png#top">"#),
        1,
    )
    .await;
    mount_page(
        &server,
        "/css/site.css",
        ResponseTemplate::new(200)
            .set_body_raw(r#"body { background: url("../img/bg.png") }"#, "text/css"),
        1,
    )
    .await;
    mount_page(
        &server,
        "/logo.png",
        ResponseTemplate::new(200).set_body_raw(vec![0x89u8, b'P', b'N', b'G'], "image/png"),
        1,
    )
    .await;
    mount_page(
        &server,
        "/img/bg.png",
        ResponseTemplate::new(200).set_body_raw(vec![0u8; 4], "image/png"),
        0,
    )
    .await;

    let crawler = crawler(1);
    crawler.start();
    crawler
        .enqueue(QueueItem::new(url(&server, "/"), 0))
        .await
        .expect("Failed to enqueue");

    wait_idle(&crawler).await;
    crawler.stop().await;

    let results = drain(&crawler);
    let css = results
        .iter()
        .find(|r| r.url.path() == "/css/site.css")
        .expect("Stylesheet was not downloaded");
    assert_eq!(css.links.len(), 1);
    assert_eq!(css.links[0].context, LinkContext::CssUri);
    assert_eq!(css.links[0].url, url(&server, "/img/bg.png"));

    let image = results
        .iter()
        .find(|r| r.url.path() == "/logo.png")
        .expect("Image was not downloaded");
    assert_eq!(image.body.as_bytes(), &[0x89, b'P', b'N', b'G']);
}

#[tokio::test]
async fn test_sink_and_policies() {
    let server = MockServer::start().await;
    mount_page(
        &server,
        "/",
        html(r#"<a href="/keep">k</a><a href="/skip">s</a><a href="/cached">c</a>"#),
        1,
    )
    .await;
    mount_page(&server, "/keep", html("<p>keep</p>"), 1).await;
    mount_page(&server, "/skip", html("<p>skip</p>"), 0).await;
    mount_page(&server, "/cached", html("<p>cached</p>"), 0).await;

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let crawler = crawler(1);
    let sink = Arc::clone(&delivered);
    crawler.set_on_downloaded(move |result: &Downloaded| {
        sink.lock().unwrap().push(result.url.path().to_string());
    });
    crawler.set_on_url_should_queue(|url: &Url| url.path() != "/skip");
    crawler.set_on_url_should_download(|url: &Url| url.path() != "/cached");
    crawler.start();

    crawler
        .enqueue(QueueItem::new(url(&server, "/"), 0))
        .await
        .expect("Failed to enqueue");
    wait_idle(&crawler).await;
    crawler.stop().await;

    let mut paths = delivered.lock().unwrap().clone();
    paths.sort();
    assert_eq!(paths, vec!["/".to_string(), "/keep".to_string()]);
    // Sink delivery bypasses the pull channel
    assert!(crawler.next_or_none().is_none());
}

#[tokio::test]
async fn test_forced_download_bypasses_should_download() {
    let server = MockServer::start().await;
    mount_page(&server, "/page", html("<p>page</p>"), 1).await;

    let crawler = crawler(0);
    crawler.set_on_url_should_download(|_: &Url| false);
    crawler.start();

    crawler
        .enqueue(QueueItem::new(url(&server, "/page"), 0))
        .await
        .expect("Failed to enqueue");
    wait_idle(&crawler).await;
    assert_eq!(crawler.downloaded_count(), 0);

    crawler
        .download(QueueItem::new(url(&server, "/page"), 0))
        .await
        .expect("Failed to enqueue");
    wait_idle(&crawler).await;
    crawler.stop().await;

    assert_eq!(crawler.queued_count(), 2);
    assert_eq!(crawler.downloaded_count(), 1);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_final() {
    let crawler = crawler(0);
    crawler.start();
    crawler.stop().await;
    crawler.stop().await;

    let item = QueueItem::parse("http://127.0.0.1:9/", 0).expect("Failed to parse URL");
    assert!(matches!(
        crawler.enqueue(item).await,
        Err(CrawlerError::Stopped)
    ));
    assert!(!crawler.is_busy());
    assert!(crawler.next().await.is_none());
}

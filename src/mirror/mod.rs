//! Mirror orchestration
//!
//! This module wires the crawler, the cache and the serving engine together:
//! - Discovered links are queued only for mirrored hosts, once each
//! - Every download becomes a cache record with its links made local
//! - Serving issues trigger on-demand downloads, refetches and TTL bumps

use crate::cache::{expiry_after, CacheEntry, CacheError, CacheStore};
use crate::config::Config;
use crate::crawler::{link_occurrences, rewrite_links, Crawler, Downloaded, MarkupKind, QueueItem};
use crate::server::{Issue, IssueAction, IssueHandler, IssueKind, ServeEngine, ServeMode};
use crate::url::{classify_url, host_key, reduce_url, require_absolute, rewrite_host};
use crate::MirrorError;
use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Router;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use url::{Position, Url};

/// Base used to reduce cross-host paths; never served
const CROSS_HOST_BASE: &str = "http://mirror.invalid";

type Waiter = oneshot::Sender<Result<(), String>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Path under which `url` is served in cross-host mode
fn cross_host_path(url: &Url) -> String {
    format!(
        "/{}/{}{}",
        url.scheme(),
        &url[Position::BeforeHost..Position::AfterPort],
        &url[Position::BeforePath..Position::AfterQuery]
    )
}

fn gateway_response(status: StatusCode) -> IssueAction {
    let reason = status.canonical_reason().unwrap_or("Error");
    IssueAction::Respond((status, format!("{}\n", reason)).into_response())
}

struct Shared {
    config: Config,
    mode: ServeMode,
    store: Arc<CacheStore>,
    crawler: Crawler,
    seen: Mutex<HashSet<String>>,
    /// Requests waiting for an on-demand download, by URL
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl Shared {
    fn is_mirrored(&self, url: &Url) -> bool {
        if classify_url(url, &self.config).is_mirrored() {
            return true;
        }
        match &self.mode {
            ServeMode::Bound(origin) => {
                matches!(url.scheme(), "http" | "https")
                    && host_key(url).is_some()
                    && host_key(url) == host_key(origin)
            }
            ServeMode::CrossHost => false,
        }
    }

    /// Records `url` as queued; false if it was queued before
    fn mark_seen(&self, url: &Url) -> bool {
        lock(&self.seen).insert(url.as_str().to_string())
    }

    fn should_queue(&self, url: &Url) -> bool {
        self.is_mirrored(url) && self.mark_seen(url)
    }

    fn should_download(&self, url: &Url) -> bool {
        !self.store.exists(url)
    }

    /// `url` after host rewriting, if it is served in the current mode
    fn served_form(&self, url: &Url) -> Option<Url> {
        let mut url = url.clone();
        rewrite_host(&mut url, &self.config);

        let served = match &self.mode {
            ServeMode::Bound(origin) => {
                matches!(url.scheme(), "http" | "https") && host_key(&url) == host_key(origin)
            }
            ServeMode::CrossHost => classify_url(&url, &self.config).is_mirrored(),
        };
        served.then_some(url)
    }

    /// Reference to `target` as it should appear in a record, for a token
    /// resolved against `base`
    ///
    /// `None` leaves the reference untouched: either end is not served here,
    /// so the token keeps pointing at the live site.
    fn local_reference(&self, base: &Url, target: &Url) -> Option<String> {
        let base = self.served_form(base)?;
        let target = self.served_form(target)?;

        Some(match &self.mode {
            ServeMode::Bound(_) => reduce_url(base.as_str(), target.as_str()),
            ServeMode::CrossHost => {
                let base = format!("{}{}", CROSS_HOST_BASE, cross_host_path(&base));
                let target = format!("{}{}", CROSS_HOST_BASE, cross_host_path(&target));
                reduce_url(&base, &target)
            }
        })
    }

    /// Makes every served link of `text` local
    ///
    /// Each token is reduced against the base it was resolved against. A
    /// served `<base href>` is rewritten too, so the browser resolves the
    /// reduced tokens against the mirrored copy of that base.
    fn rewrite_body(&self, kind: MarkupKind, text: &str, page: &Url) -> String {
        let links = link_occurrences(kind, text, page);
        rewrite_links(text, &links, |link| {
            let local = self.local_reference(&link.base, &link.url)?;
            Some(if link.context.is_html_attribute() {
                local.replace('&', "&amp;")
            } else {
                local
            })
        })
    }

    fn entry_for(&self, result: &Downloaded, status: u16) -> CacheEntry {
        let mut entry = CacheEntry::new(result.url.clone(), status)
            .with_expires(expiry_after(self.config.cache.ttl()))
            .with_cross_host(self.mode.is_cross_host());

        if result.is_success() {
            let body = match result.markup() {
                Some((kind, text)) => self.rewrite_body(kind, text, &result.url).into_bytes(),
                None => result.body.as_bytes().to_vec(),
            };
            entry = entry.with_body(result.content_type.clone(), body);
        } else if let Some(target) = &result.redirect {
            let location = self
                .local_reference(&result.url, target)
                .unwrap_or_else(|| target.to_string());
            entry = entry.with_location(location);
        }

        entry
    }

    fn on_downloaded(&self, result: &Downloaded) {
        let status = match (&result.error, result.status) {
            (None, Some(status)) => status,
            (Some(e), _) => {
                self.wake(&result.url, Err(e.to_string()));
                return;
            }
            (None, None) => {
                self.wake(&result.url, Err("no response".to_string()));
                return;
            }
        };

        let entry = self.entry_for(result, status);
        let written = match self.store.write(&entry) {
            Err(CacheError::AlreadyExists(_)) => self.store.overwrite(&entry),
            other => other,
        };

        match written {
            Ok(()) => {
                tracing::debug!("Cached {} ({})", result.url, status);
                self.wake(&result.url, Ok(()));
            }
            Err(e) => {
                tracing::error!("Failed to cache {}: {}", result.url, e);
                self.wake(&result.url, Err(e.to_string()));
            }
        }
    }

    fn wake(&self, url: &Url, outcome: Result<(), String>) {
        let waiters = lock(&self.waiters).remove(url.as_str()).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Downloads `url` while the request waits
    async fn fetch_inline(&self, url: &Url) -> IssueAction {
        let (tx, rx) = oneshot::channel();
        let first = {
            let mut waiters = lock(&self.waiters);
            let list = waiters.entry(url.as_str().to_string()).or_default();
            list.push(tx);
            list.len() == 1
        };

        if first && self.store.exists(url) {
            // Another request's download finished in the meantime
            self.wake(url, Ok(()));
        } else if first {
            tracing::info!("Fetching {} on demand", url);
            self.mark_seen(url);
            if let Err(e) = self
                .store
                .write_placeholder(url, self.config.cache.placeholder_ttl())
            {
                tracing::warn!("Failed to write placeholder for {}: {}", url, e);
            }
            if let Err(e) = self.crawler.download(QueueItem::forced(url.clone(), 0)).await {
                self.wake(url, Err(e.to_string()));
            }
        }

        match tokio::time::timeout(self.config.server.inline_timeout(), rx).await {
            Ok(Ok(Ok(()))) => IssueAction::Retry,
            Ok(Ok(Err(reason))) => {
                tracing::warn!("On-demand fetch of {} failed: {}", url, reason);
                gateway_response(StatusCode::BAD_GATEWAY)
            }
            Ok(Err(_)) => gateway_response(StatusCode::BAD_GATEWAY),
            Err(_) => {
                tracing::warn!("On-demand fetch of {} timed out", url);
                let mut waiters = lock(&self.waiters);
                if let Some(list) = waiters.get_mut(url.as_str()) {
                    list.retain(|waiter| !waiter.is_closed());
                    if list.is_empty() {
                        waiters.remove(url.as_str());
                    }
                }
                gateway_response(StatusCode::GATEWAY_TIMEOUT)
            }
        }
    }

    async fn refetch(&self, url: &Url) {
        self.mark_seen(url);
        if let Err(e) = self.crawler.download(QueueItem::forced(url.clone(), 0)).await {
            tracing::warn!("Failed to queue refetch of {}: {}", url, e);
        }
    }
}

#[async_trait]
impl IssueHandler for Shared {
    async fn on_issue(&self, issue: &Issue) -> IssueAction {
        let Some(url) = issue.url.as_ref().filter(|url| self.is_mirrored(url)) else {
            return IssueAction::Default;
        };

        match issue.kind {
            IssueKind::CacheNotFound => self.fetch_inline(url).await,
            IssueKind::CacheError => {
                tracing::warn!(
                    "Broken cache record for {}: {}",
                    url,
                    issue.error.as_deref().unwrap_or("unknown error")
                );
                if let Err(e) = self
                    .store
                    .write_placeholder(url, self.config.cache.placeholder_ttl())
                {
                    tracing::warn!("Failed to write placeholder for {}: {}", url, e);
                }
                self.refetch(url).await;
                IssueAction::Default
            }
            IssueKind::CacheExpired => {
                tracing::debug!("Refreshing expired record for {}", url);
                if let Err(e) = self.store.bump(url, self.config.cache.placeholder_ttl()) {
                    tracing::warn!("Failed to bump {}: {}", url, e);
                }
                self.refetch(url).await;
                IssueAction::Default
            }
            IssueKind::MethodNotAllowed | IssueKind::CrossHostInvalidPath => IssueAction::Default,
        }
    }
}

/// A crawling, self-refilling mirror
///
/// Owns the policy connecting a [`Crawler`] to a [`CacheStore`] and a
/// [`ServeEngine`]. The crawler should be configured (workers, depth) but not
/// started; its hooks are replaced here.
pub struct Mirror {
    shared: Arc<Shared>,
    engine: Arc<ServeEngine>,
}

impl Mirror {
    pub fn new(config: Config, store: Arc<CacheStore>, crawler: Crawler) -> Result<Self, MirrorError> {
        let mode = if config.server.cross_host {
            ServeMode::CrossHost
        } else {
            let origin = config.server.origin.as_deref().ok_or_else(|| {
                crate::ConfigError::Validation("server.origin is required".to_string())
            })?;
            ServeMode::Bound(require_absolute(origin)?)
        };

        let shared = Arc::new(Shared {
            config,
            mode: mode.clone(),
            store: Arc::clone(&store),
            crawler: crawler.clone(),
            seen: Mutex::new(HashSet::new()),
            waiters: Mutex::new(HashMap::new()),
        });

        // Hooks hold weak references: the crawler is owned by `shared`
        let weak = Arc::downgrade(&shared);
        crawler.set_on_url_should_queue(move |url: &Url| {
            weak.upgrade().is_some_and(|shared| shared.should_queue(url))
        });
        let weak = Arc::downgrade(&shared);
        crawler.set_on_url_should_download(move |url: &Url| {
            weak.upgrade().is_some_and(|shared| shared.should_download(url))
        });
        let weak = Arc::downgrade(&shared);
        crawler.set_on_downloaded(move |result: &Downloaded| {
            if let Some(shared) = weak.upgrade() {
                shared.on_downloaded(result);
            }
        });
        let weak = Arc::downgrade(&shared);
        crawler.set_url_rewriter(move |url: &mut Url| {
            if let Some(shared) = weak.upgrade() {
                rewrite_host(url, &shared.config);
            }
        });

        let engine = Arc::new(ServeEngine::new(store, mode));
        engine.set_issue_handler(Arc::clone(&shared) as Arc<dyn IssueHandler>);

        Ok(Self { shared, engine })
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn crawler(&self) -> &Crawler {
        &self.shared.crawler
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.shared.store
    }

    pub fn engine(&self) -> &Arc<ServeEngine> {
        &self.engine
    }

    pub fn router(&self) -> Router {
        self.engine.router()
    }

    /// Queues every configured seed at depth 0
    ///
    /// Returns how many seeds were queued. Seeds already cached are skipped
    /// by the crawler when dequeued.
    pub async fn seed(&self) -> Result<usize, MirrorError> {
        let mut queued = 0;

        for site in &self.shared.config.site {
            for seed in &site.seeds {
                let mut item = QueueItem::parse(seed, 0)?;
                rewrite_host(&mut item.url, &self.shared.config);
                if !self.shared.mark_seen(&item.url) {
                    continue;
                }
                self.shared.crawler.enqueue(item).await?;
                queued += 1;
            }
        }

        tracing::info!("Queued {} seed URLs", queued);
        Ok(queued)
    }

    /// Stops serving, then stops the crawler
    pub async fn stop(&self) {
        self.engine.stop();
        self.shared.crawler.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryFs;
    use crate::config::{
        CacheConfig, CrawlerConfig, RewriteEntry, ServerConfig, SiteEntry, UserAgentConfig,
    };

    fn test_config(cross_host: bool) -> Config {
        Config {
            crawler: CrawlerConfig {
                workers: 1,
                auto_download_depth: 1,
                queue_capacity: 16,
            },
            user_agent: UserAgentConfig {
                crawler_name: "TestMirror".to_string(),
                crawler_version: "1.0".to_string(),
                contact_url: "https://example.com/about".to_string(),
                contact_email: "admin@example.com".to_string(),
            },
            cache: CacheConfig {
                root: "/cache".to_string(),
                ttl: 60,
                placeholder_ttl: 5,
            },
            server: ServerConfig {
                listen: "127.0.0.1:0".to_string(),
                cross_host,
                origin: (!cross_host).then(|| "https://example.com".to_string()),
                inline_timeout: 1,
            },
            site: vec![
                SiteEntry {
                    host: "example.com".to_string(),
                    seeds: vec!["https://example.com/".to_string()],
                },
                SiteEntry {
                    host: "cdn.example.org".to_string(),
                    seeds: vec![],
                },
            ],
            rewrite: vec![RewriteEntry {
                from: "www.example.com".to_string(),
                to: "example.com".to_string(),
            }],
        }
    }

    fn mirror(cross_host: bool) -> Mirror {
        let store = Arc::new(CacheStore::new(Arc::new(MemoryFs::new()), "/cache").unwrap());
        let crawler = Crawler::new(reqwest::Client::new(), 16);
        Mirror::new(test_config(cross_host), store, crawler).unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_cross_host_path() {
        assert_eq!(
            cross_host_path(&url("https://example.com:8443/a/b?c=d")),
            "/https/example.com:8443/a/b?c=d"
        );
    }

    #[test]
    fn test_bound_local_reference() {
        let mirror = mirror(false);
        let page = url("https://example.com/docs/index.html");
        assert_eq!(
            mirror
                .shared
                .local_reference(&page, &url("https://example.com/docs/guide.html")),
            Some("./guide.html".to_string())
        );
        assert_eq!(
            mirror
                .shared
                .local_reference(&page, &url("https://www.example.com/img/logo.png")),
            Some("../img/logo.png".to_string())
        );
        assert_eq!(
            mirror
                .shared
                .local_reference(&page, &url("https://cdn.example.org/x.js")),
            None
        );
    }

    #[test]
    fn test_cross_host_local_reference() {
        let mirror = mirror(true);
        let page = url("https://example.com/docs/index.html");
        assert_eq!(
            mirror
                .shared
                .local_reference(&page, &url("https://cdn.example.org/x.js")),
            Some("../../cdn.example.org/x.js".to_string())
        );
        assert_eq!(
            mirror
                .shared
                .local_reference(&page, &url("https://other.net/")),
            None
        );
    }

    #[test]
    fn test_rewrite_body_escapes_attributes() {
        let mirror = mirror(false);
        let page = url("https://example.com/");
        let html = r#"<a href="https://example.com/s?a=1&amp;b=2">s</a><a href="https://other.net/">o</a>"#;
        let rewritten = mirror.shared.rewrite_body(MarkupKind::Html, html, &page);
        assert_eq!(
            rewritten,
            r#"<a href="./s?a=1&amp;b=2">s</a><a href="https://other.net/">o</a>"#
        );
    }

    #[test]
    fn test_rewrite_body_follows_base_href() {
        let mirror = mirror(false);
        let page = url("https://example.com/index.html");
        let html = r#"<base href="/docs/"><a href="guide.html">g</a>"#;
        let rewritten = mirror.shared.rewrite_body(MarkupKind::Html, html, &page);
        assert_eq!(rewritten, r#"<base href="./docs/"><a href="./guide.html">g</a>"#);

        // Resolved the way a browser does, the link lands on the same page
        let base = page.join("./docs/").unwrap();
        assert_eq!(
            base.join("./guide.html").unwrap().as_str(),
            "https://example.com/docs/guide.html"
        );
    }

    #[test]
    fn test_rewrite_body_moves_cross_host_base() {
        let mirror = mirror(true);
        let page = url("https://example.com/index.html");
        let html = r#"<base href="https://cdn.example.org/lib/"><script src="x.js"></script>"#;
        let rewritten = mirror.shared.rewrite_body(MarkupKind::Html, html, &page);
        assert_eq!(
            rewritten,
            r#"<base href="../cdn.example.org/lib/"><script src="./x.js"></script>"#
        );
    }

    #[test]
    fn test_rewrite_body_keeps_foreign_base() {
        let mirror = mirror(false);
        let page = url("https://example.com/index.html");
        let html = r#"<base href="https://other.net/"><a href="https://example.com/a">a</a><a href="b">b</a>"#;
        let rewritten = mirror.shared.rewrite_body(MarkupKind::Html, html, &page);
        assert_eq!(rewritten, html);
    }

    #[test]
    fn test_should_queue_dedups_and_filters() {
        let mirror = mirror(false);
        assert!(mirror.shared.should_queue(&url("https://example.com/a")));
        assert!(!mirror.shared.should_queue(&url("https://example.com/a")));
        assert!(!mirror.shared.should_queue(&url("https://other.net/a")));
        assert!(!mirror.shared.should_queue(&url("ftp://example.com/a")));
    }

    #[test]
    fn test_bound_mode_requires_origin() {
        let mut config = test_config(false);
        config.server.origin = None;
        let store = Arc::new(CacheStore::new(Arc::new(MemoryFs::new()), "/cache").unwrap());
        let crawler = Crawler::new(reqwest::Client::new(), 4);
        assert!(matches!(
            Mirror::new(config, store, crawler),
            Err(MirrorError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_issue_for_foreign_host_uses_default() {
        let mirror = mirror(true);
        let issue = Issue::new(
            IssueKind::CacheNotFound,
            "/https/other.net/",
            Some(url("https://other.net/")),
        );
        assert!(matches!(
            mirror.shared.on_issue(&issue).await,
            IssueAction::Default
        ));
    }

    #[tokio::test]
    async fn test_inline_fetch_reports_stopped_crawler() {
        let mirror = mirror(false);
        mirror.crawler().stop().await;
        let issue = Issue::new(
            IssueKind::CacheNotFound,
            "/missing",
            Some(url("https://example.com/missing")),
        );
        match mirror.shared.on_issue(&issue).await {
            IssueAction::Respond(response) => assert_eq!(response.status(), StatusCode::BAD_GATEWAY),
            _ => panic!("expected a 502 response"),
        }
        // The placeholder stays until a download replaces it
        assert!(!mirror.store().exists(&url("https://example.com/missing")));
    }
}

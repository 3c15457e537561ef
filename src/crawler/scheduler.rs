//! Worker pool that drives downloads
//!
//! This module handles:
//! - A bounded work queue shared by a fixed pool of worker tasks
//! - Injected policy (should-queue / should-download / URL rewriting)
//! - Delivery by callback (push) or through a result channel (pull)
//! - Requeueing discovered links on a separate forwarding task
//! - Idle detection and cooperative shutdown

use crate::crawler::fetcher::{download, Downloaded};
use crate::url::require_absolute;
use crate::UrlResult;
use futures::FutureExt;
use reqwest::Client;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use url::Url;

/// Errors returned synchronously by the crawler
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("Invalid worker count: {0} (must be >= 1)")]
    InvalidWorkerCount(usize),

    #[error("Crawler is already running")]
    AlreadyRunning,

    #[error("Crawler is stopped")]
    Stopped,
}

/// A URL waiting to be downloaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub url: Url,
    /// Hops from the seed that led here
    pub depth: u32,
    /// Skip the should-download check
    pub force: bool,
}

impl QueueItem {
    pub fn new(url: Url, depth: u32) -> Self {
        Self {
            url,
            depth,
            force: false,
        }
    }

    pub fn forced(url: Url, depth: u32) -> Self {
        Self {
            url,
            depth,
            force: true,
        }
    }

    /// Parses `input`, which must be an absolute URL
    pub fn parse(input: &str, depth: u32) -> UrlResult<Self> {
        Ok(Self::new(require_absolute(input)?, depth))
    }
}

/// Yes/no policy on a URL
pub trait UrlPredicate: Send + Sync {
    fn check(&self, url: &Url) -> bool;
}

impl<F> UrlPredicate for F
where
    F: Fn(&Url) -> bool + Send + Sync,
{
    fn check(&self, url: &Url) -> bool {
        self(url)
    }
}

/// Receives every finished download
pub trait DownloadSink: Send + Sync {
    fn on_downloaded(&self, result: &Downloaded);
}

impl<F> DownloadSink for F
where
    F: Fn(&Downloaded) + Send + Sync,
{
    fn on_downloaded(&self, result: &Downloaded) {
        self(result)
    }
}

/// Adjusts a discovered URL before it is queued
pub trait UrlRewriter: Send + Sync {
    fn rewrite(&self, url: &mut Url);
}

impl<F> UrlRewriter for F
where
    F: Fn(&mut Url) + Send + Sync,
{
    fn rewrite(&self, url: &mut Url) {
        self(url)
    }
}

/// Crawler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

type Hook<T> = RwLock<Option<Arc<T>>>;

struct Inner {
    client: Client,

    work_tx: mpsc::Sender<QueueItem>,
    work_rx: Mutex<mpsc::Receiver<QueueItem>>,
    child_tx: mpsc::UnboundedSender<QueueItem>,
    child_rx: StdMutex<Option<mpsc::UnboundedReceiver<QueueItem>>>,
    results_tx: StdMutex<Option<mpsc::UnboundedSender<Downloaded>>>,
    results_rx: Mutex<mpsc::UnboundedReceiver<Downloaded>>,

    should_queue: Hook<dyn UrlPredicate>,
    should_download: Hook<dyn UrlPredicate>,
    sink: Hook<dyn DownloadSink>,
    rewriter: Hook<dyn UrlRewriter>,

    state: StdMutex<CrawlerState>,
    worker_count: AtomicUsize,
    max_depth: AtomicU32,

    /// Items enqueued or forwarded but not yet finished
    outstanding: AtomicUsize,
    idle: Notify,

    queued: AtomicU64,
    downloaded: AtomicU64,
    links_found: AtomicU64,

    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn hook<T: ?Sized>(slot: &Hook<T>) -> Option<Arc<T>> {
    match slot.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn set_hook<T: ?Sized>(slot: &Hook<T>, value: Arc<T>) {
    let mut guard = slot.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Some(value);
}

impl Inner {
    fn state(&self) -> CrawlerState {
        *lock(&self.state)
    }

    fn is_stopping(&self) -> bool {
        matches!(self.state(), CrawlerState::Stopping | CrawlerState::Stopped)
    }

    fn finish(&self, n: usize) {
        if self.outstanding.fetch_sub(n, Ordering::SeqCst) == n {
            self.idle.notify_waiters();
        }
    }

    async fn enqueue(&self, item: QueueItem) -> Result<(), CrawlerError> {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.is_stopping() {
            self.finish(1);
            return Err(CrawlerError::Stopped);
        }

        self.queued.fetch_add(1, Ordering::SeqCst);
        tracing::trace!("Queued {} at depth {}", item.url, item.depth);

        if self.work_tx.send(item).await.is_err() {
            self.finish(1);
            return Err(CrawlerError::Stopped);
        }
        Ok(())
    }

    async fn process(&self, item: QueueItem) {
        if !item.force {
            if let Some(predicate) = hook(&self.should_download) {
                if !predicate.check(&item.url) {
                    tracing::debug!("Skipping {}: already available", item.url);
                    return;
                }
            }
        }

        let result = download(&self.client, &item.url).await;
        self.downloaded.fetch_add(1, Ordering::SeqCst);
        self.links_found
            .fetch_add(result.links.len() as u64, Ordering::SeqCst);

        match (&result.status, &result.error) {
            (_, Some(e)) => tracing::warn!("Download of {} failed: {}", item.url, e),
            (Some(status), None) => tracing::debug!(
                "Downloaded {} ({}, {} links)",
                item.url,
                status,
                result.links.len()
            ),
            (None, None) => {}
        }

        let child_depth = item.depth.saturating_add(1);
        let children: Vec<Url> = if child_depth <= self.max_depth.load(Ordering::SeqCst) {
            result.links.iter().map(|link| link.url.clone()).collect()
        } else {
            Vec::new()
        };

        match hook(&self.sink) {
            Some(sink) => sink.on_downloaded(&result),
            None => {
                if let Some(tx) = lock(&self.results_tx).as_ref() {
                    // The receiver lives as long as `self`
                    let _ = tx.send(result);
                }
            }
        }

        for url in children {
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            if self.child_tx.send(QueueItem::new(url, child_depth)).is_err() {
                self.finish(1);
            }
        }
    }

    async fn forward(&self, mut item: QueueItem) {
        if let Some(rewriter) = hook(&self.rewriter) {
            rewriter.rewrite(&mut item.url);
        }

        if let Some(predicate) = hook(&self.should_queue) {
            if !predicate.check(&item.url) {
                return;
            }
        }
        if let Some(predicate) = hook(&self.should_download) {
            if !predicate.check(&item.url) {
                return;
            }
        }

        if let Err(e) = self.enqueue(item).await {
            tracing::debug!("Dropped discovered link: {}", e);
        }
    }
}

async fn run_worker(id: usize, inner: Arc<Inner>) {
    tracing::trace!("Worker {} started", id);
    loop {
        let item = {
            let mut rx = inner.work_rx.lock().await;
            rx.recv().await
        };
        let Some(item) = item else {
            break;
        };

        if !inner.is_stopping() {
            let url = item.url.clone();
            // A panicking hook must not take the worker or the count with it
            if AssertUnwindSafe(inner.process(item)).catch_unwind().await.is_err() {
                tracing::error!("Worker {} panicked while processing {}", id, url);
            }
        }
        inner.finish(1);
    }
}

async fn run_forwarder(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
    while let Some(item) = rx.recv().await {
        if !inner.is_stopping() {
            let url = item.url.clone();
            if AssertUnwindSafe(inner.forward(item)).catch_unwind().await.is_err() {
                tracing::error!("Forwarder panicked while checking {}", url);
            }
        }
        inner.finish(1);
    }
}

/// Bounded worker pool that downloads queued URLs
///
/// The crawler is created idle; configure it, then call [`Crawler::start`].
/// Cloning is cheap and every clone drives the same pool.
///
/// # Example
///
/// ```no_run
/// use site_mirror::crawler::{Crawler, QueueItem};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let crawler = Crawler::new(reqwest::Client::new(), 64);
/// crawler.set_worker_count(4)?;
/// crawler.set_auto_download_depth(1);
/// crawler.start();
///
/// crawler.enqueue(QueueItem::parse("https://example.com/", 0)?).await?;
/// while let Some(result) = crawler.next().await {
///     println!("{} -> {:?}", result.url, result.status);
///     if !crawler.is_busy() {
///         break;
///     }
/// }
/// crawler.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Crawler {
    inner: Arc<Inner>,
}

impl Crawler {
    /// Creates an idle crawler with one worker and depth 0
    pub fn new(client: Client, queue_capacity: usize) -> Self {
        let (work_tx, work_rx) = mpsc::channel(queue_capacity.max(1));
        let (child_tx, child_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(Inner {
                client,
                work_tx,
                work_rx: Mutex::new(work_rx),
                child_tx,
                child_rx: StdMutex::new(Some(child_rx)),
                results_tx: StdMutex::new(Some(results_tx)),
                results_rx: Mutex::new(results_rx),
                should_queue: RwLock::new(None),
                should_download: RwLock::new(None),
                sink: RwLock::new(None),
                rewriter: RwLock::new(None),
                state: StdMutex::new(CrawlerState::Idle),
                worker_count: AtomicUsize::new(1),
                max_depth: AtomicU32::new(0),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                queued: AtomicU64::new(0),
                downloaded: AtomicU64::new(0),
                links_found: AtomicU64::new(0),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> CrawlerState {
        self.inner.state()
    }

    /// Sets the pool size; only allowed before [`Crawler::start`]
    pub fn set_worker_count(&self, count: usize) -> Result<(), CrawlerError> {
        if self.state() != CrawlerState::Idle {
            return Err(CrawlerError::AlreadyRunning);
        }
        if count < 1 {
            return Err(CrawlerError::InvalidWorkerCount(count));
        }
        self.inner.worker_count.store(count, Ordering::SeqCst);
        Ok(())
    }

    /// Links found more than `depth` hops from a seed are not queued
    pub fn set_auto_download_depth(&self, depth: u32) {
        self.inner.max_depth.store(depth, Ordering::SeqCst);
    }

    pub fn set_on_url_should_queue(&self, predicate: impl UrlPredicate + 'static) {
        set_hook(&self.inner.should_queue, Arc::new(predicate) as Arc<dyn UrlPredicate>);
    }

    /// Also consulted when a non-forced item is dequeued
    pub fn set_on_url_should_download(&self, predicate: impl UrlPredicate + 'static) {
        set_hook(&self.inner.should_download, Arc::new(predicate) as Arc<dyn UrlPredicate>);
    }

    /// Switches delivery from the pull channel to `sink`
    pub fn set_on_downloaded(&self, sink: impl DownloadSink + 'static) {
        set_hook(&self.inner.sink, Arc::new(sink) as Arc<dyn DownloadSink>);
    }

    pub fn set_url_rewriter(&self, rewriter: impl UrlRewriter + 'static) {
        set_hook(&self.inner.rewriter, Arc::new(rewriter) as Arc<dyn UrlRewriter>);
    }

    /// Spawns the workers and the forwarder
    ///
    /// Calling it again, or after [`Crawler::stop`], does nothing. Must be
    /// called from within a tokio runtime.
    pub fn start(&self) {
        let mut state = lock(&self.inner.state);
        if *state != CrawlerState::Idle {
            return;
        }
        *state = CrawlerState::Running;

        let workers = self.inner.worker_count.load(Ordering::SeqCst);
        let mut tasks = lock(&self.inner.tasks);
        for id in 0..workers {
            tasks.push(tokio::spawn(run_worker(id, Arc::clone(&self.inner))));
        }
        if let Some(rx) = lock(&self.inner.child_rx).take() {
            tasks.push(tokio::spawn(run_forwarder(Arc::clone(&self.inner), rx)));
        }

        tracing::info!("Crawler started with {} workers", workers);
    }

    /// Queues `item`, waiting while the queue is full
    pub async fn enqueue(&self, item: QueueItem) -> Result<(), CrawlerError> {
        self.inner.enqueue(item).await
    }

    /// Queues `item` so it is fetched even if it would be skipped otherwise
    pub async fn download(&self, item: QueueItem) -> Result<(), CrawlerError> {
        self.inner
            .enqueue(QueueItem {
                force: true,
                ..item
            })
            .await
    }

    /// Waits for the next result (pull mode)
    ///
    /// Returns `None` once the crawler is stopped and every result was read.
    pub async fn next(&self) -> Option<Downloaded> {
        self.inner.results_rx.lock().await.recv().await
    }

    /// Returns a result if one is ready (pull mode)
    pub fn next_or_none(&self) -> Option<Downloaded> {
        self.inner.results_rx.try_lock().ok()?.try_recv().ok()
    }

    /// True while any queued item has not been delivered yet
    pub fn is_busy(&self) -> bool {
        self.inner.outstanding.load(Ordering::SeqCst) > 0
    }

    /// Waits until nothing is queued or in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_busy() {
                return;
            }
            notified.await;
        }
    }

    /// Stops the crawler
    ///
    /// Items already being downloaded are finished and delivered; queued items
    /// that no worker picked up yet are discarded. No callback runs after this
    /// returns. Safe to call more than once.
    pub async fn stop(&self) {
        let previous = {
            let mut state = lock(&self.inner.state);
            let previous = *state;
            if matches!(previous, CrawlerState::Idle | CrawlerState::Running) {
                *state = CrawlerState::Stopping;
            }
            previous
        };

        match previous {
            CrawlerState::Stopped => return,
            CrawlerState::Idle => {
                // No workers: drain the queue here, including sends that were
                // blocked on a full queue when the state changed
                let mut rx = self.inner.work_rx.lock().await;
                while self.is_busy() {
                    tokio::select! {
                        item = rx.recv() => match item {
                            Some(_) => self.inner.finish(1),
                            None => break,
                        },
                        _ = self.wait_idle() => {}
                    }
                }
            }
            CrawlerState::Running | CrawlerState::Stopping => {}
        }

        self.wait_idle().await;

        {
            let mut state = lock(&self.inner.state);
            if *state == CrawlerState::Stopped {
                return;
            }
            *state = CrawlerState::Stopped;
        }

        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        lock(&self.inner.results_tx).take();

        tracing::info!(
            "Crawler stopped: {} queued, {} downloaded, {} links found",
            self.queued_count(),
            self.downloaded_count(),
            self.link_found_count()
        );
    }

    pub fn queued_count(&self) -> u64 {
        self.inner.queued.load(Ordering::SeqCst)
    }

    pub fn downloaded_count(&self) -> u64 {
        self.inner.downloaded.load(Ordering::SeqCst)
    }

    pub fn link_found_count(&self) -> u64 {
        self.inner.links_found.load(Ordering::SeqCst)
    }
}

use crate::cache::{BoxRead, CacheStore, RecordError, RecordReader};
use crate::server::issue::{Issue, IssueAction, IssueHandler, IssueKind, ResponseState};
use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use chrono::Utc;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use url::Url;

const CHUNK_SIZE: usize = 64 * 1024;

/// How request paths map to cached URLs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeMode {
    /// Every request path is looked up on this origin
    Bound(Url),
    /// Request paths carry the URL: `/<scheme>/<host>/<path>`
    CrossHost,
}

impl ServeMode {
    pub fn is_cross_host(&self) -> bool {
        matches!(self, Self::CrossHost)
    }
}

/// Why a request path does not name a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRejection {
    /// `/<scheme>/<host>` without a path: redirect here
    Redirect(String),
    Invalid(String),
}

/// Maps a cross-host request to its URL
///
/// # Examples
///
/// ```
/// use axum::http::Uri;
/// use site_mirror::server::{parse_cross_host, PathRejection};
///
/// let uri: Uri = "/https/example.com/a?b=1".parse().unwrap();
/// assert_eq!(parse_cross_host(&uri).unwrap().as_str(), "https://example.com/a?b=1");
///
/// let uri: Uri = "/https/example.com".parse().unwrap();
/// assert_eq!(
///     parse_cross_host(&uri),
///     Err(PathRejection::Redirect("/https/example.com/".to_string()))
/// );
/// ```
pub fn parse_cross_host(uri: &Uri) -> Result<Url, PathRejection> {
    let path = uri.path();
    let mut parts = path.strip_prefix('/').unwrap_or(path).splitn(3, '/');
    let scheme = parts.next().unwrap_or_default();
    let host = parts.next().unwrap_or_default();

    if scheme != "http" && scheme != "https" {
        return Err(PathRejection::Invalid(format!(
            "expected /http/ or /https/, got {:?}",
            path
        )));
    }
    if host.is_empty() || host.contains('@') {
        return Err(PathRejection::Invalid(format!("no usable host in {:?}", path)));
    }

    let Some(tail) = parts.next() else {
        let mut location = format!("{}/", path);
        if let Some(query) = uri.query() {
            location.push('?');
            location.push_str(query);
        }
        return Err(PathRejection::Redirect(location));
    };

    let mut text = format!("{}://{}/{}", scheme, host, tail);
    if let Some(query) = uri.query() {
        text.push('?');
        text.push_str(query);
    }

    let url = Url::parse(&text)
        .map_err(|e| PathRejection::Invalid(format!("{:?} is not a URL: {}", text, e)))?;
    if !url.has_host() {
        return Err(PathRejection::Invalid(format!("{:?} has no host", text)));
    }
    Ok(url)
}

enum Lookup {
    Found(RecordReader<BoxRead>),
    Missing(String),
    Broken(String),
}

enum PumpOutcome {
    Complete,
    Disconnected,
    Failed(RecordError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serves cached records over HTTP
///
/// Each request is looked up in the [`CacheStore`]:
///
/// | Lookup | Response | Issue |
/// |--------|----------|-------|
/// | fresh record | record, streamed | none |
/// | expired record | record, streamed | `CacheExpired` afterwards |
/// | no record / placeholder | handler's, or 404 | `CacheNotFound` |
/// | undecodable record | handler's, or 500 | `CacheError` |
///
/// Status and headers go out as soon as the record head is decoded; the body
/// is copied in chunks from a blocking task.
pub struct ServeEngine {
    store: Arc<CacheStore>,
    mode: ServeMode,
    handler: RwLock<Option<Arc<dyn IssueHandler>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    stopped: AtomicBool,
}

impl ServeEngine {
    pub fn new(store: Arc<CacheStore>, mode: ServeMode) -> Self {
        Self {
            store,
            mode,
            handler: RwLock::new(None),
            shutdown: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> &ServeMode {
        &self.mode
    }

    /// Installs the consumer of serving issues
    pub fn set_issue_handler(&self, handler: Arc<dyn IssueHandler>) {
        let mut slot = self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn IssueHandler>> {
        match self.handler.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Builds a router that sends every request through [`ServeEngine::serve`]
    pub fn router(self: &Arc<Self>) -> Router {
        let engine = Arc::clone(self);
        Router::new().fallback(move |method: Method, uri: Uri| {
            let engine = Arc::clone(&engine);
            async move { engine.serve(&method, &uri).await }
        })
    }

    /// Serves on `listener` until [`ServeEngine::stop`] is called
    pub async fn start(self: &Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let (tx, rx) = oneshot::channel::<()>();
        {
            let mut slot = lock(&self.shutdown);
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            *slot = Some(tx);
        }

        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Serving cache on http://{}", addr);
        }

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await
    }

    /// Begins a graceful shutdown; safe to call more than once
    pub fn stop(&self) {
        let mut slot = lock(&self.shutdown);
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = slot.take() {
            let _ = tx.send(());
        }
        tracing::info!("Serving engine stopping");
    }

    /// Maps the request to a cached URL
    pub fn lookup_url(&self, uri: &Uri) -> Result<Url, PathRejection> {
        match &self.mode {
            ServeMode::Bound(origin) => {
                let mut url = origin.clone();
                url.set_path(uri.path());
                url.set_query(uri.query());
                url.set_fragment(None);
                Ok(url)
            }
            ServeMode::CrossHost => parse_cross_host(uri),
        }
    }

    /// Answers one request from the cache
    pub async fn serve(&self, method: &Method, uri: &Uri) -> Response {
        let path = uri.path().to_string();
        tracing::debug!("{} {}", method, uri);

        if method != Method::GET && method != Method::HEAD {
            let issue = Issue::new(IssueKind::MethodNotAllowed, path, None)
                .with_error(format!("method {} not allowed", method));
            return self.respond_to(issue).await;
        }

        let url = match self.lookup_url(uri) {
            Ok(url) => url,
            Err(PathRejection::Redirect(location)) => return redirect(&location),
            Err(PathRejection::Invalid(reason)) => {
                let issue =
                    Issue::new(IssueKind::CrossHostInvalidPath, path, None).with_error(reason);
                return self.respond_to(issue).await;
            }
        };

        let mut retried = false;
        loop {
            let (kind, error) = match self.lookup(&url).await {
                Lookup::Found(record) => return self.stream(method, path, url, record),
                Lookup::Missing(reason) => (IssueKind::CacheNotFound, reason),
                Lookup::Broken(reason) => (IssueKind::CacheError, reason),
            };

            let issue = Issue::new(kind, path.clone(), Some(url.clone())).with_error(error);
            match self.raise(&issue).await {
                IssueAction::Retry if !retried => {
                    tracing::debug!("Retrying lookup of {}", url);
                    retried = true;
                }
                IssueAction::Respond(response) => return response,
                IssueAction::Retry | IssueAction::Default => return default_response(kind),
            }
        }
    }

    async fn raise(&self, issue: &Issue) -> IssueAction {
        match self.handler() {
            Some(handler) => handler.on_issue(issue).await,
            None => {
                tracing::debug!("Unhandled {:?} for {}", issue.kind, issue.path);
                IssueAction::Default
            }
        }
    }

    async fn respond_to(&self, issue: Issue) -> Response {
        match self.raise(&issue).await {
            IssueAction::Respond(response) => response,
            IssueAction::Default | IssueAction::Retry => default_response(issue.kind),
        }
    }

    async fn lookup(&self, url: &Url) -> Lookup {
        let store = Arc::clone(&self.store);
        let url = url.clone();

        let task = tokio::task::spawn_blocking(move || {
            let reader = match store.open(&url) {
                Ok(reader) => reader,
                Err(e) => return Lookup::Missing(e.to_string()),
            };
            match RecordReader::open(reader) {
                Ok(record) if record.head().is_placeholder() => {
                    Lookup::Missing(format!("download of {} in progress", url))
                }
                Ok(record) if StatusCode::from_u16(record.head().status).is_err() => {
                    Lookup::Broken(format!("invalid status {}", record.head().status))
                }
                Ok(record) => Lookup::Found(record),
                Err(e) => Lookup::Broken(e.to_string()),
            }
        });

        task.await
            .unwrap_or_else(|e| Lookup::Broken(format!("lookup task failed: {}", e)))
    }

    fn stream(
        &self,
        method: &Method,
        path: String,
        url: Url,
        record: RecordReader<BoxRead>,
    ) -> Response {
        let head = record.head().clone();

        let mut state = ResponseState {
            committed: true,
            status: Some(head.status),
            content_length: head.content_length().ok().flatten(),
            bytes_written: 0,
            expires: head.expires().ok().flatten(),
        };

        let stale = match head.expires() {
            Ok(Some(expires)) if expires <= Utc::now() => Some(format!("expired at {}", expires)),
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        }
        .or_else(|| {
            (head.is_cross_host() != self.mode.is_cross_host())
                .then(|| "record was written for the other serving mode".to_string())
        });

        let mut response = Response::new(Body::empty());
        *response.status_mut() =
            StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        for (name, value) in head.forwarded() {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => tracing::warn!("Skipping header {:?} in record for {}", name, url),
            }
        }

        let handler = self.handler();
        let expired = stale.map(|reason| {
            Issue::new(IssueKind::CacheExpired, path.clone(), Some(url.clone())).with_error(reason)
        });

        if method == Method::HEAD {
            drop(record);
            if let Some(issue) = expired {
                tokio::spawn(raise_committed(handler, issue.with_state(state)));
            }
            return response;
        }

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Result<Bytes, io::Error>>(8);
        let (done_tx, done_rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || pump(record, chunk_tx, done_tx));

        let chunks = futures::stream::poll_fn(move |cx| chunk_rx.poll_recv(cx));
        *response.body_mut() = Body::from_stream(chunks);

        tokio::spawn(async move {
            let (written, outcome) = done_rx.await.unwrap_or((0, PumpOutcome::Disconnected));
            state.bytes_written = written;

            match outcome {
                PumpOutcome::Failed(e) => {
                    tracing::warn!("Record for {} broke while streaming: {}", url, e);
                    let issue = Issue::new(IssueKind::CacheError, path, Some(url))
                        .with_state(state.clone())
                        .with_error(e);
                    raise_committed(handler.clone(), issue).await;
                }
                PumpOutcome::Disconnected => {
                    tracing::debug!("Client went away while streaming {}", url);
                }
                PumpOutcome::Complete => {}
            }

            if let Some(issue) = expired {
                raise_committed(handler, issue.with_state(state)).await;
            }
        });

        response
    }
}

/// Raises an issue whose response is already on its way; the action is moot
async fn raise_committed(handler: Option<Arc<dyn IssueHandler>>, issue: Issue) {
    match handler {
        Some(handler) => {
            handler.on_issue(&issue).await;
        }
        None => tracing::debug!("Unhandled {:?} for {}", issue.kind, issue.path),
    }
}

/// Copies the record body into the response channel
fn pump(
    mut record: RecordReader<BoxRead>,
    chunks: mpsc::Sender<Result<Bytes, io::Error>>,
    done: oneshot::Sender<(u64, PumpOutcome)>,
) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;

    let outcome = loop {
        match record.read_chunk(&mut buf) {
            Ok(0) => break PumpOutcome::Complete,
            Ok(n) => {
                if chunks
                    .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    break PumpOutcome::Disconnected;
                }
                written += n as u64;
            }
            Err(e) => {
                let _ = chunks.blocking_send(Err(io::Error::other(e.to_string())));
                break PumpOutcome::Failed(e);
            }
        }
    };

    let _ = done.send((written, outcome));
}

fn default_response(kind: IssueKind) -> Response {
    let status = kind
        .default_status()
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let reason = status.canonical_reason().unwrap_or("Error");
    (status, format!("{}\n", reason)).into_response()
}

fn redirect(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, value)]).into_response(),
        Err(_) => default_response(IssueKind::CrossHostInvalidPath),
    }
}

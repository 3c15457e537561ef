use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::Response;
use chrono::{DateTime, Utc};
use url::Url;

/// What went wrong while serving a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IssueKind {
    /// Neither GET nor HEAD
    MethodNotAllowed,
    /// No record, or only a placeholder
    CacheNotFound,
    /// The record could not be decoded
    CacheError,
    /// The record was served but is stale
    CacheExpired,
    /// A cross-host request path that names no URL
    CrossHostInvalidPath,
}

impl IssueKind {
    /// Status answered when no handler overrides it
    ///
    /// `CacheExpired` is raised after the response was sent and has none.
    pub fn default_status(&self) -> Option<StatusCode> {
        match self {
            Self::MethodNotAllowed => Some(StatusCode::METHOD_NOT_ALLOWED),
            Self::CacheNotFound => Some(StatusCode::NOT_FOUND),
            Self::CacheError => Some(StatusCode::INTERNAL_SERVER_ERROR),
            Self::CacheExpired => None,
            Self::CrossHostInvalidPath => Some(StatusCode::BAD_REQUEST),
        }
    }
}

/// Snapshot of the response at the time an issue was raised
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseState {
    /// Status and headers were already sent
    pub committed: bool,
    pub status: Option<u16>,
    /// Declared body length
    pub content_length: Option<u64>,
    pub bytes_written: u64,
    pub expires: Option<DateTime<Utc>>,
}

/// A structured serving problem handed to the [`IssueHandler`]
#[derive(Debug, Clone)]
pub struct Issue {
    pub kind: IssueKind,
    /// Request path as received
    pub path: String,
    /// URL the request was mapped to, when there is one
    pub url: Option<Url>,
    pub state: ResponseState,
    pub error: Option<String>,
}

impl Issue {
    pub fn new(kind: IssueKind, path: impl Into<String>, url: Option<Url>) -> Self {
        Self {
            kind,
            path: path.into(),
            url,
            state: ResponseState::default(),
            error: None,
        }
    }

    pub fn with_state(mut self, state: ResponseState) -> Self {
        self.state = state;
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// How the engine should continue after an issue
///
/// Ignored for issues raised after the response was committed.
pub enum IssueAction {
    /// Answer with the kind's default status
    Default,
    /// Look the record up again (at most once per request)
    Retry,
    /// Answer with this response
    Respond(Response),
}

/// Reacts to serving issues, typically by refilling the cache
#[async_trait]
pub trait IssueHandler: Send + Sync {
    async fn on_issue(&self, issue: &Issue) -> IssueAction;
}

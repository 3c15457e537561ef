//! Serving cached records over HTTP
//!
//! The engine maps request paths to URLs, streams matching records and
//! reports everything it cannot answer on its own as an [`Issue`].

mod engine;
mod issue;

pub use engine::{parse_cross_host, PathRejection, ServeEngine, ServeMode};
pub use issue::{Issue, IssueAction, IssueHandler, IssueKind, ResponseState};

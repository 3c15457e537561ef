//! Crawler module for downloading pages and discovering links
//!
//! This module contains the core crawling logic, including:
//! - A byte-offset tokenizer for HTML tags and CSS `url()` tokens
//! - Link extraction with offsets suitable for rewriting bodies
//! - HTTP downloading that never follows redirects
//! - A worker pool with injected policy and idle detection

mod fetcher;
mod markup;
mod parser;
mod scheduler;

pub use fetcher::{build_http_client, download, Body, DownloadError, Downloaded};
pub use parser::{extract_links, link_occurrences, rewrite_links, Link, LinkContext, MarkupKind};
pub use scheduler::{
    Crawler, CrawlerError, CrawlerState, DownloadSink, QueueItem, UrlPredicate, UrlRewriter,
};

//! Site-Mirror: a crawling, caching mirror for static sites
//!
//! This crate crawls a remote site, persists every response into a
//! content-addressed on-disk cache and serves that cache back over HTTP,
//! re-fetching on demand when a record is missing, broken or expired.

pub mod cache;
pub mod config;
pub mod crawler;
pub mod mirror;
pub mod output;
pub mod server;
pub mod url;

use thiserror::Error;

/// Main error type for Site-Mirror operations
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] cache::CacheError),

    #[error("Crawler error: {0}")]
    Crawler(#[from] crawler::CrawlerError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid host: {0}")]
    InvalidHost(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("URL is not absolute: {0}")]
    NotAbsolute(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing host in URL")]
    MissingHost,
}

/// Result type alias for Site-Mirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheStore};
pub use config::Config;
pub use crawler::{Crawler, Downloaded, QueueItem};
pub use mirror::Mirror;
pub use server::{Issue, IssueKind, ServeEngine, ServeMode};
pub use self::url::{longest_common_prefix, reduce_url, resolve};

use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Site-Mirror
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub site: Vec<SiteEntry>,
    #[serde(default)]
    pub rewrite: Vec<RewriteEntry>,
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CrawlerConfig {
    /// Number of download workers
    pub workers: u32,

    /// Discovered links deeper than this are not queued automatically
    #[serde(rename = "auto-download-depth")]
    pub auto_download_depth: u32,

    /// Capacity of the work queue; a full queue blocks producers
    #[serde(rename = "queue-capacity", default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    256
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

/// On-disk cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Cache root directory; relative paths resolve against the working directory
    pub root: String,

    /// Lifetime of a freshly downloaded record (seconds)
    pub ttl: u64,

    /// Lifetime of a placeholder or a bumped record (seconds)
    #[serde(rename = "placeholder-ttl")]
    pub placeholder_ttl: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn placeholder_ttl(&self) -> Duration {
        Duration::from_secs(self.placeholder_ttl)
    }
}

/// HTTP serving configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to listen on
    pub listen: String,

    /// Serve every mirrored host under `/<scheme>/<host>/...`
    #[serde(rename = "cross-host", default)]
    pub cross_host: bool,

    /// Origin served at `/` when not in cross-host mode
    #[serde(default)]
    pub origin: Option<String>,

    /// How long a request waits for an on-demand download (seconds)
    #[serde(rename = "inline-timeout", default = "default_inline_timeout")]
    pub inline_timeout: u64,
}

fn default_inline_timeout() -> u64 {
    30
}

impl ServerConfig {
    pub fn inline_timeout(&self) -> Duration {
        Duration::from_secs(self.inline_timeout)
    }
}

/// Mirrored site with seed URLs
#[derive(Debug, Clone, Deserialize)]
pub struct SiteEntry {
    /// Host pattern (e.g., "example.com" or "*.example.com")
    pub host: String,

    /// List of seed URLs to start crawling from
    #[serde(default)]
    pub seeds: Vec<String>,
}

/// Host rewrite applied to discovered links before they are queued
#[derive(Debug, Clone, Deserialize)]
pub struct RewriteEntry {
    pub from: String,
    pub to: String,
}

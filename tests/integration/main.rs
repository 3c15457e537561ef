//! Integration tests for Site-Mirror
//!
//! Mock origins are served by wiremock; the serving engine is driven through
//! its axum router without a socket where possible.

mod crawl_tests;
mod mirror_tests;
mod serve_tests;

use site_mirror::config::UserAgentConfig;

/// A client that, like the mirror's, never follows redirects
pub fn test_client() -> reqwest::Client {
    site_mirror::crawler::build_http_client(&UserAgentConfig {
        crawler_name: "TestBot".to_string(),
        crawler_version: "1.0.0".to_string(),
        contact_url: "https://example.com/contact".to_string(),
        contact_email: "test@example.com".to_string(),
    })
    .expect("Failed to build HTTP client")
}

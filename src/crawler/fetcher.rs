//! HTTP downloader
//!
//! This module issues one GET per URL and classifies the response:
//! - 2xx HTML/CSS bodies are kept as text and scanned for links
//! - other 2xx bodies are kept as opaque bytes
//! - 3xx responses only record their `Location` (redirects are not followed)
//! - any other status is reported without a body
//! - transport failures are attached to the result, never raised

use crate::config::UserAgentConfig;
use crate::crawler::parser::{extract_links, Link, MarkupKind};
use reqwest::{header, redirect::Policy, Client};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Why a download did not fully succeed
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("URL is not absolute: {0}")]
    NonAbsoluteUrl(String),

    #[error("Request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("Failed to read response body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("Invalid Location header: {0:?}")]
    InvalidLocation(String),
}

/// Response body of a download
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Body {
    #[default]
    Empty,
    /// HTML or CSS, valid UTF-8
    Text(String),
    /// Anything else
    Bytes(Vec<u8>),
}

impl Body {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

/// Result of one download
#[derive(Debug)]
pub struct Downloaded {
    /// The URL that was requested
    pub url: Url,
    /// Base for resolving the body's relative links (changed by `<base href>`)
    pub base: Url,
    /// HTTP status, absent on transport failure
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub body: Body,
    /// Response headers in received order
    pub headers: Vec<(String, String)>,
    /// Resolved `Location` of a 3xx
    pub redirect: Option<Url>,
    /// Links found in the body, one per absolute URL
    pub links: Vec<Link>,
    pub error: Option<DownloadError>,
}

impl Downloaded {
    fn new(url: Url) -> Self {
        Self {
            base: url.clone(),
            url,
            status: None,
            content_type: None,
            body: Body::Empty,
            headers: Vec::new(),
            redirect: None,
            links: Vec::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|s| (200..300).contains(&s))
    }

    pub fn is_redirect(&self) -> bool {
        self.status.is_some_and(|s| (300..400).contains(&s))
    }

    /// Text of the body when it is HTML or CSS
    pub fn markup(&self) -> Option<(MarkupKind, &str)> {
        let kind = MarkupKind::from_content_type(self.content_type.as_deref()?)?;
        Some((kind, self.body.as_text()?))
    }
}

/// Builds an HTTP client with proper configuration
///
/// Redirects are never followed: the mirror caches the 3xx itself.
///
/// # Arguments
///
/// * `config` - The user agent configuration
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
///
/// # Example
///
/// ```no_run
/// use site_mirror::config::UserAgentConfig;
/// use site_mirror::crawler::build_http_client;
///
/// let config = UserAgentConfig {
///     crawler_name: "SiteMirror".to_string(),
///     crawler_version: "1.0".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(&config).unwrap();
/// ```
pub fn build_http_client(config: &UserAgentConfig) -> Result<Client, reqwest::Error> {
    // Format: CrawlerName/Version (+ContactURL; ContactEmail)
    let user_agent = format!(
        "{}/{} (+{}; {})",
        config.crawler_name, config.crawler_version, config.contact_url, config.contact_email
    );

    Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::none())
        .gzip(true)
        .brotli(true)
        .build()
}

fn is_fetchable(url: &Url) -> bool {
    (url.scheme() == "http" || url.scheme() == "https") && url.has_host()
}

/// Downloads one URL
///
/// # Request Flow
///
/// | Outcome | Result |
/// |---------|--------|
/// | Not an absolute http(s) URL | `NonAbsoluteUrl`, no request |
/// | Transport failure | `Transport`, no status |
/// | 2xx `text/html` / `text/css` | text body + links |
/// | Other 2xx | byte body |
/// | 3xx | `redirect` from `Location` (`InvalidLocation` if unparsable) |
/// | Anything else | status and headers only |
pub async fn download(client: &Client, url: &Url) -> Downloaded {
    let mut result = Downloaded::new(url.clone());

    if !is_fetchable(url) {
        result.error = Some(DownloadError::NonAbsoluteUrl(url.to_string()));
        return result;
    }

    tracing::debug!("GET {}", url);

    let response = match client.get(url.clone()).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("Request to {} failed: {}", url, e);
            result.error = Some(DownloadError::Transport(e));
            return result;
        }
    };

    let status = response.status();
    result.status = Some(status.as_u16());
    result.headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    result.content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if status.is_redirection() {
        if let Some(location) = response.headers().get(header::LOCATION) {
            let location = String::from_utf8_lossy(location.as_bytes()).into_owned();
            match url.join(&location) {
                Ok(target) => result.redirect = Some(target),
                Err(_) => result.error = Some(DownloadError::InvalidLocation(location)),
            }
        }
        return result;
    }

    if !status.is_success() {
        return result;
    }

    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            result.error = Some(DownloadError::Body(e));
            return result;
        }
    };
    if bytes.is_empty() {
        return result;
    }

    let kind = result
        .content_type
        .as_deref()
        .and_then(MarkupKind::from_content_type);

    result.body = match kind {
        Some(kind) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => {
                let (base, links) = extract_links(kind, &text, url);
                result.base = base;
                result.links = links;
                Body::Text(text)
            }
            Err(e) => {
                tracing::debug!("{} is not UTF-8, skipping link extraction", url);
                Body::Bytes(e.into_bytes())
            }
        },
        None => Body::Bytes(bytes.to_vec()),
    };

    result
}

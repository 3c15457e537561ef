//! URL handling module for Site-Mirror
//!
//! This module provides reference resolution, relative-URL reduction and
//! host classification against the configured mirror whitelist.

mod host;
mod resolve;

use crate::config::Config;

// Re-export main functions
pub use host::{host_key, matches_host};
pub use resolve::{longest_common_prefix, reduce_url, require_absolute, resolve};

use url::Url;

/// Host classification types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostClassification {
    /// Host is listed as a mirrored site
    Mirrored,
    /// Host is outside the mirror; links to it are left alone
    Foreign,
}

impl HostClassification {
    /// Returns true if URLs on this host should be crawled and cached
    pub fn is_mirrored(&self) -> bool {
        matches!(self, Self::Mirrored)
    }
}

/// Classifies a URL's host according to the configured sites
///
/// Only `http` and `https` URLs can be mirrored.
pub fn classify_url(url: &Url, config: &Config) -> HostClassification {
    if url.scheme() != "http" && url.scheme() != "https" {
        return HostClassification::Foreign;
    }

    let Some(host) = url.host_str() else {
        return HostClassification::Foreign;
    };
    let host = host.to_lowercase();

    if config.site.iter().any(|site| matches_host(&site.host, &host)) {
        HostClassification::Mirrored
    } else {
        HostClassification::Foreign
    }
}

/// Applies the first matching `[[rewrite]]` entry to the URL's host
///
/// Returns true if the host was changed.
pub fn rewrite_host(url: &mut Url, config: &Config) -> bool {
    let Some(host) = url.host_str().map(str::to_lowercase) else {
        return false;
    };

    for entry in &config.rewrite {
        if entry.from.eq_ignore_ascii_case(&host) {
            if let Err(e) = url.set_host(Some(&entry.to)) {
                tracing::warn!("Failed to rewrite host {} to {}: {}", host, entry.to, e);
                return false;
            }
            return true;
        }
    }

    false
}

use url::Url;

/// Returns the lowercase `host[:port]` key of a URL
///
/// The port is only included when it is explicit and not the scheme default,
/// so `http://h/` and `http://h:80/` share a key.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use site_mirror::url::host_key;
///
/// let url = Url::parse("http://Example.com:8080/path").unwrap();
/// assert_eq!(host_key(&url), Some("example.com:8080".to_string()));
///
/// let url = Url::parse("https://example.com:443/").unwrap();
/// assert_eq!(host_key(&url), Some("example.com".to_string()));
/// ```
pub fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    })
}

/// Checks if a host matches a whitelist pattern
///
/// `example.com` matches only itself; `*.example.com` matches the bare
/// domain and any subdomain of it. Comparison is case-insensitive.
pub fn matches_host(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let candidate = candidate.to_ascii_lowercase();

    match pattern.strip_prefix("*.") {
        Some(base) => {
            candidate == base
                || candidate
                    .strip_suffix(base)
                    .is_some_and(|head| head.ends_with('.'))
        }
        None => candidate == pattern,
    }
}

use crate::{UrlError, UrlResult};
use url::{ParseError, Url};

/// Parses `input` and insists that it is an absolute URL with a host
///
/// # Examples
///
/// ```
/// use site_mirror::url::require_absolute;
///
/// assert!(require_absolute("https://example.com/a").is_ok());
/// assert!(require_absolute("/a").is_err());
/// ```
pub fn require_absolute(input: &str) -> UrlResult<Url> {
    let url = Url::parse(input).map_err(|e| match e {
        ParseError::RelativeUrlWithoutBase => UrlError::NotAbsolute(input.to_string()),
        other => UrlError::Parse(other.to_string()),
    })?;

    if url.host_str().is_none() {
        return Err(UrlError::MissingHost);
    }

    Ok(url)
}

/// Resolves a reference (relative, root-relative or absolute) against `base`
pub fn resolve(base: &Url, reference: &str) -> UrlResult<Url> {
    base.join(reference)
        .map_err(|e| UrlError::Parse(format!("{}: {}", reference, e)))
}

/// Returns the shared prefix of two `/`-delimited paths, up to and including
/// the last fully matched `/`
///
/// A partially shared segment contributes nothing: `/aa` and `/ab` share `/`.
///
/// # Examples
///
/// ```
/// use site_mirror::url::longest_common_prefix;
///
/// assert_eq!(longest_common_prefix("/a/b/c", "/a/b/d"), "/a/b/");
/// assert_eq!(longest_common_prefix("/aa", "/ab"), "/");
/// assert_eq!(longest_common_prefix("", "/a"), "");
/// ```
pub fn longest_common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let common = a
        .bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count();

    match a.as_bytes()[..common].iter().rposition(|&c| c == b'/') {
        Some(slash) => &a[..=slash],
        None => "",
    }
}

/// Computes the shortest relative reference that resolves against `base` to
/// `target`
///
/// `target` is returned unchanged when no reduction is possible: either side
/// is not absolute, the hosts (or explicit ports) differ, or the schemes differ
/// in a way other than `http` versus `https`.
///
/// # Examples
///
/// ```
/// use site_mirror::url::reduce_url;
///
/// assert_eq!(reduce_url("http://h/a/b", "http://h/a/c"), "./c");
/// assert_eq!(reduce_url("http://h/a/b/", "http://h/x"), "../../x");
/// assert_eq!(reduce_url("http://h/a/", "http://other/a/"), "http://other/a/");
/// ```
pub fn reduce_url(base: &str, target: &str) -> String {
    let (Ok(base_url), Ok(target_url)) = (Url::parse(base), Url::parse(target)) else {
        return target.to_string();
    };

    if base_url.cannot_be_a_base() || target_url.cannot_be_a_base() {
        return target.to_string();
    }

    if !schemes_interchangeable(base_url.scheme(), target_url.scheme())
        || base_url.host_str() != target_url.host_str()
        || base_url.port() != target_url.port()
    {
        return target.to_string();
    }

    let base_path = base_url.path();
    let target_path = target_url.path();
    let prefix = longest_common_prefix(base_path, target_path);

    let base_rest = &base_path[prefix.len()..];
    let target_rest = &target_path[prefix.len()..];

    let ups = base_rest.split('/').count().saturating_sub(1);
    let mut reduced = "../".repeat(ups);
    if ups == 0 {
        // A bare segment such as `c:d` would otherwise parse as a scheme
        reduced.push_str(if target_rest.is_empty() { "." } else { "./" });
    }
    reduced.push_str(target_rest);

    if let Some(query) = target_url.query() {
        reduced.push('?');
        reduced.push_str(query);
    }
    if let Some(fragment) = target_url.fragment() {
        reduced.push('#');
        reduced.push_str(fragment);
    }

    reduced
}

fn schemes_interchangeable(a: &str, b: &str) -> bool {
    a == b || (is_http(a) && is_http(b))
}

fn is_http(scheme: &str) -> bool {
    scheme == "http" || scheme == "https"
}

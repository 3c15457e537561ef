use crate::url::host_key;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

/// File name used for URLs whose path ends in `/`
pub const INDEX_FILE: &str = "index.html";

/// Maps a URL to its cache file under `root`
///
/// Layout: `<root>/<scheme>/<host[:port]>/<dirs>/<query segments>/<file>`.
/// Query keys are sorted and so are the values of repeated keys, so URLs that
/// only differ in query order share a path. Keys and values are
/// percent-encoded and cannot introduce path separators.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use site_mirror::cache::path_for;
/// use url::Url;
///
/// let url = Url::parse("https://example.com/docs/page?b=2&a=3&a=1").unwrap();
/// assert_eq!(
///     path_for(Path::new("/cache"), &url),
///     Path::new("/cache/https/example.com/docs/a=1/a=3/b=2/page"),
/// );
/// ```
pub fn path_for(root: &Path, url: &Url) -> PathBuf {
    let mut path = root.join(url.scheme());
    if let Some(host) = host_key(url) {
        path.push(host);
    }

    let segments: Vec<&str> = url.path().split('/').collect();
    let (file, dirs) = match segments.split_last() {
        Some((last, dirs)) if !last.is_empty() => (*last, dirs),
        Some((_, dirs)) => (INDEX_FILE, dirs),
        None => (INDEX_FILE, &[][..]),
    };

    for dir in dirs.iter().filter(|s| !s.is_empty()) {
        path.push(dir);
    }

    for segment in query_segments(url) {
        path.push(segment);
    }

    path.push(file);
    path
}

fn query_segments(url: &Url) -> Vec<String> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url.query_pairs() {
        grouped
            .entry(key.into_owned())
            .or_default()
            .push(value.into_owned());
    }

    let mut segments = Vec::new();
    for (key, mut values) in grouped {
        values.sort();
        let key = urlencoding::encode(&key);
        for value in values {
            segments.push(format!("{}={}", key, urlencoding::encode(&value)));
        }
    }
    segments
}

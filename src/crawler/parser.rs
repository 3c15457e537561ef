//! Link extraction for HTML and CSS bodies
//!
//! Links are reported with the byte offset and length of the URL token in the
//! original body, so the body can be rewritten by splicing without
//! re-serializing the markup.

use crate::crawler::markup::{css_urls, tokenize_html, HtmlToken, Tag};
use std::collections::HashSet;
use url::Url;

/// Where a link was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkContext {
    /// `url(...)` in a stylesheet or `<style>` element
    CssUri,
    /// `<a href>`
    AnchorHref,
    /// `<img src>`
    ImgSrc,
    /// `<link rel="stylesheet" href>`
    StylesheetHref,
    /// `<script src>`
    ScriptSrc,
    /// `<base href>`; only reported by [`link_occurrences`]
    BaseHref,
}

impl LinkContext {
    /// True if the token sits inside an HTML attribute value
    pub fn is_html_attribute(&self) -> bool {
        !matches!(self, Self::CssUri)
    }
}

/// A link discovered in a body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub context: LinkContext,
    /// Byte offset of the URL token in the body
    pub offset: usize,
    /// Byte length of the URL token, excluding any dropped fragment
    pub length: usize,
    /// Absolute URL, fragment removed
    pub url: Url,
    /// Base URL in effect where the token appears
    pub base: Url,
}

/// Kinds of bodies links are extracted from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkupKind {
    Html,
    Css,
}

impl MarkupKind {
    /// Picks the markup kind from a `Content-Type` value
    ///
    /// # Examples
    ///
    /// ```
    /// use site_mirror::crawler::MarkupKind;
    ///
    /// assert_eq!(MarkupKind::from_content_type("text/html; charset=utf-8"), Some(MarkupKind::Html));
    /// assert_eq!(MarkupKind::from_content_type("TEXT/CSS"), Some(MarkupKind::Css));
    /// assert_eq!(MarkupKind::from_content_type("image/png"), None);
    /// ```
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "text/html" => Some(Self::Html),
            "text/css" => Some(Self::Css),
            _ => None,
        }
    }
}

/// Extracts the links of a body, deduplicated by absolute URL
///
/// Returns the effective base URL (changed by `<base href>` in HTML) and the
/// links in document order; only the first occurrence of each URL is kept.
///
/// # Example
///
/// ```
/// use site_mirror::crawler::{extract_links, LinkContext, MarkupKind};
/// use url::Url;
///
/// let base = Url::parse("http://x/a").unwrap();
/// let (_, links) = extract_links(MarkupKind::Html, r#"<a href="/b#top">b</a>"#, &base);
/// assert_eq!(links.len(), 1);
/// assert_eq!(links[0].context, LinkContext::AnchorHref);
/// assert_eq!(links[0].url.as_str(), "http://x/b");
/// assert_eq!((links[0].offset, links[0].length), (9, 2));
/// ```
pub fn extract_links(kind: MarkupKind, body: &str, base: &Url) -> (Url, Vec<Link>) {
    let mut seen = HashSet::new();
    let (base, links) = collect(kind, body, base);
    let links = links
        .into_iter()
        .filter(|link| link.context != LinkContext::BaseHref)
        .filter(|link| seen.insert(link.url.as_str().to_string()))
        .collect();
    (base, links)
}

/// Every link occurrence of a body, including repeats, in document order
///
/// Unlike [`extract_links`], the `<base href>` tokens are included, so a
/// rewriter can move the base along with the links resolved against it.
pub fn link_occurrences(kind: MarkupKind, body: &str, base: &Url) -> Vec<Link> {
    collect(kind, body, base).1
}

fn collect(kind: MarkupKind, body: &str, base: &Url) -> (Url, Vec<Link>) {
    match kind {
        MarkupKind::Html => collect_html(body, base),
        MarkupKind::Css => (base.clone(), collect_css(body, 0, base)),
    }
}

fn collect_html(html: &str, base: &Url) -> (Url, Vec<Link>) {
    let mut base = base.clone();
    let mut links = Vec::new();

    for token in tokenize_html(html) {
        match token {
            HtmlToken::StartTag(tag) => match tag.name.as_str() {
                "base" => {
                    if let Some(href) = tag.attribute("href") {
                        let context = LinkContext::BaseHref;
                        links.extend(make_link(context, href.value, href.offset, &base));
                        match base.join(&decode_entities(href.value.trim())) {
                            Ok(new_base) => base = new_base,
                            Err(e) => tracing::debug!("Ignoring bad <base href={:?}>: {}", href.value, e),
                        }
                    }
                }
                "a" => links.extend(attribute_link(&tag, "href", LinkContext::AnchorHref, &base)),
                "img" => links.extend(attribute_link(&tag, "src", LinkContext::ImgSrc, &base)),
                "script" => links.extend(attribute_link(&tag, "src", LinkContext::ScriptSrc, &base)),
                "link" if is_stylesheet(&tag) => {
                    links.extend(attribute_link(&tag, "href", LinkContext::StylesheetHref, &base))
                }
                _ => {}
            },
            HtmlToken::StyleText { offset, text } => {
                links.extend(collect_css(text, offset, &base));
            }
        }
    }

    (base, links)
}

fn collect_css(css: &str, offset: usize, base: &Url) -> Vec<Link> {
    css_urls(css, offset)
        .filter_map(|token| make_link(LinkContext::CssUri, token.value, token.offset, base))
        .collect()
}

fn is_stylesheet(tag: &Tag<'_>) -> bool {
    tag.attribute("rel").is_some_and(|rel| {
        rel.value
            .split_ascii_whitespace()
            .any(|token| token.eq_ignore_ascii_case("stylesheet"))
    })
}

fn attribute_link(tag: &Tag<'_>, name: &str, context: LinkContext, base: &Url) -> Option<Link> {
    let attribute = tag.attribute(name)?;
    make_link(context, attribute.value, attribute.offset, base)
}

/// Builds a link from a raw token
///
/// Surrounding whitespace is excluded from the token, a fragment is cut off
/// (shortening the token), and tokens that end up empty, fail to resolve or
/// are not http(s) are dropped.
fn make_link(context: LinkContext, raw: &str, offset: usize, base: &Url) -> Option<Link> {
    let trimmed = raw.trim_start();
    let offset = offset + (raw.len() - trimmed.len());
    let token = trimmed.trim_end();

    let token = match token.find('#') {
        Some(hash) => &token[..hash],
        None => token,
    };
    if token.is_empty() {
        return None;
    }

    let mut url = base.join(&decode_entities(token)).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_fragment(None);

    Some(Link {
        context,
        offset,
        length: token.len(),
        url,
        base: base.clone(),
    })
}

/// Decodes the entities that commonly appear inside URL attributes
fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&amp;", "&")
        .replace("&#38;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

/// Rewrites a body by replacing link tokens
///
/// `replace` returns the new token text, or `None` to leave a link as is.
/// Overlapping links are skipped.
pub fn rewrite_links<F>(body: &str, links: &[Link], mut replace: F) -> String
where
    F: FnMut(&Link) -> Option<String>,
{
    let mut ordered: Vec<&Link> = links.iter().collect();
    ordered.sort_by_key(|link| link.offset);

    let mut out = String::with_capacity(body.len());
    let mut cursor = 0;
    for link in ordered {
        let end = link.offset + link.length;
        if link.offset < cursor || end > body.len() {
            continue;
        }
        let Some(replacement) = replace(link) else {
            continue;
        };
        let (Some(before), Some(_)) = (body.get(cursor..link.offset), body.get(link.offset..end))
        else {
            continue;
        };
        out.push_str(before);
        out.push_str(&replacement);
        cursor = end;
    }
    out.push_str(&body[cursor..]);
    out
}

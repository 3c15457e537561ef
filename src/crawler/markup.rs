//! Byte-offset tokenizer for HTML tags and CSS `url()` tokens
//!
//! Only the parts of the markup that can carry links are surfaced: start tags
//! with their attributes, and the raw text of `<style>` elements. Every offset
//! is relative to the start of the input so callers can splice the original
//! bytes.
//!
//! Tags are scanned in a single forward pass. A tag still open at the end of
//! the input swallows the rest of it, as it does in a browser.

use regex::Regex;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static CSS_URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^"'()\s]*))\s*\)"#)
        .expect("css url regex is valid") // Static pattern, safe to panic
});

/// One attribute of a start tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute<'a> {
    /// Lowercased attribute name
    pub name: String,
    /// Raw value, without quotes and without entity decoding
    pub value: &'a str,
    /// Offset of the first byte of `value`
    pub offset: usize,
}

/// A start (or self-closing) tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag<'a> {
    /// Lowercased tag name
    pub name: String,
    pub attributes: Vec<Attribute<'a>>,
    pub self_closing: bool,
}

impl<'a> Tag<'a> {
    pub fn attribute(&self, name: &str) -> Option<&Attribute<'a>> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HtmlToken<'a> {
    StartTag(Tag<'a>),
    /// Raw text content of a `<style>` element
    StyleText { offset: usize, text: &'a str },
}

/// Iterator over the link-relevant tokens of an HTML document
pub struct HtmlTokens<'a> {
    html: &'a str,
    pos: usize,
    pending: Option<HtmlToken<'a>>,
}

/// Tokenizes `html`
pub fn tokenize_html(html: &str) -> HtmlTokens<'_> {
    HtmlTokens {
        html,
        pos: 0,
        pending: None,
    }
}

impl<'a> Iterator for HtmlTokens<'a> {
    type Item = HtmlToken<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(token) = self.pending.take() {
            return Some(token);
        }

        loop {
            let start = self.pos + self.html.get(self.pos..)?.find('<')?;

            let resume = match self.html.as_bytes().get(start + 1).copied() {
                Some(b) if b.is_ascii_alphabetic() => {
                    let Some((tag, end)) = scan_start_tag(self.html, start) else {
                        self.pos = self.html.len();
                        return None;
                    };
                    self.pos = end;

                    if !tag.self_closing && (tag.name == "style" || tag.name == "script") {
                        let close = find_closing_tag(self.html, end, &tag.name);
                        if tag.name == "style" {
                            self.pending = Some(HtmlToken::StyleText {
                                offset: end,
                                text: &self.html[end..close],
                            });
                        }
                        self.pos = close;
                    }
                    return Some(HtmlToken::StartTag(tag));
                }
                Some(b'!') if self.html[start..].starts_with("<!--") => {
                    find_from(self.html, start + 2, "-->").map(|i| i + 3)
                }
                // End tag or declaration
                Some(b'/' | b'!' | b'?') => find_from(self.html, start + 2, ">").map(|i| i + 1),
                // A stray `<` in text
                _ => Some(start + 1),
            };
            self.pos = resume.unwrap_or(self.html.len());
        }
    }
}

fn find_from(html: &str, from: usize, needle: &str) -> Option<usize> {
    html.get(from..)?.find(needle).map(|i| from + i)
}

fn skip_while(bytes: &[u8], mut i: usize, pred: impl Fn(u8) -> bool) -> usize {
    while i < bytes.len() && pred(bytes[i]) {
        i += 1;
    }
    i
}

fn ends_name(b: u8) -> bool {
    b.is_ascii_whitespace() || b == b'/' || b == b'>'
}

/// Scans the start tag opening at `start`
///
/// Returns the tag and the offset just past its `>`, or `None` if the input
/// ends first. Quoted values may contain `>`.
fn scan_start_tag(html: &str, start: usize) -> Option<(Tag<'_>, usize)> {
    let bytes = html.as_bytes();
    let name_end = skip_while(bytes, start + 1, |b| !ends_name(b));
    let name = html[start + 1..name_end].to_ascii_lowercase();

    let mut attributes = Vec::new();
    let mut self_closing = false;
    let mut i = name_end;
    loop {
        i = skip_while(bytes, i, |b| b.is_ascii_whitespace());
        match *bytes.get(i)? {
            b'>' => {
                let tag = Tag {
                    name,
                    attributes,
                    self_closing,
                };
                return Some((tag, i + 1));
            }
            b'/' => {
                i += 1;
                self_closing = bytes.get(i) == Some(&b'>');
                continue;
            }
            _ => self_closing = false,
        }

        // `=` can only open a name as its first byte
        let name_start = i;
        i = skip_while(bytes, i + 1, |b| !ends_name(b) && b != b'=');
        let attr_name = html[name_start..i].to_ascii_lowercase();
        let name_end = i;

        i = skip_while(bytes, i, |b| b.is_ascii_whitespace());
        if bytes.get(i) != Some(&b'=') {
            attributes.push(Attribute {
                name: attr_name,
                value: "",
                offset: name_end,
            });
            continue;
        }

        i = skip_while(bytes, i + 1, |b| b.is_ascii_whitespace());
        let (value_start, value_end, next) = match *bytes.get(i)? {
            b'"' => {
                let close = find_from(html, i + 1, "\"")?;
                (i + 1, close, close + 1)
            }
            b'\'' => {
                let close = find_from(html, i + 1, "'")?;
                (i + 1, close, close + 1)
            }
            _ => {
                let end = skip_while(bytes, i, |b| !b.is_ascii_whitespace() && b != b'>');
                (i, end, end)
            }
        };
        attributes.push(Attribute {
            name: attr_name,
            value: &html[value_start..value_end],
            offset: value_start,
        });
        i = next;
    }
}

/// Finds where the raw text of `<name>` ends: at `</name`, or the end of input
fn find_closing_tag(html: &str, from: usize, name: &str) -> usize {
    let needle = format!("</{}", name);
    let haystack = html.as_bytes();
    let needle = needle.as_bytes();

    (from..haystack.len().saturating_sub(needle.len() - 1))
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
        .unwrap_or(html.len())
}

/// A `url(...)` token inside CSS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CssUrl<'a> {
    /// Raw value, quotes stripped
    pub value: &'a str,
    /// Offset of the first byte of `value`
    pub offset: usize,
}

/// Finds every `url(...)` token in `css`; offsets are shifted by `base`
pub fn css_urls(css: &str, base: usize) -> impl Iterator<Item = CssUrl<'_>> {
    CSS_URL_PATTERN.captures_iter(css).filter_map(move |caps| {
        let m = (1..=3).find_map(|i| caps.get(i))?;
        Some(CssUrl {
            value: m.as_str(),
            offset: base + m.start(),
        })
    })
}

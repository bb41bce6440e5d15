//! Inline format spans over a raw message body.
//!
//! Spans are `[start, end)` char offsets into the stored body and cover the
//! inner text of a markup run, so a renderer can hide the markers itself.

use serde::{Deserialize, Serialize};

pub const MAX_SPANS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    Bold,
    Italic,
    Code,
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatSpan {
    pub kind:  SpanKind,
    pub start: usize,
    pub end:   usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url:   Option<String>,
}

impl FormatSpan {
    fn plain(kind: SpanKind, start: usize, end: usize) -> Self {
        Self { kind, start, end, url: None }
    }
}

pub fn is_http_url(s: &str) -> bool {
    (s.starts_with("https://") || s.starts_with("http://"))
        && s.len() > "http://".len()
        && !s.chars().any(char::is_whitespace)
}

/// Checks client-supplied spans against the body they claim to describe.
pub fn validate(spans: &[FormatSpan], body: &str) -> Result<(), String> {
    if spans.len() > MAX_SPANS {
        return Err(format!("too many format spans (max {MAX_SPANS})"));
    }
    let len = body.chars().count();
    for s in spans {
        if s.start >= s.end || s.end > len {
            return Err(format!("span [{}, {}) out of range", s.start, s.end));
        }
        match (s.kind, s.url.as_deref()) {
            (SpanKind::Link, Some(url)) if is_http_url(url) => {}
            (SpanKind::Link, _) => return Err("link span needs an http(s) url".into()),
            _ => {}
        }
    }
    Ok(())
}

/// Derives spans from `**bold**`, `*italic*`, `_italic_`, `` `code` `` and
/// `[text](url)` markup. Runs do not nest.
pub fn derive(body: &str) -> Vec<FormatSpan> {
    let chars: Vec<char> = body.chars().collect();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match scan_at(&chars, i) {
            Some((span, next)) => {
                spans.push(span);
                i = next;
            }
            None => i += 1,
        }
    }
    spans
}

fn scan_at(chars: &[char], i: usize) -> Option<(FormatSpan, usize)> {
    match chars[i] {
        '`' => {
            let j = find(chars, i + 1, &['`'])?;
            (j > i + 1).then(|| (FormatSpan::plain(SpanKind::Code, i + 1, j), j + 1))
        }
        '*' if chars.get(i + 1) == Some(&'*') => {
            let j = find(chars, i + 2, &['*', '*'])?;
            (j > i + 2).then(|| (FormatSpan::plain(SpanKind::Bold, i + 2, j), j + 2))
        }
        m @ ('*' | '_') => {
            let j = find(chars, i + 1, &[m])?;
            (j > i + 1).then(|| (FormatSpan::plain(SpanKind::Italic, i + 1, j), j + 1))
        }
        '[' => {
            let close = find(chars, i + 1, &[']'])?;
            if chars.get(close + 1) != Some(&'(') || close == i + 1 {
                return None;
            }
            let paren = find(chars, close + 2, &[')'])?;
            let url: String = chars[close + 2..paren].iter().collect();
            is_http_url(&url).then(|| {
                let span = FormatSpan { kind: SpanKind::Link, start: i + 1, end: close, url: Some(url) };
                (span, paren + 1)
            })
        }
        _ => None,
    }
}

fn find(chars: &[char], from: usize, pat: &[char]) -> Option<usize> {
    if from > chars.len() {
        return None;
    }
    chars[from..]
        .windows(pat.len())
        .position(|w| w == pat)
        .map(|p| p + from)
}

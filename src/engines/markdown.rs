//! Markdown to HTML fragment.
//!
//! CommonMark via pulldown-cmark with tables and strikethrough. Inline HTML is
//! passed through and bare `http(s)://` or `www.` URLs in text become links.
//! Scheme-less domains such as `example.com` are left as plain text.

use crate::error::{AppError, Result};
use once_cell::sync::Lazy;
use pulldown_cmark::{html, CowStr, Event, LinkType, Options, Parser, Tag, TagEnd, TextMergeStream};
use regex::Regex;

static BARE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:https?://|www\.)[^\s<>]*[^\s<>.,;:!?'")\]]"#).unwrap()
});

fn options() -> Options {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options
}

/// Decode UTF-8 Markdown and render it
pub fn to_html(content: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(content)
        .map_err(|e| AppError::DecodeFailure(format!("Markdown is not valid UTF-8: {}", e)))?;
    Ok(render(text))
}

pub fn render(markdown: &str) -> String {
    let parser = TextMergeStream::new(Parser::new_ext(markdown, options()));

    let mut events = Vec::new();
    let mut link_depth = 0usize;
    let mut in_code_block = false;

    for event in parser {
        match &event {
            Event::Start(Tag::Link { .. }) => link_depth += 1,
            Event::End(TagEnd::Link) => link_depth = link_depth.saturating_sub(1),
            Event::InlineHtml(raw) | Event::Html(raw) => {
                let tag = raw.trim_start().to_ascii_lowercase();
                if tag.starts_with("<a ") || tag.starts_with("<a>") {
                    link_depth += 1;
                } else if tag.starts_with("</a") {
                    link_depth = link_depth.saturating_sub(1);
                }
            }
            Event::Start(Tag::CodeBlock(_)) => in_code_block = true,
            Event::End(TagEnd::CodeBlock) => in_code_block = false,
            _ => {}
        }

        match event {
            Event::Text(text) if link_depth == 0 && !in_code_block => linkify(text, &mut events),
            other => events.push(other),
        }
    }

    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, events.into_iter());
    out
}

/// Split `text` around bare URLs, emitting a link for each
fn linkify<'a>(text: CowStr<'a>, out: &mut Vec<Event<'a>>) {
    let source: &str = &text;
    let spans: Vec<(usize, usize)> = BARE_URL
        .find_iter(source)
        .map(|m| (m.start(), m.end()))
        .collect();

    if spans.is_empty() {
        out.push(Event::Text(text));
        return;
    }

    let mut last = 0;
    for (start, end) in spans {
        if start > last {
            out.push(Event::Text(source[last..start].to_string().into()));
        }

        let url = &source[start..end];
        let href = if url.len() >= 4 && url[..4].eq_ignore_ascii_case("www.") {
            format!("http://{}", url)
        } else {
            url.to_string()
        };

        out.push(Event::Start(Tag::Link {
            link_type: LinkType::Autolink,
            dest_url: href.into(),
            title: CowStr::Borrowed(""),
            id: CowStr::Borrowed(""),
        }));
        out.push(Event::Text(url.to_string().into()));
        out.push(Event::End(TagEnd::Link));
        last = end;
    }

    if last < source.len() {
        out.push(Event::Text(source[last..].to_string().into()));
    }
}

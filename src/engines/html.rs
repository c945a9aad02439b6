//! HTML passthrough and the document shell every HTML intermediate is
//! rendered in.
//!
//! Fragments are embedded verbatim. Nothing is sanitised, so scripts and
//! remote resources referenced by an upload are executed and fetched by the
//! render engine. Deploy only for trusted callers.

use crate::error::{AppError, Result};

const STYLESHEET: &str = "\
      body { font-family: Arial, sans-serif; margin: 2rem; line-height: 1.5; }
      img { max-width: 100%; }
      pre { background: #f4f4f4; padding: 1rem; overflow: auto; }
      code { font-family: 'Courier New', Courier, monospace; }
      table { border-collapse: collapse; }
      td, th { border: 1px solid #ccc; padding: 0.25rem 0.5rem; }";

/// Decode an uploaded HTML file. The markup is used as-is.
pub fn to_html(content: &[u8]) -> Result<String> {
    String::from_utf8(content.to_vec())
        .map_err(|e| AppError::DecodeFailure(format!("HTML is not valid UTF-8: {}", e)))
}

/// Embed `fragment` in a complete document titled `title`
pub fn wrap_document(fragment: &str, title: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <title>{title}</title>
    <style>
{style}
    </style>
  </head>
  <body>
{body}
  </body>
</html>
"#,
        title = html_escape::encode_text(title),
        style = STYLESHEET,
        body = fragment,
    )
}

mod chromium;
pub mod docx;
pub mod html;
pub mod image;
pub mod markdown;
mod pdf;
mod render;

pub use chromium::ChromiumLauncher;
pub use render::RenderEngine;

#[cfg(test)]
pub(crate) use render::tests::{Counters, FakeLauncher};

use crate::error::{AppError, Result};
use async_trait::async_trait;

/// Every extension accepted by the classifier, in display order
pub const SUPPORTED_EXTENSIONS: &[&str] = &["docx", "md", "html", "htm", "png", "jpg", "jpeg"];

/// Conversion strategy selected from a file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    Docx,
    Markdown,
    Html,
    Image,
}

impl SourceFormat {
    /// Map an extension (without the dot, any casing) to its strategy
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "docx" => Some(SourceFormat::Docx),
            "md" => Some(SourceFormat::Markdown),
            "html" | "htm" => Some(SourceFormat::Html),
            "png" | "jpg" | "jpeg" => Some(SourceFormat::Image),
            _ => None,
        }
    }

    /// Classify a filename by its last dot-delimited segment.
    ///
    /// Names without an extension, and dotfiles such as `.md`, are rejected
    /// with `UnsupportedFormat`.
    pub fn classify(filename: &str) -> Result<Self> {
        let ext = split_extension(filename).1;
        ext.and_then(Self::from_extension)
            .ok_or_else(|| AppError::UnsupportedFormat {
                extension: ext.map(str::to_lowercase),
                supported: SUPPORTED_EXTENSIONS.to_vec(),
            })
    }

    /// Whether the format goes through the HTML render engine
    pub fn uses_renderer(&self) -> bool {
        !matches!(self, SourceFormat::Image)
    }
}

/// Split a filename into base name and extension.
///
/// Only the final path component is considered, so `a/b.c/readme` has no
/// extension. A single leading dot belongs to the base name.
pub fn split_extension(filename: &str) -> (&str, Option<&str>) {
    let name = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename);

    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}

/// Anything able to turn a complete HTML document into PDF bytes
#[async_trait]
pub trait HtmlRenderer: Send + Sync {
    async fn render_html(&self, document: &str) -> Result<Vec<u8>>;

    /// Whether the engine currently holds a live process
    async fn is_running(&self) -> bool;

    /// Release the underlying engine, if any is running
    async fn shutdown(&self);
}

use crate::engines::{self, HtmlRenderer, SourceFormat};
use crate::error::{AppError, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

/// Default upload maximum: 10 MiB
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// A file as received from the caller
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub content: Bytes,
}

/// An accepted upload with its strategy resolved
#[derive(Debug)]
pub struct ConversionRequest<'a> {
    pub file: &'a UploadedFile,
    pub format: SourceFormat,
    pub extension: String,
    pub base_name: String,
}

/// Result of a conversion operation
#[derive(Debug)]
pub struct ConversionResult {
    pub data: Vec<u8>,
    pub filename: String,
}

/// Validates uploads and drives them through the matching builder
pub struct Converter {
    renderer: Arc<dyn HtmlRenderer>,
    max_upload_bytes: u64,
}

impl Converter {
    pub fn new(renderer: Arc<dyn HtmlRenderer>, max_upload_bytes: u64) -> Self {
        Self {
            renderer,
            max_upload_bytes,
        }
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    /// Get a list of all supported extensions
    pub fn supported_extensions(&self) -> Vec<&'static str> {
        engines::SUPPORTED_EXTENSIONS.to_vec()
    }

    /// Validate presence and size, then classify. Never touches the content.
    pub fn prepare<'a>(&self, file: Option<&'a UploadedFile>) -> Result<ConversionRequest<'a>> {
        let file = file.ok_or(AppError::MissingFile)?;

        if file.size_bytes > self.max_upload_bytes {
            return Err(AppError::FileTooLarge {
                size: file.size_bytes,
                max: self.max_upload_bytes,
            });
        }

        let format = SourceFormat::classify(&file.name)?;
        let (base_name, extension) = engines::split_extension(&file.name);

        Ok(ConversionRequest {
            file,
            format,
            extension: extension.unwrap_or_default().to_lowercase(),
            base_name: base_name.to_string(),
        })
    }

    /// Convert an upload to PDF
    pub async fn convert_to_pdf(&self, file: Option<UploadedFile>) -> Result<ConversionResult> {
        let request = self.prepare(file.as_ref())?;
        info!(
            "Converting {} (.{} via {}, {} bytes)",
            request.file.name,
            request.extension,
            if request.format.uses_renderer() {
                "render engine"
            } else {
                "image builder"
            },
            request.file.size_bytes
        );

        let data = match request.format {
            SourceFormat::Image => {
                let content = request.file.content.clone();
                let mime_type = request.file.mime_type.clone();
                run_blocking(move || engines::image::to_pdf(&content, &mime_type)).await?
            }
            SourceFormat::Docx => {
                let content = request.file.content.clone();
                let fragment = run_blocking(move || engines::docx::to_html(&content)).await?;
                self.render_fragment(&fragment, &request.file.name).await?
            }
            SourceFormat::Markdown => {
                let fragment = engines::markdown::to_html(&request.file.content)?;
                self.render_fragment(&fragment, &request.file.name).await?
            }
            SourceFormat::Html => {
                let fragment = engines::html::to_html(&request.file.content)?;
                self.render_fragment(&fragment, &request.file.name).await?
            }
        };

        Ok(ConversionResult {
            data,
            filename: format!("{}.pdf", request.base_name),
        })
    }

    async fn render_fragment(&self, fragment: &str, title: &str) -> Result<Vec<u8>> {
        let document = engines::html::wrap_document(fragment, title);
        self.renderer.render_html(&document).await
    }

    pub async fn is_render_engine_running(&self) -> bool {
        self.renderer.is_running().await
    }

    /// Tear down the render engine
    pub async fn shutdown(&self) {
        self.renderer.shutdown().await
    }
}

async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| AppError::Internal(format!("Conversion worker failed: {}", e)))?
}

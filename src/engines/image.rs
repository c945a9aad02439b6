//! PNG/JPEG straight to a one-page PDF.
//!
//! The page is exactly the image's pixel size (one pixel per point) and the
//! image is drawn unscaled at the origin. No HTML or browser is involved.

use crate::error::{AppError, Result};
use image::codecs::jpeg::JpegDecoder;
use image::{DynamicImage, ExtendedColorType, ImageDecoder, ImageFormat};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use std::io::Cursor;
use tracing::debug;

const IMAGE_NAME: &[u8] = b"Im0";

/// Image encodings accepted by the image builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Png,
    Jpeg,
}

impl ImageKind {
    /// Resolve a declared MIME type; only `image/png` and `image/jpeg` qualify
    pub fn from_mime(mime_type: &str) -> Result<Self> {
        let parsed = mime_type
            .trim()
            .to_ascii_lowercase()
            .parse::<mime::Mime>()
            .ok();
        match parsed {
            Some(m) if m.type_() == mime::IMAGE && m.subtype() == mime::PNG => Ok(ImageKind::Png),
            Some(m) if m.type_() == mime::IMAGE && m.subtype() == mime::JPEG => Ok(ImageKind::Jpeg),
            _ => Err(AppError::UnsupportedMediaType(format!(
                "'{}' is not an accepted image type (expected {} or {})",
                mime_type,
                mime::IMAGE_PNG,
                mime::IMAGE_JPEG
            ))),
        }
    }

    fn format(&self) -> ImageFormat {
        match self {
            ImageKind::Png => ImageFormat::Png,
            ImageKind::Jpeg => ImageFormat::Jpeg,
        }
    }
}

struct EmbeddedImage {
    width: u32,
    height: u32,
    xobject: Stream,
    soft_mask: Option<Stream>,
}

fn decode_failure(kind: ImageKind, err: impl std::fmt::Display) -> AppError {
    AppError::DecodeFailure(format!("Invalid {:?} image: {}", kind, err))
}

fn pdf_error(err: lopdf::Error) -> AppError {
    AppError::Internal(format!("Failed to assemble image PDF: {}", err))
}

fn image_dictionary(width: u32, height: u32, color_space: &str) -> lopdf::Dictionary {
    dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => width as i64,
        "Height" => height as i64,
        "ColorSpace" => color_space,
        "BitsPerComponent" => 8i64,
    }
}

fn flate_stream(dict: lopdf::Dictionary, data: Vec<u8>) -> Result<Stream> {
    let mut stream = Stream::new(dict, data);
    stream.compress().map_err(pdf_error)?;
    Ok(stream)
}

/// Keep baseline grey/RGB JPEG data as-is; anything else is re-encoded
fn embed_jpeg(content: &[u8]) -> Result<EmbeddedImage> {
    let decoder = JpegDecoder::new(Cursor::new(content))
        .map_err(|e| decode_failure(ImageKind::Jpeg, e))?;
    let (width, height) = decoder.dimensions();

    let color_space = match decoder.original_color_type() {
        ExtendedColorType::L8 => "DeviceGray",
        ExtendedColorType::Rgb8 => "DeviceRGB",
        other => {
            debug!("Re-encoding JPEG with {:?} colour", other);
            return embed_decoded(content, ImageKind::Jpeg);
        }
    };

    let mut dict = image_dictionary(width, height, color_space);
    dict.set("Filter", "DCTDecode");
    Ok(EmbeddedImage {
        width,
        height,
        xobject: Stream::new(dict, content.to_vec()).with_compression(false),
        soft_mask: None,
    })
}

fn embed_decoded(content: &[u8], kind: ImageKind) -> Result<EmbeddedImage> {
    let decoded = image::load_from_memory_with_format(content, kind.format())
        .map_err(|e| decode_failure(kind, e))?;
    let (width, height) = (decoded.width(), decoded.height());

    if decoded.color().has_alpha() {
        let rgba = decoded.to_rgba8();
        let mut rgb = Vec::with_capacity((width * height * 3) as usize);
        let mut alpha = Vec::with_capacity((width * height) as usize);
        for pixel in rgba.pixels() {
            rgb.extend_from_slice(&pixel.0[..3]);
            alpha.push(pixel.0[3]);
        }
        return Ok(EmbeddedImage {
            width,
            height,
            xobject: flate_stream(image_dictionary(width, height, "DeviceRGB"), rgb)?,
            soft_mask: Some(flate_stream(
                image_dictionary(width, height, "DeviceGray"),
                alpha,
            )?),
        });
    }

    let (color_space, data) = match decoded {
        DynamicImage::ImageLuma8(gray) => ("DeviceGray", gray.into_raw()),
        other if !other.color().has_color() => ("DeviceGray", other.to_luma8().into_raw()),
        other => ("DeviceRGB", other.to_rgb8().into_raw()),
    };
    Ok(EmbeddedImage {
        width,
        height,
        xobject: flate_stream(image_dictionary(width, height, color_space), data)?,
        soft_mask: None,
    })
}

/// Build a single-page PDF showing the image at its natural size
pub fn to_pdf(content: &[u8], mime_type: &str) -> Result<Vec<u8>> {
    let kind = ImageKind::from_mime(mime_type)?;
    let embedded = match kind {
        ImageKind::Jpeg => embed_jpeg(content)?,
        ImageKind::Png => embed_decoded(content, kind)?,
    };

    let EmbeddedImage {
        width,
        height,
        mut xobject,
        soft_mask,
    } = embedded;
    if width == 0 || height == 0 {
        return Err(decode_failure(kind, "image has no pixels"));
    }
    let (w, h) = (width as i64, height as i64);

    let mut doc = Document::with_version("1.7");
    let pages_id = doc.new_object_id();

    if let Some(mask) = soft_mask {
        let mask_id = doc.add_object(mask);
        xobject.dict.set("SMask", mask_id);
    }
    let image_id = doc.add_object(xobject);

    let content = Content {
        operations: vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    Object::Integer(w),
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Integer(h),
                    Object::Integer(0),
                    Object::Integer(0),
                ],
            ),
            Operation::new("Do", vec![Object::Name(IMAGE_NAME.to_vec())]),
            Operation::new("Q", vec![]),
        ],
    };
    let content_id = doc.add_object(Stream::new(
        dictionary! {},
        content.encode().map_err(pdf_error)?,
    ));

    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![
            Object::Integer(0),
            Object::Integer(0),
            Object::Integer(w),
            Object::Integer(h),
        ],
        "Contents" => content_id,
        "Resources" => dictionary! {
            "XObject" => dictionary! {
                "Im0" => image_id,
            },
        },
    });

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).map_err(|e| {
        AppError::Internal(format!("Failed to write image PDF: {}", e))
    })?;
    Ok(buffer)
}

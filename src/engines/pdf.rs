//! Post-processing for browser-printed PDFs.
//!
//! Chromium stamps every print with the current time (`/CreationDate`,
//! `/ModDate`) and a time-seeded trailer `/ID`. Stripping the dates and
//! deriving the ID from the remaining bytes makes identical documents print
//! to identical files.

use crate::error::{AppError, Result};
use lopdf::{Document, Object, StringFormat};
use sha2::{Digest, Sha256};

const VOLATILE_INFO_KEYS: [&[u8]; 2] = [b"CreationDate", b"ModDate"];

/// First 16 bytes of the SHA-256, the usual size of a PDF file identifier
const ID_LEN: usize = 16;

pub fn normalize(pdf: &[u8]) -> Result<Vec<u8>> {
    let mut doc = Document::load_mem(pdf).map_err(|e| failure("parse printed PDF", e))?;

    let info_ref = doc.trailer.get(b"Info").and_then(Object::as_reference).ok();
    let info = match info_ref {
        Some(id) => doc.get_object_mut(id).and_then(Object::as_dict_mut).ok(),
        None => doc.trailer.get_mut(b"Info").and_then(Object::as_dict_mut).ok(),
    };
    if let Some(info) = info {
        for key in VOLATILE_INFO_KEYS {
            info.remove(key);
        }
    }

    doc.trailer.remove(b"ID");
    let unstamped = save(&mut doc)?;

    let id = Sha256::digest(&unstamped)[..ID_LEN].to_vec();
    doc.trailer.set(
        "ID",
        vec![
            Object::String(id.clone(), StringFormat::Hexadecimal),
            Object::String(id, StringFormat::Hexadecimal),
        ],
    );
    save(&mut doc)
}

fn save(doc: &mut Document) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| failure("write normalized PDF", e))?;
    Ok(buffer)
}

fn failure(step: &str, err: impl std::fmt::Display) -> AppError {
    AppError::RenderFailure(format!("Failed to {}: {}", step, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn printed_pdf(timestamp: &str, id: &[u8]) -> Vec<u8> {
        let mut doc = Document::with_version("1.4");
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(595),
                Object::Integer(842),
            ],
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
        let info_id = doc.add_object(dictionary! {
            "Producer" => Object::string_literal("Skia/PDF m120"),
            "CreationDate" => Object::string_literal(timestamp),
            "ModDate" => Object::string_literal(timestamp),
        });
        doc.trailer.set("Root", catalog_id);
        doc.trailer.set("Info", info_id);
        doc.trailer.set(
            "ID",
            vec![
                Object::String(id.to_vec(), StringFormat::Hexadecimal),
                Object::String(id.to_vec(), StringFormat::Hexadecimal),
            ],
        );

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer).unwrap();
        buffer
    }

    #[test]
    fn test_prints_differing_only_in_stamps_become_identical() {
        let first = printed_pdf("D:20240101120000+00'00'", &[1; 16]);
        let second = printed_pdf("D:20240101120007+00'00'", &[2; 16]);
        assert_ne!(first, second);

        let first = normalize(&first).unwrap();
        let second = normalize(&second).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with(b"%PDF-"));
    }

    #[test]
    fn test_dates_removed_and_id_set() {
        let normalized = normalize(&printed_pdf("D:20240101120000Z", &[9; 16])).unwrap();
        let doc = Document::load_mem(&normalized).unwrap();

        let info_id = doc.trailer.get(b"Info").unwrap().as_reference().unwrap();
        let info = doc.get_object(info_id).unwrap().as_dict().unwrap();
        assert!(info.get(b"CreationDate").is_err());
        assert!(info.get(b"ModDate").is_err());
        assert!(info.get(b"Producer").is_ok());

        let id = doc.trailer.get(b"ID").unwrap().as_array().unwrap();
        assert_eq!(id.len(), 2);
        assert_eq!(id[0].as_str().unwrap().len(), ID_LEN);
        assert_ne!(id[0].as_str().unwrap(), &[9; 16]);
    }

    #[test]
    fn test_garbage_is_render_failure() {
        assert!(matches!(
            normalize(b"not a pdf"),
            Err(AppError::RenderFailure(_))
        ));
    }
}

//! Page artifact extraction: text snapshot and annotation records.
//!
//! For every cached single-page PDF the extractor materializes up to two
//! sibling files: `<hash>.snapshot.txt` (plain text, skipped when the page
//! is all whitespace) and `<hash>.annotation.json` (ordered annotation
//! array, skipped when empty).

use std::path::PathBuf;

use lopdf::{Dictionary, Document, Object, ObjectId};
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::layout::{self, number, resolve};

pub const PDF_EXT: &str = "pdf";
pub const SNAPSHOT_EXT: &str = "snapshot.txt";
pub const ANNOTATION_EXT: &str = "annotation.json";

/// One annotation of a page. Only non-null fields appear in the JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quad_points: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
}

/// Reads and writes per-page artifacts in the content-addressed cache.
pub struct PdfExtractor {
    pages_dir: PathBuf,
}

impl PdfExtractor {
    pub fn new(pages_dir: PathBuf) -> Self {
        Self { pages_dir }
    }

    pub fn pdf_path(&self, page_hash: &str) -> PathBuf {
        self.artifact_path(page_hash, PDF_EXT)
    }

    fn artifact_path(&self, page_hash: &str, ext: &str) -> PathBuf {
        self.pages_dir.join(format!("{page_hash}.{ext}"))
    }

    /// Produce the snapshot and annotation artifacts for a cached page.
    pub fn extract_page(&self, page_hash: &str) -> Result<()> {
        let doc = Document::load(self.pdf_path(page_hash))?;
        let pages = doc.get_pages();
        let Some((&page_number, &page_id)) = pages.iter().next() else {
            return Ok(());
        };

        let snapshot = doc.extract_text(&[page_number]).unwrap_or_default();

        let mut annotations = extract_annotations(&doc, page_id);
        if annotations.iter().any(|a| a.quad_points.is_some()) {
            let lines = match layout::page_lines(&doc, page_id) {
                Ok(lines) => lines,
                Err(e) => {
                    tracing::warn!(page = %page_hash, error = %e, "Text layout failed");
                    Vec::new()
                }
            };
            for annotation in &mut annotations {
                if let Some(quads) = &annotation.quad_points {
                    annotation.extracted_text = layout::selected_text(&lines, quads);
                }
            }
        }

        if !snapshot.chars().all(char::is_whitespace) {
            std::fs::write(self.artifact_path(page_hash, SNAPSHOT_EXT), &snapshot)?;
        }

        if !annotations.is_empty() {
            let json = serde_json::to_string(&annotations)?;
            std::fs::write(self.artifact_path(page_hash, ANNOTATION_EXT), json)?;
        }

        Ok(())
    }

    /// Drop every artifact of a page. Missing files are fine.
    pub fn remove_page(&self, page_hash: &str) {
        for ext in [PDF_EXT, SNAPSHOT_EXT, ANNOTATION_EXT] {
            let path = self.artifact_path(page_hash, ext);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "Eviction failed");
                }
            }
        }
    }

    /// The page's text snapshot; empty when the page had none.
    pub fn read_snapshot(&self, page_hash: &str) -> String {
        std::fs::read_to_string(self.artifact_path(page_hash, SNAPSHOT_EXT)).unwrap_or_default()
    }

    /// The page's annotations; empty when the page had none.
    pub fn read_annotations(&self, page_hash: &str) -> Vec<Annotation> {
        let Ok(json) = std::fs::read_to_string(self.artifact_path(page_hash, ANNOTATION_EXT))
        else {
            return Vec::new();
        };
        serde_json::from_str(&json).unwrap_or_default()
    }
}

fn extract_annotations(doc: &Document, page_id: ObjectId) -> Vec<Annotation> {
    let Ok(page) = doc.get_object(page_id).and_then(Object::as_dict) else {
        return Vec::new();
    };
    let Some(annots) = page
        .get(b"Annots")
        .ok()
        .map(|o| resolve(doc, o))
        .and_then(|o| o.as_array().ok())
    else {
        return Vec::new();
    };

    let mut annotations = Vec::new();
    for entry in annots {
        let Ok(dict) = resolve(doc, entry).as_dict() else {
            continue;
        };

        let annotation = Annotation {
            kind: match dict.get(b"Subtype").map(|o| resolve(doc, o)) {
                Ok(Object::Name(name)) => Some(String::from_utf8_lossy(name).into_owned()),
                _ => None,
            },
            title: string_value(doc, dict, b"T"),
            content: string_value(doc, dict, b"Contents"),
            uri: dict
                .get(b"A")
                .ok()
                .map(|o| resolve(doc, o))
                .and_then(|o| o.as_dict().ok())
                .and_then(|action| string_value(doc, action, b"URI")),
            created_at: string_value(doc, dict, b"CreationDate")
                .as_deref()
                .and_then(pdf_date_to_utc),
            updated_at: string_value(doc, dict, b"M")
                .as_deref()
                .and_then(pdf_date_to_utc),
            quad_points: dict
                .get(b"QuadPoints")
                .ok()
                .map(|o| resolve(doc, o))
                .and_then(|o| o.as_array().ok())
                .map(|array| {
                    array
                        .iter()
                        .filter_map(|v| number(resolve(doc, v)))
                        .collect::<Vec<f64>>()
                }),
            extracted_text: None,
        };

        // An annotation that carries no text at all is useless downstream.
        if annotation.title.is_some() || annotation.content.is_some() || annotation.uri.is_some()
        {
            annotations.push(annotation);
        }
    }
    annotations
}

fn string_value(doc: &Document, dict: &Dictionary, key: &[u8]) -> Option<String> {
    match resolve(doc, dict.get(key).ok()?) {
        Object::String(bytes, _) => Some(decode_pdf_string(bytes)),
        _ => None,
    }
}

/// Decode a PDF text string: UTF-16BE when BOM-prefixed, otherwise
/// byte-per-char (PDFDocEncoding is close enough to Latin-1 here).
pub(super) fn decode_pdf_string(bytes: &[u8]) -> String {
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| char::from(b)).collect()
    }
}

/// Normalize a PDF date (`D:YYYYMMDDHHMMSS±HH'MM`) to a UTC
/// `YYYY-MM-DD HH:MM:SS` string. Returns `None` for any other form.
fn pdf_date_to_utc(raw: &str) -> Option<String> {
    let rest = raw.strip_prefix("D:")?;
    if rest.len() < 20 {
        return None;
    }
    let digits = |range: std::ops::Range<usize>| rest.get(range)?.parse::<u32>().ok();

    let year = rest.get(0..4)?.parse::<i32>().ok()?;
    let month = digits(4..6)?;
    let day = digits(6..8)?;
    let hour = digits(8..10)?;
    let minute = digits(10..12)?;
    let second = digits(12..14)?;

    let sign = match rest.as_bytes().get(14)? {
        b'+' => 1i64,
        b'-' => -1i64,
        _ => return None,
    };
    let offset_hours = digits(15..17)?;
    if rest.as_bytes().get(17) != Some(&b'\'') {
        return None;
    }
    let offset_minutes = digits(18..20)?;

    let local = chrono::NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)?;
    let offset = sign * (i64::from(offset_hours) * 60 + i64::from(offset_minutes));
    let utc = local - chrono::Duration::minutes(offset);
    Some(utc.format("%Y-%m-%d %H:%M:%S").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::{dictionary, Stream};
    use std::path::Path;

    /// Build a single-page PDF with positioned text and optional
    /// annotation dictionaries, saved into `pages_dir` under `hash`.
    pub(super) fn write_page_pdf(pages_dir: &Path, hash: &str, text: &str, annots: Vec<Dictionary>) {
        let mut doc = Document::with_version("1.7");

        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let content = format!(
            "BT /F1 12 Tf 100 700 Td ({}) Tj ET",
            text.replace('\\', "\\\\")
                .replace('(', "\\(")
                .replace(')', "\\)")
        );
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.into_bytes()));

        let annot_ids: Vec<Object> = annots
            .into_iter()
            .map(|dict| doc.add_object(dict).into())
            .collect();

        let mut page = dictionary! {
            "Type" => "Page",
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Resources" => resources_id,
            "Contents" => content_id,
        };
        if !annot_ids.is_empty() {
            page.set("Annots", annot_ids);
        }
        let page_id = doc.add_object(page);

        let pages_id = doc.add_object(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        });
        if let Ok(Object::Dictionary(dict)) = doc.get_object_mut(page_id) {
            dict.set("Parent", pages_id);
        }

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer).unwrap();
        std::fs::write(pages_dir.join(format!("{hash}.pdf")), buffer).unwrap();
    }

    fn text_annotation(contents: &str) -> Dictionary {
        dictionary! {
            "Type" => "Annot",
            "Subtype" => "Text",
            "T" => Object::string_literal("reader"),
            "Contents" => Object::string_literal(contents),
            "CreationDate" => Object::string_literal("D:20240102030405+02'00"),
        }
    }

    #[test]
    fn snapshot_and_annotations_are_written() {
        let dir = tempfile::tempdir().unwrap();
        write_page_pdf(
            dir.path(),
            "page-a",
            "Hello layout",
            vec![text_annotation("a note")],
        );

        let extractor = PdfExtractor::new(dir.path().to_path_buf());
        extractor.extract_page("page-a").unwrap();

        let snapshot = extractor.read_snapshot("page-a");
        assert!(!snapshot.trim().is_empty());

        let annotations = extractor.read_annotations("page-a");
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].kind.as_deref(), Some("Text"));
        assert_eq!(annotations[0].title.as_deref(), Some("reader"));
        assert_eq!(annotations[0].content.as_deref(), Some("a note"));
        assert_eq!(
            annotations[0].created_at.as_deref(),
            Some("2024-01-02 01:04:05")
        );
    }

    #[test]
    fn annotation_without_text_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dictionary! {
            "Type" => "Annot",
            "Subtype" => "Square",
        };
        write_page_pdf(dir.path(), "page-b", "content", vec![bare]);

        let extractor = PdfExtractor::new(dir.path().to_path_buf());
        extractor.extract_page("page-b").unwrap();
        assert!(extractor.read_annotations("page-b").is_empty());
        assert!(!dir.path().join("page-b.annotation.json").exists());
    }

    #[test]
    fn whitespace_page_writes_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_page_pdf(dir.path(), "page-c", "   ", vec![]);

        let extractor = PdfExtractor::new(dir.path().to_path_buf());
        extractor.extract_page("page-c").unwrap();
        assert!(!dir.path().join("page-c.snapshot.txt").exists());
        assert_eq!(extractor.read_snapshot("page-c"), "");
    }

    #[test]
    fn quad_points_resolve_selected_text() {
        let dir = tempfile::tempdir().unwrap();
        // Text starts at (100, 700) at size 12; Helvetica here carries no
        // Widths table so glyphs advance 6pt. A generous quad around the
        // line selects every character.
        let mut annot = text_annotation("highlight");
        annot.set("Subtype", "Highlight");
        annot.set(
            "QuadPoints",
            vec![
                90.into(),
                690.into(),
                220.into(),
                690.into(),
                90.into(),
                715.into(),
                220.into(),
                715.into(),
            ],
        );
        write_page_pdf(dir.path(), "page-d", "Identification", vec![annot]);

        let extractor = PdfExtractor::new(dir.path().to_path_buf());
        extractor.extract_page("page-d").unwrap();

        let annotations = extractor.read_annotations("page-d");
        assert_eq!(annotations.len(), 1);
        assert_eq!(
            annotations[0].extracted_text.as_deref(),
            Some("Identification")
        );
    }

    #[test]
    fn remove_page_clears_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        write_page_pdf(dir.path(), "page-e", "bye", vec![text_annotation("x")]);

        let extractor = PdfExtractor::new(dir.path().to_path_buf());
        extractor.extract_page("page-e").unwrap();
        extractor.remove_page("page-e");

        assert!(!dir.path().join("page-e.pdf").exists());
        assert!(!dir.path().join("page-e.snapshot.txt").exists());
        assert!(!dir.path().join("page-e.annotation.json").exists());
    }

    #[test]
    fn pdf_dates_normalize_to_utc() {
        assert_eq!(
            pdf_date_to_utc("D:20240102030405+02'00").as_deref(),
            Some("2024-01-02 01:04:05")
        );
        assert_eq!(
            pdf_date_to_utc("D:20231231230000-01'30").as_deref(),
            Some("2024-01-01 00:30:00")
        );
        assert_eq!(pdf_date_to_utc("D:20240102"), None);
        assert_eq!(pdf_date_to_utc("garbage"), None);
    }

    #[test]
    fn utf16_strings_decode() {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in "héllo".encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        assert_eq!(decode_pdf_string(&bytes), "héllo");
        assert_eq!(decode_pdf_string(b"plain"), "plain");
    }
}

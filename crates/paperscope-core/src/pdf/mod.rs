//! PDF deduplication and extraction pipeline.
//!
//! A PDF is identified by the hash of its whole bytes; each of its pages
//! by the hash of a deterministically-serialized single-page PDF. Pages
//! shared between documents (a common cover, a duplicated file) therefore
//! collapse to one cached artifact set, parsed and indexed exactly once.
//! The `pages` table is the reference graph: a page's artifacts exist iff
//! some row references its hash.

mod extractor;
mod layout;

pub use extractor::{Annotation, PdfExtractor};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use lopdf::{Document, Object};
use rusqlite::{params, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::hash;
use crate::progress::ProgressReporter;
use crate::store::StorePool;

const PAGES_SCHEMA: &str = "
CREATE TABLE pages (
    id INTEGER PRIMARY KEY,
    pdf_hash TEXT NOT NULL,
    page_index INTEGER NOT NULL,
    page_hash TEXT NOT NULL
);
CREATE UNIQUE INDEX idx_pdf_pages ON pages (pdf_hash, page_index);
CREATE INDEX idx_page_pages ON pages (page_hash);
";

/// Outcome of (re)registering a PDF with the page cache.
///
/// `added` pages had no reference before this call and now have cached
/// artifacts; `removed` pages lost their last reference, and the caller
/// retires their index nodes and then evicts the artifacts.
#[derive(Debug)]
pub struct PdfUpdate {
    pub page_hashes: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Owns the page cache directory, its `pages.db` bookkeeping, and the
/// artifact extractor.
pub struct PdfParser {
    store: StorePool,
    conn: Connection,
    temp_dir: PathBuf,
    extractor: PdfExtractor,
}

impl PdfParser {
    pub fn new(store: StorePool, cache_dir: &Path, temp_dir: &Path) -> Result<Self> {
        let pages_dir = cache_dir.join("pages");
        std::fs::create_dir_all(&pages_dir)?;
        std::fs::create_dir_all(temp_dir)?;
        let conn = store.open(&cache_dir.join("pages.db"), PAGES_SCHEMA)?;
        Ok(Self {
            store,
            conn,
            temp_dir: temp_dir.to_path_buf(),
            extractor: PdfExtractor::new(pages_dir),
        })
    }

    pub fn extractor(&self) -> &PdfExtractor {
        &self.extractor
    }

    /// Split `path` into cached single-page PDFs and atomically replace
    /// the `pages` rows for `pdf_hash`. Artifacts are extracted for every
    /// newly-referenced page before returning.
    pub fn add_file(
        &mut self,
        pdf_hash: &str,
        path: &Path,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PdfUpdate> {
        let origin = self.page_hashes(pdf_hash)?;
        let (page_hashes, metadata) = self.split_pages(path, progress, cancel)?;
        let (added, removed) = self.replace_pages(pdf_hash, &origin, &page_hashes)?;

        for page_hash in &added {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            self.extractor.extract_page(page_hash)?;
        }

        tracing::debug!(
            pdf = %pdf_hash,
            pages = page_hashes.len(),
            added = added.len(),
            removed = removed.len(),
            "Registered PDF"
        );

        Ok(PdfUpdate {
            page_hashes,
            added,
            removed,
            metadata,
        })
    }

    /// Drop a PDF's `pages` rows; returns the page hashes that lost their
    /// last reference. The caller retires index nodes, then calls
    /// [`PdfParser::evict_page`] for each.
    pub fn remove_file(&mut self, pdf_hash: &str) -> Result<Vec<String>> {
        let origin = self.page_hashes(pdf_hash)?;
        self.store.with_tx(&mut self.conn, |tx| {
            tx.execute("DELETE FROM pages WHERE pdf_hash = ?1", [pdf_hash])?;

            let mut removed = Vec::new();
            for page_hash in dedup(&origin) {
                let referenced: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM pages WHERE page_hash = ?1 LIMIT 1",
                        [page_hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                if referenced.is_none() {
                    removed.push(page_hash.to_string());
                }
            }
            Ok(removed)
        })
    }

    /// Remove a page's cached artifacts.
    pub fn evict_page(&self, page_hash: &str) {
        self.extractor.remove_page(page_hash);
    }

    /// Ordered page hashes of a registered PDF.
    pub fn page_hashes(&self, pdf_hash: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT page_hash FROM pages WHERE pdf_hash = ?1 ORDER BY page_index",
        )?;
        let hashes = stmt
            .query_map([pdf_hash], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(hashes)
    }

    /// Every `(pdf_hash, page_index)` pair referencing a page.
    pub fn pages_referencing(&self, page_hash: &str) -> Result<Vec<(String, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT pdf_hash, page_index FROM pages WHERE page_hash = ?1 ORDER BY pdf_hash, page_index",
        )?;
        let rows = stmt
            .query_map([page_hash], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The page hash at `page_index` of a registered PDF.
    pub fn page_hash_at(&self, pdf_hash: &str, page_index: usize) -> Result<Option<String>> {
        let hash = self
            .conn
            .query_row(
                "SELECT page_hash FROM pages WHERE pdf_hash = ?1 AND page_index = ?2",
                params![pdf_hash, page_index as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// True when some registered PDF references this page.
    pub fn page_is_known(&self, page_hash: &str) -> Result<bool> {
        let row: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM pages WHERE page_hash = ?1 LIMIT 1",
                [page_hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// Emit one deterministic single-page PDF per page into a scratch
    /// directory, hash each, and move new ones into the cache.
    fn split_pages(
        &self,
        path: &Path,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(Vec<String>, BTreeMap<String, String>)> {
        let doc = Document::load(path)?;
        let metadata = info_metadata(&doc);
        let page_count = doc.get_pages().len();

        let temp = tempfile::tempdir_in(&self.temp_dir)?;
        for index in 0..page_count {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let bytes = single_page_bytes(&doc, index as u32 + 1, page_count as u32)?;
            std::fs::write(temp.path().join(format!("{index}.pdf")), bytes)?;
            progress.on_complete_handle_pdf_page(index, page_count);
        }

        let mut page_hashes = Vec::with_capacity(page_count);
        for index in 0..page_count {
            let page_file = temp.path().join(format!("{index}.pdf"));
            let page_hash = hash::hash_file(&page_file)?;
            let target = self.extractor.pdf_path(&page_hash);

            if target.is_dir() {
                // A stale directory squatting on the cache path.
                std::fs::remove_dir_all(&target)?;
            }
            if !target.exists() {
                // Two workers may race here; either rename wins and both
                // wrote identical bytes.
                std::fs::rename(&page_file, &target)?;
            }
            page_hashes.push(page_hash);
        }

        Ok((page_hashes, metadata))
    }

    /// Atomically swap the `pages` rows for `pdf_hash` and compute which
    /// page hashes gained their first reference or lost their last one.
    fn replace_pages(
        &mut self,
        pdf_hash: &str,
        origin: &[String],
        new: &[String],
    ) -> Result<(Vec<String>, Vec<String>)> {
        let origin_set: BTreeSet<&str> = origin.iter().map(String::as_str).collect();
        let new_set: BTreeSet<&str> = new.iter().map(String::as_str).collect();

        self.store.with_tx(&mut self.conn, |tx| {
            tx.execute("DELETE FROM pages WHERE pdf_hash = ?1", [pdf_hash])?;
            for (index, page_hash) in new.iter().enumerate() {
                tx.execute(
                    "INSERT INTO pages (pdf_hash, page_index, page_hash) VALUES (?1, ?2, ?3)",
                    params![pdf_hash, index as i64, page_hash],
                )?;
            }

            let mut added = Vec::new();
            for page_hash in new_set.difference(&origin_set) {
                let owners: i64 = tx.query_row(
                    "SELECT COUNT(DISTINCT pdf_hash) FROM pages WHERE page_hash = ?1",
                    [page_hash],
                    |row| row.get(0),
                )?;
                if owners == 1 {
                    added.push((*page_hash).to_string());
                }
            }

            let mut removed = Vec::new();
            for page_hash in origin_set.difference(&new_set) {
                let referenced: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM pages WHERE page_hash = ?1 LIMIT 1",
                        [page_hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                if referenced.is_none() {
                    removed.push((*page_hash).to_string());
                }
            }
            Ok((added, removed))
        })
    }
}

fn dedup(hashes: &[String]) -> BTreeSet<&str> {
    hashes.iter().map(String::as_str).collect()
}

/// Serialize one page as a standalone PDF with content-derived identity:
/// trailer `ID` and the Info dictionary are stripped and objects are
/// renumbered, so equal page content produces equal bytes regardless of
/// the containing document.
fn single_page_bytes(doc: &Document, page_number: u32, page_count: u32) -> Result<Vec<u8>> {
    let mut page_doc = doc.clone();

    // Delete highest-numbered pages first so remaining numbers stay valid.
    for number in (1..=page_count).rev() {
        if number != page_number {
            page_doc.delete_pages(&[number]);
        }
    }

    page_doc.trailer.remove(b"Info");
    page_doc.trailer.remove(b"ID");
    page_doc.prune_objects();
    page_doc.renumber_objects();
    page_doc.compress();

    let mut buffer = Vec::new();
    page_doc.save_to(&mut buffer)?;
    Ok(buffer)
}

/// The document Info dictionary as sorted string pairs.
fn info_metadata(doc: &Document) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    let info = match doc.trailer.get(b"Info") {
        Ok(Object::Reference(id)) => doc.get_dictionary(*id).ok(),
        Ok(Object::Dictionary(dict)) => Some(dict),
        _ => None,
    };
    if let Some(info) = info {
        for (key, value) in info.iter() {
            if let Object::String(bytes, _) = value {
                metadata.insert(
                    String::from_utf8_lossy(key).into_owned(),
                    extractor::decode_pdf_string(bytes),
                );
            }
        }
    }
    metadata
}

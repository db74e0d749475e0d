//! Hybrid index coordination.
//!
//! The coordinator translates file events into the pdf-hash lifecycle: it
//! owns the `files` table linking user-visible paths to pdf hashes,
//! drives the page cache through [`PdfParser`], and writes every index
//! node to both backends in lock-step. Reference counting happens at two
//! levels (pdf hashes via `files` rows, page hashes via `pages` rows) so
//! shared content is parsed and indexed exactly once.

pub mod fts;
pub mod vector;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::Workspace;
use crate::embeddings::Embedder;
use crate::error::{Error, Result};
use crate::hash;
use crate::pdf::PdfParser;
use crate::progress::ProgressReporter;
use crate::scanner::{Event, EventKind, EventTarget, Scanner};
use crate::segment::Segmentation;
use crate::store::StorePool;

use fts::{FtsIndex, MatchMode};
use vector::VectorIndex;

pub const NODE_TYPE_PDF: &str = "pdf";
pub const NODE_TYPE_PAGE: &str = "pdf.page";
pub const NODE_TYPE_ANNO_CONTENT: &str = "pdf.page.anno.content";
pub const NODE_TYPE_ANNO_EXTRACTED: &str = "pdf.page.anno.extracted";

const INDEX_SCHEMA: &str = "
CREATE TABLE files (
    id INTEGER PRIMARY KEY,
    type TEXT NOT NULL,
    scope TEXT NOT NULL,
    path TEXT NOT NULL,
    hash TEXT NOT NULL
);
CREATE INDEX idx_files_hash ON files (hash);
CREATE INDEX idx_files_scope_path ON files (scope, path);
";

/// Which retrieval tier produced a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMatching {
    /// Every query token matched.
    Matched,
    /// Some but not all query tokens matched.
    MatchedPartial,
    /// Embedding nearest neighbor.
    Similarity,
}

impl IndexMatching {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexMatching::Matched => "matched",
            IndexMatching::MatchedPartial => "matched_partial",
            IndexMatching::Similarity => "similarity",
        }
    }
}

/// An identified unit indexed in both backends, as returned by the
/// three-tier resolver.
#[derive(Debug, Clone)]
pub struct IndexNode {
    pub id: String,
    pub matching: IndexMatching,
    pub metadata: Value,
    /// Lexical tier rank (0 for similarity hits).
    pub rank: f64,
    /// Vector distance (0 for lexical hits).
    pub distance: f64,
    /// Byte spans of the node's segments in its source text.
    pub segments: Vec<(usize, usize)>,
}

/// One worker's view of the whole index: private connections to the
/// `files` table, both backends, and the page cache.
pub struct Index {
    store: StorePool,
    conn: Connection,
    fts: FtsIndex,
    vector: VectorIndex,
    parser: PdfParser,
    segmentation: Segmentation,
    sources: BTreeMap<String, PathBuf>,
}

impl Index {
    pub fn open(
        store: StorePool,
        workspace: &Workspace,
        sources: BTreeMap<String, PathBuf>,
        embedder: Arc<Embedder>,
    ) -> Result<Self> {
        let conn = store.open(&workspace.index_db(), INDEX_SCHEMA)?;
        let fts = FtsIndex::open(store.clone(), &workspace.fts_db())?;
        let vector = VectorIndex::open(
            store.clone(),
            &workspace.vector_dir().join("vectors.sqlite3"),
            embedder,
        )?;
        let parser = PdfParser::new(store.clone(), &workspace.pdf_cache_dir(), &workspace.temp_dir())?;

        Ok(Self {
            store,
            conn,
            fts,
            vector,
            parser,
            segmentation: Segmentation::new(),
            sources,
        })
    }

    pub fn parser(&self) -> &PdfParser {
        &self.parser
    }

    /// Absolute path of a scope-relative path, if the scope is configured.
    pub fn resolve_path(&self, scope: &str, relative: &str) -> Option<PathBuf> {
        self.sources
            .get(scope)
            .map(|root| Scanner::abs_path(root, relative))
    }

    /// Apply one file event to the index.
    pub async fn handle_event(
        &mut self,
        event: &Event,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(abs_path) = self.filter_event(event) else {
            return Ok(());
        };

        let origin: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, hash FROM files WHERE scope = ?1 AND path = ?2",
                params![event.scope, event.path],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        // The reference-count checks run inside the same transaction as
        // the row mutation: SQLite serializes writers, so for any hash
        // exactly one worker observes the 0->1 or 1->0 transition.
        let mut found: Option<String> = None;
        let mut lost: Option<String> = None;

        if event.kind != EventKind::Removed {
            let hashed = hash::hash_file(&abs_path)?;
            let origin_row = origin.clone();
            let (did_update, is_first, origin_lost) =
                self.store.with_tx(&mut self.conn, |tx| {
                    match &origin_row {
                        None => {
                            tx.execute(
                                "INSERT INTO files (type, scope, path, hash)
                                 VALUES ('pdf', ?1, ?2, ?3)",
                                params![event.scope, event.path, hashed],
                            )?;
                        }
                        Some((id, origin_hash)) if origin_hash != &hashed => {
                            tx.execute(
                                "UPDATE files SET hash = ?1 WHERE id = ?2",
                                params![hashed, id],
                            )?;
                        }
                        Some(_) => return Ok((false, false, None)),
                    }

                    let references: i64 = tx.query_row(
                        "SELECT COUNT(*) FROM files WHERE hash = ?1",
                        [&hashed],
                        |row| row.get(0),
                    )?;

                    let origin_lost = match &origin_row {
                        Some((_, origin_hash)) if origin_hash != &hashed => {
                            let still: Option<i64> = tx
                                .query_row(
                                    "SELECT 1 FROM files WHERE hash = ?1 LIMIT 1",
                                    [origin_hash],
                                    |row| row.get(0),
                                )
                                .optional()?;
                            still.is_none().then(|| origin_hash.clone())
                        }
                        _ => None,
                    };
                    Ok((true, references == 1, origin_lost))
                })?;

            if !did_update {
                return Ok(());
            }
            if is_first {
                found = Some(hashed);
            }
            lost = origin_lost;
        } else {
            let Some((id, origin_hash)) = origin else {
                return Ok(());
            };
            lost = self.store.with_tx(&mut self.conn, |tx| {
                tx.execute("DELETE FROM files WHERE id = ?1", [id])?;
                let still: Option<i64> = tx
                    .query_row(
                        "SELECT 1 FROM files WHERE hash = ?1 LIMIT 1",
                        [&origin_hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(still.is_none().then(|| origin_hash.clone()))
            })?;
        }

        if let Some(pdf_hash) = &found {
            self.found_pdf_hash(pdf_hash, &abs_path, progress, cancel)
                .await?;
        }
        if let Some(pdf_hash) = &lost {
            self.lost_pdf_hash(pdf_hash)?;
        }

        Ok(())
    }

    /// Three-tier retrieval: strict lexical, relaxed lexical, then vector
    /// nearest neighbors, deduplicated across tiers.
    pub async fn query(
        &self,
        text: &str,
        results_limit: usize,
    ) -> Result<(Vec<IndexNode>, Vec<String>)> {
        let keywords = self.segmentation.to_keywords(text);
        if keywords.is_empty() {
            return Ok((Vec::new(), keywords));
        }

        let mut nodes: Vec<IndexNode> = self
            .fts
            .query(&keywords, MatchMode::Strict, results_limit)?
            .into_iter()
            .map(|n| fts_node_to_index(n, IndexMatching::Matched))
            .collect();
        nodes.sort_by(|a, b| b.rank.total_cmp(&a.rank));

        if nodes.len() >= results_limit {
            return Ok((nodes, keywords));
        }

        let mut partial: Vec<IndexNode> = self
            .fts
            .query(&keywords, MatchMode::Relaxed, results_limit - nodes.len())?
            .into_iter()
            .map(|n| fts_node_to_index(n, IndexMatching::MatchedPartial))
            .collect();
        partial.sort_by(|a, b| b.rank.total_cmp(&a.rank));

        let seen: HashSet<String> = nodes
            .iter()
            .chain(partial.iter())
            .map(|n| n.id.clone())
            .collect();
        nodes.append(&mut partial);

        let normalized = keywords.join(" ");
        let similar = self.vector.query(&normalized, results_limit).await?;
        nodes.extend(similar.into_iter().filter(|n| !seen.contains(&n.id)));

        Ok((nodes, keywords))
    }

    /// Every `(absolute pdf path, page index)` where this page appears in
    /// a user-visible PDF.
    pub fn pdf_files_for_page(&self, page_hash: &str) -> Result<Vec<(PathBuf, usize)>> {
        let mut result = Vec::new();
        for (pdf_hash, page_index) in self.parser.pages_referencing(page_hash)? {
            let mut stmt = self
                .conn
                .prepare("SELECT scope, path FROM files WHERE hash = ?1 ORDER BY scope, path")?;
            let rows = stmt
                .query_map([&pdf_hash], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (scope, path) in rows {
                if let Some(abs) = self.resolve_path(&scope, &path) {
                    result.push((abs, page_index));
                }
            }
        }
        Ok(result)
    }

    /// The snapshot text of a PDF's n-th page, empty when unknown.
    pub fn page_content(&self, pdf_hash: &str, page_index: usize) -> Result<String> {
        let Some(page_hash) = self.parser.page_hash_at(pdf_hash, page_index)? else {
            return Ok(String::new());
        };
        Ok(self.parser.extractor().read_snapshot(&page_hash))
    }

    /// Events that never touch the index: directories, non-PDF files,
    /// unknown scopes.
    fn filter_event(&self, event: &Event) -> Option<PathBuf> {
        if event.target == EventTarget::Directory {
            return None;
        }
        let is_pdf = Path::new(&event.path)
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if !is_pdf {
            return None;
        }
        self.resolve_path(&event.scope, &event.path)
    }

    /// A pdf hash gained its first reference: split, extract, and index.
    async fn found_pdf_hash(
        &mut self,
        pdf_hash: &str,
        path: &Path,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let update = match self.parser.add_file(pdf_hash, path, progress, cancel) {
            Ok(update) => update,
            Err(Error::Pdf(reason)) => {
                // Unparseable input is a no-op event; the file row keeps
                // its hash and no nodes are emitted.
                tracing::warn!(path = %path.display(), reason = %reason, "Skipping unparseable PDF");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if update.page_hashes.is_empty() {
            tracing::warn!(path = %path.display(), "PDF produced zero pages");
        } else {
            self.save_node(pdf_hash, NODE_TYPE_PDF, &metadata_document(&update.metadata))
                .await?;
        }

        let total = update.page_hashes.len();
        let added: HashSet<&str> = update.added.iter().map(String::as_str).collect();
        let mut indexed: HashSet<&str> = HashSet::new();

        for (page_index, page_hash) in update.page_hashes.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            if added.contains(page_hash.as_str()) && indexed.insert(page_hash.as_str()) {
                self.index_page(page_hash).await?;
            }
            progress.on_complete_index_pdf_page(page_index, total);
        }

        // Pages that lost their last reference in the swap.
        for page_hash in &update.removed {
            self.remove_page_nodes(page_hash)?;
            self.parser.evict_page(page_hash);
        }

        tracing::info!(pdf = %pdf_hash, pages = total, "Indexed PDF");
        Ok(())
    }

    /// A pdf hash lost its last reference: retire its nodes and evict
    /// newly-orphaned pages.
    fn lost_pdf_hash(&mut self, pdf_hash: &str) -> Result<()> {
        let removed = self.parser.remove_file(pdf_hash)?;
        self.remove_node(pdf_hash)?;

        for page_hash in &removed {
            self.remove_page_nodes(page_hash)?;
            self.parser.evict_page(page_hash);
        }

        tracing::info!(pdf = %pdf_hash, evicted = removed.len(), "Retired PDF");
        Ok(())
    }

    /// Emit the `pdf.page` node and annotation nodes for a freshly cached
    /// page.
    async fn index_page(&mut self, page_hash: &str) -> Result<()> {
        let snapshot = self.parser.extractor().read_snapshot(page_hash);
        if !snapshot.chars().all(char::is_whitespace) {
            self.save_node(page_hash, NODE_TYPE_PAGE, &snapshot).await?;
        }

        let annotations = self.parser.extractor().read_annotations(page_hash);
        for (index, annotation) in annotations.iter().enumerate() {
            if let Some(content) = &annotation.content {
                self.save_node(
                    &format!("{page_hash}/anno/{index}/content"),
                    NODE_TYPE_ANNO_CONTENT,
                    content,
                )
                .await?;
            }
            if let Some(extracted) = &annotation.extracted_text {
                self.save_node(
                    &format!("{page_hash}/anno/{index}/extracted"),
                    NODE_TYPE_ANNO_EXTRACTED,
                    extracted,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Retire every node belonging to a page (body plus annotations).
    /// Runs while the page's artifacts still exist so the annotation
    /// count is known.
    fn remove_page_nodes(&mut self, page_hash: &str) -> Result<()> {
        let annotations = self.parser.extractor().read_annotations(page_hash);
        for index in 0..annotations.len() {
            self.remove_node(&format!("{page_hash}/anno/{index}/content"))?;
            self.remove_node(&format!("{page_hash}/anno/{index}/extracted"))?;
        }
        self.remove_node(page_hash)
    }

    /// Write one node to both backends.
    async fn save_node(&mut self, node_id: &str, node_type: &str, text: &str) -> Result<()> {
        let segments = self.segmentation.split(text);
        if segments.is_empty() {
            return Ok(());
        }
        let metadata = serde_json::json!({ "type": node_type });
        self.fts.save(node_id, &metadata, &segments)?;
        self.vector.save(node_id, &metadata, &segments).await?;
        Ok(())
    }

    fn remove_node(&mut self, node_id: &str) -> Result<()> {
        self.fts.remove(node_id)?;
        self.vector.remove(node_id)?;
        Ok(())
    }
}

fn fts_node_to_index(node: fts::FtsNode, matching: IndexMatching) -> IndexNode {
    IndexNode {
        id: node.id,
        matching,
        metadata: node.metadata,
        rank: node.rank,
        distance: 0.0,
        segments: node.segments,
    }
}

/// Render the PDF Info dictionary as an indexable text document, keys
/// sorted.
fn metadata_document(metadata: &BTreeMap<String, String>) -> String {
    let mut text = String::new();
    for (key, value) in metadata {
        text.push_str(key);
        text.push_str(": ");
        text.push_str(value);
        text.push('\n');
    }
    text
}

//! Query result trimming: index nodes -> page-level hits with highlights.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::error::Result;
use crate::index::{
    Index, IndexMatching, IndexNode, NODE_TYPE_ANNO_CONTENT, NODE_TYPE_PAGE,
};

/// Final result of a query: page items plus the keyword list the query
/// tokenized into (also used for the highlight spans).
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub items: Vec<PageQueryItem>,
    pub keywords: Vec<String>,
}

/// One distinct page-hash hit.
#[derive(Debug, Clone)]
pub struct PageQueryItem {
    /// Where this page appears in user-visible PDFs.
    pub pdf_files: Vec<PagePdfFile>,
    /// Minimum vector distance over the nodes that contributed (0 when a
    /// lexical node did).
    pub distance: f64,
    /// The page's text snapshot.
    pub content: String,
    /// Matched body segments with their highlight spans.
    pub segments: Vec<PageHighlightSegment>,
    /// Annotation hits on this page, ordered by annotation index.
    pub annotations: Vec<PageAnnoQueryItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePdfFile {
    pub pdf_path: PathBuf,
    pub page_index: usize,
}

#[derive(Debug, Clone)]
pub struct PageAnnoQueryItem {
    pub index: usize,
    pub content: String,
    pub segments: Vec<PageHighlightSegment>,
}

/// A matched segment span plus the keyword occurrences inside it, as byte
/// ranges relative to the segment start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHighlightSegment {
    pub start: usize,
    pub end: usize,
    pub highlights: Vec<(usize, usize)>,
}

/// Trim resolver output to page granularity.
///
/// `pdf.page` nodes become page items; `pdf.page.anno.content` nodes
/// attach to their page's item (creating it if the page body itself did
/// not match). Other node types contribute to retrieval only.
pub fn trim_nodes(
    index: &Index,
    nodes: &[IndexNode],
    keywords: &[String],
) -> Result<Vec<PageQueryItem>> {
    let mut items: Vec<PageQueryItem> = Vec::new();
    let mut by_page: HashMap<String, usize> = HashMap::new();

    for node in nodes {
        let node_type = node
            .metadata
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let keep_empty = node.matching == IndexMatching::Similarity;

        match node_type {
            NODE_TYPE_PAGE => {
                let Some(slot) = ensure_item(index, &mut items, &mut by_page, &node.id)? else {
                    continue;
                };
                let item = &mut items[slot];
                item.distance = item.distance.min(node.distance);
                item.segments =
                    highlight_segments(&item.content, &node.segments, keywords, keep_empty);
            }
            NODE_TYPE_ANNO_CONTENT => {
                let Some((page_hash, anno_index)) = parse_anno_id(&node.id) else {
                    continue;
                };
                let Some(slot) = ensure_item(index, &mut items, &mut by_page, page_hash)? else {
                    continue;
                };
                let annotations = index.parser().extractor().read_annotations(page_hash);
                let Some(content) = annotations
                    .get(anno_index)
                    .and_then(|a| a.content.clone())
                else {
                    continue;
                };

                let segments = highlight_segments(&content, &node.segments, keywords, keep_empty);
                let item = &mut items[slot];
                item.distance = item.distance.min(node.distance);
                item.annotations.push(PageAnnoQueryItem {
                    index: anno_index,
                    content,
                    segments,
                });
            }
            _ => {}
        }
    }

    for item in &mut items {
        item.annotations.sort_by_key(|a| a.index);
    }
    Ok(items)
}

/// Look up or create the page item for `page_hash`. Returns `None` when
/// the page is unknown to the cache (stale index entry).
fn ensure_item(
    index: &Index,
    items: &mut Vec<PageQueryItem>,
    by_page: &mut HashMap<String, usize>,
    page_hash: &str,
) -> Result<Option<usize>> {
    if let Some(&slot) = by_page.get(page_hash) {
        return Ok(Some(slot));
    }
    if !index.parser().page_is_known(page_hash)? {
        tracing::debug!(page = %page_hash, "Hit for unknown page dropped");
        return Ok(None);
    }

    let pdf_files = index
        .pdf_files_for_page(page_hash)?
        .into_iter()
        .map(|(pdf_path, page_index)| PagePdfFile {
            pdf_path,
            page_index,
        })
        .collect();

    items.push(PageQueryItem {
        pdf_files,
        distance: f64::INFINITY,
        content: index.parser().extractor().read_snapshot(page_hash),
        segments: Vec::new(),
        annotations: Vec::new(),
    });
    let slot = items.len() - 1;
    by_page.insert(page_hash.to_string(), slot);
    Ok(Some(slot))
}

/// `<page-hash>/anno/<idx>/content` -> (page hash, annotation index).
fn parse_anno_id(node_id: &str) -> Option<(&str, usize)> {
    let mut parts = node_id.split('/');
    let page_hash = parts.next()?;
    if parts.next()? != "anno" {
        return None;
    }
    let index = parts.next()?.parse().ok()?;
    Some((page_hash, index))
}

/// Locate every keyword inside each matched segment (case-insensitive)
/// and emit sub-ranges relative to the segment start. Lexical matches
/// drop segments without hits; similarity matches keep them so the
/// reader still sees the semantic hit.
fn highlight_segments(
    content: &str,
    spans: &[(usize, usize)],
    keywords: &[String],
    keep_empty: bool,
) -> Vec<PageHighlightSegment> {
    let mut segments = Vec::new();

    for &(start, end) in spans {
        let Some(slice) = content.get(start..end) else {
            continue;
        };
        // Keywords are already lowercase. Case folding that changes byte
        // length would desynchronize the offsets, so fall back to the raw
        // slice in that (rare) case.
        let lowered = slice.to_lowercase();
        let haystack: &str = if lowered.len() == slice.len() {
            &lowered
        } else {
            slice
        };

        let mut highlights = Vec::new();
        for keyword in keywords {
            let mut from = 0;
            while let Some(found) = haystack[from..].find(keyword.as_str()) {
                let at = from + found;
                highlights.push((at, at + keyword.len()));
                from = at + keyword.len().max(1);
            }
        }
        highlights.sort_unstable();
        highlights.dedup();

        if highlights.is_empty() && !keep_empty {
            continue;
        }
        segments.push(PageHighlightSegment {
            start,
            end,
            highlights,
        });
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highlights_are_relative_to_segment_start() {
        let content = "prefix Identification suffix";
        let spans = [(7, content.len())];
        let keywords = vec!["identification".to_string()];

        let segments = highlight_segments(content, &spans, &keywords, false);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].highlights, vec![(0, "identification".len())]);
    }

    #[test]
    fn repeated_keywords_all_found_and_sorted() {
        let content = "dog cat dog bird dog";
        let spans = [(0, content.len())];
        let keywords = vec!["dog".to_string(), "bird".to_string()];

        let segments = highlight_segments(content, &spans, &keywords, false);
        assert_eq!(
            segments[0].highlights,
            vec![(0, 3), (8, 11), (12, 16), (17, 20)]
        );
    }

    #[test]
    fn lexical_segments_without_hits_are_dropped() {
        let content = "nothing to see here";
        let spans = [(0, content.len())];
        let keywords = vec!["missing".to_string()];

        assert!(highlight_segments(content, &spans, &keywords, false).is_empty());
        // Similarity hits keep the segment visible.
        let kept = highlight_segments(content, &spans, &keywords, true);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].highlights.is_empty());
    }

    #[test]
    fn out_of_range_spans_are_skipped() {
        let content = "short";
        let spans = [(0, 1000)];
        assert!(highlight_segments(content, &spans, &["s".to_string()], true).is_empty());
    }

    #[test]
    fn anno_ids_parse() {
        assert_eq!(parse_anno_id("hash/anno/3/content"), Some(("hash", 3)));
        assert_eq!(parse_anno_id("hash/anno/x/content"), None);
        assert_eq!(parse_anno_id("hash"), None);
    }
}

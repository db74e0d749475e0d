//! Lexical index backend over SQLite FTS5.
//!
//! One logical row per node: the `contents` virtual table holds the
//! node's full token stream (all segments, space-joined) and the `nodes`
//! catalog maps it back to the node id, its metadata, and the encoded
//! segment spans. The encoding `"<token_count>:<start>-<end>"` per
//! segment, comma-joined, lets a query recover which byte span of the
//! source text each token run came from.

use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::Result;
use crate::segment::{tokenize, Segment};
use crate::store::StorePool;

const FTS_SCHEMA: &str = r#"
CREATE VIRTUAL TABLE contents USING fts5(
    content,
    tokenize = "unicode61 remove_diacritics 2"
);
CREATE TABLE nodes (
    node_id TEXT PRIMARY KEY,
    type TEXT,
    metadata TEXT NOT NULL,
    segments TEXT NOT NULL,
    content_id INTEGER NOT NULL
);
CREATE INDEX idx_nodes ON nodes (content_id);
"#;

/// How query tokens combine into an FTS expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Every token must match: `t1 AND t2 ...`
    Strict,
    /// Some-but-not-all tokens match: `(t1 OR t2 ...) NOT (t1 AND t2 ...)`
    Relaxed,
}

/// A lexical hit before tier tagging.
#[derive(Debug, Clone)]
pub struct FtsNode {
    pub id: String,
    pub metadata: Value,
    pub rank: f64,
    pub segments: Vec<(usize, usize)>,
}

pub struct FtsIndex {
    store: StorePool,
    conn: Connection,
}

impl FtsIndex {
    pub fn open(store: StorePool, path: &std::path::Path) -> Result<Self> {
        let conn = store.open(path, FTS_SCHEMA)?;
        Ok(Self { store, conn })
    }

    /// Index a node's segments. A node whose segments tokenize to nothing
    /// is skipped entirely. Re-saving an id replaces the previous row, so
    /// a replayed event converges instead of erroring.
    pub fn save(&mut self, node_id: &str, metadata: &Value, segments: &[Segment]) -> Result<()> {
        let (encoded, tokens) = encode_segments(segments);
        if encoded.is_empty() {
            return Ok(());
        }

        let document = tokens.join(" ");
        let type_tag = metadata
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let metadata_json = serde_json::to_string(metadata)?;

        self.store.with_tx(&mut self.conn, |tx| {
            let previous: Option<i64> = tx
                .query_row(
                    "SELECT content_id FROM nodes WHERE node_id = ?1",
                    [node_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(content_id) = previous {
                tx.execute("DELETE FROM contents WHERE rowid = ?1", [content_id])?;
                tx.execute("DELETE FROM nodes WHERE node_id = ?1", [node_id])?;
            }

            tx.execute("INSERT INTO contents (content) VALUES (?1)", [&document])?;
            let content_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO nodes (node_id, type, metadata, segments, content_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![node_id, type_tag, metadata_json, encoded, content_id],
            )?;
            Ok(())
        })
    }

    /// Drop a node; unknown ids are a no-op.
    pub fn remove(&mut self, node_id: &str) -> Result<()> {
        self.store.with_tx(&mut self.conn, |tx| {
            let content_id: Option<i64> = tx
                .query_row(
                    "SELECT content_id FROM nodes WHERE node_id = ?1",
                    [node_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(content_id) = content_id {
                tx.execute("DELETE FROM contents WHERE rowid = ?1", [content_id])?;
                tx.execute("DELETE FROM nodes WHERE node_id = ?1", [node_id])?;
            }
            Ok(())
        })
    }

    /// Match `tokens` against the index, stopping after `limit` rows.
    ///
    /// Rows stream out of the statement lazily; each hit decodes its
    /// segment spans and computes the tiered rank against the query.
    pub fn query(
        &self,
        tokens: &[String],
        mode: MatchMode,
        limit: usize,
    ) -> Result<Vec<FtsNode>> {
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        // Each token becomes a quoted FTS string term so nothing in it can
        // be read as FTS syntax.
        let quoted: Vec<String> = tokens.iter().map(|t| format!("\"{t}\"")).collect();
        let and_expr = quoted.join(" AND ");
        let expr = match mode {
            MatchMode::Strict => and_expr,
            MatchMode::Relaxed => format!("({}) NOT ({})", quoted.join(" OR "), and_expr),
        };

        let mut stmt = self.conn.prepare(
            "SELECT N.node_id, C.content, N.metadata, N.segments
             FROM contents C INNER JOIN nodes N ON C.rowid = N.content_id
             WHERE C.content MATCH ?1",
        )?;
        let mut rows = stmt.query([&expr])?;

        let mut nodes = Vec::new();
        while let Some(row) = rows.next()? {
            let node_id: String = row.get(0)?;
            let content: String = row.get(1)?;
            let metadata_json: String = row.get(2)?;
            let encoded: String = row.get(3)?;

            let decoded = decode_segments(&content, &encoded);
            let rank = tiered_rank(tokens, &decoded);
            nodes.push(FtsNode {
                id: node_id,
                metadata: serde_json::from_str(&metadata_json)?,
                rank,
                segments: decoded.iter().map(|s| (s.start, s.end)).collect(),
            });

            if nodes.len() >= limit {
                break;
            }
        }
        Ok(nodes)
    }
}

struct DecodedSegment {
    start: usize,
    end: usize,
    tokens: Vec<String>,
}

fn encode_segments(segments: &[Segment]) -> (String, Vec<String>) {
    let mut encoded = Vec::new();
    let mut tokens = Vec::new();

    for segment in segments {
        let segment_tokens = tokenize(&segment.text);
        if segment_tokens.is_empty() {
            continue;
        }
        encoded.push(format!(
            "{}:{}-{}",
            segment_tokens.len(),
            segment.start,
            segment.end
        ));
        tokens.extend(segment_tokens);
    }

    (encoded.join(","), tokens)
}

fn decode_segments(content: &str, encoded: &str) -> Vec<DecodedSegment> {
    let all_tokens: Vec<&str> = content.split(' ').collect();
    let mut decoded = Vec::new();
    let mut offset = 0usize;

    for part in encoded.split(',') {
        let Some((count, span)) = part.split_once(':') else {
            continue;
        };
        let Some((start, end)) = span.split_once('-') else {
            continue;
        };
        let (Ok(count), Ok(start), Ok(end)) = (
            count.parse::<usize>(),
            start.parse::<usize>(),
            end.parse::<usize>(),
        ) else {
            continue;
        };

        let segment_tokens = all_tokens
            .get(offset..(offset + count).min(all_tokens.len()))
            .unwrap_or(&[])
            .iter()
            .map(|t| t.to_string())
            .collect();
        offset += count;
        decoded.push(DecodedSegment {
            start,
            end,
            tokens: segment_tokens,
        });
    }
    decoded
}

/// Tiered rank: let `C[k]` be 1 when some segment matched exactly
/// `len(query) - k` query tokens; rank = Σ C[k] · 0.35^k. Segments
/// matching more distinct tokens dominate with exponential decay.
fn tiered_rank(query_tokens: &[String], segments: &[DecodedSegment]) -> f64 {
    let n = query_tokens.len();
    let mut matched = vec![false; n];

    for segment in segments {
        let token_set: HashSet<&str> = segment.tokens.iter().map(String::as_str).collect();
        let count = query_tokens
            .iter()
            .filter(|t| token_set.contains(t.as_str()))
            .count();
        if count > 0 {
            matched[n - count] = true;
        }
    }

    let mut rank = 0.0;
    let mut weight = 1.0;
    for hit in matched {
        if hit {
            rank += weight;
        }
        weight *= 0.35;
    }
    rank
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segmentation;
    use serde_json::json;

    fn open_index(dir: &tempfile::TempDir) -> FtsIndex {
        FtsIndex::open(StorePool::new(), &dir.path().join("fts.sqlite3")).unwrap()
    }

    fn segments_of(text: &str) -> Vec<Segment> {
        Segmentation::new().split(text)
    }

    fn query_tokens(text: &str) -> Vec<String> {
        tokenize(text)
    }

    #[test]
    fn strict_query_needs_every_token() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        index
            .save(
                "node-both",
                &json!({"type": "pdf.page"}),
                &segments_of("transference analysis in one place"),
            )
            .unwrap();
        index
            .save(
                "node-one",
                &json!({"type": "pdf.page"}),
                &segments_of("only transference here"),
            )
            .unwrap();

        let tokens = query_tokens("Transference analysis");
        let strict = index.query(&tokens, MatchMode::Strict, 10).unwrap();
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].id, "node-both");

        let relaxed = index.query(&tokens, MatchMode::Relaxed, 10).unwrap();
        assert_eq!(relaxed.len(), 1);
        assert_eq!(relaxed[0].id, "node-one");
    }

    #[test]
    fn full_match_outranks_partial_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        let tokens = query_tokens("alpha beta");

        index
            .save(
                "full",
                &json!({"type": "pdf.page"}),
                &segments_of("alpha beta together"),
            )
            .unwrap();

        let nodes = index.query(&tokens, MatchMode::Strict, 10).unwrap();
        // Both tokens in one segment: C[0] = 1 -> rank 1.0.
        assert!((nodes[0].rank - 1.0).abs() < 1e-9);

        index
            .save(
                "partial",
                &json!({"type": "pdf.page"}),
                &segments_of("alpha alone"),
            )
            .unwrap();
        let nodes = index.query(&tokens, MatchMode::Relaxed, 10).unwrap();
        // One of two tokens: C[1] = 1 -> rank 0.35.
        assert!((nodes[0].rank - 0.35).abs() < 1e-9);
    }

    #[test]
    fn segments_round_trip_through_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        let text = "first segment sentence. ".repeat(60);
        let segments = segments_of(&text);
        assert!(segments.len() > 1);

        index
            .save("node", &json!({"type": "pdf.page"}), &segments)
            .unwrap();

        let nodes = index
            .query(&query_tokens("segment"), MatchMode::Strict, 10)
            .unwrap();
        let spans: Vec<(usize, usize)> = segments.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(nodes[0].segments, spans);
    }

    #[test]
    fn empty_token_stream_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        index
            .save("noise", &json!({"type": "pdf.page"}), &segments_of("-+:!"))
            .unwrap();

        let count: i64 = index
            .conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn remove_deletes_both_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        index
            .save("gone", &json!({"type": "pdf.page"}), &segments_of("hello world"))
            .unwrap();
        index.remove("gone").unwrap();
        index.remove("never-existed").unwrap();

        for table in ["nodes", "contents"] {
            let count: i64 = index
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert_eq!(count, 0, "{table} not empty");
        }
    }

    #[test]
    fn diacritics_are_stripped_by_the_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        index
            .save("latin", &json!({"type": "pdf.page"}), &segments_of("café résumé"))
            .unwrap();

        let nodes = index
            .query(&query_tokens("cafe"), MatchMode::Strict, 10)
            .unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn resaving_a_node_replaces_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        index
            .save("n", &json!({"type": "pdf.page"}), &segments_of("old words"))
            .unwrap();
        index
            .save("n", &json!({"type": "pdf.page"}), &segments_of("new words"))
            .unwrap();

        assert!(index
            .query(&query_tokens("old"), MatchMode::Strict, 10)
            .unwrap()
            .is_empty());
        assert_eq!(
            index
                .query(&query_tokens("new"), MatchMode::Strict, 10)
                .unwrap()
                .len(),
            1
        );
    }
}

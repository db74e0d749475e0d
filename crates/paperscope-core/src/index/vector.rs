//! Embedding index backend.
//!
//! Every segment of a node is stored as one entry under the composite id
//! `<node-id>/<segment-index>`, carrying the segment's byte span inside
//! its metadata and the embedding vector as little-endian f32 bytes.
//! Queries run a cosine nearest-neighbor scan, then regroup entries by
//! node-id stem.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::embeddings::{cosine_distance, Embedder};
use crate::error::Result;
use crate::segment::Segment;
use crate::store::StorePool;

use super::{IndexMatching, IndexNode};

const VECTOR_SCHEMA: &str = "
CREATE TABLE embeddings (
    id TEXT PRIMARY KEY,
    metadata TEXT NOT NULL,
    embedding BLOB NOT NULL
);
";

/// Removal walks composite ids in chunks of this size until a probe
/// misses.
const REMOVE_GROUP_SIZE: usize = 25;

pub struct VectorIndex {
    store: StorePool,
    conn: Connection,
    embedder: Arc<Embedder>,
}

impl VectorIndex {
    pub fn open(store: StorePool, path: &Path, embedder: Arc<Embedder>) -> Result<Self> {
        let conn = store.open(path, VECTOR_SCHEMA)?;
        Ok(Self {
            store,
            conn,
            embedder,
        })
    }

    /// Embed and store one entry per segment.
    pub async fn save(&mut self, node_id: &str, metadata: &Value, segments: &[Segment]) -> Result<()> {
        if segments.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = segments.iter().map(|s| s.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;

        self.store.with_tx(&mut self.conn, |tx| {
            for (index, (segment, vector)) in segments.iter().zip(&vectors).enumerate() {
                let mut entry = metadata.as_object().cloned().unwrap_or_default();
                entry.insert("seg_start".into(), Value::from(segment.start));
                entry.insert("seg_end".into(), Value::from(segment.end));

                tx.execute(
                    "INSERT OR REPLACE INTO embeddings (id, metadata, embedding)
                     VALUES (?1, ?2, ?3)",
                    params![
                        format!("{node_id}/{index}"),
                        serde_json::to_string(&Value::Object(entry))?,
                        encode_vector(vector),
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Delete a node's entries: walk `<node-id>/0`, `<node-id>/1`, ... in
    /// chunks, probing past each chunk until nothing is left.
    pub fn remove(&mut self, node_id: &str) -> Result<()> {
        let mut offset = 0usize;
        loop {
            self.store.with_tx(&mut self.conn, |tx| {
                for index in offset..offset + REMOVE_GROUP_SIZE {
                    tx.execute(
                        "DELETE FROM embeddings WHERE id = ?1",
                        [format!("{node_id}/{index}")],
                    )?;
                }
                Ok(())
            })?;
            offset += REMOVE_GROUP_SIZE;

            let probe: Option<i64> = self
                .conn
                .query_row(
                    "SELECT 1 FROM embeddings WHERE id = ?1",
                    [format!("{node_id}/{offset}")],
                    |row| row.get(0),
                )
                .optional()?;
            if probe.is_none() {
                return Ok(());
            }
        }
    }

    /// Nearest-neighbor lookup. The `limit` applies to raw entries before
    /// grouping; grouped nodes come back sorted by ascending distance.
    pub async fn query(&self, text: &str, limit: usize) -> Result<Vec<IndexNode>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embedder.embed(text).await?;

        let mut entries: Vec<(f64, String, String)> = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT id, metadata, embedding FROM embeddings")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let metadata: String = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                let distance = cosine_distance(&query_vector, &decode_vector(&blob));
                entries.push((distance, id, metadata));
            }
        }
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        entries.truncate(limit);

        // Group entries by node-id stem; the group adopts the minimum
        // distance and the union of segment spans.
        struct Group {
            distance: f64,
            metadata: Value,
            segments: Vec<(usize, usize)>,
        }
        let mut groups: BTreeMap<String, Group> = BTreeMap::new();

        for (distance, id, metadata_json) in entries {
            let Some((node_id, _)) = id.rsplit_once('/') else {
                tracing::warn!(id = %id, "Malformed vector entry id");
                continue;
            };
            let mut metadata: Value = serde_json::from_str(&metadata_json)?;
            let (start, end) = match metadata.as_object_mut() {
                Some(map) => {
                    let start = map.remove("seg_start").and_then(|v| v.as_u64());
                    let end = map.remove("seg_end").and_then(|v| v.as_u64());
                    match (start, end) {
                        (Some(start), Some(end)) => (start as usize, end as usize),
                        _ => continue,
                    }
                }
                None => continue,
            };

            let group = groups.entry(node_id.to_string()).or_insert_with(|| Group {
                distance: f64::INFINITY,
                metadata,
                segments: Vec::new(),
            });
            group.distance = group.distance.min(distance);
            group.segments.push((start, end));
        }

        let mut nodes: Vec<IndexNode> = groups
            .into_iter()
            .map(|(id, group)| IndexNode {
                id,
                matching: IndexMatching::Similarity,
                metadata: group.metadata,
                rank: 0.0,
                distance: group.distance,
                segments: group.segments,
            })
            .collect();
        nodes.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(nodes)
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segmentation;
    use serde_json::json;

    fn open_index(dir: &tempfile::TempDir) -> VectorIndex {
        VectorIndex::open(
            StorePool::new(),
            &dir.path().join("vectors.sqlite3"),
            Arc::new(Embedder::mock()),
        )
        .unwrap()
    }

    fn segments_of(text: &str) -> Vec<Segment> {
        Segmentation::new().split(text)
    }

    #[tokio::test]
    async fn query_groups_segments_by_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);

        index
            .save(
                "node-a",
                &json!({"type": "pdf.page"}),
                &segments_of("transference analysis session notes"),
            )
            .await
            .unwrap();
        index
            .save(
                "node-b",
                &json!({"type": "pdf.page"}),
                &segments_of("unrelated grocery list"),
            )
            .await
            .unwrap();

        let nodes = index.query("transference analysis", 10).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "node-a");
        assert!(nodes[0].distance < nodes[1].distance);
        assert_eq!(nodes[0].matching, IndexMatching::Similarity);
        assert_eq!(nodes[0].segments.len(), 1);
        // The segment span survives the metadata round trip.
        let text = "transference analysis session notes";
        assert_eq!(nodes[0].segments[0], (0, text.len()));
        // seg_start / seg_end are internal bookkeeping only.
        assert!(nodes[0].metadata.get("seg_start").is_none());
    }

    #[tokio::test]
    async fn remove_walks_past_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);

        // More segments than one removal chunk.
        let text = "sentence number one. ".repeat(700);
        let segments = segments_of(&text);
        assert!(segments.len() > REMOVE_GROUP_SIZE);

        index
            .save("big", &json!({"type": "pdf.page"}), &segments)
            .await
            .unwrap();
        index.remove("big").unwrap();

        let count: i64 = index
            .conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn limit_caps_raw_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        for i in 0..5 {
            index
                .save(
                    &format!("node-{i}"),
                    &json!({"type": "pdf.page"}),
                    &segments_of(&format!("document number {i}")),
                )
                .await
                .unwrap();
        }

        let nodes = index.query("document number", 3).await.unwrap();
        let total_segments: usize = nodes.iter().map(|n| n.segments.len()).sum();
        assert!(total_segments <= 3);
    }

    #[tokio::test]
    async fn empty_node_saves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = open_index(&dir);
        index
            .save("empty", &json!({"type": "pdf.page"}), &[])
            .await
            .unwrap();

        let count: i64 = index
            .conn
            .query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}

//! Repository for persisted index entries.
//!
//! Vectors are stored as little-endian f32 blobs next to a JSON metadata
//! snapshot and the document string.

use std::sync::Arc;

use tracing::debug;

use marquee_core::error::MarqueeError;
use marquee_core::types::{EntryMetadata, Modality};

use crate::db::Database;

/// One persisted index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub collection: Modality,
    /// `"{modality}_{record_id}"`.
    pub entry_key: String,
    pub record_id: String,
    /// First-insertion order within the collection.
    pub seq: i64,
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
    pub document: String,
}

/// Repository for the `index_entries` table.
#[derive(Debug, Clone)]
pub struct EntryRepository {
    db: Arc<Database>,
}

impl EntryRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Upsert a batch of entries in one transaction.
    ///
    /// An existing row keeps its `seq`; every other column is replaced. On
    /// error nothing from the batch is written.
    pub fn upsert_batch(&self, entries: &[StoredEntry]) -> Result<(), MarqueeError> {
        if entries.is_empty() {
            return Ok(());
        }

        self.db.with_conn_mut(|conn| {
            let tx = conn
                .transaction()
                .map_err(|e| MarqueeError::Storage(format!("Failed to begin transaction: {}", e)))?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO index_entries
                            (collection, entry_key, record_id, seq, dimensions, vector, metadata, document)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                         ON CONFLICT (collection, entry_key) DO UPDATE SET
                            record_id  = excluded.record_id,
                            dimensions = excluded.dimensions,
                            vector     = excluded.vector,
                            metadata   = excluded.metadata,
                            document   = excluded.document,
                            updated_at = strftime('%s', 'now')",
                    )
                    .map_err(|e| MarqueeError::Storage(e.to_string()))?;

                for entry in entries {
                    let metadata = serde_json::to_string(&entry.metadata)?;
                    stmt.execute(rusqlite::params![
                        entry.collection.as_str(),
                        entry.entry_key,
                        entry.record_id,
                        entry.seq,
                        entry.vector.len() as i64,
                        encode_vector(&entry.vector),
                        metadata,
                        entry.document,
                    ])
                    .map_err(|e| {
                        MarqueeError::Storage(format!(
                            "Failed to upsert {}: {}",
                            entry.entry_key, e
                        ))
                    })?;
                }
            }
            tx.commit()
                .map_err(|e| MarqueeError::Storage(format!("Failed to commit batch: {}", e)))?;
            debug!(count = entries.len(), "Index entries persisted");
            Ok(())
        })
    }

    /// Load a whole collection in insertion order.
    pub fn load_collection(&self, collection: Modality) -> Result<Vec<StoredEntry>, MarqueeError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT entry_key, record_id, seq, vector, metadata, document
                     FROM index_entries
                     WHERE collection = ?1
                     ORDER BY seq ASC",
                )
                .map_err(|e| MarqueeError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params![collection.as_str()], |row| {
                    let blob: Vec<u8> = row.get(3)?;
                    let metadata: String = row.get(4)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        blob,
                        metadata,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(|e| MarqueeError::Storage(e.to_string()))?;

            let mut entries = Vec::new();
            for row in rows {
                let (entry_key, record_id, seq, blob, metadata, document) =
                    row.map_err(|e| MarqueeError::Storage(e.to_string()))?;
                entries.push(StoredEntry {
                    collection,
                    vector: decode_vector(&blob).ok_or_else(|| {
                        MarqueeError::Storage(format!("Corrupt vector blob for {}", entry_key))
                    })?,
                    metadata: serde_json::from_str(&metadata)?,
                    entry_key,
                    record_id,
                    seq,
                    document,
                });
            }
            Ok(entries)
        })
    }

    /// Delete every entry of every collection. Returns the number removed.
    pub fn clear_all(&self) -> Result<usize, MarqueeError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM index_entries", [])
                .map_err(|e| MarqueeError::Storage(format!("Failed to clear entries: {}", e)))
        })
    }
}

/// Serialize a vector as little-endian f32 bytes.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Inverse of [`encode_vector`]. `None` if the blob length is not a multiple of 4.
pub fn decode_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

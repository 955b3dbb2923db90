//! Dual-collection vector store with brute-force cosine search.
//!
//! Each modality has its own collection. Entries live in memory for search
//! and are written through to SQLite so that an index survives restarts.
//! Mutations on a collection are serialized by that collection's write
//! lock; queries only take a short read lock on the in-memory entries.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info, warn};

use marquee_core::error::MarqueeError;
use marquee_core::types::{EntryMetadata, MediaType, Modality};
use marquee_storage::{Database, EntryRepository, StoredEntry};

use crate::embedding::{is_unit_norm, normalize, UNIT_NORM_TOLERANCE};

/// An entry to upsert into a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub record_id: String,
    pub vector: Vec<f32>,
    pub metadata: EntryMetadata,
    pub document: String,
}

/// One ranked result of [`VectorStore::query`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryHit {
    /// Cosine distance, `1 - cosine similarity`.
    pub distance: f32,
    pub record_id: String,
    pub metadata: EntryMetadata,
    pub document: String,
}

impl QueryHit {
    pub fn similarity(&self) -> f32 {
        1.0 - self.distance
    }
}

/// Outcome of [`VectorStore::add_batch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub applied: usize,
    /// `(record_id, reason)` for every entry that failed validation.
    pub rejected: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    record_id: String,
    seq: i64,
    vector: Vec<f32>,
    metadata: EntryMetadata,
    document: String,
}

#[derive(Debug, Default)]
struct CollectionState {
    entries: Vec<IndexEntry>,
    /// Entry key to position in `entries`.
    positions: HashMap<String, usize>,
    next_seq: i64,
    dimensions: Option<usize>,
}

#[derive(Debug)]
struct Collection {
    modality: Modality,
    write: Mutex<()>,
    state: RwLock<CollectionState>,
}

impl Collection {
    fn new(modality: Modality) -> Self {
        Self {
            modality,
            write: Mutex::new(()),
            state: RwLock::new(CollectionState::default()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, CollectionState>, MarqueeError> {
        self.state
            .read()
            .map_err(|e| MarqueeError::Storage(format!("Lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, CollectionState>, MarqueeError> {
        self.state
            .write()
            .map_err(|e| MarqueeError::Storage(format!("Lock poisoned: {}", e)))
    }

    fn lock_mutations(&self) -> Result<std::sync::MutexGuard<'_, ()>, MarqueeError> {
        self.write
            .lock()
            .map_err(|e| MarqueeError::Storage(format!("Lock poisoned: {}", e)))
    }

    fn load(&self, stored: Vec<StoredEntry>) -> Result<(), MarqueeError> {
        let mut state = self.write()?;
        *state = CollectionState::default();
        for entry in stored {
            let key = self.modality.entry_key(&entry.record_id);
            state.dimensions.get_or_insert(entry.vector.len());
            state.next_seq = state.next_seq.max(entry.seq + 1);
            let position = state.entries.len();
            state.positions.insert(key, position);
            state.entries.push(IndexEntry {
                record_id: entry.record_id,
                seq: entry.seq,
                vector: entry.vector,
                metadata: entry.metadata,
                document: entry.document,
            });
        }
        Ok(())
    }
}

/// Vector store holding the text and visual collections.
#[derive(Debug)]
pub struct VectorStore {
    text: Collection,
    visual: Collection,
    repo: EntryRepository,
}

impl VectorStore {
    /// Open (or create) a persistent store at `path` and load both
    /// collections into memory.
    pub fn open(path: &Path) -> Result<Self, MarqueeError> {
        let db = Database::new(path)?;
        let store = Self::with_database(Arc::new(db))?;
        let (text, visual) = (store.count(Modality::Text)?, store.count(Modality::Visual)?);
        info!(
            path = %path.display(),
            text,
            visual,
            "Vector store opened"
        );
        Ok(store)
    }

    /// A store backed by an in-memory database.
    pub fn in_memory() -> Result<Self, MarqueeError> {
        Self::with_database(Arc::new(Database::in_memory()?))
    }

    fn with_database(db: Arc<Database>) -> Result<Self, MarqueeError> {
        let repo = EntryRepository::new(db);
        let store = Self {
            text: Collection::new(Modality::Text),
            visual: Collection::new(Modality::Visual),
            repo,
        };
        for modality in Modality::ALL {
            let stored = store.repo.load_collection(modality)?;
            store.collection(modality).load(stored)?;
        }
        Ok(store)
    }

    fn collection(&self, modality: Modality) -> &Collection {
        match modality {
            Modality::Text => &self.text,
            Modality::Visual => &self.visual,
        }
    }

    /// Location of the backing database, `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        self.repo.database().path()
    }

    /// Upsert a single entry. Invalid vectors are rejected with
    /// [`MarqueeError::InvalidVector`].
    pub fn add(
        &self,
        modality: Modality,
        record_id: &str,
        vector: Vec<f32>,
        metadata: EntryMetadata,
        document: String,
    ) -> Result<(), MarqueeError> {
        let report = self.add_batch(
            modality,
            vec![NewEntry {
                record_id: record_id.to_string(),
                vector,
                metadata,
                document,
            }],
        )?;
        match report.rejected.into_iter().next() {
            Some((_, reason)) => Err(MarqueeError::InvalidVector(reason)),
            None => Ok(()),
        }
    }

    /// Upsert a batch. Entries that fail validation are reported and
    /// skipped; the rest are written in one transaction and then made
    /// visible to queries. An overwritten entry keeps its insertion
    /// position.
    pub fn add_batch(
        &self,
        modality: Modality,
        entries: Vec<NewEntry>,
    ) -> Result<BatchReport, MarqueeError> {
        let collection = self.collection(modality);
        let _guard = collection.lock_mutations()?;

        let mut report = BatchReport::default();
        let mut stored = Vec::with_capacity(entries.len());
        let (dimensions, next_seq) = {
            // The mutation lock is held, so the state cannot change under us.
            let state = collection.read()?;
            let mut dimensions = state.dimensions;
            let mut next_seq = state.next_seq;
            let mut batch_seqs: HashMap<String, i64> = HashMap::new();

            for entry in entries {
                if let Err(reason) = validate(&entry, dimensions) {
                    warn!(
                        collection = %modality,
                        record_id = %entry.record_id,
                        reason = %reason,
                        "Rejected index entry"
                    );
                    report.rejected.push((entry.record_id, reason));
                    continue;
                }
                dimensions.get_or_insert(entry.vector.len());

                let key = modality.entry_key(&entry.record_id);
                let existing = state
                    .positions
                    .get(&key)
                    .map(|pos| state.entries[*pos].seq)
                    .or_else(|| batch_seqs.get(&key).copied());
                let seq = match existing {
                    Some(seq) => seq,
                    None => {
                        let seq = next_seq;
                        next_seq += 1;
                        batch_seqs.insert(key.clone(), seq);
                        seq
                    }
                };

                stored.push(StoredEntry {
                    collection: modality,
                    entry_key: key,
                    record_id: entry.record_id,
                    seq,
                    vector: entry.vector,
                    metadata: entry.metadata,
                    document: entry.document,
                });
            }
            (dimensions, next_seq)
        };

        self.repo.upsert_batch(&stored)?;

        let mut state = collection.write()?;
        for entry in stored {
            let item = IndexEntry {
                record_id: entry.record_id,
                seq: entry.seq,
                vector: entry.vector,
                metadata: entry.metadata,
                document: entry.document,
            };
            match state.positions.get(&entry.entry_key).copied() {
                Some(position) => state.entries[position] = item,
                None => {
                    let position = state.entries.len();
                    state.positions.insert(entry.entry_key, position);
                    state.entries.push(item);
                }
            }
            report.applied += 1;
        }
        state.next_seq = next_seq;
        state.dimensions = dimensions;

        debug!(
            collection = %modality,
            applied = report.applied,
            rejected = report.rejected.len(),
            "Batch applied"
        );
        Ok(report)
    }

    /// Nearest neighbours by cosine distance, ascending. Ties keep insertion
    /// order. Returns an empty list for an empty collection or when nothing
    /// matches `media_type`.
    pub fn query(
        &self,
        modality: Modality,
        vector: &[f32],
        top_k: usize,
        media_type: Option<MediaType>,
    ) -> Result<Vec<QueryHit>, MarqueeError> {
        let state = self.collection(modality).read()?;
        if top_k == 0 || state.entries.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(dimensions) = state.dimensions {
            if vector.len() != dimensions {
                return Err(MarqueeError::Search(format!(
                    "Query has {} dimensions, {} collection has {}",
                    vector.len(),
                    modality,
                    dimensions
                )));
            }
        }

        let mut query = vector.to_vec();
        if normalize(&mut query) == 0.0 {
            return Err(MarqueeError::InvalidVector(
                "Query vector has zero magnitude".to_string(),
            ));
        }

        let mut scored: Vec<(f32, usize)> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| media_type.map_or(true, |t| entry.metadata.media_type == t))
            .map(|(position, entry)| (1.0 - dot(&query, &entry.vector), position))
            .collect();

        // Positions follow seq order, so a stable sort keeps ties in
        // insertion order.
        scored.sort_by(|a, b| a.0.total_cmp(&b.0));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(distance, position)| {
                let entry = &state.entries[position];
                QueryHit {
                    distance,
                    record_id: entry.record_id.clone(),
                    metadata: entry.metadata.clone(),
                    document: entry.document.clone(),
                }
            })
            .collect())
    }

    /// Number of entries in a collection.
    pub fn count(&self, modality: Modality) -> Result<usize, MarqueeError> {
        Ok(self.collection(modality).read()?.entries.len())
    }

    /// Record ids present in a collection.
    pub fn record_ids(&self, modality: Modality) -> Result<HashSet<String>, MarqueeError> {
        let state = self.collection(modality).read()?;
        Ok(state.entries.iter().map(|e| e.record_id.clone()).collect())
    }

    /// Clear both collections, in memory and on disk.
    pub fn reset(&self) -> Result<usize, MarqueeError> {
        let _text = self.text.lock_mutations()?;
        let _visual = self.visual.lock_mutations()?;

        let removed = self.repo.clear_all()?;
        *self.text.write()? = CollectionState::default();
        *self.visual.write()? = CollectionState::default();

        info!(removed, "Vector store reset");
        Ok(removed)
    }
}

fn validate(entry: &NewEntry, dimensions: Option<usize>) -> Result<(), String> {
    if entry.metadata.id != entry.record_id {
        return Err(format!(
            "metadata id {} does not match record id {}",
            entry.metadata.id, entry.record_id
        ));
    }
    if entry.vector.is_empty() {
        return Err("empty vector".to_string());
    }
    if let Some(expected) = dimensions {
        if entry.vector.len() != expected {
            return Err(format!(
                "expected {} dimensions, got {}",
                expected,
                entry.vector.len()
            ));
        }
    }
    if !is_unit_norm(&entry.vector) {
        return Err(format!(
            "vector is not unit-normalized (tolerance {})",
            UNIT_NORM_TOLERANCE
        ));
    }
    Ok(())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

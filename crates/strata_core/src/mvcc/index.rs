//! In-memory version index of one logical database.
//!
//! Every collection maps document IDs to a chain of versions, oldest
//! first. A name may have several generations: dropping a collection keeps
//! it readable for older snapshots, and creating it again starts a new
//! generation beside it. Payloads are appended to a single heap and addressed by
//! offset/length; compaction rewrites the heap without the versions no
//! snapshot can see any more.

use crate::error::{CoreError, CoreResult, Missing};
use crate::mvcc::transaction::WriteOp;
use crate::mvcc::version::{visible, DocumentVersion};
use crate::types::{DocumentId, TransactionId, DEFAULT_COLLECTION};
use serde::Serialize;
use std::collections::BTreeMap;

/// Name, age and size of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionMetadata {
    /// Collection name.
    pub name: String,
    /// Unix millis of creation.
    pub created_at: u64,
    /// Documents visible at the snapshot the metadata was taken at.
    pub doc_count: usize,
}

/// What a compaction pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Snapshot floor the pass used.
    pub floor: TransactionId,
    /// Versions dropped.
    pub versions_removed: usize,
    /// Heap bytes released.
    pub bytes_reclaimed: usize,
}

/// A flattened version, for diagnostics and comparisons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    /// Collection name.
    pub collection: String,
    /// Document ID.
    pub doc_id: DocumentId,
    /// Creating commit.
    pub created_tx: TransactionId,
    /// Deleting commit.
    pub deleted_tx: Option<TransactionId>,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct CollectionState {
    created_tx: TransactionId,
    dropped_tx: Option<TransactionId>,
    created_at: u64,
    docs: BTreeMap<DocumentId, Vec<DocumentVersion>>,
}

impl CollectionState {
    fn new(created_tx: TransactionId, created_at: u64) -> Self {
        Self {
            created_tx,
            dropped_tx: None,
            created_at,
            docs: BTreeMap::new(),
        }
    }

    fn visible_at(&self, snapshot: TransactionId) -> bool {
        self.created_tx <= snapshot && self.dropped_tx.map_or(true, |d| d > snapshot)
    }
}

/// Collections, version chains and the payload heap.
#[derive(Debug)]
pub struct VersionIndex {
    /// Generations per name, oldest first. Only the last may be live.
    collections: BTreeMap<String, Vec<CollectionState>>,
    heap: Vec<u8>,
    live: usize,
    tombstones: usize,
}

impl Default for VersionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionIndex {
    /// An index holding only the default collection.
    #[must_use]
    pub fn new() -> Self {
        let mut collections = BTreeMap::new();
        collections.insert(
            DEFAULT_COLLECTION.to_string(),
            vec![CollectionState::new(TransactionId::ZERO, 0)],
        );
        Self {
            collections,
            heap: Vec::new(),
            live: 0,
            tombstones: 0,
        }
    }

    fn current(&self, name: &str) -> Option<&CollectionState> {
        self.collections
            .get(name)?
            .last()
            .filter(|c| c.dropped_tx.is_none())
    }

    fn current_mut(&mut self, name: &str) -> Option<&mut CollectionState> {
        self.collections
            .get_mut(name)?
            .last_mut()
            .filter(|c| c.dropped_tx.is_none())
    }

    /// The generation of `name` visible to `snapshot`.
    fn generation_at(&self, name: &str, snapshot: TransactionId) -> Option<&CollectionState> {
        self.collections
            .get(name)?
            .iter()
            .rev()
            .find(|c| c.visible_at(snapshot))
    }

    /// Whether `name` exists and has not been dropped.
    #[must_use]
    pub fn has_collection(&self, name: &str) -> bool {
        self.current(name).is_some()
    }

    /// Whether some generation of `name` is visible to `snapshot`.
    #[must_use]
    pub fn collection_visible(&self, name: &str, snapshot: TransactionId) -> bool {
        self.generation_at(name, snapshot).is_some()
    }

    /// Whether the live generation of `name` is the one `snapshot` sees.
    #[must_use]
    pub fn current_visible(&self, name: &str, snapshot: TransactionId) -> bool {
        self.current(name).is_some_and(|c| c.visible_at(snapshot))
    }

    /// Creates a collection at commit `created_tx`.
    ///
    /// Earlier dropped generations of the same name stay readable until
    /// compaction passes their drop.
    pub fn create_collection(
        &mut self,
        name: &str,
        created_tx: TransactionId,
        created_at: u64,
    ) -> CoreResult<()> {
        if self.has_collection(name) {
            return Err(CoreError::already_exists(name));
        }
        self.collections
            .entry(name.to_string())
            .or_default()
            .push(CollectionState::new(created_tx, created_at));
        Ok(())
    }

    /// Drops a collection at commit `dropped_tx`, tombstoning every live
    /// document. Returns the number of documents tombstoned.
    pub fn drop_collection(&mut self, name: &str, dropped_tx: TransactionId) -> CoreResult<usize> {
        let state = self
            .current_mut(name)
            .ok_or_else(|| CoreError::not_found(Missing::Collection, name))?;
        state.dropped_tx = Some(dropped_tx);
        let mut tombstoned = 0;
        for chain in state.docs.values_mut() {
            if let Some(live) = chain.last_mut().filter(|v| v.is_live()) {
                live.deleted_tx = Some(dropped_tx);
                tombstoned += 1;
            }
        }
        self.live -= tombstoned;
        self.tombstones += tombstoned;
        Ok(tombstoned)
    }

    /// Newest version of a document, whatever its visibility.
    #[must_use]
    pub fn latest(&self, collection: &str, doc_id: DocumentId) -> Option<&DocumentVersion> {
        self.current(collection)?
            .docs
            .get(&doc_id)?
            .last()
    }

    /// The version of a document visible to `snapshot`.
    #[must_use]
    pub fn visible_version(
        &self,
        collection: &str,
        doc_id: DocumentId,
        snapshot: TransactionId,
    ) -> Option<&DocumentVersion> {
        self.generation_at(collection, snapshot)?
            .docs
            .get(&doc_id)?
            .iter()
            .rev()
            .find(|v| visible(v, snapshot))
    }

    /// Payload of the version visible to `snapshot`.
    #[must_use]
    pub fn read(
        &self,
        collection: &str,
        doc_id: DocumentId,
        snapshot: TransactionId,
    ) -> Option<&[u8]> {
        self.visible_version(collection, doc_id, snapshot)
            .map(|v| self.payload(v))
    }

    /// Payload bytes of a version.
    #[must_use]
    pub fn payload(&self, version: &DocumentVersion) -> &[u8] {
        &self.heap[version.offset..version.offset + version.length]
    }

    /// Applies one committed write. Returns the heap bytes it added.
    ///
    /// A put supersedes the live version (stamping it with `commit`) and
    /// appends a new one; a delete only stamps the live version.
    pub fn install(
        &mut self,
        collection: &str,
        doc_id: DocumentId,
        write: &WriteOp,
        commit: TransactionId,
    ) -> CoreResult<usize> {
        let state = self
            .collections
            .get_mut(collection)
            .and_then(|gens| gens.last_mut())
            .filter(|c| c.dropped_tx.is_none())
            .ok_or_else(|| CoreError::not_found(Missing::Collection, collection))?;
        let chain = state.docs.entry(doc_id).or_default();

        if let Some(live) = chain.last_mut().filter(|v| v.is_live()) {
            live.deleted_tx = Some(commit);
            self.live -= 1;
            self.tombstones += 1;
        }

        match write {
            WriteOp::Put { payload, .. } => {
                let offset = self.heap.len();
                self.heap.extend_from_slice(payload);
                chain.push(DocumentVersion {
                    doc_id,
                    created_tx: commit,
                    deleted_tx: None,
                    offset,
                    length: payload.len(),
                });
                self.live += 1;
                Ok(payload.len())
            }
            WriteOp::Delete => {
                if chain.is_empty() {
                    state.docs.remove(&doc_id);
                }
                Ok(0)
            }
        }
    }

    /// IDs of every document with at least one version in the generation
    /// of `collection` that `snapshot` sees, ascending.
    #[must_use]
    pub fn doc_ids(&self, collection: &str, snapshot: TransactionId) -> Vec<DocumentId> {
        self.generation_at(collection, snapshot)
            .map(|c| c.docs.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Documents of `collection` visible to `snapshot`.
    #[must_use]
    pub fn document_count(&self, collection: &str, snapshot: TransactionId) -> usize {
        let Some(state) = self.generation_at(collection, snapshot) else {
            return 0;
        };
        state
            .docs
            .values()
            .filter(|chain| chain.iter().any(|v| visible(v, snapshot)))
            .count()
    }

    /// Collections visible to `snapshot`, by name.
    #[must_use]
    pub fn collections(&self, snapshot: TransactionId) -> Vec<CollectionMetadata> {
        self.collections
            .keys()
            .filter_map(|name| Some((name, self.generation_at(name, snapshot)?)))
            .map(|(name, c)| CollectionMetadata {
                name: name.clone(),
                created_at: c.created_at,
                doc_count: self.document_count(name, snapshot),
            })
            .collect()
    }

    /// Live (not deleted) versions.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Deleted or superseded versions awaiting compaction.
    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones
    }

    /// Bytes held by the payload heap, garbage included.
    #[must_use]
    pub fn heap_bytes(&self) -> usize {
        self.heap.len()
    }

    /// Drops every version deleted at or before `floor` and rewrites the
    /// heap. Dropped collections whose drop is at or before `floor` go too.
    ///
    /// `floor` must not exceed the oldest snapshot any reader still holds.
    pub fn compact(&mut self, floor: TransactionId) -> CompactionReport {
        let heap_before = self.heap.len();
        let mut removed = 0;
        self.collections.retain(|_, generations| {
            generations.retain(|c| {
                let gone = c.dropped_tx.is_some_and(|d| d <= floor);
                if gone {
                    removed += c.docs.values().map(Vec::len).sum::<usize>();
                }
                !gone
            });
            !generations.is_empty()
        });

        let old_heap = std::mem::take(&mut self.heap);
        let mut heap = Vec::with_capacity(heap_before);
        for state in self.collections.values_mut().flatten() {
            state.docs.retain(|_, chain| {
                let before = chain.len();
                chain.retain(|v| v.deleted_tx.map_or(true, |d| d > floor));
                removed += before - chain.len();
                for version in chain.iter_mut() {
                    let start = heap.len();
                    heap.extend_from_slice(&old_heap[version.offset..version.offset + version.length]);
                    version.offset = start;
                }
                !chain.is_empty()
            });
        }
        heap.shrink_to_fit();
        self.heap = heap;
        self.tombstones = self.tombstones.saturating_sub(removed);

        CompactionReport {
            floor,
            versions_removed: removed,
            bytes_reclaimed: heap_before - self.heap.len(),
        }
    }

    /// Live collections with their creating commit and creation time.
    pub(crate) fn live_collections(&self) -> impl Iterator<Item = (&str, TransactionId, u64)> {
        self.collections
            .keys()
            .filter_map(move |name| Some((name, self.current(name)?)))
            .map(|(name, c)| (name.as_str(), c.created_tx, c.created_at))
    }

    /// Live versions of live collections, with their payloads.
    pub(crate) fn live_documents(
        &self,
    ) -> impl Iterator<Item = (&str, &DocumentVersion, &[u8])> + '_ {
        self.collections
            .keys()
            .filter_map(move |name| Some((name, self.current(name)?)))
            .flat_map(move |(name, c)| {
                c.docs
                    .values()
                    .filter_map(|chain| chain.last().filter(|v| v.is_live()))
                    .map(move |v| (name.as_str(), v, self.payload(v)))
            })
    }

    /// Every version of every collection, ordered by collection, document
    /// and age.
    #[must_use]
    pub fn dump(&self) -> Vec<VersionEntry> {
        self.collections
            .iter()
            .flat_map(|(name, generations)| generations.iter().map(move |c| (name, c)))
            .flat_map(|(name, c)| {
                c.docs.values().flatten().map(move |v| VersionEntry {
                    collection: name.clone(),
                    doc_id: v.doc_id,
                    created_tx: v.created_tx,
                    deleted_tx: v.deleted_tx,
                    payload: self.payload(v).to_vec(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::OpType;

    fn tx(n: u64) -> TransactionId {
        TransactionId::new(n)
    }

    fn put(payload: &str) -> WriteOp {
        WriteOp::Put {
            payload: payload.as_bytes().to_vec(),
            op: OpType::Create,
        }
    }

    #[test]
    fn snapshots_see_their_version() {
        let mut index = VersionIndex::new();
        index.install("_default", 1, &put("v1"), tx(2)).unwrap();
        index.install("_default", 1, &put("v2"), tx(5)).unwrap();

        assert_eq!(index.read("_default", 1, tx(1)), None);
        assert_eq!(index.read("_default", 1, tx(3)), Some(&b"v1"[..]));
        assert_eq!(index.read("_default", 1, tx(5)), Some(&b"v2"[..]));
        assert_eq!(index.live_count(), 1);
        assert_eq!(index.tombstone_count(), 1);
    }

    #[test]
    fn delete_keeps_history_for_old_snapshots() {
        let mut index = VersionIndex::new();
        index.install("_default", 7, &put("x"), tx(2)).unwrap();
        index.install("_default", 7, &WriteOp::Delete, tx(4)).unwrap();

        assert!(index.read("_default", 7, tx(3)).is_some());
        assert!(index.read("_default", 7, tx(4)).is_none());
        assert_eq!(index.document_count("_default", tx(3)), 1);
        assert_eq!(index.document_count("_default", tx(4)), 0);
    }

    #[test]
    fn compaction_respects_floor() {
        let mut index = VersionIndex::new();
        index.install("_default", 1, &put("aaaa"), tx(2)).unwrap();
        index.install("_default", 1, &put("bbbb"), tx(4)).unwrap();
        index.install("_default", 2, &put("cc"), tx(6)).unwrap();
        index.install("_default", 2, &WriteOp::Delete, tx(8)).unwrap();

        let report = index.compact(tx(5));
        assert_eq!(report.versions_removed, 1);
        assert_eq!(report.bytes_reclaimed, 4);
        assert_eq!(index.read("_default", 2, tx(7)), Some(&b"cc"[..]));
        assert_eq!(index.read("_default", 1, tx(9)), Some(&b"bbbb"[..]));

        let report = index.compact(tx(8));
        assert_eq!(report.versions_removed, 1);
        assert!(index.doc_ids("_default", tx(9)).iter().all(|&id| id != 2));
        assert_eq!(index.tombstone_count(), 0);
        assert_eq!(index.heap_bytes(), 4);
    }

    #[test]
    fn drop_collection_tombstones_and_recreate_keeps_history() {
        let mut index = VersionIndex::new();
        index.create_collection("users", tx(1), 10).unwrap();
        index.install("users", 1, &put("a"), tx(2)).unwrap();
        index.install("users", 2, &put("b"), tx(2)).unwrap();

        assert_eq!(index.drop_collection("users", tx(3)).unwrap(), 2);
        assert!(index.collection_visible("users", tx(2)));
        assert!(!index.collection_visible("users", tx(3)));
        assert_eq!(index.read("users", 1, tx(2)), Some(&b"a"[..]));
        assert!(matches!(
            index.install("users", 3, &put("c"), tx(4)),
            Err(CoreError::NotFound { .. })
        ));

        index.create_collection("users", tx(5), 20).unwrap();
        index.install("users", 9, &put("new"), tx(6)).unwrap();
        assert!(index.create_collection("users", tx(6), 30).is_err());

        // Older snapshots still read the dropped generation.
        assert_eq!(index.read("users", 1, tx(2)), Some(&b"a"[..]));
        assert_eq!(index.doc_ids("users", tx(2)), [1, 2]);
        assert_eq!(index.document_count("users", tx(2)), 2);
        assert!(!index.collection_visible("users", tx(4)));
        assert_eq!(index.read("users", 1, tx(6)), None);
        assert_eq!(index.doc_ids("users", tx(6)), [9]);
        assert!(!index.current_visible("users", tx(2)));
        assert!(index.current_visible("users", tx(6)));

        let listed = index.collections(tx(2));
        assert_eq!(listed[1].created_at, 10);
        assert_eq!(index.collections(tx(6))[1].created_at, 20);
        assert_eq!(index.live_collections().filter(|(n, ..)| *n == "users").count(), 1);
        assert_eq!(index.dump().len(), 3);

        // The old generation goes once no snapshot predates its drop.
        let report = index.compact(tx(2));
        assert_eq!(report.versions_removed, 0);
        assert_eq!(index.read("users", 1, tx(2)), Some(&b"a"[..]));
        let report = index.compact(tx(6));
        assert_eq!(report.versions_removed, 2);
        assert_eq!(index.tombstone_count(), 0);
        assert_eq!(index.read("users", 9, tx(6)), Some(&b"new"[..]));
    }

    #[test]
    fn collections_listing() {
        let mut index = VersionIndex::new();
        index.create_collection("orders", tx(3), 99).unwrap();
        index.install("orders", 1, &put("o"), tx(4)).unwrap();

        let at_two: Vec<_> = index.collections(tx(2)).into_iter().map(|c| c.name).collect();
        assert_eq!(at_two, ["_default"]);

        let now = index.collections(tx(4));
        assert_eq!(now.len(), 2);
        assert_eq!(now[1].name, "orders");
        assert_eq!(now[1].doc_count, 1);
    }

    #[test]
    fn live_documents_skip_history() {
        let mut index = VersionIndex::new();
        index.install("_default", 1, &put("old"), tx(1)).unwrap();
        index.install("_default", 1, &put("new"), tx(2)).unwrap();
        index.install("_default", 2, &put("gone"), tx(2)).unwrap();
        index.install("_default", 2, &WriteOp::Delete, tx(3)).unwrap();

        let live: Vec<_> = index
            .live_documents()
            .map(|(_, v, payload)| (v.doc_id, payload.to_vec()))
            .collect();
        assert_eq!(live, vec![(1, b"new".to_vec())]);
        assert_eq!(index.dump().len(), 3);
    }
}

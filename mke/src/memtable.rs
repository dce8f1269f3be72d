//! The mutable and immutable memtable stages of §4.2's per-memtable state
//! machine (`mutable -> immutable -> flushed`).
//!
//! The source this is adapted from expresses the memtable as a
//! concurrent skip list with hand-rolled atomic pointer barriers; here
//! it's a `parking_lot::RwLock<BTreeMap<...>>` instead; see DESIGN.md
//! for why that's a faithful simplification rather than a shortcut.

use mdtypes::rowkey::RowKey;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// A row's value bytes, or `None` for a tombstone/range-tombstone
/// (whose `RowKey::value_type` already says what kind of deletion it
/// is; there is nothing further to store).
pub type MemValue = Option<Vec<u8>>;

pub struct Memtable {
    map: RwLock<BTreeMap<RowKey, MemValue>>,
    approx_bytes: std::sync::atomic::AtomicUsize,
}

impl Memtable {
    pub fn new() -> Self {
        Memtable {
            map: RwLock::new(BTreeMap::new()),
            approx_bytes: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, key: RowKey, value: MemValue) {
        let added = mdtypes::rowkey::ENCODED_LEN + value.as_ref().map_or(0, |v| v.len());
        self.map.write().insert(key, value);
        self.approx_bytes
            .fetch_add(added, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn approx_size(&self) -> usize {
        self.approx_bytes.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Newest entry for `(parent, name_hash)` at or below `snapshot_seq`,
    /// if any is present in this memtable at all (a `None` inner value
    /// still counts: it tells the caller "tombstoned here, stop
    /// searching older levels").
    pub fn get(
        &self,
        parent: mdtypes::DirId,
        name_hash: u128,
        snapshot_seq: u64,
    ) -> Option<MemValue> {
        let guard = self.map.read();
        let floor = RowKey::new(
            parent,
            name_hash,
            snapshot_seq,
            mdtypes::rowkey::ValueType::Attrs,
        );
        guard
            .range(floor..)
            .find(|(k, _)| k.parent == parent && k.name_hash == name_hash)
            .map(|(_, v)| v.clone())
    }

    /// A sorted snapshot of every row, for flush-to-table or for an
    /// iterator-backed read that must not observe later writes.
    pub fn snapshot(&self) -> Vec<(RowKey, MemValue)> {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdtypes::rowkey::ValueType;
    use mdtypes::DirId;

    #[test]
    fn newest_sequence_wins_on_get() {
        let mt = Memtable::new();
        let parent = DirId::new(1, 1);
        mt.insert(
            RowKey::new(parent, 5, 1, ValueType::Attrs),
            Some(vec![1]),
        );
        mt.insert(
            RowKey::new(parent, 5, 2, ValueType::Attrs),
            Some(vec![2]),
        );
        let got = mt.get(parent, 5, u64::MAX).unwrap();
        assert_eq!(got, Some(vec![2]));
    }

    #[test]
    fn tombstone_shadows_older_value() {
        let mt = Memtable::new();
        let parent = DirId::new(1, 1);
        mt.insert(
            RowKey::new(parent, 5, 1, ValueType::Attrs),
            Some(vec![1]),
        );
        mt.insert(RowKey::new(parent, 5, 2, ValueType::Tombstone), None);
        let got = mt.get(parent, 5, u64::MAX).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn snapshot_size_tracks_approx_size() {
        let mt = Memtable::new();
        assert_eq!(mt.approx_size(), 0);
        mt.insert(
            RowKey::new(DirId::new(0, 0), 1, 1, ValueType::Attrs),
            Some(vec![0u8; 100]),
        );
        assert!(mt.approx_size() >= 100);
    }
}

use crate::dirid::DirId;
use crate::error::{Error, Result};
use serde_derive::{Deserialize, Serialize};

pub type Sequence = u64;

/// What a row's value carries. Kept small and closed: the MKE does not
/// implement general-purpose secondary indexes, so there is no room for an
/// extensible tag here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
    /// Inode/dentry attributes (the common case).
    Attrs = 0,
    /// A tombstone: the row at this (parent, hash) is deleted as of
    /// `sequence`.
    Tombstone = 1,
    /// A range-tombstone marker used by directory-split migration
    /// (§4.4 step 4): covers every hash in `[range_lo, range_hi]`.
    RangeTombstone = 2,
}

impl ValueType {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(ValueType::Attrs),
            1 => Ok(ValueType::Tombstone),
            2 => Ok(ValueType::RangeTombstone),
            other => Err(Error::corruption(format!("bad value_type byte {}", other))),
        }
    }
}

/// `(parent_DirId, hash_of_name, internal_sequence, value_type)`, encoded so
/// that bytewise comparison orders by `(parent, hash)` ascending, then by
/// `sequence` **descending** — so a forward scan over a level's sorted rows
/// naturally visits the newest version of a name first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowKey {
    pub parent: DirId,
    pub name_hash: u128,
    pub sequence: Sequence,
    pub value_type: ValueType,
}

pub const ENCODED_LEN: usize = 16 + 16 + 8 + 1;

impl RowKey {
    pub fn new(parent: DirId, name_hash: u128, sequence: Sequence, value_type: ValueType) -> Self {
        RowKey {
            parent,
            name_hash,
            sequence,
            value_type,
        }
    }

    /// Encode to the bytewise-comparable representation described above.
    pub fn encode(&self) -> [u8; ENCODED_LEN] {
        let mut buf = [0u8; ENCODED_LEN];
        buf[0..16].copy_from_slice(&self.parent.to_bytes());
        buf[16..32].copy_from_slice(&self.name_hash.to_be_bytes());
        // Invert the sequence so ascending byte order means descending
        // sequence: ascending keys then surface the newest row first.
        buf[32..40].copy_from_slice(&(!self.sequence).to_be_bytes());
        buf[40] = self.value_type as u8;
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != ENCODED_LEN {
            return Err(Error::corruption(format!(
                "row key wrong length: {} (want {})",
                buf.len(),
                ENCODED_LEN
            )));
        }
        let mut parent_bytes = [0u8; 16];
        parent_bytes.copy_from_slice(&buf[0..16]);
        let mut hash_bytes = [0u8; 16];
        hash_bytes.copy_from_slice(&buf[16..32]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&buf[32..40]);
        let sequence = !u64::from_be_bytes(seq_bytes);
        let value_type = ValueType::from_u8(buf[40])?;
        Ok(RowKey {
            parent: DirId::from_bytes(&parent_bytes),
            name_hash: u128::from_be_bytes(hash_bytes),
            sequence,
            value_type,
        })
    }

    /// The smallest key for a given `(parent, name_hash)` prefix — i.e. the
    /// key that would sort before every version of that name. Used to seek
    /// to the start of a name's version chain.
    pub fn prefix_floor(parent: DirId, name_hash: u128) -> Self {
        RowKey::new(parent, name_hash, Sequence::MAX, ValueType::Attrs)
    }

    /// The largest key for a given `(parent, name_hash)` prefix.
    pub fn prefix_ceil(parent: DirId, name_hash: u128) -> Self {
        RowKey::new(parent, name_hash, 0, ValueType::RangeTombstone)
    }

    /// The smallest key that could belong to `parent` — sorts below
    /// every name hash's version chain in that directory. Scopes a scan
    /// (directory-split row migration, a future directory-wide iterator)
    /// to one directory without needing to know its name hashes in
    /// advance.
    pub fn parent_floor(parent: DirId) -> Self {
        RowKey::new(parent, 0, Sequence::MAX, ValueType::Attrs)
    }

    /// The largest key that could belong to `parent`.
    pub fn parent_ceil(parent: DirId) -> Self {
        RowKey::new(parent, u128::MAX, 0, ValueType::RangeTombstone)
    }
}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.encode().cmp(&other.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seq: u64) -> RowKey {
        RowKey::new(DirId::new(1, 2), 42, seq, ValueType::Attrs)
    }

    #[test]
    fn roundtrips() {
        let k = key(77);
        assert_eq!(RowKey::decode(&k.encode()).unwrap(), k);
    }

    #[test]
    fn higher_sequence_sorts_first() {
        let newer = key(100);
        let older = key(1);
        assert!(newer < older);
    }

    #[test]
    fn different_parents_sort_by_parent_first() {
        let a = RowKey::new(DirId::new(0, 0), u128::MAX, 0, ValueType::Attrs);
        let b = RowKey::new(DirId::new(0, 1), 0, u64::MAX, ValueType::Attrs);
        assert!(a < b);
    }

    #[test]
    fn rejects_truncated_buffer() {
        assert!(RowKey::decode(&[0u8; 4]).is_err());
    }
}

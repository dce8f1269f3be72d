use bytes::Bytes;
use serde_derive::{Deserialize, Serialize};

/// The payload carried by an `Attrs` row: inode attributes, file size,
/// the child's zeroth server (if the child is itself a directory), and
/// optionally inline data for small files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttrs {
    pub inode_no: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// Set only when this entry is itself a directory: the server hosting
    /// partition 0 of the child directory's own DPI.
    pub zeroth_server_of_child: Option<u32>,
    /// Small-file fast path: the file's content inlined into the metadata
    /// row instead of requiring a separate blob fetch.
    #[serde(with = "serde_bytes_opt")]
    pub inline_data: Option<Bytes>,
}

impl InodeAttrs {
    pub fn is_dir(&self) -> bool {
        self.zeroth_server_of_child.is_some()
    }
}

/// serde can't derive `Serialize`/`Deserialize` for `Option<Bytes>` with
/// the compact `serde_bytes`-style encoding out of the box; this module
/// gives bincode a plain `Vec<u8>` to work with instead.
mod serde_bytes_opt {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        v.as_ref().map(|b| b.as_ref()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        let raw: Option<Vec<u8>> = Option::deserialize(d)?;
        Ok(raw.map(Bytes::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bincode_roundtrip() {
        let attrs = InodeAttrs {
            inode_no: 7,
            mode: 0o755,
            uid: 1000,
            gid: 1000,
            size: 12,
            zeroth_server_of_child: Some(3),
            inline_data: Some(Bytes::from_static(b"hello world!")),
        };
        let enc = bincode::serialize(&attrs).unwrap();
        let dec: InodeAttrs = bincode::deserialize(&enc).unwrap();
        assert_eq!(dec, attrs);
    }

    #[test]
    fn is_dir_reflects_zeroth_server() {
        let mut attrs = InodeAttrs {
            inode_no: 1,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            zeroth_server_of_child: None,
            inline_data: None,
        };
        assert!(!attrs.is_dir());
        attrs.zeroth_server_of_child = Some(0);
        assert!(attrs.is_dir());
    }
}

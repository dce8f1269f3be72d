use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// A directory identity: a 128-bit pair assigned at creation and immutable
/// thereafter. `registry_id` names the cluster (or sub-namespace) that
/// minted the directory; `directory_no` is a per-registry counter.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DirId {
    pub registry_id: u64,
    pub directory_no: u64,
}

impl DirId {
    pub const fn new(registry_id: u64, directory_no: u64) -> Self {
        DirId {
            registry_id,
            directory_no,
        }
    }

    pub const ROOT: DirId = DirId::new(0, 0);

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.registry_id.to_be_bytes());
        buf[8..].copy_from_slice(&self.directory_no.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; 16]) -> Self {
        let mut registry_id = [0u8; 8];
        let mut directory_no = [0u8; 8];
        registry_id.copy_from_slice(&buf[..8]);
        directory_no.copy_from_slice(&buf[8..]);
        DirId {
            registry_id: u64::from_be_bytes(registry_id),
            directory_no: u64::from_be_bytes(directory_no),
        }
    }
}

impl fmt::Debug for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirId({:#x}:{:#x})", self.registry_id, self.directory_no)
    }
}

impl fmt::Display for DirId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.registry_id, self.directory_no)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_bytes() {
        let id = DirId::new(0xdead_beef, 0x1234_5678_9abc_def0);
        assert_eq!(DirId::from_bytes(&id.to_bytes()), id);
    }

    #[test]
    fn root_is_zero() {
        assert_eq!(DirId::ROOT, DirId::new(0, 0));
    }
}

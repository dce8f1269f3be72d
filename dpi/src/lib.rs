//! The Directory Partition Index (§4.1): a compact, gossip-propagated
//! bitmap describing which sub-partitions of a directory are currently
//! "split out", plus the deterministic name→partition→server mapping built
//! on top of it.

pub mod bitmap;

use bitmap::Bitmap;
use mdtypes::{DirId, Error, Result};
use serde_derive::{Deserialize, Serialize};

/// `radix = ceil(log2(v))`, shared by every DPI for a directory with
/// `num_virtual_servers == v`.
pub fn radix_for(v: u32) -> u32 {
    let v = v.max(1);
    if v <= 1 {
        0
    } else {
        32 - (v - 1).leading_zeros()
    }
}

/// Clear the highest set bit of `r`. `0` is its own fixed point, which is
/// what guarantees the "clear top bit until in bitmap" reduction in
/// [`Dpi::partition_for`] terminates — bit 0 is always set (§4.1
/// invariants).
fn clear_top_bit(r: u32) -> u32 {
    if r == 0 {
        return 0;
    }
    let msb = 31 - r.leading_zeros();
    r & !(1 << msb)
}

/// The directory partition index itself. `num_servers` may change across
/// cluster restarts (§4.1); `num_virtual_servers` is fixed for the
/// directory's lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dpi {
    pub dir: DirId,
    pub zeroth_server: u32,
    pub num_servers: u32,
    pub num_virtual_servers: u32,
    bitmap: Bitmap,
}

/// On-wire encoding: fixed header then the raw bitmap words (§4.1 encode).
#[derive(Serialize, Deserialize)]
struct Header {
    dir_registry_id: u64,
    dir_directory_no: u64,
    zeroth_server: u32,
    num_servers: u32,
    num_virtual_servers: u32,
}

impl Dpi {
    /// A brand-new DPI for `dir`: only partition 0 (the root) exists.
    pub fn new(dir: DirId, zeroth_server: u32, num_servers: u32, num_virtual_servers: u32) -> Self {
        let mut bitmap = Bitmap::new(num_virtual_servers);
        bitmap.set(0);
        Dpi {
            dir,
            zeroth_server,
            num_servers: num_servers.max(1),
            num_virtual_servers: num_virtual_servers.max(1),
            bitmap,
        }
    }

    pub fn radix(&self) -> u32 {
        radix_for(self.num_virtual_servers)
    }

    pub fn is_split(&self, partition: u32) -> bool {
        partition < self.num_virtual_servers && self.bitmap.get(partition)
    }

    /// §4.1 name→partition→server mapping, step 1-2.
    pub fn partition_for(&self, hash: u128) -> u32 {
        let mut r = hashkit::top_bits(hash, self.radix());
        while !self.bitmap.get(r) {
            r = clear_top_bit(r);
        }
        r
    }

    /// §4.1 name→partition→server mapping, step 3.
    pub fn server_for_partition(&self, partition: u32) -> u32 {
        let perm = hashkit::mixed_permutation(partition, self.radix());
        (self.zeroth_server + perm) % self.num_servers
    }

    /// The full mapping: `hash(name) -> server_id`.
    pub fn select_server(&self, name: &[u8]) -> u32 {
        let hash = hashkit::hash128(name);
        self.server_for_partition(self.partition_for(hash))
    }

    /// Whether `name` currently routes to `partition` under this DPI.
    /// Used by the split-disjointness property (§8.3) and by DC's split
    /// procedure to decide which rows to migrate.
    pub fn routes_to(&self, partition: u32, hash: u128) -> bool {
        self.partition_for(hash) == partition
    }

    /// A partition is splittable iff its child still fits in the bitmap
    /// (§4.1 split predicate).
    pub fn is_splittable(&self, partition: u32) -> bool {
        let child = 2 * partition as u64 + 1;
        child < self.num_virtual_servers as u64
    }

    /// Allocate and mark the child of `parent` as live. The caller must
    /// already have established that `parent` is set (the invariant that
    /// a child requires its parent) and that [`Dpi::is_splittable`] holds.
    pub fn mark_splittable_child(&mut self, parent: u32) -> Result<u32> {
        if !self.bitmap.get(parent) {
            return Err(Error::invalid_argument(format!(
                "cannot split unset partition {}",
                parent
            )));
        }
        if !self.is_splittable(parent) {
            return Err(Error::invalid_argument(format!(
                "partition {} has no room for a child under V={}",
                parent, self.num_virtual_servers
            )));
        }
        let child = 2 * parent + 1;
        self.bitmap.set(child);
        Ok(child)
    }

    /// §4.4 step 2/migration predicate: assuming `self` already has the
    /// child partition's bit set (a provisional post-split bitmap), does
    /// `hash` now resolve to `child` rather than to its parent? This is a
    /// pure function of the local bitmap, hence "testable locally without
    /// consulting other servers" (§4.1).
    pub fn to_be_migrated(&self, child: u32, hash: u128) -> bool {
        self.is_split(child) && self.partition_for(hash) == child
    }

    /// OR another directory's DPI into this one in place. Returns `true`
    /// iff any new bit was set. Commutative, associative, idempotent
    /// (§8.1) — the semilattice merge property gossip propagation relies
    /// on.
    pub fn merge(&mut self, other: &Dpi) -> Result<bool> {
        if self.dir != other.dir {
            return Err(Error::invalid_argument(
                "cannot merge DPIs for different directories",
            ));
        }
        if self.num_virtual_servers != other.num_virtual_servers {
            return Err(Error::invalid_argument(
                "cannot merge DPIs with different num_virtual_servers",
            ));
        }
        Ok(self.bitmap.merge_from(&other.bitmap))
    }

    /// Validate the structural invariants from §4.1: bit 0 set, and every
    /// set bit's ancestor chain also set. Run unconditionally at decode
    /// time when `paranoid_checks` is enabled; otherwise callers may skip
    /// this for a fast path on already-trusted local state.
    pub fn check_invariants(&self) -> Result<()> {
        if !self.bitmap.get(0) {
            return Err(Error::corruption("DPI bit 0 is not set"));
        }
        if self.num_servers == 0 || self.num_servers > self.num_virtual_servers {
            return Err(Error::corruption(format!(
                "num_servers {} out of range for num_virtual_servers {}",
                self.num_servers, self.num_virtual_servers
            )));
        }
        for i in 1..self.num_virtual_servers {
            if !self.bitmap.get(i) {
                continue;
            }
            let mut r = i;
            loop {
                r = clear_top_bit(r);
                if !self.bitmap.get(r) {
                    return Err(Error::corruption(format!(
                        "partition {} is split but ancestor {} is not",
                        i, r
                    )));
                }
                if r == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Encode for wire transfer: fixed header then the raw bitmap.
    pub fn encode(&self) -> Vec<u8> {
        let header = Header {
            dir_registry_id: self.dir.registry_id,
            dir_directory_no: self.dir.directory_no,
            zeroth_server: self.zeroth_server,
            num_servers: self.num_servers,
            num_virtual_servers: self.num_virtual_servers,
        };
        let mut out = bincode::serialize(&header).expect("Header serialization is infallible");
        out.extend_from_slice(&self.bitmap.to_bytes());
        out
    }

    /// Decode from wire bytes produced by [`Dpi::encode`]. When
    /// `paranoid_checks` is set, also validates structural invariants
    /// before returning.
    pub fn decode(buf: &[u8], paranoid_checks: bool) -> Result<Self> {
        let header_len = bincode::serialized_size(&Header {
            dir_registry_id: 0,
            dir_directory_no: 0,
            zeroth_server: 0,
            num_servers: 0,
            num_virtual_servers: 0,
        })
        .expect("fixed-size header") as usize;
        if buf.len() < header_len {
            return Err(Error::corruption("DPI buffer shorter than header"));
        }
        let header: Header = bincode::deserialize(&buf[..header_len])
            .map_err(|e| Error::corruption(format!("bad DPI header: {}", e)))?;
        let bitmap = Bitmap::from_bytes(header.num_virtual_servers, &buf[header_len..])
            .ok_or_else(|| Error::corruption("bad DPI bitmap length"))?;
        let dpi = Dpi {
            dir: DirId::new(header.dir_registry_id, header.dir_directory_no),
            zeroth_server: header.zeroth_server,
            num_servers: header.num_servers,
            num_virtual_servers: header.num_virtual_servers,
            bitmap,
        };
        if paranoid_checks {
            dpi.check_invariants()?;
        }
        Ok(dpi)
    }

    /// Recompute `zeroth_server` for a new `num_servers`, per the Open
    /// Questions resolution in DESIGN.md: hash `(dir, num_servers)` rather
    /// than preserving the prior value, so the average load stays
    /// balanced without needing to remember history across restarts.
    pub fn rebalance_zeroth_server(&mut self, num_servers: u32) {
        let mut buf = self.dir.to_bytes().to_vec();
        buf.extend_from_slice(&num_servers.to_be_bytes());
        let h = hashkit::hash128(&buf);
        self.num_servers = num_servers.max(1);
        self.zeroth_server = (h as u32) % self.num_servers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn dir() -> DirId {
        DirId::new(1, 1)
    }

    #[test]
    fn fresh_dpi_has_only_root_split() {
        let d = Dpi::new(dir(), 0, 4, 1024);
        assert!(d.is_split(0));
        assert!(!d.is_split(1));
        d.check_invariants().unwrap();
    }

    #[test]
    fn every_name_routes_to_root_before_any_split() {
        let d = Dpi::new(dir(), 0, 4, 1024);
        for name in ["a", "bb", "ccc", "dddd"] {
            assert_eq!(d.partition_for(hashkit::hash128(name.as_bytes())), 0);
        }
    }

    #[test]
    fn splitting_requires_parent_set() {
        let mut d = Dpi::new(dir(), 0, 4, 1024);
        assert!(d.mark_splittable_child(2).is_err());
        assert!(d.mark_splittable_child(0).is_ok());
        assert!(d.is_split(1));
    }

    #[test]
    fn splittable_respects_capacity() {
        let d = Dpi::new(dir(), 0, 1, 4);
        // V=4: partitions 0..4. 2*1+1=3 < 4 splittable; 2*3+1=7 not.
        assert!(d.is_splittable(1));
        assert!(!d.is_splittable(3));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut d = Dpi::new(dir(), 2, 4, 256);
        d.mark_splittable_child(0).unwrap();
        let bytes = d.encode();
        let back = Dpi::decode(&bytes, true).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn merge_is_semilattice() {
        let mut a = Dpi::new(dir(), 0, 4, 64);
        a.mark_splittable_child(0).unwrap(); // bit 1
        let mut b = Dpi::new(dir(), 0, 4, 64);
        b.mark_splittable_child(0).unwrap();
        b.mark_splittable_child(1).unwrap(); // bit 3

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        assert_eq!(ab, ba, "merge must be commutative");

        let mut aa = a.clone();
        assert!(!aa.merge(&a).unwrap(), "merging with self changes nothing");
        assert_eq!(aa, a, "merge must be idempotent");
    }

    #[test]
    fn merge_associative() {
        let dirid = dir();
        let mut a = Dpi::new(dirid, 0, 4, 64);
        a.mark_splittable_child(0).unwrap();
        let mut b = Dpi::new(dirid, 0, 4, 64);
        b.mark_splittable_child(0).unwrap();
        b.mark_splittable_child(1).unwrap();
        let mut c = Dpi::new(dirid, 0, 4, 64);
        c.mark_splittable_child(0).unwrap();
        let c3 = c.mark_splittable_child(1).unwrap();
        c.mark_splittable_child(c3).unwrap();

        let mut ab_c = a.clone();
        ab_c.merge(&b).unwrap();
        ab_c.merge(&c).unwrap();

        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut a_bc = a.clone();
        a_bc.merge(&bc).unwrap();

        assert_eq!(ab_c, a_bc);
    }

    #[test]
    fn split_disjointness() {
        let mut d = Dpi::new(dir(), 0, 4, 1024);
        let child = d.mark_splittable_child(0).unwrap();
        let names: Vec<String> = (0..2000).map(|i| format!("file-{}", i)).collect();
        for name in &names {
            let h = hashkit::hash128(name.as_bytes());
            let to_parent = d.routes_to(0, h) && !d.to_be_migrated(child, h);
            let to_child = d.to_be_migrated(child, h);
            assert!(to_parent != to_child, "exactly one must hold for {}", name);
        }
    }

    #[test]
    fn routing_is_monotone_under_merge() {
        let mut d = Dpi::new(dir(), 0, 4, 1024);
        let mut d2 = d.clone();
        let child = d2.mark_splittable_child(0).unwrap();

        // Pick a name that still resolves to the parent under `d`.
        let mut name = None;
        for i in 0..5000 {
            let candidate = format!("f{}", i);
            let h = hashkit::hash128(candidate.as_bytes());
            if d.partition_for(h) == 0 && d2.partition_for(h) == 0 {
                name = Some(candidate);
                break;
            }
        }
        let name = name.expect("some name should remain at the root partition");
        let before = d.select_server(name.as_bytes());

        let mut merged = d.clone();
        merged.merge(&d2).unwrap();
        let after = merged.select_server(name.as_bytes());
        assert_eq!(before, after);
        let _ = child;
    }

    #[quickcheck]
    fn clear_top_bit_reaches_zero(mut r: u32) -> bool {
        r %= 1 << 16;
        for _ in 0..32 {
            if r == 0 {
                return true;
            }
            r = clear_top_bit(r);
        }
        r == 0
    }
}

//! Compaction policy (§4.2): which files to merge next, and why. Picking
//! a compaction is pure decision-making over a [`Version`] snapshot;
//! [`crate::engine`] does the actual file I/O.

use crate::version::{FileMeta, Version, NUM_LEVELS};
use mdtypes::rowkey::RowKey;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Debug)]
pub struct CompactionJob {
    pub level: usize,
    pub inputs: Vec<Arc<FileMeta>>,
    pub next_level_inputs: Vec<Arc<FileMeta>>,
    pub reason: CompactionReason,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionReason {
    L0Overflow,
    LevelSizeOverflow,
    SeekLimitReached,
}

impl CompactionJob {
    pub fn output_level(&self) -> usize {
        self.level + 1
    }

    pub fn key_range(&self) -> (RowKey, RowKey) {
        let mut lo = self.inputs[0].smallest;
        let mut hi = self.inputs[0].largest;
        for f in self.inputs.iter().chain(self.next_level_inputs.iter()) {
            if f.smallest < lo {
                lo = f.smallest;
            }
            if f.largest > hi {
                hi = f.largest;
            }
        }
        (lo, hi)
    }
}

fn overlapping(level_files: &[Arc<FileMeta>], lo: RowKey, hi: RowKey) -> Vec<Arc<FileMeta>> {
    level_files
        .iter()
        .filter(|f| f.smallest <= hi && f.largest >= lo)
        .cloned()
        .collect()
}

/// Byte-size limit for level `k >= 1`: `write_buffer_size *
/// level_factor^k`, per §4.2.
pub fn level_size_limit(level: usize, write_buffer_size: usize, level_factor: u64) -> u64 {
    debug_assert!(level >= 1);
    write_buffer_size as u64 * level_factor.pow(level as u32)
}

/// Seek-triggered compaction takes priority: a file run out of allowed
/// seeks has already paid for a compaction in wasted lookups.
pub fn pick_seek_compaction(version: &Version) -> Option<CompactionJob> {
    for level in 0..NUM_LEVELS - 1 {
        for file in &version.levels[level] {
            if file.allowed_seeks.load(Ordering::Relaxed) <= 0 {
                let next_level_inputs =
                    overlapping(&version.levels[level + 1], file.smallest, file.largest);
                return Some(CompactionJob {
                    level,
                    inputs: vec![file.clone()],
                    next_level_inputs,
                    reason: CompactionReason::SeekLimitReached,
                });
            }
        }
    }
    None
}

/// Size-triggered compaction: L0 file-count overflow, or an Lk>=1
/// byte-size overflow. Picks the file after the level's round-robin
/// compaction pointer so repeated compactions sweep the whole keyspace
/// instead of always starting at the front.
pub fn pick_size_compaction(
    version: &Version,
    write_buffer_size: usize,
    level_factor: u64,
    l0_soft_limit: usize,
) -> Option<CompactionJob> {
    if version.levels[0].len() >= l0_soft_limit {
        let inputs: Vec<_> = version.levels[0].clone();
        let mut lo = inputs[0].smallest;
        let mut hi = inputs[0].largest;
        for f in &inputs {
            lo = lo.min(f.smallest);
            hi = hi.max(f.largest);
        }
        let next_level_inputs = overlapping(&version.levels[1], lo, hi);
        return Some(CompactionJob {
            level: 0,
            inputs,
            next_level_inputs,
            reason: CompactionReason::L0Overflow,
        });
    }

    for level in 1..NUM_LEVELS - 1 {
        let limit = level_size_limit(level, write_buffer_size, level_factor);
        if version.level_size(level) > limit {
            let files = &version.levels[level];
            if files.is_empty() {
                continue;
            }
            let pointer = version.compaction_pointers[level];
            let pick = pointer
                .and_then(|p| files.iter().find(|f| f.smallest > p))
                .unwrap_or(&files[0]);
            let next_level_inputs = overlapping(&version.levels[level + 1], pick.smallest, pick.largest);
            return Some(CompactionJob {
                level,
                inputs: vec![pick.clone()],
                next_level_inputs,
                reason: CompactionReason::LevelSizeOverflow,
            });
        }
    }
    None
}

pub fn pick_compaction(
    version: &Version,
    write_buffer_size: usize,
    level_factor: u64,
    l0_soft_limit: usize,
) -> Option<CompactionJob> {
    pick_seek_compaction(version)
        .or_else(|| pick_size_compaction(version, write_buffer_size, level_factor, l0_soft_limit))
}

/// §4.2's write stall: true once L0 has reached its hard cap, past the
/// point `pick_size_compaction`'s `l0_soft_limit` already started
/// draining it. Writers must stall (or be turned away with a retryable
/// error) until a compaction pass brings the L0 file count back down.
pub fn l0_over_hard_limit(version: &Version, l0_hard_limit: usize) -> bool {
    version.levels[0].len() >= l0_hard_limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VersionEdit;
    use mdtypes::rowkey::ValueType;
    use mdtypes::DirId;

    fn key(h: u128) -> RowKey {
        RowKey::new(DirId::new(1, 1), h, 1, ValueType::Attrs)
    }

    fn add(v: &mut Version, level: usize, lo: u128, hi: u128, seeks: i64) {
        let mut edit = VersionEdit::new();
        edit.added_files.push(crate::version::AddedFile {
            level,
            file_number: v.alloc_file_number(),
            file_size: 1,
            smallest: key(lo),
            largest: key(hi),
            allowed_seeks: seeks,
        });
        v.apply(&edit).unwrap();
    }

    #[test]
    fn l0_overflow_triggers_compaction() {
        let mut v = Version::empty();
        for i in 0..5 {
            add(&mut v, 0, i * 10, i * 10 + 5, 100);
        }
        let job = pick_size_compaction(&v, 4096, 10, 4).unwrap();
        assert_eq!(job.level, 0);
        assert_eq!(job.reason, CompactionReason::L0Overflow);
        assert_eq!(job.inputs.len(), 5);
    }

    #[test]
    fn no_compaction_below_thresholds() {
        let mut v = Version::empty();
        add(&mut v, 0, 0, 5, 100);
        assert!(pick_size_compaction(&v, 4096, 10, 4).is_none());
        assert!(pick_seek_compaction(&v).is_none());
    }

    #[test]
    fn seek_exhaustion_takes_priority_over_size() {
        let mut v = Version::empty();
        add(&mut v, 1, 0, 5, 0);
        let job = pick_compaction(&v, 4096, 10, 4).unwrap();
        assert_eq!(job.reason, CompactionReason::SeekLimitReached);
    }

    #[test]
    fn l0_hard_limit_trips_independently_of_soft_limit() {
        let mut v = Version::empty();
        for i in 0..3 {
            add(&mut v, 0, i * 10, i * 10 + 5, 100);
        }
        assert!(!l0_over_hard_limit(&v, 8));
        for i in 3..8 {
            add(&mut v, 0, i * 10, i * 10 + 5, 100);
        }
        assert!(l0_over_hard_limit(&v, 8));
    }

    #[test]
    fn next_level_overlap_is_included() {
        let mut v = Version::empty();
        add(&mut v, 1, 0, 10, 100);
        add(&mut v, 2, 5, 15, 100);
        add(&mut v, 2, 100, 110, 100);
        for _ in 0..20 {
            add(&mut v, 1, 0, 10, 100);
        }
        let job = pick_size_compaction(&v, 1, 2, 4).unwrap();
        assert_eq!(job.next_level_inputs.len(), 1);
    }
}

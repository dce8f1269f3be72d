//! Per-directory state (§5 "per-directory mutex"): the live [`dpi::Dpi`],
//! published through an `ArcSwap` so readers never block behind a writer
//! (§5 "ArcSwap copy-on-write DPI publication for lock-free reads"), plus
//! the split-trigger bookkeeping a directory needs to decide *when* §4.4's
//! split procedure should run.

use arc_swap::ArcSwap;
use dpi::Dpi;
use mdtypes::{DirId, Result};
use parking_lot::Mutex;
use slog::Logger;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitState {
    Idle,
    /// A split of `partition` is already underway; §4.4 only ever runs
    /// one split per directory at a time in this workspace.
    Splitting { partition: u32 },
}

pub struct DirectoryControl {
    dir: DirId,
    dpi: ArcSwap<Dpi>,
    split_state: Mutex<SplitState>,
    /// Approximate bytes written per partition since the last split
    /// touched it — the split-trigger heuristic (§4.4 "a partition whose
    /// write volume exceeds a threshold becomes a split candidate"). The
    /// MKE does not expose direct per-partition counters, so Directory
    /// Control keeps its own.
    partition_bytes: Mutex<HashMap<u32, u64>>,
    /// §5's per-directory mutex: serializes the lookup/create critical
    /// section (LLT lease transition + MKE read/write) for this
    /// directory across handler threads, so two concurrent creates for
    /// the same name can never both pass the duplicate check. An async
    /// mutex because the held section awaits the LLT's writer-freeze
    /// delay.
    critical_section: AsyncMutex<()>,
    logger: Logger,
}

impl DirectoryControl {
    pub fn new(dpi: Dpi, logger: Logger) -> Arc<Self> {
        Arc::new(DirectoryControl {
            dir: dpi.dir,
            dpi: ArcSwap::new(Arc::new(dpi)),
            split_state: Mutex::new(SplitState::Idle),
            partition_bytes: Mutex::new(HashMap::new()),
            critical_section: AsyncMutex::new(()),
            logger,
        })
    }

    /// Hold for the duration of a lookup or create's critical section
    /// (§5). Callers must not hold this across an RPC to another server
    /// (`perform_split`'s `SplitIngest` call happens outside of it).
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.critical_section.lock().await
    }

    pub fn dir(&self) -> DirId {
        self.dir
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn current_dpi(&self) -> Arc<Dpi> {
        self.dpi.load_full()
    }

    /// Merge `other` into the published DPI. Lock-free for readers: a
    /// fresh `Arc<Dpi>` is published atomically, never mutated in place.
    pub fn merge_dpi(&self, other: &Dpi) -> Result<bool> {
        let mut merged = (*self.dpi.load_full()).clone();
        let changed = merged.merge(other)?;
        if changed {
            self.dpi.store(Arc::new(merged));
        }
        Ok(changed)
    }

    pub fn record_write(&self, partition: u32, bytes: u64) -> u64 {
        let mut map = self.partition_bytes.lock();
        let entry = map.entry(partition).or_insert(0);
        *entry += bytes;
        *entry
    }

    pub fn bytes_written(&self, partition: u32) -> u64 {
        self.partition_bytes.lock().get(&partition).copied().unwrap_or(0)
    }

    pub fn reset_partition_bytes(&self, partition: u32) {
        self.partition_bytes.lock().remove(&partition);
    }

    /// Attempt to claim the right to split `partition`. Fails (returns
    /// `false`) if a split of any partition in this directory is already
    /// in progress.
    pub fn begin_split(&self, partition: u32) -> bool {
        let mut state = self.split_state.lock();
        if *state != SplitState::Idle {
            return false;
        }
        *state = SplitState::Splitting { partition };
        true
    }

    pub fn finish_split(&self) {
        *self.split_state.lock() = SplitState::Idle;
    }

    pub fn split_state(&self) -> SplitState {
        *self.split_state.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Discard};

    fn logger() -> Logger {
        Logger::root(Discard, o!())
    }

    #[test]
    fn merge_dpi_publishes_a_new_arc() {
        let dir = DirId::new(1, 1);
        let dc = DirectoryControl::new(Dpi::new(dir, 0, 4, 1024), logger());
        let before = dc.current_dpi();
        let mut other = (*before).clone();
        other.mark_splittable_child(0).unwrap();
        assert!(dc.merge_dpi(&other).unwrap());
        let after = dc.current_dpi();
        assert!(after.is_split(1));
        assert!(!before.is_split(1), "earlier Arc handle must be unaffected");
    }

    #[test]
    fn only_one_split_in_flight_per_directory() {
        let dir = DirId::new(1, 1);
        let dc = DirectoryControl::new(Dpi::new(dir, 0, 4, 1024), logger());
        assert!(dc.begin_split(0));
        assert!(!dc.begin_split(0));
        dc.finish_split();
        assert!(dc.begin_split(0));
    }

    #[test]
    fn partition_byte_counters_accumulate_and_reset() {
        let dir = DirId::new(1, 1);
        let dc = DirectoryControl::new(Dpi::new(dir, 0, 4, 1024), logger());
        dc.record_write(0, 100);
        dc.record_write(0, 50);
        assert_eq!(dc.bytes_written(0), 150);
        dc.reset_partition_bytes(0);
        assert_eq!(dc.bytes_written(0), 0);
    }
}

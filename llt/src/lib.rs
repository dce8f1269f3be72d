//! The Lookup-Lease Table (§4.3): an LRU-bounded cache of directory-lookup
//! leases with a three-state coherence protocol (Free/Shared/Locked) that
//! coordinates concurrent readers with mutating writers.
//!
//! [`LeaseTable`] is a plain `&mut self` structure meant to be used under
//! whatever lock the caller already holds ("externally synchronized",
//! §4.3) — in this workspace that's [`dircontrol`](../dircontrol)'s
//! per-directory mutex. [`SyncedLeaseTable`] wraps it with its own
//! `parking_lot::Mutex` for callers that want "internally synchronized"
//! access instead (e.g. a standalone cache not already behind another
//! lock).

use linked_hash_map::LinkedHashMap;
use mdtypes::clock::{Clock, MicroInstant};
use mdtypes::{DirId, Error, InodeAttrs, Result};
use parking_lot::Mutex;
use std::sync::Arc;

pub type LeaseKey = (DirId, u128);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseState {
    Free,
    Shared,
    Locked,
}

#[derive(Clone, Debug)]
pub struct Lease {
    pub parent_dir_ref: DirId,
    pub state: LeaseState,
    /// Absolute deadline, monotonic microseconds. Frozen (stops advancing)
    /// once the lease enters `Locked`.
    pub due: MicroInstant,
    /// The deadline a pending writer must wait out before committing
    /// (§4.3 writer waiting rule). Only meaningful while `state ==
    /// Locked`.
    pub frozen_due: MicroInstant,
    pub attrs: Option<InodeAttrs>,
    pub refs: u32,
    /// Sequence number of the writer currently holding the lock, used to
    /// detect a stale commit/abort from a writer that is no longer the
    /// current lock holder.
    writer_seq: Option<u64>,
}

impl Lease {
    fn new_free(parent_dir_ref: DirId) -> Self {
        Lease {
            parent_dir_ref,
            state: LeaseState::Free,
            due: 0,
            frozen_due: 0,
            attrs: None,
            refs: 0,
            writer_seq: None,
        }
    }
}

/// Result of a [`LeaseTable::lookup`] call.
#[derive(Clone, Debug)]
pub enum LookupOutcome {
    /// A trustworthy cached answer.
    Hit(InodeAttrs),
    /// No usable cached answer; the caller must consult the MKE (or RPC
    /// to the owning server) and call [`LeaseTable::fill`].
    Miss,
    /// A writer holds the lock; the caller may wait or return a
    /// not-yet-ready answer to its own caller, per §4.3.
    Pending,
}

pub struct LeaseTable {
    capacity: usize,
    max_lease_duration_us: u64,
    clock: Arc<dyn Clock>,
    entries: LinkedHashMap<LeaseKey, Lease>,
    next_writer_seq: u64,
}

impl LeaseTable {
    pub fn new(capacity: usize, max_lease_duration_us: u64, clock: Arc<dyn Clock>) -> Self {
        LeaseTable {
            capacity: capacity.max(1),
            max_lease_duration_us: max_lease_duration_us.max(1),
            clock,
            entries: LinkedHashMap::new(),
            next_writer_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn now(&self) -> MicroInstant {
        self.clock.now_us()
    }

    /// §4.3 coherence table, `lookup` rows. Also touches LRU order on a
    /// hit.
    pub fn lookup(&mut self, key: LeaseKey) -> LookupOutcome {
        let now = self.now();
        let outcome = match self.entries.get_refresh(&key) {
            None => LookupOutcome::Miss,
            Some(lease) => match lease.state {
                LeaseState::Locked => LookupOutcome::Pending,
                LeaseState::Free => LookupOutcome::Miss,
                LeaseState::Shared if now < lease.due => {
                    lease.due = now + self.max_lease_duration_us;
                    LookupOutcome::Hit(lease.attrs.clone().expect("Shared lease always has attrs"))
                }
                LeaseState::Shared => {
                    // Expired: degrade to Free and treat as a miss.
                    lease.state = LeaseState::Free;
                    LookupOutcome::Miss
                }
            },
        };
        outcome
    }

    /// Populate (or refresh) a cold or missing entry after a successful
    /// MKE read, transitioning it to `Shared` with a fresh `due`.
    pub fn fill(&mut self, parent: DirId, name_hash: u128, attrs: InodeAttrs) {
        let key = (parent, name_hash);
        let now = self.now();
        let lease = self
            .entries
            .entry(key)
            .or_insert_with(|| Lease::new_free(parent));
        lease.state = LeaseState::Shared;
        lease.due = now + self.max_lease_duration_us;
        lease.attrs = Some(attrs);
        self.evict_if_needed();
    }

    pub fn pin(&mut self, key: LeaseKey) {
        if let Some(lease) = self.entries.get_mut(&key) {
            lease.refs += 1;
        }
    }

    pub fn unpin(&mut self, key: LeaseKey) {
        if let Some(lease) = self.entries.get_mut(&key) {
            lease.refs = lease.refs.saturating_sub(1);
        }
        self.evict_if_needed();
    }

    /// §4.3 `writer_acquire`: Free or Shared -> Locked, freezing `due` and
    /// stamping a fresh writer sequence number. Returns the deadline
    /// (`frozen_due`) the writer must wait out before committing. Fails
    /// with `InvalidArgument` if the lease is already `Locked` — two
    /// writers must never race for the same key; in this workspace
    /// [`dircontrol`](../dircontrol)'s per-directory mutex is what
    /// prevents that from happening, so this is a backstop against a
    /// caller bypassing it, not the primary defense.
    pub fn writer_acquire(&mut self, parent: DirId, name_hash: u128) -> Result<(u64, MicroInstant)> {
        let key = (parent, name_hash);
        let now = self.now();
        let lease = self
            .entries
            .entry(key)
            .or_insert_with(|| Lease::new_free(parent));
        if lease.state == LeaseState::Locked {
            return Err(Error::invalid_argument(
                "writer_acquire on an already-locked lease",
            ));
        }
        self.next_writer_seq += 1;
        let seq = self.next_writer_seq;
        // Freeze at whichever is later: the lease's current due (so
        // existing Shared holders still get their full window) or now
        // (so a Free lease doesn't let a writer commit immediately,
        // giving any gossip-registered client a chance to have seen the
        // miss).
        let frozen_due = lease.due.max(now);
        lease.state = LeaseState::Locked;
        lease.due = frozen_due;
        lease.frozen_due = frozen_due;
        lease.writer_seq = Some(seq);
        Ok((seq, frozen_due))
    }

    /// Whether `now >= frozen_due` for the writer holding `key`'s lock —
    /// i.e. whether [`LeaseTable::writer_commit`] may be called yet.
    pub fn ready_to_commit(&self, key: LeaseKey) -> bool {
        match self.entries.get(&key) {
            Some(lease) if lease.state == LeaseState::Locked => self.now() >= lease.frozen_due,
            _ => false,
        }
    }

    /// §4.3 `writer_commit`: publish the new payload and transition back
    /// to `Shared`. Fails with `InvalidArgument` if the lease is not
    /// `Locked` under `writer_seq`, or if called before `frozen_due`
    /// (callers should consult [`LeaseTable::ready_to_commit`] first or
    /// sleep until it returns true).
    pub fn writer_commit(
        &mut self,
        parent: DirId,
        name_hash: u128,
        writer_seq: u64,
        new_attrs: InodeAttrs,
    ) -> Result<()> {
        let key = (parent, name_hash);
        let now = self.now();
        let lease = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| Error::invalid_argument("writer_commit on absent lease"))?;
        if lease.state != LeaseState::Locked || lease.writer_seq != Some(writer_seq) {
            return Err(Error::invalid_argument(
                "writer_commit by a non-current writer",
            ));
        }
        if now < lease.frozen_due {
            return Err(Error::invalid_argument(
                "writer_commit before frozen_due has elapsed",
            ));
        }
        lease.state = LeaseState::Shared;
        lease.due = now + self.max_lease_duration_us;
        lease.attrs = Some(new_attrs);
        lease.writer_seq = None;
        Ok(())
    }

    /// §4.3 `writer_abort`: Locked -> Shared, keeping the old payload.
    pub fn writer_abort(&mut self, parent: DirId, name_hash: u128, writer_seq: u64) -> Result<()> {
        let key = (parent, name_hash);
        let now = self.now();
        let lease = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| Error::invalid_argument("writer_abort on absent lease"))?;
        if lease.state != LeaseState::Locked || lease.writer_seq != Some(writer_seq) {
            return Err(Error::invalid_argument(
                "writer_abort by a non-current writer",
            ));
        }
        lease.state = if lease.attrs.is_some() {
            LeaseState::Shared
        } else {
            LeaseState::Free
        };
        lease.due = now + self.max_lease_duration_us;
        lease.writer_seq = None;
        Ok(())
    }

    /// Evict from the least-recently-used end, skipping pinned entries
    /// and anything not `Free` (§4.3 lifecycle: "destroyed on LRU
    /// eviction when refs == 0 and state == Free").
    fn evict_if_needed(&mut self) {
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .find(|(_, l)| l.refs == 0 && l.state == LeaseState::Free)
                .map(|(k, _)| *k);
            match victim {
                Some(k) => {
                    self.entries.remove(&k);
                }
                // Nothing evictable right now (everything pinned or
                // live); stop rather than violate the eviction
                // precondition. The table is allowed to temporarily
                // exceed capacity under sustained pinning pressure.
                None => break,
            }
        }
    }
}

/// Internally-synchronized wrapper for callers that are not already
/// behind another lock (§4.3's second concurrency mode).
pub struct SyncedLeaseTable {
    inner: Mutex<LeaseTable>,
}

impl SyncedLeaseTable {
    pub fn new(capacity: usize, max_lease_duration_us: u64, clock: Arc<dyn Clock>) -> Self {
        SyncedLeaseTable {
            inner: Mutex::new(LeaseTable::new(capacity, max_lease_duration_us, clock)),
        }
    }

    pub fn lookup(&self, key: LeaseKey) -> LookupOutcome {
        self.inner.lock().lookup(key)
    }

    pub fn fill(&self, parent: DirId, name_hash: u128, attrs: InodeAttrs) {
        self.inner.lock().fill(parent, name_hash, attrs)
    }

    pub fn writer_acquire(&self, parent: DirId, name_hash: u128) -> Result<(u64, MicroInstant)> {
        self.inner.lock().writer_acquire(parent, name_hash)
    }

    pub fn ready_to_commit(&self, key: LeaseKey) -> bool {
        self.inner.lock().ready_to_commit(key)
    }

    pub fn writer_commit(
        &self,
        parent: DirId,
        name_hash: u128,
        writer_seq: u64,
        new_attrs: InodeAttrs,
    ) -> Result<()> {
        self.inner
            .lock()
            .writer_commit(parent, name_hash, writer_seq, new_attrs)
    }

    pub fn writer_abort(&self, parent: DirId, name_hash: u128, writer_seq: u64) -> Result<()> {
        self.inner.lock().writer_abort(parent, name_hash, writer_seq)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdtypes::FakeClock;

    fn attrs(inode_no: u64) -> InodeAttrs {
        InodeAttrs {
            inode_no,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 0,
            zeroth_server_of_child: None,
            inline_data: None,
        }
    }

    fn table(clock: Arc<FakeClock>) -> LeaseTable {
        LeaseTable::new(16, 1000, clock)
    }

    #[test]
    fn miss_then_fill_then_hit() {
        let clock = Arc::new(FakeClock::new(0));
        let mut t = table(clock.clone());
        let key = (DirId::new(1, 1), 42);
        assert!(matches!(t.lookup(key), LookupOutcome::Miss));
        t.fill(key.0, key.1, attrs(7));
        match t.lookup(key) {
            LookupOutcome::Hit(a) => assert_eq!(a.inode_no, 7),
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[test]
    fn shared_lease_expires_after_due() {
        let clock = Arc::new(FakeClock::new(0));
        let mut t = table(clock.clone());
        let key = (DirId::new(1, 1), 42);
        t.fill(key.0, key.1, attrs(1));
        clock.advance(1001);
        assert!(matches!(t.lookup(key), LookupOutcome::Miss));
    }

    #[test]
    fn writer_cannot_commit_before_frozen_due() {
        let clock = Arc::new(FakeClock::new(0));
        let mut t = table(clock.clone());
        let key = (DirId::new(1, 1), 42);
        t.fill(key.0, key.1, attrs(1));
        let (seq, frozen_due) = t.writer_acquire(key.0, key.1).unwrap();
        assert!(matches!(t.lookup(key), LookupOutcome::Pending));
        assert!(t
            .writer_commit(key.0, key.1, seq, attrs(2))
            .is_err());
        clock.set(frozen_due);
        assert!(t.writer_commit(key.0, key.1, seq, attrs(2)).is_ok());
        match t.lookup(key) {
            LookupOutcome::Hit(a) => assert_eq!(a.inode_no, 2),
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[test]
    fn no_reader_ever_observes_expired_due_as_valid() {
        // §8.7 lease safety: across schedules, a reader never trusts a
        // lease whose `due` had already expired.
        let clock = Arc::new(FakeClock::new(0));
        let mut t = table(clock.clone());
        let key = (DirId::new(1, 1), 42);
        t.fill(key.0, key.1, attrs(1));
        clock.advance(999);
        assert!(matches!(t.lookup(key), LookupOutcome::Hit(_)));
        clock.advance(2);
        assert!(matches!(t.lookup(key), LookupOutcome::Miss));
    }

    #[test]
    fn writer_abort_restores_old_payload() {
        let clock = Arc::new(FakeClock::new(0));
        let mut t = table(clock.clone());
        let key = (DirId::new(1, 1), 42);
        t.fill(key.0, key.1, attrs(1));
        let (seq, _) = t.writer_acquire(key.0, key.1).unwrap();
        t.writer_abort(key.0, key.1, seq).unwrap();
        match t.lookup(key) {
            LookupOutcome::Hit(a) => assert_eq!(a.inode_no, 1),
            other => panic!("expected old payload, got {:?}", other),
        }
    }

    #[test]
    fn pinned_entries_survive_capacity_pressure() {
        let clock = Arc::new(FakeClock::new(0));
        let mut t = LeaseTable::new(2, 1000, clock);
        let a = (DirId::new(1, 1), 1);
        let b = (DirId::new(1, 1), 2);
        let c = (DirId::new(1, 1), 3);
        t.fill(a.0, a.1, attrs(1));
        t.pin(a);
        t.fill(b.0, b.1, attrs(2));
        t.fill(c.0, c.1, attrs(3));
        // Capacity is 2 and `a` is pinned, so `b` (least-recently-used
        // and unpinned) should have been evicted, not `a`.
        assert!(matches!(t.lookup(a), LookupOutcome::Hit(_)));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn stale_writer_seq_is_rejected() {
        let clock = Arc::new(FakeClock::new(0));
        let mut t = table(clock.clone());
        let key = (DirId::new(1, 1), 42);
        t.fill(key.0, key.1, attrs(1));
        let (seq1, due1) = t.writer_acquire(key.0, key.1).unwrap();
        clock.set(due1);
        t.writer_commit(key.0, key.1, seq1, attrs(2)).unwrap();
        // seq1 is no longer current; a second acquire issues seq2.
        assert!(t.writer_commit(key.0, key.1, seq1, attrs(99)).is_err());
    }

    #[test]
    fn writer_acquire_rejects_an_already_locked_lease() {
        let clock = Arc::new(FakeClock::new(0));
        let mut t = table(clock.clone());
        let key = (DirId::new(1, 1), 42);
        t.writer_acquire(key.0, key.1).unwrap();
        assert!(t.writer_acquire(key.0, key.1).is_err());
    }
}

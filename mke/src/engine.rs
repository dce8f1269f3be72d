//! The Metadata Key-Value Engine itself (§4.2): ties together the WAL,
//! memtable, table files, and version manifest behind `put`/`get`/
//! `delete`, a background compactor, snapshot reads, and the bulk-ingest
//! path directory splits use to hand off a row range without going
//! through the memtable.

use crate::compaction::{l0_over_hard_limit, pick_compaction, CompactionJob};
use crate::memtable::Memtable;
use crate::table::{GetOutcome, TableMeta, TableReader, TableWriter};
use crate::version::{self, ManifestWriter, Version, VersionEdit};
use crate::wal::{self, WalRecord, WalWriter};
use fs2::FileExt;
use mdtypes::rowkey::{RowKey, ValueType};
use mdtypes::{DirId, Error, InodeAttrs, MdsOptions, Result};
use parking_lot::{Mutex, RwLock};
use slog::{debug, info, o, warn, Logger};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A read snapshot: guarantees `get_at` will not observe any write whose
/// sequence is `> sequence()`, and pins compaction from dropping rows
/// this snapshot might still need (§8 "snapshot isolation").
pub struct Snapshot {
    seq: u64,
    registry: Arc<Mutex<BTreeSet<u64>>>,
}

impl Snapshot {
    pub fn sequence(&self) -> u64 {
        self.seq
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.seq);
    }
}

enum CompactorMsg {
    WorkAvailable,
    Shutdown,
}

struct Shared {
    data_dir: PathBuf,
    options: MdsOptions,
    logger: Logger,
    mutable: RwLock<Arc<Memtable>>,
    immutable: RwLock<Option<Arc<Memtable>>>,
    version: Mutex<Version>,
    manifest: Mutex<ManifestWriter>,
    wal: Mutex<(WalWriter, u64)>,
    sequence: AtomicU64,
    open_snapshots: Arc<Mutex<BTreeSet<u64>>>,
    reader_cache: Mutex<HashMap<u64, Arc<TableReader>>>,
    write_gate: Mutex<()>,
    /// The WAL file superseded by the most recent memtable rotation,
    /// deleted once its rows are durably flushed into an L0 table.
    stale_wal: Mutex<Option<PathBuf>>,
}

/// A writable, per-server MKE instance.
pub struct Mke {
    shared: Arc<Shared>,
    compactor_tx: SyncSender<CompactorMsg>,
    compactor_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Mke {
    pub fn open(data_dir: &Path, options: MdsOptions, logger: Logger) -> Result<Self> {
        fs::create_dir_all(data_dir).map_err(Error::from)?;
        let lock_path = data_dir.join("LOCK");
        let lock_file = File::create(&lock_path).map_err(Error::from)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| Error::invalid_argument("data directory already locked by another process"))?;
        std::mem::forget(lock_file); // held for process lifetime; released on process exit.

        let manifest_name = match version::read_current(data_dir)? {
            Some(name) => name,
            None => {
                let name = "MANIFEST-000001".to_string();
                version::write_current(data_dir, &name)?;
                name
            }
        };
        let manifest_path = data_dir.join(&manifest_name);
        let mut version_state = version::replay_manifest(&manifest_path)?;

        // Replay any WAL left from before a clean shutdown into a fresh
        // mutable memtable.
        let mutable = Arc::new(Memtable::new());
        let mut max_wal_seq = 0u64;
        let mut wal_file_number = None;
        let mut wal_entries: Vec<_> = fs::read_dir(data_dir)
            .map_err(Error::from)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "wal"))
            .collect();
        wal_entries.sort_by_key(|e| e.file_name());
        for entry in &wal_entries {
            let records = wal::replay(&entry.path())?;
            for r in records {
                max_wal_seq = max_wal_seq.max(r.key.sequence);
                let value = if r.key.value_type == ValueType::Attrs {
                    Some(r.value)
                } else {
                    None
                };
                mutable.insert(r.key, value);
            }
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if let Ok(n) = stem.parse::<u64>() {
                    wal_file_number = Some(wal_file_number.map_or(n, |m: u64| m.max(n)));
                }
            }
        }

        let sequence = version_state.last_sequence.max(max_wal_seq);
        let wal_file_number = match wal_file_number {
            Some(n) => n,
            None => version_state.alloc_file_number(),
        };
        let wal_path = data_dir.join(format!("{:06}.wal", wal_file_number));
        let wal_writer = WalWriter::create(&wal_path)?;
        let manifest_writer = ManifestWriter::create(&manifest_path)?;

        info!(logger, "opened metadata key-value engine";
            "data_dir" => data_dir.display().to_string(), "sequence" => sequence);

        let shared = Arc::new(Shared {
            data_dir: data_dir.to_path_buf(),
            options,
            logger: logger.clone(),
            mutable: RwLock::new(mutable),
            immutable: RwLock::new(None),
            version: Mutex::new(version_state),
            manifest: Mutex::new(manifest_writer),
            wal: Mutex::new((wal_writer, wal_file_number)),
            sequence: AtomicU64::new(sequence),
            open_snapshots: Arc::new(Mutex::new(BTreeSet::new())),
            reader_cache: Mutex::new(HashMap::new()),
            write_gate: Mutex::new(()),
            stale_wal: Mutex::new(None),
        });

        let (tx, rx) = sync_channel(8);
        let shutdown = Arc::new(AtomicBool::new(false));
        let compactor_handle = if !shared.options.disable_compaction {
            let shared_bg = shared.clone();
            let shutdown_bg = shutdown.clone();
            Some(std::thread::spawn(move || {
                compactor_loop(shared_bg, rx, shutdown_bg);
            }))
        } else {
            // Still drain flush requests even with compaction disabled,
            // so a read-mostly replica's memtable doesn't grow forever.
            let shared_bg = shared.clone();
            let shutdown_bg = shutdown.clone();
            Some(std::thread::spawn(move || {
                flush_only_loop(shared_bg, rx, shutdown_bg);
            }))
        };

        Ok(Mke {
            shared,
            compactor_tx: tx,
            compactor_handle,
            shutdown,
        })
    }

    pub fn put(&self, parent: DirId, name_hash: u128, attrs: InodeAttrs) -> Result<()> {
        let value = bincode::serialize(&attrs)
            .map_err(|e| Error::corruption(format!("encoding InodeAttrs: {}", e)))?;
        self.write_row(parent, name_hash, ValueType::Attrs, Some(value))
    }

    pub fn delete(&self, parent: DirId, name_hash: u128) -> Result<()> {
        self.write_row(parent, name_hash, ValueType::Tombstone, None)
    }

    /// §4.2 write stall: reject with a retryable error while L0 sits at
    /// or above its hard limit, so a backed-up compactor pushes back on
    /// writers instead of letting L0 grow without bound. Pokes the
    /// compactor awake on the way out since a stalled writer is a sign
    /// it may be idle.
    fn check_l0_not_over_hard_limit(&self) -> Result<()> {
        let over = l0_over_hard_limit(&self.shared.version.lock(), self.shared.options.l0_hard_limit);
        if over {
            warn!(self.shared.logger, "write stalled: L0 over hard limit";
                "l0_hard_limit" => self.shared.options.l0_hard_limit);
            let _ = self.compactor_tx.try_send(CompactorMsg::WorkAvailable);
            return Err(Error::overloaded(
                "L0 file count at or above l0_hard_limit; retry once compaction drains it",
            ));
        }
        Ok(())
    }

    fn write_row(
        &self,
        parent: DirId,
        name_hash: u128,
        value_type: ValueType,
        value: Option<Vec<u8>>,
    ) -> Result<()> {
        self.check_l0_not_over_hard_limit()?;
        let _gate = self.shared.write_gate.lock();
        let seq = self.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let key = RowKey::new(parent, name_hash, seq, value_type);
        {
            let mut wal = self.shared.wal.lock();
            wal.0.append(&WalRecord {
                key,
                value: value.clone().unwrap_or_default(),
            })?;
        }
        let mutable = self.shared.mutable.read().clone();
        mutable.insert(key, value);
        if mutable.approx_size() >= self.shared.options.write_buffer_size {
            self.rotate_memtable()?;
        }
        Ok(())
    }

    fn rotate_memtable(&self) -> Result<()> {
        {
            let immutable_full = self.shared.immutable.read().is_some();
            if immutable_full {
                // Writer stall (§4.2): flush hasn't caught up yet. Wake
                // the compactor and proceed; the next put will try
                // again rather than block indefinitely here.
                let _ = self.compactor_tx.try_send(CompactorMsg::WorkAvailable);
                return Ok(());
            }
        }
        let new_file_number = {
            let mut version = self.shared.version.lock();
            version.alloc_file_number()
        };
        let new_wal_path = self.shared.data_dir.join(format!("{:06}.wal", new_file_number));
        let new_wal = WalWriter::create(&new_wal_path)?;
        let old_memtable = {
            let mut mutable = self.shared.mutable.write();
            let old = mutable.clone();
            *mutable = Arc::new(Memtable::new());
            old
        };
        {
            let mut wal_guard = self.shared.wal.lock();
            let old_wal_number = wal_guard.1;
            *wal_guard = (new_wal, new_file_number);
            let old_wal_path = self
                .shared
                .data_dir
                .join(format!("{:06}.wal", old_wal_number));
            // The old WAL is still needed until the flush below durably
            // installs the memtable's rows as an L0 table; it is
            // deleted by the compactor thread after that succeeds.
            *self.shared.stale_wal.lock() = Some(old_wal_path);
        }
        *self.shared.immutable.write() = Some(old_memtable);
        let _ = self.compactor_tx.try_send(CompactorMsg::WorkAvailable);
        Ok(())
    }

    pub fn get(&self, parent: DirId, name_hash: u128) -> Result<Option<InodeAttrs>> {
        let seq = self.shared.sequence.load(Ordering::SeqCst);
        self.get_at_sequence(parent, name_hash, seq)
    }

    pub fn snapshot(&self) -> Snapshot {
        let seq = self.shared.sequence.load(Ordering::SeqCst);
        self.shared.open_snapshots.lock().insert(seq);
        Snapshot {
            seq,
            registry: self.shared.open_snapshots.clone(),
        }
    }

    pub fn get_at(
        &self,
        snapshot: &Snapshot,
        parent: DirId,
        name_hash: u128,
    ) -> Result<Option<InodeAttrs>> {
        self.get_at_sequence(parent, name_hash, snapshot.sequence())
    }

    fn get_at_sequence(
        &self,
        parent: DirId,
        name_hash: u128,
        snapshot_seq: u64,
    ) -> Result<Option<InodeAttrs>> {
        if let Some(v) = self.shared.mutable.read().clone().get(parent, name_hash, snapshot_seq) {
            return decode_outcome(v);
        }
        if let Some(immutable) = self.shared.immutable.read().clone() {
            if let Some(v) = immutable.get(parent, name_hash, snapshot_seq) {
                return decode_outcome(v);
            }
        }
        let version = {
            let guard = self.shared.version.lock();
            // Cheap structural clone: Arc<FileMeta> entries are shared.
            Version {
                levels: guard.levels.clone(),
                next_file_number: guard.next_file_number,
                last_sequence: guard.last_sequence,
                compaction_pointers: guard.compaction_pointers.clone(),
            }
        };
        for level_files in &version.levels {
            let mut files: Vec<_> = level_files.iter().collect();
            files.sort_by_key(|f| std::cmp::Reverse(f.file_number));
            for file in files {
                let reader = self.open_reader(file.file_number)?;
                match reader.get(parent, name_hash, snapshot_seq) {
                    GetOutcome::Found(bytes) => return decode_outcome(Some(bytes)),
                    GetOutcome::Tombstoned => return Ok(None),
                    GetOutcome::WastedSeek => {
                        if file.record_wasted_seek() {
                            let _ = self.compactor_tx.try_send(CompactorMsg::WorkAvailable);
                        }
                    }
                    GetOutcome::BloomMiss => {}
                }
            }
        }
        Ok(None)
    }

    fn open_reader(&self, file_number: u64) -> Result<Arc<TableReader>> {
        let mut cache = self.shared.reader_cache.lock();
        if let Some(r) = cache.get(&file_number) {
            return Ok(r.clone());
        }
        let path = self.shared.data_dir.join(format!("{:06}.ldb", file_number));
        let reader = Arc::new(TableReader::open(&path)?);
        cache.insert(file_number, reader.clone());
        Ok(reader)
    }

    /// Directory-split bulk ingest (§4.5): install a pre-built sorted
    /// table directly at L0 without touching the memtable.
    pub fn bulk_ingest(&self, built_table: &Path) -> Result<()> {
        self.check_l0_not_over_hard_limit()?;
        let mut version = self.shared.version.lock();
        let file_number = version.alloc_file_number();
        let dest = self.shared.data_dir.join(format!("{:06}.ldb", file_number));
        fs::rename(built_table, &dest).map_err(Error::from)?;
        let reader = TableReader::open(&dest)?;
        let smallest = reader
            .smallest()
            .ok_or_else(|| Error::invalid_argument("bulk ingest of empty table"))?;
        let largest = reader.largest().unwrap();
        let meta = TableMeta {
            file_number,
            path: dest.clone(),
            smallest,
            largest,
            num_entries: reader.len(),
            file_size: fs::metadata(&dest).map_err(Error::from)?.len(),
            allowed_seeks_init: 100,
        };
        let mut edit = VersionEdit::new();
        edit.add_file(0, &meta);
        edit.next_file_number = Some(version.next_file_number);
        self.shared.manifest.lock().append(&edit)?;
        version.apply(&edit)?;
        info!(self.shared.logger, "bulk-ingested table"; "file_number" => file_number);
        let _ = self.compactor_tx.try_send(CompactorMsg::WorkAvailable);
        Ok(())
    }

    pub fn request_compaction_pass(&self) {
        let _ = self.compactor_tx.try_send(CompactorMsg::WorkAvailable);
    }

    /// Every live row belonging to `parent`, newest version first per
    /// name hash, as raw `(RowKey, value_bytes)` pairs in key order.
    /// Tombstoned names are dropped. Used by directory-split migration
    /// (§4.4 step 2) to pick the rows a child partition takes over, and
    /// more generally as the directory-scoped scan the row-range
    /// contract of §4.2 asks for (point `get`/`get_at` above cover the
    /// single-name case; this covers the whole-directory one).
    pub fn live_rows_for_dir(&self, parent: DirId) -> Result<Vec<(RowKey, Vec<u8>)>> {
        let lo = RowKey::parent_floor(parent);
        let hi = RowKey::parent_ceil(parent);
        let mut merged: Vec<(RowKey, Option<Vec<u8>>)> = Vec::new();

        merged.extend(
            self.shared
                .mutable
                .read()
                .clone()
                .snapshot()
                .into_iter()
                .filter(|(k, _)| *k >= lo && *k <= hi),
        );
        if let Some(immutable) = self.shared.immutable.read().clone() {
            merged.extend(
                immutable
                    .snapshot()
                    .into_iter()
                    .filter(|(k, _)| *k >= lo && *k <= hi),
            );
        }
        let version = {
            let guard = self.shared.version.lock();
            Version {
                levels: guard.levels.clone(),
                next_file_number: guard.next_file_number,
                last_sequence: guard.last_sequence,
                compaction_pointers: guard.compaction_pointers.clone(),
            }
        };
        for level_files in &version.levels {
            for file in level_files {
                let reader = self.open_reader(file.file_number)?;
                merged.extend(reader.iter_all().filter(|(k, _)| *k >= lo && *k <= hi).map(
                    |(k, v)| {
                        let value = if k.value_type == ValueType::Attrs {
                            Some(v.clone())
                        } else {
                            None
                        };
                        (*k, value)
                    },
                ));
            }
        }
        merged.sort_by_key(|(k, _)| *k);

        // `merged` is ascending by RowKey, which within one name hash
        // means descending sequence regardless of which source a row
        // came from: the first entry seen for a name hash is always
        // its newest version.
        let mut out = Vec::new();
        let mut idx = 0;
        while idx < merged.len() {
            let (key, value) = &merged[idx];
            if key.value_type == ValueType::Attrs {
                if let Some(bytes) = value {
                    out.push((*key, bytes.clone()));
                }
            }
            let name_hash = key.name_hash;
            idx += 1;
            while idx < merged.len() && merged[idx].0.name_hash == name_hash {
                idx += 1;
            }
        }
        Ok(out)
    }

    /// Builds a standalone, L0-ready table file at `tmp_path` from
    /// pre-selected `(RowKey, value)` rows, already in ascending key
    /// order. The caller ships the resulting file to the directory
    /// split's target server, which installs it with `bulk_ingest`.
    pub fn build_split_table(&self, tmp_path: &Path, rows: &[(RowKey, Vec<u8>)]) -> Result<()> {
        let mut writer = TableWriter::create(
            tmp_path,
            self.shared.options.block_size,
            self.shared.options.block_restart_interval,
            rows.len(),
        )?;
        for (key, value) in rows {
            writer.add(*key, value)?;
        }
        writer.finish(0)?;
        Ok(())
    }

    /// Tombstones every name in `name_hashes` under `parent` as one
    /// write-gate critical section sharing a single sequence number.
    /// Stands in for a true range-tombstone (§4.4 step 4 calls for
    /// deleting the migrated key range in one stroke); see DESIGN.md
    /// for why per-name tombstones are used instead.
    pub fn delete_many(&self, parent: DirId, name_hashes: &[u128]) -> Result<()> {
        if name_hashes.is_empty() {
            return Ok(());
        }
        let _gate = self.shared.write_gate.lock();
        let seq = self.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mutable = self.shared.mutable.read().clone();
        for &name_hash in name_hashes {
            let key = RowKey::new(parent, name_hash, seq, ValueType::Tombstone);
            {
                let mut wal = self.shared.wal.lock();
                wal.0.append(&WalRecord {
                    key,
                    value: Vec::new(),
                })?;
            }
            mutable.insert(key, None);
        }
        if mutable.approx_size() >= self.shared.options.write_buffer_size {
            self.rotate_memtable()?;
        }
        Ok(())
    }
}

impl Drop for Mke {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.compactor_tx.send(CompactorMsg::Shutdown);
        if let Some(handle) = self.compactor_handle.take() {
            let _ = handle.join();
        }
    }
}

fn decode_outcome(value: Option<Vec<u8>>) -> Result<Option<InodeAttrs>> {
    match value {
        None => Ok(None),
        Some(bytes) => {
            let attrs: InodeAttrs = bincode::deserialize(&bytes)
                .map_err(|e| Error::corruption(format!("decoding InodeAttrs: {}", e)))?;
            Ok(Some(attrs))
        }
    }
}

fn flush_pending(shared: &Arc<Shared>) -> Result<()> {
    let immutable = { shared.immutable.read().clone() };
    let Some(memtable) = immutable else {
        return Ok(());
    };
    let rows = memtable.snapshot();
    if rows.is_empty() {
        *shared.immutable.write() = None;
        if let Some(path) = shared.stale_wal.lock().take() {
            let _ = fs::remove_file(path);
        }
        return Ok(());
    }
    let mut version = shared.version.lock();
    let file_number = version.alloc_file_number();
    let path = shared.data_dir.join(format!("{:06}.ldb", file_number));
    let mut writer = TableWriter::create(
        &path,
        shared.options.block_size,
        shared.options.block_restart_interval,
        rows.len(),
    )?;
    for (key, value) in &rows {
        writer.add(*key, value.as_deref().unwrap_or(&[]))?;
    }
    let mut meta = writer.finish(file_number)?;
    meta.path = path;
    let mut edit = VersionEdit::new();
    edit.add_file(0, &meta);
    edit.next_file_number = Some(version.next_file_number);
    shared.manifest.lock().append(&edit)?;
    version.apply(&edit)?;
    drop(version);
    *shared.immutable.write() = None;
    if let Some(path) = shared.stale_wal.lock().take() {
        let _ = fs::remove_file(path);
    }
    info!(shared.logger, "flushed memtable"; "file_number" => file_number, "rows" => rows.len());
    Ok(())
}

fn run_compaction_job(shared: &Arc<Shared>, job: CompactionJob) -> Result<()> {
    let oldest_snapshot = shared
        .open_snapshots
        .lock()
        .iter()
        .next()
        .copied()
        .unwrap_or(u64::MAX);
    let is_last_level = job.output_level() == version::NUM_LEVELS - 1;

    let mut merged: Vec<(RowKey, Vec<u8>)> = Vec::new();
    for file in job.inputs.iter().chain(job.next_level_inputs.iter()) {
        let path = file.table_path(&shared.data_dir);
        let reader = TableReader::open(&path)?;
        merged.extend(reader.iter_all().cloned());
    }
    merged.sort_by_key(|(k, _)| *k);

    // Drop rows shadowed by a newer version of the same name, and
    // tombstones old enough that no open snapshot can still need them.
    let mut output: Vec<(RowKey, Vec<u8>)> = Vec::new();
    let mut idx = 0;
    while idx < merged.len() {
        let (key, value) = &merged[idx];
        let mut j = idx + 1;
        while j < merged.len()
            && merged[j].0.parent == key.parent
            && merged[j].0.name_hash == key.name_hash
        {
            j += 1;
        }
        let keep_tombstone = key.value_type != ValueType::Attrs
            && (!is_last_level || key.sequence >= oldest_snapshot);
        if key.value_type == ValueType::Attrs || keep_tombstone {
            output.push((*key, value.clone()));
        }
        idx = j;
    }

    let mut edit = VersionEdit::new();
    for file in &job.inputs {
        edit.delete_file(job.level, file.file_number);
    }
    for file in &job.next_level_inputs {
        edit.delete_file(job.output_level(), file.file_number);
    }

    if !output.is_empty() {
        let mut version = shared.version.lock();
        let file_number = version.alloc_file_number();
        let path = shared.data_dir.join(format!("{:06}.ldb", file_number));
        let mut writer = TableWriter::create(
            &path,
            shared.options.block_size,
            shared.options.block_restart_interval,
            output.len(),
        )?;
        for (key, value) in &output {
            writer.add(*key, value)?;
        }
        let meta = writer.finish(file_number)?;
        edit.add_file(job.output_level(), &meta);
        edit.next_file_number = Some(version.next_file_number);
        if let Some((_, hi)) = job.inputs.last().map(|f| (f.smallest, f.largest)) {
            edit.compaction_pointers.push((job.level, hi));
        }
        shared.manifest.lock().append(&edit)?;
        version.apply(&edit)?;
    } else {
        let mut version = shared.version.lock();
        edit.next_file_number = Some(version.next_file_number);
        shared.manifest.lock().append(&edit)?;
        version.apply(&edit)?;
    }

    let mut cache = shared.reader_cache.lock();
    for file in job.inputs.iter().chain(job.next_level_inputs.iter()) {
        cache.remove(&file.file_number);
        let _ = fs::remove_file(file.table_path(&shared.data_dir));
    }
    drop(cache);

    debug!(shared.logger, "compaction finished";
        "level" => job.level, "reason" => format!("{:?}", job.reason), "output_rows" => output.len());
    Ok(())
}

fn compactor_loop(shared: Arc<Shared>, rx: Receiver<CompactorMsg>, shutdown: Arc<AtomicBool>) {
    loop {
        let msg = match rx.recv_timeout(std::time::Duration::from_millis(200)) {
            Ok(m) => m,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };
        if matches!(msg, CompactorMsg::Shutdown) {
            let _ = flush_pending(&shared);
            break;
        }
        if let Err(e) = flush_pending(&shared) {
            warn!(shared.logger, "memtable flush failed"; "error" => e.to_string());
            continue;
        }
        loop {
            let job = {
                let version = shared.version.lock();
                pick_compaction(
                    &version,
                    shared.options.write_buffer_size,
                    shared.options.level_factor,
                    shared.options.l0_soft_limit,
                )
            };
            match job {
                Some(job) => {
                    if let Err(e) = run_compaction_job(&shared, job) {
                        warn!(shared.logger, "compaction job failed"; "error" => e.to_string());
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

/// Used when `disable_compaction` is set: still flushes memtables (to
/// bound memory) but never merges levels.
fn flush_only_loop(shared: Arc<Shared>, rx: Receiver<CompactorMsg>, shutdown: Arc<AtomicBool>) {
    loop {
        let msg = match rx.recv_timeout(std::time::Duration::from_millis(200)) {
            Ok(m) => m,
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        };
        if let Err(e) = flush_pending(&shared) {
            warn!(shared.logger, "memtable flush failed"; "error" => e.to_string());
        }
        if matches!(msg, CompactorMsg::Shutdown) {
            break;
        }
    }
}

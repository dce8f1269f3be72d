//! Version manifest (§4.2): the live set of table files per level is a
//! fold of a monotone log of [`VersionEdit`] records, and the current
//! manifest is named by a small `CURRENT` pointer file rotated via
//! atomic rename.

use mdtypes::rowkey::RowKey;
use mdtypes::{Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Number of levels, L0 through L6. Sized generously relative to
/// `level_factor` growth; nothing in this workspace's scale needs more.
pub const NUM_LEVELS: usize = 7;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddedFile {
    pub level: usize,
    pub file_number: u64,
    pub file_size: u64,
    pub smallest: RowKey,
    pub largest: RowKey,
    pub allowed_seeks: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VersionEdit {
    pub added_files: Vec<AddedFile>,
    pub deleted_files: Vec<(usize, u64)>,
    pub next_file_number: Option<u64>,
    pub last_sequence: Option<u64>,
    pub compaction_pointers: Vec<(usize, RowKey)>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, level: usize, meta: &crate::table::TableMeta) {
        self.added_files.push(AddedFile {
            level,
            file_number: meta.file_number,
            file_size: meta.file_size,
            smallest: meta.smallest,
            largest: meta.largest,
            allowed_seeks: meta.allowed_seeks_init as i64,
        });
    }

    pub fn delete_file(&mut self, level: usize, file_number: u64) {
        self.deleted_files.push((level, file_number));
    }
}

#[derive(Debug)]
pub struct FileMeta {
    pub file_number: u64,
    pub file_size: u64,
    pub smallest: RowKey,
    pub largest: RowKey,
    /// §4.2 seek-triggered compaction: decremented on every wasted seek;
    /// the file is scheduled for compaction once this reaches zero.
    pub allowed_seeks: AtomicI64,
}

impl FileMeta {
    pub fn record_wasted_seek(&self) -> bool {
        self.allowed_seeks.fetch_sub(1, Ordering::Relaxed) <= 1
    }

    pub fn table_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{:06}.ldb", self.file_number))
    }
}

/// The live set of table files per level, plus the file-number and
/// sequence-number counters. Reconstructed at open by folding every
/// `VersionEdit` in the manifest; kept current thereafter by applying
/// each new edit as it's durably appended.
#[derive(Debug)]
pub struct Version {
    pub levels: Vec<Vec<Arc<FileMeta>>>,
    pub next_file_number: u64,
    pub last_sequence: u64,
    pub compaction_pointers: Vec<Option<RowKey>>,
}

impl Version {
    pub fn empty() -> Self {
        Version {
            levels: vec![Vec::new(); NUM_LEVELS],
            next_file_number: 1,
            last_sequence: 0,
            compaction_pointers: vec![None; NUM_LEVELS],
        }
    }

    pub fn apply(&mut self, edit: &VersionEdit) -> Result<()> {
        for (level, file_number) in &edit.deleted_files {
            let level_files = self
                .levels
                .get_mut(*level)
                .ok_or_else(|| Error::corruption("bad level in VersionEdit delete"))?;
            level_files.retain(|f| f.file_number != *file_number);
        }
        for added in &edit.added_files {
            let level_files = self
                .levels
                .get_mut(added.level)
                .ok_or_else(|| Error::corruption("bad level in VersionEdit add"))?;
            level_files.push(Arc::new(FileMeta {
                file_number: added.file_number,
                file_size: added.file_size,
                smallest: added.smallest,
                largest: added.largest,
                allowed_seeks: AtomicI64::new(added.allowed_seeks),
            }));
            level_files.sort_by_key(|f| f.smallest);
        }
        if let Some(n) = edit.next_file_number {
            self.next_file_number = self.next_file_number.max(n);
        }
        if let Some(s) = edit.last_sequence {
            self.last_sequence = self.last_sequence.max(s);
        }
        for (level, key) in &edit.compaction_pointers {
            if let Some(slot) = self.compaction_pointers.get_mut(*level) {
                *slot = Some(*key);
            }
        }
        Ok(())
    }

    pub fn alloc_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    pub fn alloc_sequence(&mut self) -> u64 {
        self.last_sequence += 1;
        self.last_sequence
    }

    pub fn level_size(&self, level: usize) -> u64 {
        self.levels[level].iter().map(|f| f.file_size).sum()
    }
}

/// Append-only manifest log, CRC-framed exactly like [`crate::wal`].
pub struct ManifestWriter {
    file: File,
    path: PathBuf,
}

impl ManifestWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(Error::from)?;
        Ok(ManifestWriter {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn append(&mut self, edit: &VersionEdit) -> Result<()> {
        let body = bincode::serialize(edit)
            .map_err(|e| Error::corruption(format!("encoding VersionEdit: {}", e)))?;
        let crc = crc32fast::hash(&body);
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&(body.len() as u32).to_le_bytes())?;
        self.file.write_all(&body)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn replay_manifest(path: &Path) -> Result<Version> {
    let mut version = Version::empty();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(version),
        Err(e) => return Err(Error::from(e)),
    };
    let mut reader = BufReader::new(file);
    loop {
        let mut crc_buf = [0u8; 4];
        if reader.read_exact(&mut crc_buf).is_err() {
            break;
        }
        let mut len_buf = [0u8; 4];
        if reader.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        if reader.read_exact(&mut body).is_err() {
            break;
        }
        if crc32fast::hash(&body) != u32::from_le_bytes(crc_buf) {
            break;
        }
        match bincode::deserialize::<VersionEdit>(&body) {
            Ok(edit) => version.apply(&edit)?,
            Err(_) => break,
        }
    }
    Ok(version)
}

/// Name of the live manifest, read from / written to the `CURRENT`
/// pointer file. Rotation is atomic: write a temp file, then `rename`
/// it over `CURRENT` (§4.2).
pub fn read_current(data_dir: &Path) -> Result<Option<String>> {
    let current_path = data_dir.join("CURRENT");
    match fs::read_to_string(&current_path) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::from(e)),
    }
}

pub fn write_current(data_dir: &Path, manifest_file_name: &str) -> Result<()> {
    let tmp_path = data_dir.join("CURRENT.tmp");
    {
        let mut f = File::create(&tmp_path).map_err(Error::from)?;
        f.write_all(manifest_file_name.as_bytes())
            .map_err(Error::from)?;
        f.sync_all().map_err(Error::from)?;
    }
    fs::rename(&tmp_path, data_dir.join("CURRENT")).map_err(Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdtypes::rowkey::ValueType;
    use mdtypes::DirId;

    fn key(h: u128) -> RowKey {
        RowKey::new(DirId::new(1, 1), h, 1, ValueType::Attrs)
    }

    #[test]
    fn apply_add_then_delete() {
        let mut v = Version::empty();
        let mut edit = VersionEdit::new();
        edit.added_files.push(AddedFile {
            level: 0,
            file_number: 1,
            file_size: 100,
            smallest: key(0),
            largest: key(10),
            allowed_seeks: 5,
        });
        v.apply(&edit).unwrap();
        assert_eq!(v.levels[0].len(), 1);

        let mut edit2 = VersionEdit::new();
        edit2.delete_file(0, 1);
        v.apply(&edit2).unwrap();
        assert!(v.levels[0].is_empty());
    }

    #[test]
    fn manifest_replay_reconstructs_version() {
        let dir = tempdir::TempDir::new("manifest").unwrap();
        let path = dir.path().join("MANIFEST-1");
        {
            let mut w = ManifestWriter::create(&path).unwrap();
            let mut edit = VersionEdit::new();
            edit.added_files.push(AddedFile {
                level: 0,
                file_number: 1,
                file_size: 10,
                smallest: key(0),
                largest: key(5),
                allowed_seeks: 5,
            });
            edit.next_file_number = Some(2);
            edit.last_sequence = Some(3);
            w.append(&edit).unwrap();
        }
        let v = replay_manifest(&path).unwrap();
        assert_eq!(v.levels[0].len(), 1);
        assert_eq!(v.next_file_number, 2);
        assert_eq!(v.last_sequence, 3);
    }

    #[test]
    fn current_pointer_roundtrips() {
        let dir = tempdir::TempDir::new("current").unwrap();
        write_current(dir.path(), "MANIFEST-7").unwrap();
        assert_eq!(read_current(dir.path()).unwrap().as_deref(), Some("MANIFEST-7"));
    }
}

//! The storage-backend abstraction (§6): a small capability set —
//! sequential read, random read, append, sync, list, rename, lock —
//! shared by a local filesystem, a discard-everything null backend for
//! benchmarking the RPC/DPI/LLT path without storage I/O, and a
//! documented stub for object stores.
//!
//! This is an out-of-scope "external collaborator" per the design: the
//! MKE's own WAL/table/manifest files in this workspace talk to
//! `std::fs` directly rather than through `dyn StorageBackend` (see
//! DESIGN.md), so this trait exists for operator tooling and for
//! components, like `mdserver`, that want to pick a backend at runtime
//! without caring which one they got.

use mdtypes::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub trait StorageBackend: Send + Sync {
    fn read_all(&self, path: &Path) -> Result<Vec<u8>>;
    fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn append(&self, path: &Path, data: &[u8]) -> Result<()>;
    fn sync(&self, path: &Path) -> Result<()>;
    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn remove(&self, path: &Path) -> Result<()>;
    /// Acquire an exclusive advisory lock on `path` for the lifetime of
    /// the returned guard (dropping it releases the lock).
    fn lock_exclusive(&self, path: &Path) -> Result<Box<dyn LockGuard>>;
}

pub trait LockGuard: Send {}

/// The only fully-implemented backend: ordinary files under a root
/// directory.
pub struct LocalFsBackend;

impl LocalFsBackend {
    pub fn new() -> Self {
        LocalFsBackend
    }
}

impl Default for LocalFsBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct FileLockGuard {
    _file: fs::File,
}

impl LockGuard for FileLockGuard {}

impl StorageBackend for LocalFsBackend {
    fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(Error::from)
    }

    fn read_at(&self, path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut file = fs::File::open(path).map_err(Error::from)?;
        file.seek(SeekFrom::Start(offset)).map_err(Error::from)?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).map_err(Error::from)?;
        Ok(buf)
    }

    fn append(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(Error::from)?;
        file.write_all(data).map_err(Error::from)?;
        Ok(())
    }

    fn sync(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new().write(true).open(path).map_err(Error::from)?;
        file.sync_all().map_err(Error::from)?;
        Ok(())
    }

    fn list(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).map_err(Error::from)? {
            out.push(entry.map_err(Error::from)?.path());
        }
        Ok(out)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(Error::from)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(Error::from)
    }

    fn lock_exclusive(&self, path: &Path) -> Result<Box<dyn LockGuard>> {
        use fs2::FileExt;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(Error::from)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::invalid_argument("path already locked"))?;
        Ok(Box::new(FileLockGuard { _file: file }))
    }
}

/// Discards every write and returns `NotFound` for every read. Useful
/// for benchmarking the RPC/DPI/LLT path in isolation from storage I/O.
pub struct NullBackend;

struct NullLockGuard;
impl LockGuard for NullLockGuard {}

impl StorageBackend for NullBackend {
    fn read_all(&self, _path: &Path) -> Result<Vec<u8>> {
        Err(Error::not_found("NullBackend stores nothing"))
    }

    fn read_at(&self, _path: &Path, _offset: u64, _len: usize) -> Result<Vec<u8>> {
        Err(Error::not_found("NullBackend stores nothing"))
    }

    fn append(&self, _path: &Path, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn sync(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn list(&self, _dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn rename(&self, _from: &Path, _to: &Path) -> Result<()> {
        Ok(())
    }

    fn remove(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn lock_exclusive(&self, _path: &Path) -> Result<Box<dyn LockGuard>> {
        Ok(Box::new(NullLockGuard))
    }
}

/// Documented stub: remote object stores are out of scope (§6). Every
/// method returns `NotSupported` rather than a partial, unsafe
/// implementation of multipart upload semantics.
pub struct ObjectStoreBackend {
    pub endpoint: String,
}

impl ObjectStoreBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        ObjectStoreBackend {
            endpoint: endpoint.into(),
        }
    }
}

struct ObjectStoreLockGuard;
impl LockGuard for ObjectStoreLockGuard {}

impl StorageBackend for ObjectStoreBackend {
    fn read_all(&self, _path: &Path) -> Result<Vec<u8>> {
        Err(Error::NotSupported(
            "object store backend is not implemented".into(),
        ))
    }

    fn read_at(&self, _path: &Path, _offset: u64, _len: usize) -> Result<Vec<u8>> {
        Err(Error::NotSupported(
            "object store backend is not implemented".into(),
        ))
    }

    fn append(&self, _path: &Path, _data: &[u8]) -> Result<()> {
        Err(Error::NotSupported(
            "object store backend is not implemented".into(),
        ))
    }

    fn sync(&self, _path: &Path) -> Result<()> {
        Err(Error::NotSupported(
            "object store backend is not implemented".into(),
        ))
    }

    fn list(&self, _dir: &Path) -> Result<Vec<PathBuf>> {
        Err(Error::NotSupported(
            "object store backend is not implemented".into(),
        ))
    }

    fn rename(&self, _from: &Path, _to: &Path) -> Result<()> {
        Err(Error::NotSupported(
            "object store backend is not implemented".into(),
        ))
    }

    fn remove(&self, _path: &Path) -> Result<()> {
        Err(Error::NotSupported(
            "object store backend is not implemented".into(),
        ))
    }

    fn lock_exclusive(&self, _path: &Path) -> Result<Box<dyn LockGuard>> {
        Err(Error::NotSupported(
            "object store backend is not implemented".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_fs_append_then_read_all() {
        let dir = tempdir::TempDir::new("storage").unwrap();
        let backend = LocalFsBackend::new();
        let path = dir.path().join("f");
        backend.append(&path, b"hello").unwrap();
        backend.append(&path, b" world").unwrap();
        assert_eq!(backend.read_all(&path).unwrap(), b"hello world");
    }

    #[test]
    fn local_fs_read_at_offset() {
        let dir = tempdir::TempDir::new("storage").unwrap();
        let backend = LocalFsBackend::new();
        let path = dir.path().join("f");
        backend.append(&path, b"0123456789").unwrap();
        assert_eq!(backend.read_at(&path, 3, 4).unwrap(), b"3456");
    }

    #[test]
    fn local_fs_list_and_rename() {
        let dir = tempdir::TempDir::new("storage").unwrap();
        let backend = LocalFsBackend::new();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        backend.append(&a, b"x").unwrap();
        assert_eq!(backend.list(dir.path()).unwrap().len(), 1);
        backend.rename(&a, &b).unwrap();
        assert!(!a.exists());
        assert!(b.exists());
    }

    #[test]
    fn null_backend_discards_everything() {
        let backend = NullBackend;
        let path = Path::new("/nonexistent");
        backend.append(path, b"ignored").unwrap();
        assert!(backend.read_all(path).is_err());
    }

    #[test]
    fn object_store_backend_reports_not_supported() {
        let backend = ObjectStoreBackend::new("https://example.invalid");
        match backend.read_all(Path::new("/x")) {
            Err(Error::NotSupported(_)) => {}
            other => panic!("expected NotSupported, got {:?}", other),
        }
    }
}

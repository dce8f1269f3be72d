//! The Metadata Key-Value Engine (§4.2): a log-structured merge store
//! specialized for filesystem inode/dentry rows. [`engine::Mke`] is the
//! entry point; the rest of this crate is its write-ahead log, memtable,
//! table-file format, version manifest, and compaction policy.

pub mod bloom;
pub mod compaction;
pub mod engine;
pub mod memtable;
pub mod table;
pub mod version;
pub mod wal;

pub use engine::{Mke, Snapshot};

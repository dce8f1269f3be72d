//! Shared types for the metadata-service workspace: the [`Error`] kind every
//! module boundary returns, the [`DirId`] directory identity, the MKE
//! [`RowKey`] encoding, the [`InodeAttrs`] row payload, the [`MdsOptions`]
//! configuration struct, and a small monotonic-clock abstraction used by
//! the lease table.

pub mod clock;
pub mod dirid;
pub mod error;
pub mod options;
pub mod rowkey;
pub mod value;

pub use clock::{Clock, FakeClock, MicroInstant, SystemClock};
pub use dirid::DirId;
pub use error::{Error, Result};
pub use options::MdsOptions;
pub use rowkey::{RowKey, Sequence, ValueType, ENCODED_LEN};
pub use value::InodeAttrs;

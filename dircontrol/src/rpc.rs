//! The wire shapes Directory Control exchanges over [`transport::Transport`]
//! (§6 "Call(in, out)"): lookups and creates from clients or peer servers,
//! and the internal split-ingest call one server issues to another during
//! a directory split (§4.4 step 3).
//!
//! Every response carries the responder's current [`dpi::Dpi`] for the
//! directory, encoded via `Dpi::encode` (see [`crate::state`]), so the
//! gossip-by-RPC-reply mechanism of §4.4 step 5 falls out of the normal
//! request/response path rather than needing a side channel.

use mdtypes::{DirId, InodeAttrs};
use serde_derive::{Deserialize, Serialize};

pub const OP_LOOKUP: u16 = 1;
pub const OP_CREATE: u16 = 2;
pub const OP_SPLIT_INGEST: u16 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DcRequest {
    Lookup {
        parent: DirId,
        name: Vec<u8>,
    },
    Create {
        parent: DirId,
        name: Vec<u8>,
        mode: u32,
        uid: u32,
        gid: u32,
        is_dir: bool,
    },
    /// Step 3 of a directory split: hand the target server a sorted,
    /// L0-ready table of the rows being migrated, plus the source's
    /// provisional DPI (child bit already set) for it to merge in.
    SplitIngest {
        parent: DirId,
        child_partition: u32,
        dpi_bytes: Vec<u8>,
        table_bytes: Vec<u8>,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DcResponse {
    Found { attrs: InodeAttrs, dpi_bytes: Vec<u8> },
    NotFound { dpi_bytes: Vec<u8> },
    /// A writer currently holds the lease lock (§4.3); the caller may
    /// retry shortly.
    Pending { dpi_bytes: Vec<u8> },
    /// This server does not own the partition `name` resolves to; merge
    /// `dpi_bytes` and re-route.
    WrongServer { dpi_bytes: Vec<u8> },
    Created { attrs: InodeAttrs, dpi_bytes: Vec<u8> },
    Ack { dpi_bytes: Vec<u8> },
}

impl DcResponse {
    pub fn dpi_bytes(&self) -> &[u8] {
        match self {
            DcResponse::Found { dpi_bytes, .. }
            | DcResponse::NotFound { dpi_bytes }
            | DcResponse::Pending { dpi_bytes }
            | DcResponse::WrongServer { dpi_bytes }
            | DcResponse::Created { dpi_bytes, .. }
            | DcResponse::Ack { dpi_bytes } => dpi_bytes,
        }
    }
}

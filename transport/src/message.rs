//! The wire message (§6 "RPC message"): `{op, err, payload_bytes}`. Small
//! payloads travel inline in one datagram; larger ones are split across
//! several datagrams and reassembled before being handed to the caller —
//! both shapes present the same [`RpcMessage`] to callers above this
//! crate.

use serde_derive::{Deserialize, Serialize};

/// Payloads at or under this size travel in a single UDP datagram
/// alongside the message header; above it they're fragmented.
pub const INLINE_THRESHOLD: usize = 200;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcMessage {
    pub op: u16,
    pub err: Option<String>,
    pub payload: Vec<u8>,
}

impl RpcMessage {
    pub fn request(op: u16, payload: Vec<u8>) -> Self {
        RpcMessage {
            op,
            err: None,
            payload,
        }
    }

    pub fn ok_response(op: u16, payload: Vec<u8>) -> Self {
        RpcMessage {
            op,
            err: None,
            payload,
        }
    }

    pub fn err_response(op: u16, err: impl Into<String>) -> Self {
        RpcMessage {
            op,
            err: Some(err.into()),
            payload: Vec::new(),
        }
    }

    pub fn is_detached(&self) -> bool {
        self.payload.len() > INLINE_THRESHOLD
    }
}

/// One fragment of a message too large for a single datagram: `msg_id`
/// ties fragments together, `index`/`count` let the receiver detect a
/// dropped fragment and give up rather than wait forever (UDP framing
/// has no delivery guarantee; the RPC-level deadline is what bounds the
/// wait).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fragment {
    pub msg_id: u64,
    pub index: u32,
    pub count: u32,
    pub bytes: Vec<u8>,
}

/// Split `body` (an encoded [`RpcMessage`]) into datagram-sized
/// fragments, each itself bincode-encoded and ready to send.
pub fn fragment(msg_id: u64, body: &[u8], max_datagram: usize) -> Vec<Vec<u8>> {
    let header_overhead = 32; // generous slack for the Fragment envelope.
    let chunk_size = max_datagram.saturating_sub(header_overhead).max(1);
    let chunks: Vec<&[u8]> = body.chunks(chunk_size).collect();
    let count = chunks.len() as u32;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let frag = Fragment {
                msg_id,
                index: i as u32,
                count,
                bytes: chunk.to_vec(),
            };
            bincode::serialize(&frag).expect("Fragment encodes")
        })
        .collect()
}

/// Reassembles fragments for one `msg_id` as they arrive.
#[derive(Default)]
pub struct Reassembler {
    count: Option<u32>,
    parts: Vec<Option<Vec<u8>>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler::default()
    }

    /// Returns the reassembled body once every fragment has arrived.
    pub fn add(&mut self, frag: Fragment) -> Option<Vec<u8>> {
        if self.count.is_none() {
            self.count = Some(frag.count);
            self.parts = vec![None; frag.count as usize];
        }
        if (frag.index as usize) < self.parts.len() {
            self.parts[frag.index as usize] = Some(frag.bytes);
        }
        if self.parts.iter().all(Option::is_some) {
            Some(self.parts.iter_mut().flat_map(|p| p.take().unwrap()).collect())
        } else {
            None
        }
    }
}

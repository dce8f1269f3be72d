//! The POSIX-ish client façade (§4.1, §4.3): resolves a directory's
//! owning server from a locally cached [`dpi::Dpi`], round-trips a
//! request over [`transport::Transport`], and follows `WrongServer`
//! redirects by merging in the responder's DPI and retrying — the same
//! gossip-by-reply mechanism [`dircontrol`] uses server-side, now driven
//! from the client.
//!
//! Library crates below this one speak `mdtypes::Error`; this crate sits
//! at the edge a human operates from, so it converts into `anyhow::Error`
//! the way the teacher's CLI-facing code does.

use anyhow::{anyhow, bail, Context, Result};
use dircontrol::rpc::{DcRequest, DcResponse, OP_CREATE, OP_LOOKUP};
use dpi::Dpi;
use hashkit::hash128;
use mdtypes::{DirId, InodeAttrs};
use parking_lot::RwLock;
use slog::{debug, Logger};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use transport::Transport;

/// Bounded so a directory stuck oscillating between two stale DPIs (a bug
/// elsewhere) fails loudly instead of looping forever.
const MAX_REDIRECTS: u32 = 8;

pub struct MdClient {
    transport: Arc<dyn Transport>,
    addrs: RwLock<HashMap<u32, String>>,
    dpi_cache: RwLock<HashMap<DirId, Arc<Dpi>>>,
    timeout: Duration,
    logger: Logger,
}

impl MdClient {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration, logger: Logger) -> Self {
        MdClient {
            transport,
            addrs: RwLock::new(HashMap::new()),
            dpi_cache: RwLock::new(HashMap::new()),
            timeout,
            logger,
        }
    }

    /// Teach the client how to reach `server_id`. A client needs at least
    /// one registered server to bootstrap a directory it has no cached
    /// DPI for yet.
    pub fn register_server(&self, server_id: u32, address: impl Into<String>) {
        self.addrs.write().insert(server_id, address.into());
    }

    pub async fn lookup(&self, parent: DirId, name: &[u8]) -> Result<Option<InodeAttrs>> {
        let hash = hash128(name);
        let request = DcRequest::Lookup {
            parent,
            name: name.to_vec(),
        };
        match self.call_with_redirects(parent, hash, OP_LOOKUP, request).await? {
            DcResponse::Found { attrs, .. } => Ok(Some(attrs)),
            DcResponse::NotFound { .. } => Ok(None),
            DcResponse::Pending { .. } => bail!("lookup for {:?} under {:?} is pending a concurrent writer", name, parent),
            other => Err(unexpected_response("Lookup", &other)),
        }
    }

    pub async fn create(
        &self,
        parent: DirId,
        name: &[u8],
        mode: u32,
        uid: u32,
        gid: u32,
        is_dir: bool,
    ) -> Result<InodeAttrs> {
        let hash = hash128(name);
        let request = DcRequest::Create {
            parent,
            name: name.to_vec(),
            mode,
            uid,
            gid,
            is_dir,
        };
        match self.call_with_redirects(parent, hash, OP_CREATE, request).await? {
            DcResponse::Created { attrs, .. } => Ok(attrs),
            other => Err(unexpected_response("Create", &other)),
        }
    }

    pub async fn mkdir(&self, parent: DirId, name: &[u8], mode: u32, uid: u32, gid: u32) -> Result<InodeAttrs> {
        self.create(parent, name, mode, uid, gid, true).await
    }

    /// Resolve the owning server from the cached DPI (or guess a
    /// bootstrap server if none is cached yet), make the call, and
    /// follow `WrongServer` redirects by merging in the fresher DPI
    /// every response carries.
    async fn call_with_redirects(
        &self,
        parent: DirId,
        name_hash: u128,
        op: u16,
        request: DcRequest,
    ) -> Result<DcResponse> {
        let mut target = self.resolve_target(parent, name_hash)?;
        for attempt in 0..MAX_REDIRECTS {
            let addr = self.address_of(target)?;
            let payload = bincode::serialize(&request).context("encoding request")?;
            let response_bytes = self
                .transport
                .call(&addr, op, payload, self.timeout)
                .await
                .with_context(|| format!("calling server {} at {}", target, addr))?;
            let response: DcResponse = bincode::deserialize(&response_bytes).context("decoding response")?;

            let dpi = Dpi::decode(response.dpi_bytes(), false).context("decoding DPI in response")?;
            let cached = self.remember_dpi(dpi)?;

            if let DcResponse::WrongServer { .. } = &response {
                let next = cached.server_for_partition(cached.partition_for(name_hash));
                debug!(self.logger, "redirected"; "dir" => parent.to_string(), "from" => target, "to" => next, "attempt" => attempt);
                if next == target {
                    bail!("server {} redirected to itself for {:?}", target, parent);
                }
                target = next;
                continue;
            }
            return Ok(response);
        }
        bail!("exceeded {} redirects resolving {:?}", MAX_REDIRECTS, parent)
    }

    fn resolve_target(&self, parent: DirId, name_hash: u128) -> Result<u32> {
        if let Some(dpi) = self.dpi_cache.read().get(&parent) {
            return Ok(dpi.server_for_partition(dpi.partition_for(name_hash)));
        }
        self.addrs
            .read()
            .keys()
            .min()
            .copied()
            .ok_or_else(|| anyhow!("no servers registered to bootstrap a lookup for {:?}", parent))
    }

    fn address_of(&self, server_id: u32) -> Result<String> {
        self.addrs
            .read()
            .get(&server_id)
            .cloned()
            .ok_or_else(|| anyhow!("no known address for server {}", server_id))
    }

    /// Merge a freshly-seen DPI into the cache, folding its bitmap into
    /// whatever this client already knew rather than overwriting — a
    /// response from a server that hasn't heard about the latest split
    /// yet must not erase splits this client already learned about.
    fn remember_dpi(&self, incoming: Dpi) -> Result<Arc<Dpi>> {
        let dir = incoming.dir;
        let mut cache = self.dpi_cache.write();
        match cache.get(&dir).cloned() {
            Some(existing) => {
                let mut merged = (*existing).clone();
                merged.merge(&incoming).context("merging DPI")?;
                let arc = Arc::new(merged);
                cache.insert(dir, arc.clone());
                Ok(arc)
            }
            None => {
                let arc = Arc::new(incoming);
                cache.insert(dir, arc.clone());
                Ok(arc)
            }
        }
    }
}

fn unexpected_response(op: &str, response: &DcResponse) -> anyhow::Error {
    anyhow!("{} got an unexpected response shape: {:?}", op, response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dircontrol::DirectoryControlTable;
    use mdtypes::{Clock, MdsOptions, SystemClock};
    use mke::Mke;
    use slog::{o, Discard};
    use transport::ChannelTransport;

    fn logger() -> Logger {
        Logger::root(Discard, o!())
    }

    fn single_server_opts() -> MdsOptions {
        MdsOptions {
            num_servers: 1,
            num_virtual_servers: 16,
            write_buffer_size: 200,
            max_lease_duration_us: 5_000_000,
            ..MdsOptions::default()
        }
        .clamped()
    }

    fn server(transport: Arc<ChannelTransport>) -> (Arc<DirectoryControlTable>, tempdir::TempDir) {
        let tmp = tempdir::TempDir::new("mdclient").unwrap();
        let opts = single_server_opts();
        let mke = Arc::new(Mke::open(tmp.path(), opts.clone(), logger()).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::default());
        let llt = Arc::new(llt::SyncedLeaseTable::new(opts.max_num_leases, opts.max_lease_duration_us, clock.clone()));
        let table = DirectoryControlTable::new(0, tmp.path().to_path_buf(), opts, mke, llt, transport, clock, logger());
        (table, tmp)
    }

    #[tokio::test]
    async fn lookup_create_round_trip_through_client() {
        let transport = ChannelTransport::new();
        let (table, _tmp) = server(transport.clone());
        transport.register("server-0", table);

        let client = MdClient::new(transport, Duration::from_secs(1), logger());
        client.register_server(0, "server-0");

        let parent = DirId::new(1, 1);
        assert!(client.lookup(parent, b"f").await.unwrap().is_none());

        let created = client.create(parent, b"f", 0o644, 0, 0, false).await.unwrap();
        assert_eq!(created.mode, 0o644);

        let found = client.lookup(parent, b"f").await.unwrap().unwrap();
        assert_eq!(found.inode_no, created.inode_no);
    }

    #[tokio::test]
    async fn mkdir_sets_the_directory_bit() {
        let transport = ChannelTransport::new();
        let (table, _tmp) = server(transport.clone());
        transport.register("server-0", table);

        let client = MdClient::new(transport, Duration::from_secs(1), logger());
        client.register_server(0, "server-0");

        let parent = DirId::new(2, 2);
        let attrs = client.mkdir(parent, b"sub", 0o755, 0, 0).await.unwrap();
        assert!(attrs.is_dir());
    }

    #[tokio::test]
    async fn duplicate_create_surfaces_as_an_error() {
        let transport = ChannelTransport::new();
        let (table, _tmp) = server(transport.clone());
        transport.register("server-0", table);

        let client = MdClient::new(transport, Duration::from_secs(1), logger());
        client.register_server(0, "server-0");

        let parent = DirId::new(3, 3);
        client.create(parent, b"dup", 0o644, 0, 0, false).await.unwrap();
        let err = client.create(parent, b"dup", 0o644, 0, 0, false).await.unwrap_err();
        assert!(err.to_string().contains("calling server") || err.to_string().to_lowercase().contains("already"));
    }
}

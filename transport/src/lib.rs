//! The RPC transport (§6): a `Call(in, out)` interface moving opaque
//! bytes, implemented twice — a Tokio UDP datagram transport for real
//! processes, and an in-process channel transport for tests — so the
//! rest of the system is oblivious to which one is in use.

pub mod message;

use async_trait::async_trait;
use message::{fragment, Fragment, Reassembler, RpcMessage};
use mdtypes::{Error, Result};
use parking_lot::Mutex as SyncMutex;
use serde_derive::{Deserialize, Serialize};
use slog::{debug, o, warn, Logger};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::udp::{RecvHalf, SendHalf};
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

/// A handler answers inbound RPCs; `mdserver`'s dispatch table
/// implements this.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, op: u16, payload: Vec<u8>) -> Result<Vec<u8>>;
}

/// A client-side call interface. Both [`UdpTransport`] and
/// [`ChannelTransport`] implement this.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, target: &str, op: u16, payload: Vec<u8>, deadline: Duration) -> Result<Vec<u8>>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct WireEnvelope {
    call_id: u64,
    is_response: bool,
    msg: RpcMessage,
}

// ---------------------------------------------------------------------
// UDP transport
// ---------------------------------------------------------------------

pub struct UdpTransport {
    send_half: AsyncMutex<SendHalf>,
    local_addr: SocketAddr,
    max_msgsz: usize,
    pending: SyncMutex<HashMap<u64, oneshot::Sender<RpcMessage>>>,
    next_call_id: AtomicU64,
    logger: Logger,
}

impl UdpTransport {
    /// Binds a UDP socket and spawns the receive loop that both
    /// resolves outstanding `call()`s and, when `handler` is set,
    /// dispatches inbound requests to it.
    pub async fn bind(
        addr: SocketAddr,
        max_msgsz: usize,
        handler: Option<Arc<dyn Handler>>,
        logger: Logger,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await.map_err(Error::from)?;
        let local_addr = socket.local_addr().map_err(Error::from)?;
        let (recv_half, send_half) = socket.split();
        let transport = Arc::new(UdpTransport {
            send_half: AsyncMutex::new(send_half),
            local_addr,
            max_msgsz,
            pending: SyncMutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            logger: logger.clone(),
        });
        let transport_for_loop = transport.clone();
        tokio::spawn(async move {
            recv_loop(transport_for_loop, recv_half, handler, logger).await;
        });
        Ok(transport)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_envelope(&self, addr: SocketAddr, envelope: &WireEnvelope) -> Result<()> {
        let body = bincode::serialize(envelope)
            .map_err(|e| Error::corruption(format!("encoding RPC envelope: {}", e)))?;
        let fragments = fragment(envelope.call_id, &body, self.max_msgsz);
        let mut send_half = self.send_half.lock().await;
        for frag in fragments {
            send_half.send_to(&frag, &addr).await.map_err(Error::from)?;
        }
        Ok(())
    }
}

async fn recv_loop(
    transport: Arc<UdpTransport>,
    mut recv_half: RecvHalf,
    handler: Option<Arc<dyn Handler>>,
    logger: Logger,
) {
    let mut buf = vec![0u8; transport.max_msgsz.max(65_507)];
    let mut reassemblers: HashMap<(SocketAddr, u64), Reassembler> = HashMap::new();
    loop {
        let (n, peer) = match recv_half.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(logger, "UDP recv failed"; "error" => e.to_string());
                continue;
            }
        };
        let frag: Fragment = match bincode::deserialize(&buf[..n]) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let key = (peer, frag.msg_id);
        let body = match reassemblers.entry(key).or_insert_with(Reassembler::new).add(frag) {
            Some(b) => b,
            None => continue,
        };
        reassemblers.remove(&key);
        let envelope: WireEnvelope = match bincode::deserialize(&body) {
            Ok(e) => e,
            Err(_) => continue,
        };
        if envelope.is_response {
            if let Some(tx) = transport.pending.lock().remove(&envelope.call_id) {
                let _ = tx.send(envelope.msg);
            }
            continue;
        }
        let Some(handler) = handler.clone() else {
            debug!(logger, "dropping inbound request: no handler registered");
            continue;
        };
        let transport = transport.clone();
        tokio::spawn(async move {
            let result = handler.handle(envelope.msg.op, envelope.msg.payload).await;
            let response_msg = match result {
                Ok(payload) => RpcMessage::ok_response(envelope.msg.op, payload),
                Err(e) => RpcMessage::err_response(envelope.msg.op, e.to_string()),
            };
            let response = WireEnvelope {
                call_id: envelope.call_id,
                is_response: true,
                msg: response_msg,
            };
            let _ = transport.send_envelope(peer, &response).await;
        });
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn call(&self, target: &str, op: u16, payload: Vec<u8>, deadline: Duration) -> Result<Vec<u8>> {
        let addr: SocketAddr = target
            .parse()
            .map_err(|_| Error::invalid_argument(format!("bad transport target: {}", target)))?;
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(call_id, tx);
        let envelope = WireEnvelope {
            call_id,
            is_response: false,
            msg: RpcMessage::request(op, payload),
        };
        if let Err(e) = self.send_envelope(addr, &envelope).await {
            self.pending.lock().remove(&call_id);
            return Err(e);
        }
        let response = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(msg)) => msg,
            Ok(Err(_)) => return Err(Error::Disconnected("RPC response channel dropped".into())),
            Err(_) => {
                self.pending.lock().remove(&call_id);
                return Err(Error::Disconnected(format!(
                    "RPC to {} timed out after {:?}",
                    target, deadline
                )));
            }
        };
        match response.err {
            Some(err) => Err(Error::Disconnected(err)),
            None => Ok(response.payload),
        }
    }
}

// ---------------------------------------------------------------------
// In-process channel transport, for tests
// ---------------------------------------------------------------------

type ChannelRequest = (u16, Vec<u8>, oneshot::Sender<Result<Vec<u8>>>);

/// A registry of named in-process "servers", each backed by a
/// [`Handler`]. `call("peer-name", ...)` looks the peer up and invokes
/// its handler directly through a channel, skipping serialization
/// entirely — useful for exercising DC/MKE/LLT logic without a real
/// socket.
pub struct ChannelTransport {
    peers: SyncMutex<HashMap<String, tokio::sync::mpsc::UnboundedSender<ChannelRequest>>>,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(ChannelTransport {
            peers: SyncMutex::new(HashMap::new()),
        })
    }

    /// Registers `name` as a server backed by `handler`, spawning a
    /// task that serially drains its inbound request queue.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ChannelRequest>();
        self.peers.lock().insert(name.into(), tx);
        tokio::spawn(async move {
            while let Some((op, payload, reply)) = rx.recv().await {
                let result = handler.handle(op, payload).await;
                let _ = reply.send(result);
            }
        });
    }

    pub fn unregister(&self, name: &str) {
        self.peers.lock().remove(name);
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn call(&self, target: &str, op: u16, payload: Vec<u8>, deadline: Duration) -> Result<Vec<u8>> {
        let tx = {
            let peers = self.peers.lock();
            peers
                .get(target)
                .cloned()
                .ok_or_else(|| Error::Disconnected(format!("no such peer: {}", target)))?
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send((op, payload, reply_tx))
            .map_err(|_| Error::Disconnected(format!("peer {} is gone", target)))?;
        match tokio::time::timeout(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Disconnected(format!("peer {} dropped the call", target))),
            Err(_) => Err(Error::Disconnected(format!(
                "channel call to {} timed out after {:?}",
                target, deadline
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, op: u16, payload: Vec<u8>) -> Result<Vec<u8>> {
            if op == 0 {
                Err(Error::invalid_argument("op 0 is reserved"))
            } else {
                Ok(payload)
            }
        }
    }

    #[tokio::test]
    async fn channel_transport_round_trips() {
        let transport = ChannelTransport::new();
        transport.register("server", Arc::new(EchoHandler));
        let resp = transport
            .call("server", 1, b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp, b"ping");
    }

    #[tokio::test]
    async fn channel_transport_propagates_handler_errors() {
        let transport = ChannelTransport::new();
        transport.register("server", Arc::new(EchoHandler));
        let err = transport
            .call("server", 0, b"x".to_vec(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
    }

    #[tokio::test]
    async fn channel_transport_reports_unknown_peer() {
        let transport = ChannelTransport::new();
        let err = transport
            .call("nobody", 1, b"x".to_vec(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
    }

    #[tokio::test]
    async fn udp_transport_round_trips_small_payload() {
        let logger = Logger::root(slog::Discard, o!());
        let server = UdpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            1432,
            Some(Arc::new(EchoHandler)),
            logger.clone(),
        )
        .await
        .unwrap();
        let server_addr = server.local_addr().to_string();
        let client = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 1432, None, logger)
            .await
            .unwrap();
        let resp = client
            .call(&server_addr, 1, b"hello".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp, b"hello");
    }
}

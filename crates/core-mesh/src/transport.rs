//! Message transport between peers.
//!
//! Peers exchange self-describing JSON envelopes ([`Request`]/[`Response`])
//! over an abstract [`Transport`]. Two implementations exist:
//!
//! - [`MemoryTransport`]: an in-process registry used by tests and demos;
//!   lets many peers share one process.
//! - [`TcpTransport`]: length-prefixed frames over TCP with the
//!   deterministic `port = base_port + id` address mapping; one request per
//!   connection.
//!
//! Inbound dispatch goes through [`Router`], which binds envelope variants to
//! the handler methods of one [`Peer`] instance.
//!
//! # Frame format
//!
//! ```text
//! +-----------+---------------+
//! | Length    | JSON envelope |
//! | 4B BE     | var           |
//! +-----------+---------------+
//! ```

use crate::engine::Delivery;
use crate::neighbors::NeighborEntry;
use crate::peer::{Peer, PeerInfo};
use crate::position::Position;
use core_packet::PeerId;
use core_routing::Route;
use futures::future::BoxFuture;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on one envelope frame (image chunks are far smaller).
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to peer {0} timed out")]
    Timeout(PeerId),

    #[error("peer {0} is not reachable")]
    Unreachable(PeerId),

    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad envelope: {0}")]
    Codec(String),
}

/// Inbound request envelope. `Receive.from` names the adjacent sender (the
/// previous hop), which indexes the session key used to decrypt the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Receive { from: PeerId, bytes: Vec<u8> },
    ExchangeKey { id: PeerId, public_key: String },
    UpdatePosition { id: PeerId, position: Position },
    Heartbeat { id: PeerId, ts: f64 },
    ReceiveRoutingTable { sender_id: PeerId, table: HashMap<PeerId, Route> },
    SynchronizeTime { times: HashMap<PeerId, f64> },
    GetLocalTime,
    GetNeighbors,
    GetRoutingTable,
    GetInfo,
    GetLastReceived,
    GetReceivedImages,
    CaptureImage,
    TransmitImage { dst: PeerId, path: String },
    Send { dst: PeerId, payload: Vec<u8> },
    Fail,
    Recover,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    /// Structured reply from a FAILED peer.
    Offline,
    Error { message: String },
    KeyExchange { id: PeerId, public_key: String },
    LocalTime { time: f64 },
    Adjustment { adjustment: f64 },
    Neighbors { neighbors: HashMap<PeerId, NeighborEntry> },
    RoutingTable { table: HashMap<PeerId, Route> },
    Info { info: PeerInfo },
    LastReceived { delivery: Option<Delivery> },
    ReceivedImages { paths: Vec<String> },
    ImageCaptured { path: String },
}

/// Carries one request to the peer addressed by `dst` and awaits its
/// response. Implementations bound the call with a timeout; callers treat
/// failures as skippable.
pub trait Transport: Send + Sync + 'static {
    fn call(&self, dst: PeerId, request: Request)
        -> BoxFuture<'_, Result<Response, TransportError>>;
}

/// Binds inbound envelopes to the handler methods of one peer instance.
pub struct Router {
    peer: Arc<Peer>,
}

impl Router {
    pub fn new(peer: Arc<Peer>) -> Self {
        Self { peer }
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Receive { from, bytes } => self.peer.handle_receive(from, &bytes).await,
            Request::ExchangeKey { id, public_key } => {
                self.peer.handle_exchange_key(id, &public_key)
            }
            Request::UpdatePosition { id, position } => {
                self.peer.handle_update_position(id, position).await
            }
            Request::Heartbeat { id, ts } => self.peer.handle_heartbeat(id, ts),
            Request::ReceiveRoutingTable { sender_id, table } => {
                self.peer.handle_routing_table(sender_id, &table).await
            }
            Request::SynchronizeTime { times } => self.peer.handle_synchronize_time(&times),
            Request::GetLocalTime => self.peer.handle_get_local_time(),
            Request::GetNeighbors => self.peer.handle_get_neighbors(),
            Request::GetRoutingTable => self.peer.handle_get_routing_table(),
            Request::GetInfo => self.peer.handle_get_info(),
            Request::GetLastReceived => self.peer.handle_get_last_received(),
            Request::GetReceivedImages => self.peer.handle_get_received_images(),
            Request::CaptureImage => self.peer.handle_capture_image(),
            Request::TransmitImage { dst, path } => {
                self.peer.handle_transmit_image(dst, &path).await
            }
            Request::Send { dst, payload } => self.peer.handle_send(dst, payload).await,
            Request::Fail => self.peer.handle_fail(),
            Request::Recover => self.peer.handle_recover(),
        }
    }
}

/// In-process transport: a registry of peers keyed by id. Holds weak
/// references so dropping a peer makes it unreachable rather than immortal.
#[derive(Default)]
pub struct MemoryTransport {
    peers: RwLock<HashMap<PeerId, Weak<Peer>>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, peer: &Arc<Peer>) {
        self.peers
            .write()
            .unwrap()
            .insert(peer.id(), Arc::downgrade(peer));
    }

    pub fn unregister(&self, id: PeerId) {
        self.peers.write().unwrap().remove(&id);
    }
}

impl Transport for MemoryTransport {
    fn call(
        &self,
        dst: PeerId,
        request: Request,
    ) -> BoxFuture<'_, Result<Response, TransportError>> {
        Box::pin(async move {
            let target = self.peers.read().unwrap().get(&dst).cloned();
            let peer = target
                .and_then(|weak| weak.upgrade())
                .ok_or(TransportError::Unreachable(dst))?;
            Ok(Router::new(peer).handle(request).await)
        })
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R>(stream: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// TCP transport using the deterministic id-to-address mapping.
pub struct TcpTransport {
    host: String,
    base_port: u16,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, base_port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            base_port,
            timeout,
        }
    }

    pub fn addr_of(&self, id: PeerId) -> String {
        format!("{}:{}", self.host, self.base_port as u32 + id as u32)
    }
}

impl Transport for TcpTransport {
    fn call(
        &self,
        dst: PeerId,
        request: Request,
    ) -> BoxFuture<'_, Result<Response, TransportError>> {
        let addr = self.addr_of(dst);
        let timeout = self.timeout;
        Box::pin(async move {
            let exchange = async {
                let mut stream = async_std::net::TcpStream::connect(&addr).await?;
                let body = serde_json::to_vec(&request)
                    .map_err(|e| TransportError::Codec(e.to_string()))?;
                write_frame(&mut stream, &body).await?;
                let reply = read_frame(&mut stream).await?;
                serde_json::from_slice(&reply).map_err(|e| TransportError::Codec(e.to_string()))
            };
            match async_std::future::timeout(timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(dst)),
            }
        })
    }
}

/// Accept loop for the TCP transport. Each connection carries one request and
/// gets one response; handler work runs on its own task.
pub async fn serve(peer: Arc<Peer>, bind: &str) -> std::io::Result<()> {
    let listener = async_std::net::TcpListener::bind(bind).await?;
    log::info!("general: node {}: listening on {}", peer.id(), bind);
    loop {
        let (mut stream, remote) = listener.accept().await?;
        let router = Router::new(Arc::clone(&peer));
        async_std::task::spawn(async move {
            let response = match read_frame(&mut stream).await {
                Ok(body) => match serde_json::from_slice::<Request>(&body) {
                    Ok(request) => router.handle(request).await,
                    Err(e) => Response::Error {
                        message: format!("bad request envelope: {e}"),
                    },
                },
                Err(e) => Response::Error {
                    message: format!("bad frame: {e}"),
                },
            };
            match serde_json::to_vec(&response) {
                Ok(body) => {
                    if let Err(e) = write_frame(&mut stream, &body).await {
                        log::warn!("general: response write to {} failed: {}", remote, e);
                    }
                }
                Err(e) => log::error!("general: response encode failed: {}", e),
            }
        });
    }
}

//! Peer runtime for the satellite-constellation overlay network.
//!
//! A [`Peer`] composes six long-lived components into one process:
//!
//! 1. **PositionService**: self-position plus a pluggable mobility model,
//!    broadcast periodically to every possible deployment address.
//! 2. **NeighborTable**: direct neighbors within discovery range, kept alive
//!    by heartbeats and evicted on timeout.
//! 3. **RoutingTable**: distance-vector routes merged from neighbor
//!    advertisements (see `core-routing`).
//! 4. **KeyAgent**: P-256 identity and per-neighbor session keys.
//! 5. **PacketEngine**: framing, TTL, hop-by-hop re-encryption, flood
//!    fallback, image chunk reassembly.
//! 6. **ClockService**: Berkeley-style averaging of neighbor local times.
//!
//! The [`transport`] module carries opaque request/response envelopes between
//! peers: in-process for tests ([`MemoryTransport`]) or over TCP for deployed
//! nodes ([`TcpTransport`]).

pub mod clock;
pub mod config;
pub mod engine;
pub mod keys;
pub mod neighbors;
pub mod peer;
pub mod position;
pub mod transport;

pub use config::Config;
pub use peer::{NodeState, Peer, PeerInfo, PeerKind};
pub use position::Position;
pub use transport::{
    MemoryTransport, Request, Response, Router, TcpTransport, Transport, TransportError,
};

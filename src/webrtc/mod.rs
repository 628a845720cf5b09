//! Peer-to-peer session negotiation
//!
//! A host answers offers from any number of watchers; a watcher offers to
//! one host. Both sides exchange descriptions and candidates through a
//! signaling relay, then talk directly over the negotiated transport.
//!
//! Architecture:
//! ```text
//!   ChannelResolver ─→ ChannelEndpoints ─→ SignalingConnector
//!                                               │
//!   HostOrchestrator / WatcherSession ←─ SignalingSession (events)
//!          │
//!          ├─→ PeerNegotiator (one task per remote peer)
//!          │       ├─→ CandidateQueue
//!          │       ├─→ PeerTransport (webrtc-rs)
//!          │       └─→ StatsPoller
//!          └─→ LocalMediaStream (shared, stopped once)
//! ```

pub mod candidates;
pub mod config;
pub mod directory;
pub mod host;
pub mod media;
pub mod negotiator;
pub mod peer;
pub mod peer_table;
pub mod session;
pub mod signaling;
pub mod stats;
pub mod watcher;
pub mod ws_signaling;

#[cfg(test)]
pub mod testing;

pub use config::{IceServer, IceServerSet, IceTransportPolicy};
pub use directory::{ChannelEndpoints, ChannelResolver, HttpChannelDirectory, IceServerDirectory};
pub use host::HostOrchestrator;
pub use media::{LocalMediaStream, MediaCapture, MediaConstraints, MediaKind};
pub use negotiator::{NegotiationState, RemoteStream};
pub use peer::{PeerTransport, PeerTransportFactory, RtcTransportFactory, TransportEvent};
pub use session::{Collaborators, PeerSession};
pub use signaling::{
    ConnectionState, IceCandidate, PeerId, SessionDescription, SignalingConnector,
    SignalingEvent, SignalingSession, SignalingTransport,
};
pub use stats::StatsReport;
pub use watcher::WatcherSession;
pub use ws_signaling::WsSignalingConnector;

//! Session event types

use bytes::Bytes;
use serde::Serialize;

use crate::webrtc::negotiator::{NegotiationState, RemoteStream};
use crate::webrtc::signaling::{ConnectionState, PeerId};
use crate::webrtc::stats::StatsReport;

/// Session event enumeration
///
/// Serialized as `{"event": "<name>", "data": {...}}`. The peer id is
/// absent for the watcher's single negotiation.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    // ============================================================================
    // Signaling
    // ============================================================================
    #[serde(rename = "signaling.opened")]
    SignalingOpened,

    #[serde(rename = "signaling.closed")]
    SignalingClosed,

    #[serde(rename = "signaling.failed")]
    SignalingFailed { reason: String },

    // ============================================================================
    // Peer negotiation
    // ============================================================================
    /// Negotiation state machine moved
    #[serde(rename = "peer.state_changed")]
    PeerStateChanged {
        peer_id: Option<PeerId>,
        state: NegotiationState,
    },

    /// Transport reported a connection state
    #[serde(rename = "peer.connection_changed")]
    ConnectionStateChanged {
        peer_id: Option<PeerId>,
        state: ConnectionState,
    },

    /// A negotiation ended on its own error; the session continues
    #[serde(rename = "peer.failed")]
    PeerFailed {
        peer_id: Option<PeerId>,
        error: String,
    },

    /// A remote candidate could not be applied
    #[serde(rename = "peer.candidate_rejected")]
    CandidateRejected {
        peer_id: Option<PeerId>,
        error: String,
    },

    // ============================================================================
    // Media and data
    // ============================================================================
    #[serde(rename = "media.remote_bound")]
    RemoteStreamBound {
        peer_id: Option<PeerId>,
        stream: RemoteStream,
    },

    #[serde(rename = "media.remote_cleared")]
    RemoteStreamCleared { peer_id: Option<PeerId> },

    /// Local capture could not be acquired; the session runs without it
    #[serde(rename = "media.local_unavailable")]
    LocalMediaUnavailable { error: String },

    /// Message received on a data channel
    #[serde(rename = "data.message")]
    RemoteMessage {
        peer_id: Option<PeerId>,
        label: String,
        data: Bytes,
    },

    #[serde(rename = "stats.report")]
    Stats(StatsReport),
}

impl SessionEvent {
    /// Get the event name (for filtering)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SignalingOpened => "signaling.opened",
            Self::SignalingClosed => "signaling.closed",
            Self::SignalingFailed { .. } => "signaling.failed",
            Self::PeerStateChanged { .. } => "peer.state_changed",
            Self::ConnectionStateChanged { .. } => "peer.connection_changed",
            Self::PeerFailed { .. } => "peer.failed",
            Self::CandidateRejected { .. } => "peer.candidate_rejected",
            Self::RemoteStreamBound { .. } => "media.remote_bound",
            Self::RemoteStreamCleared { .. } => "media.remote_cleared",
            Self::LocalMediaUnavailable { .. } => "media.local_unavailable",
            Self::RemoteMessage { .. } => "data.message",
            Self::Stats(_) => "stats.report",
        }
    }

    /// Check if event matches a topic pattern
    ///
    /// Supports `*` for everything and `prefix.*` for a group.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();
        if let Some(prefix) = topic.strip_suffix(".*") {
            return event_name
                .strip_prefix(prefix)
                .map(|rest| rest.starts_with('.'))
                .unwrap_or(false);
        }

        event_name == topic
    }

    /// Peer the event concerns, if any
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            Self::PeerStateChanged { peer_id, .. }
            | Self::ConnectionStateChanged { peer_id, .. }
            | Self::PeerFailed { peer_id, .. }
            | Self::CandidateRejected { peer_id, .. }
            | Self::RemoteStreamBound { peer_id, .. }
            | Self::RemoteStreamCleared { peer_id }
            | Self::RemoteMessage { peer_id, .. } => peer_id.as_ref(),
            Self::Stats(report) => report.peer_id.as_ref(),
            _ => None,
        }
    }
}

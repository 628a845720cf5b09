//! Signaling types and the signaling session
//!
//! The session wraps one relay transport for the lifetime of a host or
//! watcher session: it resolves the channel, opens the transport, hands out
//! the typed event stream and sends descriptions and candidates to remote
//! peers.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::directory::{ChannelEndpoints, ChannelResolver};
use crate::config::{CandidateStrategy, CredentialCell, Role, SessionConfig};
use crate::error::{AppError, Result};

/// Opaque identifier of a remote peer, unique per watcher in the host role
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Session description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// The transport will not recover from this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Event received from the signaling relay
///
/// Events arrive in relay order, with no ordering guarantee across
/// distinct peer ids.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Opened,
    Closed,
    Failed(String),
    OfferReceived {
        offer: SessionDescription,
        peer_id: Option<PeerId>,
    },
    AnswerReceived {
        answer: SessionDescription,
        peer_id: Option<PeerId>,
    },
    CandidateReceived {
        candidate: IceCandidate,
        peer_id: Option<PeerId>,
    },
}

/// Payload sent to the relay
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl OutboundSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundSignal::Offer(_) => "offer",
            OutboundSignal::Answer(_) => "answer",
            OutboundSignal::Candidate(_) => "candidate",
        }
    }
}

/// Outbound signal plus its recipient
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub signal: OutboundSignal,
    /// Remote peer id, absent in the watcher role
    pub recipient: Option<PeerId>,
}

/// Connected relay transport
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open the transport and start delivering events
    ///
    /// The transport emits `Opened` first, then relay messages in arrival
    /// order, and `Closed` or `Failed` once when the connection ends.
    async fn open(&self, events: mpsc::UnboundedSender<SignalingEvent>) -> Result<()>;

    /// Send one message, failing if the transport is not open
    async fn send(&self, message: OutboundMessage) -> Result<()>;

    /// Close the transport. Must be idempotent.
    async fn close(&self);
}

/// Builds relay transports for resolved channels
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(
        &self,
        endpoints: &ChannelEndpoints,
        role: Role,
        client_id: Option<&str>,
        credentials: &CredentialCell,
    ) -> Result<Arc<dyn SignalingTransport>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connected,
    Open,
    Closed,
}

/// Signaling session for one host or watcher session
pub struct SignalingSession {
    role: Role,
    strategy: CandidateStrategy,
    client_id: Option<String>,
    endpoints: ChannelEndpoints,
    transport: Arc<dyn SignalingTransport>,
    state: Mutex<LinkState>,
    closed: AtomicBool,
}

impl SignalingSession {
    /// Resolve the channel and connect a transport to it
    ///
    /// Nothing is opened yet; call [`open`](Self::open) to start receiving
    /// events.
    pub async fn connect(
        config: &SessionConfig,
        role: Role,
        resolver: &dyn ChannelResolver,
        connector: &dyn SignalingConnector,
        credentials: &CredentialCell,
    ) -> Result<Self> {
        if let Some(creds) = credentials.get() {
            creds.ensure_usable()?;
        }

        let endpoints = resolver
            .resolve(&config.channel_name, role, credentials)
            .await?;
        debug!(
            "Channel {} resolved: signaling={} control={}",
            config.channel_name, endpoints.signaling_endpoint, endpoints.control_endpoint
        );

        let client_id = config.client_id_for(role);
        let transport = connector
            .connect(&endpoints, role, client_id.as_deref(), credentials)
            .await?;

        Ok(Self {
            role,
            strategy: config.candidate_strategy,
            client_id,
            endpoints,
            transport,
            state: Mutex::new(LinkState::Connected),
            closed: AtomicBool::new(false),
        })
    }

    pub fn endpoints(&self) -> &ChannelEndpoints {
        &self.endpoints
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn candidate_strategy(&self) -> CandidateStrategy {
        self.strategy
    }

    pub fn is_open(&self) -> bool {
        *self.state.lock() == LinkState::Open
    }

    /// Open the transport and return the event stream
    ///
    /// If [`close`](Self::close) runs while opening, the transport is closed
    /// again and `Stopped` is returned.
    pub async fn open(&self) -> Result<mpsc::UnboundedReceiver<SignalingEvent>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::Stopped);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.transport.open(tx).await?;

        let stopped = {
            let mut state = self.state.lock();
            if self.closed.load(Ordering::SeqCst) {
                *state = LinkState::Closed;
                true
            } else {
                *state = LinkState::Open;
                false
            }
        };
        if stopped {
            self.transport.close().await;
            return Err(AppError::Stopped);
        }

        info!("Signaling open as {} ({})", self.role, self.strategy);
        Ok(rx)
    }

    /// Close the transport. Idempotent, safe before `open` completes.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = LinkState::Closed;
        self.transport.close().await;
        info!("Signaling closed");
    }

    pub async fn send_offer(&self, offer: &SessionDescription, target: Option<&PeerId>) -> bool {
        self.send(OutboundSignal::Offer(offer.clone()), target).await
    }

    pub async fn send_answer(&self, answer: &SessionDescription, target: Option<&PeerId>) -> bool {
        self.send(OutboundSignal::Answer(answer.clone()), target)
            .await
    }

    /// Send one local candidate
    ///
    /// Refused with `CandidateStrategyViolation` on a batched session.
    pub async fn send_candidate(
        &self,
        candidate: &IceCandidate,
        target: Option<&PeerId>,
    ) -> Result<bool> {
        if self.strategy == CandidateStrategy::Batched {
            return Err(AppError::CandidateStrategyViolation);
        }
        Ok(self
            .send(OutboundSignal::Candidate(candidate.clone()), target)
            .await)
    }

    /// Send a signal; failures are logged and reported as `false`
    async fn send(&self, signal: OutboundSignal, target: Option<&PeerId>) -> bool {
        if !self.is_open() {
            warn!("Signaling not open, dropping {}", signal.kind());
            return false;
        }

        let recipient = match self.role {
            Role::Host => match target {
                Some(peer) => Some(peer.clone()),
                None => {
                    warn!("Host cannot send {} without a recipient", signal.kind());
                    return false;
                }
            },
            Role::Watcher => None,
        };

        let kind = signal.kind();
        match self.transport.send(OutboundMessage { signal, recipient }).await {
            Ok(()) => {
                debug!(
                    "Sent {} to {}",
                    kind,
                    target.map(|p| p.as_str()).unwrap_or("host")
                );
                true
            }
            Err(e) => {
                warn!("Failed to send {}: {}", kind, e);
                false
            }
        }
    }
}

//! Common session lifecycle shared by the host and watcher roles

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::config::IceServerSet;
use super::directory::{ChannelResolver, HttpChannelDirectory, IceServerDirectory};
use super::media::{LocalMediaStream, MediaCapture, MediaConstraints, SampleTrackCapture};
use super::peer::{PeerTransportFactory, RtcTransportFactory};
use super::signaling::{SignalingConnector, SignalingSession};
use super::ws_signaling::WsSignalingConnector;
use crate::config::{CredentialCell, RelayPolicy, Role, SessionConfig};
use crate::error::Result;
use crate::events::{EventBus, SessionEvent};

/// External collaborators a session is built from
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn ChannelResolver>,
    pub ice_directory: Arc<dyn IceServerDirectory>,
    pub signaling: Arc<dyn SignalingConnector>,
    pub capture: Arc<dyn MediaCapture>,
    pub transports: Arc<dyn PeerTransportFactory>,
}

impl Collaborators {
    /// Real adapters: HTTP directory, WebSocket relay, webrtc-rs transports
    pub fn connected(directory_url: &str) -> Result<Self> {
        let directory = Arc::new(HttpChannelDirectory::new(directory_url));
        Ok(Self {
            resolver: directory.clone(),
            ice_directory: directory,
            signaling: Arc::new(WsSignalingConnector::new()),
            capture: Arc::new(SampleTrackCapture),
            transports: Arc::new(RtcTransportFactory::new()?),
        })
    }
}

/// Lifecycle shared by host and watcher sessions
#[async_trait]
pub trait PeerSession: Send + Sync {
    fn role(&self) -> Role;

    /// Resolve the channel, open signaling and begin negotiating
    async fn start(&self, config: SessionConfig) -> Result<()>;

    /// Release everything the session owns. Idempotent.
    async fn stop(&self);

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Send a message to every connected remote, returning how many took it
    async fn send(&self, data: Bytes) -> usize;
}

/// Build the ICE server set for a session
///
/// Relay servers are only requested when the policy can use them.
pub(crate) async fn resolve_ice_servers(
    config: &SessionConfig,
    signaling: &SignalingSession,
    directory: &dyn IceServerDirectory,
    credentials: &CredentialCell,
) -> Result<IceServerSet> {
    let relay_servers = match config.relay_policy {
        RelayPolicy::Disabled => Vec::new(),
        RelayPolicy::Auto | RelayPolicy::RelayOnly => {
            directory
                .fetch_ice_servers(signaling.endpoints(), signaling.client_id(), credentials)
                .await?
        }
    };

    let set = IceServerSet::build(config.relay_policy, &config.region, relay_servers);
    info!(
        "ICE servers: {} ({:?} policy)",
        set.servers.len(),
        set.transport_policy
    );
    Ok(set)
}

/// Acquire local capture if any media is wanted
///
/// A refused or missing device is not fatal: the session continues
/// without local media.
pub(crate) async fn acquire_media(
    config: &SessionConfig,
    capture: &dyn MediaCapture,
    events: &EventBus,
) -> Option<Arc<LocalMediaStream>> {
    let constraints = MediaConstraints::from_config(config)?;
    match capture.acquire(&constraints).await {
        Ok(stream) => {
            info!("Local media acquired ({} tracks)", stream.tracks().len());
            Some(stream)
        }
        Err(e) => {
            warn!("Continuing without local media: {}", e);
            events.publish(SessionEvent::LocalMediaUnavailable {
                error: e.to_string(),
            });
            None
        }
    }
}

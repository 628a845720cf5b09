//! ICE server configuration

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

use crate::config::RelayPolicy;

/// Reflexive (STUN) server for a region
pub fn reflexive_server_url(region: &str) -> String {
    format!("stun:stun.kinesisvideo.{}.amazonaws.com:443", region)
}

/// One ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (e.g., ["turn:turn.example.com:3478?transport=udp", "turns:turn.example.com:443?transport=tcp"])
    pub urls: Vec<String>,
    /// Username for relay authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential for relay authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Server without credentials (STUN)
    pub fn reflexive(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Relay server with credentials (TURN)
    pub fn relay(urls: Vec<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls,
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

/// Which candidate types the transport may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// Ordered ICE servers plus transport policy for one session
///
/// Resolved once when a session starts and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServerSet {
    pub servers: Vec<IceServer>,
    pub transport_policy: IceTransportPolicy,
}

impl IceServerSet {
    /// Empty set, host candidates only
    pub fn empty() -> Self {
        Self::default()
    }

    /// Derive the set from the relay policy
    ///
    /// - `Disabled`: no servers
    /// - `Auto`: the regional reflexive server first, then the relay servers
    /// - `RelayOnly`: relay servers only, relay transport policy
    pub fn build(policy: RelayPolicy, region: &str, relay_servers: Vec<IceServer>) -> Self {
        match policy {
            RelayPolicy::Disabled => Self::empty(),
            RelayPolicy::Auto => {
                let mut servers = Vec::with_capacity(relay_servers.len() + 1);
                servers.push(IceServer::reflexive(reflexive_server_url(region)));
                servers.extend(relay_servers);
                Self {
                    servers,
                    transport_policy: IceTransportPolicy::All,
                }
            }
            RelayPolicy::RelayOnly => Self {
                servers: relay_servers,
                transport_policy: IceTransportPolicy::Relay,
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn is_relay_only(&self) -> bool {
        self.transport_policy == IceTransportPolicy::Relay
    }

    /// Convert to a webrtc-rs configuration
    pub fn to_rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let ice_transport_policy = match self.transport_policy {
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        };

        RTCConfiguration {
            ice_servers,
            ice_transport_policy,
            ..Default::default()
        }
    }
}

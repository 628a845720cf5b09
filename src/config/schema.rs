use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Default signaling channel name
pub const DEFAULT_CHANNEL_NAME: &str = "RendezVousChannel";

/// Default region
pub const DEFAULT_REGION: &str = "us-west-2";

/// Default statistics polling period
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 1000;

/// Session configuration
///
/// Built once per session and passed explicitly into the orchestrator.
/// Only the credentials are refreshed while a session runs (see
/// [`CredentialCell`](super::CredentialCell)).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Client identity presented to the signaling relay
    pub client_id: Option<String>,
    /// Signaling channel name
    pub channel_name: String,
    /// Cloud region of the channel
    pub region: String,
    /// Credentials for the directory and signaling relay
    pub credentials: Option<Credentials>,
    /// Local media to capture and send
    pub media: MediaWanted,
    /// Capture resolution profile
    pub resolution: ResolutionProfile,
    /// Candidate exchange strategy (fixed for the session)
    pub candidate_strategy: CandidateStrategy,
    /// NAT traversal policy
    pub relay_policy: RelayPolicy,
    /// Open a data channel alongside the media
    pub open_data_channel: bool,
    /// Statistics polling period in milliseconds (0 disables polling)
    pub stats_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            region: DEFAULT_REGION.to_string(),
            credentials: None,
            media: MediaWanted::default(),
            resolution: ResolutionProfile::default(),
            candidate_strategy: CandidateStrategy::default(),
            relay_policy: RelayPolicy::default(),
            open_data_channel: false,
            stats_interval_ms: DEFAULT_STATS_INTERVAL_MS,
        }
    }
}

impl SessionConfig {
    /// Validate the configuration before a session starts
    pub fn validate(&self) -> Result<()> {
        if self.channel_name.trim().is_empty() {
            return Err(AppError::Config("channel name must not be empty".to_string()));
        }
        if self.region.trim().is_empty() {
            return Err(AppError::Config("region must not be empty".to_string()));
        }
        if let Some(ref id) = self.client_id {
            if id.trim().is_empty() {
                return Err(AppError::Config("client id must not be blank".to_string()));
            }
        }
        Ok(())
    }

    /// Client id to present for the given role
    ///
    /// Watchers must identify themselves to the relay, so one is generated
    /// when none is configured. Hosts do not use a client id.
    pub fn client_id_for(&self, role: Role) -> Option<String> {
        match role {
            Role::Host => None,
            Role::Watcher => Some(self.client_id.clone().unwrap_or_else(random_client_id)),
        }
    }

    /// Statistics polling period, if enabled
    pub fn stats_interval(&self) -> Option<std::time::Duration> {
        if self.stats_interval_ms == 0 {
            None
        } else {
            Some(std::time::Duration::from_millis(self.stats_interval_ms))
        }
    }
}

/// Generate a random client id
pub fn random_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..10].to_uppercase()
}

/// Session role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Coordinating endpoint, answers offers from N watchers
    Host,
    /// Joining endpoint, offers to exactly one host
    Watcher,
}

impl Role {
    /// Role name as understood by the signaling directory
    pub fn channel_role(&self) -> &'static str {
        match self {
            Role::Host => "MASTER",
            Role::Watcher => "VIEWER",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Watcher => write!(f, "watcher"),
        }
    }
}

/// Credentials for the directory and relay
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Bearer token
    pub token: String,
    /// Expiry, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Check whether the credentials are past their expiry
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|t| t <= Utc::now()).unwrap_or(false)
    }

    /// Fail with a credential error if the token is unusable
    pub fn ensure_usable(&self) -> Result<()> {
        if self.token.is_empty() {
            return Err(AppError::Credential("empty token".to_string()));
        }
        if self.is_expired() {
            return Err(AppError::Credential("credentials expired".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Which local media to capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaWanted {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaWanted {
    fn default() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }
}

impl MediaWanted {
    pub fn none() -> Self {
        Self {
            video: false,
            audio: false,
        }
    }

    pub fn any(&self) -> bool {
        self.video || self.audio
    }
}

/// Capture resolution profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionProfile {
    /// 1280x720
    #[default]
    Wide,
    /// 640x480
    Standard,
}

impl ResolutionProfile {
    /// Ideal capture size (width, height)
    pub fn ideal_size(&self) -> (u32, u32) {
        match self {
            ResolutionProfile::Wide => (1280, 720),
            ResolutionProfile::Standard => (640, 480),
        }
    }
}

/// Candidate exchange strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStrategy {
    /// Send each candidate as it is gathered
    #[default]
    Trickle,
    /// Hold candidates; send the description once gathering completes
    Batched,
}

impl std::fmt::Display for CandidateStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateStrategy::Trickle => write!(f, "trickle"),
            CandidateStrategy::Batched => write!(f, "batched"),
        }
    }
}

/// NAT traversal policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RelayPolicy {
    /// Reflexive and relay servers
    #[default]
    Auto,
    /// Relay servers only, relay-only transport
    RelayOnly,
    /// No ICE servers, host candidates only
    Disabled,
}

impl RelayPolicy {
    /// Build the policy from the two legacy toggles
    ///
    /// Only one of them may be enabled.
    pub fn from_flags(nat_traversal_disabled: bool, force_turn: bool) -> Result<Self> {
        match (nat_traversal_disabled, force_turn) {
            (false, false) => Ok(RelayPolicy::Auto),
            (false, true) => Ok(RelayPolicy::RelayOnly),
            (true, false) => Ok(RelayPolicy::Disabled),
            (true, true) => Err(AppError::Config(
                "NAT traversal cannot be both disabled and relay-only".to_string(),
            )),
        }
    }
}

impl std::str::FromStr for RelayPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(RelayPolicy::Auto),
            "relay-only" | "relay" | "turn" => Ok(RelayPolicy::RelayOnly),
            "disabled" | "none" => Ok(RelayPolicy::Disabled),
            other => Err(AppError::Config(format!("unknown relay policy: {}", other))),
        }
    }
}

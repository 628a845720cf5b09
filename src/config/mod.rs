//! Session configuration
//!
//! A `SessionConfig` is created per session, optionally loaded from a JSON
//! file, and threaded explicitly through every component.

mod schema;
pub mod store;

pub use schema::{
    random_client_id, CandidateStrategy, Credentials, MediaWanted, RelayPolicy,
    ResolutionProfile, Role, SessionConfig, DEFAULT_CHANNEL_NAME, DEFAULT_REGION,
    DEFAULT_STATS_INTERVAL_MS,
};
pub use store::{load_config, save_config, CredentialCell};

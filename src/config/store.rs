use arc_swap::ArcSwapOption;
use std::path::Path;
use std::sync::Arc;

use super::{Credentials, SessionConfig};
use crate::error::{AppError, Result};

/// Load a session configuration from a JSON file
///
/// Missing fields fall back to their defaults.
pub async fn load_config(path: &Path) -> Result<SessionConfig> {
    let json = tokio::fs::read_to_string(path).await?;
    let config: SessionConfig = serde_json::from_str(&json)
        .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

/// Write a session configuration as pretty JSON
pub async fn save_config(path: &Path, config: &SessionConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

/// Refreshable credentials shared by a running session
///
/// Uses `ArcSwapOption` so the directory and signaling adapters can read the
/// current credentials without locking while an external collaborator
/// injects refreshed ones. Adapters read on every request, so a refresh
/// takes effect on the next call.
#[derive(Clone)]
pub struct CredentialCell {
    current: Arc<ArcSwapOption<Credentials>>,
}

impl CredentialCell {
    pub fn new(initial: Option<Credentials>) -> Self {
        Self {
            current: Arc::new(ArcSwapOption::from(initial.map(Arc::new))),
        }
    }

    /// Current credentials (lock-free)
    pub fn get(&self) -> Option<Arc<Credentials>> {
        self.current.load_full()
    }

    /// Replace the credentials
    pub fn set(&self, credentials: Credentials) {
        self.current.store(Some(Arc::new(credentials)));
    }
}

impl Default for CredentialCell {
    fn default() -> Self {
        Self::new(None)
    }
}

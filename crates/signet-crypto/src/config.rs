use std::time::Duration;

use serde::Deserialize;

use crate::error::StoreError;

/// Store tuning, loaded from a TOML table.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Upper bound on a single job in a per-address session queue.
    /// A job that runs longer fails and the queue moves on.
    #[serde(default = "default_session_job_timeout_ms")]
    pub session_job_timeout_ms: u64,

    /// How long a freshly changed identity key stays untrusted for sending
    /// unless it has non-blocking approval.
    #[serde(default = "default_approval_window_ms")]
    pub approval_window_ms: u64,

    /// Archived states kept when a legacy record is migrated. libsignal
    /// applies its own cap of 40 when it archives.
    #[serde(default = "default_max_archived_states")]
    pub max_archived_states: usize,
}

fn default_session_job_timeout_ms() -> u64 {
    2 * 60 * 1000
}

fn default_approval_window_ms() -> u64 {
    5 * 1000
}

fn default_max_archived_states() -> usize {
    40
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            session_job_timeout_ms: default_session_job_timeout_ms(),
            approval_window_ms: default_approval_window_ms(),
            max_archived_states: default_max_archived_states(),
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, StoreError> {
        Ok(toml::from_str(source)?)
    }

    pub fn session_job_timeout(&self) -> Duration {
        Duration::from_millis(self.session_job_timeout_ms)
    }
}

// Proximity protocol configuration
//
// Every device in a deployment must agree on `service_id` and the organization
// table, otherwise beacons are discarded as foreign.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Deployment-wide beacon service identifier
pub const DEFAULT_SERVICE_ID: Uuid = Uuid::from_u128(0x6f2a_91c4_5e3b_4d8a_b7c1_0e94_2f5d_a318);

/// Upper bound on a session's lifetime (24 hours)
pub const MAX_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProximityConfig {
    /// 128-bit service identifier shared by every beacon in the deployment
    pub service_id: Uuid,

    /// Organization codes that may appear in the beacon major field
    pub known_organizations: Vec<u16>,

    /// Submit attendance as soon as a session is resolved
    pub auto_submit: bool,

    /// Local suppression window per token in seconds
    pub suppression_window_secs: u64,

    /// Timeout for datastore round trips in seconds
    pub request_timeout_secs: u64,

    /// How long a fetched active-session list is reused, in seconds
    pub session_list_ttl_secs: u64,

    /// Beacons held while organization context is loading
    pub org_context_cache_capacity: usize,

    /// Pending detections between the radio callback and the resolver
    pub work_queue_depth: usize,

    /// Longest session a broadcaster may request
    pub max_session_ttl_secs: u64,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            service_id: DEFAULT_SERVICE_ID,
            known_organizations: vec![1, 2],
            auto_submit: true,
            suppression_window_secs: 30,
            request_timeout_secs: 10,
            session_list_ttl_secs: 5,
            org_context_cache_capacity: 64,
            work_queue_depth: 256,
            max_session_ttl_secs: MAX_SESSION_TTL_SECS,
        }
    }
}

impl ProximityConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_id.is_nil() {
            return Err(ConfigError::Invalid("service_id cannot be nil".to_string()));
        }
        if self.known_organizations.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one organization code must be known".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.org_context_cache_capacity == 0 || self.work_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "Cache and queue capacities must be > 0".to_string(),
            ));
        }
        if self.max_session_ttl_secs == 0 || self.max_session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(ConfigError::Invalid(format!(
                "max_session_ttl_secs must be within 1..={}",
                MAX_SESSION_TTL_SECS
            )));
        }
        Ok(())
    }

    pub fn suppression_window(&self) -> Duration {
        Duration::from_secs(self.suppression_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_list_ttl(&self) -> Duration {
        Duration::from_secs(self.session_list_ttl_secs)
    }
}

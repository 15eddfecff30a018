// Attendance submission with local suppression
//
// Beacons repeat many times a second and several scanner paths can resolve the
// same session, so every submission for a (member, token) pair within the
// suppression window after the first is answered locally. Terminal rejections
// are remembered per pair; only network failures are worth retrying.

use crate::config::ProximityConfig;
use crate::identity::IdentityProvider;
use crate::store::{Datastore, DatastoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new attendance record was written
    Recorded { attendance_id: String },
    /// The datastore already had a record for this member and session
    AlreadyRecorded,
    /// A submission for this member and token is still in flight; nothing sent
    Suppressed,
}

impl SubmitOutcome {
    /// True for outcomes that mean "the member is marked present"
    pub fn is_present(&self) -> bool {
        matches!(
            self,
            SubmitOutcome::Recorded { .. } | SubmitOutcome::AlreadyRecorded
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("Session has expired")]
    SessionExpired,
    #[error("Invalid session token")]
    InvalidToken,
    #[error("Not a member of the session's organization")]
    OrganizationMismatch,
    #[error("Not signed in")]
    Unauthenticated,
    #[error("Network error: {0}")]
    Network(String),
}

impl SubmitError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::Network(_))
    }
}

impl From<DatastoreError> for SubmitError {
    fn from(err: DatastoreError) -> Self {
        match err {
            DatastoreError::SessionExpired => SubmitError::SessionExpired,
            DatastoreError::InvalidToken
            | DatastoreError::NotFound
            | DatastoreError::InvalidRequest(_)
            | DatastoreError::HashCollision => SubmitError::InvalidToken,
            DatastoreError::OrganizationMismatch => SubmitError::OrganizationMismatch,
            DatastoreError::Unauthorized => SubmitError::Unauthenticated,
            DatastoreError::Network(msg) | DatastoreError::Storage(msg) => {
                SubmitError::Network(msg)
            }
            // Callers treat this as success before converting
            DatastoreError::AlreadyRecorded => {
                SubmitError::Network("unexpected already-recorded".to_string())
            }
        }
    }
}

/// Member id and normalized token
type ClaimKey = (String, String);

#[derive(Debug, Clone, Copy)]
struct Claim {
    at: Instant,
    /// The claiming submission ended with the member marked present
    present: bool,
}

pub struct AttendanceSubmitter {
    datastore: Arc<dyn Datastore>,
    identity: Arc<dyn IdentityProvider>,
    suppression_window: Duration,
    request_timeout: Duration,
    recent: Mutex<HashMap<ClaimKey, Claim>>,
    terminal: Mutex<HashMap<ClaimKey, SubmitError>>,
}

impl AttendanceSubmitter {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        identity: Arc<dyn IdentityProvider>,
        config: &ProximityConfig,
    ) -> Self {
        Self {
            datastore,
            identity,
            suppression_window: config.suppression_window(),
            request_timeout: config.request_timeout(),
            recent: Mutex::new(HashMap::new()),
            terminal: Mutex::new(HashMap::new()),
        }
    }

    /// Record the current caller's attendance for `token`
    ///
    /// Within the suppression window a repeat answers `AlreadyRecorded` if the
    /// first submission marked the member present, `Suppressed` while it is
    /// still in flight.
    pub async fn submit(&self, token: &str) -> Result<SubmitOutcome, SubmitError> {
        let caller = self.identity.caller().ok_or(SubmitError::Unauthenticated)?;
        let key = claim_key(&caller.user_id, token);

        if let Some(err) = self.terminal.lock().get(&key).cloned() {
            debug!("Submission for known-rejected token short-circuited: {}", err);
            return Err(err);
        }

        if let Some(earlier) = self.claim(&key) {
            debug!("Submission suppressed (within {:?})", self.suppression_window);
            return Ok(if earlier.present {
                SubmitOutcome::AlreadyRecorded
            } else {
                SubmitOutcome::Suppressed
            });
        }
        let token = key.1.clone();

        let result = tokio::time::timeout(
            self.request_timeout,
            self.datastore.record_attendance(&caller, &token),
        )
        .await;

        let err = match result {
            Ok(Ok(receipt)) => {
                info!("Attendance recorded ({})", receipt.attendance_id);
                self.mark_present(&key);
                return Ok(SubmitOutcome::Recorded {
                    attendance_id: receipt.attendance_id,
                });
            }
            Ok(Err(DatastoreError::AlreadyRecorded)) => {
                debug!("Attendance was already recorded");
                self.mark_present(&key);
                return Ok(SubmitOutcome::AlreadyRecorded);
            }
            Ok(Err(e)) => SubmitError::from(e),
            Err(_) => SubmitError::Network(format!(
                "record_attendance timed out after {:?}",
                self.request_timeout
            )),
        };

        if err.is_retryable() {
            warn!("Attendance submission failed, will retry on next sighting: {}", err);
            self.release(&key);
        } else {
            warn!("Attendance submission rejected: {}", err);
            if err != SubmitError::Unauthenticated {
                self.terminal.lock().insert(key, err.clone());
            }
        }
        Err(err)
    }

    /// True if a submission by the current caller for `token` would be
    /// answered locally
    pub fn is_suppressed(&self, token: &str) -> bool {
        let Some(caller) = self.identity.caller() else {
            return false;
        };
        let key = claim_key(&caller.user_id, token);
        self.recent
            .lock()
            .get(&key)
            .map(|claim| claim.at.elapsed() < self.suppression_window)
            .unwrap_or(false)
    }

    /// Take the window for `key`, or return the live claim holding it
    fn claim(&self, key: &ClaimKey) -> Option<Claim> {
        let window = self.suppression_window;
        let mut recent = self.recent.lock();
        recent.retain(|_, claim| claim.at.elapsed() < window);
        if let Some(earlier) = recent.get(key) {
            return Some(*earlier);
        }
        recent.insert(
            key.clone(),
            Claim {
                at: Instant::now(),
                present: false,
            },
        );
        None
    }

    fn mark_present(&self, key: &ClaimKey) {
        if let Some(claim) = self.recent.lock().get_mut(key) {
            claim.present = true;
        }
    }

    fn release(&self, key: &ClaimKey) {
        self.recent.lock().remove(key);
    }
}

fn claim_key(member_id: &str, token: &str) -> ClaimKey {
    (member_id.to_string(), token.trim().to_ascii_uppercase())
}

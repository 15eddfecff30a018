// Datastore contract: the five server-authoritative session operations
//
// Devices reach the real datastore over whatever RPC transport the host app
// uses. `LocalDatastore` implements the same server-side rules over a local
// key/value backend for tests, demos and single-host deployments.

pub mod backend;
pub mod local;

use crate::identity::Caller;
use crate::model::{AttendanceReceipt, CreateSessionRequest, CreatedSession, SessionInfo};
use async_trait::async_trait;
use thiserror::Error;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StorageError};
pub use local::LocalDatastore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatastoreError {
    #[error("Invalid session token")]
    InvalidToken,
    #[error("Session has expired")]
    SessionExpired,
    #[error("Caller is not a member of the session's organization")]
    OrganizationMismatch,
    #[error("Attendance already recorded")]
    AlreadyRecorded,
    #[error("Caller is not authorized")]
    Unauthorized,
    #[error("Session not found")]
    NotFound,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Token hash collides with an active session")]
    HashCollision,
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Network error: {0}")]
    Network(String),
}

impl From<StorageError> for DatastoreError {
    fn from(err: StorageError) -> Self {
        DatastoreError::Storage(err.to_string())
    }
}

/// Server-side session and attendance operations
///
/// Every call carries the authenticated caller; implementations re-validate
/// tokens, membership and expiry themselves rather than trusting the client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Open a session. The server generates the token.
    async fn create_session(
        &self,
        caller: &Caller,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, DatastoreError>;

    async fn resolve_session(
        &self,
        caller: &Caller,
        token: &str,
    ) -> Result<SessionInfo, DatastoreError>;

    /// Non-expired, non-terminated sessions of one organization
    async fn list_active_sessions(
        &self,
        caller: &Caller,
        organization_id: &str,
    ) -> Result<Vec<SessionInfo>, DatastoreError>;

    /// Record the caller's attendance. A second call for the same session
    /// returns `AlreadyRecorded` and writes nothing.
    async fn record_attendance(
        &self,
        caller: &Caller,
        token: &str,
    ) -> Result<AttendanceReceipt, DatastoreError>;

    /// End a session before its natural expiry
    async fn terminate_session(&self, caller: &Caller, token: &str) -> Result<(), DatastoreError>;
}

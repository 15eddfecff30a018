//! Local datastore: server-side session rules over a key/value backend
//!
//! Sessions live under `session_<TOKEN>` and attendance under
//! `attendance_<TOKEN>_<MEMBER>`, both bincode-encoded. Nothing is ever
//! deleted; termination only flips a flag.

use super::backend::{StorageBackend, StorageError};
use super::{Datastore, DatastoreError};
use crate::clock::{Clock, SystemClock};
use crate::config::MAX_SESSION_TTL_SECS;
use crate::identity::Caller;
use crate::model::{
    AttendanceMethod, AttendanceReceipt, AttendanceRecord, CreateSessionRequest, CreatedSession,
    SessionInfo,
};
use crate::token::{generate_token, Token, TokenError, MAX_GENERATION_ATTEMPTS};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SESSION_PREFIX: &str = "session_";
const ATTENDANCE_PREFIX: &str = "attendance_";

type TokenSource = Box<dyn Fn() -> Result<Token, TokenError> + Send + Sync>;

/// Stored form of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    info: SessionInfo,
    created_at: u64,
    terminated_at: Option<u64>,
}

impl SessionRecord {
    fn is_live_at(&self, now: u64) -> bool {
        self.terminated_at.is_none() && self.info.is_active_at(now)
    }

    /// Not terminated and not yet past its end (includes sessions that
    /// have not started)
    fn is_pending_or_live_at(&self, now: u64) -> bool {
        self.terminated_at.is_none() && now < self.info.ends_at
    }
}

pub struct LocalDatastore<B: StorageBackend> {
    backend: B,
    clock: Arc<dyn Clock>,
    max_ttl_secs: u64,
    token_source: TokenSource,
    write_lock: Mutex<()>,
}

impl<B: StorageBackend> LocalDatastore<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            clock: Arc::new(SystemClock),
            max_ttl_secs: MAX_SESSION_TTL_SECS,
            token_source: Box::new(generate_token),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_ttl(mut self, secs: u64) -> Self {
        self.max_ttl_secs = secs.min(MAX_SESSION_TTL_SECS);
        self
    }

    /// Replace the token generator
    pub fn with_token_source<F>(mut self, source: F) -> Self
    where
        F: Fn() -> Result<Token, TokenError> + Send + Sync + 'static,
    {
        self.token_source = Box::new(source);
        self
    }

    /// All attendance recorded for a session, oldest first
    pub fn attendance_for_session(
        &self,
        token: &str,
    ) -> Result<Vec<AttendanceRecord>, DatastoreError> {
        let prefix = format!("{}{}_", ATTENDANCE_PREFIX, token.trim().to_ascii_uppercase());
        let mut records: Vec<AttendanceRecord> = self
            .backend
            .scan_prefix(prefix.as_bytes())?
            .into_iter()
            .map(|(key, value)| decode(&key, &value))
            .collect::<Result<Vec<AttendanceRecord>, StorageError>>()?;
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    /// Every session ever created for an organization, newest first
    pub fn sessions_for_organization(
        &self,
        organization_id: &str,
    ) -> Result<Vec<SessionInfo>, DatastoreError> {
        let mut sessions: Vec<SessionInfo> = self
            .all_sessions()?
            .into_iter()
            .filter(|r| r.info.organization_id == organization_id)
            .map(|r| r.info)
            .collect();
        sessions.sort_by(|a, b| b.starts_at.cmp(&a.starts_at));
        Ok(sessions)
    }

    fn all_sessions(&self) -> Result<Vec<SessionRecord>, DatastoreError> {
        self.backend
            .scan_prefix(SESSION_PREFIX.as_bytes())?
            .into_iter()
            .map(|(key, value)| decode(&key, &value).map_err(DatastoreError::from))
            .collect()
    }

    fn load_session(&self, token: &str) -> Result<Option<SessionRecord>, DatastoreError> {
        let key = session_key(token);
        match self.backend.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(key.as_bytes(), &bytes)?)),
            None => Ok(None),
        }
    }

    fn store_session(&self, record: &SessionRecord) -> Result<(), DatastoreError> {
        let key = session_key(&record.info.token);
        let bytes = encode(&record)?;
        self.backend.put(key.as_bytes(), &bytes)?;
        self.backend.flush()?;
        Ok(())
    }

    /// Draw tokens until one is unused and does not share a hash with any
    /// other live session of the same organization.
    fn allocate_token(&self, organization_id: &str, now: u64) -> Result<Token, DatastoreError> {
        let live: Vec<SessionRecord> = self
            .all_sessions()?
            .into_iter()
            .filter(|r| r.info.organization_id == organization_id && r.is_pending_or_live_at(now))
            .collect();

        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let token = (self.token_source)().map_err(|e| {
                warn!("Server-side token generation failed: {}", e);
                DatastoreError::InvalidRequest(e.to_string())
            })?;

            if self.load_session(token.as_str())?.is_some() {
                debug!("Token reuse on attempt {}, regenerating", attempt);
                continue;
            }

            let hash = token.hash();
            if live.iter().any(|r| crate::token::hash_token(&r.info.token) == hash) {
                debug!(
                    "Token hash {} collides with a live session (attempt {}), regenerating",
                    hash, attempt
                );
                continue;
            }

            return Ok(token);
        }

        warn!(
            "Could not allocate a collision-free token for {} after {} attempts",
            organization_id, MAX_GENERATION_ATTEMPTS
        );
        Err(DatastoreError::HashCollision)
    }
}

#[async_trait]
impl<B: StorageBackend> Datastore for LocalDatastore<B> {
    async fn create_session(
        &self,
        caller: &Caller,
        request: CreateSessionRequest,
    ) -> Result<CreatedSession, DatastoreError> {
        authenticate(caller)?;
        let membership = caller
            .membership(&request.organization_id)
            .ok_or(DatastoreError::OrganizationMismatch)?
            .clone();

        if request.title.trim().is_empty() {
            return Err(DatastoreError::InvalidRequest("title cannot be empty".to_string()));
        }
        if request.ttl_seconds == 0 || request.ttl_seconds > self.max_ttl_secs {
            return Err(DatastoreError::InvalidRequest(format!(
                "ttl must be within 1..={} seconds",
                self.max_ttl_secs
            )));
        }

        let _guard = self.write_lock.lock();
        let now = self.clock.now_secs();
        let starts_at = request.starts_at.unwrap_or(now);
        let ends_at = starts_at.saturating_add(request.ttl_seconds);
        if ends_at <= now {
            return Err(DatastoreError::InvalidRequest(
                "session would already be over".to_string(),
            ));
        }

        let token = self.allocate_token(&request.organization_id, now)?;
        let record = SessionRecord {
            info: SessionInfo {
                token: token.as_str().to_string(),
                event_id: uuid::Uuid::new_v4().to_string(),
                organization_id: membership.organization_id,
                organization_code: membership.organization_code,
                event_title: request.title.trim().to_string(),
                starts_at,
                ends_at,
                creator_id: caller.user_id.clone(),
            },
            created_at: now,
            terminated_at: None,
        };
        self.store_session(&record)?;

        info!(
            "Session created for {} (code {}), expires at {}",
            record.info.organization_id, record.info.organization_code, ends_at
        );

        Ok(CreatedSession {
            token: record.info.token,
            event_id: record.info.event_id,
            expires_at: ends_at,
        })
    }

    async fn resolve_session(
        &self,
        caller: &Caller,
        token: &str,
    ) -> Result<SessionInfo, DatastoreError> {
        authenticate(caller)?;
        let record = self
            .load_session(&token.trim().to_ascii_uppercase())?
            .ok_or(DatastoreError::NotFound)?;
        if !caller.is_member_of(&record.info.organization_id) {
            return Err(DatastoreError::OrganizationMismatch);
        }
        Ok(record.info)
    }

    async fn list_active_sessions(
        &self,
        caller: &Caller,
        organization_id: &str,
    ) -> Result<Vec<SessionInfo>, DatastoreError> {
        authenticate(caller)?;
        if !caller.is_member_of(organization_id) {
            return Err(DatastoreError::OrganizationMismatch);
        }

        let now = self.clock.now_secs();
        let mut sessions: Vec<SessionInfo> = self
            .all_sessions()?
            .into_iter()
            .filter(|r| r.info.organization_id == organization_id && r.is_live_at(now))
            .map(|r| r.info)
            .collect();
        sessions.sort_by_key(|s| s.starts_at);
        Ok(sessions)
    }

    async fn record_attendance(
        &self,
        caller: &Caller,
        token: &str,
    ) -> Result<AttendanceReceipt, DatastoreError> {
        authenticate(caller)?;
        let token = Token::parse(token).map_err(|e| {
            debug!("Rejecting attendance with malformed token: {}", e);
            DatastoreError::InvalidToken
        })?;

        let _guard = self.write_lock.lock();
        let record = self
            .load_session(token.as_str())?
            .ok_or(DatastoreError::InvalidToken)?;

        if !caller.is_member_of(&record.info.organization_id) {
            return Err(DatastoreError::OrganizationMismatch);
        }
        let now = self.clock.now_secs();
        if !record.is_live_at(now) {
            return Err(DatastoreError::SessionExpired);
        }

        let key = attendance_key(token.as_str(), &caller.user_id);
        if self.backend.get(key.as_bytes())?.is_some() {
            return Err(DatastoreError::AlreadyRecorded);
        }

        let attendance = AttendanceRecord {
            attendance_id: uuid::Uuid::new_v4().to_string(),
            session_token: token.as_str().to_string(),
            member_id: caller.user_id.clone(),
            organization_id: record.info.organization_id.clone(),
            recorded_at: now,
            method: AttendanceMethod::Proximity,
        };
        self.backend.put(key.as_bytes(), &encode(&attendance)?)?;
        self.backend.flush()?;

        info!(
            "Attendance recorded for {} at {}",
            caller.user_id, record.info.event_title
        );
        Ok(AttendanceReceipt {
            attendance_id: attendance.attendance_id,
        })
    }

    async fn terminate_session(&self, caller: &Caller, token: &str) -> Result<(), DatastoreError> {
        authenticate(caller)?;
        let _guard = self.write_lock.lock();
        let mut record = self
            .load_session(&token.trim().to_ascii_uppercase())?
            .ok_or(DatastoreError::NotFound)?;

        if record.info.creator_id != caller.user_id {
            return Err(DatastoreError::Unauthorized);
        }
        if record.terminated_at.is_some() {
            return Ok(());
        }

        record.terminated_at = Some(self.clock.now_secs());
        self.store_session(&record)?;
        info!("Session for {} terminated early", record.info.event_title);
        Ok(())
    }
}

fn authenticate(caller: &Caller) -> Result<(), DatastoreError> {
    if caller.user_id.trim().is_empty() {
        return Err(DatastoreError::Unauthorized);
    }
    Ok(())
}

fn session_key(token: &str) -> String {
    format!("{}{}", SESSION_PREFIX, token)
}

fn attendance_key(token: &str, member_id: &str) -> String {
    format!("{}{}_{}", ATTENDANCE_PREFIX, token, member_id)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::Backend(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(key: &[u8], bytes: &[u8]) -> Result<T, StorageError> {
    bincode::deserialize(bytes)
        .map_err(|_| StorageError::Corrupt(String::from_utf8_lossy(key).into_owned()))
}

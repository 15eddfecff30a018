//! Session and attendance records shared between devices and the datastore

use serde::{Deserialize, Serialize};
use std::fmt;

/// An attendance window as reported by the datastore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// 12-character session token
    pub token: String,
    /// Event the session belongs to
    pub event_id: String,
    pub organization_id: String,
    /// Compact organization identifier carried in the beacon major field
    pub organization_code: u16,
    pub event_title: String,
    /// Unix seconds, inclusive
    pub starts_at: u64,
    /// Unix seconds, exclusive
    pub ends_at: u64,
    pub creator_id: String,
}

impl SessionInfo {
    /// `starts_at <= now < ends_at`
    pub fn is_active_at(&self, now: u64) -> bool {
        self.starts_at <= now && now < self.ends_at
    }

    /// Seconds left before the session ends
    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.ends_at.saturating_sub(now)
    }
}

/// Organization the scanning member is currently acting in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrgContext {
    pub organization_id: String,
    pub organization_code: u16,
}

impl OrgContext {
    pub fn new(organization_id: impl Into<String>, organization_code: u16) -> Self {
        Self {
            organization_id: organization_id.into(),
            organization_code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceMethod {
    Proximity,
}

impl fmt::Display for AttendanceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceMethod::Proximity => write!(f, "proximity"),
        }
    }
}

/// One member's attendance at one session. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub attendance_id: String,
    pub session_token: String,
    pub member_id: String,
    pub organization_id: String,
    pub recorded_at: u64,
    pub method: AttendanceMethod,
}

/// Broadcaster's request to open a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub organization_id: String,
    pub title: String,
    /// Unix seconds; `None` starts immediately
    pub starts_at: Option<u64>,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    pub token: String,
    pub event_id: String,
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceReceipt {
    pub attendance_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(starts_at: u64, ends_at: u64) -> SessionInfo {
        SessionInfo {
            token: "BN4F9UJLPQ88".to_string(),
            event_id: "evt-1".to_string(),
            organization_id: "org-b".to_string(),
            organization_code: 2,
            event_title: "Weekly meeting".to_string(),
            starts_at,
            ends_at,
            creator_id: "officer".to_string(),
        }
    }

    #[test]
    fn test_session_that_ends_now_is_expired() {
        let s = session(100, 200);
        assert!(!s.is_active_at(200));
        assert!(s.is_active_at(199));
    }

    #[test]
    fn test_session_that_starts_now_is_started() {
        let s = session(100, 200);
        assert!(s.is_active_at(100));
        assert!(!s.is_active_at(99));
    }

    #[test]
    fn test_remaining_secs_saturates() {
        let s = session(100, 200);
        assert_eq!(s.remaining_secs(150), 50);
        assert_eq!(s.remaining_secs(500), 0);
    }

    #[test]
    fn test_attendance_method_display() {
        assert_eq!(AttendanceMethod::Proximity.to_string(), "proximity");
    }
}

//! Reverse resolution of a token hash against candidate sessions
//!
//! The hash is many-to-one, so it only narrows the candidate list. A unique
//! active match resolves; several active matches are reported as ambiguous
//! and never guessed between.

use crate::model::SessionInfo;
use crate::token::{hash_token, TokenHash};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Exactly one active session carries this hash
    Matched(SessionInfo),
    /// No candidate carries this hash
    NoMatch,
    /// Candidates carry the hash but none is inside its window
    Expired(SessionInfo),
    /// More than one active session carries this hash
    Ambiguous(Vec<SessionInfo>),
}

pub fn resolve(candidates: &[SessionInfo], observed: TokenHash, now: u64) -> Resolution {
    let matching: Vec<&SessionInfo> = candidates
        .iter()
        .filter(|s| hash_token(&s.token) == observed)
        .collect();

    if matching.is_empty() {
        return Resolution::NoMatch;
    }

    let mut active: Vec<SessionInfo> = matching
        .iter()
        .filter(|s| s.is_active_at(now))
        .map(|s| (*s).clone())
        .collect();

    match active.len() {
        0 => Resolution::Expired(matching[0].clone()),
        1 => Resolution::Matched(active.remove(0)),
        _ => {
            active.sort_by(|a, b| a.token.cmp(&b.token));
            Resolution::Ambiguous(active)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn session(token: &str, starts_at: u64, ends_at: u64) -> SessionInfo {
        SessionInfo {
            token: token.to_string(),
            event_id: format!("evt-{}", token),
            organization_id: "org-b".to_string(),
            organization_code: 2,
            event_title: "Weekly meeting".to_string(),
            starts_at,
            ends_at,
            creator_id: "officer".to_string(),
        }
    }

    #[test]
    fn test_unique_match() {
        let candidates = vec![
            session("ABCDEFGHJKLM", NOW, NOW + 60),
            session("BN4F9UJLPQ88", NOW, NOW + 60),
        ];
        match resolve(&candidates, TokenHash(17693), NOW) {
            Resolution::Matched(s) => assert_eq!(s.token, "BN4F9UJLPQ88"),
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_no_match() {
        let candidates = vec![session("ABCDEFGHJKLM", NOW, NOW + 60)];
        assert_eq!(resolve(&candidates, TokenHash(17693), NOW), Resolution::NoMatch);
        assert_eq!(resolve(&[], TokenHash(17693), NOW), Resolution::NoMatch);
    }

    #[test]
    fn test_expiry_boundaries() {
        let candidates = vec![session("BN4F9UJLPQ88", NOW, NOW + 60)];
        assert!(matches!(
            resolve(&candidates, TokenHash(17693), NOW + 60),
            Resolution::Expired(_)
        ));
        assert!(matches!(
            resolve(&candidates, TokenHash(17693), NOW),
            Resolution::Matched(_)
        ));
        assert!(matches!(
            resolve(&candidates, TokenHash(17693), NOW - 1),
            Resolution::Expired(_)
        ));
    }

    #[test]
    fn test_collision_is_ambiguous() {
        let candidates = vec![
            session("MSTTDGDKVMAW", NOW, NOW + 60),
            session("BN4F9UJLPQ88", NOW, NOW + 60),
        ];
        match resolve(&candidates, TokenHash(17693), NOW) {
            Resolution::Ambiguous(sessions) => {
                let tokens: Vec<_> = sessions.iter().map(|s| s.token.as_str()).collect();
                assert_eq!(tokens, vec!["BN4F9UJLPQ88", "MSTTDGDKVMAW"]);
            }
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }

    #[test]
    fn test_expired_collider_does_not_cause_ambiguity() {
        let candidates = vec![
            session("MSTTDGDKVMAW", NOW - 120, NOW - 60),
            session("BN4F9UJLPQ88", NOW, NOW + 60),
        ];
        match resolve(&candidates, TokenHash(17693), NOW) {
            Resolution::Matched(s) => assert_eq!(s.token, "BN4F9UJLPQ88"),
            other => panic!("expected match, got {:?}", other),
        }
    }
}

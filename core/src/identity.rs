//! Caller identity supplied by the host's authentication layer

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Membership {
    pub organization_id: String,
    pub organization_code: u16,
}

/// Authenticated user and the organizations they belong to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    pub memberships: Vec<Membership>,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            memberships: Vec::new(),
        }
    }

    pub fn with_membership(mut self, organization_id: impl Into<String>, code: u16) -> Self {
        self.memberships.push(Membership {
            organization_id: organization_id.into(),
            organization_code: code,
        });
        self
    }

    pub fn membership(&self, organization_id: &str) -> Option<&Membership> {
        self.memberships
            .iter()
            .find(|m| m.organization_id == organization_id)
    }

    pub fn is_member_of(&self, organization_id: &str) -> bool {
        self.membership(organization_id).is_some()
    }
}

/// Source of the current caller. `None` means signed out.
pub trait IdentityProvider: Send + Sync {
    fn caller(&self) -> Option<Caller>;
}

/// Identity provider holding a single swappable caller
#[derive(Debug, Default)]
pub struct StaticIdentity {
    caller: RwLock<Option<Caller>>,
}

impl StaticIdentity {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller: RwLock::new(Some(caller)),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn set_caller(&self, caller: Caller) {
        *self.caller.write() = Some(caller);
    }

    pub fn sign_out(&self) {
        *self.caller.write() = None;
    }
}

impl IdentityProvider for StaticIdentity {
    fn caller(&self) -> Option<Caller> {
        self.caller.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_lookup() {
        let caller = Caller::new("member-1")
            .with_membership("org-a", 1)
            .with_membership("org-b", 2);

        assert_eq!(caller.membership("org-b").map(|m| m.organization_code), Some(2));
        assert!(caller.is_member_of("org-a"));
        assert!(!caller.is_member_of("org-c"));
    }

    #[test]
    fn test_static_identity_sign_out() {
        let identity = StaticIdentity::new(Caller::new("member-1"));
        assert!(identity.caller().is_some());

        identity.sign_out();
        assert!(identity.caller().is_none());

        identity.set_caller(Caller::new("member-2"));
        assert_eq!(identity.caller().map(|c| c.user_id), Some("member-2".to_string()));
    }
}

//! Beacon field codec
//!
//! Maps `{organization code, token hash}` onto the advertisement's major and
//! minor fields under the deployment service id, and filters everything that
//! was not produced by this deployment.

use crate::config::ProximityConfig;
use crate::token::TokenHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Signal strength reported when a payload is built locally (no reception yet)
pub const UNMEASURED_SIGNAL: i16 = 0;

/// Advertisement fields as handed to or received from the radio
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BeaconPayload {
    /// 128-bit service identifier in hyphenated form
    pub service_id: String,
    /// Organization code
    pub major: u16,
    /// Token hash
    pub minor: u16,
    /// RSSI in dBm
    pub signal_strength: i16,
}

impl BeaconPayload {
    pub fn new(service_id: impl Into<String>, major: u16, minor: u16) -> Self {
        Self {
            service_id: service_id.into(),
            major,
            minor,
            signal_strength: UNMEASURED_SIGNAL,
        }
    }

    pub fn with_signal_strength(mut self, rssi: i16) -> Self {
        self.signal_strength = rssi;
        self
    }
}

/// Fields recovered from an attendance beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodedBeacon {
    pub organization_code: u16,
    pub token_hash: TokenHash,
    pub signal_strength: i16,
}

/// Why a received payload was dropped. Expected in normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Service id belongs to another app or deployment
    ForeignBeacon,
    /// Major field is not a registered organization code
    UnknownOrganization(u16),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::ForeignBeacon => write!(f, "foreign beacon"),
            Rejection::UnknownOrganization(code) => write!(f, "unknown organization {}", code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Organization code {0} is not registered")]
    UnknownOrganization(u16),
}

/// Encoder/decoder bound to one deployment
#[derive(Debug, Clone)]
pub struct BeaconCodec {
    service_id: String,
    known_organizations: BTreeSet<u16>,
}

impl BeaconCodec {
    /// Create a codec for the given service id and organization table
    pub fn new(service_id: Uuid, known_organizations: impl IntoIterator<Item = u16>) -> Self {
        Self {
            service_id: service_id.hyphenated().to_string(),
            known_organizations: known_organizations.into_iter().collect(),
        }
    }

    pub fn from_config(config: &ProximityConfig) -> Self {
        Self::new(config.service_id, config.known_organizations.iter().copied())
    }

    /// Service id as advertised
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn is_known_organization(&self, code: u16) -> bool {
        self.known_organizations.contains(&code)
    }

    /// Build the payload for a session. Unregistered organization codes are a
    /// caller bug and are never put on the air.
    pub fn encode(
        &self,
        organization_code: u16,
        token_hash: TokenHash,
    ) -> Result<BeaconPayload, CodecError> {
        if !self.is_known_organization(organization_code) {
            return Err(CodecError::UnknownOrganization(organization_code));
        }
        Ok(BeaconPayload::new(
            self.service_id.clone(),
            organization_code,
            token_hash.value(),
        ))
    }

    /// Recover organization code and token hash from a received payload
    pub fn decode(&self, payload: &BeaconPayload) -> Result<DecodedBeacon, Rejection> {
        if !self.matches_service_id(&payload.service_id) {
            tracing::trace!("Dropping foreign beacon {}", payload.service_id);
            return Err(Rejection::ForeignBeacon);
        }
        if !self.is_known_organization(payload.major) {
            tracing::trace!("Dropping beacon for unknown organization {}", payload.major);
            return Err(Rejection::UnknownOrganization(payload.major));
        }
        Ok(DecodedBeacon {
            organization_code: payload.major,
            token_hash: TokenHash(payload.minor),
            signal_strength: payload.signal_strength,
        })
    }

    pub fn is_attendance_beacon(&self, payload: &BeaconPayload) -> bool {
        self.decode(payload).is_ok()
    }

    fn matches_service_id(&self, candidate: &str) -> bool {
        candidate.trim().eq_ignore_ascii_case(&self.service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SERVICE_ID;
    use crate::token::hash_token;
    use proptest::prelude::*;

    fn codec() -> BeaconCodec {
        BeaconCodec::new(DEFAULT_SERVICE_ID, [1, 2])
    }

    #[test]
    fn test_encode_session_beacon() {
        let hash = hash_token("BN4F9UJLPQ88");
        let payload = codec().encode(2, hash).expect("org 2 is known");

        assert_eq!(payload.major, 2);
        assert_eq!(payload.minor, 17693);
        assert_eq!(payload.service_id, DEFAULT_SERVICE_ID.hyphenated().to_string());
    }

    #[test]
    fn test_encode_rejects_unknown_organization() {
        let result = codec().encode(3, TokenHash(1));
        assert_eq!(result, Err(CodecError::UnknownOrganization(3)));
    }

    #[test]
    fn test_decode_accepts_upper_case_service_id() {
        let codec = codec();
        let mut payload = codec.encode(1, TokenHash(42)).unwrap();
        payload.service_id = payload.service_id.to_uppercase();

        let decoded = codec.decode(&payload).expect("case-insensitive match");
        assert_eq!(decoded.organization_code, 1);
        assert_eq!(decoded.token_hash, TokenHash(42));
    }

    #[test]
    fn test_decode_carries_signal_strength() {
        let codec = codec();
        let payload = codec.encode(1, TokenHash(42)).unwrap().with_signal_strength(-67);
        assert_eq!(codec.decode(&payload).unwrap().signal_strength, -67);
    }

    #[test]
    fn test_decode_rejects_unknown_organization() {
        let codec = codec();
        let payload = BeaconPayload::new(codec.service_id(), 9, 1);
        assert_eq!(codec.decode(&payload), Err(Rejection::UnknownOrganization(9)));
        assert!(!codec.is_attendance_beacon(&payload));
    }

    #[test]
    fn test_decode_rejects_every_single_digit_change() {
        let codec = codec();
        let genuine = codec.encode(2, TokenHash(17693)).unwrap();
        assert!(codec.is_attendance_beacon(&genuine));

        for (i, c) in genuine.service_id.char_indices() {
            if c == '-' {
                continue;
            }
            let replacement = if c == '0' { '1' } else { '0' };
            let mut forged = genuine.clone();
            forged
                .service_id
                .replace_range(i..i + 1, &replacement.to_string());

            assert_eq!(
                codec.decode(&forged),
                Err(Rejection::ForeignBeacon),
                "digit {} altered should be foreign",
                i
            );
        }
    }

    #[test]
    fn test_decode_rejects_unrelated_formats() {
        let codec = codec();
        for service_id in ["", "not-a-uuid", "0000feaa-0000-1000-8000-00805f9b34fb"] {
            let payload = BeaconPayload::new(service_id, 1, 1);
            assert_eq!(codec.decode(&payload), Err(Rejection::ForeignBeacon));
        }
    }

    #[test]
    fn test_rejection_display() {
        assert_eq!(Rejection::ForeignBeacon.to_string(), "foreign beacon");
        assert_eq!(
            Rejection::UnknownOrganization(4).to_string(),
            "unknown organization 4"
        );
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(code in prop::sample::select(vec![1u16, 2]), hash in any::<u16>()) {
            let codec = codec();
            let payload = codec.encode(code, TokenHash(hash)).unwrap();
            let decoded = codec.decode(&payload).unwrap();
            prop_assert_eq!(decoded.organization_code, code);
            prop_assert_eq!(decoded.token_hash, TokenHash(hash));
        }
    }
}

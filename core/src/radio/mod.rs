// Radio capability boundary
//
// Controllers talk to the platform radio only through `RadioAdapter`: four
// operations plus two callback streams. Each platform (CoreBluetooth,
// Android BLE, btleplug, the in-process simulator) provides one
// implementation.

pub mod simulated;

use crate::beacon::BeaconPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use simulated::{SimulatedAir, SimulatedRadio};

// ============================================================================
// STATE & ERRORS
// ============================================================================

/// Power/authorization state reported by the platform radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RadioState {
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Unknown => write!(f, "unknown"),
            RadioState::Unsupported => write!(f, "unsupported"),
            RadioState::Unauthorized => write!(f, "unauthorized"),
            RadioState::PoweredOff => write!(f, "poweredOff"),
            RadioState::PoweredOn => write!(f, "poweredOn"),
        }
    }
}

/// Platform permissions required before advertising or scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Bluetooth use
    Radio,
    /// Location services, where the platform ties beacon ranging to it
    Location,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Radio => write!(f, "bluetooth"),
            Permission::Location => write!(f, "location"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("Radio is not powered on (state: {0})")]
    NotPoweredOn(RadioState),
    #[error("{0} permission has not been granted")]
    PermissionDenied(Permission),
    #[error("Beacon radio is not supported on this device")]
    Unsupported,
    #[error("Platform radio error: {0}")]
    Platform(String),
}

impl RadioError {
    /// True when the user can fix this (toggle Bluetooth, grant a permission)
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            RadioError::NotPoweredOn(_) | RadioError::PermissionDenied(_)
        )
    }
}

/// Map a radio state onto the error `advertise`/`scan` must fail with
pub fn ensure_powered_on(state: RadioState) -> Result<(), RadioError> {
    match state {
        RadioState::PoweredOn => Ok(()),
        RadioState::Unsupported => Err(RadioError::Unsupported),
        RadioState::Unauthorized => Err(RadioError::PermissionDenied(Permission::Radio)),
        RadioState::Unknown | RadioState::PoweredOff => Err(RadioError::NotPoweredOn(state)),
    }
}

// ============================================================================
// PLATFORM TRAIT
// ============================================================================

/// Fired once per observed advertisement: payload, RSSI (dBm), unix millis
pub type BeaconDetectedCallback = Box<dyn Fn(BeaconPayload, i16, u64) + Send + Sync>;

pub type RadioStateCallback = Box<dyn Fn(RadioState) + Send + Sync>;

/// Platform-specific beacon radio
///
/// `advertise` and `scan` must reject immediately when the radio is not
/// powered on or a required permission is missing. Callbacks may fire from
/// any thread and must not block.
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Last state reported by the platform
    fn state(&self) -> RadioState;

    /// Start advertising, replacing any current advertisement
    async fn advertise(&self, payload: &BeaconPayload) -> Result<(), RadioError>;

    async fn stop_advertising(&self) -> Result<(), RadioError>;

    /// Begin continuous detection of beacons carrying `service_id`
    async fn scan(&self, service_id: &str) -> Result<(), RadioError>;

    async fn stop_scan(&self) -> Result<(), RadioError>;

    fn set_on_beacon_detected(&self, callback: BeaconDetectedCallback);

    fn set_on_radio_state_changed(&self, callback: RadioStateCallback);
}

//! iBeacon manufacturer-data frame
//!
//! Layout after the 16-bit company identifier:
//!
//! ```text
//! 0x02 0x15 | uuid (16) | major (2, BE) | minor (2, BE) | measured power (1, i8)
//! ```

use super::codec::BeaconPayload;
use thiserror::Error;
use uuid::Uuid;

/// Bluetooth SIG company identifier used by iBeacon frames
pub const IBEACON_COMPANY_ID: u16 = 0x004C;

const IBEACON_TYPE: u8 = 0x02;
const IBEACON_DATA_LEN: u8 = 0x15;

/// Frame length excluding the company identifier
pub const IBEACON_FRAME_LEN: usize = 23;

/// Typical calibrated power at 1 m for phone advertisers
pub const DEFAULT_MEASURED_POWER: i8 = -59;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Service id is not a UUID: {0}")]
    InvalidServiceId(String),
}

/// Serialize a payload into iBeacon manufacturer data
pub fn to_manufacturer_data(
    payload: &BeaconPayload,
    measured_power: i8,
) -> Result<Vec<u8>, FrameError> {
    let uuid = Uuid::parse_str(&payload.service_id)
        .map_err(|_| FrameError::InvalidServiceId(payload.service_id.clone()))?;

    let mut frame = Vec::with_capacity(IBEACON_FRAME_LEN);
    frame.push(IBEACON_TYPE);
    frame.push(IBEACON_DATA_LEN);
    frame.extend_from_slice(uuid.as_bytes());
    frame.extend_from_slice(&payload.major.to_be_bytes());
    frame.extend_from_slice(&payload.minor.to_be_bytes());
    frame.push(measured_power as u8);
    Ok(frame)
}

/// Parse iBeacon manufacturer data. Anything that is not an iBeacon frame
/// yields `None`.
pub fn from_manufacturer_data(company_id: u16, data: &[u8], rssi: i16) -> Option<BeaconPayload> {
    if company_id != IBEACON_COMPANY_ID || data.len() < IBEACON_FRAME_LEN {
        return None;
    }
    if data[0] != IBEACON_TYPE || data[1] != IBEACON_DATA_LEN {
        return None;
    }

    let uuid = Uuid::from_slice(&data[2..18]).ok()?;
    let major = u16::from_be_bytes([data[18], data[19]]);
    let minor = u16::from_be_bytes([data[20], data[21]]);

    Some(BeaconPayload::new(uuid.hyphenated().to_string(), major, minor).with_signal_strength(rssi))
}

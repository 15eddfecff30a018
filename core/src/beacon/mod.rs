/// Attendance beacon wire format
///
/// - **codec**: organization code / token hash to advertisement fields, and
///   the foreign-beacon filter
/// - **frame**: iBeacon manufacturer-data layout used by real BLE radios
///
/// Platform radios (Swift/Kotlin or `btleplug`) only move bytes; everything
/// that decides whether a beacon belongs to this deployment lives here.
pub mod codec;
pub mod frame;

pub use codec::{
    BeaconCodec, BeaconPayload, CodecError, DecodedBeacon, Rejection, UNMEASURED_SIGNAL,
};
pub use frame::{
    from_manufacturer_data, to_manufacturer_data, FrameError, DEFAULT_MEASURED_POWER,
    IBEACON_COMPANY_ID,
};

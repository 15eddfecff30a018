// Scanner side: detection, organization-context replay, resolution

pub mod cache;
pub mod controller;
pub mod resolver;

pub use cache::OrgContextCache;
pub use controller::{
    AttendanceStatus, DetectedSession, ScanController, ScanError, ScanEvent, ScanEventCallback,
    ScanState,
};
pub use resolver::{resolve, Resolution};

//! In-process radio medium
//!
//! `SimulatedAir` stands in for the physical channel: every radio attached to
//! it hears the advertisements of every other attached radio each time
//! [`SimulatedAir::propagate`] runs. Scanning is unfiltered, like an Android
//! scanner, so foreign beacons reach the callback and the codec has to drop
//! them.

use super::{
    ensure_powered_on, BeaconDetectedCallback, Permission, RadioAdapter, RadioError, RadioState,
    RadioStateCallback,
};
use crate::beacon::BeaconPayload;
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Shared medium connecting simulated radios
#[derive(Default)]
pub struct SimulatedAir {
    radios: Mutex<Vec<Weak<SimulatedRadio>>>,
}

impl SimulatedAir {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new powered-on radio with a fixed received signal strength
    pub fn attach(&self, name: impl Into<String>, rssi: i16) -> Arc<SimulatedRadio> {
        let radio = Arc::new(SimulatedRadio::new(name.into(), rssi));
        self.radios.lock().push(Arc::downgrade(&radio));
        radio
    }

    fn live_radios(&self) -> Vec<Arc<SimulatedRadio>> {
        let mut radios = self.radios.lock();
        radios.retain(|r| r.strong_count() > 0);
        radios.iter().filter_map(Weak::upgrade).collect()
    }

    /// Run one advertisement cycle. Returns the number of detections delivered.
    pub fn propagate(&self) -> usize {
        let radios = self.live_radios();
        let mut delivered = 0;

        for sender in &radios {
            let Some(payload) = sender.current_advertisement() else {
                continue;
            };
            for receiver in &radios {
                if Arc::ptr_eq(sender, receiver) {
                    continue;
                }
                if receiver.deliver(payload.clone()) {
                    delivered += 1;
                }
            }
        }

        delivered
    }

    /// Deliver an arbitrary payload to every scanning radio
    pub fn inject(&self, payload: BeaconPayload) -> usize {
        self.live_radios()
            .iter()
            .filter(|radio| radio.deliver(payload.clone()))
            .count()
    }
}

/// Radio attached to a [`SimulatedAir`]
pub struct SimulatedRadio {
    name: String,
    rssi: i16,
    state: RwLock<RadioState>,
    denied: RwLock<HashSet<Permission>>,
    advertising: RwLock<Option<BeaconPayload>>,
    scanning: RwLock<Option<String>>,
    advertise_failure: RwLock<Option<RadioError>>,
    on_detected: RwLock<Option<Arc<BeaconDetectedCallback>>>,
    on_state: RwLock<Option<Arc<RadioStateCallback>>>,
    advertise_calls: AtomicUsize,
    stop_advertising_calls: AtomicUsize,
}

impl SimulatedRadio {
    fn new(name: String, rssi: i16) -> Self {
        Self {
            name,
            rssi,
            state: RwLock::new(RadioState::PoweredOn),
            denied: RwLock::new(HashSet::new()),
            advertising: RwLock::new(None),
            scanning: RwLock::new(None),
            advertise_failure: RwLock::new(None),
            on_detected: RwLock::new(None),
            on_state: RwLock::new(None),
            advertise_calls: AtomicUsize::new(0),
            stop_advertising_calls: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Change power state and notify the registered listener. Leaving
    /// `PoweredOn` tears down any advertisement or scan.
    pub fn set_state(&self, state: RadioState) {
        *self.state.write() = state;
        if state != RadioState::PoweredOn {
            *self.advertising.write() = None;
            *self.scanning.write() = None;
        }
        debug!("[{}] radio state -> {}", self.name, state);

        let callback = self.on_state.read().clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }

    pub fn deny_permission(&self, permission: Permission) {
        self.denied.write().insert(permission);
    }

    pub fn grant_permission(&self, permission: Permission) {
        self.denied.write().remove(&permission);
    }

    /// Make the next `advertise` call fail with `error`
    pub fn fail_next_advertise(&self, error: RadioError) {
        *self.advertise_failure.write() = Some(error);
    }

    pub fn current_advertisement(&self) -> Option<BeaconPayload> {
        self.advertising.read().clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.read().is_some()
    }

    pub fn advertise_calls(&self) -> usize {
        self.advertise_calls.load(Ordering::SeqCst)
    }

    pub fn stop_advertising_calls(&self) -> usize {
        self.stop_advertising_calls.load(Ordering::SeqCst)
    }

    fn check_permission(&self, permission: Permission) -> Result<(), RadioError> {
        if self.denied.read().contains(&permission) {
            return Err(RadioError::PermissionDenied(permission));
        }
        Ok(())
    }

    fn deliver(&self, payload: BeaconPayload) -> bool {
        if !self.is_scanning() {
            return false;
        }
        let callback = self.on_detected.read().clone();
        match callback {
            Some(callback) => {
                let payload = payload.with_signal_strength(self.rssi);
                callback(payload, self.rssi, SystemClock.now_millis());
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl RadioAdapter for SimulatedRadio {
    fn state(&self) -> RadioState {
        *self.state.read()
    }

    async fn advertise(&self, payload: &BeaconPayload) -> Result<(), RadioError> {
        self.advertise_calls.fetch_add(1, Ordering::SeqCst);
        ensure_powered_on(self.state())?;
        self.check_permission(Permission::Radio)?;
        if let Some(error) = self.advertise_failure.write().take() {
            return Err(error);
        }

        *self.advertising.write() = Some(payload.clone());
        debug!(
            "[{}] advertising major={} minor={}",
            self.name, payload.major, payload.minor
        );
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        self.stop_advertising_calls.fetch_add(1, Ordering::SeqCst);
        *self.advertising.write() = None;
        Ok(())
    }

    async fn scan(&self, service_id: &str) -> Result<(), RadioError> {
        ensure_powered_on(self.state())?;
        self.check_permission(Permission::Radio)?;
        self.check_permission(Permission::Location)?;

        *self.scanning.write() = Some(service_id.to_string());
        debug!("[{}] scanning for {}", self.name, service_id);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        *self.scanning.write() = None;
        Ok(())
    }

    fn set_on_beacon_detected(&self, callback: BeaconDetectedCallback) {
        *self.on_detected.write() = Some(Arc::new(callback));
    }

    fn set_on_radio_state_changed(&self, callback: RadioStateCallback) {
        *self.on_state.write() = Some(Arc::new(callback));
    }
}

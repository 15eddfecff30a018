// Desktop Bluetooth radio over btleplug
//
// btleplug drives the host adapter as a central only, so this radio scans
// for iBeacon frames and reports `Unsupported` for advertising.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use rollcall_core::beacon::{from_manufacturer_data, BeaconPayload, UNMEASURED_SIGNAL};
use rollcall_core::radio::{
    ensure_powered_on, BeaconDetectedCallback, Permission, RadioAdapter, RadioError, RadioState,
    RadioStateCallback,
};
use rollcall_core::{Clock, SystemClock};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type DetectedSlot = Arc<RwLock<Option<BeaconDetectedCallback>>>;
type StateSlot = Arc<RwLock<Option<RadioStateCallback>>>;

pub struct BleRadio {
    adapter: Option<Adapter>,
    state: Arc<RwLock<RadioState>>,
    on_detected: DetectedSlot,
    on_state: StateSlot,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BleRadio {
    /// Bind to the first Bluetooth adapter on this host. A host without one
    /// yields a radio in the `Unsupported` state rather than an error.
    pub async fn first_adapter() -> Result<Self, RadioError> {
        let manager = Manager::new().await.map_err(platform_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(platform_error)?
            .into_iter()
            .next();

        let state = match &adapter {
            Some(adapter) => {
                let name = adapter
                    .adapter_info()
                    .await
                    .unwrap_or_else(|_| "unknown adapter".to_string());
                info!("Using Bluetooth adapter: {}", name);
                RadioState::PoweredOn
            }
            None => {
                warn!("No Bluetooth adapter found");
                RadioState::Unsupported
            }
        };

        Ok(Self {
            adapter,
            state: Arc::new(RwLock::new(state)),
            on_detected: Arc::new(RwLock::new(None)),
            on_state: Arc::new(RwLock::new(None)),
            scan_task: Mutex::new(None),
        })
    }

    fn abort_scan_task(&self) {
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl RadioAdapter for BleRadio {
    fn state(&self) -> RadioState {
        *self.state.read()
    }

    async fn advertise(&self, _payload: &BeaconPayload) -> Result<(), RadioError> {
        Err(RadioError::Unsupported)
    }

    async fn stop_advertising(&self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn scan(&self, service_id: &str) -> Result<(), RadioError> {
        ensure_powered_on(self.state())?;
        let adapter = self.adapter.clone().ok_or(RadioError::Unsupported)?;

        self.abort_scan_task();
        let mut events = adapter.events().await.map_err(platform_error)?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(platform_error)?;
        info!("BLE scan started for service {}", service_id);

        let service_id = service_id.to_string();
        let on_detected = self.on_detected.clone();
        let state = self.state.clone();
        let on_state = self.on_state.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let CentralEvent::ManufacturerDataAdvertisement {
                    id,
                    manufacturer_data,
                } = event
                else {
                    continue;
                };

                let rssi = signal_strength(&adapter, &id).await;
                for (company_id, data) in manufacturer_data {
                    let Some(payload) = from_manufacturer_data(company_id, &data, rssi) else {
                        continue;
                    };
                    if !payload.service_id.eq_ignore_ascii_case(&service_id) {
                        continue;
                    }
                    if let Some(callback) = on_detected.read().as_ref() {
                        callback(payload, rssi, SystemClock.now_millis());
                    }
                }
            }

            // The stream only ends when the adapter goes away
            warn!("BLE event stream ended");
            publish_state(&state, &on_state, RadioState::PoweredOff);
        });
        *self.scan_task.lock() = Some(task);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), RadioError> {
        self.abort_scan_task();
        if let Some(adapter) = &self.adapter {
            adapter.stop_scan().await.map_err(platform_error)?;
            debug!("BLE scan stopped");
        }
        Ok(())
    }

    fn set_on_beacon_detected(&self, callback: BeaconDetectedCallback) {
        *self.on_detected.write() = Some(callback);
    }

    fn set_on_radio_state_changed(&self, callback: RadioStateCallback) {
        *self.on_state.write() = Some(callback);
    }
}

impl Drop for BleRadio {
    fn drop(&mut self) {
        self.abort_scan_task();
    }
}

fn publish_state(state: &RwLock<RadioState>, on_state: &StateSlot, next: RadioState) {
    {
        let mut current = state.write();
        if *current == next {
            return;
        }
        *current = next;
    }
    if let Some(callback) = on_state.read().as_ref() {
        callback(next);
    }
}

async fn signal_strength(adapter: &Adapter, id: &PeripheralId) -> i16 {
    let Ok(peripheral) = adapter.peripheral(id).await else {
        return UNMEASURED_SIGNAL;
    };
    match peripheral.properties().await {
        Ok(Some(properties)) => properties.rssi.unwrap_or(UNMEASURED_SIGNAL),
        _ => UNMEASURED_SIGNAL,
    }
}

fn platform_error(err: btleplug::Error) -> RadioError {
    match err {
        btleplug::Error::PermissionDenied => RadioError::PermissionDenied(Permission::Radio),
        other => RadioError::Platform(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_maps_to_radio_permission() {
        assert_eq!(
            platform_error(btleplug::Error::PermissionDenied),
            RadioError::PermissionDenied(Permission::Radio)
        );
        assert!(matches!(
            platform_error(btleplug::Error::DeviceNotFound),
            RadioError::Platform(_)
        ));
    }

    #[test]
    fn test_publish_state_fires_only_on_change() {
        let state = RwLock::new(RadioState::PoweredOn);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let slot: StateSlot = Arc::new(RwLock::new(None));
        let sink = seen.clone();
        *slot.write() = Some(Box::new(move |s| sink.lock().push(s)));

        publish_state(&state, &slot, RadioState::PoweredOn);
        publish_state(&state, &slot, RadioState::PoweredOff);
        publish_state(&state, &slot, RadioState::PoweredOff);

        assert_eq!(*seen.lock(), vec![RadioState::PoweredOff]);
        assert_eq!(*state.read(), RadioState::PoweredOff);
    }
}

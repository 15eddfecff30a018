// Rollcall: proximity session discovery
//
// A broadcaster advertises {organization code, token hash}; scanners hear it,
// resolve the hash against the organization's active sessions and record
// attendance. Everything the radio carries is public, so nothing in a beacon
// is a credential: the datastore re-validates every submission.

pub mod attendance;
pub mod beacon;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod identity;
pub mod model;
pub mod radio;
pub mod scan;
pub mod store;
pub mod token;

use parking_lot::RwLock;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

pub use attendance::{AttendanceSubmitter, SubmitError, SubmitOutcome};
pub use beacon::{BeaconCodec, BeaconPayload, CodecError, DecodedBeacon, Rejection};
pub use broadcast::{BroadcastController, BroadcastError, BroadcastState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ProximityConfig, DEFAULT_SERVICE_ID};
pub use identity::{Caller, IdentityProvider, Membership, StaticIdentity};
pub use model::{
    AttendanceMethod, AttendanceReceipt, AttendanceRecord, CreateSessionRequest, CreatedSession,
    OrgContext, SessionInfo,
};
pub use radio::{Permission, RadioAdapter, RadioError, RadioState, SimulatedAir, SimulatedRadio};
pub use scan::{
    AttendanceStatus, DetectedSession, Resolution, ScanController, ScanError, ScanEvent, ScanState,
};
pub use store::{Datastore, DatastoreError, LocalDatastore, MemoryStorage, SledStorage};
pub use token::{generate_token, hash_token, Token, TokenError, TokenHash};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RollcallError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Radio(#[from] RadioError),
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Not signed in")]
    Unauthenticated,
}

// ============================================================================
// DELEGATE TRAIT
// ============================================================================

/// Callback interface for the host app (UI updates, notifications)
///
/// Called from radio and worker threads. Implementations must return quickly.
pub trait AttendanceDelegate: Send + Sync {
    /// A beacon resolved to a session for the first time this scan
    fn on_session_detected(&self, detected: DetectedSession);
    /// An attendance submission finished
    fn on_attendance_result(
        &self,
        session: SessionInfo,
        result: Result<SubmitOutcome, SubmitError>,
    );
    /// Several active sessions share one beacon hash; nothing was submitted
    fn on_ambiguous_beacon(
        &self,
        organization_code: u16,
        token_hash: TokenHash,
        candidates: Vec<SessionInfo>,
    );
    fn on_broadcast_state_changed(&self, state: BroadcastState);
    fn on_scan_state_changed(&self, _state: ScanState) {}
    fn on_radio_state_changed(&self, _state: RadioState) {}
}

// ============================================================================
// PROXIMITY NODE
// ============================================================================

type SharedDelegate = Arc<RwLock<Option<Arc<dyn AttendanceDelegate>>>>;

/// One device's view of the protocol: a radio, both controllers and the
/// submitter, wired together
#[derive(Clone)]
pub struct ProximityNode {
    config: ProximityConfig,
    radio: Arc<dyn RadioAdapter>,
    datastore: Arc<dyn Datastore>,
    identity: Arc<dyn IdentityProvider>,
    broadcast: BroadcastController,
    scan: ScanController,
    submitter: Arc<AttendanceSubmitter>,
    delegate: SharedDelegate,
}

impl ProximityNode {
    pub fn new(
        config: ProximityConfig,
        radio: Arc<dyn RadioAdapter>,
        datastore: Arc<dyn Datastore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, RollcallError> {
        Self::with_clock(config, radio, datastore, identity, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ProximityConfig,
        radio: Arc<dyn RadioAdapter>,
        datastore: Arc<dyn Datastore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RollcallError> {
        config.validate()?;

        let codec = BeaconCodec::from_config(&config);
        let submitter = Arc::new(AttendanceSubmitter::new(
            datastore.clone(),
            identity.clone(),
            &config,
        ));
        let broadcast = BroadcastController::with_clock(radio.clone(), codec.clone(), clock.clone());
        let scan = ScanController::with_clock(
            radio.clone(),
            codec,
            datastore.clone(),
            identity.clone(),
            submitter.clone(),
            config.clone(),
            clock,
        );

        let node = Self {
            config,
            radio,
            datastore,
            identity,
            broadcast,
            scan,
            submitter,
            delegate: Arc::new(RwLock::new(None)),
        };
        node.wire_callbacks();
        Ok(node)
    }

    fn wire_callbacks(&self) {
        let scan = self.scan.clone();
        let broadcast = self.broadcast.clone();
        self.radio
            .set_on_beacon_detected(Box::new(move |payload, rssi, timestamp_ms| {
                guarded("beacon detection", &broadcast, || {
                    scan.handle_beacon_detected(payload, rssi, timestamp_ms)
                });
            }));

        let scan = self.scan.clone();
        let broadcast = self.broadcast.clone();
        let delegate = self.delegate.clone();
        self.radio.set_on_radio_state_changed(Box::new(move |state| {
            guarded("radio state change", &broadcast, || {
                info!("Radio state changed to {}", state);
                broadcast.handle_radio_state_changed(state);
                scan.handle_radio_state_changed(state);
                let current = delegate.read().clone();
                if let Some(delegate) = current {
                    delegate.on_radio_state_changed(state);
                }
            });
        }));

        let delegate = self.delegate.clone();
        self.broadcast.set_on_state_changed(Box::new(move |state| {
            let current = delegate.read().clone();
            if let Some(delegate) = current {
                delegate.on_broadcast_state_changed(state);
            }
        }));

        let delegate = self.delegate.clone();
        self.scan.set_on_event(Box::new(move |event| {
            let Some(delegate) = delegate.read().clone() else {
                return;
            };
            match event {
                ScanEvent::StateChanged(state) => delegate.on_scan_state_changed(state),
                ScanEvent::SessionDetected(detected) => delegate.on_session_detected(detected),
                ScanEvent::AmbiguousBeacon {
                    organization_code,
                    token_hash,
                    candidates,
                } => delegate.on_ambiguous_beacon(organization_code, token_hash, candidates),
                ScanEvent::AttendanceResult { session, result } => {
                    delegate.on_attendance_result(session, result)
                }
            }
        }));
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn AttendanceDelegate>>) {
        *self.delegate.write() = delegate;
    }

    pub fn config(&self) -> &ProximityConfig {
        &self.config
    }

    pub fn radio_state(&self) -> RadioState {
        self.radio.state()
    }

    pub fn broadcast(&self) -> &BroadcastController {
        &self.broadcast
    }

    pub fn scan(&self) -> &ScanController {
        &self.scan
    }

    pub fn submitter(&self) -> &Arc<AttendanceSubmitter> {
        &self.submitter
    }

    /// Create a session on the datastore and start advertising it
    pub async fn open_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<SessionInfo, RollcallError> {
        let caller = self.caller()?;
        let created = self.datastore.create_session(&caller, request).await?;
        let session = self.datastore.resolve_session(&caller, &created.token).await?;
        self.broadcast.start(&session).await?;
        Ok(session)
    }

    /// Stop advertising `token` (if it is on the air) and terminate it
    pub async fn close_session(&self, token: &str) -> Result<(), RollcallError> {
        let caller = self.caller()?;
        let on_air = self
            .broadcast
            .current_session()
            .map(|s| s.token.eq_ignore_ascii_case(token.trim()))
            .unwrap_or(false);
        if on_air {
            self.broadcast.stop().await;
        }
        self.datastore.terminate_session(&caller, token).await?;
        Ok(())
    }

    /// Start scanning in the caller's membership of `organization_id`. An
    /// unknown membership starts without context; beacons are then held
    /// until [`ScanController::set_org_context`] is called.
    pub async fn start_scanning(&self, organization_id: Option<&str>) -> Result<(), RollcallError> {
        let caller = self.caller()?;
        let context = organization_id
            .and_then(|id| caller.membership(id))
            .map(|m| OrgContext::new(m.organization_id.clone(), m.organization_code));
        self.scan.start(context).await?;
        Ok(())
    }

    /// Stop both controllers
    pub async fn shutdown(&self) {
        self.broadcast.stop().await;
        self.scan.stop().await;
    }

    fn caller(&self) -> Result<Caller, RollcallError> {
        self.identity.caller().ok_or(RollcallError::Unauthenticated)
    }
}

/// Run a platform callback body, turning a panic into a failed broadcast
/// instead of unwinding into platform code
fn guarded<F: FnOnce()>(what: &str, broadcast: &BroadcastController, body: F) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(body)) {
        let message = panic_message(panic.as_ref());
        error!("Panic in {} handler: {}", what, message);
        broadcast.mark_failed(format!("{} handler panicked: {}", what, message));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingDelegate {
        broadcast_states: Mutex<Vec<BroadcastState>>,
        panic_on_radio_state: bool,
    }

    impl AttendanceDelegate for RecordingDelegate {
        fn on_session_detected(&self, _detected: DetectedSession) {}

        fn on_attendance_result(
            &self,
            _session: SessionInfo,
            _result: Result<SubmitOutcome, SubmitError>,
        ) {
        }

        fn on_ambiguous_beacon(&self, _code: u16, _hash: TokenHash, _candidates: Vec<SessionInfo>) {}

        fn on_broadcast_state_changed(&self, state: BroadcastState) {
            self.broadcast_states.lock().push(state);
        }

        fn on_radio_state_changed(&self, _state: RadioState) {
            if self.panic_on_radio_state {
                panic!("delegate exploded");
            }
        }
    }

    fn officer() -> Arc<StaticIdentity> {
        Arc::new(StaticIdentity::new(
            Caller::new("officer").with_membership("org-b", 2),
        ))
    }

    fn node(air: &SimulatedAir) -> (ProximityNode, Arc<SimulatedRadio>) {
        let radio = air.attach("officer-phone", -45);
        let datastore = Arc::new(LocalDatastore::new(MemoryStorage::new()));
        let node = ProximityNode::new(
            ProximityConfig::default(),
            radio.clone(),
            datastore,
            officer(),
        )
        .unwrap();
        (node, radio)
    }

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            organization_id: "org-b".to_string(),
            title: "Weekly meeting".to_string(),
            starts_at: None,
            ttl_seconds: 3600,
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let air = SimulatedAir::new();
        let config = ProximityConfig {
            known_organizations: vec![],
            ..Default::default()
        };
        let result = ProximityNode::new(
            config,
            air.attach("r", -50),
            Arc::new(LocalDatastore::new(MemoryStorage::new())),
            officer(),
        );
        assert!(matches!(result, Err(RollcallError::Config(_))));
    }

    #[tokio::test]
    async fn test_open_and_close_session() {
        let air = SimulatedAir::new();
        let (node, radio) = node(&air);

        let session = node.open_session(request()).await.unwrap();
        assert_eq!(node.broadcast().state(), BroadcastState::Advertising);
        assert_eq!(
            radio.current_advertisement().map(|p| p.minor),
            Some(hash_token(&session.token).value())
        );

        node.close_session(&session.token).await.unwrap();
        assert_eq!(node.broadcast().state(), BroadcastState::Idle);
    }

    #[tokio::test]
    async fn test_radio_state_reaches_broadcast_and_delegate() {
        let air = SimulatedAir::new();
        let (node, radio) = node(&air);
        let delegate = Arc::new(RecordingDelegate::default());
        node.set_delegate(Some(delegate.clone()));

        node.open_session(request()).await.unwrap();
        radio.set_state(RadioState::PoweredOff);

        assert_eq!(
            node.broadcast().state(),
            BroadcastState::Failed(BroadcastError::RadioNotReady(RadioState::PoweredOff))
        );
        assert_eq!(
            delegate.broadcast_states.lock().last(),
            Some(&BroadcastState::Failed(BroadcastError::RadioNotReady(
                RadioState::PoweredOff
            )))
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_broadcast() {
        let air = SimulatedAir::new();
        let (node, radio) = node(&air);
        node.set_delegate(Some(Arc::new(RecordingDelegate {
            panic_on_radio_state: true,
            ..Default::default()
        })));

        node.open_session(request()).await.unwrap();
        radio.set_state(RadioState::PoweredOn);

        match node.broadcast().state() {
            BroadcastState::Failed(BroadcastError::Adapter(reason)) => {
                assert!(reason.contains("delegate exploded"))
            }
            other => panic!("expected adapter failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_signed_out_node_cannot_open_sessions() {
        let air = SimulatedAir::new();
        let node = ProximityNode::new(
            ProximityConfig::default(),
            air.attach("r", -50),
            Arc::new(LocalDatastore::new(MemoryStorage::new())),
            Arc::new(StaticIdentity::signed_out()),
        )
        .unwrap();
        assert_eq!(
            node.open_session(request()).await,
            Err(RollcallError::Unauthenticated)
        );
    }

    #[test]
    fn test_panic_message_extraction() {
        let caught = panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(caught.as_ref()), "boom 7");
    }
}

// Scanner lifecycle: detection gate, work queue, resolution worker
//
// The radio callback runs on whatever thread the platform uses and must not
// block, so it only decodes, gates and `try_send`s. A single worker per
// listening epoch drains the queue in order, which is what keeps context
// replay ordered. Submissions run in their own tasks.

use super::cache::OrgContextCache;
use super::resolver::{resolve, Resolution};
use crate::attendance::{AttendanceSubmitter, SubmitError, SubmitOutcome};
use crate::beacon::{BeaconCodec, BeaconPayload, DecodedBeacon};
use crate::clock::{Clock, SystemClock};
use crate::config::ProximityConfig;
use crate::identity::IdentityProvider;
use crate::model::{OrgContext, SessionInfo};
use crate::radio::{RadioAdapter, RadioError, RadioState};
use crate::store::{Datastore, DatastoreError};
use crate::token::TokenHash;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

// ============================================================================
// PUBLIC TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("Radio refused to scan: {0}")]
    Radio(#[from] RadioError),
    #[error("Session {0} has not been detected or is not awaiting confirmation")]
    NotDetected(String),
    #[error("Attendance submission failed: {0}")]
    Submit(#[from] SubmitError),
    #[error("Superseded by a newer start or stop")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Listening,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "idle"),
            ScanState::Listening => write!(f, "listening"),
        }
    }
}

/// Where a detected session stands with respect to attendance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttendanceStatus {
    /// Waiting for `confirm` (auto-submit disabled)
    AwaitingConfirmation,
    Submitting,
    /// Recorded now or earlier
    Present,
    Failed(SubmitError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedSession {
    pub session: SessionInfo,
    /// RSSI of the sighting that resolved it
    pub signal_strength: i16,
    /// Unix millis
    pub detected_at: u64,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    StateChanged(ScanState),
    SessionDetected(DetectedSession),
    /// Several active sessions share the observed hash; nothing was submitted
    AmbiguousBeacon {
        organization_code: u16,
        token_hash: TokenHash,
        candidates: Vec<SessionInfo>,
    },
    AttendanceResult {
        session: SessionInfo,
        result: Result<SubmitOutcome, SubmitError>,
    },
}

pub type ScanEventCallback = Box<dyn Fn(ScanEvent) + Send + Sync>;

// ============================================================================
// INTERNAL STATE
// ============================================================================

type BeaconKey = (u16, TokenHash);

#[derive(Debug, Clone, Copy)]
struct Sighting {
    beacon: DecodedBeacon,
    detected_at: u64,
}

impl Sighting {
    fn key(&self) -> BeaconKey {
        (self.beacon.organization_code, self.beacon.token_hash)
    }
}

struct Job {
    epoch: u64,
    sighting: Sighting,
    context: OrgContext,
}

struct Listener {
    state: ScanState,
    context: Option<OrgContext>,
    queue: Option<mpsc::Sender<Job>>,
    pending: OrgContextCache<Sighting>,
}

struct SessionListCache {
    organization_id: String,
    fetched_at: Instant,
    sessions: Vec<SessionInfo>,
}

struct Shared {
    radio: Arc<dyn RadioAdapter>,
    codec: BeaconCodec,
    datastore: Arc<dyn Datastore>,
    identity: Arc<dyn IdentityProvider>,
    submitter: Arc<AttendanceSubmitter>,
    clock: Arc<dyn Clock>,
    config: ProximityConfig,
    epoch: AtomicU64,
    listener: RwLock<Listener>,
    /// Keys resolved (or found ambiguous) in this epoch
    handled: Mutex<HashSet<BeaconKey>>,
    /// Keys queued or being resolved
    in_flight: Mutex<HashSet<BeaconKey>>,
    detected: RwLock<HashMap<String, DetectedSession>>,
    session_list: Mutex<Option<SessionListCache>>,
    on_event: RwLock<Option<Arc<ScanEventCallback>>>,
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Listens for attendance beacons and turns them into attendance records
///
/// Cloning yields another handle onto the same controller.
#[derive(Clone)]
pub struct ScanController {
    shared: Arc<Shared>,
}

impl ScanController {
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        codec: BeaconCodec,
        datastore: Arc<dyn Datastore>,
        identity: Arc<dyn IdentityProvider>,
        submitter: Arc<AttendanceSubmitter>,
        config: ProximityConfig,
    ) -> Self {
        Self::with_clock(
            radio,
            codec,
            datastore,
            identity,
            submitter,
            config,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        radio: Arc<dyn RadioAdapter>,
        codec: BeaconCodec,
        datastore: Arc<dyn Datastore>,
        identity: Arc<dyn IdentityProvider>,
        submitter: Arc<AttendanceSubmitter>,
        config: ProximityConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let pending = OrgContextCache::new(config.org_context_cache_capacity);
        Self {
            shared: Arc::new(Shared {
                radio,
                codec,
                datastore,
                identity,
                submitter,
                clock,
                config,
                epoch: AtomicU64::new(0),
                listener: RwLock::new(Listener {
                    state: ScanState::Idle,
                    context: None,
                    queue: None,
                    pending,
                }),
                handled: Mutex::new(HashSet::new()),
                in_flight: Mutex::new(HashSet::new()),
                detected: RwLock::new(HashMap::new()),
                session_list: Mutex::new(None),
                on_event: RwLock::new(None),
            }),
        }
    }

    pub fn state(&self) -> ScanState {
        self.shared.listener.read().state
    }

    pub fn org_context(&self) -> Option<OrgContext> {
        self.shared.listener.read().context.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.shared.epoch()
    }

    /// Beacons waiting for organization context
    pub fn pending_beacons(&self) -> usize {
        self.shared.listener.read().pending.len()
    }

    /// Sessions resolved in the current listening period, oldest first
    pub fn detected_sessions(&self) -> Vec<DetectedSession> {
        let mut sessions: Vec<DetectedSession> =
            self.shared.detected.read().values().cloned().collect();
        sessions.sort_by(|a, b| {
            a.detected_at
                .cmp(&b.detected_at)
                .then_with(|| a.session.token.cmp(&b.session.token))
        });
        sessions
    }

    pub fn set_on_event(&self, callback: ScanEventCallback) {
        *self.shared.on_event.write() = Some(Arc::new(callback));
    }

    /// Start listening. Without `context`, beacons are held in the replay
    /// cache until [`set_org_context`](Self::set_org_context) is called.
    pub async fn start(&self, context: Option<OrgContext>) -> Result<(), ScanError> {
        if self.state() == ScanState::Listening {
            self.stop().await;
        }

        let (tx, rx) = mpsc::channel(self.shared.config.work_queue_depth.max(1));
        let epoch = {
            let mut listener = self.shared.listener.write();
            let epoch = self.shared.bump_epoch();
            listener.state = ScanState::Listening;
            listener.context = context.clone();
            listener.queue = Some(tx);
            listener.pending.clear();
            epoch
        };

        let worker = self.shared.clone();
        tokio::spawn(async move { worker.run(epoch, rx).await });

        if let Err(e) = self.shared.radio.scan(self.shared.codec.service_id()).await {
            warn!("Radio refused to scan: {}", e);
            self.shared.go_idle(epoch);
            return Err(ScanError::Radio(e));
        }
        if self.shared.epoch() != epoch {
            return Err(ScanError::Cancelled);
        }

        match &context {
            Some(ctx) => info!("Listening for beacons of {}", ctx.organization_id),
            None => info!("Listening for beacons (organization context pending)"),
        }
        self.shared.emit(ScanEvent::StateChanged(ScanState::Listening));
        Ok(())
    }

    /// Provide (or replace) organization context. Beacons cached while
    /// context was missing are replayed in arrival order.
    pub fn set_org_context(&self, context: OrgContext) {
        let mut listener = self.shared.listener.write();
        listener.context = Some(context.clone());
        let replay = listener.pending.drain();
        if !replay.is_empty() {
            debug!(
                "Replaying {} cached beacon(s) for {}",
                replay.len(),
                context.organization_id
            );
        }
        if listener.state != ScanState::Listening {
            return;
        }
        let epoch = self.shared.epoch();
        for sighting in replay {
            self.shared.admit(&listener, epoch, sighting);
        }
    }

    /// Stop listening. Clears detections and the replay cache.
    pub async fn stop(&self) {
        let was_listening = {
            let mut listener = self.shared.listener.write();
            self.shared.bump_epoch();
            let was = listener.state == ScanState::Listening;
            listener.state = ScanState::Idle;
            listener.context = None;
            listener.queue = None;
            listener.pending.clear();
            was
        };
        self.shared.reset_detections();

        if let Err(e) = self.shared.radio.stop_scan().await {
            warn!("stop_scan failed, treating scan as stopped: {}", e);
        }
        if was_listening {
            info!("Stopped listening for beacons");
            self.shared.emit(ScanEvent::StateChanged(ScanState::Idle));
        }
    }

    /// Radio detection entry point. Never blocks.
    pub fn handle_beacon_detected(&self, payload: BeaconPayload, rssi: i16, timestamp_ms: u64) {
        let beacon = match self.shared.codec.decode(&payload) {
            Ok(beacon) => beacon,
            Err(rejection) => {
                trace!("Ignoring beacon: {}", rejection);
                return;
            }
        };
        let sighting = Sighting {
            beacon: DecodedBeacon {
                signal_strength: rssi,
                ..beacon
            },
            detected_at: timestamp_ms,
        };

        let mut listener = self.shared.listener.write();
        if listener.state != ScanState::Listening {
            return;
        }
        if listener.context.is_none() {
            if let Some(evicted) = listener.pending.push(sighting) {
                debug!(
                    "Replay cache full, evicted beacon org {} hash {}",
                    evicted.beacon.organization_code, evicted.beacon.token_hash
                );
            }
            return;
        }
        let epoch = self.shared.epoch();
        self.shared.admit(&listener, epoch, sighting);
    }

    /// Radio state entry point
    pub fn handle_radio_state_changed(&self, state: RadioState) {
        if state == RadioState::PoweredOn || self.state() != ScanState::Listening {
            return;
        }
        warn!("Radio went {} while listening", state);
        let epoch = self.shared.epoch();
        self.shared.go_idle(epoch);
    }

    /// Submit attendance for a detected session awaiting confirmation, or
    /// retry one whose last submission failed with a retryable error
    pub async fn confirm(&self, token: &str) -> Result<SubmitOutcome, ScanError> {
        let token = token.trim().to_ascii_uppercase();
        let session = {
            let mut detected = self.shared.detected.write();
            let entry = detected
                .get_mut(&token)
                .ok_or_else(|| ScanError::NotDetected(token.clone()))?;
            let confirmable = match &entry.status {
                AttendanceStatus::AwaitingConfirmation => true,
                AttendanceStatus::Failed(err) => err.is_retryable(),
                _ => false,
            };
            if !confirmable {
                return Err(ScanError::NotDetected(token));
            }
            entry.status = AttendanceStatus::Submitting;
            entry.session.clone()
        };

        let epoch = self.shared.epoch();
        let result = self.shared.submitter.submit(&session.token).await;
        self.shared.finish_submission(epoch, session, result.clone());
        result.map_err(ScanError::from)
    }
}

impl Shared {
    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emit(&self, event: ScanEvent) {
        let callback = self.on_event.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn reset_detections(&self) {
        self.handled.lock().clear();
        self.in_flight.lock().clear();
        self.detected.write().clear();
        *self.session_list.lock() = None;
    }

    /// Drop to idle without touching the radio (it already stopped)
    fn go_idle(&self, epoch: u64) {
        {
            let mut listener = self.listener.write();
            if self.epoch() != epoch || listener.state == ScanState::Idle {
                return;
            }
            self.bump_epoch();
            listener.state = ScanState::Idle;
            listener.queue = None;
            listener.pending.clear();
        }
        self.in_flight.lock().clear();
        self.emit(ScanEvent::StateChanged(ScanState::Idle));
    }

    /// Organization gate and dedup, then enqueue
    fn admit(&self, listener: &Listener, epoch: u64, sighting: Sighting) {
        let Some(context) = listener.context.as_ref() else {
            return;
        };
        if sighting.beacon.organization_code != context.organization_code {
            trace!(
                "Ignoring beacon for organization {} (acting in {})",
                sighting.beacon.organization_code,
                context.organization_code
            );
            return;
        }

        let key = sighting.key();
        if self.handled.lock().contains(&key) {
            return;
        }
        if !self.in_flight.lock().insert(key) {
            return;
        }

        let Some(queue) = listener.queue.as_ref() else {
            self.in_flight.lock().remove(&key);
            return;
        };
        let job = Job {
            epoch,
            sighting,
            context: context.clone(),
        };
        if let Err(e) = queue.try_send(job) {
            debug!("Dropping beacon, work queue unavailable: {}", e);
            self.in_flight.lock().remove(&key);
        }
    }

    async fn run(self: Arc<Self>, epoch: u64, mut rx: mpsc::Receiver<Job>) {
        while let Some(job) = rx.recv().await {
            if self.epoch() != epoch {
                break;
            }
            self.process(job).await;
        }
        debug!("Resolution worker for epoch {} finished", epoch);
    }

    async fn process(self: &Arc<Self>, job: Job) {
        let key = job.sighting.key();
        let fetched = self.active_sessions(&job.context).await;
        self.in_flight.lock().remove(&key);

        if self.epoch() != job.epoch {
            debug!("Discarding stale resolution (epoch {})", job.epoch);
            return;
        }

        let candidates = match fetched {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Could not fetch active sessions: {}", e);
                return;
            }
        };

        let now = self.clock.now_secs();
        match resolve(&candidates, job.sighting.beacon.token_hash, now) {
            Resolution::NoMatch => {
                debug!(
                    "Beacon seen, no matching session (org {}, hash {})",
                    key.0, key.1
                );
            }
            Resolution::Expired(session) => {
                debug!("Beacon matched {} but it is outside its window", session.event_title);
            }
            Resolution::Ambiguous(candidates) => {
                warn!(
                    "{} active sessions share hash {}, not submitting",
                    candidates.len(),
                    key.1
                );
                self.handled.lock().insert(key);
                self.emit(ScanEvent::AmbiguousBeacon {
                    organization_code: key.0,
                    token_hash: key.1,
                    candidates,
                });
            }
            Resolution::Matched(session) => {
                self.handled.lock().insert(key);
                self.on_matched(job.epoch, session, job.sighting);
            }
        }
    }

    fn on_matched(self: &Arc<Self>, epoch: u64, session: SessionInfo, sighting: Sighting) {
        let auto_submit = self.config.auto_submit;
        let entry = DetectedSession {
            session: session.clone(),
            signal_strength: sighting.beacon.signal_strength,
            detected_at: sighting.detected_at,
            status: if auto_submit {
                AttendanceStatus::Submitting
            } else {
                AttendanceStatus::AwaitingConfirmation
            },
        };

        // Some(retry) for a session seen before, None for a new detection
        let previously_seen = {
            let mut detected = self.detected.write();
            match detected.get_mut(&session.token) {
                Some(existing) => {
                    // Only a retryable failure or a suppressed submission
                    // lets the key back out of `handled`
                    let retry = auto_submit
                        && match &existing.status {
                            AttendanceStatus::Failed(err) => err.is_retryable(),
                            AttendanceStatus::Submitting => true,
                            _ => false,
                        };
                    if retry {
                        existing.status = AttendanceStatus::Submitting;
                    }
                    Some(retry)
                }
                None => {
                    detected.insert(session.token.clone(), entry.clone());
                    None
                }
            }
        };

        match previously_seen {
            Some(true) => self.spawn_submission(epoch, session),
            Some(false) => {}
            None => {
                info!("Detected session {}", session.event_title);
                self.emit(ScanEvent::SessionDetected(entry));
                if auto_submit {
                    self.spawn_submission(epoch, session);
                }
            }
        }
    }

    fn spawn_submission(self: &Arc<Self>, epoch: u64, session: SessionInfo) {
        let shared = self.clone();
        tokio::spawn(async move {
            let result = shared.submitter.submit(&session.token).await;
            shared.finish_submission(epoch, session, result);
        });
    }

    fn finish_submission(
        &self,
        epoch: u64,
        session: SessionInfo,
        result: Result<SubmitOutcome, SubmitError>,
    ) {
        if self.epoch() != epoch {
            debug!("Discarding stale submission result (epoch {})", epoch);
            return;
        }

        let status = match &result {
            Ok(SubmitOutcome::Suppressed) => None,
            Ok(_) => Some(AttendanceStatus::Present),
            Err(err) => Some(AttendanceStatus::Failed(err.clone())),
        };
        if let Some(status) = status {
            if let Some(entry) = self.detected.write().get_mut(&session.token) {
                entry.status = status;
            }
        }

        let retry_on_next_sighting = match &result {
            Ok(SubmitOutcome::Suppressed) => true,
            Err(err) => err.is_retryable(),
            Ok(_) => false,
        };
        if retry_on_next_sighting {
            let key = (session.organization_code, crate::token::hash_token(&session.token));
            self.handled.lock().remove(&key);
        }

        self.emit(ScanEvent::AttendanceResult { session, result });
    }

    async fn active_sessions(&self, context: &OrgContext) -> Result<Vec<SessionInfo>, DatastoreError> {
        let ttl = self.config.session_list_ttl();
        let cached = {
            let list = self.session_list.lock();
            list.as_ref()
                .filter(|c| {
                    c.organization_id == context.organization_id && c.fetched_at.elapsed() < ttl
                })
                .map(|c| c.sessions.clone())
        };
        if let Some(sessions) = cached {
            return Ok(sessions);
        }

        let caller = self.identity.caller().ok_or(DatastoreError::Unauthorized)?;
        let sessions = tokio::time::timeout(
            self.config.request_timeout(),
            self.datastore
                .list_active_sessions(&caller, &context.organization_id),
        )
        .await
        .map_err(|_| DatastoreError::Network("list_active_sessions timed out".to_string()))??;

        *self.session_list.lock() = Some(SessionListCache {
            organization_id: context.organization_id.clone(),
            fetched_at: Instant::now(),
            sessions: sessions.clone(),
        });
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DEFAULT_SERVICE_ID;
    use crate::identity::{Caller, StaticIdentity};
    use crate::model::AttendanceReceipt;
    use crate::radio::{Permission, SimulatedAir, SimulatedRadio};
    use crate::model::{CreateSessionRequest, CreatedSession};
    use crate::store::MockDatastore;
    use crate::token::hash_token;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    const NOW: u64 = 1_700_000_000;

    fn session(token: &str) -> SessionInfo {
        SessionInfo {
            token: token.to_string(),
            event_id: format!("evt-{}", token),
            organization_id: "org-b".to_string(),
            organization_code: 2,
            event_title: format!("Meeting {}", token),
            starts_at: NOW - 10,
            ends_at: NOW + 3600,
            creator_id: "officer".to_string(),
        }
    }

    fn context() -> OrgContext {
        OrgContext::new("org-b", 2)
    }

    fn payload(organization_code: u16, token: &str) -> BeaconPayload {
        BeaconPayload::new(
            DEFAULT_SERVICE_ID.hyphenated().to_string(),
            organization_code,
            hash_token(token).value(),
        )
    }

    struct Harness {
        controller: ScanController,
        radio: Arc<SimulatedRadio>,
        air: Arc<SimulatedAir>,
        events: Arc<Mutex<Vec<ScanEvent>>>,
        clock: Arc<ManualClock>,
    }

    fn harness(mock: MockDatastore, config: ProximityConfig) -> Harness {
        harness_with(Arc::new(mock), config)
    }

    fn harness_with(datastore: Arc<dyn Datastore>, config: ProximityConfig) -> Harness {
        let air = SimulatedAir::new();
        let radio = air.attach("scanner", -61);
        let clock = Arc::new(ManualClock::new(NOW));
        let identity = Arc::new(StaticIdentity::new(
            Caller::new("member-1").with_membership("org-b", 2),
        ));
        let submitter = Arc::new(AttendanceSubmitter::new(
            datastore.clone(),
            identity.clone(),
            &config,
        ));
        let controller = ScanController::with_clock(
            radio.clone(),
            BeaconCodec::from_config(&config),
            datastore,
            identity,
            submitter,
            config,
            clock.clone(),
        );

        let sink = controller.clone();
        radio.set_on_beacon_detected(Box::new(move |payload, rssi, ts| {
            sink.handle_beacon_detected(payload, rssi, ts)
        }));
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorder = events.clone();
        controller.set_on_event(Box::new(move |event| recorder.lock().push(event)));

        Harness {
            controller,
            radio,
            air,
            events,
            clock,
        }
    }

    /// Let the worker and submission tasks run
    async fn settle() {
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn receipt() -> Result<AttendanceReceipt, DatastoreError> {
        Ok(AttendanceReceipt {
            attendance_id: "att-1".to_string(),
        })
    }

    /// Datastore whose list and record calls wait on a gate until the test
    /// opens it
    struct GatedDatastore {
        sessions: Vec<SessionInfo>,
        list_gate: Option<Arc<Notify>>,
        record_gate: Option<Arc<Notify>>,
        list_calls: AtomicUsize,
        record_calls: AtomicUsize,
    }

    impl GatedDatastore {
        fn new(sessions: Vec<SessionInfo>) -> Self {
            Self {
                sessions,
                list_gate: None,
                record_gate: None,
                list_calls: AtomicUsize::new(0),
                record_calls: AtomicUsize::new(0),
            }
        }

        fn with_list_gate(mut self, gate: Arc<Notify>) -> Self {
            self.list_gate = Some(gate);
            self
        }

        fn with_record_gate(mut self, gate: Arc<Notify>) -> Self {
            self.record_gate = Some(gate);
            self
        }

        fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }

        fn record_calls(&self) -> usize {
            self.record_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Datastore for GatedDatastore {
        async fn create_session(
            &self,
            _caller: &Caller,
            _request: CreateSessionRequest,
        ) -> Result<CreatedSession, DatastoreError> {
            Err(DatastoreError::Network("not served here".into()))
        }

        async fn resolve_session(
            &self,
            _caller: &Caller,
            _token: &str,
        ) -> Result<SessionInfo, DatastoreError> {
            Err(DatastoreError::Network("not served here".into()))
        }

        async fn list_active_sessions(
            &self,
            _caller: &Caller,
            _organization_id: &str,
        ) -> Result<Vec<SessionInfo>, DatastoreError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.list_gate {
                gate.notified().await;
            }
            Ok(self.sessions.clone())
        }

        async fn record_attendance(
            &self,
            _caller: &Caller,
            _token: &str,
        ) -> Result<AttendanceReceipt, DatastoreError> {
            self.record_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.record_gate {
                gate.notified().await;
            }
            receipt()
        }

        async fn terminate_session(
            &self,
            _caller: &Caller,
            _token: &str,
        ) -> Result<(), DatastoreError> {
            Ok(())
        }
    }

    fn has_outcome_events(events: &[ScanEvent]) -> bool {
        events.iter().any(|e| {
            matches!(
                e,
                ScanEvent::SessionDetected(_) | ScanEvent::AttendanceResult { .. }
            )
        })
    }

    #[tokio::test]
    async fn test_burst_of_sightings_submits_once() {
        let mut mock = MockDatastore::new();
        mock.expect_list_active_sessions()
            .returning(|_, _| Ok(vec![session("BN4F9UJLPQ88")]));
        mock.expect_record_attendance()
            .withf(|_, token| token == "BN4F9UJLPQ88")
            .times(1)
            .returning(|_, _| receipt());
        let h = harness(mock, ProximityConfig::default());

        h.controller.start(Some(context())).await.unwrap();
        for _ in 0..50 {
            h.air.inject(payload(2, "BN4F9UJLPQ88"));
        }
        settle().await;

        let detected = h.controller.detected_sessions();
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].status, AttendanceStatus::Present);
        assert_eq!(detected[0].signal_strength, -61);
    }

    #[tokio::test]
    async fn test_foreign_and_other_org_beacons_are_ignored() {
        let mut mock = MockDatastore::new();
        mock.expect_list_active_sessions().times(0);
        mock.expect_record_attendance().times(0);
        let h = harness(mock, ProximityConfig::default());

        h.controller.start(Some(context())).await.unwrap();
        h.air.inject(BeaconPayload::new(
            "6f2a91c4-5e3b-4d8a-b7c1-0e942f5da319",
            2,
            17693,
        ));
        h.air.inject(payload(1, "BN4F9UJLPQ88"));
        h.air.inject(payload(7, "BN4F9UJLPQ88"));
        settle().await;

        assert!(h.controller.detected_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_context_replay_preserves_order() {
        let mut mock = MockDatastore::new();
        mock.expect_list_active_sessions()
            .returning(|_, _| Ok(vec![session("ABCDEFGHJKLM"), session("BN4F9UJLPQ88")]));
        mock.expect_record_attendance().returning(|_, _| receipt());
        let h = harness(mock, ProximityConfig::default());

        h.controller.start(None).await.unwrap();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        h.air.inject(payload(2, "ABCDEFGHJKLM"));
        settle().await;
        assert_eq!(h.controller.pending_beacons(), 2);
        assert!(h.controller.detected_sessions().is_empty());

        h.controller.set_org_context(context());
        settle().await;
        assert_eq!(h.controller.pending_beacons(), 0);

        let order: Vec<String> = h
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ScanEvent::SessionDetected(d) => Some(d.session.token.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["BN4F9UJLPQ88", "ABCDEFGHJKLM"]);
    }

    #[tokio::test]
    async fn test_replay_cache_is_bounded() {
        let mock = MockDatastore::new();
        let config = ProximityConfig {
            org_context_cache_capacity: 3,
            ..Default::default()
        };
        let h = harness(mock, config);

        h.controller.start(None).await.unwrap();
        for minor in 0..10u16 {
            h.air.inject(BeaconPayload::new(
                DEFAULT_SERVICE_ID.hyphenated().to_string(),
                2,
                minor,
            ));
        }
        assert_eq!(h.controller.pending_beacons(), 3);
    }

    #[tokio::test]
    async fn test_colliding_sessions_are_reported_not_submitted() {
        let mut mock = MockDatastore::new();
        mock.expect_list_active_sessions()
            .returning(|_, _| Ok(vec![session("BN4F9UJLPQ88"), session("MSTTDGDKVMAW")]));
        mock.expect_record_attendance().times(0);
        let h = harness(mock, ProximityConfig::default());

        h.controller.start(Some(context())).await.unwrap();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        h.air.inject(payload(2, "MSTTDGDKVMAW"));
        settle().await;

        assert!(h.controller.detected_sessions().is_empty());
        let ambiguous: Vec<_> = h
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ScanEvent::AmbiguousBeacon {
                    token_hash,
                    candidates,
                    ..
                } => Some((*token_hash, candidates.len())),
                _ => None,
            })
            .collect();
        assert_eq!(ambiguous, vec![(TokenHash(17693), 2)]);
    }

    #[tokio::test]
    async fn test_expired_session_is_not_detected() {
        let mut mock = MockDatastore::new();
        mock.expect_list_active_sessions().returning(|_, _| {
            let mut s = session("BN4F9UJLPQ88");
            s.ends_at = NOW;
            Ok(vec![s])
        });
        mock.expect_record_attendance().times(0);
        let h = harness(mock, ProximityConfig::default());

        h.controller.start(Some(context())).await.unwrap();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        settle().await;

        assert!(h.controller.detected_sessions().is_empty());
        assert_eq!(h.clock.now_secs(), NOW);
    }

    #[tokio::test]
    async fn test_manual_confirmation() {
        let mut mock = MockDatastore::new();
        mock.expect_list_active_sessions()
            .returning(|_, _| Ok(vec![session("BN4F9UJLPQ88")]));
        mock.expect_record_attendance()
            .times(1)
            .returning(|_, _| receipt());
        let config = ProximityConfig {
            auto_submit: false,
            ..Default::default()
        };
        let h = harness(mock, config);

        h.controller.start(Some(context())).await.unwrap();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        settle().await;

        let detected = h.controller.detected_sessions();
        assert_eq!(detected[0].status, AttendanceStatus::AwaitingConfirmation);

        let outcome = h.controller.confirm("BN4F9UJLPQ88").await.unwrap();
        assert!(outcome.is_present());
        assert_eq!(
            h.controller.detected_sessions()[0].status,
            AttendanceStatus::Present
        );
        assert!(matches!(
            h.controller.confirm("BN4F9UJLPQ88").await,
            Err(ScanError::NotDetected(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_discards_queued_work() {
        let mut mock = MockDatastore::new();
        mock.expect_list_active_sessions().times(0);
        mock.expect_record_attendance().times(0);
        let h = harness(mock, ProximityConfig::default());

        h.controller.start(Some(context())).await.unwrap();
        let epoch = h.controller.epoch();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        h.controller.stop().await;
        settle().await;

        assert!(h.controller.epoch() > epoch);
        assert_eq!(h.controller.state(), ScanState::Idle);
        assert!(h.controller.detected_sessions().is_empty());
        assert!(!h.radio.is_scanning());
    }

    #[tokio::test]
    async fn test_resolution_finishing_after_stop_is_discarded() {
        let gate = Arc::new(Notify::new());
        let datastore = Arc::new(
            GatedDatastore::new(vec![session("BN4F9UJLPQ88")]).with_list_gate(gate.clone()),
        );
        let h = harness_with(datastore.clone(), ProximityConfig::default());

        h.controller.start(Some(context())).await.unwrap();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        settle().await;
        assert_eq!(datastore.list_calls(), 1);

        h.controller.stop().await;
        gate.notify_one();
        settle().await;

        assert!(h.controller.detected_sessions().is_empty());
        assert_eq!(datastore.record_calls(), 0);
        assert!(!has_outcome_events(&h.events.lock()));
    }

    #[tokio::test]
    async fn test_submission_finishing_after_stop_is_discarded() {
        let gate = Arc::new(Notify::new());
        let datastore = Arc::new(
            GatedDatastore::new(vec![session("BN4F9UJLPQ88")]).with_record_gate(gate.clone()),
        );
        let h = harness_with(datastore.clone(), ProximityConfig::default());

        h.controller.start(Some(context())).await.unwrap();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        settle().await;
        assert_eq!(datastore.record_calls(), 1);
        assert_eq!(
            h.controller.detected_sessions()[0].status,
            AttendanceStatus::Submitting
        );

        h.controller.stop().await;
        h.events.lock().clear();
        gate.notify_one();
        settle().await;

        assert!(h.controller.detected_sessions().is_empty());
        assert!(!has_outcome_events(&h.events.lock()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_list_timeout_leaves_beacon_retryable() {
        let gate = Arc::new(Notify::new());
        let datastore = Arc::new(
            GatedDatastore::new(vec![session("BN4F9UJLPQ88")]).with_list_gate(gate.clone()),
        );
        let config = ProximityConfig {
            request_timeout_secs: 2,
            ..Default::default()
        };
        let h = harness_with(datastore.clone(), config);

        h.controller.start(Some(context())).await.unwrap();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(datastore.list_calls(), 1);
        assert!(h.controller.detected_sessions().is_empty());
        assert!(!has_outcome_events(&h.events.lock()));

        // The timed-out fetch dropped its waiter, so this permit serves the
        // next fetch
        gate.notify_one();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        settle().await;

        assert_eq!(datastore.list_calls(), 2);
        let detected = h.controller.detected_sessions();
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].status, AttendanceStatus::Present);
    }

    #[tokio::test]
    async fn test_rescan_inside_window_reports_present() {
        let mut mock = MockDatastore::new();
        mock.expect_list_active_sessions()
            .returning(|_, _| Ok(vec![session("BN4F9UJLPQ88")]));
        mock.expect_record_attendance()
            .times(1)
            .returning(|_, _| receipt());
        let h = harness(mock, ProximityConfig::default());

        h.controller.start(Some(context())).await.unwrap();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        settle().await;
        h.controller.stop().await;

        h.controller.start(Some(context())).await.unwrap();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        settle().await;

        let detected = h.controller.detected_sessions();
        assert_eq!(detected[0].status, AttendanceStatus::Present);
        let last = h.events.lock().iter().rev().find_map(|e| match e {
            ScanEvent::AttendanceResult { result, .. } => Some(result.clone()),
            _ => None,
        });
        assert_eq!(last, Some(Ok(SubmitOutcome::AlreadyRecorded)));
    }

    #[tokio::test]
    async fn test_network_failure_retries_on_next_sighting() {
        let mut mock = MockDatastore::new();
        mock.expect_list_active_sessions()
            .returning(|_, _| Ok(vec![session("BN4F9UJLPQ88")]));
        let mut calls = 0;
        mock.expect_record_attendance().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Err(DatastoreError::Network("offline".into()))
            } else {
                receipt()
            }
        });
        let h = harness(mock, ProximityConfig::default());

        h.controller.start(Some(context())).await.unwrap();
        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        settle().await;
        assert!(matches!(
            h.controller.detected_sessions()[0].status,
            AttendanceStatus::Failed(SubmitError::Network(_))
        ));

        h.air.inject(payload(2, "BN4F9UJLPQ88"));
        settle().await;
        assert_eq!(
            h.controller.detected_sessions()[0].status,
            AttendanceStatus::Present
        );
    }

    #[tokio::test]
    async fn test_scan_requires_permissions() {
        let h = harness(MockDatastore::new(), ProximityConfig::default());
        h.radio.deny_permission(Permission::Location);

        let result = h.controller.start(Some(context())).await;
        assert_eq!(
            result,
            Err(ScanError::Radio(RadioError::PermissionDenied(
                Permission::Location
            )))
        );
        assert_eq!(h.controller.state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_radio_loss_returns_to_idle() {
        let h = harness(MockDatastore::new(), ProximityConfig::default());
        let watcher = h.controller.clone();
        h.radio
            .set_on_radio_state_changed(Box::new(move |s| watcher.handle_radio_state_changed(s)));

        h.controller.start(Some(context())).await.unwrap();
        h.radio.set_state(RadioState::PoweredOff);

        assert_eq!(h.controller.state(), ScanState::Idle);
        assert!(h
            .events
            .lock()
            .contains(&ScanEvent::StateChanged(ScanState::Idle)));
    }
}

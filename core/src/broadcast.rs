//! Broadcaster lifecycle
//!
//! ```text
//! Idle -> Starting -> Advertising -> Stopping -> Idle
//!            \                \
//!             -> Failed        -> Failed (radio left poweredOn)
//! ```
//!
//! Every `start`/`stop` bumps the controller epoch; an `advertise` completion
//! that returns under an older epoch is discarded instead of overwriting the
//! newer state.

use crate::beacon::{BeaconCodec, CodecError};
use crate::clock::{Clock, SystemClock};
use crate::model::SessionInfo;
use crate::radio::{RadioAdapter, RadioError, RadioState};
use crate::token::hash_token;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BroadcastError {
    #[error("Radio is not ready (state: {0})")]
    RadioNotReady(RadioState),
    #[error("Radio rejected the advertisement: {0}")]
    Radio(#[from] RadioError),
    #[error("Cannot encode beacon: {0}")]
    Codec(#[from] CodecError),
    #[error("Session has already ended")]
    SessionEnded,
    #[error("Platform adapter failure: {0}")]
    Adapter(String),
    #[error("Superseded by a newer start or stop")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastState {
    Idle,
    Starting,
    Advertising,
    Stopping,
    Failed(BroadcastError),
}

impl BroadcastState {
    fn is_active(&self) -> bool {
        matches!(self, BroadcastState::Starting | BroadcastState::Advertising)
    }
}

impl fmt::Display for BroadcastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BroadcastState::Idle => write!(f, "idle"),
            BroadcastState::Starting => write!(f, "starting"),
            BroadcastState::Advertising => write!(f, "advertising"),
            BroadcastState::Stopping => write!(f, "stopping"),
            BroadcastState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

pub type BroadcastStateCallback = Box<dyn Fn(BroadcastState) + Send + Sync>;

struct Inner {
    state: BroadcastState,
    session: Option<SessionInfo>,
}

/// Drives one advertisement at a time on a shared radio
///
/// Cloning yields another handle onto the same controller.
#[derive(Clone)]
pub struct BroadcastController {
    radio: Arc<dyn RadioAdapter>,
    codec: BeaconCodec,
    clock: Arc<dyn Clock>,
    inner: Arc<RwLock<Inner>>,
    epoch: Arc<AtomicU64>,
    expiry_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    on_state_changed: Arc<RwLock<Option<Arc<BroadcastStateCallback>>>>,
}

impl BroadcastController {
    pub fn new(radio: Arc<dyn RadioAdapter>, codec: BeaconCodec) -> Self {
        Self::with_clock(radio, codec, Arc::new(SystemClock))
    }

    pub fn with_clock(radio: Arc<dyn RadioAdapter>, codec: BeaconCodec, clock: Arc<dyn Clock>) -> Self {
        Self {
            radio,
            codec,
            clock,
            inner: Arc::new(RwLock::new(Inner {
                state: BroadcastState::Idle,
                session: None,
            })),
            epoch: Arc::new(AtomicU64::new(0)),
            expiry_task: Arc::new(Mutex::new(None)),
            on_state_changed: Arc::new(RwLock::new(None)),
        }
    }

    pub fn state(&self) -> BroadcastState {
        self.inner.read().state.clone()
    }

    /// Session currently being advertised (or starting)
    pub fn current_session(&self) -> Option<SessionInfo> {
        self.inner.read().session.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn set_on_state_changed(&self, callback: BroadcastStateCallback) {
        *self.on_state_changed.write() = Some(Arc::new(callback));
    }

    /// Start advertising `session`.
    ///
    /// Restarting the session already on the air is a no-op; a different
    /// session replaces the current one (stop, then start).
    pub async fn start(&self, session: &SessionInfo) -> Result<(), BroadcastError> {
        let (replacing, same_session) = {
            let inner = self.inner.read();
            let same = inner.state.is_active()
                && inner.session.as_ref().map(|s| s.token.as_str()) == Some(session.token.as_str());
            (inner.state.is_active(), same)
        };
        if same_session {
            debug!("Broadcast for {} already running", session.event_title);
            return Ok(());
        }
        if replacing {
            info!("Replacing active broadcast with {}", session.event_title);
            self.stop().await;
        }

        let epoch = self.begin(BroadcastState::Starting, Some(session.clone()));

        let radio_state = self.radio.state();
        if radio_state != RadioState::PoweredOn {
            let err = BroadcastError::RadioNotReady(radio_state);
            warn!("Cannot broadcast: {}", err);
            self.transition(epoch, BroadcastState::Failed(err.clone()));
            return Err(err);
        }

        let now = self.clock.now_secs();
        if now >= session.ends_at {
            self.transition(epoch, BroadcastState::Failed(BroadcastError::SessionEnded));
            return Err(BroadcastError::SessionEnded);
        }

        let payload = match self
            .codec
            .encode(session.organization_code, hash_token(&session.token))
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Refusing to broadcast: {}", e);
                let err = BroadcastError::from(e);
                self.transition(epoch, BroadcastState::Failed(err.clone()));
                return Err(err);
            }
        };

        let result = self.radio.advertise(&payload).await;

        if self.epoch() != epoch {
            debug!("Discarding stale advertise completion (epoch {})", epoch);
            if result.is_ok() && !self.inner.read().state.is_active() {
                // Stopped while advertise was in flight
                if let Err(e) = self.radio.stop_advertising().await {
                    warn!("Failed to withdraw stale advertisement: {}", e);
                }
            }
            return Err(BroadcastError::Cancelled);
        }

        match result {
            Ok(()) => {
                info!(
                    "Broadcasting {} (org {}, hash {})",
                    session.event_title,
                    session.organization_code,
                    hash_token(&session.token)
                );
                self.transition(epoch, BroadcastState::Advertising);
                self.schedule_expiry(epoch, session.remaining_secs(now));
                Ok(())
            }
            Err(e) => {
                warn!("Radio rejected advertisement: {}", e);
                let err = BroadcastError::Radio(e);
                self.transition(epoch, BroadcastState::Failed(err.clone()));
                Err(err)
            }
        }
    }

    /// Stop advertising. Ends in `Idle` whatever the radio reports.
    pub async fn stop(&self) {
        let epoch = {
            let mut inner = self.inner.write();
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            if inner.state == BroadcastState::Idle {
                return;
            }
            inner.state = BroadcastState::Stopping;
            epoch
        };
        self.notify(BroadcastState::Stopping);
        self.cancel_expiry();

        if let Err(e) = self.radio.stop_advertising().await {
            warn!("stop_advertising failed, treating broadcast as stopped: {}", e);
        }

        {
            let mut inner = self.inner.write();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            inner.session = None;
        }
        self.transition(epoch, BroadcastState::Idle);
        info!("Broadcast stopped");
    }

    /// React to a platform radio state change
    pub fn handle_radio_state_changed(&self, state: RadioState) {
        if state == RadioState::PoweredOn {
            return;
        }
        if !self.inner.read().state.is_active() {
            return;
        }
        warn!("Radio went {} while broadcasting", state);
        self.fail(BroadcastError::RadioNotReady(state));
    }

    /// Record a failure reported from outside the controller (a crashed
    /// platform callback, for instance)
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Broadcast marked failed: {}", reason);
        self.fail(BroadcastError::Adapter(reason));
    }

    fn fail(&self, err: BroadcastError) {
        let epoch = self.begin(BroadcastState::Failed(err), None);
        debug!("Broadcast failed at epoch {}", epoch);
        self.cancel_expiry();
    }

    /// Bump the epoch and enter `state`
    fn begin(&self, state: BroadcastState, session: Option<SessionInfo>) -> u64 {
        let epoch = {
            let mut inner = self.inner.write();
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            inner.state = state.clone();
            if session.is_some() || !inner.state.is_active() {
                inner.session = session;
            }
            epoch
        };
        self.notify(state);
        epoch
    }

    /// Enter `state` if no newer start/stop has happened
    fn transition(&self, epoch: u64, state: BroadcastState) -> bool {
        {
            let mut inner = self.inner.write();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            inner.state = state.clone();
        }
        self.notify(state);
        true
    }

    fn notify(&self, state: BroadcastState) {
        let callback = self.on_state_changed.read().clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }

    fn schedule_expiry(&self, epoch: u64, remaining_secs: u64) {
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(remaining_secs)).await;
            // Detach ourselves so stop() does not abort this task mid-flight
            controller.expiry_task.lock().take();
            if controller.epoch() == epoch {
                info!("Session window closed, ending broadcast");
                controller.stop().await;
            }
        });
        if let Some(previous) = self.expiry_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_expiry(&self) {
        if let Some(handle) = self.expiry_task.lock().take() {
            handle.abort();
        }
    }
}

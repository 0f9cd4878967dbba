//! In-memory SIM gateway.
//!
//! Serves a [`CardProfile`] from memory and delivers native status events on
//! a dedicated worker thread, the same way a telephony daemon would call back
//! from its own event loop. Used for embedded simulation, tests, and as the
//! reference implementation of [`SimGateway`].

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::config::{BackendConfig, ConfigError, GatewayConfig, SimConfig};
use crate::gateway::traits::{
    CphsInfo, ConnectionId, GatewayError, ImsiInfo, NotificationSink, SimGateway,
};
use crate::state::NativeStatus;

fn lock_err(context: &'static str) -> GatewayError {
    GatewayError::Backend(format!("poisoned lock: {context}"))
}

/// Contents of a simulated SIM card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CardProfile {
    /// Current native card status.
    pub status: NativeStatus,
    /// Integrated Circuit Card identifier.
    pub iccid: String,
    /// IMSI parts.
    pub imsi: ImsiInfo,
    /// Service Provider Name; empty when not stored on the card.
    pub spn: String,
    /// CPHS operator name, full form; empty when absent.
    pub operator_full_name: String,
    /// CPHS operator name, short form; empty when absent.
    pub operator_short_name: String,
    /// Subscriber number (MSISDN); empty when absent.
    pub subscriber_number: String,
}

impl Default for CardProfile {
    fn default() -> Self {
        Self {
            status: NativeStatus::SimInitCompleted,
            iccid: String::new(),
            imsi: ImsiInfo::default(),
            spn: String::new(),
            operator_full_name: String::new(),
            operator_short_name: String::new(),
            subscriber_number: String::new(),
        }
    }
}

impl CardProfile {
    /// Parse a profile from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a profile from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }
}

/// Gateway operations that can be made to fail on demand.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    Connect,
    QueryInitStatus,
    RegisterNotifications,
    DeregisterNotifications,
    ReadIccid,
    ReadImsi,
    ReadSpn,
    ReadCphsInfo,
    ReadSubscriberNumber,
}

impl GatewayOp {
    const fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::QueryInitStatus => "query_init_status",
            Self::RegisterNotifications => "register_notifications",
            Self::DeregisterNotifications => "deregister_notifications",
            Self::ReadIccid => "read_iccid",
            Self::ReadImsi => "read_imsi",
            Self::ReadSpn => "read_spn",
            Self::ReadCphsInfo => "read_cphs_info",
            Self::ReadSubscriberNumber => "read_subscriber_number",
        }
    }
}

struct Registration {
    conn: ConnectionId,
    sink: NotificationSink,
}

#[derive(Default)]
struct GatewayState {
    profile: CardProfile,
    connections: HashSet<ConnectionId>,
    registration: Option<Registration>,
    failing: HashSet<GatewayOp>,
}

impl GatewayState {
    fn check(&self, op: GatewayOp, conn: ConnectionId) -> Result<(), GatewayError> {
        if !self.connections.contains(&conn) {
            return Err(GatewayError::UnknownConnection(conn));
        }
        if self.failing.contains(&op) {
            return Err(GatewayError::Backend(format!("injected failure: {}", op.name())));
        }
        Ok(())
    }
}

enum DeliveryMsg {
    Event(NativeStatus),
    Flush(Sender<()>),
}

/// Thread-safe in-memory gateway.
pub struct InMemoryGateway {
    state: Arc<RwLock<GatewayState>>,
    events_tx: Sender<DeliveryMsg>,
    dropped_events: AtomicU64,
    connect_attempts: AtomicU64,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for InMemoryGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryGateway")
            .field("open_connections", &self.open_connections())
            .field("registered", &self.is_registered())
            .field("dropped_events", &self.dropped_events())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new(&GatewayConfig::default(), CardProfile::default())
    }
}

impl InMemoryGateway {
    /// Create a gateway serving `profile` and start its delivery worker.
    ///
    /// # Panics
    /// If the delivery thread cannot be spawned.
    #[must_use]
    pub fn new(cfg: &GatewayConfig, profile: CardProfile) -> Self {
        let (events_tx, events_rx) = bounded::<DeliveryMsg>(cfg.notification_queue_capacity.max(1));

        let state = Arc::new(RwLock::new(GatewayState {
            profile,
            ..GatewayState::default()
        }));

        let thread_state = Arc::clone(&state);
        let join = thread::Builder::new()
            .name(cfg.delivery_thread_name.clone())
            .spawn(move || delivery_loop(&thread_state, &events_rx))
            .expect("failed to spawn simcard delivery worker");

        Self {
            state,
            events_tx,
            dropped_events: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            join: Mutex::new(Some(join)),
        }
    }

    /// Create a gateway with default settings serving `profile`.
    #[must_use]
    pub fn with_profile(profile: CardProfile) -> Self {
        Self::new(&GatewayConfig::default(), profile)
    }

    /// Create a gateway serving the profile stored at `path`.
    pub fn from_json_file(cfg: &GatewayConfig, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let profile = CardProfile::from_path(path)?;
        Ok(Self::new(cfg, profile))
    }

    /// Create the gateway described by an in-memory backend configuration.
    ///
    /// The card profile is loaded from the configured path, or an empty ready
    /// card is served when none is set.
    pub fn from_config(config: &SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        match &config.backend {
            BackendConfig::InMemory { profile } => {
                let profile = match profile {
                    Some(path) => CardProfile::from_path(path)?,
                    None => CardProfile::default(),
                };
                Ok(Self::new(&config.gateway, profile))
            }
        }
    }

    /// Snapshot of the served profile.
    pub fn profile(&self) -> Result<CardProfile, GatewayError> {
        let state = self.state.read().map_err(|_| lock_err("gateway.profile"))?;
        Ok(state.profile.clone())
    }

    /// Edit the served profile in place.
    ///
    /// No notification is emitted, even if `status` changes; use
    /// [`Self::set_status`] for that.
    pub fn update_profile(&self, edit: impl FnOnce(&mut CardProfile)) -> Result<(), GatewayError> {
        let mut state = self.state.write().map_err(|_| lock_err("gateway.update_profile"))?;
        edit(&mut state.profile);
        Ok(())
    }

    /// Change the card status and notify the registered sink.
    pub fn set_status(&self, status: NativeStatus) -> Result<(), GatewayError> {
        {
            let mut state = self.state.write().map_err(|_| lock_err("gateway.set_status"))?;
            state.profile.status = status;
        }
        debug!(%status, "card status changed");
        self.inject_event(status);
        Ok(())
    }

    /// Enqueue a raw native event without touching the profile.
    ///
    /// Useful to replay duplicate, stale or out-of-order notifications.
    pub fn inject_event(&self, status: NativeStatus) {
        match self.events_tx.try_send(DeliveryMsg::Event(status)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                warn!(%status, "notification queue full, event dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                error!(%status, "delivery worker stopped, event dropped");
            }
        }
    }

    /// Block until every event enqueued before this call has been delivered.
    pub fn flush(&self) -> Result<(), GatewayError> {
        let (reply_tx, reply_rx) = bounded::<()>(1);
        self.events_tx
            .send(DeliveryMsg::Flush(reply_tx))
            .map_err(|_| GatewayError::Backend("delivery worker stopped".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| GatewayError::Backend("delivery worker stopped".to_string()))
    }

    /// Make every subsequent call of `op` fail.
    pub fn fail(&self, op: GatewayOp) {
        if let Ok(mut state) = self.state.write() {
            state.failing.insert(op);
        }
    }

    /// Undo [`Self::fail`] for `op`.
    pub fn heal(&self, op: GatewayOp) {
        if let Ok(mut state) = self.state.write() {
            state.failing.remove(&op);
        }
    }

    /// Number of currently open connections.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state.read().map(|s| s.connections.len()).unwrap_or(0)
    }

    /// Whether a notification sink is registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.state.read().map(|s| s.registration.is_some()).unwrap_or(false)
    }

    /// Events dropped because the delivery queue was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Total `connect` calls, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    fn read<T>(
        &self,
        op: GatewayOp,
        conn: ConnectionId,
        project: impl FnOnce(&CardProfile) -> T,
    ) -> Result<T, GatewayError> {
        let state = self.state.read().map_err(|_| lock_err(op.name()))?;
        state.check(op, conn)?;
        Ok(project(&state.profile))
    }
}

impl SimGateway for InMemoryGateway {
    fn connect(&self) -> Result<ConnectionId, GatewayError> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().map_err(|_| lock_err("gateway.connect"))?;
        if state.failing.contains(&GatewayOp::Connect) {
            return Err(GatewayError::Unreachable("injected failure: connect".to_string()));
        }
        let conn = ConnectionId::new();
        state.connections.insert(conn);
        trace!(%conn, "connection opened");
        Ok(conn)
    }

    fn disconnect(&self, conn: ConnectionId) {
        let Ok(mut state) = self.state.write() else {
            return;
        };
        if state.registration.as_ref().is_some_and(|r| r.conn == conn) {
            state.registration = None;
        }
        if state.connections.remove(&conn) {
            trace!(%conn, "connection closed");
        }
    }

    fn query_init_status(&self, conn: ConnectionId) -> Result<NativeStatus, GatewayError> {
        self.read(GatewayOp::QueryInitStatus, conn, |p| p.status)
    }

    fn register_notifications(
        &self,
        conn: ConnectionId,
        sink: NotificationSink,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.write().map_err(|_| lock_err("gateway.register"))?;
        state.check(GatewayOp::RegisterNotifications, conn)?;
        if let Some(existing) = state.registration.as_ref() {
            return Err(GatewayError::AlreadyRegistered(existing.conn));
        }
        state.registration = Some(Registration { conn, sink });
        Ok(())
    }

    fn deregister_notifications(&self, conn: ConnectionId) -> Result<(), GatewayError> {
        let mut state = self.state.write().map_err(|_| lock_err("gateway.deregister"))?;
        state.check(GatewayOp::DeregisterNotifications, conn)?;
        match state.registration.as_ref() {
            Some(r) if r.conn == conn => {
                state.registration = None;
                Ok(())
            }
            _ => Err(GatewayError::NotRegistered(conn)),
        }
    }

    fn read_iccid(&self, conn: ConnectionId) -> Result<String, GatewayError> {
        self.read(GatewayOp::ReadIccid, conn, |p| p.iccid.clone())
    }

    fn read_imsi(&self, conn: ConnectionId) -> Result<ImsiInfo, GatewayError> {
        self.read(GatewayOp::ReadImsi, conn, |p| p.imsi.clone())
    }

    fn read_spn(&self, conn: ConnectionId) -> Result<String, GatewayError> {
        self.read(GatewayOp::ReadSpn, conn, |p| p.spn.clone())
    }

    fn read_cphs_info(&self, conn: ConnectionId) -> Result<CphsInfo, GatewayError> {
        self.read(GatewayOp::ReadCphsInfo, conn, |p| CphsInfo {
            full_name: p.operator_full_name.as_bytes().to_vec(),
            short_name: p.operator_short_name.as_bytes().to_vec(),
        })
    }

    fn read_subscriber_number(&self, conn: ConnectionId) -> Result<String, GatewayError> {
        self.read(GatewayOp::ReadSubscriberNumber, conn, |p| p.subscriber_number.clone())
    }
}

impl Drop for InMemoryGateway {
    fn drop(&mut self) {
        // Close the queue so the worker exits after draining.
        let (dummy_tx, _) = bounded::<DeliveryMsg>(1);
        drop(std::mem::replace(&mut self.events_tx, dummy_tx));

        if let Ok(mut guard) = self.join.lock() {
            // Detached: a sink may be dropping the gateway from the worker itself.
            drop(guard.take());
        }
    }
}

fn delivery_loop(state: &RwLock<GatewayState>, events_rx: &Receiver<DeliveryMsg>) {
    while let Ok(msg) = events_rx.recv() {
        match msg {
            DeliveryMsg::Event(status) => {
                // Clone the sink so it runs without the state lock held.
                let sink = match state.read() {
                    Ok(s) => s.registration.as_ref().map(|r| Arc::clone(&r.sink)),
                    Err(_) => None,
                };
                match sink {
                    Some(sink) => {
                        trace!(%status, "delivering native event");
                        if panic::catch_unwind(AssertUnwindSafe(|| sink(status))).is_err() {
                            error!(%status, "notification sink panicked");
                        }
                    }
                    None => trace!(%status, "no sink registered, event discarded"),
                }
            }
            DeliveryMsg::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

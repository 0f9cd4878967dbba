//! SIM state subscription manager.
//!
//! Owns at most one subscription and the gateway connection backing it. Raw
//! native events arrive on the gateway's delivery thread, are translated into
//! [`SimState`], and reach the caller's callback only when the state actually
//! changed.
//!
//! The subscription slot is guarded by a mutex; callbacks run outside of it.
//! While a callback runs, the delivering thread is recorded as in flight so
//! that `subscribe` (when replacing) and `unsubscribe` can wait for it to
//! finish before returning.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use tracing::{debug, error, info, trace, warn};

use crate::error::{SimError, SimResult};
use crate::gateway::{ConnectionId, GatewayError, NotificationSink, ScopedConnection, SimGateway};
use crate::state::{translate, NativeStatus, SimState};
use crate::stream::{self, SimStateStream};

/// Opaque caller data handed back to the callback untouched.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Callback invoked with the new state and the caller's data.
pub type StateCallback = Arc<dyn Fn(SimState, &UserData) + Send + Sync>;

struct Subscription {
    callback: StateCallback,
    user_data: UserData,
    previous_state: SimState,
}

#[derive(Default)]
struct Slot {
    connection: Option<ConnectionId>,
    registered: bool,
    subscription: Option<Subscription>,
    in_flight: Option<ThreadId>,
}

#[derive(Default)]
struct Shared {
    slot: Mutex<Slot>,
    idle: Condvar,
}

/// Manages the single SIM state subscription over a gateway.
pub struct StateSubscriptionManager {
    gateway: Arc<dyn SimGateway>,
    shared: Arc<Shared>,
}

impl fmt::Debug for StateSubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSubscriptionManager")
            .field("subscribed", &self.is_subscribed())
            .field("last_state", &self.last_state())
            .finish_non_exhaustive()
    }
}

impl StateSubscriptionManager {
    /// Create a manager over `gateway`. No connection is opened until needed.
    #[must_use]
    pub fn new(gateway: Arc<dyn SimGateway>) -> Self {
        Self {
            gateway,
            shared: Arc::new(Shared::default()),
        }
    }

    /// The gateway this manager talks to.
    #[must_use]
    pub fn gateway(&self) -> &Arc<dyn SimGateway> {
        &self.gateway
    }

    /// Register `callback` for state changes, replacing any earlier one.
    ///
    /// # Errors
    /// - `InvalidParameter` if `callback` is `None`; the gateway is not touched.
    /// - `OperationFailed` if connecting, seeding the initial state or arming
    ///   native notifications fails. Nothing acquired by this call is kept.
    pub fn subscribe(&self, callback: Option<StateCallback>, user_data: UserData) -> SimResult<()> {
        let Some(callback) = callback else {
            warn!("subscribe called without a callback");
            return Err(SimError::invalid_parameter("callback"));
        };
        self.install(move |_| (callback, user_data)).map(|_| ())
    }

    /// Subscribe with a bounded channel instead of a callback.
    ///
    /// Replaces any current subscription, like [`Self::subscribe`].
    pub fn subscribe_stream(&self, capacity: usize) -> SimResult<SimStateStream> {
        let mut stream = None;
        self.install(|initial| {
            let (callback, user_data, rx) = stream::channel(capacity, initial);
            stream = Some(rx);
            (callback, user_data)
        })?;
        stream.ok_or_else(|| SimError::operation_failed("subscribe_stream"))
    }

    fn install<F>(&self, make: F) -> SimResult<SimState>
    where
        F: FnOnce(SimState) -> (StateCallback, UserData),
    {
        let mut slot = self.lock("subscribe")?;

        let (conn, acquired_here) = match slot.connection {
            Some(conn) => (conn, false),
            None => {
                let conn = self.gateway.connect().map_err(|err| {
                    warn!(error = %err, "failed to connect to SIM backend");
                    SimError::backend("connect", err)
                })?;
                debug!(%conn, "subscription connection acquired");
                slot.connection = Some(conn);
                (conn, true)
            }
        };

        let status = match self.gateway.query_init_status(conn) {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "failed to read initial SIM status");
                if acquired_here {
                    slot.connection = None;
                    self.gateway.disconnect(conn);
                }
                return Err(SimError::backend("query_init_status", err));
            }
        };

        let initial = translate(status);
        let (callback, user_data) = make(initial);
        let replaced = slot
            .subscription
            .replace(Subscription {
                callback,
                user_data,
                previous_state: initial,
            })
            .is_some();

        if !slot.registered {
            if let Err(err) = self.gateway.register_notifications(conn, self.sink()) {
                warn!(error = %err, "failed to register for SIM status notifications");
                slot.subscription = None;
                slot.connection = None;
                self.gateway.disconnect(conn);
                return Err(SimError::backend("register_notifications", err));
            }
            slot.registered = true;
        }

        info!(%conn, state = %initial, replaced, "SIM state subscription installed");

        if replaced {
            self.wait_idle(slot);
        }
        Ok(initial)
    }

    /// Remove the subscription and release its connection.
    ///
    /// A no-op when nothing is subscribed. Teardown always completes; a failed
    /// native deregistration is still reported as `OperationFailed`.
    pub fn unsubscribe(&self) -> SimResult<()> {
        let mut slot = self.lock("unsubscribe")?;

        let Some(conn) = slot.connection.take() else {
            return Ok(());
        };

        let result = if slot.registered {
            self.gateway.deregister_notifications(conn).map_err(|err| {
                warn!(%conn, error = %err, "failed to deregister SIM status notifications");
                SimError::backend("deregister_notifications", err)
            })
        } else {
            Ok(())
        };

        slot.registered = false;
        slot.subscription = None;
        self.gateway.disconnect(conn);
        info!(%conn, "SIM state subscription removed");

        self.wait_idle(slot);
        result
    }

    /// Read the current SIM state.
    ///
    /// Reuses the subscription connection when one is held, otherwise opens
    /// and releases a connection of its own.
    pub fn get_state(&self) -> SimResult<SimState> {
        let held = self.lock("get_state")?.connection;

        if let Some(conn) = held {
            match self.gateway.query_init_status(conn) {
                Ok(status) => return Ok(translate(status)),
                // Torn down concurrently; fall back to a private connection.
                Err(GatewayError::UnknownConnection(_)) => {
                    debug!(%conn, "subscription connection closed during get_state");
                }
                Err(err) => {
                    warn!(error = %err, "failed to read SIM status");
                    return Err(SimError::backend("query_init_status", err));
                }
            }
        }

        let scoped = ScopedConnection::open(self.gateway.as_ref()).map_err(|err| {
            warn!(error = %err, "failed to connect to SIM backend");
            SimError::backend("connect", err)
        })?;
        let status = self.gateway.query_init_status(scoped.id()).map_err(|err| {
            warn!(error = %err, "failed to read SIM status");
            SimError::backend("query_init_status", err)
        })?;
        Ok(translate(status))
    }

    /// Whether a subscription is installed.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.shared
            .slot
            .lock()
            .map(|slot| slot.subscription.is_some())
            .unwrap_or(false)
    }

    /// The last state seen by the subscription, if any.
    #[must_use]
    pub fn last_state(&self) -> Option<SimState> {
        self.shared
            .slot
            .lock()
            .ok()
            .and_then(|slot| slot.subscription.as_ref().map(|s| s.previous_state))
    }

    fn lock(&self, context: &'static str) -> SimResult<MutexGuard<'_, Slot>> {
        self.shared.slot.lock().map_err(|_| {
            warn!(context, "subscription lock poisoned");
            SimError::operation_failed(context)
        })
    }

    fn sink(&self) -> NotificationSink {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        Arc::new(move |status: NativeStatus| {
            if let Some(shared) = shared.upgrade() {
                dispatch(&shared, status);
            }
        })
    }

    /// Block until no callback runs on another thread.
    fn wait_idle(&self, mut slot: MutexGuard<'_, Slot>) {
        let current = thread::current().id();
        while slot.in_flight.is_some_and(|t| t != current) {
            slot = match self.shared.idle.wait(slot) {
                Ok(slot) => slot,
                Err(_) => return,
            };
        }
    }
}

impl Drop for StateSubscriptionManager {
    fn drop(&mut self) {
        if let Err(err) = self.unsubscribe() {
            warn!(error = %err, "SIM state subscription teardown failed on drop");
        }
    }
}

/// Clears the in-flight marker, also when the callback unwinds.
struct InFlight<'a> {
    shared: &'a Shared,
    restore: Option<ThreadId>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.in_flight = self.restore;
        drop(slot);
        self.shared.idle.notify_all();
    }
}

fn dispatch(shared: &Shared, status: NativeStatus) {
    trace!(%status, "native SIM status event");
    let current = thread::current().id();

    let Ok(mut slot) = shared.slot.lock() else {
        return;
    };

    // One callback at a time, across delivery threads.
    while slot.in_flight.is_some_and(|t| t != current) {
        slot = match shared.idle.wait(slot) {
            Ok(slot) => slot,
            Err(_) => return,
        };
    }

    let Some(sub) = slot.subscription.as_mut() else {
        trace!(%status, "no subscription, event ignored");
        return;
    };

    let next = translate(status);
    if next == sub.previous_state {
        debug!(%status, state = %next, "unchanged SIM state suppressed");
        return;
    }

    let previous = std::mem::replace(&mut sub.previous_state, next);
    let callback = Arc::clone(&sub.callback);
    let user_data = Arc::clone(&sub.user_data);

    let restore = slot.in_flight.replace(current);
    drop(slot);
    let _in_flight = InFlight { shared, restore };

    debug!(%previous, state = %next, "SIM state changed");
    if panic::catch_unwind(AssertUnwindSafe(|| callback(next, &user_data))).is_err() {
        error!(%previous, state = %next, "SIM state callback panicked");
    }

    // Released before the in-flight marker clears.
    drop(user_data);
    drop(callback);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::gateway::{GatewayOp, InMemoryGateway};

    fn setup(status: NativeStatus) -> (Arc<InMemoryGateway>, StateSubscriptionManager) {
        let gw = Arc::new(InMemoryGateway::default());
        gw.update_profile(|p| p.status = status).unwrap();
        let manager = StateSubscriptionManager::new(Arc::clone(&gw) as Arc<dyn SimGateway>);
        (gw, manager)
    }

    fn recorder() -> (StateCallback, Arc<Mutex<Vec<SimState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb_seen = Arc::clone(&seen);
        let callback: StateCallback = Arc::new(move |state: SimState, _: &UserData| cb_seen.lock().unwrap().push(state));
        (callback, seen)
    }

    #[test]
    fn test_missing_callback_is_invalid_parameter() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        let err = manager.subscribe(None, Arc::new(())).unwrap_err();
        assert!(err.is_invalid_parameter());
        assert_eq!(gw.connect_attempts(), 0);
        assert!(!manager.is_subscribed());
    }

    #[test]
    fn test_subscribe_seeds_initial_state() {
        let (gw, manager) = setup(NativeStatus::SimPinRequired);
        let (callback, seen) = recorder();
        manager.subscribe(Some(callback), Arc::new(())).unwrap();

        assert_eq!(manager.last_state(), Some(SimState::Locked));
        assert!(gw.is_registered());
        assert_eq!(gw.open_connections(), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_states_suppressed() {
        let (gw, manager) = setup(NativeStatus::SimInitializing);
        let (callback, seen) = recorder();
        manager.subscribe(Some(callback), Arc::new(())).unwrap();

        for status in [
            NativeStatus::SimInitCompleted,
            NativeStatus::SimInitCompleted,
            NativeStatus::SimPinRequired,
            NativeStatus::SimPukRequired,
            NativeStatus::SimLockRequired,
            NativeStatus::SimInitCompleted,
        ] {
            gw.inject_event(status);
        }
        gw.flush().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![SimState::Available, SimState::Locked, SimState::Available]
        );
    }

    #[test]
    fn test_user_data_passed_through() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        let seen = Arc::new(Mutex::new(None));
        let cb_seen = Arc::clone(&seen);
        let callback: StateCallback = Arc::new(move |_: SimState, data: &UserData| {
            *cb_seen.lock().unwrap() = data.downcast_ref::<&str>().copied();
        });
        manager
            .subscribe(Some(callback), Arc::new("sim_state_changed_test"))
            .unwrap();

        gw.set_status(NativeStatus::CardRemoved).unwrap();
        gw.flush().unwrap();
        assert_eq!(*seen.lock().unwrap(), Some("sim_state_changed_test"));
    }

    #[test]
    fn test_unsubscribe_without_subscription_is_noop() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        manager.unsubscribe().unwrap();
        manager.unsubscribe().unwrap();
        assert_eq!(gw.connect_attempts(), 0);
    }

    #[test]
    fn test_unsubscribe_releases_everything() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        let (callback, seen) = recorder();
        manager.subscribe(Some(callback), Arc::new(())).unwrap();
        manager.unsubscribe().unwrap();

        assert!(!gw.is_registered());
        assert_eq!(gw.open_connections(), 0);
        assert!(!manager.is_subscribed());

        gw.set_status(NativeStatus::CardRemoved).unwrap();
        gw.flush().unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_deregistration_still_tears_down() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        let (callback, _) = recorder();
        manager.subscribe(Some(callback), Arc::new(())).unwrap();

        gw.fail(GatewayOp::DeregisterNotifications);
        let err = manager.unsubscribe().unwrap_err();
        assert!(err.is_operation_failed());
        assert_eq!(gw.open_connections(), 0);
        assert!(!gw.is_registered());
        assert!(!manager.is_subscribed());
    }

    #[test]
    fn test_connect_failure() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        gw.fail(GatewayOp::Connect);
        let (callback, _) = recorder();
        let err = manager.subscribe(Some(callback), Arc::new(())).unwrap_err();
        assert!(err.is_operation_failed());
        assert!(!manager.is_subscribed());
    }

    #[test]
    fn test_initial_query_failure_releases_connection() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        gw.fail(GatewayOp::QueryInitStatus);
        let (callback, _) = recorder();
        assert!(manager.subscribe(Some(callback), Arc::new(())).is_err());
        assert_eq!(gw.open_connections(), 0);
        assert!(!manager.is_subscribed());
    }

    #[test]
    fn test_registration_failure_clears_subscription() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        gw.fail(GatewayOp::RegisterNotifications);
        let (callback, _) = recorder();
        let err = manager.subscribe(Some(callback), Arc::new(())).unwrap_err();
        assert!(err.is_operation_failed());
        assert_eq!(gw.open_connections(), 0);
        assert!(!manager.is_subscribed());

        gw.heal(GatewayOp::RegisterNotifications);
        let (callback, _) = recorder();
        manager.subscribe(Some(callback), Arc::new(())).unwrap();
        assert!(gw.is_registered());
    }

    #[test]
    fn test_resubscribe_keeps_single_registration() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        let (first, first_seen) = recorder();
        let (second, second_seen) = recorder();
        manager.subscribe(Some(first), Arc::new(())).unwrap();
        manager.subscribe(Some(second), Arc::new(())).unwrap();

        assert_eq!(gw.open_connections(), 1);
        assert_eq!(gw.connect_attempts(), 1);

        gw.set_status(NativeStatus::CardRemoved).unwrap();
        gw.flush().unwrap();
        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(*second_seen.lock().unwrap(), vec![SimState::Unavailable]);
    }

    #[test]
    fn test_failed_resubscribe_keeps_existing() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        let (first, first_seen) = recorder();
        manager.subscribe(Some(first), Arc::new(())).unwrap();

        gw.fail(GatewayOp::QueryInitStatus);
        let (second, _) = recorder();
        assert!(manager.subscribe(Some(second), Arc::new(())).is_err());
        gw.heal(GatewayOp::QueryInitStatus);

        assert_eq!(gw.open_connections(), 1);
        gw.set_status(NativeStatus::CardRemoved).unwrap();
        gw.flush().unwrap();
        assert_eq!(*first_seen.lock().unwrap(), vec![SimState::Unavailable]);
    }

    #[test]
    fn test_get_state_reuses_subscription_connection() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        assert_eq!(manager.get_state().unwrap(), SimState::Available);
        assert_eq!(gw.open_connections(), 0);

        let (callback, _) = recorder();
        manager.subscribe(Some(callback), Arc::new(())).unwrap();
        let attempts = gw.connect_attempts();
        assert_eq!(manager.get_state().unwrap(), SimState::Available);
        assert_eq!(gw.connect_attempts(), attempts);
    }

    #[test]
    fn test_get_state_query_failure() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        gw.fail(GatewayOp::QueryInitStatus);
        assert!(manager.get_state().unwrap_err().is_operation_failed());
        assert_eq!(gw.open_connections(), 0);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let gw = Arc::new(InMemoryGateway::default());
        let manager = Arc::new(StateSubscriptionManager::new(Arc::clone(&gw) as Arc<dyn SimGateway>));

        let calls = Arc::new(AtomicUsize::new(0));
        let cb_calls = Arc::clone(&calls);
        let weak = Arc::downgrade(&manager);
        let callback: StateCallback = Arc::new(move |_: SimState, _: &UserData| {
            cb_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(manager) = weak.upgrade() {
                manager.unsubscribe().unwrap();
            }
        });
        manager.subscribe(Some(callback), Arc::new(())).unwrap();

        gw.set_status(NativeStatus::CardRemoved).unwrap();
        gw.set_status(NativeStatus::SimInitCompleted).unwrap();
        gw.flush().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!manager.is_subscribed());
        assert_eq!(gw.open_connections(), 0);
    }

    #[test]
    fn test_drop_tears_down_subscription() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        let (callback, _) = recorder();
        manager.subscribe(Some(callback), Arc::new(())).unwrap();
        drop(manager);
        assert_eq!(gw.open_connections(), 0);
        assert!(!gw.is_registered());
    }

    #[test]
    fn test_panicking_callback_keeps_delivery_alive() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        let callback: StateCallback = Arc::new(|_: SimState, _: &UserData| panic!("callback failure"));
        manager.subscribe(Some(callback), Arc::new(())).unwrap();

        gw.set_status(NativeStatus::CardRemoved).unwrap();
        gw.flush().unwrap();
        assert_eq!(manager.last_state(), Some(SimState::Unavailable));

        let (callback, seen) = recorder();
        manager.subscribe(Some(callback), Arc::new(())).unwrap();
        gw.set_status(NativeStatus::SimPinRequired).unwrap();
        gw.flush().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![SimState::Locked]);
        assert_eq!(gw.dropped_events(), 0);
    }

    #[test]
    fn test_concurrent_deliveries_are_serialized() {
        let (_gw, manager) = setup(NativeStatus::SimInitCompleted);

        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = crossbeam_channel::bounded::<()>(2);

        let cb_active = Arc::clone(&active);
        let cb_max = Arc::clone(&max_active);
        let cb_seen = Arc::clone(&seen);
        let callback: StateCallback = Arc::new(move |state: SimState, _: &UserData| {
            let now = cb_active.fetch_add(1, Ordering::SeqCst) + 1;
            cb_max.fetch_max(now, Ordering::SeqCst);
            let _ = entered_tx.try_send(());
            thread::sleep(std::time::Duration::from_millis(50));
            cb_seen.lock().unwrap().push(state);
            cb_active.fetch_sub(1, Ordering::SeqCst);
        });
        manager.subscribe(Some(callback), Arc::new(())).unwrap();

        // Two delivery threads racing on the same manager.
        let first_sink = manager.sink();
        let second_sink = manager.sink();
        let first = thread::spawn(move || first_sink(NativeStatus::CardRemoved));
        entered_rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        let second = thread::spawn(move || second_sink(NativeStatus::SimPinRequired));
        first.join().unwrap();
        second.join().unwrap();

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![SimState::Unavailable, SimState::Locked]);
    }

    #[test]
    fn test_subscribe_stream_receives_changes() {
        let (gw, manager) = setup(NativeStatus::SimInitCompleted);
        let stream = manager.subscribe_stream(8).unwrap();

        gw.set_status(NativeStatus::CardRemoved).unwrap();
        gw.flush().unwrap();

        let change = stream.try_recv().unwrap();
        assert_eq!(change.previous, SimState::Available);
        assert_eq!(change.current, SimState::Unavailable);

        manager.unsubscribe().unwrap();
        assert!(stream.recv().is_err());
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SimError, SimResult};
use crate::manager::{StateCallback, UserData};
use crate::state::SimState;

/// A state transition observed by a stream subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// State before the transition.
    pub previous: SimState,
    /// State after the transition.
    pub current: SimState,
    /// When the transition was delivered.
    pub observed_at: DateTime<Utc>,
}

/// Receive handle for SIM state changes.
///
/// The stream disconnects once the backing subscription is removed, after
/// buffered changes have been drained. Dropping the stream does not
/// unsubscribe; further changes are counted as dropped.
#[derive(Debug)]
pub struct SimStateStream {
    rx: Receiver<StateChange>,
    dropped: Arc<AtomicU64>,
}

impl SimStateStream {
    /// Receive the next change (blocking).
    pub fn recv(&self) -> SimResult<StateChange> {
        self.rx
            .recv()
            .map_err(|_| SimError::operation_failed("state_stream"))
    }

    /// Receive the next change, or `None` once `timeout` elapses.
    pub fn recv_timeout(&self, timeout: Duration) -> SimResult<Option<StateChange>> {
        match self.rx.recv_timeout(timeout) {
            Ok(change) => Ok(Some(change)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SimError::operation_failed("state_stream")),
        }
    }

    /// Take a buffered change without blocking.
    #[must_use]
    pub fn try_recv(&self) -> Option<StateChange> {
        self.rx.try_recv().ok()
    }

    /// Changes discarded because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Build the callback feeding a new stream, seeded with the current state.
pub(crate) fn channel(capacity: usize, initial: SimState) -> (StateCallback, UserData, SimStateStream) {
    let (tx, rx) = bounded::<StateChange>(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));

    let forwarder = Forwarder {
        tx,
        last: Mutex::new(initial),
        dropped: Arc::clone(&dropped),
    };
    let callback: StateCallback = Arc::new(move |state: SimState, _: &UserData| forwarder.forward(state));

    (callback, Arc::new(()), SimStateStream { rx, dropped })
}

struct Forwarder {
    tx: Sender<StateChange>,
    last: Mutex<SimState>,
    dropped: Arc<AtomicU64>,
}

impl Forwarder {
    fn forward(&self, current: SimState) {
        let previous = match self.last.lock() {
            Ok(mut last) => std::mem::replace(&mut *last, current),
            Err(_) => return,
        };

        let change = StateChange {
            previous,
            current,
            observed_at: Utc::now(),
        };

        // Never block the delivery thread: drop if the reader is slow.
        match self.tx.try_send(change) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(%previous, %current, "state stream full, change dropped");
            }
        }
    }
}

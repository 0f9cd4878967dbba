//! Abstract gateway trait for SIM backends.
//!
//! A gateway owns the link to the telephony subsystem. The crate core only
//! talks to this trait, so a legacy daemon binding, a handle-based binding or
//! a raw bus client can be swapped in without touching subscription logic.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::state::NativeStatus;

/// Errors reported by a gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The telephony backend could not be reached.
    #[error("Telephony backend unreachable: {0}")]
    Unreachable(String),

    /// The connection handle is not (or no longer) open.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// A notification sink is already registered.
    #[error("Notifications already registered on {0}")]
    AlreadyRegistered(ConnectionId),

    /// No notification sink is registered.
    #[error("Notifications not registered on {0}")]
    NotRegistered(ConnectionId),

    /// The backend rejected or failed the request.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Opaque handle to an open gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Receiver for native status-change events.
pub type NotificationSink = Arc<dyn Fn(NativeStatus) + Send + Sync>;

/// International subscriber identity split into its parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImsiInfo {
    /// Mobile Country Code.
    pub mcc: String,
    /// Mobile Network Code.
    pub mnc: String,
    /// Mobile Subscription Identification Number.
    pub msin: String,
}

/// CPHS operator name records as stored on the card.
///
/// Names are raw EF bytes and may carry trailing `0xFF` or NUL padding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CphsInfo {
    /// Operator name string, full form.
    pub full_name: Vec<u8>,
    /// Operator name string, short form.
    pub short_name: Vec<u8>,
}

/// Capability interface to a SIM backend.
///
/// # Notification delivery
/// - Events are delivered on a gateway-owned thread, never synchronously from
///   inside `register_notifications`.
/// - Delivery may duplicate or reorder events; consumers must tolerate both.
/// - After `deregister_notifications` or `disconnect` returns, no new delivery
///   is started for that connection.
pub trait SimGateway: Send + Sync {
    /// Acquire a backend connection.
    fn connect(&self) -> Result<ConnectionId, GatewayError>;

    /// Release a connection. Idempotent.
    fn disconnect(&self, conn: ConnectionId);

    /// Read the current card status.
    fn query_init_status(&self, conn: ConnectionId) -> Result<NativeStatus, GatewayError>;

    /// Arm delivery of future status-change events to `sink`.
    fn register_notifications(
        &self,
        conn: ConnectionId,
        sink: NotificationSink,
    ) -> Result<(), GatewayError>;

    /// Stop delivery of status-change events.
    fn deregister_notifications(&self, conn: ConnectionId) -> Result<(), GatewayError>;

    /// Read the Integrated Circuit Card identifier.
    fn read_iccid(&self, conn: ConnectionId) -> Result<String, GatewayError>;

    /// Read the IMSI parts.
    fn read_imsi(&self, conn: ConnectionId) -> Result<ImsiInfo, GatewayError>;

    /// Read the Service Provider Name. Empty when the card has none.
    fn read_spn(&self, conn: ConnectionId) -> Result<String, GatewayError>;

    /// Read the CPHS operator name records.
    fn read_cphs_info(&self, conn: ConnectionId) -> Result<CphsInfo, GatewayError>;

    /// Read the subscriber number (MSISDN). Empty when the card has none.
    fn read_subscriber_number(&self, conn: ConnectionId) -> Result<String, GatewayError>;
}

//! SIM backend gateways.
//!
//! The trait lives in `traits`; `memory` provides the in-process reference
//! backend used for embedded simulation and tests.

mod memory;
mod traits;

use std::sync::Arc;

use crate::config::{BackendConfig, ConfigError, SimConfig};

pub use memory::{CardProfile, GatewayOp, InMemoryGateway};
pub use traits::{
    CphsInfo, ConnectionId, GatewayError, ImsiInfo, NotificationSink, SimGateway,
};

/// Open the gateway selected by `config`.
pub fn open_gateway(config: &SimConfig) -> Result<Arc<dyn SimGateway>, ConfigError> {
    match &config.backend {
        BackendConfig::InMemory { .. } => Ok(Arc::new(InMemoryGateway::from_config(config)?)),
    }
}

/// Connection released when dropped.
pub(crate) struct ScopedConnection<'a> {
    gateway: &'a dyn SimGateway,
    conn: ConnectionId,
}

impl<'a> ScopedConnection<'a> {
    pub(crate) fn open(gateway: &'a dyn SimGateway) -> Result<Self, GatewayError> {
        let conn = gateway.connect()?;
        Ok(Self { gateway, conn })
    }

    pub(crate) const fn id(&self) -> ConnectionId {
        self.conn
    }
}

impl Drop for ScopedConnection<'_> {
    fn drop(&mut self) {
        self.gateway.disconnect(self.conn);
    }
}

//! Public SIM API.
//!
//! [`Sim`] bundles a gateway with a [`StateSubscriptionManager`]. Field reads
//! open a connection per call, check that the card finished initialization,
//! read the field and release the connection again.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::{ConfigError, SimConfig};
use crate::error::{SimError, SimResult};
use crate::gateway::{open_gateway, ConnectionId, GatewayError, ScopedConnection, SimGateway};
use crate::manager::{StateCallback, StateSubscriptionManager, UserData};
use crate::state::SimState;
use crate::stream::SimStateStream;

/// Handle to a SIM card behind a gateway.
#[derive(Debug)]
pub struct Sim {
    manager: StateSubscriptionManager,
    stream_capacity: usize,
}

impl Sim {
    /// Create a handle over an existing gateway.
    #[must_use]
    pub fn new(gateway: Arc<dyn SimGateway>) -> Self {
        Self {
            manager: StateSubscriptionManager::new(gateway),
            stream_capacity: SimConfig::default().stream_capacity,
        }
    }

    /// Open the backend selected by `config`.
    pub fn open(config: &SimConfig) -> Result<Self, ConfigError> {
        let gateway = open_gateway(config)?;
        Ok(Self {
            manager: StateSubscriptionManager::new(gateway),
            stream_capacity: config.stream_capacity,
        })
    }

    /// The subscription manager backing this handle.
    #[must_use]
    pub const fn manager(&self) -> &StateSubscriptionManager {
        &self.manager
    }

    /// Integrated Circuit Card identifier.
    pub fn get_icc_id(&self) -> SimResult<Option<String>> {
        self.read_field("read_iccid", |gw, conn| gw.read_iccid(conn))
            .map(non_empty)
    }

    /// Mobile Country Code of the SIM provider.
    pub fn get_mcc(&self) -> SimResult<Option<String>> {
        self.read_field("read_imsi", |gw, conn| gw.read_imsi(conn))
            .map(|imsi| non_empty(imsi.mcc))
    }

    /// Mobile Network Code of the SIM provider.
    pub fn get_mnc(&self) -> SimResult<Option<String>> {
        self.read_field("read_imsi", |gw, conn| gw.read_imsi(conn))
            .map(|imsi| non_empty(imsi.mnc))
    }

    /// Mobile Subscription Identification Number.
    pub fn get_msin(&self) -> SimResult<Option<String>> {
        self.read_field("read_imsi", |gw, conn| gw.read_imsi(conn))
            .map(|imsi| non_empty(imsi.msin))
    }

    /// Service Provider Name; `None` when the card stores none.
    pub fn get_spn(&self) -> SimResult<Option<String>> {
        let spn = self.read_field("read_spn", |gw, conn| gw.read_spn(conn))?;
        if spn.is_empty() {
            debug!("spn has no value");
        }
        Ok(non_empty(spn))
    }

    /// CPHS operator name as `(full, short)`; each `None` when absent.
    pub fn get_cphs_operator_name(&self) -> SimResult<(Option<String>, Option<String>)> {
        let info = self.read_field("read_cphs_info", |gw, conn| gw.read_cphs_info(conn))?;
        Ok((decode_name(&info.full_name)?, decode_name(&info.short_name)?))
    }

    /// Subscriber number (MSISDN); `None` when the card stores none.
    pub fn get_subscriber_number(&self) -> SimResult<Option<String>> {
        let number = self.read_field("read_subscriber_number", |gw, conn| {
            gw.read_subscriber_number(conn)
        })?;
        if number.is_empty() {
            debug!("subscriber number has no value");
        }
        Ok(non_empty(number))
    }

    /// Current SIM state.
    pub fn get_state(&self) -> SimResult<SimState> {
        self.manager.get_state()
    }

    /// See [`StateSubscriptionManager::subscribe`].
    pub fn subscribe(&self, callback: Option<StateCallback>, user_data: UserData) -> SimResult<()> {
        self.manager.subscribe(callback, user_data)
    }

    /// See [`StateSubscriptionManager::unsubscribe`].
    pub fn unsubscribe(&self) -> SimResult<()> {
        self.manager.unsubscribe()
    }

    /// Subscribe through a stream using the configured buffer capacity.
    pub fn subscribe_stream(&self) -> SimResult<SimStateStream> {
        self.manager.subscribe_stream(self.stream_capacity)
    }

    fn read_field<T>(
        &self,
        operation: &'static str,
        read: impl FnOnce(&dyn SimGateway, ConnectionId) -> Result<T, GatewayError>,
    ) -> SimResult<T> {
        let gateway = self.manager.gateway().as_ref();
        let scoped = ScopedConnection::open(gateway).map_err(|err| {
            warn!(operation, error = %err, "failed to connect to SIM backend");
            SimError::backend("connect", err)
        })?;

        match gateway.query_init_status(scoped.id()) {
            Ok(status) if status.is_ready() => {}
            Ok(status) => {
                warn!(operation, %status, "SIM not available");
                return Err(SimError::NotAvailable);
            }
            Err(err) => {
                warn!(operation, error = %err, "SIM not available: status query failed");
                return Err(SimError::NotAvailable);
            }
        }

        read(gateway, scoped.id()).map_err(|err| {
            warn!(operation, error = %err, "SIM field read failed");
            SimError::backend(operation, err)
        })
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Decode an EF name record, dropping trailing NUL/0xFF padding.
fn decode_name(raw: &[u8]) -> SimResult<Option<String>> {
    let len = raw
        .iter()
        .rposition(|b| *b != 0x00 && *b != 0xff)
        .map_or(0, |last| last + 1);
    if len == 0 {
        return Ok(None);
    }

    let raw = &raw[..len];
    let mut out = String::new();
    out.try_reserve_exact(len)?;

    let mut lossy = false;
    for chunk in raw.utf8_chunks() {
        out.try_reserve(chunk.valid().len())?;
        out.push_str(chunk.valid());
        if !chunk.invalid().is_empty() {
            lossy = true;
            out.try_reserve(char::REPLACEMENT_CHARACTER.len_utf8())?;
            out.push(char::REPLACEMENT_CHARACTER);
        }
    }
    if lossy {
        debug!(len, "operator name is not valid UTF-8, invalid bytes replaced");
    }
    Ok(Some(out))
}

//! # simcard - SIM card identity and state for cellular modems
//!
//! simcard reads identity fields from a SIM card (ICC-ID, MCC/MNC, MSIN, SPN,
//! CPHS operator names, subscriber number) and tracks the card state through a
//! single deduplicated change subscription.
//!
//! ## Core Concepts
//!
//! - **Gateway**: the capability interface to a telephony backend ([`SimGateway`])
//! - **NativeStatus**: raw card status as reported by the backend
//! - **SimState**: the four-valued public state derived from a native status
//! - **Subscription**: one callback fired only when the state actually changes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use simcard::{InMemoryGateway, NativeStatus, Sim, SimState, StateCallback, UserData};
//!
//! let gateway = Arc::new(InMemoryGateway::default());
//! let sim = Sim::new(gateway.clone());
//!
//! assert_eq!(sim.get_state()?, SimState::Available);
//!
//! let callback: StateCallback = Arc::new(|state: SimState, _: &UserData| {
//!     println!("SIM is now {state}");
//! });
//! sim.subscribe(Some(callback), Arc::new(()))?;
//! gateway.set_status(NativeStatus::CardRemoved)?;
//! sim.unsubscribe()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod sim;
pub mod state;
/// Channel-backed state change streams.
pub mod stream;

// Re-export primary types at crate root for convenience
pub use config::{BackendConfig, ConfigError, GatewayConfig, SimConfig};
pub use error::{SimError, SimErrorCode, SimResult};
pub use gateway::{
    open_gateway, CardProfile, CphsInfo, ConnectionId, GatewayError, GatewayOp, ImsiInfo,
    InMemoryGateway, NotificationSink, SimGateway,
};
pub use manager::{StateCallback, StateSubscriptionManager, UserData};
pub use sim::Sim;
pub use state::{translate, NativeStatus, SimState};
pub use stream::{SimStateStream, StateChange};

//! SIM card state and native status translation.
//!
//! The telephony daemon reports a raw card status code. Callers only ever see
//! the four-valued [`SimState`], derived through a single total mapping.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Public state of the SIM card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimState {
    /// SIM is not available on this device.
    Unavailable,
    /// SIM is locked.
    Locked,
    /// SIM is available on this device.
    Available,
    /// SIM is in transition between states.
    Unknown,
}

impl SimState {
    /// Lowercase name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Locked => "locked",
            Self::Available => "available",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SimState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw card status as reported by the telephony daemon.
///
/// Codes not known to this crate are kept verbatim in `Unrecognized`, so
/// `from_code(code).code() == code` holds for every byte.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeStatus {
    CardError,
    CardNotPresent,
    SimInitializing,
    SimInitCompleted,
    SimPinRequired,
    SimPukRequired,
    CardBlocked,
    SimNckRequired,
    SimNsckRequired,
    SimSpckRequired,
    SimCckRequired,
    CardRemoved,
    SimLockRequired,
    CardCrashed,
    CardPowerOff,
    Unknown,
    Unrecognized(u8),
}

impl NativeStatus {
    /// Decode a raw status code.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::CardError,
            0x01 => Self::CardNotPresent,
            0x02 => Self::SimInitializing,
            0x03 => Self::SimInitCompleted,
            0x04 => Self::SimPinRequired,
            0x05 => Self::SimPukRequired,
            0x06 => Self::CardBlocked,
            0x07 => Self::SimNckRequired,
            0x08 => Self::SimNsckRequired,
            0x09 => Self::SimSpckRequired,
            0x0a => Self::SimCckRequired,
            0x0b => Self::CardRemoved,
            0x0c => Self::SimLockRequired,
            0x0d => Self::CardCrashed,
            0x0e => Self::CardPowerOff,
            0xff => Self::Unknown,
            other => Self::Unrecognized(other),
        }
    }

    /// Raw status code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::CardError => 0x00,
            Self::CardNotPresent => 0x01,
            Self::SimInitializing => 0x02,
            Self::SimInitCompleted => 0x03,
            Self::SimPinRequired => 0x04,
            Self::SimPukRequired => 0x05,
            Self::CardBlocked => 0x06,
            Self::SimNckRequired => 0x07,
            Self::SimNsckRequired => 0x08,
            Self::SimSpckRequired => 0x09,
            Self::SimCckRequired => 0x0a,
            Self::CardRemoved => 0x0b,
            Self::SimLockRequired => 0x0c,
            Self::CardCrashed => 0x0d,
            Self::CardPowerOff => 0x0e,
            Self::Unknown => 0xff,
            Self::Unrecognized(code) => code,
        }
    }

    /// Whether the card finished initialization and its files can be read.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::SimInitCompleted)
    }
}

impl From<u8> for NativeStatus {
    fn from(code: u8) -> Self {
        Self::from_code(code)
    }
}

impl fmt::Display for NativeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}(0x{:02x})", self.code())
    }
}

/// Translate a native status into the public state.
///
/// Total: anything not explicitly listed maps to `Unavailable`.
#[must_use]
pub const fn translate(status: NativeStatus) -> SimState {
    match status {
        NativeStatus::SimInitCompleted => SimState::Available,

        NativeStatus::SimInitializing | NativeStatus::Unknown => SimState::Unknown,

        NativeStatus::SimPinRequired
        | NativeStatus::SimPukRequired
        | NativeStatus::SimNckRequired
        | NativeStatus::SimNsckRequired
        | NativeStatus::SimSpckRequired
        | NativeStatus::SimCckRequired
        | NativeStatus::SimLockRequired => SimState::Locked,

        NativeStatus::CardError
        | NativeStatus::CardNotPresent
        | NativeStatus::CardBlocked
        | NativeStatus::CardRemoved
        | NativeStatus::CardCrashed
        | NativeStatus::CardPowerOff
        | NativeStatus::Unrecognized(_) => SimState::Unavailable,
    }
}

impl From<NativeStatus> for SimState {
    fn from(status: NativeStatus) -> Self {
        translate(status)
    }
}

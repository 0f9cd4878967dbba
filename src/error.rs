//! Error types for simcard.
//!
//! Every public operation reports failures as a [`SimError`]. Backend
//! failures ([`GatewayError`]) are translated at the boundary and carried as
//! the source of `OperationFailed`, never returned raw.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::GatewayError;

/// Stable error codes surfaced to callers.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimErrorCode {
    None,
    OutOfMemory,
    InvalidParameter,
    OperationFailed,
    NotAvailable,
}

/// Top-level error type for simcard.
#[derive(Debug, Error)]
pub enum SimError {
    /// Caller contract violation, detected before any backend interaction.
    #[error("Invalid parameter: {parameter}")]
    InvalidParameter {
        /// Name of the offending parameter.
        parameter: &'static str,
    },

    /// The card is present but not fully initialized.
    #[error("SIM is not available")]
    NotAvailable,

    /// A backend call failed.
    #[error("Operation failed: {operation}")]
    OperationFailed {
        /// Name of the backend operation that failed.
        operation: &'static str,
        /// Underlying backend error, when one was reported.
        #[source]
        source: Option<GatewayError>,
    },

    /// Allocation failure while building a result string.
    #[error("Out of memory")]
    OutOfMemory,
}

impl SimError {
    /// Creates an `InvalidParameter` error.
    #[must_use]
    pub const fn invalid_parameter(parameter: &'static str) -> Self {
        Self::InvalidParameter { parameter }
    }

    /// Creates an `OperationFailed` error from a backend failure.
    #[must_use]
    pub const fn backend(operation: &'static str, source: GatewayError) -> Self {
        Self::OperationFailed {
            operation,
            source: Some(source),
        }
    }

    /// Creates an `OperationFailed` error with no backend cause.
    #[must_use]
    pub const fn operation_failed(operation: &'static str) -> Self {
        Self::OperationFailed {
            operation,
            source: None,
        }
    }

    /// Returns the stable code for this error.
    #[must_use]
    pub const fn code(&self) -> SimErrorCode {
        match self {
            Self::InvalidParameter { .. } => SimErrorCode::InvalidParameter,
            Self::NotAvailable => SimErrorCode::NotAvailable,
            Self::OperationFailed { .. } => SimErrorCode::OperationFailed,
            Self::OutOfMemory => SimErrorCode::OutOfMemory,
        }
    }

    /// Returns true if this is an `InvalidParameter` error.
    #[must_use]
    pub const fn is_invalid_parameter(&self) -> bool {
        matches!(self, Self::InvalidParameter { .. })
    }

    /// Returns true if this is a `NotAvailable` error.
    #[must_use]
    pub const fn is_not_available(&self) -> bool {
        matches!(self, Self::NotAvailable)
    }

    /// Returns true if this is an `OperationFailed` error.
    #[must_use]
    pub const fn is_operation_failed(&self) -> bool {
        matches!(self, Self::OperationFailed { .. })
    }

    /// Returns true if the caller may reasonably retry later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::NotAvailable | Self::OperationFailed { .. } => true,
            Self::InvalidParameter { .. } | Self::OutOfMemory => false,
        }
    }
}

impl From<std::collections::TryReserveError> for SimError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// Result type alias for simcard operations.
pub type SimResult<T> = Result<T, SimError>;

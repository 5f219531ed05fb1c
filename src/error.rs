//! Error types for SMU driver operations.
//!
//! Errors are split the same way the driver handles them:
//!
//! - **Input validation** (`InvalidChannel`, `InvalidSignal`, `InvalidMode`,
//!   `InvalidParameter`): rejected at the call site, no state changes.
//! - **State** (`Busy`, `DeviceNotFound`, `UnsupportedDevice`): the operation is
//!   not allowed right now or the target does not exist.
//! - **Protocol**: an inbound block could not be decoded. Reported per device,
//!   the block is dropped and the pipeline keeps running.
//! - **Transport**: failures surfaced by the USB collaborator. Transient ones are
//!   retried by the pipeline, persistent ones end that device's run.
//! - **Configuration**: loading or validating [`crate::config::SmuConfig`].

use std::fmt;

use thiserror::Error;

/// Result type alias for SMU operations.
pub type Result<T> = std::result::Result<T, SmuError>;

/// Errors that can occur when driving a source-measure unit.
#[derive(Error, Debug)]
pub enum SmuError {
    /// Channel index out of range for this device
    #[error("Invalid channel {channel}: device has {max} channels")]
    InvalidChannel { channel: usize, max: usize },

    /// Signal index out of range for this channel
    #[error("Invalid signal {signal} on channel {channel}: channel has {max} signals")]
    InvalidSignal {
        channel: usize,
        signal: usize,
        max: usize,
    },

    /// Mode index not supported by the channel
    #[error("Invalid mode {mode} for channel {channel}: channel has {max} modes")]
    InvalidMode { channel: usize, mode: u32, max: u32 },

    /// Invalid argument to a configuration call (period, sample rate, ...)
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// Operation not allowed while a run is active
    #[error("'{operation}' is not allowed while {target} is running")]
    Busy {
        operation: &'static str,
        target: String,
    },

    /// No device with this serial number is known
    #[error("Device '{serial}' not found")]
    DeviceNotFound { serial: String },

    /// USB id does not match any supported hardware model
    #[error("Unsupported device {vendor_id:04x}:{product_id:04x}")]
    UnsupportedDevice { vendor_id: u16, product_id: u16 },

    /// Inbound data could not be decoded
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Error reported by the USB transport
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is semantically invalid
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl SmuError {
    /// Shorthand for an [`SmuError::InvalidParameter`].
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Check if this error was caused by bad caller input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidChannel { .. }
                | Self::InvalidSignal { .. }
                | Self::InvalidMode { .. }
                | Self::InvalidParameter { .. }
        )
    }

    /// Check if the device has gone away.
    pub fn is_device_gone(&self) -> bool {
        matches!(self, Self::Transport(TransportError::NoDevice))
    }
}

impl From<figment::Error> for SmuError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

/// Errors produced by a [`crate::transport::Transport`] implementation.
///
/// These mirror the terminal states of a USB transfer so that completion
/// handling can tell transient conditions from device loss.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transfer or control request did not finish in time
    #[error("transfer timed out")]
    Timeout,

    /// The endpoint halted (USB stall / pipe error)
    #[error("endpoint stalled")]
    Stall,

    /// The transport cancelled a transfer nobody asked to cancel
    #[error("transfer cancelled unexpectedly")]
    Cancelled,

    /// The device was disconnected
    #[error("device disconnected")]
    NoDevice,

    /// The slot or endpoint is already in use
    #[error("resource busy")]
    Busy,

    /// Cancellation target is not in flight
    #[error("transfer not found")]
    NotFound,

    /// Any other transport failure
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether resubmitting the transfer may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Stall | Self::Cancelled)
    }
}

/// Direction of a bulk transfer, for error messages and transfer ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device (source samples)
    Out,
    /// Device to host (measured samples)
    In,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Out => write!(f, "OUT"),
            Self::In => write!(f, "IN"),
        }
    }
}

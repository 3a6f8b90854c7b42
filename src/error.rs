// src/error.rs
//
// Error taxonomy for the CAN subsystem. Device-API calls return
// `CanResult<T>`; bus bring-up failures are logged and recorded as a
// per-bus usability flag rather than surfaced here.

use std::fmt;

/// Errors returned by the device CAN API and the bus send path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanError {
    /// The device or stream handle is invalid or already freed.
    InvalidHandle,
    /// Bus index, payload length, or another argument is out of range.
    ParameterOutOfRange,
    /// No frame has arrived for the requested API id (or none unread).
    MessageNotFound,
    /// A cached frame exists but is older than the caller's timeout.
    Timeout,
    /// The cached frame is CAN FD and the caller used a classic read path.
    IncompatibleState,
    /// The bus failed to open at start-up and is permanently unusable.
    BusNotAvailable(u8),
    /// The socket write failed or was partial.
    SendFailed(String),
}

pub type CanResult<T> = Result<T, CanError>;

impl fmt::Display for CanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanError::InvalidHandle => write!(f, "invalid or freed CAN handle"),
            CanError::ParameterOutOfRange => write!(f, "parameter out of range"),
            CanError::MessageNotFound => write!(f, "CAN message not found"),
            CanError::Timeout => write!(f, "CAN message timed out"),
            CanError::IncompatibleState => {
                write!(f, "cached frame is CAN FD; classic read path cannot return it")
            }
            CanError::BusNotAvailable(bus) => write!(f, "CAN bus {} is not available", bus),
            CanError::SendFailed(detail) => write!(f, "CAN send failed: {}", detail),
        }
    }
}

impl std::error::Error for CanError {}

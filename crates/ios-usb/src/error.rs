use ios_kernel::{MemoryError, ReturnCode};
use thiserror::Error;

/// Return value for a transfer that failed on the host (error, cancelled, timed out, overflow).
pub const USB_ETRANSFER: i32 = -5;
/// Return value for a stalled endpoint.
pub const USB_ESTALL: i32 = -7004;

/// Failures reported by the host USB stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("entity not found")]
    NotFound,
    #[error("operation not supported")]
    NotSupported,
    #[error("device disconnected")]
    NoDevice,
    #[error("resource busy")]
    Busy,
    #[error("access denied")]
    Access,
    #[error("pipe stalled")]
    Stall,
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    #[error("device is not attached")]
    NotAttached,

    #[error("interface {interface} out of range ({count} interfaces)")]
    InvalidInterface { interface: u8, count: u8 },

    #[error("request is missing vector {vector}")]
    MalformedRequest { vector: usize },

    #[error("lost interface {interface} while switching interfaces")]
    InconsistentState { interface: u8 },

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl UsbError {
    /// Guest-visible code for this failure.
    pub fn return_code(&self) -> i32 {
        match self {
            Self::NotAttached | Self::Host(HostError::NoDevice | HostError::NotFound) => {
                ReturnCode::NoEntry.code()
            }
            Self::InvalidInterface { .. } | Self::MalformedRequest { .. } | Self::Memory(_) => {
                ReturnCode::Invalid.code()
            }
            Self::Host(HostError::Stall) => USB_ESTALL,
            Self::InconsistentState { .. } | Self::Host(_) => USB_ETRANSFER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_errors_map_into_the_ipc_error_space() {
        assert_eq!(UsbError::from(HostError::Stall).return_code(), -7004);
        assert_eq!(UsbError::from(HostError::NoDevice).return_code(), -6);
        assert_eq!(UsbError::from(HostError::Busy).return_code(), -5);
        assert_eq!(UsbError::NotAttached.return_code(), -6);
        assert_eq!(
            UsbError::InvalidInterface {
                interface: 3,
                count: 1
            }
            .return_code(),
            -4
        );
        assert_eq!(UsbError::MalformedRequest { vector: 1 }.return_code(), -4);
    }
}

//! The host USB stack, as seen by the passthrough layer.
//!
//! Transfers are asynchronous: [`HostDeviceHandle::submit`] hands the host a [`HostTransfer`] and
//! a one-shot [`TransferCallback`]. The host later invokes the callback exactly once, from
//! whatever thread its event loop runs on, with the final [`HostCompletion`].

use std::fmt;
use std::sync::Arc;

use crate::descriptor::{ConfigDescriptor, DeviceDescriptor};
use crate::error::HostError;

/// Identifies one submitted transfer. Allocated by the submitter and never reused by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTransferKind {
    /// The buffer starts with the 8-byte setup packet.
    Control,
    Bulk,
    Interrupt,
    Isochronous { packet_lengths: Vec<u16> },
}

impl HostTransferKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Bulk => "bulk",
            Self::Interrupt => "interrupt",
            Self::Isochronous { .. } => "isochronous",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTransfer {
    pub id: TransferId,
    pub endpoint: u8,
    pub kind: HostTransferKind,
    pub buffer: Vec<u8>,
    /// Zero means no timeout.
    pub timeout_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    Cancelled,
    TimedOut,
    Overflow,
    Stall,
    NoDevice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCompletion {
    pub id: TransferId,
    pub status: TransferStatus,
    /// Bytes moved in the data stage (the setup packet is not counted).
    pub actual_length: usize,
    /// The transfer buffer after completion, in the same layout it was submitted with.
    pub buffer: Vec<u8>,
    /// Actual length of each isochronous packet.
    pub iso_packet_lengths: Vec<u16>,
}

impl HostCompletion {
    pub fn new(id: TransferId, status: TransferStatus) -> Self {
        Self {
            id,
            status,
            actual_length: 0,
            buffer: Vec::new(),
            iso_packet_lengths: Vec::new(),
        }
    }
}

pub type TransferCallback = Box<dyn FnOnce(HostCompletion) + Send>;

/// Enumerates devices currently plugged into the host.
pub trait UsbHostContext: Send + Sync {
    fn devices(&self) -> Result<Vec<Arc<dyn HostDevice>>, HostError>;
}

/// A physical device, before it is opened.
pub trait HostDevice: Send + Sync {
    fn device_descriptor(&self) -> DeviceDescriptor;
    fn config_descriptor(&self, index: u8) -> Result<ConfigDescriptor, HostError>;
    fn bus_number(&self) -> u8;
    fn address(&self) -> u8;
    fn open(&self) -> Result<Box<dyn HostDeviceHandle>, HostError>;
}

/// An opened device.
pub trait HostDeviceHandle: Send {
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), HostError>;
    fn claim_interface(&mut self, interface: u8) -> Result<(), HostError>;
    fn release_interface(&mut self, interface: u8) -> Result<(), HostError>;
    fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), HostError>;
    fn set_configuration(&mut self, configuration: u8) -> Result<(), HostError>;

    /// Starts a transfer. On success `callback` is invoked exactly once; on error never.
    fn submit(&mut self, transfer: HostTransfer, callback: TransferCallback)
        -> Result<(), HostError>;

    /// Requests cancellation. The transfer still completes through its callback, with
    /// [`TransferStatus::Cancelled`] unless it finished first.
    fn cancel(&mut self, id: TransferId) -> Result<(), HostError>;

    fn close(self: Box<Self>);
}

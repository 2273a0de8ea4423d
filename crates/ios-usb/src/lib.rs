//! USB passthrough for the IOS kernel.
//!
//! A [`PassthroughDevice`] forwards guest transfers to a physical device through the
//! [`host`] traits and answers the guest when the host completes them. [`Oh0DeviceNode`] exposes
//! it over IPC, [`Oh0Hub`] lists what is plugged in and [`UsbScanner`] keeps both in sync with the
//! host.

pub mod descriptor;
mod device;
mod endpoint;
mod error;
pub mod host;
pub mod oh0;
mod scanner;
pub mod transfer;

pub use crate::device::{device_id, PassthroughDevice, Submission};
pub use crate::endpoint::TransferEndpoint;
pub use crate::error::{HostError, UsbError, USB_ESTALL, USB_ETRANSFER};
pub use crate::host::{
    HostCompletion, HostDevice, HostDeviceHandle, HostTransfer, HostTransferKind,
    TransferCallback, TransferId, TransferStatus, UsbHostContext,
};
pub use crate::oh0::{node_name, HubDirectory, HubEntry, Oh0DeviceNode, Oh0Hub, OH0_HUB_NAME};
pub use crate::scanner::{ScanReport, UsbScanner};

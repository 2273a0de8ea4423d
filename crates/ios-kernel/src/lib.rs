//! High-level emulation of the IOS kernel's IPC layer.
//!
//! The guest writes command blocks into its own memory and hands their addresses to
//! [`Kernel::enqueue_ipc_request`]. Everything after that is paced by the kernel's virtual clock:
//! [`Kernel::advance`] drains the request queue, dispatches to [`Device`] implementations and
//! delivers replies when their scheduled tick is reached.

mod boot;
mod config;
mod device;
mod handles;
mod interrupts;
mod kernel;
pub mod memory;
pub mod request;
mod registry;
mod reply;
mod result;
mod snapshot;
mod stub;

pub use crate::boot::{BootError, FirmwareLoader};
pub use crate::config::{ConfigError, KernelConfig, DEFAULT_TITLE_ID};
pub use crate::device::{lock_device, Device, DeviceContext, DeviceRef};
pub use crate::handles::{Fd, HandleTable, IPC_MAX_FDS};
pub use crate::interrupts::{IpcInterrupts, IpcRegisters, IpcSignal};
pub use crate::kernel::{Kernel, KeyService};
pub use crate::memory::{GuestMemory, GuestMemoryExt, GuestRam, GuestWrite, MemoryError};
pub use crate::registry::{DeviceRegistry, DeviceTable};
pub use crate::reply::{IpcEvent, PendingReply, ReplySender};
pub use crate::result::{IpcCommandResult, ReturnCode, DEFAULT_REPLY_DELAY_TICKS};
pub use crate::stub::StubDevice;

pub use ios_timing::{ClockSource, CPU_CLOCK_HZ};

//! OH0 device nodes: the guest's view of passthrough devices.
//!
//! Every passed-through device gets a node named after its vendor and product ids below
//! [`OH0_HUB_NAME`]. The hub node itself only lists devices.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use ios_kernel::request::{IoVector, IoctlRequest, IoctlvRequest, OpenRequest};
use ios_kernel::{
    Device, DeviceContext, Fd, GuestMemory, GuestMemoryExt, IpcCommandResult, ReturnCode,
};
use tracing::{debug, warn};

use crate::descriptor::SetupPacket;
use crate::device::{PassthroughDevice, Submission};
use crate::error::UsbError;
use crate::transfer::{BulkMessage, ControlMessage, IsoMessage};

pub const OH0_HUB_NAME: &str = "/dev/usb/oh0";

pub const IOCTLV_CTRLMSG: u32 = 0;
pub const IOCTLV_BLKMSG: u32 = 1;
pub const IOCTLV_INTRMSG: u32 = 2;
pub const IOCTL_SUSPENDDEV: u32 = 5;
pub const IOCTL_RESUMEDEV: u32 = 6;
pub const IOCTLV_ISOMSG: u32 = 9;
pub const IOCTLV_GETDEVLIST: u32 = 12;

/// Size of one GETDEVLIST entry: `u32` zero, `u16` vid, `u16` pid.
pub const DEVICE_ENTRY_SIZE: u32 = 8;

pub fn node_name(vid: u16, pid: u16) -> String {
    format!("{OH0_HUB_NAME}/{vid:x}/{pid:x}")
}

// ---- Vector decoding ----

fn in_vector(request: &IoctlvRequest, index: usize, size: u32) -> Result<IoVector, UsbError> {
    request
        .in_vector(index, size)
        .ok_or(UsbError::MalformedRequest { vector: index })
}

fn io_vector(request: &IoctlvRequest, index: usize, size: u32) -> Result<IoVector, UsbError> {
    request
        .io_vector(index, size)
        .ok_or(UsbError::MalformedRequest {
            vector: request.in_vectors.len() + index,
        })
}

fn in_u8(memory: &dyn GuestMemory, request: &IoctlvRequest, index: usize) -> Result<u8, UsbError> {
    Ok(memory.read_u8(in_vector(request, index, 1)?.address)?)
}

fn in_u16_be(
    memory: &dyn GuestMemory,
    request: &IoctlvRequest,
    index: usize,
) -> Result<u16, UsbError> {
    Ok(memory.read_u16_be(in_vector(request, index, 2)?.address)?)
}

fn in_u16_le(
    memory: &dyn GuestMemory,
    request: &IoctlvRequest,
    index: usize,
) -> Result<u16, UsbError> {
    Ok(memory.read_u16_le(in_vector(request, index, 2)?.address)?)
}

/// Address of the io buffer receiving `length` bytes. Zero-length transfers may omit it.
fn data_address(request: &IoctlvRequest, index: usize, length: u16) -> Result<u32, UsbError> {
    if length == 0 {
        return Ok(request.io_vectors.get(index).map_or(0, |v| v.address));
    }
    Ok(io_vector(request, index, u32::from(length))?.address)
}

pub fn decode_control(
    memory: &dyn GuestMemory,
    request: &IoctlvRequest,
) -> Result<ControlMessage, UsbError> {
    let setup = SetupPacket {
        bm_request_type: in_u8(memory, request, 0)?,
        b_request: in_u8(memory, request, 1)?,
        w_value: in_u16_le(memory, request, 2)?,
        w_index: in_u16_le(memory, request, 3)?,
        w_length: in_u16_le(memory, request, 4)?,
    };
    Ok(ControlMessage {
        request: request.request,
        setup,
        data_address: data_address(request, 0, setup.w_length)?,
    })
}

/// Bulk and interrupt messages share one layout.
pub fn decode_bulk(
    memory: &dyn GuestMemory,
    request: &IoctlvRequest,
) -> Result<BulkMessage, UsbError> {
    let endpoint = in_u8(memory, request, 0)?;
    let length = in_u16_be(memory, request, 1)?;
    Ok(BulkMessage {
        request: request.request,
        endpoint,
        length,
        data_address: data_address(request, 0, length)?,
    })
}

pub fn decode_isochronous(
    memory: &dyn GuestMemory,
    request: &IoctlvRequest,
) -> Result<IsoMessage, UsbError> {
    let endpoint = in_u8(memory, request, 0)?;
    let length = in_u16_be(memory, request, 1)?;
    let num_packets = in_u8(memory, request, 2)?;

    let sizes = io_vector(request, 0, u32::from(num_packets) * 2)?;
    let packet_sizes = (0..u32::from(num_packets))
        .map(|i| memory.read_u16_be(sizes.address.wrapping_add(i * 2)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(IsoMessage {
        request: request.request,
        endpoint,
        length,
        packet_sizes,
        packet_sizes_address: sizes.address,
        data_address: data_address(request, 1, length)?,
    })
}

// ---- Device nodes ----

/// `/dev/usb/oh0/<vid>/<pid>`: one passed-through device.
#[derive(Debug)]
pub struct Oh0DeviceNode {
    name: String,
    device: PassthroughDevice,
}

impl Oh0DeviceNode {
    pub fn new(device: PassthroughDevice) -> Self {
        Self {
            name: node_name(device.vid(), device.pid()),
            device,
        }
    }

    pub fn device(&self) -> &PassthroughDevice {
        &self.device
    }

    fn submit(
        &mut self,
        memory: &dyn GuestMemory,
        request: &IoctlvRequest,
    ) -> Result<Submission, UsbError> {
        match request.code {
            IOCTLV_CTRLMSG => {
                let message = decode_control(memory, request)?;
                self.device.submit_control(memory, &message)
            }
            IOCTLV_BLKMSG => {
                let message = decode_bulk(memory, request)?;
                self.device.submit_bulk(memory, &message)
            }
            IOCTLV_INTRMSG => {
                let message = decode_bulk(memory, request)?;
                self.device.submit_interrupt(memory, &message)
            }
            IOCTLV_ISOMSG => {
                let message = decode_isochronous(memory, request)?;
                self.device.submit_isochronous(memory, &message)
            }
            _ => Err(UsbError::MalformedRequest { vector: 0 }),
        }
    }
}

impl Device for Oh0DeviceNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, _ctx: &mut DeviceContext<'_>, _request: &OpenRequest) -> IpcCommandResult {
        match self.device.attach(0) {
            Ok(()) => IpcCommandResult::reply(ReturnCode::Success),
            Err(err) => {
                warn!(device = %self.name, %err, "failed to attach");
                IpcCommandResult::reply(ReturnCode::NoEntry)
            }
        }
    }

    fn close(&mut self, _ctx: &mut DeviceContext<'_>, _fd: Fd) -> IpcCommandResult {
        self.device.cancel_all_transfers();
        IpcCommandResult::reply(ReturnCode::Success)
    }

    fn ioctl(&mut self, _ctx: &mut DeviceContext<'_>, request: &IoctlRequest) -> IpcCommandResult {
        match request.code {
            IOCTL_SUSPENDDEV | IOCTL_RESUMEDEV => {
                debug!(device = %self.name, code = request.code, "power state change");
                IpcCommandResult::reply(ReturnCode::Success)
            }
            code => {
                warn!(device = %self.name, code, "unknown ioctl");
                IpcCommandResult::reply(ReturnCode::Invalid)
            }
        }
    }

    fn ioctlv(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlvRequest) -> IpcCommandResult {
        if !matches!(
            request.code,
            IOCTLV_CTRLMSG | IOCTLV_BLKMSG | IOCTLV_INTRMSG | IOCTLV_ISOMSG
        ) {
            warn!(device = %self.name, code = request.code, "unknown ioctlv");
            return IpcCommandResult::reply(ReturnCode::Invalid);
        }
        match self.submit(&*ctx.memory, request) {
            Ok(Submission::Pending(_)) => IpcCommandResult::no_reply(),
            Ok(Submission::Replied(return_value)) => IpcCommandResult::reply_after(return_value, 0),
            Err(err) => {
                warn!(device = %self.name, code = request.code, %err, "transfer rejected");
                IpcCommandResult::reply(err.return_code())
            }
        }
    }
}

// ---- Hub ----

/// What the hub knows about one passed-through device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubEntry {
    pub vid: u16,
    pub pid: u16,
    /// Device class followed by every interface class.
    pub classes: Vec<u8>,
}

impl HubEntry {
    pub fn for_device(device: &PassthroughDevice) -> Self {
        let mut classes = vec![device.device_descriptor().device_class];
        classes.extend(
            device
                .configurations()
                .iter()
                .flat_map(|config| &config.interfaces)
                .flat_map(|interface| &interface.alt_settings)
                .map(|alt| alt.interface_class),
        );
        classes.sort_unstable();
        classes.dedup();
        Self {
            vid: device.vid(),
            pid: device.pid(),
            classes,
        }
    }

    /// Class 0 matches every device.
    pub fn matches(&self, class: u8) -> bool {
        class == 0 || self.classes.contains(&class)
    }
}

/// Devices listed by the hub, keyed by device id. Cloning shares the directory.
#[derive(Debug, Clone, Default)]
pub struct HubDirectory {
    entries: Arc<Mutex<BTreeMap<u64, HubEntry>>>,
}

impl HubDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, HubEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, id: u64, entry: HubEntry) {
        self.lock().insert(id, entry);
    }

    pub fn remove(&self, id: u64) -> Option<HubEntry> {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Up to `max` entries matching `class`, in device id order.
    pub fn list(&self, class: u8, max: usize) -> Vec<HubEntry> {
        self.lock()
            .values()
            .filter(|entry| entry.matches(class))
            .take(max)
            .cloned()
            .collect()
    }
}

/// `/dev/usb/oh0`: lists attached devices.
#[derive(Debug)]
pub struct Oh0Hub {
    directory: HubDirectory,
}

impl Oh0Hub {
    pub fn new(directory: HubDirectory) -> Self {
        Self { directory }
    }

    fn get_device_list(
        &self,
        memory: &mut dyn GuestMemory,
        request: &IoctlvRequest,
    ) -> Result<(), UsbError> {
        let max_entries = in_u8(memory, request, 0)?;
        let class = in_u8(memory, request, 1)?;
        let count = io_vector(request, 0, 1)?;
        let list = io_vector(request, 1, u32::from(max_entries) * DEVICE_ENTRY_SIZE)?;

        let entries = self.directory.list(class, usize::from(max_entries));
        for (i, entry) in entries.iter().enumerate() {
            let at = list.address.wrapping_add(i as u32 * DEVICE_ENTRY_SIZE);
            memory.write_u32_be(at, 0)?;
            memory.write_u16_be(at.wrapping_add(4), entry.vid)?;
            memory.write_u16_be(at.wrapping_add(6), entry.pid)?;
        }
        memory.write_u8(count.address, entries.len() as u8)?;
        Ok(())
    }
}

impl Device for Oh0Hub {
    fn name(&self) -> &str {
        OH0_HUB_NAME
    }

    fn ioctlv(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlvRequest) -> IpcCommandResult {
        if request.code != IOCTLV_GETDEVLIST {
            warn!(device = OH0_HUB_NAME, code = request.code, "unknown ioctlv");
            return IpcCommandResult::reply(ReturnCode::Invalid);
        }
        match self.get_device_list(ctx.memory, request) {
            Ok(()) => IpcCommandResult::reply(ReturnCode::Success),
            Err(err) => {
                warn!(device = OH0_HUB_NAME, %err, "bad device list request");
                IpcCommandResult::reply(err.return_code())
            }
        }
    }
}

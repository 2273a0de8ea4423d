use std::collections::BTreeMap;
use std::sync::Arc;

use ios_kernel::{GuestMemory, ReplySender, ReturnCode};
use tracing::{error, info, warn};

use crate::descriptor::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor,
    DIR_HOST_TO_DEVICE, REC_DEVICE, REC_INTERFACE, REQUEST_SET_CONFIGURATION,
    REQUEST_SET_INTERFACE, TYPE_STANDARD,
};
use crate::endpoint::TransferEndpoint;
use crate::error::{HostError, UsbError};
use crate::host::{
    HostCompletion, HostDevice, HostDeviceHandle, HostTransfer, HostTransferKind, TransferId,
};
use crate::transfer::{BulkMessage, ControlMessage, IntrMessage, IsoMessage, TransferCommand};

/// Tracker key for control transfers.
const CONTROL_ENDPOINT: u8 = 0;

/// Outcome of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Handed to the host; the reply follows when it completes.
    Pending(TransferId),
    /// Handled without a host transfer; reply now with this value.
    Replied(i32),
}

/// A physical USB device passed through to the guest.
pub struct PassthroughDevice {
    device: Arc<dyn HostDevice>,
    handle: Option<Box<dyn HostDeviceHandle>>,
    id: u64,
    descriptor: DeviceDescriptor,
    configs: Vec<Option<ConfigDescriptor>>,
    active_interface: u8,
    attached: bool,
    endpoints: BTreeMap<u8, Arc<TransferEndpoint>>,
    next_transfer_id: u64,
    replies: ReplySender,
}

impl std::fmt::Debug for PassthroughDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassthroughDevice")
            .field("id", &format_args!("{:#018x}", self.id))
            .field("active_interface", &self.active_interface)
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

/// `vid << 32 | pid << 16 | bus << 8 | address`.
pub fn device_id(vid: u16, pid: u16, bus: u8, address: u8) -> u64 {
    u64::from(vid) << 32 | u64::from(pid) << 16 | u64::from(bus) << 8 | u64::from(address)
}

impl PassthroughDevice {
    pub fn new(device: Arc<dyn HostDevice>, replies: ReplySender) -> Self {
        let descriptor = device.device_descriptor();
        let id = device_id(
            descriptor.vendor_id,
            descriptor.product_id,
            device.bus_number(),
            device.address(),
        );
        let configs = (0..descriptor.num_configurations)
            .map(|index| match device.config_descriptor(index) {
                Ok(config) => Some(config),
                Err(err) => {
                    warn!(
                        vid = descriptor.vendor_id,
                        pid = descriptor.product_id,
                        index,
                        %err,
                        "failed to read config descriptor"
                    );
                    None
                }
            })
            .collect();

        Self {
            device,
            handle: None,
            id,
            descriptor,
            configs,
            active_interface: 0,
            attached: false,
            endpoints: BTreeMap::new(),
            next_transfer_id: 0,
            replies,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn vid(&self) -> u16 {
        self.descriptor.vendor_id
    }

    pub fn pid(&self) -> u16 {
        self.descriptor.product_id
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn active_interface(&self) -> u8 {
        self.active_interface
    }

    // ---- Descriptors ----

    pub fn device_descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    /// Every configuration the host could read. Unreadable ones are skipped.
    pub fn configurations(&self) -> Vec<ConfigDescriptor> {
        self.configs
            .iter()
            .enumerate()
            .filter_map(|(index, config)| {
                if config.is_none() {
                    error!(vid = self.vid(), pid = self.pid(), index, "ignoring invalid config");
                }
                config.clone()
            })
            .collect()
    }

    fn config(&self, config: u8) -> Option<&ConfigDescriptor> {
        let found = self.configs.get(usize::from(config)).and_then(Option::as_ref);
        if found.is_none() {
            error!(vid = self.vid(), pid = self.pid(), config, "invalid config descriptor");
        }
        found
    }

    /// All alternate settings of all interfaces of `config`, in order.
    pub fn interfaces(&self, config: u8) -> Vec<InterfaceDescriptor> {
        self.config(config)
            .map(|config| {
                config
                    .interfaces
                    .iter()
                    .flat_map(|interface| interface.alt_settings.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn endpoints(
        &self,
        config: u8,
        interface: u8,
        alt_setting: u8,
    ) -> Vec<EndpointDescriptor> {
        let Some(config) = self.config(config) else {
            return Vec::new();
        };
        let alt = config
            .interfaces
            .get(usize::from(interface))
            .and_then(|interface| interface.alt_settings.get(usize::from(alt_setting)));
        match alt {
            Some(alt) => alt.endpoints.clone(),
            None => {
                error!(
                    vid = self.vid(),
                    pid = self.pid(),
                    interface,
                    alt_setting,
                    "no such interface"
                );
                Vec::new()
            }
        }
    }

    /// Alternate settings of `interface` in the first configuration.
    pub fn alt_setting_count(&self, interface: u8) -> usize {
        self.config(0)
            .and_then(|config| config.interfaces.get(usize::from(interface)))
            .map_or(0, |interface| interface.alt_settings.len())
    }

    pub fn num_interfaces(&self, config: u8) -> u8 {
        self.config(config).map_or(0, ConfigDescriptor::num_interfaces)
    }

    /// Whether the device, or any of its interfaces, belongs to `class`. Class 0 matches anything.
    pub fn has_class(&self, class: u8) -> bool {
        class == 0
            || self.descriptor.device_class == class
            || self.configs.iter().flatten().any(|config| {
                config
                    .interfaces
                    .iter()
                    .flat_map(|interface| &interface.alt_settings)
                    .any(|alt| alt.interface_class == class)
            })
    }

    // ---- Interfaces ----

    /// Opens the device if needed and claims `interface`.
    pub fn attach(&mut self, interface: u8) -> Result<(), UsbError> {
        if self.attached {
            if interface != self.active_interface {
                return self.change_interface(interface);
            }
            return Ok(());
        }

        if self.handle.is_none() {
            info!(vid = self.vid(), pid = self.pid(), "opening device");
            match self.device.open() {
                Ok(handle) => self.handle = Some(handle),
                Err(err) => {
                    error!(vid = self.vid(), pid = self.pid(), %err, "failed to open");
                    return Err(err.into());
                }
            }
        }
        self.attach_interface(interface)?;
        self.attached = true;
        Ok(())
    }

    fn handle(&mut self) -> Result<&mut (dyn HostDeviceHandle + 'static), UsbError> {
        self.handle.as_deref_mut().ok_or(UsbError::NotAttached)
    }

    fn attach_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        let (vid, pid) = (self.vid(), self.pid());
        let handle = self.handle()?;
        info!(vid, pid, interface, "attaching interface");
        match handle.detach_kernel_driver(interface) {
            Ok(()) | Err(HostError::NotFound | HostError::NotSupported) => {}
            Err(err) => {
                error!(vid, pid, interface, %err, "failed to detach kernel driver");
                return Err(err.into());
            }
        }
        if let Err(err) = handle.claim_interface(interface) {
            error!(vid, pid, interface, %err, "couldn't claim interface");
            return Err(err.into());
        }
        self.active_interface = interface;
        Ok(())
    }

    fn detach_interface(&mut self) -> Result<(), UsbError> {
        let (vid, pid, interface) = (self.vid(), self.pid(), self.active_interface);
        let handle = self.handle()?;
        info!(vid, pid, interface, "detaching interface");
        match handle.release_interface(interface) {
            Ok(()) | Err(HostError::NoDevice) => Ok(()),
            Err(err) => {
                error!(vid, pid, interface, %err, "failed to release interface");
                Err(err.into())
            }
        }
    }

    /// Releases the active interface and claims `interface`.
    ///
    /// If the new claim fails the previous interface is claimed again. When that fails too the
    /// device is left detached and [`UsbError::InconsistentState`] is returned.
    pub fn change_interface(&mut self, interface: u8) -> Result<(), UsbError> {
        if !self.attached {
            return Err(UsbError::NotAttached);
        }
        let count = self.num_interfaces(0);
        if interface >= count {
            return Err(UsbError::InvalidInterface { interface, count });
        }

        let previous = self.active_interface;
        info!(
            vid = self.vid(),
            pid = self.pid(),
            from = previous,
            to = interface,
            "changing interface"
        );
        self.detach_interface()?;
        let Err(err) = self.attach_interface(interface) else {
            return Ok(());
        };
        if self.attach_interface(previous).is_err() {
            error!(vid = self.vid(), pid = self.pid(), interface = previous, "lost interface");
            self.attached = false;
            return Err(UsbError::InconsistentState {
                interface: previous,
            });
        }
        Err(err)
    }

    /// Selects an alternate setting of the active interface.
    pub fn set_alt_setting(&mut self, alt_setting: u8) -> Result<(), UsbError> {
        if !self.attached {
            return Err(UsbError::NotAttached);
        }
        let interface = self.active_interface;
        info!(vid = self.vid(), pid = self.pid(), interface, alt_setting, "setting alt setting");
        self.handle()?.set_alt_setting(interface, alt_setting)?;
        Ok(())
    }

    // ---- Transfers ----

    pub fn submit_control(
        &mut self,
        memory: &dyn GuestMemory,
        message: &ControlMessage,
    ) -> Result<Submission, UsbError> {
        if !self.attached {
            return Err(UsbError::NotAttached);
        }
        let setup = message.setup;
        let length = i32::from(message.length());

        // These have to go through the host stack rather than straight to the device.
        if setup.is(DIR_HOST_TO_DEVICE | TYPE_STANDARD | REC_INTERFACE, REQUEST_SET_INTERFACE) {
            let interface = setup.w_index as u8;
            if interface != self.active_interface {
                if let Err(err) = self.change_interface(interface) {
                    error!(
                        vid = self.vid(),
                        pid = self.pid(),
                        interface,
                        %err,
                        "failed to change interface"
                    );
                    return Err(err);
                }
            }
            self.set_alt_setting(setup.w_value as u8)?;
            return Ok(Submission::Replied(length));
        }
        if setup.is(DIR_HOST_TO_DEVICE | TYPE_STANDARD | REC_DEVICE, REQUEST_SET_CONFIGURATION) {
            self.handle()?.set_configuration(setup.w_value as u8)?;
            return Ok(Submission::Replied(length));
        }

        let command = TransferCommand::control(message, self.replies.clone());
        let mut buffer = setup.to_bytes().to_vec();
        buffer.extend(command.make_buffer(memory, usize::from(message.length()))?);
        self.submit(CONTROL_ENDPOINT, HostTransferKind::Control, buffer, command)
    }

    pub fn submit_bulk(
        &mut self,
        memory: &dyn GuestMemory,
        message: &BulkMessage,
    ) -> Result<Submission, UsbError> {
        self.submit_data(memory, message, HostTransferKind::Bulk)
    }

    pub fn submit_interrupt(
        &mut self,
        memory: &dyn GuestMemory,
        message: &IntrMessage,
    ) -> Result<Submission, UsbError> {
        self.submit_data(memory, message, HostTransferKind::Interrupt)
    }

    fn submit_data(
        &mut self,
        memory: &dyn GuestMemory,
        message: &BulkMessage,
        kind: HostTransferKind,
    ) -> Result<Submission, UsbError> {
        if !self.attached {
            return Err(UsbError::NotAttached);
        }
        let command = TransferCommand::bulk(message, self.replies.clone());
        let buffer = command.make_buffer(memory, usize::from(message.length))?;
        self.submit(message.endpoint, kind, buffer, command)
    }

    pub fn submit_isochronous(
        &mut self,
        memory: &dyn GuestMemory,
        message: &IsoMessage,
    ) -> Result<Submission, UsbError> {
        if !self.attached {
            return Err(UsbError::NotAttached);
        }
        let command = TransferCommand::isochronous(message, self.replies.clone());
        let buffer = command.make_buffer(memory, usize::from(message.length))?;
        let kind = HostTransferKind::Isochronous {
            packet_lengths: message.packet_sizes.clone(),
        };
        self.submit(message.endpoint, kind, buffer, command)
    }

    fn submit(
        &mut self,
        endpoint: u8,
        kind: HostTransferKind,
        buffer: Vec<u8>,
        command: TransferCommand,
    ) -> Result<Submission, UsbError> {
        if self.handle.is_none() {
            return Err(UsbError::NotAttached);
        }
        let id = TransferId(self.next_transfer_id);
        self.next_transfer_id += 1;

        let (vid, pid) = (self.vid(), self.pid());
        let tracker = Arc::clone(
            self.endpoints
                .entry(endpoint)
                .or_insert_with(|| Arc::new(TransferEndpoint::new(endpoint, vid, pid))),
        );
        tracker.add_transfer(id, command);

        let transfer = HostTransfer {
            id,
            endpoint,
            kind,
            buffer,
            timeout_ms: 0,
        };
        let kind_name = transfer.kind.name();
        let on_complete = Arc::clone(&tracker);
        let callback = Box::new(move |completion: HostCompletion| {
            on_complete.handle_transfer(completion, TransferCommand::fill);
        });
        match self.handle()?.submit(transfer, callback) {
            Ok(()) => Ok(Submission::Pending(id)),
            Err(err) => {
                error!(vid, pid, endpoint, kind = kind_name, %err, "failed to submit transfer");
                tracker.remove_transfer(id);
                Err(err.into())
            }
        }
    }

    /// Cancels everything in flight on `endpoint`.
    pub fn cancel_transfer(&mut self, endpoint: u8) -> i32 {
        info!(vid = self.vid(), pid = self.pid(), endpoint, "cancelling transfers");
        let Some(tracker) = self.endpoints.get(&endpoint).cloned() else {
            return ReturnCode::NoEntry.code();
        };
        if tracker.is_empty() {
            return ReturnCode::NoEntry.code();
        }
        if let Some(handle) = self.handle.as_mut() {
            tracker.cancel_transfers(handle.as_mut());
        }
        ReturnCode::Success.code()
    }

    pub fn cancel_all_transfers(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        for tracker in self.endpoints.values() {
            tracker.cancel_transfers(handle.as_mut());
        }
    }

    /// Transfers submitted and not yet completed, across all endpoints.
    pub fn pending_transfers(&self) -> usize {
        self.endpoints.values().map(|tracker| tracker.len()).sum()
    }
}

impl Drop for PassthroughDevice {
    fn drop(&mut self) {
        if self.attached {
            // Already logged.
            let _ = self.detach_interface();
        }
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }
}

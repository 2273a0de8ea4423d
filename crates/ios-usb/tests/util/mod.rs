#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use ios_kernel::{
    DeviceRegistry, GuestMemoryExt, GuestRam, IpcRegisters, IpcSignal, Kernel, KernelConfig,
};
use ios_usb::descriptor::{ConfigDescriptor, DeviceDescriptor};
use ios_usb::{
    HostCompletion, HostDevice, HostDeviceHandle, HostError, HostTransfer, HostTransferKind,
    TransferCallback, TransferId, TransferStatus, UsbHostContext, UsbScanner,
};
use serde::Deserialize;

pub const RAM_SIZE: usize = 0x10000;
pub const IPC_OPEN: u32 = 1;
pub const IPC_CLOSE: u32 = 2;
pub const IPC_IOCTL: u32 = 6;
pub const IPC_IOCTLV: u32 = 7;

pub const WIIMOTE_VID: u16 = 0x057e;
pub const WIIMOTE_PID: u16 = 0x0305;
pub const WIIMOTE_NODE: &str = "/dev/usb/oh0/57e/305";

/// Bluetooth-class device: interface 0 with interrupt/bulk endpoints, interface 1 with an
/// isochronous alternate setting.
const WIIMOTE_FIXTURE: &str = r#"{
  "device": {
    "usb_version": 512, "device_class": 224, "max_packet_size0": 64,
    "vendor_id": 1406, "product_id": 773, "num_configurations": 1
  },
  "configs": [{
    "total_length": 177, "configuration_value": 1, "attributes": 224, "max_power": 50,
    "interfaces": [
      { "alt_settings": [
        { "interface_number": 0, "interface_class": 224, "endpoints": [
          { "endpoint_address": 129, "attributes": 3, "max_packet_size": 16, "interval": 1 },
          { "endpoint_address": 130, "attributes": 2, "max_packet_size": 64 },
          { "endpoint_address": 2, "attributes": 2, "max_packet_size": 64 }
        ] }
      ] },
      { "alt_settings": [
        { "interface_number": 1, "interface_class": 224 },
        { "interface_number": 1, "alternate_setting": 1, "interface_class": 224, "endpoints": [
          { "endpoint_address": 131, "attributes": 1, "max_packet_size": 9, "interval": 1 },
          { "endpoint_address": 3, "attributes": 1, "max_packet_size": 9, "interval": 1 }
        ] }
      ] }
    ]
  }]
}"#;

#[derive(Deserialize)]
struct Fixture {
    device: DeviceDescriptor,
    configs: Vec<ConfigDescriptor>,
}

// ---- Mock host stack ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Open,
    DetachKernelDriver(u8),
    Claim(u8),
    Release(u8),
    SetAltSetting(u8, u8),
    SetConfiguration(u8),
    Submit {
        id: TransferId,
        endpoint: u8,
        kind: &'static str,
        len: usize,
    },
    Cancel(TransferId),
    Close,
}

#[derive(Default)]
pub struct MockState {
    pub calls: Vec<HostCall>,
    pub pending: BTreeMap<TransferId, (HostTransfer, TransferCallback)>,
    pub fail_open: bool,
    pub fail_claim: BTreeSet<u8>,
    pub fail_release: Option<HostError>,
    pub fail_next_submit: Option<HostError>,
    pub kernel_driver_error: Option<HostError>,
}

#[derive(Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<MockState>>,
}

impl MockHost {
    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn pending_ids(&self) -> Vec<TransferId> {
        self.state().pending.keys().copied().collect()
    }

    pub fn pending_transfer(&self, id: TransferId) -> HostTransfer {
        self.state().pending[&id].0.clone()
    }

    pub fn device(
        &self,
        descriptor: DeviceDescriptor,
        configs: Vec<ConfigDescriptor>,
    ) -> MockDevice {
        MockDevice {
            descriptor,
            configs,
            bus: 1,
            address: 2,
            host: self.clone(),
        }
    }

    pub fn wiimote(&self) -> MockDevice {
        let fixture: Fixture = serde_json::from_str(WIIMOTE_FIXTURE).unwrap();
        self.device(fixture.device, fixture.configs)
    }

    /// Finishes a transfer from a host thread, like a real event loop would.
    pub fn finish(&self, id: TransferId, status: TransferStatus, data: &[u8], iso: &[u16]) {
        let (transfer, callback) = self.state().pending.remove(&id).expect("no such transfer");
        let mut buffer = transfer.buffer.clone();
        let offset = match transfer.kind {
            HostTransferKind::Control => 8,
            _ => 0,
        };
        buffer[offset..offset + data.len()].copy_from_slice(data);
        let completion = HostCompletion {
            id,
            status,
            actual_length: data.len(),
            buffer,
            iso_packet_lengths: iso.to_vec(),
        };
        std::thread::spawn(move || callback(completion)).join().unwrap();
    }

    pub fn complete(&self, id: TransferId, data: &[u8]) {
        self.finish(id, TransferStatus::Completed, data, &[]);
    }

    pub fn fail(&self, id: TransferId, status: TransferStatus) {
        self.finish(id, status, &[], &[]);
    }
}

pub struct MockDevice {
    pub descriptor: DeviceDescriptor,
    pub configs: Vec<ConfigDescriptor>,
    pub bus: u8,
    pub address: u8,
    pub host: MockHost,
}

impl HostDevice for MockDevice {
    fn device_descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    fn config_descriptor(&self, index: u8) -> Result<ConfigDescriptor, HostError> {
        self.configs
            .get(usize::from(index))
            .cloned()
            .ok_or(HostError::NotFound)
    }

    fn bus_number(&self) -> u8 {
        self.bus
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn open(&self) -> Result<Box<dyn HostDeviceHandle>, HostError> {
        let mut state = self.host.state();
        state.calls.push(HostCall::Open);
        if state.fail_open {
            return Err(HostError::Access);
        }
        Ok(Box::new(MockHandle {
            host: self.host.clone(),
        }))
    }
}

pub struct MockHandle {
    host: MockHost,
}

impl HostDeviceHandle for MockHandle {
    fn detach_kernel_driver(&mut self, interface: u8) -> Result<(), HostError> {
        let mut state = self.host.state();
        state.calls.push(HostCall::DetachKernelDriver(interface));
        match state.kernel_driver_error.clone() {
            Some(err) => Err(err),
            None => Err(HostError::NotFound),
        }
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), HostError> {
        let mut state = self.host.state();
        state.calls.push(HostCall::Claim(interface));
        if state.fail_claim.contains(&interface) {
            return Err(HostError::Busy);
        }
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), HostError> {
        let mut state = self.host.state();
        state.calls.push(HostCall::Release(interface));
        match state.fail_release.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn set_alt_setting(&mut self, interface: u8, alt_setting: u8) -> Result<(), HostError> {
        self.host
            .state()
            .calls
            .push(HostCall::SetAltSetting(interface, alt_setting));
        Ok(())
    }

    fn set_configuration(&mut self, configuration: u8) -> Result<(), HostError> {
        self.host
            .state()
            .calls
            .push(HostCall::SetConfiguration(configuration));
        Ok(())
    }

    fn submit(
        &mut self,
        transfer: HostTransfer,
        callback: TransferCallback,
    ) -> Result<(), HostError> {
        let mut state = self.host.state();
        state.calls.push(HostCall::Submit {
            id: transfer.id,
            endpoint: transfer.endpoint,
            kind: transfer.kind.name(),
            len: transfer.buffer.len(),
        });
        if let Some(err) = state.fail_next_submit.take() {
            return Err(err);
        }
        state.pending.insert(transfer.id, (transfer, callback));
        Ok(())
    }

    fn cancel(&mut self, id: TransferId) -> Result<(), HostError> {
        let cancelled = {
            let mut state = self.host.state();
            state.calls.push(HostCall::Cancel(id));
            state.pending.remove(&id)
        };
        if let Some((transfer, callback)) = cancelled {
            callback(HostCompletion {
                buffer: transfer.buffer,
                ..HostCompletion::new(id, TransferStatus::Cancelled)
            });
        }
        Ok(())
    }

    fn close(self: Box<Self>) {
        self.host.state().calls.push(HostCall::Close);
    }
}

#[derive(Default)]
pub struct MockContext {
    devices: Mutex<Vec<Arc<dyn HostDevice>>>,
}

impl MockContext {
    pub fn plug(&self, device: MockDevice) {
        self.devices.lock().unwrap().push(Arc::new(device));
    }

    pub fn unplug(&self, address: u8) {
        self.devices
            .lock()
            .unwrap()
            .retain(|device| device.address() != address);
    }

    pub fn unplug_all(&self) {
        self.devices.lock().unwrap().clear();
    }
}

impl UsbHostContext for MockContext {
    fn devices(&self) -> Result<Vec<Arc<dyn HostDevice>>, HostError> {
        Ok(self.devices.lock().unwrap().clone())
    }
}

// ---- Guest side ----

pub struct UsbHarness {
    pub kernel: Kernel,
    pub regs: Arc<Mutex<IpcRegisters>>,
    pub host: MockHost,
    pub context: Arc<MockContext>,
    pub scanner: UsbScanner,
}

impl UsbHarness {
    /// A kernel with the hub registered and one wiimote-like device scanned in.
    pub fn new() -> Self {
        let host = MockHost::default();
        let context = Arc::new(MockContext::default());
        context.plug(host.wiimote());

        let scanner = UsbScanner::new(Arc::clone(&context) as Arc<dyn UsbHostContext>);
        let mut registry = DeviceRegistry::new();
        scanner.register_hub(&mut registry);

        let regs = Arc::new(Mutex::new(IpcRegisters::auto_acknowledging()));
        let kernel = Kernel::with_registry(
            KernelConfig::default(),
            registry,
            Box::new(GuestRam::new(RAM_SIZE)),
            Box::new(Arc::clone(&regs)),
        );
        let mut harness = Self {
            kernel,
            regs,
            host,
            context,
            scanner,
        };
        harness.scanner.scan(&mut harness.kernel).unwrap();
        harness
    }

    pub fn write(&mut self, addr: u32, bytes: &[u8]) {
        self.kernel.memory_mut().write(addr, bytes).unwrap();
    }

    pub fn read(&self, addr: u32, len: usize) -> Vec<u8> {
        self.kernel.memory().read_vec(addr, len).unwrap()
    }

    fn write_words(&mut self, addr: u32, words: &[u32]) {
        let mem = self.kernel.memory_mut();
        for (i, w) in words.iter().enumerate() {
            mem.write_u32_be(addr + i as u32 * 4, *w).unwrap();
        }
    }

    pub fn settle(&mut self) {
        self.kernel.advance(ios_kernel::CPU_CLOCK_HZ);
    }

    pub fn return_value(&self, block: u32) -> i32 {
        self.kernel.memory().read_u32_be(block + 4).unwrap() as i32
    }

    pub fn replied(&self, block: u32) -> bool {
        self.regs
            .lock()
            .unwrap()
            .signals()
            .contains(&IpcSignal::Reply(block))
    }

    /// Opens `path` using `block` and returns the handle (or error code) after settling.
    pub fn open(&mut self, block: u32, path: &str) -> i32 {
        let path_ptr = block + 0x100;
        let mut bytes = path.as_bytes().to_vec();
        bytes.push(0);
        self.write(path_ptr, &bytes);
        self.write_words(block, &[IPC_OPEN, 0, 0, path_ptr, 3]);
        self.kernel.enqueue_ipc_request(block);
        self.settle();
        self.return_value(block)
    }

    pub fn close(&mut self, block: u32, fd: u32) {
        self.write_words(block, &[IPC_CLOSE, 0, fd]);
        self.kernel.enqueue_ipc_request(block);
    }

    pub fn ioctl(&mut self, block: u32, fd: u32, code: u32) {
        self.write_words(block, &[IPC_IOCTL, 0, fd, code, 0, 0, 0, 0]);
        self.kernel.enqueue_ipc_request(block);
    }

    /// Queues an IOCTLV at `block`. Input scalars are copied to `block + 0x100`; io vectors are
    /// `(address, size)` pairs chosen by the caller.
    pub fn ioctlv(
        &mut self,
        block: u32,
        fd: u32,
        code: u32,
        ins: &[Vec<u8>],
        ios: &[(u32, u32)],
    ) {
        let table = block + 0x40;
        let mut data = block + 0x100;
        let mut entries = Vec::new();
        for input in ins {
            self.write(data, input);
            entries.push((data, input.len() as u32));
            data += (input.len() as u32).max(4).next_multiple_of(4);
        }
        entries.extend_from_slice(ios);
        for (i, (addr, size)) in entries.iter().enumerate() {
            self.write_words(table + i as u32 * 8, &[*addr, *size]);
        }
        self.write_words(
            block,
            &[IPC_IOCTLV, 0, fd, code, ins.len() as u32, ios.len() as u32, table],
        );
        self.kernel.enqueue_ipc_request(block);
    }
}

// ---- V0 message arguments ----

pub fn control_args(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> Vec<Vec<u8>> {
    vec![
        vec![request_type],
        vec![request],
        value.to_le_bytes().to_vec(),
        index.to_le_bytes().to_vec(),
        length.to_le_bytes().to_vec(),
    ]
}

pub fn bulk_args(endpoint: u8, length: u16) -> Vec<Vec<u8>> {
    vec![vec![endpoint], length.to_be_bytes().to_vec()]
}

pub fn iso_args(endpoint: u8, length: u16, num_packets: u8) -> Vec<Vec<u8>> {
    vec![vec![endpoint], length.to_be_bytes().to_vec(), vec![num_packets]]
}

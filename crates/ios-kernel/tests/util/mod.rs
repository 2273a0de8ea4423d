#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use ios_kernel::request::IoctlRequest;
use ios_kernel::{
    Device, DeviceContext, DeviceRegistry, GuestMemoryExt, GuestRam, IpcCommandResult,
    IpcRegisters, IpcSignal, Kernel, KernelConfig, PendingReply,
};

pub const RAM_SIZE: usize = 0x10000;
pub const PATH_AREA: u32 = 0x8000;

pub const IPC_OPEN: u32 = 1;
pub const IPC_CLOSE: u32 = 2;
pub const IPC_IOCTL: u32 = 6;
pub const IPC_IOCTLV: u32 = 7;
pub const IPC_REPLY: u32 = 8;

pub struct Harness {
    pub kernel: Kernel,
    pub regs: Arc<Mutex<IpcRegisters>>,
}

impl Harness {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self::with_registers(registry, IpcRegisters::auto_acknowledging())
    }

    pub fn with_registers(registry: DeviceRegistry, regs: IpcRegisters) -> Self {
        let regs = Arc::new(Mutex::new(regs));
        let kernel = Kernel::with_registry(
            KernelConfig::default(),
            registry,
            Box::new(GuestRam::new(RAM_SIZE)),
            Box::new(Arc::clone(&regs)),
        );
        Self { kernel, regs }
    }

    pub fn write_words(&mut self, addr: u32, words: &[u32]) {
        let mem = self.kernel.memory_mut();
        for (i, w) in words.iter().enumerate() {
            mem.write_u32_be(addr + i as u32 * 4, *w).unwrap();
        }
    }

    /// Writes an OPEN block at `block` (path stored at `PATH_AREA + block`) and queues it.
    pub fn open(&mut self, block: u32, path: &str) {
        let path_ptr = PATH_AREA + block;
        let mut bytes = path.as_bytes().to_vec();
        bytes.push(0);
        self.kernel.memory_mut().write(path_ptr, &bytes).unwrap();
        self.write_words(block, &[IPC_OPEN, 0, 0, path_ptr, 3]);
        self.kernel.enqueue_ipc_request(block);
    }

    pub fn close(&mut self, block: u32, fd: u32) {
        self.write_words(block, &[IPC_CLOSE, 0, fd]);
        self.kernel.enqueue_ipc_request(block);
    }

    pub fn ioctl(&mut self, block: u32, fd: u32, code: u32, in_size: u32) {
        self.write_words(block, &[IPC_IOCTL, 0, fd, code, 0, in_size, 0, 0]);
        self.kernel.enqueue_ipc_request(block);
    }

    pub fn raw(&mut self, block: u32, command: u32, fd: u32) {
        self.write_words(block, &[command, 0, fd]);
        self.kernel.enqueue_ipc_request(block);
    }

    /// Runs long enough for every default-delay reply to be delivered.
    pub fn settle(&mut self) {
        self.kernel.advance(ios_kernel::CPU_CLOCK_HZ);
    }

    pub fn return_value(&self, block: u32) -> i32 {
        self.kernel.memory().read_u32_be(block + 4).unwrap() as i32
    }

    pub fn word(&self, addr: u32) -> u32 {
        self.kernel.memory().read_u32_be(addr).unwrap()
    }

    pub fn signals(&self) -> Vec<IpcSignal> {
        self.regs.lock().unwrap().signals().to_vec()
    }

    pub fn replies(&self) -> Vec<u32> {
        self.signals()
            .into_iter()
            .filter_map(|s| match s {
                IpcSignal::Reply(addr) => Some(addr),
                IpcSignal::Ack(_) => None,
            })
            .collect()
    }

    /// Opens `path` at block `block` and returns the handle the kernel assigned.
    pub fn open_settled(&mut self, block: u32, path: &str) -> i32 {
        self.open(block, path);
        self.settle();
        self.return_value(block)
    }
}

/// Replies to IOCTL with `code` as the return value after `buffer_in_size` ticks.
#[derive(Debug, Default)]
pub struct EchoDevice {
    pub name: String,
    pub opens: usize,
    pub closes: usize,
    pub state: Vec<u8>,
    pub reject_state: bool,
}

impl EchoDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

impl Device for EchoDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _request: &ios_kernel::request::OpenRequest,
    ) -> IpcCommandResult {
        self.opens += 1;
        IpcCommandResult::reply(0)
    }

    fn close(&mut self, _ctx: &mut DeviceContext<'_>, _fd: ios_kernel::Fd) -> IpcCommandResult {
        self.closes += 1;
        IpcCommandResult::reply(0)
    }

    fn ioctl(&mut self, _ctx: &mut DeviceContext<'_>, request: &IoctlRequest) -> IpcCommandResult {
        IpcCommandResult::reply_after(request.code as i32, u64::from(request.buffer_in_size))
    }

    fn save_state(&self) -> Vec<u8> {
        self.state.clone()
    }

    fn load_state(&mut self, bytes: &[u8]) -> ios_io_snapshot::state::SnapshotResult<()> {
        if self.reject_state {
            return Err(ios_io_snapshot::state::SnapshotError::InvalidFieldEncoding(
                "echo state rejected",
            ));
        }
        self.state = bytes.to_vec();
        Ok(())
    }
}

/// Answers IOCTL later from "another thread": the reply goes through the host queue with a delay
/// of `buffer_in_size` ticks.
#[derive(Debug, Default)]
pub struct DeferredDevice;

impl Device for DeferredDevice {
    fn name(&self) -> &str {
        "/dev/deferred"
    }

    fn ioctl(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlRequest) -> IpcCommandResult {
        let sender = ctx.reply_sender();
        let reply = PendingReply::new(&request.request, request.code as i32);
        let delay = u64::from(request.buffer_in_size);
        std::thread::spawn(move || sender.send(reply, delay))
            .join()
            .unwrap();
        IpcCommandResult::no_reply()
    }
}

pub fn registry_with(devices: Vec<(&'static str, Arc<Mutex<dyn Device>>)>) -> DeviceRegistry {
    let mut registry = DeviceRegistry::new();
    for (name, device) in devices {
        registry.register(name, move |_| Arc::clone(&device));
    }
    registry
}

pub fn echo(name: &'static str) -> (&'static str, Arc<Mutex<dyn Device>>) {
    (name, Arc::new(Mutex::new(EchoDevice::new(name))))
}

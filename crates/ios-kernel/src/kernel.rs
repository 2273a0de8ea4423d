use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use ios_timing::{ClockSource, Timeline};
use tracing::{debug, info, trace, warn};

use crate::boot::{BootError, FirmwareLoader};
use crate::config::KernelConfig;
use crate::device::{lock_device, Device, DeviceContext, DeviceRef};
use crate::handles::{Fd, HandleTable};
use crate::interrupts::IpcInterrupts;
use crate::memory::{GuestMemory, GuestMemoryExt};
use crate::registry::{DeviceRegistry, DeviceTable};
use crate::reply::{IpcEvent, PendingReply, ReplySender};
use crate::request::{
    IoctlRequest, IoctlvRequest, IpcCommand, OpenRequest, ReadWriteRequest, Request,
    RequestError, SeekRequest, OFFSET_COMMAND, OFFSET_FD, OFFSET_RETURN_VALUE,
};
use crate::result::{IpcCommandResult, ReturnCode};

/// Opaque handle to the cryptographic key service shared with devices.
pub type KeyService = Arc<dyn Any + Send + Sync>;

/// The IPC kernel: device table, handle table, IPC queues and the virtual clock that paces them.
pub struct Kernel {
    pub(crate) config: KernelConfig,
    registry: DeviceRegistry,
    pub(crate) title_id: u64,
    pub(crate) uid: u32,
    pub(crate) gid: u16,
    pub(crate) devices: DeviceTable,
    pub(crate) handles: HandleTable,
    pub(crate) request_queue: VecDeque<u32>,
    pub(crate) reply_queue: VecDeque<u32>,
    pub(crate) ack_queue: VecDeque<u32>,
    pub(crate) last_reply_time: u64,
    pub(crate) timeline: Timeline<IpcEvent>,
    replies: ReplySender,
    memory: Box<dyn GuestMemory>,
    interrupts: Box<dyn IpcInterrupts>,
    iosc: Option<KeyService>,
    pub(crate) want_determinism: bool,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("title_id", &format_args!("{:#018x}", self.title_id))
            .field("uid", &self.uid)
            .field("gid", &self.gid)
            .field("devices", &self.devices)
            .field("handles", &self.handles)
            .field("request_queue", &self.request_queue)
            .field("reply_queue", &self.reply_queue)
            .field("ack_queue", &self.ack_queue)
            .field("now", &self.timeline.now())
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// Builds a kernel whose static devices are stubs named by `config`, and boots it.
    pub fn new(
        config: KernelConfig,
        memory: Box<dyn GuestMemory>,
        interrupts: Box<dyn IpcInterrupts>,
    ) -> Self {
        let registry = config.registry();
        Self::with_registry(config, registry, memory, interrupts)
    }

    pub fn with_registry(
        config: KernelConfig,
        registry: DeviceRegistry,
        memory: Box<dyn GuestMemory>,
        interrupts: Box<dyn IpcInterrupts>,
    ) -> Self {
        let timeline = Timeline::new();
        let replies = ReplySender::new(timeline.host_queue());
        let mut kernel = Self {
            title_id: config.title_id,
            want_determinism: config.want_determinism,
            config,
            registry,
            uid: 0,
            gid: 0,
            devices: DeviceTable::new(),
            handles: HandleTable::new(),
            request_queue: VecDeque::new(),
            reply_queue: VecDeque::new(),
            ack_queue: VecDeque::new(),
            last_reply_time: 0,
            timeline,
            replies,
            memory,
            interrupts,
            iosc: None,
        };
        kernel.boot_ios(kernel.title_id);
        kernel
    }

    // ---- identity ----

    pub fn title_id(&self) -> u64 {
        self.title_id
    }

    /// IOS version number (the low word of the title id).
    pub fn version(&self) -> u32 {
        (self.title_id & 0xffff_ffff) as u32
    }

    pub fn set_uid_for_ppc(&mut self, uid: u32) {
        self.uid = uid;
    }

    pub fn get_uid_for_ppc(&self) -> u32 {
        self.uid
    }

    pub fn set_gid_for_ppc(&mut self, gid: u16) {
        self.gid = gid;
    }

    pub fn get_gid_for_ppc(&self) -> u16 {
        self.gid
    }

    pub fn iosc(&self) -> Option<&KeyService> {
        self.iosc.as_ref()
    }

    pub fn set_iosc(&mut self, service: KeyService) {
        self.iosc = Some(service);
    }

    // ---- collaborators ----

    pub fn memory(&self) -> &dyn GuestMemory {
        self.memory.as_ref()
    }

    pub fn memory_mut(&mut self) -> &mut dyn GuestMemory {
        self.memory.as_mut()
    }

    pub fn reply_sender(&self) -> ReplySender {
        self.replies.clone()
    }

    pub fn device_table(&self) -> DeviceTable {
        self.devices.clone()
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn now(&self) -> u64 {
        self.timeline.now()
    }

    pub fn last_reply_time(&self) -> u64 {
        self.last_reply_time
    }

    pub fn request_queue(&self) -> &VecDeque<u32> {
        &self.request_queue
    }

    pub fn reply_queue(&self) -> &VecDeque<u32> {
        &self.reply_queue
    }

    pub fn ack_queue(&self) -> &VecDeque<u32> {
        &self.ack_queue
    }

    /// Scheduled timeline events that have not fired yet.
    pub fn pending_events(&self) -> usize {
        self.timeline.len()
    }

    // ---- boot ----

    /// Resets IPC state and installs the static devices.
    pub fn boot_ios(&mut self, title_id: u64) {
        self.title_id = title_id;
        self.uid = 0;
        self.gid = 0;
        self.request_queue.clear();
        self.reply_queue.clear();
        self.ack_queue.clear();
        self.handles.clear();
        self.timeline.clear();
        self.last_reply_time = self.timeline.now();

        self.devices.clear();
        for (name, device) in self.registry.instantiate() {
            lock_device(&device).update_want_determinism(self.want_determinism);
            self.devices.insert(name, device);
        }
        info!(
            title_id = format_args!("{title_id:#018x}"),
            devices = self.devices.len(),
            "IOS booted"
        );
    }

    /// Lets `loader` place the PPC image for the current title, then reinstalls devices.
    pub fn bootstrap_ppc(&mut self, loader: &mut dyn FirmwareLoader) -> Result<(), BootError> {
        loader.load(self.title_id, self.memory.as_mut())?;
        self.boot_ios(self.title_id);
        Ok(())
    }

    // ---- device table ----

    pub fn get_device_by_name(&self, name: &str) -> Option<DeviceRef> {
        self.devices.get(name)
    }

    /// Installs `device` under its own name, replacing any device of that name.
    pub fn add_device(&mut self, device: DeviceRef) {
        let name = {
            let mut guard = lock_device(&device);
            guard.update_want_determinism(self.want_determinism);
            guard.name().to_owned()
        };
        debug!(device = %name, "device added");
        self.devices.insert(name, device);
    }

    /// Removes a device from the name table. Handles already open on it stay valid.
    pub fn remove_device(&mut self, name: &str) -> Option<DeviceRef> {
        let removed = self.devices.remove(name);
        if removed.is_some() {
            debug!(device = name, "device removed");
        }
        removed
    }

    pub fn update_devices(&mut self) {
        for (_, device) in self.devices.entries() {
            self.with_device(&device, |device, ctx| device.update(ctx));
        }
    }

    pub fn want_determinism(&self) -> bool {
        self.want_determinism
    }

    pub fn update_want_determinism(&mut self, want_determinism: bool) {
        self.want_determinism = want_determinism;
        for (_, device) in self.devices.entries() {
            lock_device(&device).update_want_determinism(want_determinism);
        }
    }

    // ---- IPC ----

    /// Queues the command block at `address`. It is processed on the next [`Kernel::advance`].
    pub fn enqueue_ipc_request(&mut self, address: u32) {
        trace!(address, "ipc request queued");
        self.request_queue.push_back(address);
    }

    /// Schedules the reply for `request`.
    pub fn enqueue_ipc_reply(
        &mut self,
        request: &Request,
        return_value: i32,
        delay_ticks: u64,
        source: ClockSource,
    ) {
        self.schedule_reply(PendingReply::new(request, return_value), delay_ticks, source);
    }

    pub fn enqueue_ipc_acknowledgement(&mut self, address: u32, delay_ticks: u64) {
        self.timeline
            .schedule(delay_ticks, IpcEvent::Acknowledgement(address));
    }

    fn schedule_reply(&mut self, reply: PendingReply, delay_ticks: u64, source: ClockSource) {
        match source {
            ClockSource::Cpu => {
                self.timeline.schedule(delay_ticks, IpcEvent::Reply(reply));
            }
            ClockSource::Host => self.replies.send(reply, delay_ticks),
        }
    }

    /// Runs the kernel for `ticks` CPU cycles.
    pub fn advance(&mut self, ticks: u64) {
        let until = self.timeline.now().saturating_add(ticks);
        self.run_until(until);
    }

    /// Processes queued requests, then fires every event maturing at or before `until`.
    ///
    /// Replies sent from host threads are picked up between events and measured from the tick at
    /// which they are picked up.
    pub fn run_until(&mut self, until: u64) {
        self.update_ipc();
        loop {
            self.timeline.merge_host_events();
            let Some(due) = self.timeline.pop_due(until) else {
                break;
            };
            self.handle_ipc_event(due.event);
        }
        self.timeline.advance_clock_to(until);
    }

    /// Delivers one matured timeline event.
    pub fn handle_ipc_event(&mut self, event: IpcEvent) {
        match event {
            IpcEvent::Reply(reply) => {
                self.write_reply(&reply);
                self.reply_queue.push_back(reply.address);
            }
            IpcEvent::Acknowledgement(address) => self.ack_queue.push_back(address),
        }
        self.update_ipc();
    }

    fn write_reply(&mut self, reply: &PendingReply) {
        let memory = self.memory.as_mut();
        for write in &reply.writes {
            if let Err(err) = write.apply(memory) {
                warn!(address = reply.address, %err, "reply data dropped");
            }
        }
        if let Err(err) = write_reply_header(memory, reply) {
            warn!(address = reply.address, %err, "failed to write reply");
        }
    }

    /// Moves at most one item per ready signal: a pending request first, then a reply, then an
    /// acknowledgement.
    pub fn update_ipc(&mut self) {
        while self.interrupts.is_ready() {
            if let Some(address) = self.request_queue.pop_front() {
                self.interrupts.generate_ack(address);
                self.execute_ipc_command(address);
            } else if let Some(address) = self.reply_queue.pop_front() {
                self.interrupts.generate_reply(address);
            } else if let Some(address) = self.ack_queue.pop_front() {
                self.interrupts.generate_ack(address);
            } else {
                break;
            }
        }
    }

    /// Decodes and runs the command block at `address`, scheduling its reply.
    pub fn execute_ipc_command(&mut self, address: u32) {
        let request = match Request::decode(self.memory.as_ref(), address) {
            Ok(request) => request,
            Err(err) => {
                warn!(address, %err, "dropping unreadable request");
                return;
            }
        };
        let Some(mut result) = self.handle_ipc_command(&request) else {
            return;
        };

        // Synchronous replies never overtake the previous one.
        let now = self.timeline.now();
        if self.last_reply_time > now {
            result.reply_delay_ticks += self.last_reply_time - now;
        }
        self.last_reply_time = now + result.reply_delay_ticks;

        if result.send_reply {
            self.enqueue_ipc_reply(
                &request,
                result.return_value,
                result.reply_delay_ticks,
                ClockSource::Cpu,
            );
        }
    }

    /// Dispatches a decoded request. `None` means the request gets no reply at all.
    pub fn handle_ipc_command(&mut self, request: &Request) -> Option<IpcCommandResult> {
        let handled = match request.command {
            IpcCommand::Reply => {
                debug!(address = request.address, "reply in request queue");
                return None;
            }
            IpcCommand::Unknown(raw) => {
                warn!(command = raw, "unknown IPC command");
                return Some(IpcCommandResult::reply(ReturnCode::Invalid));
            }
            IpcCommand::Open => self.open_device(request),
            _ => self.dispatch_to_handle(request),
        };

        // The header decoded, so the block can still carry a reply.
        match handled {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(address = request.address, %err, "malformed request");
                Some(IpcCommandResult::reply(ReturnCode::Invalid))
            }
        }
    }

    /// Lowest free handle slot.
    pub fn get_free_device_id(&self) -> Option<Fd> {
        self.handles.lowest_free()
    }

    fn open_device(&mut self, request: &Request) -> Result<IpcCommandResult, RequestError> {
        let open_delay = self.config.open_reply_delay_ticks;
        let Some(fd) = self.get_free_device_id() else {
            warn!("no free handle");
            return Ok(IpcCommandResult::reply_after(ReturnCode::FdExhausted, open_delay));
        };

        let open = OpenRequest::decode(self.memory.as_ref(), *request, self.uid, self.gid)?;
        let Some(device) = self.get_device_by_name(&open.path) else {
            warn!(path = %open.path, "unknown device");
            return Ok(IpcCommandResult::reply_after(ReturnCode::NoEntry, open_delay));
        };

        let mut result = self.with_device(&device, |device, ctx| device.open(ctx, &open));
        if result.return_value >= ReturnCode::Success.code() {
            debug!(path = %open.path, %fd, "opened");
            self.handles.insert(fd, open.path, device);
            result.return_value = fd.return_value();
        }
        Ok(result)
    }

    fn dispatch_to_handle(&mut self, request: &Request) -> Result<IpcCommandResult, RequestError> {
        let Some((fd, device)) = Fd::from_raw(request.fd)
            .and_then(|fd| self.handles.get(fd).map(|device| (fd, Arc::clone(device))))
        else {
            warn!(fd = request.fd as i32, command = ?request.command, "invalid handle");
            return Ok(IpcCommandResult::reply(ReturnCode::Invalid));
        };

        let result = match request.command {
            IpcCommand::Close => {
                self.handles.remove(fd);
                self.with_device(&device, |device, ctx| device.close(ctx, fd))
            }
            IpcCommand::Read => {
                let rw = ReadWriteRequest::decode(self.memory.as_ref(), *request)?;
                self.with_device(&device, |device, ctx| device.read(ctx, &rw))
            }
            IpcCommand::Write => {
                let rw = ReadWriteRequest::decode(self.memory.as_ref(), *request)?;
                self.with_device(&device, |device, ctx| device.write(ctx, &rw))
            }
            IpcCommand::Seek => {
                let seek = SeekRequest::decode(self.memory.as_ref(), *request)?;
                self.with_device(&device, |device, ctx| device.seek(ctx, &seek))
            }
            IpcCommand::Ioctl => {
                let ioctl = IoctlRequest::decode(self.memory.as_ref(), *request)?;
                self.with_device(&device, |device, ctx| device.ioctl(ctx, &ioctl))
            }
            IpcCommand::Ioctlv => {
                let ioctlv = IoctlvRequest::decode(self.memory.as_ref(), *request)?;
                self.with_device(&device, |device, ctx| device.ioctlv(ctx, &ioctlv))
            }
            IpcCommand::Open | IpcCommand::Reply | IpcCommand::Unknown(_) => {
                IpcCommandResult::reply(ReturnCode::Invalid)
            }
        };
        Ok(result)
    }

    /// Runs `f` against a locked device, then schedules any CPU-clock replies it queued.
    fn with_device<R>(
        &mut self,
        device: &DeviceRef,
        f: impl FnOnce(&mut dyn Device, &mut DeviceContext<'_>) -> R,
    ) -> R {
        let mut deferred = Vec::new();
        let out = {
            let mut ctx = DeviceContext::new(
                self.memory.as_mut(),
                &self.replies,
                &mut deferred,
                self.uid,
                self.gid,
            );
            let mut guard = lock_device(device);
            f(&mut *guard, &mut ctx)
        };
        for (reply, delay) in deferred {
            self.schedule_reply(reply, delay, ClockSource::Cpu);
        }
        out
    }
}

fn write_reply_header(
    memory: &mut dyn GuestMemory,
    reply: &PendingReply,
) -> Result<(), crate::memory::MemoryError> {
    let base = reply.address;
    memory.write_u32_be(
        base.wrapping_add(OFFSET_RETURN_VALUE),
        reply.return_value as u32,
    )?;
    memory.write_u32_be(base.wrapping_add(OFFSET_FD), reply.command)?;
    memory.write_u32_be(base.wrapping_add(OFFSET_COMMAND), IpcCommand::Reply.raw())
}

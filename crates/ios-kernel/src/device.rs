use std::sync::{Arc, Mutex, MutexGuard};

use ios_io_snapshot::state::SnapshotResult;
use ios_timing::ClockSource;
use tracing::warn;

use crate::handles::Fd;
use crate::memory::GuestMemory;
use crate::reply::{PendingReply, ReplySender};
use crate::request::{IoctlRequest, IoctlvRequest, OpenRequest, ReadWriteRequest, SeekRequest};
use crate::result::{IpcCommandResult, ReturnCode};

/// Shared device instance. The kernel's name table owns one reference and every open handle
/// holds another.
pub type DeviceRef = Arc<Mutex<dyn Device>>;

/// Locks a device, recovering from a poisoned mutex.
pub fn lock_device(device: &DeviceRef) -> MutexGuard<'_, dyn Device + 'static> {
    match device.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Kernel services available to a device while it handles a command.
pub struct DeviceContext<'a> {
    pub memory: &'a mut dyn GuestMemory,
    pub uid: u32,
    pub gid: u16,
    replies: &'a ReplySender,
    cpu_replies: &'a mut Vec<(PendingReply, u64)>,
}

impl<'a> DeviceContext<'a> {
    pub fn new(
        memory: &'a mut dyn GuestMemory,
        replies: &'a ReplySender,
        cpu_replies: &'a mut Vec<(PendingReply, u64)>,
        uid: u32,
        gid: u16,
    ) -> Self {
        Self {
            memory,
            uid,
            gid,
            replies,
            cpu_replies,
        }
    }

    /// Handle for replying later from a host thread.
    pub fn reply_sender(&self) -> ReplySender {
        self.replies.clone()
    }

    /// Schedules an out-of-band reply for a request previously answered with
    /// [`IpcCommandResult::no_reply`].
    pub fn enqueue_reply(&mut self, reply: PendingReply, delay_ticks: u64, source: ClockSource) {
        match source {
            ClockSource::Cpu => self.cpu_replies.push((reply, delay_ticks)),
            ClockSource::Host => self.replies.send(reply, delay_ticks),
        }
    }
}

fn unsupported(name: &str, op: &'static str) -> IpcCommandResult {
    warn!(device = name, op, "unsupported command");
    IpcCommandResult::reply(ReturnCode::Invalid)
}

/// A virtual device reachable through IPC.
///
/// Handlers must not block: anything slow is started here and answered later through
/// [`DeviceContext::enqueue_reply`] or a [`ReplySender`].
pub trait Device: Send {
    fn name(&self) -> &str;

    fn open(&mut self, _ctx: &mut DeviceContext<'_>, _request: &OpenRequest) -> IpcCommandResult {
        IpcCommandResult::reply(ReturnCode::Success)
    }

    fn close(&mut self, _ctx: &mut DeviceContext<'_>, _fd: Fd) -> IpcCommandResult {
        IpcCommandResult::reply(ReturnCode::Success)
    }

    fn read(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _request: &ReadWriteRequest,
    ) -> IpcCommandResult {
        unsupported(self.name(), "read")
    }

    fn write(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _request: &ReadWriteRequest,
    ) -> IpcCommandResult {
        unsupported(self.name(), "write")
    }

    fn seek(&mut self, _ctx: &mut DeviceContext<'_>, _request: &SeekRequest) -> IpcCommandResult {
        unsupported(self.name(), "seek")
    }

    fn ioctl(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _request: &IoctlRequest,
    ) -> IpcCommandResult {
        unsupported(self.name(), "ioctl")
    }

    fn ioctlv(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        _request: &IoctlvRequest,
    ) -> IpcCommandResult {
        unsupported(self.name(), "ioctlv")
    }

    /// Periodic hook, called once per [`crate::Kernel::update_devices`].
    fn update(&mut self, _ctx: &mut DeviceContext<'_>) {}

    fn update_want_determinism(&mut self, _want_determinism: bool) {}

    /// Device-private state blob. Empty means stateless.
    fn save_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn load_state(&mut self, _bytes: &[u8]) -> SnapshotResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestRam;
    use crate::request::{IpcCommand, Request};

    struct Bare;

    impl Device for Bare {
        fn name(&self) -> &str {
            "/dev/bare"
        }
    }

    #[test]
    fn lock_device_recovers_a_poisoned_device() {
        let device: DeviceRef = Arc::new(Mutex::new(Bare));
        let poisoner = Arc::clone(&device);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(device.is_poisoned());
        assert_eq!(lock_device(&device).name(), "/dev/bare");
    }

    #[test]
    fn unimplemented_operations_reply_einval() {
        let mut ram = GuestRam::new(16);
        let sender = ReplySender::default();
        let mut deferred = Vec::new();
        let mut ctx = DeviceContext::new(&mut ram, &sender, &mut deferred, 0, 0);
        let request = Request {
            address: 0,
            command: IpcCommand::Seek,
            fd: 0,
        };
        let seek = SeekRequest {
            request,
            offset: 0,
            mode: crate::request::SeekMode::Set,
        };

        let result = Bare.seek(&mut ctx, &seek);
        assert_eq!(result, IpcCommandResult::reply(ReturnCode::Invalid));
    }

    #[test]
    fn cpu_replies_are_deferred_host_replies_are_queued() {
        let mut ram = GuestRam::new(16);
        let sender = ReplySender::default();
        let mut deferred = Vec::new();
        let request = Request {
            address: 0x40,
            command: IpcCommand::Ioctl,
            fd: 1,
        };
        {
            let mut ctx = DeviceContext::new(&mut ram, &sender, &mut deferred, 0, 0);
            ctx.enqueue_reply(PendingReply::new(&request, 1), 5, ClockSource::Cpu);
            ctx.enqueue_reply(PendingReply::new(&request, 2), 5, ClockSource::Host);
        }
        assert_eq!(deferred.len(), 1);
        assert!(!sender.is_idle());
    }
}

use tracing::debug;

use crate::device::{Device, DeviceContext};
use crate::handles::Fd;
use crate::request::{IoctlRequest, IoctlvRequest, OpenRequest};
use crate::result::{IpcCommandResult, ReturnCode};

/// Placeholder for a well-known device that is not emulated. Every command succeeds.
#[derive(Debug, Clone)]
pub struct StubDevice {
    name: String,
}

impl StubDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Device for StubDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, _ctx: &mut DeviceContext<'_>, request: &OpenRequest) -> IpcCommandResult {
        debug!(device = %self.name, flags = ?request.flags, "stub open");
        IpcCommandResult::reply(ReturnCode::Success)
    }

    fn close(&mut self, _ctx: &mut DeviceContext<'_>, fd: Fd) -> IpcCommandResult {
        debug!(device = %self.name, %fd, "stub close");
        IpcCommandResult::reply(ReturnCode::Success)
    }

    fn ioctl(&mut self, _ctx: &mut DeviceContext<'_>, request: &IoctlRequest) -> IpcCommandResult {
        debug!(device = %self.name, code = request.code, "stub ioctl");
        IpcCommandResult::reply(ReturnCode::Success)
    }

    fn ioctlv(
        &mut self,
        _ctx: &mut DeviceContext<'_>,
        request: &IoctlvRequest,
    ) -> IpcCommandResult {
        debug!(device = %self.name, code = request.code, "stub ioctlv");
        IpcCommandResult::reply(ReturnCode::Success)
    }
}

use ios_timing::HostEventQueue;

use crate::memory::GuestWrite;
use crate::request::Request;

/// Reply for one request, written into guest memory when it is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReply {
    pub address: u32,
    /// Raw command word of the original request, echoed back at `+0x08`.
    pub command: u32,
    pub return_value: i32,
    /// Data copied into guest buffers before the reply becomes visible.
    pub writes: Vec<GuestWrite>,
}

impl PendingReply {
    pub fn new(request: &Request, return_value: i32) -> Self {
        Self {
            address: request.address,
            command: request.command.raw(),
            return_value,
            writes: Vec::new(),
        }
    }

    pub fn with_writes(mut self, writes: Vec<GuestWrite>) -> Self {
        self.writes = writes;
        self
    }
}

/// Timeline payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcEvent {
    Reply(PendingReply),
    Acknowledgement(u32),
}

/// Cloneable handle for delivering replies from any thread.
///
/// Replies sent here are measured against the host clock: their delay starts when the emulation
/// thread next advances the kernel.
#[derive(Debug, Clone, Default)]
pub struct ReplySender {
    queue: HostEventQueue<IpcEvent>,
}

impl ReplySender {
    pub fn new(queue: HostEventQueue<IpcEvent>) -> Self {
        Self { queue }
    }

    pub fn send(&self, reply: PendingReply, delay_ticks: u64) {
        self.queue.push(delay_ticks, IpcEvent::Reply(reply));
    }

    pub fn send_acknowledgement(&self, address: u32, delay_ticks: u64) {
        self.queue
            .push(delay_ticks, IpcEvent::Acknowledgement(address));
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::IpcCommand;

    #[test]
    fn replies_land_on_the_shared_host_queue() {
        let queue = HostEventQueue::new();
        let sender = ReplySender::new(queue.clone());
        let request = Request {
            address: 0x80,
            command: IpcCommand::Ioctlv,
            fd: 0,
        };
        sender.send(PendingReply::new(&request, 64), 10);
        assert!(!sender.is_idle());

        let events = queue.drain();
        assert_eq!(events.len(), 1);
        let (delay, IpcEvent::Reply(reply)) = &events[0] else {
            panic!("expected a reply");
        };
        assert_eq!(*delay, 10);
        assert_eq!((reply.address, reply.command, reply.return_value), (0x80, 7, 64));
    }
}

use std::sync::{Arc, Mutex};

/// The IPC hardware between the kernel and the guest CPU.
pub trait IpcInterrupts: Send {
    /// `true` when no previously raised signal is still waiting for the guest.
    fn is_ready(&self) -> bool;
    /// Tells the guest that the request at `address` was taken off the queue.
    fn generate_ack(&mut self, address: u32);
    /// Tells the guest that the reply at `address` is ready.
    fn generate_reply(&mut self, address: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcSignal {
    Ack(u32),
    Reply(u32),
}

/// Register-level model of the IPC flags: one outstanding signal at a time, cleared by the guest.
#[derive(Debug, Default)]
pub struct IpcRegisters {
    busy: bool,
    auto_acknowledge: bool,
    signals: Vec<IpcSignal>,
}

impl IpcRegisters {
    /// Registers that stay busy after each signal until [`IpcRegisters::acknowledge`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers whose guest acknowledges every signal immediately.
    pub fn auto_acknowledging() -> Self {
        Self {
            auto_acknowledge: true,
            ..Self::default()
        }
    }

    /// Guest side: clears the outstanding signal.
    pub fn acknowledge(&mut self) {
        self.busy = false;
    }

    pub fn signals(&self) -> &[IpcSignal] {
        &self.signals
    }

    pub fn take_signals(&mut self) -> Vec<IpcSignal> {
        std::mem::take(&mut self.signals)
    }

    fn raise(&mut self, signal: IpcSignal) {
        self.signals.push(signal);
        self.busy = !self.auto_acknowledge;
    }
}

impl IpcInterrupts for IpcRegisters {
    fn is_ready(&self) -> bool {
        !self.busy
    }

    fn generate_ack(&mut self, address: u32) {
        self.raise(IpcSignal::Ack(address));
    }

    fn generate_reply(&mut self, address: u32) {
        self.raise(IpcSignal::Reply(address));
    }
}

impl<T: IpcInterrupts + ?Sized> IpcInterrupts for Arc<Mutex<T>> {
    fn is_ready(&self) -> bool {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_ready()
    }

    fn generate_ack(&mut self, address: u32) {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .generate_ack(address);
    }

    fn generate_reply(&mut self, address: u32) {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .generate_reply(address);
    }
}

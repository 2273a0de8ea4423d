use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use ios_kernel::{GuestWrite, ReturnCode};
use tracing::{error, info, warn};

use crate::error::{USB_ESTALL, USB_ETRANSFER};
use crate::host::{HostCompletion, HostDeviceHandle, TransferId, TransferStatus};
use crate::transfer::TransferCommand;

/// In-flight transfers on one endpoint address.
///
/// Submissions happen on the emulation thread; completions arrive on whatever thread the host
/// stack runs its callbacks on. The map lock is never held across a call into the host.
#[derive(Debug)]
pub struct TransferEndpoint {
    address: u8,
    vid: u16,
    pid: u16,
    transfers: Mutex<BTreeMap<TransferId, TransferCommand>>,
}

impl TransferEndpoint {
    pub fn new(address: u8, vid: u16, pid: u16) -> Self {
        Self {
            address,
            vid,
            pid,
            transfers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<TransferId, TransferCommand>> {
        self.transfers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_transfer(&self, id: TransferId, command: TransferCommand) {
        self.lock().insert(id, command);
    }

    /// Finishes a transfer and replies to the guest. Completions for unknown ids are dropped.
    pub fn handle_transfer<F>(&self, completion: HostCompletion, fill: F)
    where
        F: FnOnce(&TransferCommand, &HostCompletion) -> (i32, Vec<GuestWrite>),
    {
        let mut transfers = self.lock();
        let Some(command) = transfers.remove(&completion.id) else {
            error!(
                vid = self.vid,
                pid = self.pid,
                endpoint = self.address,
                id = %completion.id,
                "no such transfer"
            );
            return;
        };

        let (return_value, writes) = match completion.status {
            TransferStatus::Completed => fill(&command, &completion),
            TransferStatus::Error
            | TransferStatus::Cancelled
            | TransferStatus::TimedOut
            | TransferStatus::Overflow
            | TransferStatus::Stall => {
                error!(
                    vid = self.vid,
                    pid = self.pid,
                    endpoint = self.address,
                    status = ?completion.status,
                    "transfer failed"
                );
                let rv = if completion.status == TransferStatus::Stall {
                    USB_ESTALL
                } else {
                    USB_ETRANSFER
                };
                (rv, Vec::new())
            }
            TransferStatus::NoDevice => (ReturnCode::NoEntry.code(), Vec::new()),
        };
        command.on_transfer_complete(return_value, writes);
    }

    /// Asks the host to cancel everything tracked here. Each transfer is still finished through
    /// [`Self::handle_transfer`].
    pub fn cancel_transfers(&self, handle: &mut dyn HostDeviceHandle) {
        let ids: Vec<TransferId> = self.lock().keys().copied().collect();
        if ids.is_empty() {
            return;
        }
        info!(
            vid = self.vid,
            pid = self.pid,
            endpoint = self.address,
            count = ids.len(),
            "cancelling transfers"
        );
        for id in ids {
            if let Err(err) = handle.cancel(id) {
                warn!(endpoint = self.address, %id, %err, "failed to cancel transfer");
            }
        }
    }

    /// Drops a transfer the host never accepted.
    pub fn remove_transfer(&self, id: TransferId) -> Option<TransferCommand> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

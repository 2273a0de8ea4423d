use thiserror::Error;

use crate::memory::{GuestMemory, MemoryError};

#[derive(Debug, Error)]
pub enum BootError {
    #[error("firmware image for title {title_id:#018x} is unavailable: {reason}")]
    ImageUnavailable { title_id: u64, reason: String },

    #[error("failed to place firmware image in guest memory: {0}")]
    Memory(#[from] MemoryError),
}

/// Places a PPC boot image in guest memory. Signature checks and image formats live behind this
/// trait.
pub trait FirmwareLoader {
    fn load(&mut self, title_id: u64, memory: &mut dyn GuestMemory) -> Result<(), BootError>;
}

impl<F> FirmwareLoader for F
where
    F: FnMut(u64, &mut dyn GuestMemory) -> Result<(), BootError>,
{
    fn load(&mut self, title_id: u64, memory: &mut dyn GuestMemory) -> Result<(), BootError> {
        self(title_id, memory)
    }
}

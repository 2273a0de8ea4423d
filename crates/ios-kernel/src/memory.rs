//! Guest physical memory as seen by the kernel.
//!
//! The guest CPU is big-endian; every multi-byte helper here reads and writes big-endian unless
//! its name says otherwise.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("guest access out of range: {addr:#010x}+{len:#x}")]
    OutOfRange { addr: u32, len: usize },

    #[error("unterminated guest string at {addr:#010x}")]
    UnterminatedString { addr: u32 },
}

/// Address-space primitives injected into the kernel.
pub trait GuestMemory: Send {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError>;
}

pub trait GuestMemoryExt: GuestMemory {
    fn read_u8(&self, addr: u32) -> Result<u8, MemoryError> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_be(&self, addr: u32) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u16_le(&self, addr: u32) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_be(&self, addr: u32) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_vec(&self, addr: u32, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes (terminator excluded).
    fn read_c_string(&self, addr: u32, max_len: usize) -> Result<String, MemoryError> {
        let mut out = Vec::new();
        for i in 0..=max_len {
            let at = addr
                .checked_add(i as u32)
                .ok_or(MemoryError::OutOfRange { addr, len: i + 1 })?;
            match self.read_u8(at)? {
                0 => return Ok(String::from_utf8_lossy(&out).into_owned()),
                b => out.push(b),
            }
        }
        Err(MemoryError::UnterminatedString { addr })
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    fn write_u16_be(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_be_bytes())
    }

    fn write_u32_be(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_be_bytes())
    }
}

impl<T: GuestMemory + ?Sized> GuestMemoryExt for T {}

/// Flat guest RAM starting at physical address 0.
#[derive(Debug, Clone)]
pub struct GuestRam {
    data: Vec<u8>,
}

impl GuestRam {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, addr: u32, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let start = addr as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(MemoryError::OutOfRange { addr, len })?;
        Ok(start..end)
    }
}

impl GuestMemory for GuestRam {
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }
}

/// A guest memory write produced off the emulation thread and applied when its reply is
/// delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestWrite {
    pub address: u32,
    pub data: Vec<u8>,
}

impl GuestWrite {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    pub fn apply(&self, memory: &mut dyn GuestMemory) -> Result<(), MemoryError> {
        memory.write(self.address, &self.data)
    }
}

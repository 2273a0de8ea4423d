//! Decoding of guest IPC command blocks.
//!
//! Every block starts with three big-endian words (`command`, `return value`, `fd`) followed by
//! command-specific arguments.

use bitflags::bitflags;
use thiserror::Error;

use crate::memory::{GuestMemory, GuestMemoryExt, MemoryError};

/// Longest device path accepted by OPEN, terminator excluded.
pub const MAX_PATH_LEN: usize = 0x100;
/// Upper bound on `in + io` vectors in one IOCTLV.
pub const MAX_IOCTLV_VECTORS: usize = 32;

pub(crate) const OFFSET_COMMAND: u32 = 0x00;
pub(crate) const OFFSET_RETURN_VALUE: u32 = 0x04;
pub(crate) const OFFSET_FD: u32 = 0x08;
const OFFSET_ARGS: u32 = 0x0c;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("ioctlv at {address:#010x} has {count} vectors (max {MAX_IOCTLV_VECTORS})")]
    TooManyVectors { address: u32, count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpcCommand {
    Open,
    Close,
    Read,
    Write,
    Seek,
    Ioctl,
    Ioctlv,
    Reply,
    Unknown(u32),
}

impl IpcCommand {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::Close,
            3 => Self::Read,
            4 => Self::Write,
            5 => Self::Seek,
            6 => Self::Ioctl,
            7 => Self::Ioctlv,
            8 => Self::Reply,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Open => 1,
            Self::Close => 2,
            Self::Read => 3,
            Self::Write => 4,
            Self::Seek => 5,
            Self::Ioctl => 6,
            Self::Ioctlv => 7,
            Self::Reply => 8,
            Self::Unknown(other) => other,
        }
    }
}

/// Header shared by every command block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub address: u32,
    pub command: IpcCommand,
    pub fd: u32,
}

impl Request {
    pub fn decode(memory: &dyn GuestMemory, address: u32) -> Result<Self, RequestError> {
        let command = memory.read_u32_be(address.wrapping_add(OFFSET_COMMAND))?;
        Ok(Self {
            address,
            command: IpcCommand::from_raw(command),
            fd: memory.read_u32_be(address.wrapping_add(OFFSET_FD))?,
        })
    }

    fn arg(&self, memory: &dyn GuestMemory, index: u32) -> Result<u32, MemoryError> {
        memory.read_u32_be(self.address.wrapping_add(OFFSET_ARGS + index * 4))
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenMode: u32 {
        const READ = 1;
        const WRITE = 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub request: Request,
    pub path: String,
    pub flags: OpenMode,
    pub uid: u32,
    pub gid: u16,
}

impl OpenRequest {
    /// `uid`/`gid` are the caller's identity at decode time.
    pub fn decode(
        memory: &dyn GuestMemory,
        request: Request,
        uid: u32,
        gid: u16,
    ) -> Result<Self, RequestError> {
        let path_ptr = request.arg(memory, 0)?;
        let path = memory.read_c_string(path_ptr, MAX_PATH_LEN)?;
        let flags = OpenMode::from_bits_truncate(request.arg(memory, 1)?);
        Ok(Self {
            request,
            path,
            flags,
            uid,
            gid,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadWriteRequest {
    pub request: Request,
    pub buffer: u32,
    pub size: u32,
}

impl ReadWriteRequest {
    pub fn decode(memory: &dyn GuestMemory, request: Request) -> Result<Self, RequestError> {
        Ok(Self {
            request,
            buffer: request.arg(memory, 0)?,
            size: request.arg(memory, 1)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Set,
    Current,
    End,
    Unknown(u32),
}

impl SeekMode {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::Set,
            1 => Self::Current,
            2 => Self::End,
            other => Self::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekRequest {
    pub request: Request,
    pub offset: u32,
    pub mode: SeekMode,
}

impl SeekRequest {
    pub fn decode(memory: &dyn GuestMemory, request: Request) -> Result<Self, RequestError> {
        Ok(Self {
            request,
            offset: request.arg(memory, 0)?,
            mode: SeekMode::from_raw(request.arg(memory, 1)?),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoctlRequest {
    pub request: Request,
    pub code: u32,
    pub buffer_in: u32,
    pub buffer_in_size: u32,
    pub buffer_out: u32,
    pub buffer_out_size: u32,
}

impl IoctlRequest {
    pub fn decode(memory: &dyn GuestMemory, request: Request) -> Result<Self, RequestError> {
        Ok(Self {
            request,
            code: request.arg(memory, 0)?,
            buffer_in: request.arg(memory, 1)?,
            buffer_in_size: request.arg(memory, 2)?,
            buffer_out: request.arg(memory, 3)?,
            buffer_out_size: request.arg(memory, 4)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoVector {
    pub address: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoctlvRequest {
    pub request: Request,
    pub code: u32,
    pub in_vectors: Vec<IoVector>,
    pub io_vectors: Vec<IoVector>,
}

impl IoctlvRequest {
    pub fn decode(memory: &dyn GuestMemory, request: Request) -> Result<Self, RequestError> {
        let code = request.arg(memory, 0)?;
        let in_count = request.arg(memory, 1)? as usize;
        let io_count = request.arg(memory, 2)? as usize;
        let table = request.arg(memory, 3)?;

        let count = in_count.saturating_add(io_count);
        if count > MAX_IOCTLV_VECTORS {
            return Err(RequestError::TooManyVectors {
                address: request.address,
                count,
            });
        }

        let mut vectors = Vec::with_capacity(count);
        for i in 0..count as u32 {
            let entry = table.wrapping_add(i * 8);
            vectors.push(IoVector {
                address: memory.read_u32_be(entry)?,
                size: memory.read_u32_be(entry.wrapping_add(4))?,
            });
        }
        let io_vectors = vectors.split_off(in_count);
        Ok(Self {
            request,
            code,
            in_vectors: vectors,
            io_vectors,
        })
    }

    /// Input vector `index`, if present and at least `min_size` bytes long.
    pub fn in_vector(&self, index: usize, min_size: u32) -> Option<IoVector> {
        self.in_vectors
            .get(index)
            .copied()
            .filter(|v| v.size >= min_size)
    }

    pub fn io_vector(&self, index: usize, min_size: u32) -> Option<IoVector> {
        self.io_vectors
            .get(index)
            .copied()
            .filter(|v| v.size >= min_size)
    }
}

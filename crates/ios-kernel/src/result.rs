use ios_timing::CPU_CLOCK_HZ;

/// Reply latency used when a device has no better estimate.
pub const DEFAULT_REPLY_DELAY_TICKS: u64 = CPU_CLOCK_HZ / 4000;

/// Guest-visible IPC return codes. Successful commands return a non-negative value whose meaning
/// depends on the command (a handle, a byte count, an offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReturnCode {
    Success = 0,
    AccessDenied = -1,
    Exists = -2,
    Invalid = -4,
    NoEntry = -6,
    QueueFull = -8,
    Io = -12,
    NoMemory = -22,
    FdExhausted = -109,
}

impl ReturnCode {
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl From<ReturnCode> for i32 {
    fn from(code: ReturnCode) -> Self {
        code.code()
    }
}

/// Outcome of dispatching one command to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcCommandResult {
    pub return_value: i32,
    /// `false` when the device will deliver the reply itself later.
    pub send_reply: bool,
    pub reply_delay_ticks: u64,
}

impl IpcCommandResult {
    pub fn reply(return_value: impl Into<i32>) -> Self {
        Self::reply_after(return_value, DEFAULT_REPLY_DELAY_TICKS)
    }

    pub fn reply_after(return_value: impl Into<i32>, reply_delay_ticks: u64) -> Self {
        Self {
            return_value: return_value.into(),
            send_reply: true,
            reply_delay_ticks,
        }
    }

    pub fn no_reply() -> Self {
        Self {
            return_value: ReturnCode::Success.code(),
            send_reply: false,
            reply_delay_ticks: 0,
        }
    }
}

//! Scripted IPC sessions.
//!
//! A script is a JSON object with a `steps` array. Each step writes one command block into guest
//! RAM at `block` and queues it, or advances the clock:
//!
//! ```json
//! { "steps": [
//!     { "op": "open", "block": 256, "path": "/dev/es" },
//!     { "op": "ioctl", "block": 512, "fd": 0, "code": 1, "input": [1, 2], "output_size": 4 },
//!     { "op": "advance", "ticks": 200000 },
//!     { "op": "close", "block": 768, "fd": 0 }
//! ] }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use ios_kernel::request::IpcCommand;
use ios_kernel::{GuestMemoryExt, GuestRam, IpcRegisters, IpcSignal, Kernel, KernelConfig};
use serde::{Deserialize, Serialize};

/// Offsets from the command block where step payloads are placed.
const PATH_OFFSET: u32 = 0x40;
const INPUT_OFFSET: u32 = 0x80;
const OUTPUT_OFFSET: u32 = 0xc0;

fn default_open_mode() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Open {
        block: u32,
        path: String,
        #[serde(default = "default_open_mode")]
        mode: u32,
    },
    Close {
        block: u32,
        fd: u32,
    },
    Ioctl {
        block: u32,
        fd: u32,
        code: u32,
        #[serde(default)]
        input: Vec<u8>,
        #[serde(default)]
        output_size: u32,
    },
    Advance {
        ticks: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    pub steps: Vec<Step>,
}

impl Script {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("invalid script {}", path.display()))
    }
}

/// One reply as it became visible to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyRecord {
    pub tick: u64,
    pub block: u32,
    pub command: u32,
    pub return_value: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<u8>>,
}

pub struct Replay {
    kernel: Kernel,
    regs: Arc<Mutex<IpcRegisters>>,
    outputs: BTreeMap<u32, (u32, u32)>,
}

impl Replay {
    pub fn new(config: KernelConfig, ram_size: usize) -> Self {
        let regs = Arc::new(Mutex::new(IpcRegisters::auto_acknowledging()));
        let kernel = Kernel::new(
            config,
            Box::new(GuestRam::new(ram_size)),
            Box::new(Arc::clone(&regs)),
        );
        Self {
            kernel,
            regs,
            outputs: BTreeMap::new(),
        }
    }

    fn regs(&self) -> MutexGuard<'_, IpcRegisters> {
        self.regs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_words(&mut self, address: u32, words: &[u32]) -> Result<()> {
        let memory = self.kernel.memory_mut();
        for (i, word) in words.iter().enumerate() {
            let at = address.wrapping_add(i as u32 * 4);
            memory
                .write_u32_be(at, *word)
                .with_context(|| format!("command block {address:#x} is outside guest RAM"))?;
        }
        Ok(())
    }

    fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> Result<()> {
        self.kernel
            .memory_mut()
            .write(address, bytes)
            .with_context(|| format!("buffer at {address:#x} is outside guest RAM"))
    }

    /// Runs one step and returns the replies delivered while doing so.
    pub fn run_step(&mut self, step: &Step) -> Result<Vec<ReplyRecord>> {
        tracing::debug!(?step, "step");
        match step {
            Step::Open { block, path, mode } => {
                let path_ptr = block.wrapping_add(PATH_OFFSET);
                let mut bytes = path.as_bytes().to_vec();
                bytes.push(0);
                self.write_bytes(path_ptr, &bytes)?;
                self.write_words(*block, &[IpcCommand::Open.raw(), 0, 0, path_ptr, *mode])?;
                self.kernel.enqueue_ipc_request(*block);
            }
            Step::Close { block, fd } => {
                self.write_words(*block, &[IpcCommand::Close.raw(), 0, *fd])?;
                self.kernel.enqueue_ipc_request(*block);
            }
            Step::Ioctl {
                block,
                fd,
                code,
                input,
                output_size,
            } => {
                let input_ptr = block.wrapping_add(INPUT_OFFSET);
                let output_ptr = block.wrapping_add(OUTPUT_OFFSET);
                self.write_bytes(input_ptr, input)?;
                self.write_bytes(output_ptr, &vec![0; *output_size as usize])?;
                let words = [
                    IpcCommand::Ioctl.raw(),
                    0,
                    *fd,
                    *code,
                    input_ptr,
                    input.len() as u32,
                    output_ptr,
                    *output_size,
                ];
                self.write_words(*block, &words)?;
                if *output_size > 0 {
                    self.outputs.insert(*block, (output_ptr, *output_size));
                }
                self.kernel.enqueue_ipc_request(*block);
            }
            Step::Advance { ticks } => self.kernel.advance(*ticks),
        }
        self.collect()
    }

    /// Advances the clock by `ticks` so outstanding replies are delivered.
    pub fn settle(&mut self, ticks: u64) -> Result<Vec<ReplyRecord>> {
        self.kernel.advance(ticks);
        self.collect()
    }

    fn collect(&mut self) -> Result<Vec<ReplyRecord>> {
        let signals = self.regs().take_signals();
        let mut records = Vec::new();
        for signal in signals {
            let IpcSignal::Reply(block) = signal else {
                continue;
            };
            let memory = self.kernel.memory();
            let output = match self.outputs.remove(&block) {
                Some((address, size)) => Some(memory.read_vec(address, size as usize)?),
                None => None,
            };
            records.push(ReplyRecord {
                tick: self.kernel.now(),
                block,
                command: memory.read_u32_be(block.wrapping_add(8))?,
                return_value: memory.read_u32_be(block.wrapping_add(4))? as i32,
                output,
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_tagged_by_op() {
        let script: Script = serde_json::from_str(
            r#"{ "steps": [
                { "op": "open", "block": 256, "path": "/dev/es" },
                { "op": "advance", "ticks": 10 }
            ] }"#,
        )
        .unwrap();
        assert_eq!(
            script.steps[0],
            Step::Open {
                block: 256,
                path: "/dev/es".into(),
                mode: 3
            }
        );
        assert_eq!(script.steps[1], Step::Advance { ticks: 10 });
    }

    #[test]
    fn replay_reports_each_reply_once() {
        let config = KernelConfig::from_json_str(r#"{ "static_devices": ["/dev/es"] }"#).unwrap();
        let mut replay = Replay::new(config, 0x4000);
        let open = Step::Open {
            block: 0x100,
            path: "/dev/es".into(),
            mode: 3,
        };
        assert!(replay.run_step(&open).unwrap().is_empty());

        let records = replay.settle(ios_kernel::CPU_CLOCK_HZ).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].block, 0x100);
        assert_eq!(records[0].return_value, 0);
        assert!(replay.settle(ios_kernel::CPU_CLOCK_HZ).unwrap().is_empty());
    }
}

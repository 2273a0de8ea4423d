#![forbid(unsafe_code)]

mod script;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ios_kernel::{KernelConfig, CPU_CLOCK_HZ};

use crate::script::{Replay, Script};

const DEFAULT_RAM_SIZE: usize = 0x10_0000;

#[derive(Parser, Debug)]
#[command(
    name = "ios-replay",
    about = "Replay a scripted IPC session against the IOS kernel and print every reply as JSON."
)]
struct Args {
    /// Script of IPC steps (JSON)
    script: PathBuf,

    /// Kernel configuration (JSON); defaults are used when omitted
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Guest RAM size in bytes
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_RAM_SIZE)]
    ram_size: usize,

    /// Ticks to run after the last step so outstanding replies are delivered
    #[arg(long, value_name = "TICKS", default_value_t = CPU_CLOCK_HZ)]
    settle_ticks: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => KernelConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => KernelConfig::default(),
    };
    let script = Script::from_path(&args.script)?;
    tracing::info!(steps = script.steps.len(), title_id = config.title_id, "replaying");

    let mut replay = Replay::new(config, args.ram_size);
    let mut out = io::stdout().lock();
    for (index, step) in script.steps.iter().enumerate() {
        let records = replay
            .run_step(step)
            .with_context(|| format!("step {index} failed"))?;
        for record in records {
            writeln!(out, "{}", serde_json::to_string(&record)?)?;
        }
    }
    for record in replay.settle(args.settle_ticks)? {
        writeln!(out, "{}", serde_json::to_string(&record)?)?;
    }
    Ok(())
}

//! Deterministic virtual time for the IOS kernel.
//!
//! # Design
//!
//! This crate provides a [`Clock`] (monotonic count of guest CPU cycles) and a [`Timeline`]
//! of one-shot events keyed by the cycle at which they mature.
//!
//! The timeline uses **event delivery** rather than storing callbacks: the owner pops due
//! events with [`Timeline::pop_due`] and dispatches them itself. This keeps the queue fully
//! serializable for save/restore.
//!
//! Code running off the emulation thread cannot touch the timeline directly. It pushes onto a
//! [`HostEventQueue`] instead, and the owner folds those events in with
//! [`Timeline::merge_host_events`], anchoring their delay on the CPU clock at merge time.

mod clock;
mod host_queue;
mod timeline;

pub use clock::{Clock, ClockState};
pub use host_queue::HostEventQueue;
pub use timeline::{ScheduledEvent, Timeline};

/// Guest CPU clock rate, in ticks per second.
pub const CPU_CLOCK_HZ: u64 = 729_000_000;

/// Which clock a delayed event is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockSource {
    /// Scheduled from the emulation thread, relative to the current CPU cycle.
    #[default]
    Cpu,
    /// Scheduled from a host thread; relative to the CPU cycle at which the emulation thread
    /// next picks it up.
    Host,
}

/// Converts microseconds of guest time into CPU ticks.
pub const fn ticks_from_us(us: u64) -> u64 {
    us * (CPU_CLOCK_HZ / 1_000_000)
}

use std::collections::BTreeMap;

use crate::clock::Clock;
use crate::host_queue::HostEventQueue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledEvent<E> {
    pub deadline: u64,
    pub event: E,
}

/// One-shot event queue driven by a cycle [`Clock`].
///
/// Events are ordered by `(deadline, insertion sequence)`: equal deadlines fire in the order
/// they were scheduled.
#[derive(Debug)]
pub struct Timeline<E> {
    clock: Clock,
    next_seq: u64,
    events: BTreeMap<(u64, u64), E>,
    host: HostEventQueue<E>,
}

impl<E> Default for Timeline<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Timeline<E> {
    pub fn new() -> Self {
        Self {
            clock: Clock::new(),
            next_seq: 0,
            events: BTreeMap::new(),
            host: HostEventQueue::new(),
        }
    }

    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Handle for scheduling from other threads.
    pub fn host_queue(&self) -> HostEventQueue<E> {
        self.host.clone()
    }

    /// Schedules `event` to mature `delay` ticks from now. Returns the absolute deadline.
    pub fn schedule(&mut self, delay: u64, event: E) -> u64 {
        let deadline = self.now().saturating_add(delay);
        self.schedule_at(deadline, event);
        deadline
    }

    /// Schedules at an absolute tick. Deadlines in the past mature on the next `pop_due`.
    pub fn schedule_at(&mut self, deadline: u64, event: E) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.insert((deadline, seq), event);
    }

    /// Moves everything pushed onto the host queue into the timeline. Returns how many events
    /// were merged.
    pub fn merge_host_events(&mut self) -> usize {
        let pending = self.host.drain();
        let count = pending.len();
        for (delay, event) in pending {
            self.schedule(delay, event);
        }
        count
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.events.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Removes the earliest event maturing at or before `until` and moves the clock to its
    /// deadline.
    pub fn pop_due(&mut self, until: u64) -> Option<ScheduledEvent<E>> {
        let (&(deadline, seq), _) = self.events.iter().next()?;
        if deadline > until {
            return None;
        }
        let event = self.events.remove(&(deadline, seq))?;
        self.clock.advance_to(deadline);
        Some(ScheduledEvent { deadline, event })
    }

    pub fn advance_clock_to(&mut self, ticks: u64) {
        self.clock.advance_to(ticks);
    }

    /// Pending events in firing order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &E)> {
        self.events.iter().map(|(&(deadline, _), event)| (deadline, event))
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.host.drain();
    }

    /// Replaces the clock and the whole queue, e.g. when loading a snapshot. `events` must be in
    /// firing order (as produced by [`Timeline::iter`]).
    pub fn restore(&mut self, now: u64, events: impl IntoIterator<Item = (u64, E)>) {
        self.events.clear();
        self.host.drain();
        self.next_seq = 0;
        self.clock = Clock::new();
        self.clock.advance_to(now);
        for (deadline, event) in events {
            self.schedule_at(deadline, event);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Clock {
    now_ticks: u64,
}

impl Clock {
    pub const fn new() -> Self {
        Self { now_ticks: 0 }
    }

    /// Returns the current virtual time, in CPU ticks.
    #[inline]
    pub const fn now(&self) -> u64 {
        self.now_ticks
    }

    /// Moves the clock forward to `ticks`. Never moves it backwards.
    #[inline]
    pub fn advance_to(&mut self, ticks: u64) {
        self.now_ticks = self.now_ticks.max(ticks);
    }

    #[inline]
    pub fn advance(&mut self, ticks: u64) {
        self.now_ticks = self.now_ticks.saturating_add(ticks);
    }

    #[inline]
    pub const fn save_state(&self) -> ClockState {
        ClockState {
            now_ticks: self.now_ticks,
        }
    }

    /// Sets the current time for save/restore. This may move time backwards; callers must
    /// restore the event queue from the same snapshot.
    #[inline]
    pub fn restore_state(&mut self, state: ClockState) {
        self.now_ticks = state.now_ticks;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClockState {
    pub now_ticks: u64,
}

use std::fmt;

use crate::device::DeviceRef;

/// Number of handle slots the guest can have open at once.
pub const IPC_MAX_FDS: usize = 0x18;

/// Index into the handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fd(u8);

impl Fd {
    /// Validates a raw guest value. Negative values and indices past the table are rejected.
    pub fn from_raw(raw: u32) -> Option<Self> {
        (raw < IPC_MAX_FDS as u32).then_some(Self(raw as u8))
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Value returned to the guest by a successful OPEN.
    pub fn return_value(self) -> i32 {
        i32::from(self.0)
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Slot {
    name: String,
    device: DeviceRef,
}

/// Fixed arena of open handles with lowest-index allocation.
pub struct HandleTable {
    occupied: u32,
    slots: [Option<Slot>; IPC_MAX_FDS],
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(fd, name, _)| (fd.0, name)))
            .finish()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            occupied: 0,
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Lowest free slot, or `None` when every slot is in use.
    pub fn lowest_free(&self) -> Option<Fd> {
        let free = !self.occupied & ((1u32 << IPC_MAX_FDS) - 1);
        (free != 0).then(|| Fd(free.trailing_zeros() as u8))
    }

    pub fn insert(&mut self, fd: Fd, name: impl Into<String>, device: DeviceRef) {
        debug_assert!(!self.is_occupied(fd), "handle {fd} already occupied");
        self.slots[fd.index()] = Some(Slot {
            name: name.into(),
            device,
        });
        self.occupied |= 1 << fd.0;
    }

    pub fn get(&self, fd: Fd) -> Option<&DeviceRef> {
        self.slots[fd.index()].as_ref().map(|slot| &slot.device)
    }

    pub fn name(&self, fd: Fd) -> Option<&str> {
        self.slots[fd.index()].as_ref().map(|slot| slot.name.as_str())
    }

    pub fn remove(&mut self, fd: Fd) -> Option<DeviceRef> {
        self.occupied &= !(1 << fd.0);
        self.slots[fd.index()].take().map(|slot| slot.device)
    }

    pub fn is_occupied(&self, fd: Fd) -> bool {
        self.occupied & (1 << fd.0) != 0
    }

    pub fn len(&self) -> usize {
        self.occupied.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn clear(&mut self) {
        self.occupied = 0;
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    /// Occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (Fd, &str, &DeviceRef)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.as_ref()
                .map(|slot| (Fd(i as u8), slot.name.as_str(), &slot.device))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubDevice;
    use std::sync::{Arc, Mutex};

    fn stub() -> DeviceRef {
        Arc::new(Mutex::new(StubDevice::new("/dev/stub")))
    }

    #[test]
    fn allocation_prefers_lowest_index() {
        let mut table = HandleTable::new();
        for _ in 0..3 {
            let fd = table.lowest_free().unwrap();
            table.insert(fd, "/dev/stub", stub());
        }
        assert_eq!(table.len(), 3);

        let one = Fd::from_raw(1).unwrap();
        assert!(table.remove(one).is_some());
        assert_eq!(table.lowest_free(), Some(one));
        assert!(table.remove(one).is_none());
    }

    #[test]
    fn full_table_has_no_free_slot() {
        let mut table = HandleTable::new();
        for i in 0..IPC_MAX_FDS as u32 {
            table.insert(Fd::from_raw(i).unwrap(), "/dev/stub", stub());
        }
        assert_eq!(table.lowest_free(), None);
        assert_eq!(table.len(), IPC_MAX_FDS);
    }

    #[test]
    fn raw_values_outside_the_table_are_rejected() {
        assert!(Fd::from_raw(IPC_MAX_FDS as u32).is_none());
        assert!(Fd::from_raw(-1i32 as u32).is_none());
        assert_eq!(Fd::from_raw(0x17).map(Fd::index), Some(0x17));
    }
}

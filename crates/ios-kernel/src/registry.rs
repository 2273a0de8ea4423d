use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::DeviceRef;
use crate::stub::StubDevice;

type Constructor = Arc<dyn Fn(&str) -> DeviceRef + Send + Sync>;

/// Devices installed by [`crate::Kernel::boot_ios`], in installation order.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    entries: Vec<(String, Constructor)>,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that installs a [`StubDevice`] under each name.
    pub fn with_stubs<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for name in names {
            registry.register(name, |name| Arc::new(Mutex::new(StubDevice::new(name))));
        }
        registry
    }

    /// Adds or replaces the constructor for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&str) -> DeviceRef + Send + Sync + 'static,
    {
        let name = name.into();
        let constructor: Constructor = Arc::new(constructor);
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = constructor,
            None => self.entries.push((name, constructor)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub(crate) fn instantiate(&self) -> impl Iterator<Item = (String, DeviceRef)> + '_ {
        self.entries
            .iter()
            .map(|(name, constructor)| (name.clone(), constructor(name)))
    }
}

/// The kernel's name → device table. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct DeviceTable {
    inner: Arc<Mutex<BTreeMap<String, DeviceRef>>>,
}

impl fmt::Debug for DeviceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.lock().keys()).finish()
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DeviceRef>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<DeviceRef> {
        self.lock().get(name).cloned()
    }

    /// Installs `device` under `name`, returning the device it replaced.
    pub fn insert(&self, name: impl Into<String>, device: DeviceRef) -> Option<DeviceRef> {
        self.lock().insert(name.into(), device)
    }

    pub fn remove(&self, name: &str) -> Option<DeviceRef> {
        self.lock().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of the table in name order. The lock is not held while callers use the devices.
    pub fn entries(&self) -> Vec<(String, DeviceRef)> {
        self.lock()
            .iter()
            .map(|(name, device)| (name.clone(), Arc::clone(device)))
            .collect()
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use ios_kernel::{DeviceRef, DeviceRegistry, Kernel};
use tracing::{debug, info};

use crate::device::{device_id, PassthroughDevice};
use crate::error::HostError;
use crate::host::{HostDevice, UsbHostContext};
use crate::oh0::{node_name, HubDirectory, HubEntry, Oh0DeviceNode, Oh0Hub, OH0_HUB_NAME};

/// Node names added and removed by one [`UsbScanner::scan`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Keeps the kernel's OH0 nodes in step with the devices plugged into the host.
pub struct UsbScanner {
    context: Arc<dyn UsbHostContext>,
    directory: HubDirectory,
    known: BTreeMap<u64, String>,
    /// Node name to the identity whose device the installed node wraps.
    owners: BTreeMap<String, u64>,
}

impl UsbScanner {
    pub fn new(context: Arc<dyn UsbHostContext>) -> Self {
        Self {
            context,
            directory: HubDirectory::new(),
            known: BTreeMap::new(),
            owners: BTreeMap::new(),
        }
    }

    pub fn directory(&self) -> HubDirectory {
        self.directory.clone()
    }

    /// Installs the hub node so it survives reboots.
    pub fn register_hub(&self, registry: &mut DeviceRegistry) {
        let directory = self.directory.clone();
        registry.register(OH0_HUB_NAME, move |_| -> DeviceRef {
            Arc::new(Mutex::new(Oh0Hub::new(directory.clone())))
        });
    }

    /// Adds nodes for new host devices and removes nodes whose device is gone.
    pub fn scan(&mut self, kernel: &mut Kernel) -> Result<ScanReport, HostError> {
        let mut report = ScanReport::default();
        if kernel.want_determinism() {
            debug!("skipping usb scan while determinism is wanted");
            return Ok(report);
        }

        let plugged: Vec<(u64, Arc<dyn HostDevice>)> = self
            .context
            .devices()?
            .into_iter()
            .map(|host_device| {
                let descriptor = host_device.device_descriptor();
                let id = device_id(
                    descriptor.vendor_id,
                    descriptor.product_id,
                    host_device.bus_number(),
                    host_device.address(),
                );
                (id, host_device)
            })
            .collect();
        let seen: BTreeSet<u64> = plugged.iter().map(|(id, _)| *id).collect();

        let gone: Vec<u64> = self
            .known
            .keys()
            .filter(|id| !seen.contains(*id))
            .copied()
            .collect();
        for id in gone {
            self.directory.remove(id);
            let Some(name) = self.known.remove(&id) else {
                continue;
            };
            info!(device = %name, id, "usb device removed");
            // Identical devices share a node; it goes away with the device serving it.
            if self.owners.get(&name) == Some(&id) {
                self.owners.remove(&name);
                kernel.remove_device(&name);
            }
            report.removed.push(name);
        }

        for (id, host_device) in plugged {
            let descriptor = host_device.device_descriptor();
            let name = node_name(descriptor.vendor_id, descriptor.product_id);
            let is_new = !self.known.contains_key(&id);
            if is_new {
                self.known.insert(id, name.clone());
            }

            let served =
                self.owners.contains_key(&name) && kernel.get_device_by_name(&name).is_some();
            if served && !is_new {
                continue;
            }

            let device = PassthroughDevice::new(host_device, kernel.reply_sender());
            self.directory.insert(id, HubEntry::for_device(&device));
            report.added.push(name.clone());
            if served {
                info!(device = %name, id, "usb device added behind an existing node");
                continue;
            }
            info!(device = %name, id, "usb device added");
            kernel.add_device(Arc::new(Mutex::new(Oh0DeviceNode::new(device))));
            self.owners.insert(name, id);
        }
        Ok(report)
    }
}

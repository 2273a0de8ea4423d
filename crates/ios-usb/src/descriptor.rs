//! USB descriptors as reported by the host, relayed to the guest unchanged.

use serde::{Deserialize, Serialize};

pub const DIR_HOST_TO_DEVICE: u8 = 0x00;
pub const DIR_DEVICE_TO_HOST: u8 = 0x80;
pub const TYPE_STANDARD: u8 = 0x00;
pub const TYPE_CLASS: u8 = 0x20;
pub const TYPE_VENDOR: u8 = 0x40;
pub const REC_DEVICE: u8 = 0x00;
pub const REC_INTERFACE: u8 = 0x01;
pub const REC_ENDPOINT: u8 = 0x02;

pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_SET_INTERFACE: u8 = 0x0b;

/// Size of the setup stage that precedes the data of a control transfer.
pub const CONTROL_SETUP_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    #[serde(rename = "bmRequestType")]
    pub bm_request_type: u8,
    #[serde(rename = "bRequest")]
    pub b_request: u8,
    #[serde(rename = "wValue")]
    pub w_value: u16,
    #[serde(rename = "wIndex")]
    pub w_index: u16,
    #[serde(rename = "wLength")]
    pub w_length: u16,
}

impl SetupPacket {
    /// Matches `bmRequestType` and `bRequest`.
    pub fn is(self, request_type: u8, request: u8) -> bool {
        self.bm_request_type == request_type && self.b_request == request
    }

    pub fn is_device_to_host(self) -> bool {
        self.bm_request_type & DIR_DEVICE_TO_HOST != 0
    }

    /// Wire form (fields little-endian).
    pub fn to_bytes(self) -> [u8; CONTROL_SETUP_SIZE] {
        let mut out = [0u8; CONTROL_SETUP_SIZE];
        out[0] = self.bm_request_type;
        out[1] = self.b_request;
        out[2..4].copy_from_slice(&self.w_value.to_le_bytes());
        out[4..6].copy_from_slice(&self.w_index.to_le_bytes());
        out[6..8].copy_from_slice(&self.w_length.to_le_bytes());
        out
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_number_index: u8,
    pub num_configurations: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_index: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// One interface and all of its alternate settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Interface {
    pub alt_settings: Vec<InterfaceDescriptor>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigDescriptor {
    pub total_length: u16,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub interfaces: Vec<Interface>,
}

impl ConfigDescriptor {
    pub fn num_interfaces(&self) -> u8 {
        self.interfaces.len().min(usize::from(u8::MAX)) as u8
    }
}

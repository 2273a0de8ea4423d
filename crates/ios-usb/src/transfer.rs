//! Guest transfer requests and how their completions are written back.

use ios_kernel::request::Request;
use ios_kernel::{GuestMemory, GuestMemoryExt, GuestWrite, PendingReply, ReplySender};

use crate::descriptor::{SetupPacket, CONTROL_SETUP_SIZE};
use crate::error::UsbError;
use crate::host::HostCompletion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub request: Request,
    pub setup: SetupPacket,
    pub data_address: u32,
}

impl ControlMessage {
    pub fn length(&self) -> u16 {
        self.setup.w_length
    }
}

/// Bulk and interrupt transfers carry the same fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkMessage {
    pub request: Request,
    pub endpoint: u8,
    pub length: u16,
    pub data_address: u32,
}

pub type IntrMessage = BulkMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoMessage {
    pub request: Request,
    pub endpoint: u8,
    /// Total length of all packets.
    pub length: u16,
    pub packet_sizes: Vec<u16>,
    /// Where the per-packet actual lengths are written back (big-endian `u16` each).
    pub packet_sizes_address: u32,
    pub data_address: u32,
}

impl IsoMessage {
    pub fn num_packets(&self) -> usize {
        self.packet_sizes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CommandKind {
    Control { length: u16 },
    Bulk { length: u16 },
    Isochronous {
        length: u16,
        num_packets: usize,
        packet_sizes_address: u32,
    },
}

/// A guest request waiting for the host to finish its transfer.
#[derive(Debug, Clone)]
pub struct TransferCommand {
    request: Request,
    data_address: u32,
    kind: CommandKind,
    replies: ReplySender,
}

impl TransferCommand {
    pub(crate) fn new(
        request: Request,
        data_address: u32,
        kind: CommandKind,
        replies: ReplySender,
    ) -> Self {
        Self {
            request,
            data_address,
            kind,
            replies,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Copies the guest's data buffer into a fresh host buffer of `length` bytes.
    pub fn make_buffer(
        &self,
        memory: &dyn GuestMemory,
        length: usize,
    ) -> Result<Vec<u8>, UsbError> {
        Ok(memory.read_vec(self.data_address, length)?)
    }

    /// Return value and guest writes for a transfer the host reported as completed.
    pub(crate) fn fill(&self, completion: &HostCompletion) -> (i32, Vec<GuestWrite>) {
        match &self.kind {
            CommandKind::Control { length } => {
                let data = completion
                    .buffer
                    .get(CONTROL_SETUP_SIZE..)
                    .unwrap_or_default();
                let copied = completion.actual_length.min(data.len());
                let writes = self.data_write(&data[..copied]);
                // The setup packet counts towards the returned length.
                (i32::from(*length) + CONTROL_SETUP_SIZE as i32, writes)
            }
            CommandKind::Bulk { .. } => {
                let copied = completion.actual_length.min(completion.buffer.len());
                let writes = self.data_write(&completion.buffer[..copied]);
                (copied as i32, writes)
            }
            CommandKind::Isochronous {
                length,
                num_packets,
                packet_sizes_address,
            } => {
                let copied = usize::from(*length).min(completion.buffer.len());
                let mut writes = self.data_write(&completion.buffer[..copied]);
                let sizes: Vec<u8> = (0..*num_packets)
                    .map(|i| completion.iso_packet_lengths.get(i).copied().unwrap_or(0))
                    .flat_map(u16::to_be_bytes)
                    .collect();
                if !sizes.is_empty() {
                    writes.push(GuestWrite::new(*packet_sizes_address, sizes));
                }
                // Anything but zero is treated as a failure by the guest.
                (0, writes)
            }
        }
    }

    fn data_write(&self, data: &[u8]) -> Vec<GuestWrite> {
        if data.is_empty() {
            Vec::new()
        } else {
            vec![GuestWrite::new(self.data_address, data.to_vec())]
        }
    }

    /// Sends the guest its reply. Called exactly once per command.
    pub fn on_transfer_complete(&self, return_value: i32, writes: Vec<GuestWrite>) {
        let reply = PendingReply::new(&self.request, return_value).with_writes(writes);
        self.replies.send(reply, 0);
    }

    pub(crate) fn control(message: &ControlMessage, replies: ReplySender) -> Self {
        Self::new(
            message.request,
            message.data_address,
            CommandKind::Control {
                length: message.length(),
            },
            replies,
        )
    }

    pub(crate) fn bulk(message: &BulkMessage, replies: ReplySender) -> Self {
        Self::new(
            message.request,
            message.data_address,
            CommandKind::Bulk {
                length: message.length,
            },
            replies,
        )
    }

    pub(crate) fn isochronous(message: &IsoMessage, replies: ReplySender) -> Self {
        Self::new(
            message.request,
            message.data_address,
            CommandKind::Isochronous {
                length: message.length,
                num_packets: message.num_packets(),
                packet_sizes_address: message.packet_sizes_address,
            },
            replies,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{TransferId, TransferStatus};
    use ios_kernel::request::IpcCommand;

    fn request() -> Request {
        Request {
            address: 0x100,
            command: IpcCommand::Ioctlv,
            fd: 0,
        }
    }

    fn completion(buffer: Vec<u8>, actual_length: usize) -> HostCompletion {
        HostCompletion {
            actual_length,
            buffer,
            ..HostCompletion::new(TransferId(1), TransferStatus::Completed)
        }
    }

    #[test]
    fn control_return_value_includes_the_setup_packet() {
        let message = ControlMessage {
            request: request(),
            setup: SetupPacket {
                bm_request_type: 0x80,
                b_request: 6,
                w_value: 0x0100,
                w_index: 0,
                w_length: 18,
            },
            data_address: 0x2000,
        };
        let command = TransferCommand::control(&message, ReplySender::default());
        let mut buffer = vec![0u8; CONTROL_SETUP_SIZE];
        buffer.extend_from_slice(&[0x12, 0x01, 0x00, 0x02]);
        buffer.resize(CONTROL_SETUP_SIZE + 18, 0);

        let (rv, writes) = command.fill(&completion(buffer, 4));
        assert_eq!(rv, 26);
        assert_eq!(writes, vec![GuestWrite::new(0x2000, vec![0x12, 0x01, 0x00, 0x02])]);
    }

    #[test]
    fn bulk_return_value_is_the_actual_length() {
        let message = BulkMessage {
            request: request(),
            endpoint: 0x81,
            length: 64,
            data_address: 0x3000,
        };
        let command = TransferCommand::bulk(&message, ReplySender::default());
        let (rv, writes) = command.fill(&completion(vec![0xaa; 64], 13));
        assert_eq!(rv, 13);
        assert_eq!(writes[0].data.len(), 13);
    }

    #[test]
    fn isochronous_writes_data_and_packet_lengths() {
        let message = IsoMessage {
            request: request(),
            endpoint: 0x83,
            length: 6,
            packet_sizes: vec![3, 3],
            packet_sizes_address: 0x4000,
            data_address: 0x4100,
        };
        let command = TransferCommand::isochronous(&message, ReplySender::default());
        let done = HostCompletion {
            iso_packet_lengths: vec![3, 1],
            ..completion(vec![1, 2, 3, 4, 5, 6], 4)
        };

        let (rv, writes) = command.fill(&done);
        assert_eq!(rv, 0);
        assert_eq!(writes[0], GuestWrite::new(0x4100, vec![1, 2, 3, 4, 5, 6]));
        assert_eq!(writes[1], GuestWrite::new(0x4000, vec![0, 3, 0, 1]));
    }
}

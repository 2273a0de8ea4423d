use std::collections::VecDeque;

use ios_io_snapshot::state::codec::{Decoder, Encoder};
use ios_io_snapshot::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use tracing::warn;

use crate::device::{lock_device, DeviceRef};
use crate::handles::{Fd, IPC_MAX_FDS};
use crate::kernel::Kernel;
use crate::memory::GuestWrite;
use crate::reply::{IpcEvent, PendingReply};

const TAG_TITLE_ID: u16 = 1;
const TAG_UID: u16 = 2;
const TAG_GID: u16 = 3;
const TAG_LAST_REPLY_TIME: u16 = 4;
const TAG_REQUEST_QUEUE: u16 = 5;
const TAG_REPLY_QUEUE: u16 = 6;
const TAG_ACK_QUEUE: u16 = 7;
const TAG_HANDLES: u16 = 8;
const TAG_NOW: u16 = 9;
const TAG_EVENTS: u16 = 10;
const TAG_DEVICES: u16 = 11;
const TAG_WANT_DETERMINISM: u16 = 12;
const TAG_HOST_EVENTS: u16 = 13;

const MAX_QUEUE_LEN: usize = 4096;
const MAX_EVENTS: usize = 4096;
const MAX_WRITES_PER_REPLY: usize = 64;
const MAX_DEVICES: usize = 1024;

const EVENT_REPLY: u8 = 0;
const EVENT_ACK: u8 = 1;

fn encode_queue(queue: &VecDeque<u32>) -> Vec<u8> {
    queue
        .iter()
        .fold(Encoder::new().u32(queue.len() as u32), |e, &addr| e.u32(addr))
        .finish()
}

fn decode_queue(buf: &[u8]) -> SnapshotResult<VecDeque<u32>> {
    let mut d = Decoder::new(buf);
    let count = d.u32()? as usize;
    if count > MAX_QUEUE_LEN {
        return Err(SnapshotError::InvalidFieldEncoding("ipc queue too long"));
    }
    let mut queue = VecDeque::with_capacity(count);
    for _ in 0..count {
        queue.push_back(d.u32()?);
    }
    d.finish()?;
    Ok(queue)
}

fn encode_event(mut e: Encoder, time: u64, event: &IpcEvent) -> Encoder {
    e = e.u64(time);
    match event {
        IpcEvent::Reply(reply) => {
            e = e
                .u8(EVENT_REPLY)
                .u32(reply.address)
                .u32(reply.command)
                .i32(reply.return_value)
                .u32(reply.writes.len() as u32);
            for write in &reply.writes {
                e = e.u32(write.address).vec_u8(&write.data);
            }
            e
        }
        IpcEvent::Acknowledgement(address) => e.u8(EVENT_ACK).u32(*address),
    }
}

fn decode_event(d: &mut Decoder<'_>) -> SnapshotResult<(u64, IpcEvent)> {
    let time = d.u64()?;
    let event = match d.u8()? {
        EVENT_REPLY => {
            let address = d.u32()?;
            let command = d.u32()?;
            let return_value = d.i32()?;
            let count = d.u32()? as usize;
            if count > MAX_WRITES_PER_REPLY {
                return Err(SnapshotError::InvalidFieldEncoding("too many reply writes"));
            }
            let mut writes = Vec::with_capacity(count);
            for _ in 0..count {
                let address = d.u32()?;
                writes.push(GuestWrite::new(address, d.vec_u8()?.to_vec()));
            }
            IpcEvent::Reply(PendingReply {
                address,
                command,
                return_value,
                writes,
            })
        }
        EVENT_ACK => IpcEvent::Acknowledgement(d.u32()?),
        _ => return Err(SnapshotError::InvalidFieldEncoding("unknown ipc event kind")),
    };
    Ok((time, event))
}

fn encode_events<'a>(events: impl ExactSizeIterator<Item = (u64, &'a IpcEvent)>) -> Vec<u8> {
    let mut e = Encoder::new().u32(events.len() as u32);
    for (time, event) in events {
        e = encode_event(e, time, event);
    }
    e.finish()
}

fn decode_events(buf: &[u8]) -> SnapshotResult<Vec<(u64, IpcEvent)>> {
    let mut d = Decoder::new(buf);
    let count = d.u32()? as usize;
    if count > MAX_EVENTS {
        return Err(SnapshotError::InvalidFieldEncoding("too many ipc events"));
    }
    let mut events = Vec::with_capacity(count);
    for _ in 0..count {
        events.push(decode_event(&mut d)?);
    }
    d.finish()?;
    Ok(events)
}

impl IoSnapshot for Kernel {
    const DEVICE_ID: [u8; 4] = *b"IOSK";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u64(TAG_TITLE_ID, self.title_id);
        w.field_u32(TAG_UID, self.uid);
        w.field_u16(TAG_GID, self.gid);
        w.field_u64(TAG_LAST_REPLY_TIME, self.last_reply_time);
        w.field_bytes(TAG_REQUEST_QUEUE, encode_queue(&self.request_queue));
        w.field_bytes(TAG_REPLY_QUEUE, encode_queue(&self.reply_queue));
        w.field_bytes(TAG_ACK_QUEUE, encode_queue(&self.ack_queue));
        w.field_bool(TAG_WANT_DETERMINISM, self.want_determinism);

        let handles = self
            .handles
            .iter()
            .fold(Encoder::new().u32(self.handles.len() as u32), |e, (fd, name, _)| {
                e.u8(fd.index() as u8).str(name)
            });
        w.field_bytes(TAG_HANDLES, handles.finish());

        w.field_u64(TAG_NOW, self.timeline.now());
        let events: Vec<_> = self.timeline.iter().collect();
        w.field_bytes(TAG_EVENTS, encode_events(events.into_iter()));
        let host = self.timeline.host_queue().pending();
        w.field_bytes(
            TAG_HOST_EVENTS,
            encode_events(host.iter().map(|(delay, event)| (*delay, event))),
        );

        let devices = self.devices.entries();
        let mut e = Encoder::new().u32(devices.len() as u32);
        for (name, device) in &devices {
            e = e.str(name).vec_u8(&lock_device(device).save_state());
        }
        w.field_bytes(TAG_DEVICES, e.finish());

        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        // Decode everything before touching live state.
        let request_queue = r.bytes(TAG_REQUEST_QUEUE).map(decode_queue).transpose()?;
        let reply_queue = r.bytes(TAG_REPLY_QUEUE).map(decode_queue).transpose()?;
        let ack_queue = r.bytes(TAG_ACK_QUEUE).map(decode_queue).transpose()?;
        let events = r.bytes(TAG_EVENTS).map(decode_events).transpose()?;
        let host_events = r.bytes(TAG_HOST_EVENTS).map(decode_events).transpose()?;

        let mut handles = Vec::new();
        if let Some(buf) = r.bytes(TAG_HANDLES) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > IPC_MAX_FDS {
                return Err(SnapshotError::InvalidFieldEncoding("too many handles"));
            }
            for _ in 0..count {
                let fd = Fd::from_raw(u32::from(d.u8()?))
                    .ok_or(SnapshotError::InvalidFieldEncoding("handle out of range"))?;
                if handles.iter().any(|(seen, _)| *seen == fd) {
                    return Err(SnapshotError::InvalidFieldEncoding("duplicate handle"));
                }
                handles.push((fd, d.string()?));
            }
            d.finish()?;
        }

        let mut device_states = Vec::new();
        if let Some(buf) = r.bytes(TAG_DEVICES) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > MAX_DEVICES {
                return Err(SnapshotError::InvalidFieldEncoding("too many devices"));
            }
            for _ in 0..count {
                device_states.push((d.string()?, d.vec_u8()?.to_vec()));
            }
            d.finish()?;
        }

        let title_id = r.u64(TAG_TITLE_ID)?;
        let uid = r.u32(TAG_UID)?;
        let gid = r.u16(TAG_GID)?;
        let last_reply_time = r.u64(TAG_LAST_REPLY_TIME)?;
        let now = r.u64(TAG_NOW)?;
        let want_determinism = r.bool(TAG_WANT_DETERMINISM)?;

        self.load_device_states(device_states)?;

        self.title_id = title_id.unwrap_or(self.title_id);
        self.uid = uid.unwrap_or(0);
        self.gid = gid.unwrap_or(0);
        self.last_reply_time = last_reply_time.unwrap_or(0);
        self.request_queue = request_queue.unwrap_or_default();
        self.reply_queue = reply_queue.unwrap_or_default();
        self.ack_queue = ack_queue.unwrap_or_default();

        self.timeline
            .restore(now.unwrap_or(0), events.unwrap_or_default());
        let host = self.timeline.host_queue();
        for (delay, event) in host_events.unwrap_or_default() {
            host.push(delay, event);
        }

        self.handles.clear();
        for (fd, name) in handles {
            match self.devices.get(&name) {
                Some(device) => self.handles.insert(fd, name, device),
                None => warn!(%fd, device = %name, "handle refers to a missing device"),
            }
        }

        if let Some(want) = want_determinism {
            self.update_want_determinism(want);
        }
        Ok(())
    }
}

impl Kernel {
    /// Loads every device blob, or none: on failure the devices already loaded get their previous
    /// state back and the kernel itself is left untouched.
    fn load_device_states(&self, states: Vec<(String, Vec<u8>)>) -> SnapshotResult<()> {
        let mut loaded: Vec<(DeviceRef, Vec<u8>)> = Vec::new();
        for (name, state) in states {
            let Some(device) = self.devices.get(&name) else {
                warn!(device = %name, "state for missing device dropped");
                continue;
            };
            let previous = lock_device(&device).save_state();
            if let Err(err) = lock_device(&device).load_state(&state) {
                warn!(device = %name, %err, "device state rejected, rolling back");
                for (device, previous) in loaded.into_iter().rev() {
                    if let Err(err) = lock_device(&device).load_state(&previous) {
                        warn!(%err, "failed to roll back device state");
                    }
                }
                return Err(err);
            }
            loaded.push((device, previous));
        }
        Ok(())
    }
}

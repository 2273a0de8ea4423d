use ios_io_snapshot::state::codec::{Decoder, Encoder};
use ios_io_snapshot::state::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use proptest::prelude::*;

#[derive(Debug, Default, PartialEq, Eq)]
struct Counters {
    ticks: u64,
    names: Vec<String>,
}

impl IoSnapshot for Counters {
    const DEVICE_ID: [u8; 4] = *b"CNTR";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_TICKS: u16 = 1;
        const TAG_NAMES: u16 = 2;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u64(TAG_TICKS, self.ticks);
        let mut names = Encoder::new().u32(self.names.len() as u32);
        for name in &self.names {
            names = names.str(name);
        }
        w.field_bytes(TAG_NAMES, names.finish());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_TICKS: u16 = 1;
        const TAG_NAMES: u16 = 2;
        const MAX_NAMES: usize = 1024;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;
        self.ticks = r.u64(TAG_TICKS)?.unwrap_or(0);
        self.names.clear();
        if let Some(buf) = r.bytes(TAG_NAMES) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > MAX_NAMES {
                return Err(SnapshotError::InvalidFieldEncoding("too many names"));
            }
            for _ in 0..count {
                self.names.push(d.string()?);
            }
            d.finish()?;
        }
        Ok(())
    }
}

#[test]
fn excessive_counts_are_rejected_before_allocation() {
    let mut w = SnapshotWriter::new(Counters::DEVICE_ID, Counters::DEVICE_VERSION);
    w.field_bytes(2, u32::MAX.to_le_bytes().to_vec());

    let mut state = Counters::default();
    let err = state
        .load_state(&w.finish())
        .expect_err("snapshot should reject excessive name count");
    assert_eq!(err, SnapshotError::InvalidFieldEncoding("too many names"));
}

#[test]
fn newer_major_version_is_rejected() {
    let w = SnapshotWriter::new(Counters::DEVICE_ID, SnapshotVersion::new(2, 0));
    let mut state = Counters::default();
    assert_eq!(
        state.load_state(&w.finish()),
        Err(SnapshotError::UnsupportedDeviceMajorVersion {
            found: 2,
            supported: 1
        })
    );
}

proptest! {
    #[test]
    fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut state = Counters::default();
        let _ = state.load_state(&bytes);
    }

    #[test]
    fn saved_state_restores_identically(
        ticks in any::<u64>(),
        names in proptest::collection::vec("[a-z/]{0,12}", 0..8),
    ) {
        let original = Counters { ticks, names };
        let mut restored = Counters::default();
        restored.load_state(&original.save_state()).unwrap();
        prop_assert_eq!(original, restored);
    }
}

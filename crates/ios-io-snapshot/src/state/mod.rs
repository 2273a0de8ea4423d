//! Save-state blobs for the IOS kernel and its devices.
//!
//! A blob is a fixed header (magic, format version, four-byte owner id, owner version) followed by
//! `tag, length, value` fields written in ascending tag order, so saving the same kernel twice
//! yields the same bytes. Readers ignore tags they do not know, which lets a newer minor version
//! add fields without breaking older restores. A major version bump is a hard break.

pub mod codec;
mod version;

pub use version::{
    SnapshotError, SnapshotHeader, SnapshotReader, SnapshotResult, SnapshotVersion,
    SnapshotWriter, SNAPSHOT_FORMAT_VERSION, SNAPSHOT_MAGIC,
};

/// State that survives a save/restore of the emulated console.
///
/// `DEVICE_ID` names the owner in the blob header and never changes once released. New fields
/// get new tags within the same major `DEVICE_VERSION`; removing or reinterpreting one bumps the
/// major.
pub trait IoSnapshot {
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}

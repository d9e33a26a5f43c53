// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Point-in-time snapshot file (distilled spec §4.7).
//!
//! Layout: an 8-byte magic (`MQSNAPSH`), an 8-byte little-endian version
//! (the highest journal sequence number covered by this snapshot), a 4-byte
//! payload length, a 4-byte CRC32 of the payload, then the JSON payload.
//! Writes go to a temporary file in the same directory and are published
//! with a single rename, so a reader never observes a partially written
//! snapshot -- the same atomic-replace pattern `admin::snapshot_with_epoch`
//! uses for its in-memory epoch swap, applied here to a file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dead_letter::DeadLetterStore;
use crate::dedup::DedupIndex;
use crate::envelope::{DeadLetterEnvelope, Envelope, MessageId};
use crate::error::{Error, Result};
use crate::slots::SlotArray;

const MAGIC: &[u8; 8] = b"MQSNAPSH";

/// Serializable body of a snapshot file.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotBody {
    capacity: usize,
    messages: Vec<Envelope>,
    dedup_index: BTreeMap<String, MessageId>,
    dead_letter_capacity: usize,
    dead_letter_messages: Vec<DeadLetterEnvelope>,
}

/// A loaded snapshot: its journal watermark plus the state it captured.
pub struct LoadedSnapshot {
    /// Highest journal sequence number already reflected in this snapshot.
    /// Journal replay after recovery only needs records past this point.
    pub version: u64,
    pub capacity: usize,
    pub messages: Vec<Envelope>,
    pub dedup_index: Vec<(String, MessageId)>,
    pub dead_letter_capacity: usize,
    pub dead_letter_messages: Vec<DeadLetterEnvelope>,
}

/// Capture the current in-memory state into a snapshot file at `path`.
///
/// `version` is the journal sequence number this snapshot covers; the
/// journal's prefix up to and including `version` can be truncated once
/// this call returns successfully.
pub fn write_snapshot(
    path: impl AsRef<Path>,
    version: u64,
    slots: &SlotArray,
    dedup: &DedupIndex,
    dead_letters: &DeadLetterStore,
) -> Result<()> {
    let body = SnapshotBody {
        capacity: slots.capacity(),
        messages: slots
            .list_all()
            .into_iter()
            .map(|arc| (*arc).clone())
            .collect(),
        dedup_index: dedup.snapshot().into_iter().collect(),
        dead_letter_capacity: dead_letters.capacity(),
        dead_letter_messages: dead_letters.list_all(),
    };

    let payload = serde_json::to_vec(&body)
        .map_err(|e| Error::PersistenceIo(format!("encode snapshot: {e}")))?;
    let crc = crc32fast::hash(&payload);

    let path = path.as_ref();
    let tmp_path = tmp_path_for(path);
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(MAGIC)?;
        tmp.write_all(&version.to_le_bytes())?;
        tmp.write_all(&(payload.len() as u32).to_le_bytes())?;
        tmp.write_all(&crc.to_le_bytes())?;
        tmp.write_all(&payload)?;
        tmp.flush()?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a snapshot file, if present. Returns `Ok(None)` if the file does not
/// exist yet (a brand-new queue has no snapshot).
pub fn read_snapshot(path: impl AsRef<Path>) -> Result<Option<LoadedSnapshot>> {
    let path = path.as_ref();
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::CorruptRecord {
            sequence: 0,
            reason: "snapshot magic mismatch".into(),
        });
    }

    let mut version_buf = [0u8; 8];
    file.read_exact(&mut version_buf)?;
    let version = u64::from_le_bytes(version_buf);

    let mut len_buf = [0u8; 4];
    file.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;

    let mut crc_buf = [0u8; 4];
    file.read_exact(&mut crc_buf)?;
    let expected_crc = u32::from_le_bytes(crc_buf);

    let mut payload = vec![0u8; len];
    file.read_exact(&mut payload)?;

    let actual_crc = crc32fast::hash(&payload);
    if actual_crc != expected_crc {
        return Err(Error::CorruptRecord {
            sequence: version,
            reason: "snapshot CRC mismatch".into(),
        });
    }

    let body: SnapshotBody = serde_json::from_slice(&payload)
        .map_err(|e| Error::PersistenceIo(format!("decode snapshot: {e}")))?;

    Ok(Some(LoadedSnapshot {
        version,
        capacity: body.capacity,
        messages: body.messages,
        dedup_index: body.dedup_index.into_iter().collect(),
        dead_letter_capacity: body.dead_letter_capacity,
        dead_letter_messages: body.dead_letter_messages,
    }))
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeMetadata;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.dat");

        let slots = SlotArray::new(4);
        slots.enqueue(Envelope::new(
            MessageId::generate(1),
            "t",
            vec![9, 9],
            Some("dk".into()),
            3,
            EnvelopeMetadata::default(),
        ));
        let dedup = DedupIndex::new();
        dedup.update("dk", MessageId::generate(1));
        let dlq = DeadLetterStore::new(10);

        write_snapshot(&path, 42, &slots, &dedup, &dlq).unwrap();

        let loaded = read_snapshot(&path).unwrap().unwrap();
        assert_eq!(loaded.version, 42);
        assert_eq!(loaded.capacity, 4);
        assert_eq!(loaded.messages.len(), 1);
        assert_eq!(loaded.dedup_index.len(), 1);
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.dat");
        assert!(read_snapshot(&path).unwrap().is_none());
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.dat");
        let slots = SlotArray::new(2);
        let dedup = DedupIndex::new();
        let dlq = DeadLetterStore::new(10);
        write_snapshot(&path, 1, &slots, &dedup, &dlq).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(read_snapshot(&path).is_err());
    }
}

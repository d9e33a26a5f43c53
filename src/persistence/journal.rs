// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Append-only write-ahead journal (distilled spec §4.7).
//!
//! Record layout: 8-byte little-endian sequence, 4-byte payload length,
//! 4-byte CRC32 (IEEE polynomial 0xEDB88320, reflected, final XOR -- the
//! same parameters `crc32fast` implements), then the JSON payload bytes.
//! Appends are serialized by a single writer mutex and each append flushes
//! before returning, matching the write-ahead rule: durability is
//! considered established only once the file write lands on disk.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::persistence::record::JournalRecord;

const HEADER_LEN: usize = 8 + 4 + 4;

/// Single-writer append-only journal file.
pub struct Journal {
    path: PathBuf,
    writer: Mutex<File>,
}

impl Journal {
    /// Open (creating if absent) the journal file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Append one record, flushing before returning. This is the
    /// linearization point for durability of the corresponding operation.
    pub fn append(&self, sequence: u64, record: &JournalRecord) -> Result<()> {
        let payload = serde_json::to_vec(record)
            .map_err(|e| Error::PersistenceIo(format!("encode journal record: {e}")))?;
        let crc = crc32fast::hash(&payload);

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&sequence.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&payload);

        let mut guard = self
            .writer
            .lock()
            .map_err(|_| Error::PersistenceIo("journal writer mutex poisoned".into()))?;
        guard.write_all(&buf)?;
        guard.flush()?;
        guard.sync_data()?;
        Ok(())
    }

    /// Replay every well-formed record with `sequence > after`, in order.
    /// Stops at (and does not return) the first malformed or CRC-failing
    /// record -- the tail is assumed torn by a partial write during a crash
    /// (distilled spec §4.7, §8 property P8).
    pub fn replay(&self, after: u64) -> Result<Vec<(u64, JournalRecord)>> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut header = [0u8; HEADER_LEN];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }

            let sequence = u64::from_le_bytes(header[0..8].try_into().unwrap());
            let len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
            let expected_crc = u32::from_le_bytes(header[12..16].try_into().unwrap());

            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                log::warn!("journal torn at sequence {sequence}: short payload, truncating replay");
                break;
            }

            let actual_crc = crc32fast::hash(&payload);
            if actual_crc != expected_crc {
                log::warn!(
                    "journal CRC mismatch at sequence {sequence}: truncating replay here"
                );
                break;
            }

            match serde_json::from_slice::<JournalRecord>(&payload) {
                Ok(record) => {
                    if sequence > after {
                        records.push((sequence, record));
                    }
                }
                Err(e) => {
                    log::warn!("journal record at sequence {sequence} failed to decode: {e}, truncating replay");
                    break;
                }
            }
        }

        Ok(records)
    }

    /// Truncate the journal, dropping every record with `sequence <=
    /// watermark`. Implemented by rewriting the file to contain only the
    /// surviving tail, since journal records are variable-length.
    pub fn truncate_through(&self, watermark: u64) -> Result<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| Error::PersistenceIo("journal writer mutex poisoned".into()))?;

        let surviving = self.replay(watermark)?;

        let tmp_path = self.path.with_extension("dat.compact");
        {
            let mut tmp = File::create(&tmp_path)?;
            for (sequence, record) in &surviving {
                let payload = serde_json::to_vec(record)
                    .map_err(|e| Error::PersistenceIo(format!("encode journal record: {e}")))?;
                let crc = crc32fast::hash(&payload);
                tmp.write_all(&sequence.to_le_bytes())?;
                tmp.write_all(&(payload.len() as u32).to_le_bytes())?;
                tmp.write_all(&crc.to_le_bytes())?;
                tmp.write_all(&payload)?;
            }
            tmp.flush()?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let mut refreshed = OpenOptions::new().append(true).read(true).open(&self.path)?;
        refreshed.seek(SeekFrom::End(0))?;
        *guard = refreshed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, EnvelopeMetadata, MessageId};
    use tempfile::tempdir;

    fn envelope(n: u64) -> Envelope {
        Envelope::new(MessageId::generate(n), "t", vec![1], None, 3, EnvelopeMetadata::default())
    }

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path().join("journal.dat")).unwrap();

        journal.append(1, &JournalRecord::enqueue(envelope(1))).unwrap();
        journal.append(2, &JournalRecord::acknowledge(MessageId::generate(1))).unwrap();

        let replayed = journal.replay(0).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].0, 1);
        assert_eq!(replayed[1].0, 2);
    }

    #[test]
    fn replay_after_watermark_skips_earlier_records() {
        let dir = tempdir().unwrap();
        let journal = Journal::open(dir.path().join("journal.dat")).unwrap();
        journal.append(1, &JournalRecord::enqueue(envelope(1))).unwrap();
        journal.append(2, &JournalRecord::enqueue(envelope(2))).unwrap();

        let replayed = journal.replay(1).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].0, 2);
    }

    #[test]
    fn corrupted_byte_truncates_replay_at_that_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.dat");
        let journal = Journal::open(&path).unwrap();
        journal.append(1, &JournalRecord::enqueue(envelope(1))).unwrap();
        journal.append(2, &JournalRecord::enqueue(envelope(2))).unwrap();

        // Flip a byte inside the second record's payload to break its CRC.
        let mut bytes = std::fs::read(&path).unwrap();
        let corrupt_at = bytes.len() - 1;
        bytes[corrupt_at] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let replayed = journal.replay(0).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].0, 1);
    }
}

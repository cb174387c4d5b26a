//! File-backed durable store.
//!
//! Metadata and snapshots are small and rewritten whole, so they use the
//! classic temp-file + rename + fsync dance for atomicity. The log is
//! append-only: each record is length-prefixed and checksummed, appends
//! are fsynced before returning, and suffix truncation rewrites the file
//! through a temp file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use palaver_raft::{LogEntry, Member, PersistedState, Snapshot};
use palaver_types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

use crate::store::DurableStore;
use crate::StorageError;

const METADATA_FILENAME: &str = "metadata.pal";
const SNAPSHOT_FILENAME: &str = "snapshot.pal";
const LOG_FILENAME: &str = "log.pal";

/// Fixed per-record header: 4-byte length + 4-byte checksum.
const RECORD_HEADER_SIZE: usize = 8;

/// The metadata record, persisted as one postcard blob.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct MetadataRecord {
    current_term: Term,
    voted_for: Option<NodeId>,
    members: Vec<Member>,
    /// Snapshot boundary mirrored here so a load can sanity-check the
    /// snapshot file it finds (or tolerate its absence at boundary zero).
    snapshot_last_index: LogIndex,
    snapshot_last_term: Term,
}

/// First 4 bytes of the blake3 digest, enough to catch torn writes.
fn checksum(bytes: &[u8]) -> [u8; 4] {
    let digest = blake3::hash(bytes);
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest.as_bytes()[..4]);
    out
}

/// A [`DurableStore`] on the local filesystem.
pub struct FileStore {
    dir: PathBuf,
    /// Open append handle for the log file.
    log_file: File,
    /// Mirror of the snapshot boundary for metadata writes.
    snapshot_last_index: LogIndex,
    snapshot_last_term: Term,
}

impl FileStore {
    /// Opens (creating if necessary) the store directory for one node.
    pub fn open(data_dir: &Path, node: NodeId) -> Result<Self, StorageError> {
        let dir = data_dir.join(format!("node-{}", node.as_u64()));
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let log_path = dir.join(LOG_FILENAME);
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&log_path)
            .map_err(|e| StorageError::io(&log_path, e))?;

        let mut store = Self {
            dir,
            log_file,
            snapshot_last_index: LogIndex::ZERO,
            snapshot_last_term: Term::ZERO,
        };

        // Pick up the boundary from an existing metadata record, if any.
        if let Some(meta) = store.read_metadata()? {
            store.snapshot_last_index = meta.snapshot_last_index;
            store.snapshot_last_term = meta.snapshot_last_term;
        }
        Ok(store)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Writes `bytes` to `name` atomically: temp file, fsync, rename,
    /// directory fsync.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.path(name);
        let temp = self.path(&format!("{name}.tmp"));

        let mut file = File::create(&temp).map_err(|e| StorageError::io(&temp, e))?;
        file.write_all(bytes)
            .map_err(|e| StorageError::io(&temp, e))?;
        file.sync_all().map_err(|e| StorageError::io(&temp, e))?;
        fs::rename(&temp, &target).map_err(|e| StorageError::io(&target, e))?;

        // The rename itself must be durable.
        let dir = File::open(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        dir.sync_all().map_err(|e| StorageError::io(&self.dir, e))?;
        Ok(())
    }

    fn read_metadata(&self) -> Result<Option<MetadataRecord>, StorageError> {
        let path = self.path(METADATA_FILENAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        let meta = postcard::from_bytes(&bytes)
            .map_err(|e| StorageError::Corrupt(format!("metadata record: {e}")))?;
        Ok(Some(meta))
    }

    fn write_metadata(&self, meta: &MetadataRecord) -> Result<(), StorageError> {
        let bytes = postcard::to_allocvec(meta)?;
        self.write_atomic(METADATA_FILENAME, &bytes)
    }

    fn read_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        let path = self.path(SNAPSHOT_FILENAME);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path, e)),
        };
        let snapshot = postcard::from_bytes(&bytes)
            .map_err(|e| StorageError::Corrupt(format!("snapshot file: {e}")))?;
        Ok(Some(snapshot))
    }

    /// Reads every intact log record.
    ///
    /// A torn record at the tail (crash mid-append) is discarded with a
    /// warning; a bad record anywhere else is corruption.
    fn read_log(&self) -> Result<Vec<LogEntry>, StorageError> {
        let path = self.path(LOG_FILENAME);
        let mut bytes = Vec::new();
        let mut file = File::open(&path).map_err(|e| StorageError::io(&path, e))?;
        file.read_to_end(&mut bytes)
            .map_err(|e| StorageError::io(&path, e))?;

        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            let intact = Self::decode_record(&bytes[pos..]);
            match intact {
                Some((entry, consumed)) => {
                    entries.push(entry);
                    pos += consumed;
                }
                None => {
                    tracing::warn!(
                        path = %path.display(),
                        offset = pos,
                        trailing = bytes.len() - pos,
                        "discarding torn log tail"
                    );
                    break;
                }
            }
        }
        Ok(entries)
    }

    fn decode_record(bytes: &[u8]) -> Option<(LogEntry, usize)> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return None;
        }
        let len = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as usize;
        let stored_sum: [u8; 4] = bytes[4..8].try_into().ok()?;
        let body = bytes.get(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len)?;
        if checksum(body) != stored_sum {
            return None;
        }
        let entry = postcard::from_bytes(body).ok()?;
        Some((entry, RECORD_HEADER_SIZE + len))
    }

    fn encode_record(entry: &LogEntry) -> Result<Vec<u8>, StorageError> {
        let body = postcard::to_allocvec(entry)?;
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());
        record.extend_from_slice(&(body.len() as u32).to_le_bytes());
        record.extend_from_slice(&checksum(&body));
        record.extend_from_slice(&body);
        Ok(record)
    }

    /// Rewrites the log file with only `entries`, atomically.
    fn rewrite_log(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        for entry in entries {
            bytes.extend_from_slice(&Self::encode_record(entry)?);
        }
        self.write_atomic(LOG_FILENAME, &bytes)?;

        // Reopen the append handle on the new file.
        let path = self.path(LOG_FILENAME);
        self.log_file = OpenOptions::new()
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(())
    }
}

impl DurableStore for FileStore {
    fn save_metadata(
        &mut self,
        term: Term,
        voted_for: Option<NodeId>,
        members: &[Member],
    ) -> Result<(), StorageError> {
        self.write_metadata(&MetadataRecord {
            current_term: term,
            voted_for,
            members: members.to_vec(),
            snapshot_last_index: self.snapshot_last_index,
            snapshot_last_term: self.snapshot_last_term,
        })
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut bytes = Vec::new();
        for entry in entries {
            bytes.extend_from_slice(&Self::encode_record(entry)?);
        }
        let path = self.path(LOG_FILENAME);
        self.log_file
            .write_all(&bytes)
            .map_err(|e| StorageError::io(&path, e))?;
        self.log_file
            .sync_data()
            .map_err(|e| StorageError::io(&path, e))?;
        Ok(())
    }

    fn truncate_suffix(&mut self, from: LogIndex) -> Result<(), StorageError> {
        let kept: Vec<LogEntry> = self
            .read_log()?
            .into_iter()
            .filter(|e| e.index < from)
            .collect();
        self.rewrite_log(&kept)
    }

    fn install_snapshot(
        &mut self,
        snapshot: &Snapshot,
        discard_through: LogIndex,
    ) -> Result<(), StorageError> {
        let bytes = postcard::to_allocvec(snapshot)?;
        self.write_atomic(SNAPSHOT_FILENAME, &bytes)?;

        self.snapshot_last_index = snapshot.last_included_index;
        self.snapshot_last_term = snapshot.last_included_term;

        let kept: Vec<LogEntry> = self
            .read_log()?
            .into_iter()
            .filter(|e| e.index > discard_through)
            .collect();
        self.rewrite_log(&kept)?;

        // Metadata mirrors the new boundary; written last so a crash
        // between the steps is detected and tolerated on load.
        if let Some(meta) = self.read_metadata()? {
            self.write_metadata(&MetadataRecord {
                snapshot_last_index: self.snapshot_last_index,
                snapshot_last_term: self.snapshot_last_term,
                ..meta
            })?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<PersistedState, StorageError> {
        let meta = self.read_metadata()?.unwrap_or_default();
        let snapshot = self.read_snapshot()?;
        let boundary = snapshot
            .as_ref()
            .map_or(LogIndex::ZERO, |s| s.last_included_index);

        // Entries covered by the snapshot may linger if a crash landed
        // between snapshot rename and log rewrite; drop them here.
        let mut entries: Vec<LogEntry> = self
            .read_log()?
            .into_iter()
            .filter(|e| e.index > boundary)
            .collect();

        // Contiguity check: anything after a gap is unreachable garbage.
        let mut expected = boundary.next();
        let mut cut = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            if entry.index != expected {
                tracing::warn!(
                    expected = %expected,
                    found = %entry.index,
                    "log gap after crash, discarding trailing entries"
                );
                cut = i;
                break;
            }
            expected = expected.next();
        }
        entries.truncate(cut);

        Ok(PersistedState {
            current_term: meta.current_term,
            voted_for: meta.voted_for,
            members: meta.members,
            snapshot,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_kernel::{ChatState, Command};
    use palaver_raft::Snapshot;
    use palaver_types::Timestamp;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term: Term::new(term),
            index: LogIndex::new(index),
            timestamp: Timestamp::new(index),
            command: Command::Register {
                username: format!("user{index}"),
                password_hash: palaver_types::hash_password("pw"),
            },
            client: None,
        }
    }

    #[test]
    fn metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeId::new(1);
        {
            let mut store = FileStore::open(dir.path(), node).unwrap();
            store
                .save_metadata(Term::new(4), Some(NodeId::new(2)), &[])
                .unwrap();
        }
        let mut store = FileStore::open(dir.path(), node).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.current_term, Term::new(4));
        assert_eq!(state.voted_for, Some(NodeId::new(2)));
    }

    #[test]
    fn log_appends_survive_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeId::new(1);
        {
            let mut store = FileStore::open(dir.path(), node).unwrap();
            store.append_entries(&[entry(1, 1), entry(1, 2)]).unwrap();
            store.append_entries(&[entry(2, 3)]).unwrap();
        }
        let mut store = FileStore::open(dir.path(), node).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.entries.len(), 3);
        assert_eq!(state.entries[2].term, Term::new(2));
    }

    #[test]
    fn truncate_removes_suffix_only() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeId::new(1);
        let mut store = FileStore::open(dir.path(), node).unwrap();
        store
            .append_entries(&[entry(1, 1), entry(1, 2), entry(2, 3)])
            .unwrap();
        store.truncate_suffix(LogIndex::new(2)).unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.entries[0].index, LogIndex::new(1));

        // Appends continue cleanly after a truncation.
        store.append_entries(&[entry(3, 2)]).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.entries.len(), 2);
        assert_eq!(state.entries[1].term, Term::new(3));
    }

    #[test]
    fn snapshot_install_discards_covered_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeId::new(1);
        let mut store = FileStore::open(dir.path(), node).unwrap();
        store.save_metadata(Term::new(2), None, &[]).unwrap();
        store
            .append_entries(&[entry(1, 1), entry(1, 2), entry(2, 3)])
            .unwrap();

        let snapshot = Snapshot::capture(
            LogIndex::new(2),
            Term::new(1),
            Vec::new(),
            &ChatState::new(),
        );
        store.install_snapshot(&snapshot, LogIndex::new(2)).unwrap();

        let state = store.load().unwrap();
        assert_eq!(
            state.snapshot.as_ref().unwrap().last_included_index,
            LogIndex::new(2)
        );
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.entries[0].index, LogIndex::new(3));
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let node = NodeId::new(1);
        {
            let mut store = FileStore::open(dir.path(), node).unwrap();
            store.append_entries(&[entry(1, 1), entry(1, 2)]).unwrap();
        }
        // Simulate a crash mid-append: garbage half-record at the tail.
        let log_path = dir.path().join("node-1").join(LOG_FILENAME);
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&[42u8, 0, 0, 0, 1, 2]).unwrap();

        let mut store = FileStore::open(dir.path(), node).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.entries.len(), 2, "intact prefix kept, tail dropped");
    }

    #[test]
    fn empty_store_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path(), NodeId::new(1)).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.current_term, Term::ZERO);
        assert!(state.voted_for.is_none());
        assert!(state.snapshot.is_none());
        assert!(state.entries.is_empty());
    }
}

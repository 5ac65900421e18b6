use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::JournalError;
use crate::storage::{FileStorage, MemoryStorage, SegmentStorage, SegmentWriter};
use crate::traits::JournalStore;
use crate::types::{IntegrityReport, JournalEntry, JournalId, JournalRecord};

/// Journal magic bytes: "KWJL" (Keyward Journal)
const JOURNAL_MAGIC: [u8; 4] = [b'K', b'W', b'J', b'L'];
/// Current journal format version
const JOURNAL_VERSION: u16 = 1;
/// Segment header size: magic(4) + version(2) + reserved(2) = 8
const SEGMENT_HEADER_SIZE: usize = 8;
/// Record overhead: length(4) + sequence(8) + crc32(4) = 16
const RECORD_OVERHEAD: usize = 16;

/// Journal configuration.
#[derive(Clone, Debug)]
pub struct JournalConfig {
    /// Segment size that triggers compaction (default: 4MB)
    pub max_segment_size: u64,
    /// Sync mode
    pub sync_mode: SyncMode,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 4 * 1024 * 1024,
            sync_mode: SyncMode::Immediate,
        }
    }
}

/// Sync mode for the journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// fsync after every record
    Immediate,
    /// No explicit fsync, relies on the OS
    OsManaged,
}

/// A framed record as found on storage, before CRC and JSON checks.
struct RawRecord {
    offset: u64,
    sequence: u64,
    bytes: Vec<u8>,
    crc: u32,
}

struct ParsedSegment {
    valid_header: bool,
    records: Vec<RawRecord>,
    /// False when trailing bytes did not form a complete record.
    clean_tail: bool,
}

fn parse_segment(data: &[u8]) -> ParsedSegment {
    if data.len() < SEGMENT_HEADER_SIZE || data[..4] != JOURNAL_MAGIC {
        return ParsedSegment {
            valid_header: false,
            records: Vec::new(),
            clean_tail: false,
        };
    }

    let mut records = Vec::new();
    let mut pos = SEGMENT_HEADER_SIZE;
    let mut clean_tail = true;

    while pos < data.len() {
        if pos + RECORD_OVERHEAD > data.len() {
            clean_tail = false;
            break;
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[pos..pos + 4]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&data[pos + 4..pos + 12]);
        let length = u32::from_le_bytes(len_bytes) as usize;
        let sequence = u64::from_le_bytes(seq_bytes);

        let body_start = pos + 12;
        if length == 0 || body_start + length + 4 > data.len() {
            clean_tail = false;
            break;
        }

        let bytes = data[body_start..body_start + length].to_vec();
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&data[body_start + length..body_start + length + 4]);

        records.push(RawRecord {
            offset: pos as u64,
            sequence,
            bytes,
            crc: u32::from_le_bytes(crc_bytes),
        });
        pos = body_start + length + 4;
    }

    ParsedSegment {
        valid_header: true,
        records,
        clean_tail,
    }
}

fn frame_record(sequence: u64, record: &JournalRecord) -> Result<Vec<u8>, JournalError> {
    let bytes = serde_json::to_vec(record)?;
    let crc = crc32fast::hash(&bytes);

    // [length:4][sequence:8][json:N][crc32:4]
    let mut framed = Vec::with_capacity(RECORD_OVERHEAD + bytes.len());
    framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    framed.extend_from_slice(&sequence.to_le_bytes());
    framed.extend_from_slice(&bytes);
    framed.extend_from_slice(&crc.to_le_bytes());
    Ok(framed)
}

fn write_segment_header(writer: &mut dyn SegmentWriter) -> Result<(), JournalError> {
    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    header[..4].copy_from_slice(&JOURNAL_MAGIC);
    header[4..6].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
    // bytes 6..8 reserved
    writer.write_all(&header)?;
    writer.flush()?;
    Ok(())
}

struct JournalState {
    writer: Option<Box<dyn SegmentWriter>>,
    segment_id: u64,
    segment_size: u64,
    sequence: u64,
    /// Records in storage that no longer describe a live entry.
    dead_records: u64,
    live: HashMap<JournalId, (u64, JournalEntry)>,
}

impl JournalState {
    fn apply(&mut self, sequence: u64, record: JournalRecord) {
        match record {
            JournalRecord::Append(entry) => {
                if self.live.contains_key(&entry.id) {
                    // Duplicate left by an interrupted compaction.
                    self.dead_records += 1;
                } else {
                    self.live.insert(entry.id.clone(), (sequence, entry));
                }
            }
            JournalRecord::Remove { id } => {
                self.dead_records += if self.live.remove(&id).is_some() { 2 } else { 1 };
            }
        }
    }
}

/// Write-ahead journal: append-only, crash-recoverable record of pending side effects.
///
/// Segment format: `[magic:4][version:2][reserved:2][records...]`
/// Record format:  `[length:4][sequence:8][record_json:N][crc32:4]`
///
/// Entries are retired with tombstone records. Once the active segment grows
/// past `max_segment_size` and holds retired records, the live entries are
/// rewritten into a fresh segment and the older segments are deleted.
pub struct WriteAheadJournal {
    config: JournalConfig,
    storage: Box<dyn SegmentStorage>,
    state: Mutex<JournalState>,
}

impl WriteAheadJournal {
    /// Open or create a journal with the given storage backend.
    pub async fn open(
        config: JournalConfig,
        storage: Box<dyn SegmentStorage>,
    ) -> Result<Self, JournalError> {
        let existing = storage.list_segments()?;

        let mut state = JournalState {
            writer: None,
            segment_id: 0,
            segment_size: 0,
            sequence: 0,
            dead_records: 0,
            live: HashMap::new(),
        };
        let mut reusable_tail: Option<(u64, u64)> = None;

        for &segment_id in &existing {
            let data = storage.read_segment(segment_id)?;
            let parsed = parse_segment(&data);
            if !parsed.valid_header {
                warn!(segment_id, "Invalid journal segment header, skipping");
                continue;
            }

            for raw in parsed.records {
                if crc32fast::hash(&raw.bytes) != raw.crc {
                    warn!(
                        segment_id,
                        offset = raw.offset,
                        sequence = raw.sequence,
                        "CRC mismatch, skipping corrupted journal record"
                    );
                    continue;
                }
                match serde_json::from_slice::<JournalRecord>(&raw.bytes) {
                    Ok(record) => {
                        state.sequence = state.sequence.max(raw.sequence);
                        state.apply(raw.sequence, record);
                    }
                    Err(e) => {
                        warn!(
                            segment_id,
                            sequence = raw.sequence,
                            error = %e,
                            "Failed to decode journal record, skipping"
                        );
                    }
                }
            }

            if !parsed.clean_tail {
                warn!(segment_id, "Torn record at segment tail, ignoring remainder");
            }
            reusable_tail = parsed.clean_tail.then_some((segment_id, data.len() as u64));
        }

        let last_id = existing.last().copied().unwrap_or(0);
        match reusable_tail {
            Some((segment_id, size))
                if segment_id == last_id && size < config.max_segment_size =>
            {
                state.writer = Some(storage.append_segment(segment_id)?);
                state.segment_id = segment_id;
                state.segment_size = size;
            }
            _ => {
                let mut writer = storage.create_segment(last_id + 1)?;
                write_segment_header(&mut *writer)?;
                writer.sync()?;
                state.writer = Some(writer);
                state.segment_id = last_id + 1;
                state.segment_size = SEGMENT_HEADER_SIZE as u64;
            }
        }

        info!(
            segments = existing.len(),
            pending = state.live.len(),
            max_sequence = state.sequence,
            "Journal opened"
        );

        let journal = Self {
            config,
            storage,
            state: Mutex::new(state),
        };

        // Fold leftovers of earlier segments into the active one.
        if existing.len() > 1 {
            let mut state = journal.state.lock().await;
            journal.compact_locked(&mut state)?;
        }

        Ok(journal)
    }

    /// Open with file-backed storage.
    pub async fn open_file(config: JournalConfig, data_dir: PathBuf) -> Result<Self, JournalError> {
        let storage = Box::new(FileStorage::new(data_dir)?);
        Self::open(config, storage).await
    }

    /// Open with in-memory storage (for testing).
    pub async fn open_memory(config: JournalConfig) -> Result<Self, JournalError> {
        Self::open(config, Box::new(MemoryStorage::new())).await
    }

    /// Number of outstanding entries.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.live.len()
    }

    /// Highest sequence number written so far.
    pub async fn latest_sequence(&self) -> u64 {
        self.state.lock().await.sequence
    }

    /// Segment ids currently present on storage.
    pub fn segments(&self) -> Result<Vec<u64>, JournalError> {
        self.storage.list_segments()
    }

    /// Force a compaction of the active segment.
    pub async fn compact(&self) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        self.compact_locked(&mut state)
    }

    /// Verify journal integrity (CRC32 and record decoding) across all segments.
    pub async fn verify_integrity(&self) -> Result<IntegrityReport, JournalError> {
        // Hold the lock so no record is half written while we read.
        let _state = self.state.lock().await;
        let mut report = IntegrityReport::default();

        for segment_id in self.storage.list_segments()? {
            report.segments_checked += 1;
            let data = self.storage.read_segment(segment_id)?;
            for raw in parse_segment(&data).records {
                report.total_records += 1;
                let intact = crc32fast::hash(&raw.bytes) == raw.crc
                    && serde_json::from_slice::<JournalRecord>(&raw.bytes).is_ok();
                if intact {
                    report.verified_records += 1;
                } else {
                    report.corrupted_records += 1;
                    report.corrupted_offsets.push(raw.offset);
                }
            }
        }

        Ok(report)
    }

    // ---- Internal helpers ----

    fn write_record(
        &self,
        state: &mut JournalState,
        record: &JournalRecord,
    ) -> Result<u64, JournalError> {
        let sequence = state.sequence + 1;
        let framed = frame_record(sequence, record)?;

        if state.writer.is_none() {
            self.rotate(state)?;
        }
        let writer = state.writer.as_mut().ok_or(JournalError::Closed)?;
        let written = writer.write_all(&framed).and_then(|()| match self.config.sync_mode {
            SyncMode::Immediate => writer.sync(),
            SyncMode::OsManaged => writer.flush(),
        });
        if let Err(e) = written {
            // A partial frame may sit at the tail; nothing may follow it.
            warn!(
                segment_id = state.segment_id,
                error = %e,
                "Journal write failed, retiring segment"
            );
            state.writer = None;
            return Err(e);
        }

        state.sequence = sequence;
        state.segment_size += framed.len() as u64;
        Ok(sequence)
    }

    /// Start a fresh segment after the active one was retired.
    fn rotate(&self, state: &mut JournalState) -> Result<(), JournalError> {
        let new_id = state.segment_id + 1;
        let mut writer = self.storage.create_segment(new_id)?;
        write_segment_header(&mut *writer)?;
        writer.sync()?;
        state.writer = Some(writer);
        state.segment_id = new_id;
        state.segment_size = SEGMENT_HEADER_SIZE as u64;
        debug!(segment_id = new_id, "Journal segment rotated");
        Ok(())
    }

    /// Compact when the active segment is full of retired records. The
    /// record that triggered this is already durable, so a failure here is
    /// only logged and compaction is retried on a later write.
    fn maybe_compact(&self, state: &mut JournalState) {
        if state.segment_size >= self.config.max_segment_size && state.dead_records > 0 {
            if let Err(e) = self.compact_locked(state) {
                warn!(error = %e, "Journal compaction failed, will retry");
            }
        }
    }

    fn compact_locked(&self, state: &mut JournalState) -> Result<(), JournalError> {
        let new_id = state.segment_id + 1;
        let mut writer = self.storage.create_segment(new_id)?;
        let size = match write_live_segment(&mut *writer, state) {
            Ok(size) => size,
            Err(e) => {
                // A partial compacted segment replays after the active one
                // and would resurrect entries retired there. The next write
                // rotates onto the same id, truncating it.
                state.writer = None;
                return Err(e);
            }
        };

        state.writer = Some(writer);
        state.segment_id = new_id;
        state.segment_size = size;
        state.dead_records = 0;

        let mut removed = 0usize;
        for segment_id in self.storage.list_segments()? {
            if segment_id < new_id {
                if let Err(e) = self.storage.remove_segment(segment_id) {
                    warn!(segment_id, error = %e, "Failed to delete compacted journal segment");
                    continue;
                }
                removed += 1;
            }
        }

        info!(
            segment_id = new_id,
            pending = state.live.len(),
            removed_segments = removed,
            "Journal compacted"
        );
        Ok(())
    }
}

/// Write the header and every live entry, in original order, then sync.
/// Returns the segment size.
fn write_live_segment(
    writer: &mut dyn SegmentWriter,
    state: &JournalState,
) -> Result<u64, JournalError> {
    write_segment_header(writer)?;
    let mut size = SEGMENT_HEADER_SIZE as u64;

    let mut live: Vec<_> = state.live.values().collect();
    live.sort_by_key(|(sequence, _)| *sequence);
    for (sequence, entry) in live {
        // Original sequence numbers are kept so pending order survives.
        let framed = frame_record(*sequence, &JournalRecord::Append(entry.clone()))?;
        writer.write_all(&framed)?;
        size += framed.len() as u64;
    }
    writer.sync()?;
    Ok(size)
}

#[async_trait]
impl JournalStore for WriteAheadJournal {
    async fn append(&self, entry: JournalEntry) -> Result<JournalId, JournalError> {
        let id = entry.id.clone();
        let kind = entry.kind.clone();

        let mut state = self.state.lock().await;
        let record = JournalRecord::Append(entry);
        let sequence = self.write_record(&mut state, &record)?;
        if let JournalRecord::Append(entry) = record {
            state.live.insert(id.clone(), (sequence, entry));
        }
        self.maybe_compact(&mut state);

        debug!(journal_id = %id, kind = %kind, sequence, "Journal entry appended");
        Ok(id)
    }

    async fn remove(&self, id: &JournalId) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        if !state.live.contains_key(id) {
            debug!(journal_id = %id, "Journal entry already retired");
            return Ok(());
        }

        let sequence = self.write_record(&mut state, &JournalRecord::Remove { id: id.clone() })?;
        state.live.remove(id);
        state.dead_records += 2;
        self.maybe_compact(&mut state);

        debug!(journal_id = %id, sequence, "Journal entry removed");
        Ok(())
    }

    async fn get(&self, id: &JournalId) -> Result<Option<JournalEntry>, JournalError> {
        let state = self.state.lock().await;
        Ok(state.live.get(id).map(|(_, entry)| entry.clone()))
    }

    async fn pending(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let state = self.state.lock().await;
        let mut live: Vec<_> = state.live.values().cloned().collect();
        live.sort_by_key(|(sequence, _)| *sequence);
        Ok(live.into_iter().map(|(_, entry)| entry).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn user_payload(name: &str) -> serde_json::Value {
        json!({ "userName": name })
    }

    fn user_entry(name: &str) -> JournalEntry {
        JournalEntry::new("user", user_payload(name), Utc::now())
    }

    /// Switchable storage faults shared by a [`FaultyStorage`] and its writers.
    struct Faults {
        fail_create: AtomicBool,
        /// Writes left before one is torn; `usize::MAX` disables tearing.
        tear_in: AtomicUsize,
    }

    /// Memory storage that can refuse new segments or tear a write in half.
    #[derive(Clone)]
    struct FaultyStorage {
        inner: MemoryStorage,
        faults: Arc<Faults>,
    }

    impl FaultyStorage {
        fn new() -> Self {
            Self {
                inner: MemoryStorage::new(),
                faults: Arc::new(Faults {
                    fail_create: AtomicBool::new(false),
                    tear_in: AtomicUsize::new(usize::MAX),
                }),
            }
        }

        fn fail_create(&self, fail: bool) {
            self.faults.fail_create.store(fail, Ordering::SeqCst);
        }

        /// Let `writes` more writes through, then persist half of the next
        /// one and fail it.
        fn tear_after(&self, writes: usize) {
            self.faults.tear_in.store(writes, Ordering::SeqCst);
        }
    }

    fn disk_full() -> JournalError {
        JournalError::Io(std::io::Error::other("disk full"))
    }

    impl SegmentStorage for FaultyStorage {
        fn create_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, JournalError> {
            if self.faults.fail_create.load(Ordering::SeqCst) {
                return Err(disk_full());
            }
            Ok(Box::new(FaultyWriter {
                inner: self.inner.create_segment(segment_id)?,
                faults: Arc::clone(&self.faults),
            }))
        }

        fn append_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, JournalError> {
            Ok(Box::new(FaultyWriter {
                inner: self.inner.append_segment(segment_id)?,
                faults: Arc::clone(&self.faults),
            }))
        }

        fn read_segment(&self, segment_id: u64) -> Result<Vec<u8>, JournalError> {
            self.inner.read_segment(segment_id)
        }

        fn list_segments(&self) -> Result<Vec<u64>, JournalError> {
            self.inner.list_segments()
        }

        fn remove_segment(&self, segment_id: u64) -> Result<(), JournalError> {
            self.inner.remove_segment(segment_id)
        }
    }

    struct FaultyWriter {
        inner: Box<dyn SegmentWriter>,
        faults: Arc<Faults>,
    }

    impl SegmentWriter for FaultyWriter {
        fn write_all(&mut self, data: &[u8]) -> Result<(), JournalError> {
            match self.faults.tear_in.load(Ordering::SeqCst) {
                usize::MAX => self.inner.write_all(data),
                0 => {
                    self.faults.tear_in.store(usize::MAX, Ordering::SeqCst);
                    self.inner.write_all(&data[..data.len() / 2])?;
                    self.inner.sync()?;
                    Err(disk_full())
                }
                left => {
                    self.faults.tear_in.store(left - 1, Ordering::SeqCst);
                    self.inner.write_all(data)
                }
            }
        }

        fn flush(&mut self) -> Result<(), JournalError> {
            self.inner.flush()
        }

        fn sync(&mut self) -> Result<(), JournalError> {
            self.inner.sync()
        }
    }

    fn pending_ids(entries: Vec<JournalEntry>) -> Vec<JournalId> {
        entries.into_iter().map(|e| e.id).collect()
    }

    #[tokio::test]
    async fn append_and_get() {
        let journal = WriteAheadJournal::open_memory(JournalConfig::default())
            .await
            .unwrap();

        let id = journal.append(user_entry("vault-a")).await.unwrap();
        let entry = journal.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.kind, "user");
        assert_eq!(entry.payload, user_payload("vault-a"));
        assert_eq!(journal.latest_sequence().await, 1);
    }

    #[tokio::test]
    async fn remove_retires_entry() {
        let journal = WriteAheadJournal::open_memory(JournalConfig::default())
            .await
            .unwrap();

        let id = journal.append(user_entry("vault-a")).await.unwrap();
        journal.remove(&id).await.unwrap();

        assert!(journal.get(&id).await.unwrap().is_none());
        assert!(journal.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_unknown_id_is_noop() {
        let journal = WriteAheadJournal::open_memory(JournalConfig::default())
            .await
            .unwrap();

        journal.remove(&JournalId::new()).await.unwrap();
        assert_eq!(journal.latest_sequence().await, 0);
    }

    #[tokio::test]
    async fn pending_preserves_append_order() {
        let journal = WriteAheadJournal::open_memory(JournalConfig::default())
            .await
            .unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                journal
                    .append(user_entry(&format!("vault-{i}")))
                    .await
                    .unwrap(),
            );
        }
        journal.remove(&ids[2]).await.unwrap();

        let pending: Vec<_> = journal
            .pending()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(pending, vec![ids[0].clone(), ids[1].clone(), ids[3].clone(), ids[4].clone()]);
    }

    #[tokio::test]
    async fn reopen_replays_pending_entries() {
        let storage = MemoryStorage::new();
        let (kept, retired) = {
            let journal =
                WriteAheadJournal::open(JournalConfig::default(), Box::new(storage.clone()))
                    .await
                    .unwrap();
            let kept = journal.append(user_entry("vault-kept")).await.unwrap();
            let retired = journal.append(user_entry("vault-gone")).await.unwrap();
            journal.remove(&retired).await.unwrap();
            (kept, retired)
            // Journal dropped here (simulating crash)
        };

        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage))
            .await
            .unwrap();
        assert!(journal.get(&kept).await.unwrap().is_some());
        assert!(journal.get(&retired).await.unwrap().is_none());
        assert_eq!(journal.latest_sequence().await, 3);

        // New records continue the sequence.
        journal.append(user_entry("vault-next")).await.unwrap();
        assert_eq!(journal.latest_sequence().await, 4);
    }

    #[tokio::test]
    async fn torn_tail_is_ignored_on_reopen() {
        let storage = MemoryStorage::new();
        let first = {
            let journal =
                WriteAheadJournal::open(JournalConfig::default(), Box::new(storage.clone()))
                    .await
                    .unwrap();
            let first = journal.append(user_entry("vault-1")).await.unwrap();
            journal.append(user_entry("vault-2")).await.unwrap();
            first
        };
        storage.truncate_tail(1, 3);

        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage.clone()))
            .await
            .unwrap();
        let pending = journal.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first);

        // Writes after a torn tail land in a fresh segment and stay readable.
        let third = journal.append(user_entry("vault-3")).await.unwrap();
        drop(journal);
        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage))
            .await
            .unwrap();
        assert!(journal.get(&third).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupted_record_is_skipped_and_reported() {
        let storage = MemoryStorage::new();
        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage.clone()))
            .await
            .unwrap();
        journal.append(user_entry("vault-1")).await.unwrap();
        let second = journal.append(user_entry("vault-2")).await.unwrap();

        // Flip a byte inside the first record's JSON body.
        storage.corrupt(1, SEGMENT_HEADER_SIZE + 14, b'#');

        let report = journal.verify_integrity().await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.total_records, 2);
        assert_eq!(report.corrupted_records, 1);
        assert_eq!(report.corrupted_offsets, vec![SEGMENT_HEADER_SIZE as u64]);
        drop(journal);

        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage))
            .await
            .unwrap();
        let pending = journal.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second);
    }

    #[tokio::test]
    async fn compaction_drops_retired_records() {
        let config = JournalConfig {
            max_segment_size: 512, // Very small to trigger compaction
            ..JournalConfig::default()
        };
        let storage = MemoryStorage::new();
        let journal = WriteAheadJournal::open(config.clone(), Box::new(storage.clone()))
            .await
            .unwrap();

        let survivor = journal.append(user_entry("vault-survivor")).await.unwrap();
        for i in 0..20 {
            let id = journal
                .append(user_entry(&format!("vault-{i}")))
                .await
                .unwrap();
            journal.remove(&id).await.unwrap();
        }

        let segments = journal.segments().unwrap();
        assert_eq!(segments.len(), 1, "old segments should be deleted");
        assert!(segments[0] > 1, "journal should have compacted at least once");

        let report = journal.verify_integrity().await.unwrap();
        assert!(report.is_clean());
        assert!(report.total_records < 41);
        drop(journal);

        let journal = WriteAheadJournal::open(config, Box::new(storage)).await.unwrap();
        let pending = journal.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, survivor);
    }

    #[tokio::test]
    async fn interrupted_compaction_is_folded_on_open() {
        let storage = MemoryStorage::new();
        let id = {
            let journal =
                WriteAheadJournal::open(JournalConfig::default(), Box::new(storage.clone()))
                    .await
                    .unwrap();
            journal.append(user_entry("vault-a")).await.unwrap()
        };

        // A second segment that repeats the live entry, as a crash between
        // writing the compacted segment and deleting the old one would leave.
        let data = storage.read_segment(1).unwrap();
        let mut writer = storage.create_segment(2).unwrap();
        writer.write_all(&data).unwrap();
        writer.sync().unwrap();

        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage))
            .await
            .unwrap();
        assert_eq!(journal.pending_count().await, 1);
        assert!(journal.get(&id).await.unwrap().is_some());
        assert_eq!(journal.segments().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn file_backed_crash_recovery() {
        let dir = tempfile::tempdir().unwrap();

        let id = {
            let journal =
                WriteAheadJournal::open_file(JournalConfig::default(), dir.path().to_path_buf())
                    .await
                    .unwrap();
            let id = journal.append(user_entry("vault-crash")).await.unwrap();
            let done = journal.append(user_entry("vault-done")).await.unwrap();
            journal.remove(&done).await.unwrap();
            id
            // Journal dropped here (simulating crash)
        };

        let journal =
            WriteAheadJournal::open_file(JournalConfig::default(), dir.path().to_path_buf())
                .await
                .unwrap();
        let pending = journal.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].payload, user_payload("vault-crash"));

        let report = journal.verify_integrity().await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn os_managed_sync_still_visible_to_readers() {
        let config = JournalConfig {
            sync_mode: SyncMode::OsManaged,
            ..JournalConfig::default()
        };
        let storage = MemoryStorage::new();
        let journal = WriteAheadJournal::open(config.clone(), Box::new(storage.clone()))
            .await
            .unwrap();
        let id = journal.append(user_entry("vault-a")).await.unwrap();
        drop(journal);

        let journal = WriteAheadJournal::open(config, Box::new(storage)).await.unwrap();
        assert!(journal.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn compaction_failure_keeps_durable_writes() {
        let config = JournalConfig {
            max_segment_size: 200,
            ..JournalConfig::default()
        };
        let storage = FaultyStorage::new();
        let journal = WriteAheadJournal::open(config.clone(), Box::new(storage.clone()))
            .await
            .unwrap();

        let retired = journal.append(user_entry("vault-a")).await.unwrap();
        storage.fail_create(true);

        // The tombstone is durable even though compaction cannot start.
        journal.remove(&retired).await.unwrap();
        assert!(journal.get(&retired).await.unwrap().is_none());

        let kept = journal.append(user_entry("vault-b")).await.unwrap();
        assert!(journal.get(&kept).await.unwrap().is_some());
        assert_eq!(journal.segments().unwrap(), vec![1]);
        drop(journal);

        storage.fail_create(false);
        let journal = WriteAheadJournal::open(config, Box::new(storage)).await.unwrap();
        assert_eq!(pending_ids(journal.pending().await.unwrap()), vec![kept]);
    }

    #[tokio::test]
    async fn compaction_retries_after_failure() {
        let config = JournalConfig {
            max_segment_size: 200,
            ..JournalConfig::default()
        };
        let storage = FaultyStorage::new();
        let journal = WriteAheadJournal::open(config, Box::new(storage.clone()))
            .await
            .unwrap();

        let retired = journal.append(user_entry("vault-a")).await.unwrap();
        storage.fail_create(true);
        journal.remove(&retired).await.unwrap();
        assert_eq!(journal.segments().unwrap(), vec![1]);

        storage.fail_create(false);
        journal.append(user_entry("vault-b")).await.unwrap();
        assert_eq!(journal.segments().unwrap(), vec![2]);
        assert_eq!(journal.pending_count().await, 1);
    }

    #[tokio::test]
    async fn torn_write_does_not_hide_later_appends() {
        let storage = FaultyStorage::new();
        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage.clone()))
            .await
            .unwrap();
        let first = journal.append(user_entry("vault-1")).await.unwrap();

        storage.tear_after(0);
        let torn = user_entry("vault-torn");
        let torn_id = torn.id.clone();
        let err = journal.append(torn).await.unwrap_err();
        assert!(matches!(err, JournalError::Io(_)));
        assert!(journal.get(&torn_id).await.unwrap().is_none());

        // The next write lands in a fresh segment after the torn frame.
        let after = journal.append(user_entry("vault-after")).await.unwrap();
        assert_eq!(journal.segments().unwrap(), vec![1, 2]);
        drop(journal);

        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage))
            .await
            .unwrap();
        assert_eq!(pending_ids(journal.pending().await.unwrap()), vec![first, after]);
        assert!(journal.get(&torn_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_remove_keeps_entry_pending() {
        let storage = FaultyStorage::new();
        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage.clone()))
            .await
            .unwrap();
        let id = journal.append(user_entry("vault-a")).await.unwrap();

        storage.tear_after(0);
        assert!(journal.remove(&id).await.is_err());
        assert!(journal.get(&id).await.unwrap().is_some());

        journal.remove(&id).await.unwrap();
        drop(journal);

        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage))
            .await
            .unwrap();
        assert!(journal.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_compacted_segment_does_not_resurrect_entries() {
        let storage = FaultyStorage::new();
        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage.clone()))
            .await
            .unwrap();
        let first = journal.append(user_entry("vault-1")).await.unwrap();
        let second = journal.append(user_entry("vault-2")).await.unwrap();

        // Header and the first entry reach the new segment, the second tears.
        storage.tear_after(2);
        assert!(journal.compact().await.is_err());

        journal.remove(&first).await.unwrap();
        drop(journal);

        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage))
            .await
            .unwrap();
        assert_eq!(pending_ids(journal.pending().await.unwrap()), vec![second]);
    }

    #[tokio::test]
    async fn rotation_failure_surfaces_and_recovers() {
        let storage = FaultyStorage::new();
        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage.clone()))
            .await
            .unwrap();

        storage.tear_after(0);
        assert!(journal.append(user_entry("vault-torn")).await.is_err());

        storage.fail_create(true);
        assert!(journal.append(user_entry("vault-refused")).await.is_err());

        storage.fail_create(false);
        let id = journal.append(user_entry("vault-ok")).await.unwrap();
        drop(journal);

        let journal = WriteAheadJournal::open(JournalConfig::default(), Box::new(storage))
            .await
            .unwrap();
        assert_eq!(pending_ids(journal.pending().await.unwrap()), vec![id]);
    }
}

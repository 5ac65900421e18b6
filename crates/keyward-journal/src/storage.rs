use std::collections::BTreeMap;
use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::JournalError;

/// Storage backend for journal segments, file-backed or in-memory.
pub trait SegmentStorage: Send + Sync {
    /// Create a new segment (truncates if exists).
    fn create_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, JournalError>;
    /// Open an existing segment for appending.
    fn append_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, JournalError>;
    /// Read the full contents of a segment.
    fn read_segment(&self, segment_id: u64) -> Result<Vec<u8>, JournalError>;
    fn list_segments(&self) -> Result<Vec<u64>, JournalError>;
    fn remove_segment(&self, segment_id: u64) -> Result<(), JournalError>;
}

pub trait SegmentWriter: Send + Sync {
    fn write_all(&mut self, data: &[u8]) -> Result<(), JournalError>;
    fn flush(&mut self) -> Result<(), JournalError>;
    fn sync(&mut self) -> Result<(), JournalError>;
}

// ---- File-backed storage ----

pub struct FileStorage {
    data_dir: PathBuf,
}

impl FileStorage {
    pub fn new(data_dir: PathBuf) -> Result<Self, JournalError> {
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self { data_dir })
    }

    fn segment_path(&self, segment_id: u64) -> PathBuf {
        self.data_dir.join(format!("journal-{:016x}.seg", segment_id))
    }

    fn sync_dir(&self) -> Result<(), JournalError> {
        // Directory fsync makes segment creation and removal durable on unix.
        #[cfg(unix)]
        std::fs::File::open(&self.data_dir)?.sync_all()?;
        Ok(())
    }
}

impl SegmentStorage for FileStorage {
    fn create_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, JournalError> {
        let path = self.segment_path(segment_id);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        self.sync_dir()?;
        Ok(Box::new(FileSegmentWriter { file }))
    }

    fn append_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, JournalError> {
        let path = self.segment_path(segment_id);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Box::new(FileSegmentWriter { file }))
    }

    fn read_segment(&self, segment_id: u64) -> Result<Vec<u8>, JournalError> {
        let path = self.segment_path(segment_id);
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(JournalError::SegmentNotFound(segment_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_segments(&self) -> Result<Vec<u64>, JournalError> {
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(hex) = name
                .strip_prefix("journal-")
                .and_then(|s| s.strip_suffix(".seg"))
            {
                if let Ok(id) = u64::from_str_radix(hex, 16) {
                    segments.push(id);
                }
            }
        }
        segments.sort_unstable();
        Ok(segments)
    }

    fn remove_segment(&self, segment_id: u64) -> Result<(), JournalError> {
        std::fs::remove_file(self.segment_path(segment_id))?;
        self.sync_dir()
    }
}

struct FileSegmentWriter {
    file: std::fs::File,
}

impl SegmentWriter for FileSegmentWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<(), JournalError> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), JournalError> {
        self.file.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), JournalError> {
        self.file.sync_data()?;
        Ok(())
    }
}

// ---- In-memory storage (for testing) ----

type SegmentMap = Arc<Mutex<BTreeMap<u64, Vec<u8>>>>;

fn lock(segments: &SegmentMap) -> MutexGuard<'_, BTreeMap<u64, Vec<u8>>> {
    segments.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory segment storage.
///
/// Clones share the same segments, so a test can keep a handle, drop the
/// journal and reopen it over the surviving bytes.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    segments: SegmentMap,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a byte of a stored segment. Used to simulate corruption.
    pub fn corrupt(&self, segment_id: u64, offset: usize, value: u8) {
        if let Some(data) = lock(&self.segments).get_mut(&segment_id) {
            if let Some(byte) = data.get_mut(offset) {
                *byte = value;
            }
        }
    }

    /// Drop the last `len` bytes of a segment. Used to simulate a torn write.
    pub fn truncate_tail(&self, segment_id: u64, len: usize) {
        if let Some(data) = lock(&self.segments).get_mut(&segment_id) {
            let keep = data.len().saturating_sub(len);
            data.truncate(keep);
        }
    }
}

impl SegmentStorage for MemoryStorage {
    fn create_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, JournalError> {
        lock(&self.segments).insert(segment_id, Vec::new());
        Ok(Box::new(MemorySegmentWriter {
            segment_id,
            buffer: Vec::new(),
            segments: Arc::clone(&self.segments),
        }))
    }

    fn append_segment(&self, segment_id: u64) -> Result<Box<dyn SegmentWriter>, JournalError> {
        lock(&self.segments).entry(segment_id).or_default();
        Ok(Box::new(MemorySegmentWriter {
            segment_id,
            buffer: Vec::new(),
            segments: Arc::clone(&self.segments),
        }))
    }

    fn read_segment(&self, segment_id: u64) -> Result<Vec<u8>, JournalError> {
        lock(&self.segments)
            .get(&segment_id)
            .cloned()
            .ok_or(JournalError::SegmentNotFound(segment_id))
    }

    fn list_segments(&self) -> Result<Vec<u64>, JournalError> {
        Ok(lock(&self.segments).keys().copied().collect())
    }

    fn remove_segment(&self, segment_id: u64) -> Result<(), JournalError> {
        lock(&self.segments).remove(&segment_id);
        Ok(())
    }
}

struct MemorySegmentWriter {
    segment_id: u64,
    buffer: Vec<u8>,
    segments: SegmentMap,
}

impl SegmentWriter for MemorySegmentWriter {
    fn write_all(&mut self, data: &[u8]) -> Result<(), JournalError> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), JournalError> {
        self.sync()
    }

    fn sync(&mut self) -> Result<(), JournalError> {
        let mut guard = lock(&self.segments);
        guard
            .entry(self.segment_id)
            .or_default()
            .extend_from_slice(&self.buffer);
        self.buffer.clear();
        Ok(())
    }
}

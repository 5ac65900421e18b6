//! Write-ahead journal for remote side effects.
//!
//! An operation that is about to mutate a remote system first appends a
//! journal entry describing the mutation, and removes it once every remote
//! call has succeeded. Entries that outlive their operation (crash, remote
//! failure) are picked up by a reconciler and undone.
//!
//! The journal provides:
//! - Durable, CRC-checked append and tombstone records
//! - Crash recovery by replaying segments on open
//! - Compaction that rewrites only the live entries
//! - File-backed and in-memory segment storage

pub mod error;
pub mod journal;
pub mod storage;
pub mod traits;
pub mod types;

pub use error::JournalError;
pub use journal::{JournalConfig, SyncMode, WriteAheadJournal};
pub use storage::{FileStorage, MemoryStorage, SegmentStorage, SegmentWriter};
pub use traits::JournalStore;
pub use types::{IntegrityReport, JournalEntry, JournalId, JournalRecord};

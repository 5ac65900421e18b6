use async_trait::async_trait;

use crate::error::JournalError;
use crate::types::{JournalEntry, JournalId};

/// Durable store of pending side effects.
///
/// `append` must not return until the entry survives a process crash.
/// `remove` of an id that is not present succeeds, so committing and
/// reconciling the same entry twice is harmless. Either call failing
/// leaves the outstanding entries as they were.
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Record a pending side effect. Returns the id used to retire it.
    async fn append(&self, entry: JournalEntry) -> Result<JournalId, JournalError>;

    /// Retire an entry.
    async fn remove(&self, id: &JournalId) -> Result<(), JournalError>;

    /// Look up a single outstanding entry.
    async fn get(&self, id: &JournalId) -> Result<Option<JournalEntry>, JournalError>;

    /// All outstanding entries, oldest first.
    async fn pending(&self) -> Result<Vec<JournalEntry>, JournalError>;
}

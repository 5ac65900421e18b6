use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a journal entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JournalId(pub uuid::Uuid);

impl JournalId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JournalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JournalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pending side effect recorded before the effect is attempted.
///
/// The entry lives until the operation that wrote it commits, or until a
/// reconciler has undone whatever the operation left behind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: JournalId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl JournalEntry {
    /// New entry with a fresh id. `created_at` comes from the caller's clock,
    /// which is also what a reconciler measures the entry's age against.
    pub fn new(
        kind: impl Into<String>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JournalId::new(),
            kind: kind.into(),
            payload,
            created_at,
        }
    }

    /// Decode the payload into a typed structure.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// A single framed record in a journal segment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    Append(JournalEntry),
    Remove { id: JournalId },
}

/// Journal integrity report.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub total_records: u64,
    pub verified_records: u64,
    pub corrupted_records: u64,
    pub corrupted_offsets: Vec<u64>,
    pub segments_checked: u32,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted_records == 0
    }
}

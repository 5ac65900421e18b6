//! Process settings for a service embedding the backend.

use std::path::{Path, PathBuf};
use std::time::Duration;

use keyward_journal::{JournalConfig, JournalError, SyncMode, WriteAheadJournal};
use serde::{Deserialize, Serialize};

use crate::reconcile::ReconcilerConfig;
use crate::telemetry::LoggingConfig;

/// Environment variable prefix. Nested keys are separated by `__`, e.g.
/// `KEYWARD_RECONCILER__INTERVAL_SECS=30`.
pub const ENV_PREFIX: &str = "KEYWARD";

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywardSettings {
    #[serde(default)]
    pub journal: JournalSettings,

    #[serde(default)]
    pub reconciler: ReconcilerSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Journal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalSettings {
    /// Segment directory. In-memory journal when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,

    #[serde(default = "default_sync_mode")]
    pub sync_mode: SyncMode,
}

impl Default for JournalSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_segment_size: default_max_segment_size(),
            sync_mode: default_sync_mode(),
        }
    }
}

impl JournalSettings {
    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            max_segment_size: self.max_segment_size,
            sync_mode: self.sync_mode,
        }
    }

    /// Open the journal these settings describe.
    pub async fn open_journal(&self) -> Result<WriteAheadJournal, JournalError> {
        match &self.data_dir {
            Some(dir) => WriteAheadJournal::open_file(self.journal_config(), dir.clone()).await,
            None => WriteAheadJournal::open_memory(self.journal_config()).await,
        }
    }
}

/// Reconciler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSettings {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_min_age")]
    pub min_age_secs: u64,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            min_age_secs: default_min_age(),
        }
    }
}

impl ReconcilerSettings {
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            min_age: Duration::from_secs(self.min_age_secs),
        }
    }
}

fn default_max_segment_size() -> u64 {
    JournalConfig::default().max_segment_size
}

fn default_sync_mode() -> SyncMode {
    SyncMode::Immediate
}

fn default_interval() -> u64 {
    60
}

fn default_min_age() -> u64 {
    300
}

impl KeywardSettings {
    /// Load settings: defaults, then the optional file, then `KEYWARD_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&KeywardSettings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

//! Reconciliation of journal entries left behind by failed or interrupted
//! issuance.

use std::sync::Arc;
use std::time::Duration;

use keyward_journal::{JournalEntry, JournalError, JournalStore};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::rollback::{RollbackHandler, UserRollback, USER_JOURNAL_KIND};

/// Reconciler timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Time between passes.
    pub interval: Duration,
    /// Entries younger than this may belong to an issuance still in flight
    /// and are left alone.
    pub min_age: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            min_age: Duration::from_secs(300),
        }
    }
}

/// Outcome of a single reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub rolled_back: usize,
    pub failed: usize,
    pub too_young: usize,
    pub skipped: usize,
}

enum EntryOutcome {
    RolledBack,
    Failed,
    TooYoung,
    Skipped,
}

/// Replays pending `user` journal entries through the rollback handler.
pub struct JournalReconciler {
    journal: Arc<dyn JournalStore>,
    rollback: Arc<dyn RollbackHandler>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

impl JournalReconciler {
    pub fn new(
        journal: Arc<dyn JournalStore>,
        rollback: Arc<dyn RollbackHandler>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            journal,
            rollback,
            clock,
            config,
        }
    }

    fn is_old_enough(&self, entry: &JournalEntry) -> bool {
        let age = self.clock.now() - entry.created_at;
        age.to_std().map(|age| age >= self.config.min_age).unwrap_or(false)
    }

    async fn reconcile_entry(&self, entry: &JournalEntry) -> Result<EntryOutcome, JournalError> {
        if entry.kind != USER_JOURNAL_KIND {
            debug!(
                journal_id = %entry.id,
                kind = %entry.kind,
                "Skipping journal entry of unknown kind"
            );
            return Ok(EntryOutcome::Skipped);
        }
        if !self.is_old_enough(entry) {
            return Ok(EntryOutcome::TooYoung);
        }

        let rollback: UserRollback = match entry.decode() {
            Ok(rollback) => rollback,
            Err(e) => {
                error!(journal_id = %entry.id, error = %e, "Malformed user journal entry");
                return Ok(EntryOutcome::Failed);
            }
        };

        match self.rollback.rollback_user(&rollback).await {
            Ok(()) => {
                self.journal.remove(&entry.id).await?;
                info!(
                    username = %rollback.username,
                    journal_id = %entry.id,
                    "Reconciled journal entry"
                );
                Ok(EntryOutcome::RolledBack)
            }
            Err(e) => {
                warn!(
                    username = %rollback.username,
                    journal_id = %entry.id,
                    error = %e,
                    "Rollback failed, will retry next pass"
                );
                Ok(EntryOutcome::Failed)
            }
        }
    }

    /// One pass over the pending entries.
    pub async fn run_once(&self) -> Result<ReconcileReport, JournalError> {
        let mut report = ReconcileReport::default();
        for entry in self.journal.pending().await? {
            report.examined += 1;
            match self.reconcile_entry(&entry).await? {
                EntryOutcome::RolledBack => report.rolled_back += 1,
                EntryOutcome::Failed => report.failed += 1,
                EntryOutcome::TooYoung => report.too_young += 1,
                EntryOutcome::Skipped => report.skipped += 1,
            }
        }
        if report.examined > 0 {
            debug!(
                examined = report.examined,
                rolled_back = report.rolled_back,
                failed = report.failed,
                "Reconciliation pass complete"
            );
        }
        Ok(report)
    }

    /// Run passes until `shutdown` becomes `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.interval.as_secs(),
            min_age_secs = self.config.min_age.as_secs(),
            "Journal reconciler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Journal reconciler stopped");
    }
}

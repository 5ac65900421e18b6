//! Access-key secrets backend.
//!
//! Issues cloud credentials for a requesting principal, either as a
//! temporary federation token or as a durable IAM user with a long-lived
//! access key, and ties each credential to a lease whose revocation deletes
//! the user again.
//!
//! ## Crash safety
//!
//! Creating an IAM user and binding credentials to it are separate,
//! non-transactional remote calls. Every issuance is therefore bracketed by
//! a [`keyward_journal`] entry: appended before the user is created, removed
//! only after the last remote call succeeded. Entries that survive a crash
//! or a remote failure are picked up by the [`JournalReconciler`], which
//! deletes the user through the same [`RollbackHandler`] lease revocation
//! uses.
//!
//! ## Error severity
//!
//! - Configuration and remote failures are recoverable: the caller may retry
//!   and a fresh user name is generated.
//! - Journal failures and lease integrity violations are hard errors. A
//!   failed final journal removal is reported even though the credential
//!   itself was issued.

pub mod backend;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod lease;
pub mod mocks;
pub mod naming;
pub mod provision;
pub mod reconcile;
pub mod rollback;
pub mod settings;
pub mod telemetry;

pub use backend::{AccessKeysBackend, AccessKeysBackendBuilder};
pub use client::{
    AccessKey, FederatedCredentials, IdentityClient, IdentityClientFactory, ProviderError,
    ProviderErrorKind, ProviderOperation, StaticClientFactory,
};
pub use clock::{Clock, SystemClock};
pub use config::{ConfigStore, LeaseConfig, MemoryConfigStore, RootConfig};
pub use error::{CredentialError, RollbackError, StorageError};
pub use lease::{
    AccessKeyLeaseData, CredentialLease, LeaseManager, LeaseRenewal, RenewRequest,
    SECRET_ACCESS_KEY_TYPE,
};
pub use mocks::{FixedClock, FixedRandom, MockIdentityClient, MockRollback, RecordingJournal};
pub use naming::{normalize_display_name, RandomSource, ThreadRandom, UsernameGenerator};
pub use provision::{CredentialProvisioner, IssuedCredential, IssuedSecret, PolicyAttachment};
pub use reconcile::{JournalReconciler, ReconcileReport, ReconcilerConfig};
pub use rollback::{IdentityRollback, RollbackHandler, UserRollback, USER_JOURNAL_KIND};
pub use settings::KeywardSettings;
pub use telemetry::{init_tracing, LoggingConfig};

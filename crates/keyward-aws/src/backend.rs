//! Entry points used by the secrets-engine dispatcher.

use std::sync::Arc;
use std::time::Duration;

use keyward_journal::JournalStore;

use crate::client::IdentityClientFactory;
use crate::clock::{Clock, SystemClock};
use crate::config::ConfigStore;
use crate::error::CredentialError;
use crate::lease::{CredentialLease, LeaseManager, LeaseRenewal, RenewRequest};
use crate::naming::{RandomSource, ThreadRandom};
use crate::provision::{CredentialProvisioner, IssuedSecret};
use crate::reconcile::{JournalReconciler, ReconcilerConfig};
use crate::rollback::{IdentityRollback, RollbackHandler};

/// Access-key secrets backend.
///
/// Issuance, renewal and revocation share one configuration store, and
/// revocation and reconciliation share one rollback handler.
pub struct AccessKeysBackend {
    provisioner: CredentialProvisioner,
    leases: LeaseManager,
    journal: Arc<dyn JournalStore>,
    rollback: Arc<dyn RollbackHandler>,
    clock: Arc<dyn Clock>,
}

impl AccessKeysBackend {
    pub fn builder(
        config: Arc<dyn ConfigStore>,
        clients: Arc<dyn IdentityClientFactory>,
        journal: Arc<dyn JournalStore>,
    ) -> AccessKeysBackendBuilder {
        AccessKeysBackendBuilder {
            config,
            clients,
            journal,
            clock: Arc::new(SystemClock),
            random: Arc::new(ThreadRandom),
            rollback: None,
        }
    }

    pub async fn issue_federation_credential(
        &self,
        display_name: &str,
        policy_name: &str,
        policy: &str,
        lifetime: Option<Duration>,
    ) -> Result<IssuedSecret, CredentialError> {
        self.provisioner
            .issue_federation_credential(display_name, policy_name, policy, lifetime)
            .await
    }

    pub async fn issue_user_credential(
        &self,
        display_name: &str,
        policy_name: &str,
        policy: &str,
    ) -> Result<IssuedSecret, CredentialError> {
        self.provisioner
            .issue_user_credential(display_name, policy_name, policy)
            .await
    }

    pub async fn renew_lease(
        &self,
        lease: &CredentialLease,
        request: &RenewRequest,
    ) -> Result<LeaseRenewal, CredentialError> {
        self.leases.renew_lease(lease, request).await
    }

    pub async fn revoke_lease(&self, lease: &CredentialLease) -> Result<(), CredentialError> {
        self.leases.revoke_lease(lease).await
    }

    /// Reconciler over this backend's journal and rollback handler.
    pub fn reconciler(&self, config: ReconcilerConfig) -> JournalReconciler {
        JournalReconciler::new(
            Arc::clone(&self.journal),
            Arc::clone(&self.rollback),
            Arc::clone(&self.clock),
            config,
        )
    }
}

/// Builder for [`AccessKeysBackend`].
pub struct AccessKeysBackendBuilder {
    config: Arc<dyn ConfigStore>,
    clients: Arc<dyn IdentityClientFactory>,
    journal: Arc<dyn JournalStore>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    rollback: Option<Arc<dyn RollbackHandler>>,
}

impl AccessKeysBackendBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Replace the default [`IdentityRollback`].
    pub fn rollback(mut self, rollback: Arc<dyn RollbackHandler>) -> Self {
        self.rollback = Some(rollback);
        self
    }

    pub fn build(self) -> AccessKeysBackend {
        let rollback = self.rollback.unwrap_or_else(|| {
            Arc::new(IdentityRollback::new(
                Arc::clone(&self.config),
                Arc::clone(&self.clients),
            ))
        });
        AccessKeysBackend {
            provisioner: CredentialProvisioner::new(
                Arc::clone(&self.config),
                self.clients,
                Arc::clone(&self.journal),
                Arc::clone(&self.clock),
                self.random,
            ),
            leases: LeaseManager::new(self.config, Arc::clone(&rollback), Arc::clone(&self.clock)),
            journal: self.journal,
            rollback,
            clock: self.clock,
        }
    }
}

//! Credential issuance.
//!
//! Both strategies create a remote IAM user, so both are bracketed by the
//! journal:
//!
//! 1. append a `user` entry naming the user about to be created,
//! 2. run the remote calls in order, stopping at the first failure,
//! 3. remove the entry once every call has succeeded.
//!
//! A remote failure leaves the entry behind for the reconciler and is
//! reported as recoverable. A failed append or a failed final remove are
//! hard errors.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use keyward_journal::{JournalEntry, JournalId, JournalStore};
use tracing::{debug, info, warn};

use crate::client::{IdentityClient, IdentityClientFactory};
use crate::clock::Clock;
use crate::config::ConfigStore;
use crate::error::CredentialError;
use crate::lease::{AccessKeyLeaseData, CredentialLease, DEFAULT_LEASE_DURATION};
use crate::naming::{RandomSource, UsernameGenerator};
use crate::rollback::{UserRollback, USER_JOURNAL_KIND};

/// Prefix marking a policy as a reference to an existing managed policy.
pub const MANAGED_POLICY_PREFIX: &str = "arn:";

/// Credential handed back to the caller.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Present only for federation tokens.
    pub session_token: Option<String>,
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// An issued credential together with the lease that tracks it.
#[derive(Clone, Debug)]
pub struct IssuedSecret {
    pub credential: IssuedCredential,
    pub lease: CredentialLease,
}

impl IssuedSecret {
    /// The generated IAM user backing this credential.
    pub fn username(&self) -> Option<String> {
        self.lease.access_key_data().ok().map(|data| data.username)
    }
}

/// How a policy is bound to a durable user.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyAttachment<'a> {
    /// Attach an existing managed policy by ARN.
    Managed(&'a str),
    /// Put the document as an inline policy.
    Inline(&'a str),
}

impl<'a> PolicyAttachment<'a> {
    pub fn classify(policy: &'a str) -> Self {
        if policy.starts_with(MANAGED_POLICY_PREFIX) {
            PolicyAttachment::Managed(policy)
        } else {
            PolicyAttachment::Inline(policy)
        }
    }
}

/// Issues credentials against the identity provider, journaling every user
/// it creates.
pub struct CredentialProvisioner {
    config: Arc<dyn ConfigStore>,
    clients: Arc<dyn IdentityClientFactory>,
    journal: Arc<dyn JournalStore>,
    names: UsernameGenerator,
    clock: Arc<dyn Clock>,
}

impl CredentialProvisioner {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        clients: Arc<dyn IdentityClientFactory>,
        journal: Arc<dyn JournalStore>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            config,
            clients,
            journal,
            names: UsernameGenerator::new(clock.clone(), random),
            clock,
        }
    }

    /// Client for the configured root credentials. Nothing is journaled or
    /// sent when this fails.
    async fn client(&self) -> Result<Arc<dyn IdentityClient>, CredentialError> {
        let root = self
            .config
            .root_config()
            .await
            .map_err(|e| CredentialError::Configuration(e.to_string()))?
            .ok_or_else(|| {
                CredentialError::Configuration("root credentials are not configured".into())
            })?;
        self.clients
            .build(&root)
            .await
            .map_err(|e| CredentialError::Configuration(e.to_string()))
    }

    async fn begin(&self, username: &str) -> Result<JournalId, CredentialError> {
        let payload = serde_json::to_value(UserRollback::new(username))
            .map_err(|e| CredentialError::JournalWrite(e.into()))?;
        let id = self
            .journal
            .append(JournalEntry::new(USER_JOURNAL_KIND, payload, self.clock.now()))
            .await
            .map_err(CredentialError::JournalWrite)?;
        debug!(username, journal_id = %id, "Journaled pending IAM user");
        Ok(id)
    }

    async fn commit(&self, id: &JournalId, username: &str) -> Result<(), CredentialError> {
        self.journal
            .remove(id)
            .await
            .map_err(|source| CredentialError::JournalCommit {
                username: username.to_string(),
                source,
            })
    }

    /// Issue temporary credentials through a federation token.
    ///
    /// The token carries `policy` directly and no policy is bound to the
    /// user; `policy_name` is only logged.
    pub async fn issue_federation_credential(
        &self,
        display_name: &str,
        policy_name: &str,
        policy: &str,
        lifetime: Option<Duration>,
    ) -> Result<IssuedSecret, CredentialError> {
        let client = self.client().await?;
        let username = self.names.federation_username(display_name);
        let journal_id = self.begin(&username).await?;

        let outcome = async {
            client.create_identity(&username).await?;
            debug!(username = %username, "Created IAM user");
            client
                .issue_federation_token(&username, policy, lifetime.map(|d| d.as_secs()))
                .await
        }
        .await;

        let token = match outcome {
            Ok(token) => token,
            Err(e) => {
                warn!(
                    username = %username,
                    error = %e,
                    "Federation issuance failed, journal entry kept"
                );
                return Err(e.into());
            }
        };

        self.commit(&journal_id, &username).await?;
        info!(username = %username, policy_name, "Issued federation credential");

        let lease = CredentialLease::new(
            &AccessKeyLeaseData {
                username,
                policy: policy.to_string(),
            },
            lifetime.unwrap_or(DEFAULT_LEASE_DURATION),
            self.clock.now(),
        );
        Ok(IssuedSecret {
            credential: IssuedCredential {
                access_key_id: token.access_key_id,
                secret_access_key: token.secret_access_key,
                session_token: Some(token.session_token),
            },
            lease,
        })
    }

    /// Issue a long-lived access key for a fresh IAM user bound to `policy`.
    pub async fn issue_user_credential(
        &self,
        display_name: &str,
        policy_name: &str,
        policy: &str,
    ) -> Result<IssuedSecret, CredentialError> {
        let client = self.client().await?;
        let username = self.names.user_username(display_name, policy_name);
        let journal_id = self.begin(&username).await?;

        let outcome = async {
            client.create_identity(&username).await?;
            match PolicyAttachment::classify(policy) {
                PolicyAttachment::Managed(arn) => {
                    client.attach_managed_policy(&username, arn).await?;
                }
                PolicyAttachment::Inline(document) => {
                    client
                        .put_inline_policy(&username, policy_name, document)
                        .await?;
                }
            }
            client.create_access_key(&username).await
        }
        .await;

        let key = match outcome {
            Ok(key) => key,
            Err(e) => {
                warn!(username = %username, error = %e, "User issuance failed, journal entry kept");
                return Err(e.into());
            }
        };

        self.commit(&journal_id, &username).await?;
        info!(username = %username, policy_name, "Issued IAM user credential");

        let lease = CredentialLease::new(
            &AccessKeyLeaseData {
                username,
                policy: policy.to_string(),
            },
            DEFAULT_LEASE_DURATION,
            self.clock.now(),
        );
        Ok(IssuedSecret {
            credential: IssuedCredential {
                access_key_id: key.access_key_id,
                secret_access_key: key.secret_access_key,
                session_token: None,
            },
            lease,
        })
    }
}

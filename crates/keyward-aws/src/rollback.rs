//! Teardown of generated IAM users.
//!
//! Revoking a lease and reconciling an orphaned journal entry are the same
//! operation: delete everything hanging off a user name, then the user.
//! Every step treats "not found" as already done, so a user that was never
//! created, half created, or fully created and used can all be rolled back,
//! any number of times.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::{IdentityClient, IdentityClientFactory, ProviderError};
use crate::config::ConfigStore;
use crate::error::RollbackError;

/// Journal entry kind for a pending user creation.
pub const USER_JOURNAL_KIND: &str = "user";

/// Payload of a user rollback, stored verbatim as the journal entry payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRollback {
    #[serde(rename = "userName", alias = "username")]
    pub username: String,
}

impl UserRollback {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// Undoes the remote side effects of a user creation.
#[async_trait]
pub trait RollbackHandler: Send + Sync {
    async fn rollback_user(&self, rollback: &UserRollback) -> Result<(), RollbackError>;
}

/// Rollback handler that deletes the user through the identity provider.
pub struct IdentityRollback {
    config: Arc<dyn ConfigStore>,
    clients: Arc<dyn IdentityClientFactory>,
}

impl IdentityRollback {
    pub fn new(config: Arc<dyn ConfigStore>, clients: Arc<dyn IdentityClientFactory>) -> Self {
        Self { config, clients }
    }

    async fn client(&self) -> Result<Arc<dyn IdentityClient>, RollbackError> {
        let root = self
            .config
            .root_config()
            .await
            .map_err(|e| RollbackError::ClientUnavailable(e.to_string()))?
            .ok_or_else(|| {
                RollbackError::ClientUnavailable("no root credentials configured".into())
            })?;
        self.clients
            .build(&root)
            .await
            .map_err(|e| RollbackError::ClientUnavailable(e.to_string()))
    }
}

/// Map "not found" to `None`, keep every other outcome.
fn tolerate_missing<T>(result: Result<T, ProviderError>) -> Result<Option<T>, ProviderError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

async fn teardown(client: &dyn IdentityClient, username: &str) -> Result<bool, ProviderError> {
    let Some(keys) = tolerate_missing(client.list_access_keys(username).await)? else {
        return Ok(false);
    };
    for key_id in keys {
        tolerate_missing(client.delete_access_key(username, &key_id).await)?;
    }

    for policy_arn in tolerate_missing(client.list_attached_policies(username).await)?
        .unwrap_or_default()
    {
        tolerate_missing(client.detach_managed_policy(username, &policy_arn).await)?;
    }

    for policy_name in tolerate_missing(client.list_inline_policies(username).await)?
        .unwrap_or_default()
    {
        tolerate_missing(client.delete_inline_policy(username, &policy_name).await)?;
    }

    Ok(tolerate_missing(client.delete_identity(username).await)?.is_some())
}

#[async_trait]
impl RollbackHandler for IdentityRollback {
    async fn rollback_user(&self, rollback: &UserRollback) -> Result<(), RollbackError> {
        if rollback.username.is_empty() {
            return Err(RollbackError::InvalidPayload("empty user name".into()));
        }

        let client = self.client().await?;
        let deleted = teardown(client.as_ref(), &rollback.username)
            .await
            .map_err(|source| RollbackError::Provider {
                username: rollback.username.clone(),
                source,
            })?;

        if deleted {
            info!(username = %rollback.username, "IAM user rolled back");
        } else {
            debug!(username = %rollback.username, "IAM user already absent");
        }
        Ok(())
    }
}

//! Call surface of the remote identity provider.
//!
//! The backend never talks to a provider SDK directly. Everything goes
//! through [`IdentityClient`], which a deployment implements over its SDK of
//! choice and tests implement with [`crate::mocks::MockIdentityClient`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::RootConfig;

/// Remote operations, used to label provider failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderOperation {
    CreateIdentity,
    AttachManagedPolicy,
    PutInlinePolicy,
    CreateAccessKey,
    IssueFederationToken,
    ListAccessKeys,
    DeleteAccessKey,
    ListAttachedPolicies,
    DetachManagedPolicy,
    ListInlinePolicies,
    DeleteInlinePolicy,
    DeleteIdentity,
    Connect,
}

impl fmt::Display for ProviderOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderOperation::CreateIdentity => "creating IAM user",
            ProviderOperation::AttachManagedPolicy => "attaching user policy",
            ProviderOperation::PutInlinePolicy => "putting user policy",
            ProviderOperation::CreateAccessKey => "creating access keys",
            ProviderOperation::IssueFederationToken => "creating federation token",
            ProviderOperation::ListAccessKeys => "listing access keys",
            ProviderOperation::DeleteAccessKey => "deleting access key",
            ProviderOperation::ListAttachedPolicies => "listing attached user policies",
            ProviderOperation::DetachManagedPolicy => "detaching user policy",
            ProviderOperation::ListInlinePolicies => "listing user policies",
            ProviderOperation::DeleteInlinePolicy => "deleting user policy",
            ProviderOperation::DeleteIdentity => "deleting IAM user",
            ProviderOperation::Connect => "building identity client",
        };
        f.write_str(label)
    }
}

/// Coarse classification of provider failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderErrorKind {
    NotFound,
    AccessDenied,
    Throttled,
    Other,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderErrorKind::NotFound => "not found",
            ProviderErrorKind::AccessDenied => "access denied",
            ProviderErrorKind::Throttled => "throttled",
            ProviderErrorKind::Other => "error",
        };
        f.write_str(label)
    }
}

/// A failed remote call.
///
/// Messages must never carry key material.
#[derive(Error, Clone, Debug)]
#[error("Error {operation}: {kind}: {message}")]
pub struct ProviderError {
    pub operation: ProviderOperation,
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(
        operation: ProviderOperation,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(operation: ProviderOperation, message: impl Into<String>) -> Self {
        Self::new(operation, ProviderErrorKind::NotFound, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }
}

/// A long-lived access key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessKey {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKey")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Temporary credentials returned by a federation token request.
#[derive(Clone, PartialEq, Eq)]
pub struct FederatedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
}

impl fmt::Debug for FederatedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FederatedCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .finish()
    }
}

/// Remote identity provider (IAM users, policies, keys, federation tokens).
#[async_trait]
pub trait IdentityClient: Send + Sync {
    async fn create_identity(&self, user_name: &str) -> Result<(), ProviderError>;

    async fn attach_managed_policy(
        &self,
        user_name: &str,
        policy_arn: &str,
    ) -> Result<(), ProviderError>;

    async fn put_inline_policy(
        &self,
        user_name: &str,
        policy_name: &str,
        policy_document: &str,
    ) -> Result<(), ProviderError>;

    async fn create_access_key(&self, user_name: &str) -> Result<AccessKey, ProviderError>;

    async fn issue_federation_token(
        &self,
        name: &str,
        policy_document: &str,
        duration_seconds: Option<u64>,
    ) -> Result<FederatedCredentials, ProviderError>;

    /// Access key ids owned by the identity.
    async fn list_access_keys(&self, user_name: &str) -> Result<Vec<String>, ProviderError>;

    async fn delete_access_key(
        &self,
        user_name: &str,
        access_key_id: &str,
    ) -> Result<(), ProviderError>;

    /// ARNs of managed policies attached to the identity.
    async fn list_attached_policies(&self, user_name: &str) -> Result<Vec<String>, ProviderError>;

    async fn detach_managed_policy(
        &self,
        user_name: &str,
        policy_arn: &str,
    ) -> Result<(), ProviderError>;

    /// Names of inline policies on the identity.
    async fn list_inline_policies(&self, user_name: &str) -> Result<Vec<String>, ProviderError>;

    async fn delete_inline_policy(
        &self,
        user_name: &str,
        policy_name: &str,
    ) -> Result<(), ProviderError>;

    async fn delete_identity(&self, user_name: &str) -> Result<(), ProviderError>;
}

/// Builds an [`IdentityClient`] from the stored root credentials.
#[async_trait]
pub trait IdentityClientFactory: Send + Sync {
    async fn build(&self, root: &RootConfig) -> Result<Arc<dyn IdentityClient>, ProviderError>;
}

/// Factory that hands out one pre-built client regardless of root config.
#[derive(Clone)]
pub struct StaticClientFactory {
    client: Arc<dyn IdentityClient>,
}

impl StaticClientFactory {
    pub fn new(client: Arc<dyn IdentityClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IdentityClientFactory for StaticClientFactory {
    async fn build(&self, _root: &RootConfig) -> Result<Arc<dyn IdentityClient>, ProviderError> {
        Ok(Arc::clone(&self.client))
    }
}

//! In-memory collaborators for tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use keyward_journal::{JournalEntry, JournalError, JournalId, JournalStore};

use crate::client::{
    AccessKey, FederatedCredentials, IdentityClient, ProviderError, ProviderErrorKind,
    ProviderOperation,
};
use crate::clock::Clock;
use crate::error::RollbackError;
use crate::naming::RandomSource;
use crate::rollback::{RollbackHandler, UserRollback};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A call received by [`MockIdentityClient`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityCall {
    CreateIdentity {
        user_name: String,
    },
    AttachManagedPolicy {
        user_name: String,
        policy_arn: String,
    },
    PutInlinePolicy {
        user_name: String,
        policy_name: String,
        policy_document: String,
    },
    CreateAccessKey {
        user_name: String,
    },
    IssueFederationToken {
        name: String,
        policy_document: String,
        duration_seconds: Option<u64>,
    },
    ListAccessKeys {
        user_name: String,
    },
    DeleteAccessKey {
        user_name: String,
        access_key_id: String,
    },
    ListAttachedPolicies {
        user_name: String,
    },
    DetachManagedPolicy {
        user_name: String,
        policy_arn: String,
    },
    ListInlinePolicies {
        user_name: String,
    },
    DeleteInlinePolicy {
        user_name: String,
        policy_name: String,
    },
    DeleteIdentity {
        user_name: String,
    },
}

/// State of one user held by [`MockIdentityClient`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MockUser {
    pub access_keys: Vec<String>,
    pub managed_policies: Vec<String>,
    pub inline_policies: BTreeMap<String, String>,
}

#[derive(Default)]
struct MockIdentityState {
    users: BTreeMap<String, MockUser>,
    calls: Vec<IdentityCall>,
    failures: HashSet<ProviderOperation>,
}

/// Identity provider that keeps users in memory and records every call.
///
/// Operations registered with [`fail_on`](Self::fail_on) are recorded and
/// then fail without touching state.
#[derive(Default)]
pub struct MockIdentityClient {
    state: Mutex<MockIdentityState>,
    next_key: AtomicU64,
}

impl MockIdentityClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a user directly, bypassing call recording.
    pub fn seed_user(
        &self,
        user_name: &str,
        access_keys: &[&str],
        managed_policies: &[&str],
        inline_policies: &[&str],
    ) {
        let user = MockUser {
            access_keys: access_keys.iter().map(|k| k.to_string()).collect(),
            managed_policies: managed_policies.iter().map(|p| p.to_string()).collect(),
            inline_policies: inline_policies
                .iter()
                .map(|name| (name.to_string(), "{}".to_string()))
                .collect(),
        };
        lock(&self.state).users.insert(user_name.to_string(), user);
    }

    pub fn user_exists(&self, user_name: &str) -> bool {
        lock(&self.state).users.contains_key(user_name)
    }

    pub fn user(&self, user_name: &str) -> Option<MockUser> {
        lock(&self.state).users.get(user_name).cloned()
    }

    pub fn user_count(&self) -> usize {
        lock(&self.state).users.len()
    }

    pub fn calls(&self) -> Vec<IdentityCall> {
        lock(&self.state).calls.clone()
    }

    /// Make every subsequent call of `operation` fail.
    pub fn fail_on(&self, operation: ProviderOperation) {
        lock(&self.state).failures.insert(operation);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    /// Record the call and fail it if requested.
    fn enter(
        &self,
        operation: ProviderOperation,
        call: IdentityCall,
    ) -> Result<MutexGuard<'_, MockIdentityState>, ProviderError> {
        let mut state = lock(&self.state);
        state.calls.push(call);
        if state.failures.contains(&operation) {
            return Err(ProviderError::new(
                operation,
                ProviderErrorKind::Other,
                "injected failure",
            ));
        }
        Ok(state)
    }

    fn next_key_id(&self, prefix: &str) -> String {
        format!("{}{:016}", prefix, self.next_key.fetch_add(1, Ordering::SeqCst))
    }
}

fn user_mut<'a>(
    state: &'a mut MockIdentityState,
    operation: ProviderOperation,
    user_name: &str,
) -> Result<&'a mut MockUser, ProviderError> {
    state
        .users
        .get_mut(user_name)
        .ok_or_else(|| ProviderError::not_found(operation, format!("user {user_name}")))
}

#[async_trait]
impl IdentityClient for MockIdentityClient {
    async fn create_identity(&self, user_name: &str) -> Result<(), ProviderError> {
        let op = ProviderOperation::CreateIdentity;
        let mut state = self.enter(
            op,
            IdentityCall::CreateIdentity {
                user_name: user_name.into(),
            },
        )?;
        if state.users.contains_key(user_name) {
            return Err(ProviderError::new(
                op,
                ProviderErrorKind::Other,
                format!("user {user_name} already exists"),
            ));
        }
        state.users.insert(user_name.to_string(), MockUser::default());
        Ok(())
    }

    async fn attach_managed_policy(
        &self,
        user_name: &str,
        policy_arn: &str,
    ) -> Result<(), ProviderError> {
        let op = ProviderOperation::AttachManagedPolicy;
        let mut state = self.enter(
            op,
            IdentityCall::AttachManagedPolicy {
                user_name: user_name.into(),
                policy_arn: policy_arn.into(),
            },
        )?;
        let user = user_mut(&mut state, op, user_name)?;
        if !user.managed_policies.iter().any(|p| p == policy_arn) {
            user.managed_policies.push(policy_arn.to_string());
        }
        Ok(())
    }

    async fn put_inline_policy(
        &self,
        user_name: &str,
        policy_name: &str,
        policy_document: &str,
    ) -> Result<(), ProviderError> {
        let op = ProviderOperation::PutInlinePolicy;
        let mut state = self.enter(
            op,
            IdentityCall::PutInlinePolicy {
                user_name: user_name.into(),
                policy_name: policy_name.into(),
                policy_document: policy_document.into(),
            },
        )?;
        user_mut(&mut state, op, user_name)?
            .inline_policies
            .insert(policy_name.to_string(), policy_document.to_string());
        Ok(())
    }

    async fn create_access_key(&self, user_name: &str) -> Result<AccessKey, ProviderError> {
        let op = ProviderOperation::CreateAccessKey;
        let mut state = self.enter(
            op,
            IdentityCall::CreateAccessKey {
                user_name: user_name.into(),
            },
        )?;
        let access_key_id = self.next_key_id("AKIA");
        user_mut(&mut state, op, user_name)?
            .access_keys
            .push(access_key_id.clone());
        Ok(AccessKey {
            secret_access_key: format!("secret-{access_key_id}"),
            access_key_id,
        })
    }

    async fn issue_federation_token(
        &self,
        name: &str,
        policy_document: &str,
        duration_seconds: Option<u64>,
    ) -> Result<FederatedCredentials, ProviderError> {
        let _state = self.enter(
            ProviderOperation::IssueFederationToken,
            IdentityCall::IssueFederationToken {
                name: name.into(),
                policy_document: policy_document.into(),
                duration_seconds,
            },
        )?;
        let access_key_id = self.next_key_id("ASIA");
        Ok(FederatedCredentials {
            secret_access_key: format!("secret-{access_key_id}"),
            session_token: format!("session-{access_key_id}"),
            access_key_id,
        })
    }

    async fn list_access_keys(&self, user_name: &str) -> Result<Vec<String>, ProviderError> {
        let op = ProviderOperation::ListAccessKeys;
        let mut state = self.enter(
            op,
            IdentityCall::ListAccessKeys {
                user_name: user_name.into(),
            },
        )?;
        Ok(user_mut(&mut state, op, user_name)?.access_keys.clone())
    }

    async fn delete_access_key(
        &self,
        user_name: &str,
        access_key_id: &str,
    ) -> Result<(), ProviderError> {
        let op = ProviderOperation::DeleteAccessKey;
        let mut state = self.enter(
            op,
            IdentityCall::DeleteAccessKey {
                user_name: user_name.into(),
                access_key_id: access_key_id.into(),
            },
        )?;
        let user = user_mut(&mut state, op, user_name)?;
        let before = user.access_keys.len();
        user.access_keys.retain(|k| k != access_key_id);
        if user.access_keys.len() == before {
            return Err(ProviderError::not_found(op, format!("access key {access_key_id}")));
        }
        Ok(())
    }

    async fn list_attached_policies(&self, user_name: &str) -> Result<Vec<String>, ProviderError> {
        let op = ProviderOperation::ListAttachedPolicies;
        let mut state = self.enter(
            op,
            IdentityCall::ListAttachedPolicies {
                user_name: user_name.into(),
            },
        )?;
        Ok(user_mut(&mut state, op, user_name)?.managed_policies.clone())
    }

    async fn detach_managed_policy(
        &self,
        user_name: &str,
        policy_arn: &str,
    ) -> Result<(), ProviderError> {
        let op = ProviderOperation::DetachManagedPolicy;
        let mut state = self.enter(
            op,
            IdentityCall::DetachManagedPolicy {
                user_name: user_name.into(),
                policy_arn: policy_arn.into(),
            },
        )?;
        let user = user_mut(&mut state, op, user_name)?;
        let before = user.managed_policies.len();
        user.managed_policies.retain(|p| p != policy_arn);
        if user.managed_policies.len() == before {
            return Err(ProviderError::not_found(op, format!("policy {policy_arn}")));
        }
        Ok(())
    }

    async fn list_inline_policies(&self, user_name: &str) -> Result<Vec<String>, ProviderError> {
        let op = ProviderOperation::ListInlinePolicies;
        let mut state = self.enter(
            op,
            IdentityCall::ListInlinePolicies {
                user_name: user_name.into(),
            },
        )?;
        Ok(user_mut(&mut state, op, user_name)?
            .inline_policies
            .keys()
            .cloned()
            .collect())
    }

    async fn delete_inline_policy(
        &self,
        user_name: &str,
        policy_name: &str,
    ) -> Result<(), ProviderError> {
        let op = ProviderOperation::DeleteInlinePolicy;
        let mut state = self.enter(
            op,
            IdentityCall::DeleteInlinePolicy {
                user_name: user_name.into(),
                policy_name: policy_name.into(),
            },
        )?;
        user_mut(&mut state, op, user_name)?
            .inline_policies
            .remove(policy_name)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found(op, format!("policy {policy_name}")))
    }

    async fn delete_identity(&self, user_name: &str) -> Result<(), ProviderError> {
        let op = ProviderOperation::DeleteIdentity;
        let mut state = self.enter(
            op,
            IdentityCall::DeleteIdentity {
                user_name: user_name.into(),
            },
        )?;
        state
            .users
            .remove(user_name)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found(op, format!("user {user_name}")))
    }
}

/// A successful operation seen by [`RecordingJournal`].
#[derive(Clone, Debug, PartialEq)]
pub enum JournalOp {
    Append {
        id: JournalId,
        kind: String,
        payload: serde_json::Value,
    },
    Remove {
        id: JournalId,
    },
}

/// In-memory journal that records successful appends and removes, and can
/// be told to fail either.
#[derive(Default)]
pub struct RecordingJournal {
    entries: Mutex<Vec<JournalEntry>>,
    ops: Mutex<Vec<JournalOp>>,
    fail_appends: AtomicBool,
    fail_removes: AtomicBool,
}

impl RecordingJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_removes(&self, fail: bool) {
        self.fail_removes.store(fail, Ordering::SeqCst);
    }

    /// Insert an entry as if a previous process had written it.
    pub fn seed(&self, entry: JournalEntry) {
        lock(&self.entries).push(entry);
    }

    pub fn ops(&self) -> Vec<JournalOp> {
        lock(&self.ops).clone()
    }

    pub async fn pending_count(&self) -> usize {
        lock(&self.entries).len()
    }
}

#[async_trait]
impl JournalStore for RecordingJournal {
    async fn append(&self, entry: JournalEntry) -> Result<JournalId, JournalError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(JournalError::Closed);
        }
        let id = entry.id.clone();
        lock(&self.ops).push(JournalOp::Append {
            id: id.clone(),
            kind: entry.kind.clone(),
            payload: entry.payload.clone(),
        });
        lock(&self.entries).push(entry);
        Ok(id)
    }

    async fn remove(&self, id: &JournalId) -> Result<(), JournalError> {
        if self.fail_removes.load(Ordering::SeqCst) {
            return Err(JournalError::Closed);
        }
        lock(&self.entries).retain(|e| &e.id != id);
        lock(&self.ops).push(JournalOp::Remove { id: id.clone() });
        Ok(())
    }

    async fn get(&self, id: &JournalId) -> Result<Option<JournalEntry>, JournalError> {
        Ok(lock(&self.entries).iter().find(|e| &e.id == id).cloned())
    }

    async fn pending(&self) -> Result<Vec<JournalEntry>, JournalError> {
        Ok(lock(&self.entries).clone())
    }
}

/// Rollback handler that records the user names it was asked to remove.
#[derive(Default)]
pub struct MockRollback {
    usernames: Mutex<Vec<String>>,
    fail_all: bool,
    fail_users: Mutex<HashSet<String>>,
}

impl MockRollback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler whose every rollback fails.
    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// Make rollbacks of `username` fail.
    pub fn fail_user(&self, username: &str) {
        lock(&self.fail_users).insert(username.to_string());
    }

    /// Every user name received, including failed attempts.
    pub fn usernames(&self) -> Vec<String> {
        lock(&self.usernames).clone()
    }
}

#[async_trait]
impl RollbackHandler for MockRollback {
    async fn rollback_user(&self, rollback: &UserRollback) -> Result<(), RollbackError> {
        lock(&self.usernames).push(rollback.username.clone());
        if self.fail_all || lock(&self.fail_users).contains(&rollback.username) {
            return Err(RollbackError::ClientUnavailable("injected failure".into()));
        }
        Ok(())
    }
}

/// Clock that only moves when told to.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Clock at a Unix timestamp in seconds.
    pub fn at_timestamp(secs: i64) -> Self {
        Self::new(Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *lock(&self.now) = to;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// Random source that always yields the same suffix.
#[derive(Clone, Copy, Debug)]
pub struct FixedRandom(pub u32);

impl RandomSource for FixedRandom {
    fn suffix(&self) -> u32 {
        self.0
    }
}

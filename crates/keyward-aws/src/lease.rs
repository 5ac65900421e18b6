//! Leases on issued access keys.
//!
//! The lease subsystem that schedules renewals and revocations is external.
//! It stores [`CredentialLease`] as opaque data and hands it back here; the
//! internal data is decoded into [`AccessKeyLeaseData`] at that boundary, so
//! a lease without a user name is rejected before any remote call.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::{ConfigStore, LeaseConfig};
use crate::error::CredentialError;
use crate::rollback::{RollbackHandler, UserRollback};

/// Secret type of every lease this backend issues.
pub const SECRET_ACCESS_KEY_TYPE: &str = "access_keys";
/// Lease duration attached to a freshly issued secret.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60 * 60);
/// Grace period attached to a freshly issued secret.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Data the backend needs back at revoke time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessKeyLeaseData {
    pub username: String,
    #[serde(default)]
    pub policy: String,
}

/// Lease on an issued credential, as persisted by the lease subsystem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CredentialLease {
    pub secret_type: String,
    pub internal_data: serde_json::Value,
    pub ttl: Duration,
    pub grace_period: Duration,
    pub issued_at: DateTime<Utc>,
}

impl CredentialLease {
    pub fn new(data: &AccessKeyLeaseData, ttl: Duration, issued_at: DateTime<Utc>) -> Self {
        Self {
            secret_type: SECRET_ACCESS_KEY_TYPE.to_string(),
            internal_data: serde_json::json!({
                "username": data.username,
                "policy": data.policy,
            }),
            ttl,
            grace_period: DEFAULT_GRACE_PERIOD,
            issued_at,
        }
    }

    /// Decode the internal data. Fails for foreign or corrupted leases.
    pub fn access_key_data(&self) -> Result<AccessKeyLeaseData, CredentialError> {
        if self.secret_type != SECRET_ACCESS_KEY_TYPE {
            return Err(CredentialError::LeaseIntegrity(format!(
                "unexpected secret type {:?}",
                self.secret_type
            )));
        }
        let data: AccessKeyLeaseData = serde_json::from_value(self.internal_data.clone())
            .map_err(|_| {
                CredentialError::LeaseIntegrity("secret is missing username internal data".into())
            })?;
        if data.username.is_empty() {
            return Err(CredentialError::LeaseIntegrity(
                "secret has an empty username".into(),
            ));
        }
        Ok(data)
    }
}

/// A renewal request from the lease subsystem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenewRequest {
    /// Requested extension. Zero asks for the configured lease.
    pub increment: Duration,
}

/// Outcome of a renewal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseRenewal {
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
}

fn add_saturating(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Extend a lease issued at `issued_at`.
///
/// The increment is clamped to `config.lease`. When `config.lease_max` is
/// non-zero the lease never runs past `issued_at + lease_max`, and renewing
/// after that point fails.
pub fn extend_lease(
    config: &LeaseConfig,
    issued_at: DateTime<Utc>,
    request: &RenewRequest,
    now: DateTime<Utc>,
) -> Result<LeaseRenewal, CredentialError> {
    let mut increment = request.increment;
    if !config.lease.is_zero() && (increment.is_zero() || increment > config.lease) {
        increment = config.lease;
    }

    let max_session =
        (!config.lease_max.is_zero()).then(|| add_saturating(issued_at, config.lease_max));
    if let Some(limit) = max_session {
        if limit < now {
            return Err(CredentialError::RenewalWindowExceeded {
                max_secs: config.lease_max.as_secs(),
            });
        }
    }

    let mut expires_at = add_saturating(now, increment);
    if let Some(limit) = max_session {
        expires_at = expires_at.min(limit);
    }

    let ttl = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
    Ok(LeaseRenewal { ttl, expires_at })
}

/// Renew and revoke for access-key leases.
pub struct LeaseManager {
    config: Arc<dyn ConfigStore>,
    rollback: Arc<dyn RollbackHandler>,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        rollback: Arc<dyn RollbackHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            rollback,
            clock,
        }
    }

    /// Extend a lease. Purely local: the remote user is not consulted.
    pub async fn renew_lease(
        &self,
        lease: &CredentialLease,
        request: &RenewRequest,
    ) -> Result<LeaseRenewal, CredentialError> {
        let config = self.config.lease_config().await?.unwrap_or_default();
        let renewal = extend_lease(&config, lease.issued_at, request, self.clock.now())?;
        debug!(ttl_secs = renewal.ttl.as_secs(), "Lease renewed");
        Ok(renewal)
    }

    /// Revoke a lease by rolling back the user behind it.
    pub async fn revoke_lease(&self, lease: &CredentialLease) -> Result<(), CredentialError> {
        let data = lease.access_key_data()?;
        self.rollback
            .rollback_user(&UserRollback::new(data.username.clone()))
            .await?;
        info!(username = %data.username, "Access key lease revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::mocks::{FixedClock, MockRollback};
    use chrono::TimeZone;

    fn issued() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn lease_for(username: &str) -> CredentialLease {
        CredentialLease::new(
            &AccessKeyLeaseData {
                username: username.into(),
                policy: "arn:aws:iam::aws:policy/ReadOnly".into(),
            },
            DEFAULT_LEASE_DURATION,
            issued(),
        )
    }

    fn manager(
        config: MemoryConfigStore,
        rollback: Arc<MockRollback>,
        clock: Arc<FixedClock>,
    ) -> LeaseManager {
        LeaseManager::new(Arc::new(config), rollback, clock)
    }

    #[test]
    fn zero_increment_uses_configured_lease() {
        let config = LeaseConfig::default();
        let now = issued() + chrono::Duration::minutes(5);
        let renewal = extend_lease(&config, issued(), &RenewRequest::default(), now).unwrap();
        assert_eq!(renewal.ttl, Duration::from_secs(3600));
    }

    #[test]
    fn increment_is_clamped_to_lease() {
        let config = LeaseConfig::new(Duration::from_secs(1800), Duration::ZERO);
        let request = RenewRequest {
            increment: Duration::from_secs(7200),
        };
        let renewal = extend_lease(&config, issued(), &request, issued()).unwrap();
        assert_eq!(renewal.ttl, Duration::from_secs(1800));

        let small = RenewRequest {
            increment: Duration::from_secs(60),
        };
        let renewal = extend_lease(&config, issued(), &small, issued()).unwrap();
        assert_eq!(renewal.ttl, Duration::from_secs(60));
    }

    #[test]
    fn renewal_never_passes_max_from_issue() {
        let config = LeaseConfig::new(Duration::from_secs(30 * 60), Duration::from_secs(2 * 3600));
        let now = issued() + chrono::Duration::minutes(105);
        let renewal = extend_lease(&config, issued(), &RenewRequest::default(), now).unwrap();
        assert_eq!(renewal.ttl, Duration::from_secs(15 * 60));
        assert_eq!(renewal.expires_at, issued() + chrono::Duration::hours(2));
    }

    #[test]
    fn renewal_after_max_is_rejected() {
        let config = LeaseConfig::new(Duration::from_secs(30 * 60), Duration::from_secs(2 * 3600));
        let now = issued() + chrono::Duration::hours(3);
        let err = extend_lease(&config, issued(), &RenewRequest::default(), now).unwrap_err();
        assert!(matches!(err, CredentialError::RenewalWindowExceeded { max_secs: 7200 }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn renew_without_stored_config_uses_one_hour() {
        let clock = Arc::new(FixedClock::new(issued() + chrono::Duration::minutes(50)));
        let manager = manager(MemoryConfigStore::new(), Arc::new(MockRollback::new()), clock);
        let renewal = manager
            .renew_lease(&lease_for("vault-a-1-2"), &RenewRequest::default())
            .await
            .unwrap();
        assert_eq!(renewal.ttl, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn renew_uses_stored_config() {
        let store = MemoryConfigStore::new();
        store
            .put_lease_config(&LeaseConfig::new(
                Duration::from_secs(30 * 60),
                Duration::from_secs(2 * 3600),
            ))
            .await
            .unwrap();
        let clock = Arc::new(FixedClock::new(issued() + chrono::Duration::minutes(100)));
        let manager = manager(store, Arc::new(MockRollback::new()), clock);

        let renewal = manager
            .renew_lease(&lease_for("vault-a-1-2"), &RenewRequest::default())
            .await
            .unwrap();
        assert_eq!(renewal.ttl, Duration::from_secs(20 * 60));
        assert!(renewal.expires_at <= issued() + chrono::Duration::hours(2));
    }

    #[tokio::test]
    async fn revoke_rolls_back_the_user_once() {
        let rollback = Arc::new(MockRollback::new());
        let manager = manager(
            MemoryConfigStore::new(),
            rollback.clone(),
            Arc::new(FixedClock::new(issued())),
        );

        manager.revoke_lease(&lease_for("vault-foo-123-456")).await.unwrap();
        assert_eq!(rollback.usernames(), vec!["vault-foo-123-456".to_string()]);
    }

    #[tokio::test]
    async fn revoke_without_username_is_an_integrity_error() {
        let rollback = Arc::new(MockRollback::new());
        let manager = manager(
            MemoryConfigStore::new(),
            rollback.clone(),
            Arc::new(FixedClock::new(issued())),
        );

        let mut lease = lease_for("vault-foo-123-456");
        lease.internal_data = serde_json::json!({ "policy": "arn:aws:iam::aws:policy/ReadOnly" });
        let err = manager.revoke_lease(&lease).await.unwrap_err();
        assert!(matches!(err, CredentialError::LeaseIntegrity(_)));
        assert!(!err.is_recoverable());

        lease.internal_data = serde_json::json!({ "username": 42 });
        let err = manager.revoke_lease(&lease).await.unwrap_err();
        assert!(matches!(err, CredentialError::LeaseIntegrity(_)));

        assert!(rollback.usernames().is_empty());
    }

    #[tokio::test]
    async fn revoke_of_foreign_lease_is_rejected() {
        let rollback = Arc::new(MockRollback::new());
        let manager = manager(
            MemoryConfigStore::new(),
            rollback.clone(),
            Arc::new(FixedClock::new(issued())),
        );

        let mut lease = lease_for("vault-foo-123-456");
        lease.secret_type = "database_creds".into();
        assert!(matches!(
            manager.revoke_lease(&lease).await,
            Err(CredentialError::LeaseIntegrity(_))
        ));
        assert!(rollback.usernames().is_empty());
    }

    #[tokio::test]
    async fn revoke_surfaces_rollback_failure() {
        let rollback = Arc::new(MockRollback::failing());
        let manager = manager(
            MemoryConfigStore::new(),
            rollback.clone(),
            Arc::new(FixedClock::new(issued())),
        );

        let err = manager
            .revoke_lease(&lease_for("vault-foo-123-456"))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::Rollback(_)));
        assert_eq!(rollback.usernames().len(), 1);
    }
}

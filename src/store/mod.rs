//! The relational datastore, modeled as an injected interface.
//!
//! The core never issues SQL and never assumes a specific engine: it
//! depends only on this trait. Every method that represents a
//! conditional `UPDATE ... WHERE status = $expected` returns whether the
//! row actually matched, so callers can implement compare-and-swap
//! transitions without the trait leaking lock or transaction details.
//! [`memory::MemoryStore`] is the adapter used by this binary and by
//! tests; a production deployment is expected to supply a second
//! adapter (e.g. backed by `sqlx`) implementing the same trait.

pub mod memory;
pub mod model;

use anyhow::Result;
use async_trait::async_trait;
use time::OffsetDateTime;

use model::{Account, AccountStatus, Authorization, AuthorizationStatus, Ca, Certificate, Challenge, ChallengeStatus, Order, OrderStatus, ProblemDetail};

/// A challenge joined with its parent authorization and order, the unit
/// the challenge-verification state machine reasons about atomically.
#[derive(Debug, Clone)]
pub struct ChallengeContext {
    pub challenge: Challenge,
    pub authorization: Authorization,
    pub order: Order,
}

/// A certificate joined with the account and order it belongs to, used
/// by the expiry notifier's scan.
#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub certificate: Certificate,
    pub account: Account,
    pub order: Order,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- nonces ---------------------------------------------------------
    async fn mint_nonce(&self) -> Result<String>;
    /// Deletes the nonce if present; returns whether it was found.
    async fn consume_nonce(&self, id: &str) -> Result<bool>;
    async fn purge_expired_nonces(&self) -> Result<u64>;

    // -- accounts ---------------------------------------------------------
    async fn find_account_by_thumbprint(&self, thumbprint: &str) -> Result<Option<Account>>;
    async fn get_account(&self, id: &str) -> Result<Option<Account>>;
    /// Inserts the account unless one with the same thumbprint already
    /// exists; returns the (possibly pre-existing) account and whether
    /// it was freshly created.
    async fn find_or_create_account(&self, account: Account) -> Result<(Account, bool)>;
    async fn update_account_contact(&self, id: &str, contact: Option<String>) -> Result<()>;
    async fn set_account_status(&self, id: &str, status: AccountStatus) -> Result<()>;

    // -- orders -----------------------------------------------------------
    async fn insert_order(
        &self,
        order: Order,
        authorizations: Vec<Authorization>,
        challenges: Vec<Challenge>,
    ) -> Result<()>;
    async fn get_order(&self, id: &str) -> Result<Option<Order>>;
    async fn list_orders_for_account(&self, account_id: &str) -> Result<Vec<Order>>;
    async fn set_order_status_if(
        &self,
        id: &str,
        expected: OrderStatus,
        new: OrderStatus,
        error: Option<ProblemDetail>,
    ) -> Result<bool>;
    async fn set_order_status(
        &self,
        id: &str,
        new: OrderStatus,
        error: Option<ProblemDetail>,
    ) -> Result<()>;
    async fn attach_certificate_to_order(&self, order_id: &str, serial: &str) -> Result<()>;

    // -- authorizations -----------------------------------------------------------
    async fn get_authorization(&self, id: &str) -> Result<Option<Authorization>>;
    async fn list_authorizations_for_order(&self, order_id: &str) -> Result<Vec<Authorization>>;
    async fn set_authorization_status_if(
        &self,
        id: &str,
        expected: &[AuthorizationStatus],
        new: AuthorizationStatus,
    ) -> Result<bool>;
    async fn set_authorization_status(&self, id: &str, new: AuthorizationStatus) -> Result<()>;

    // -- challenges -----------------------------------------------------------
    async fn get_challenge_context(&self, id: &str) -> Result<Option<ChallengeContext>>;
    async fn set_challenge_status_if(
        &self,
        id: &str,
        expected: ChallengeStatus,
        new: ChallengeStatus,
    ) -> Result<bool>;
    async fn set_challenge_result(
        &self,
        id: &str,
        status: ChallengeStatus,
        validated_at: Option<OffsetDateTime>,
        error: Option<ProblemDetail>,
    ) -> Result<()>;

    // -- certificates -----------------------------------------------------------
    async fn insert_certificate(&self, cert: Certificate) -> Result<()>;
    async fn get_certificate(&self, serial: &str) -> Result<Option<Certificate>>;
    async fn set_certificate_revoked(&self, serial: &str, at: OffsetDateTime) -> Result<()>;
    async fn list_notifiable_certificates(&self, now: OffsetDateTime) -> Result<Vec<NotificationRow>>;
    async fn mark_certificate_notified(
        &self,
        serial: &str,
        will_expire: bool,
        has_expired: bool,
    ) -> Result<()>;
    async fn list_revoked_serials(&self, ca_serial: &str) -> Result<Vec<(String, OffsetDateTime)>>;

    // -- certificate authority -----------------------------------------------------------
    async fn get_active_ca(&self) -> Result<Option<Ca>>;
    async fn get_ca(&self, serial: &str) -> Result<Option<Ca>>;
    async fn list_cas(&self) -> Result<Vec<Ca>>;
    async fn deactivate_all_cas(&self) -> Result<()>;
    async fn upsert_ca(&self, ca: Ca) -> Result<()>;
    async fn update_ca_crl(&self, serial: &str, crl_pem: String) -> Result<()>;
}

//! In-memory [`Store`] adapter: the default backend for tests and for
//! running this server without an external database. It upholds the
//! same atomicity contract a transactional SQL backend would (one
//! writer at a time, compare-and-swap on status fields) via a single
//! `RwLock` guarding every table, the same "one lock around the shared
//! map" shape the teacher uses for its HTTP-01 `ChallengeStore`.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::rand::{SecureRandom, SystemRandom};
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use super::model::{
    Account, AccountStatus, Authorization, AuthorizationStatus, Ca, Certificate, Challenge,
    ChallengeStatus, Order, OrderStatus, ProblemDetail,
};
use super::{ChallengeContext, NotificationRow, Store};

const NONCE_TTL: Duration = Duration::minutes(30);

#[derive(Default)]
struct Tables {
    nonces: HashMap<String, OffsetDateTime>,
    accounts_by_id: HashMap<String, Account>,
    accounts_by_thumbprint: HashMap<String, String>,
    orders: HashMap<String, Order>,
    authorizations: HashMap<String, Authorization>,
    challenges: HashMap<String, Challenge>,
    certificates: HashMap<String, Certificate>,
    cas: HashMap<String, Ca>,
}

pub struct MemoryStore {
    tables: RwLock<Tables>,
    rng: SystemRandom,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            rng: SystemRandom::new(),
        }
    }

    fn random_token(&self, bytes: usize) -> String {
        let mut buf = vec![0u8; bytes];
        // SystemRandom::fill never fails on supported targets; a failure
        // here would mean the OS RNG is unavailable, which this in-memory
        // adapter has no graceful fallback for.
        self.rng.fill(&mut buf).expect("system RNG unavailable");
        URL_SAFE_NO_PAD.encode(buf)
    }

    /// Account ids are opaque 16-byte URL-safe tokens, the same shape as
    /// order/authorization/challenge ids.
    fn next_account_id(&self) -> String {
        self.random_token(16)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn mint_nonce(&self) -> Result<String> {
        let id = self.random_token(24);
        let mut tables = self.tables.write().await;
        tables.nonces.insert(id.clone(), OffsetDateTime::now_utc() + NONCE_TTL);
        Ok(id)
    }

    async fn consume_nonce(&self, id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.nonces.remove(id) {
            Some(expires_at) => Ok(expires_at > OffsetDateTime::now_utc()),
            None => Ok(false),
        }
    }

    async fn purge_expired_nonces(&self) -> Result<u64> {
        let now = OffsetDateTime::now_utc();
        let mut tables = self.tables.write().await;
        let before = tables.nonces.len();
        tables.nonces.retain(|_, expires_at| *expires_at >= now);
        Ok(u64::try_from(before - tables.nonces.len()).unwrap_or(0))
    }

    async fn find_account_by_thumbprint(&self, thumbprint: &str) -> Result<Option<Account>> {
        let tables = self.tables.read().await;
        Ok(tables
            .accounts_by_thumbprint
            .get(thumbprint)
            .and_then(|id| tables.accounts_by_id.get(id))
            .cloned())
    }

    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        let tables = self.tables.read().await;
        Ok(tables.accounts_by_id.get(id).cloned())
    }

    async fn find_or_create_account(&self, mut account: Account) -> Result<(Account, bool)> {
        let mut tables = self.tables.write().await;
        if let Some(existing_id) = tables.accounts_by_thumbprint.get(&account.jwk_thumbprint) {
            let existing = tables
                .accounts_by_id
                .get(existing_id)
                .cloned()
                .expect("thumbprint index out of sync with accounts table");
            return Ok((existing, false));
        }
        if account.id.is_empty() {
            account.id = self.next_account_id();
        }
        tables
            .accounts_by_thumbprint
            .insert(account.jwk_thumbprint.clone(), account.id.clone());
        tables.accounts_by_id.insert(account.id.clone(), account.clone());
        Ok((account, true))
    }

    async fn update_account_contact(&self, id: &str, contact: Option<String>) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(account) = tables.accounts_by_id.get_mut(id) {
            account.contact = contact;
        }
        Ok(())
    }

    async fn set_account_status(&self, id: &str, status: AccountStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(account) = tables.accounts_by_id.get_mut(id) {
            account.status = status;
        }
        Ok(())
    }

    async fn insert_order(
        &self,
        order: Order,
        authorizations: Vec<Authorization>,
        challenges: Vec<Challenge>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.orders.insert(order.id.clone(), order);
        for authz in authorizations {
            tables.authorizations.insert(authz.id.clone(), authz);
        }
        for challenge in challenges {
            tables.challenges.insert(challenge.id.clone(), challenge);
        }
        Ok(())
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables.orders.get(id).cloned())
    }

    async fn list_orders_for_account(&self, account_id: &str) -> Result<Vec<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .values()
            .filter(|order| order.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn set_order_status_if(
        &self,
        id: &str,
        expected: OrderStatus,
        new: OrderStatus,
        error: Option<ProblemDetail>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(order) = tables.orders.get_mut(id) else {
            return Ok(false);
        };
        if order.status != expected {
            return Ok(false);
        }
        order.status = new;
        if error.is_some() {
            order.error = error;
        }
        Ok(true)
    }

    async fn set_order_status(
        &self,
        id: &str,
        new: OrderStatus,
        error: Option<ProblemDetail>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(order) = tables.orders.get_mut(id) {
            order.status = new;
            if error.is_some() {
                order.error = error;
            }
        }
        Ok(())
    }

    async fn attach_certificate_to_order(&self, order_id: &str, serial: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(order) = tables.orders.get_mut(order_id) {
            order.certificate_serial = Some(serial.to_string());
        }
        Ok(())
    }

    async fn get_authorization(&self, id: &str) -> Result<Option<Authorization>> {
        let tables = self.tables.read().await;
        Ok(tables.authorizations.get(id).cloned())
    }

    async fn list_authorizations_for_order(&self, order_id: &str) -> Result<Vec<Authorization>> {
        let tables = self.tables.read().await;
        Ok(tables
            .authorizations
            .values()
            .filter(|authz| authz.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn set_authorization_status_if(
        &self,
        id: &str,
        expected: &[AuthorizationStatus],
        new: AuthorizationStatus,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(authz) = tables.authorizations.get_mut(id) else {
            return Ok(false);
        };
        if !expected.contains(&authz.status) {
            return Ok(false);
        }
        authz.status = new;
        Ok(true)
    }

    async fn set_authorization_status(&self, id: &str, new: AuthorizationStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(authz) = tables.authorizations.get_mut(id) {
            authz.status = new;
        }
        Ok(())
    }

    async fn get_challenge_context(&self, id: &str) -> Result<Option<ChallengeContext>> {
        let tables = self.tables.read().await;
        let Some(challenge) = tables.challenges.get(id) else {
            return Ok(None);
        };
        let Some(authorization) = tables.authorizations.get(&challenge.authz_id) else {
            return Ok(None);
        };
        let Some(order) = tables.orders.get(&authorization.order_id) else {
            return Ok(None);
        };
        Ok(Some(ChallengeContext {
            challenge: challenge.clone(),
            authorization: authorization.clone(),
            order: order.clone(),
        }))
    }

    async fn set_challenge_status_if(
        &self,
        id: &str,
        expected: ChallengeStatus,
        new: ChallengeStatus,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(challenge) = tables.challenges.get_mut(id) else {
            return Ok(false);
        };
        if challenge.status != expected {
            return Ok(false);
        }
        challenge.status = new;
        Ok(true)
    }

    async fn set_challenge_result(
        &self,
        id: &str,
        status: ChallengeStatus,
        validated_at: Option<OffsetDateTime>,
        error: Option<ProblemDetail>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(challenge) = tables.challenges.get_mut(id) {
            challenge.status = status;
            if validated_at.is_some() {
                challenge.validated_at = validated_at;
            }
            if error.is_some() {
                challenge.error = error;
            }
        }
        Ok(())
    }

    async fn insert_certificate(&self, cert: Certificate) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.certificates.insert(cert.serial_number.clone(), cert);
        Ok(())
    }

    async fn get_certificate(&self, serial: &str) -> Result<Option<Certificate>> {
        let tables = self.tables.read().await;
        Ok(tables.certificates.get(serial).cloned())
    }

    async fn set_certificate_revoked(&self, serial: &str, at: OffsetDateTime) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(cert) = tables.certificates.get_mut(serial) {
            cert.revoked_at = Some(at);
        }
        Ok(())
    }

    async fn list_notifiable_certificates(&self, now: OffsetDateTime) -> Result<Vec<NotificationRow>> {
        let tables = self.tables.read().await;
        let mut rows = Vec::new();
        for cert in tables.certificates.values() {
            if cert.revoked_at.is_some() {
                continue;
            }
            let Some(order) = tables.orders.get(&cert.order_id) else {
                continue;
            };
            if order.status != OrderStatus::Valid {
                continue;
            }
            let Some(account) = tables.accounts_by_id.get(&order.account_id) else {
                continue;
            };
            if account.status != AccountStatus::Valid || account.contact.is_none() {
                continue;
            }
            let expiring_soon = cert.not_valid_after > now && !cert.user_informed_cert_will_expire;
            let already_expired = cert.not_valid_after <= now && !cert.user_informed_cert_has_expired;
            if expiring_soon || already_expired {
                rows.push(NotificationRow {
                    certificate: cert.clone(),
                    account: account.clone(),
                    order: order.clone(),
                });
            }
        }
        Ok(rows)
    }

    async fn mark_certificate_notified(
        &self,
        serial: &str,
        will_expire: bool,
        has_expired: bool,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(cert) = tables.certificates.get_mut(serial) {
            cert.user_informed_cert_will_expire |= will_expire;
            cert.user_informed_cert_has_expired |= has_expired;
        }
        Ok(())
    }

    async fn list_revoked_serials(&self, ca_serial: &str) -> Result<Vec<(String, OffsetDateTime)>> {
        let tables = self.tables.read().await;
        Ok(tables
            .certificates
            .values()
            .filter(|cert| cert.ca_serial == ca_serial)
            .filter_map(|cert| cert.revoked_at.map(|at| (cert.serial_number.clone(), at)))
            .collect())
    }

    async fn get_active_ca(&self) -> Result<Option<Ca>> {
        let tables = self.tables.read().await;
        Ok(tables.cas.values().find(|ca| ca.active).cloned())
    }

    async fn get_ca(&self, serial: &str) -> Result<Option<Ca>> {
        let tables = self.tables.read().await;
        Ok(tables.cas.get(serial).cloned())
    }

    async fn list_cas(&self) -> Result<Vec<Ca>> {
        let tables = self.tables.read().await;
        Ok(tables.cas.values().cloned().collect())
    }

    async fn deactivate_all_cas(&self) -> Result<()> {
        let mut tables = self.tables.write().await;
        for ca in tables.cas.values_mut() {
            ca.active = false;
        }
        Ok(())
    }

    async fn upsert_ca(&self, ca: Ca) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.cas.insert(ca.serial_number.clone(), ca);
        Ok(())
    }

    async fn update_ca_crl(&self, serial: &str, crl_pem: String) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(ca) = tables.cas.get_mut(serial) {
            ca.crl_pem = crl_pem;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_account() -> Account {
        Account {
            id: String::new(),
            jwk: crate::jwk::Jwk::Rsa {
                n: "n".into(),
                e: "AQAB".into(),
            },
            jwk_thumbprint: "thumb-1".into(),
            contact: Some("mailto:a@example.com".into()),
            status: AccountStatus::Valid,
        }
    }

    #[tokio::test]
    async fn nonce_is_single_use() {
        let store = MemoryStore::new();
        let nonce = store.mint_nonce().await.unwrap();
        assert!(store.consume_nonce(&nonce).await.unwrap());
        assert!(!store.consume_nonce(&nonce).await.unwrap());
    }

    #[tokio::test]
    async fn find_or_create_account_is_idempotent_by_thumbprint() {
        let store = MemoryStore::new();
        let (first, created_first) = store.find_or_create_account(sample_account()).await.unwrap();
        assert!(created_first);
        let (second, created_second) = store.find_or_create_account(sample_account()).await.unwrap();
        assert!(!created_second);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn order_status_cas_rejects_stale_expected_state() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();
        let order = Order {
            id: "order-1".into(),
            account_id: "acct-1".into(),
            status: OrderStatus::Pending,
            expires_at: now + Duration::days(7),
            error: None,
            authorization_ids: vec![],
            certificate_serial: None,
        };
        store.insert_order(order, vec![], vec![]).await.unwrap();
        let advanced = store
            .set_order_status_if("order-1", OrderStatus::Ready, OrderStatus::Processing, None)
            .await
            .unwrap();
        assert!(!advanced);
        let advanced = store
            .set_order_status_if("order-1", OrderStatus::Pending, OrderStatus::Ready, None)
            .await
            .unwrap();
        assert!(advanced);
    }
}

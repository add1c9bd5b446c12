//! Persisted entity shapes. These are the Rust side of the schema
//! described under "Store contract" in the spec: every field here is a
//! column a real SQL-backed adapter would need, and every enum a status
//! check constraint would enforce.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::jwk::Jwk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub jwk: Jwk,
    pub jwk_thumbprint: String,
    pub contact: Option<String>,
    pub status: AccountStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// The `{type, detail}` tuple persisted in an order's or challenge's
/// `error` column and echoed verbatim in ACME responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetail {
    pub r#type: String,
    pub detail: String,
}

impl ProblemDetail {
    #[must_use]
    pub fn new(kind: &str, detail: impl Into<String>) -> Self {
        Self {
            r#type: format!("urn:ietf:params:acme:error:{kind}"),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub status: OrderStatus,
    pub expires_at: OffsetDateTime,
    pub error: Option<ProblemDetail>,
    pub authorization_ids: Vec<String>,
    pub certificate_serial: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
}

#[derive(Debug, Clone)]
pub struct Authorization {
    pub id: String,
    pub order_id: String,
    pub domain: String,
    pub status: AuthorizationStatus,
    pub expires_at: OffsetDateTime,
    pub challenge_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: String,
    pub authz_id: String,
    pub token: String,
    pub status: ChallengeStatus,
    pub validated_at: Option<OffsetDateTime>,
    pub error: Option<ProblemDetail>,
}

#[derive(Debug, Clone)]
pub struct Certificate {
    pub serial_number: String,
    pub order_id: String,
    pub ca_serial: String,
    pub csr_pem: String,
    pub chain_pem: String,
    /// DER `SubjectPublicKeyInfo` of the leaf, used to authorize a
    /// cert-key-signed (rather than account-signed) revocation.
    pub public_key_der: Vec<u8>,
    pub not_valid_before: OffsetDateTime,
    pub not_valid_after: OffsetDateTime,
    pub revoked_at: Option<OffsetDateTime>,
    pub user_informed_cert_will_expire: bool,
    pub user_informed_cert_has_expired: bool,
}

#[derive(Debug, Clone)]
pub struct Ca {
    pub serial_number: String,
    pub cert_pem: String,
    pub key_pem_enc: Vec<u8>,
    pub active: bool,
    pub crl_pem: String,
}

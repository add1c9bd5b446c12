//! Wire-shaped request/response DTOs for the ACME HTTP surface. These
//! are deliberately distinct from [`crate::store::model`]: the store
//! holds persisted entities, these hold exactly what RFC 8555 puts on
//! the wire (and nothing else — unknown/extra fields are never echoed
//! back, per the "unknown fields are not reflected" testable property).

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::store::model::{Authorization, AuthorizationStatus, Challenge, ChallengeStatus, Order, OrderStatus, ProblemDetail};

#[derive(Debug, Serialize)]
pub struct DirectoryResponse {
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    #[serde(rename = "newAccount")]
    pub new_account: String,
    #[serde(rename = "newOrder")]
    pub new_order: String,
    #[serde(rename = "revokeCert")]
    pub revoke_cert: String,
    #[serde(rename = "keyChange")]
    pub key_change: String,
    pub meta: DirectoryMeta,
}

#[derive(Debug, Serialize)]
pub struct DirectoryMeta {
    pub website: String,
    #[serde(rename = "termsOfService", skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct NewAccountPayload {
    #[serde(default)]
    pub contact: Vec<String>,
    #[serde(rename = "onlyReturnExisting", default)]
    pub only_return_existing: bool,
    #[serde(rename = "termsOfServiceAgreed", default)]
    pub terms_of_service_agreed: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateAccountPayload {
    pub contact: Option<Vec<String>>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    pub orders: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IdentifierPayload {
    #[serde(rename = "type")]
    pub r#type: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct NewOrderPayload {
    pub identifiers: Vec<IdentifierPayload>,
    #[serde(rename = "notBefore")]
    pub not_before: Option<String>,
    #[serde(rename = "notAfter")]
    pub not_after: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IdentifierResponse {
    #[serde(rename = "type")]
    pub r#type: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub status: String,
    pub expires: String,
    pub identifiers: Vec<IdentifierResponse>,
    pub authorizations: Vec<String>,
    pub finalize: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetail>,
}

impl OrderResponse {
    #[must_use]
    pub fn build(order: &Order, external_url: &str, identifiers: Vec<IdentifierResponse>) -> Self {
        Self {
            status: status_str(order.status),
            expires: rfc3339(order.expires_at),
            identifiers,
            authorizations: order
                .authorization_ids
                .iter()
                .map(|id| format!("{external_url}acme/authorizations/{id}"))
                .collect(),
            finalize: format!("{external_url}acme/orders/{}/finalize", order.id),
            certificate: order
                .certificate_serial
                .as_ref()
                .map(|serial| format!("{external_url}acme/certificates/{serial}")),
            error: order.error.clone(),
        }
    }
}

fn status_str(status: OrderStatus) -> String {
    match status {
        OrderStatus::Pending => "pending",
        OrderStatus::Ready => "ready",
        OrderStatus::Processing => "processing",
        OrderStatus::Valid => "valid",
        OrderStatus::Invalid => "invalid",
    }
    .to_string()
}

#[derive(Debug, Deserialize)]
pub struct FinalizeOrderPayload {
    pub csr: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateAuthzPayload {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthorizationResponse {
    pub status: String,
    pub expires: String,
    pub identifier: IdentifierResponse,
    pub challenges: Vec<ChallengeResponse>,
}

impl AuthorizationResponse {
    #[must_use]
    pub fn build(authz: &Authorization, challenge: &Challenge, external_url: &str) -> Self {
        Self {
            status: authz_status_str(authz.status),
            expires: rfc3339(authz.expires_at),
            identifier: IdentifierResponse {
                r#type: "dns".into(),
                value: authz.domain.clone(),
            },
            challenges: vec![ChallengeResponse::build(challenge, authz, external_url)],
        }
    }
}

fn authz_status_str(status: AuthorizationStatus) -> String {
    match status {
        AuthorizationStatus::Pending => "pending",
        AuthorizationStatus::Valid => "valid",
        AuthorizationStatus::Invalid => "invalid",
        AuthorizationStatus::Deactivated => "deactivated",
        AuthorizationStatus::Expired => "expired",
    }
    .to_string()
}

#[derive(Debug, Serialize)]
pub struct ChallengeResponse {
    #[serde(rename = "type")]
    pub r#type: &'static str,
    pub url: String,
    pub token: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProblemDetail>,
}

impl ChallengeResponse {
    #[must_use]
    pub fn build(challenge: &Challenge, _authz: &Authorization, external_url: &str) -> Self {
        Self {
            r#type: "http-01",
            url: format!("{external_url}acme/challenges/{}", challenge.id),
            token: challenge.token.clone(),
            status: challenge_status_str(challenge.status),
            validated: challenge.validated_at.map(rfc3339),
            error: challenge.error.clone(),
        }
    }
}

fn challenge_status_str(status: ChallengeStatus) -> String {
    match status {
        ChallengeStatus::Pending => "pending",
        ChallengeStatus::Processing => "processing",
        ChallengeStatus::Valid => "valid",
        ChallengeStatus::Invalid => "invalid",
    }
    .to_string()
}

#[derive(Debug, Deserialize, Default)]
pub struct RevokeCertPayload {
    pub certificate: String,
    pub reason: Option<u8>,
}

pub fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

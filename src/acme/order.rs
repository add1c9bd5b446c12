//! Order creation, viewing, and finalization.

use std::collections::BTreeSet;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use poem::web::{Data, Json, Path};
use poem::{Request, Response, handler};
use time::{Duration, OffsetDateTime};

use super::types::{FinalizeOrderPayload, IdentifierResponse, NewOrderPayload, OrderResponse};
use super::{AppState, called_url, error_response, ok_with_nonce, random_token};
use crate::errors::AcmeError;
use crate::jws::{EnvelopeOptions, JwsBody};
use crate::store::model::{Authorization, AuthorizationStatus, Challenge, ChallengeStatus, Order, OrderStatus, ProblemDetail};

const ORDER_TTL: Duration = Duration::days(7);
const AUTHZ_TTL: Duration = Duration::days(7);

#[handler]
pub async fn new_order(Data(state): Data<&Arc<AppState>>, req: &Request, body: Json<JwsBody>) -> Response {
    let called = called_url(state, req);
    let authenticated = match super::authenticate(state, &body.0, &called, &EnvelopeOptions::default()).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match handle_new_order(state, authenticated).await {
        Ok(resp) => resp,
        Err((err, nonce)) => error_response(state, err, &nonce),
    }
}

async fn handle_new_order(
    state: &AppState,
    authenticated: crate::jws::RequestData,
) -> Result<Response, (AcmeError, String)> {
    let nonce = authenticated.new_nonce.clone();
    let account = authenticated
        .account
        .ok_or_else(|| (AcmeError::Unauthorized("newOrder requires kid".into()), nonce.clone()))?;

    let payload: NewOrderPayload = serde_json::from_value(authenticated.payload)
        .map_err(|e| (AcmeError::Malformed(format!("invalid newOrder payload: {e}")), nonce.clone()))?;

    if payload.not_before.is_some() || payload.not_after.is_some() {
        return Err((AcmeError::Malformed("notBefore/notAfter are not supported".into()), nonce));
    }
    if payload.identifiers.is_empty() {
        return Err((AcmeError::Malformed("identifiers must not be empty".into()), nonce));
    }

    let mut domains = Vec::new();
    let mut seen = BTreeSet::new();
    for identifier in &payload.identifiers {
        if identifier.r#type != "dns" {
            return Err((
                AcmeError::UnsupportedIdentifier(format!("unsupported identifier type: {}", identifier.r#type)),
                nonce,
            ));
        }
        if !state.target_domain_regex.is_match(&identifier.value) {
            return Err((
                AcmeError::RejectedIdentifier(format!("{} is not an accepted domain", identifier.value)),
                nonce,
            ));
        }
        if seen.insert(identifier.value.clone()) {
            domains.push(identifier.value.clone());
        }
    }

    let now = OffsetDateTime::now_utc();
    let order_id = random_token(16);
    let mut authorizations = Vec::with_capacity(domains.len());
    let mut challenges = Vec::with_capacity(domains.len());
    let mut authz_ids = Vec::with_capacity(domains.len());
    for domain in &domains {
        let authz_id = random_token(16);
        let challenge_id = random_token(16);
        let token = random_token(32);
        authz_ids.push(authz_id.clone());
        challenges.push(Challenge {
            id: challenge_id.clone(),
            authz_id: authz_id.clone(),
            token,
            status: ChallengeStatus::Pending,
            validated_at: None,
            error: None,
        });
        authorizations.push(Authorization {
            id: authz_id,
            order_id: order_id.clone(),
            domain: domain.clone(),
            status: AuthorizationStatus::Pending,
            expires_at: now + AUTHZ_TTL,
            challenge_id,
        });
    }

    let order = Order {
        id: order_id.clone(),
        account_id: account.id.clone(),
        status: OrderStatus::Pending,
        expires_at: now + ORDER_TTL,
        error: None,
        authorization_ids: authz_ids,
        certificate_serial: None,
    };
    state
        .store
        .insert_order(order.clone(), authorizations, challenges)
        .await
        .map_err(|e| (AcmeError::from(e), nonce.clone()))?;

    let identifiers = domains
        .into_iter()
        .map(|value| IdentifierResponse { r#type: "dns".into(), value })
        .collect();
    let body = OrderResponse::build(&order, &state.settings.external_url, identifiers);
    let resp = Response::builder()
        .status(poem::http::StatusCode::CREATED)
        .content_type("application/json")
        .header("Location", state.url(&format!("acme/orders/{}", order.id)))
        .body(serde_json::to_vec(&body).unwrap_or_default());
    Ok(ok_with_nonce(resp, &nonce, &state.settings.external_url))
}

#[handler]
pub async fn view_order(
    Data(state): Data<&Arc<AppState>>,
    req: &Request,
    Path(id): Path<String>,
    body: Json<JwsBody>,
) -> Response {
    let called = called_url(state, req);
    let authenticated = match super::authenticate(state, &body.0, &called, &EnvelopeOptions::default()).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let nonce = authenticated.new_nonce.clone();
    match load_owned_order(state, &authenticated, &id).await {
        Ok(order) => respond_with_order(state, &order, &nonce).await,
        Err(err) => error_response(state, err, &nonce),
    }
}

#[handler]
pub async fn finalize_order(
    Data(state): Data<&Arc<AppState>>,
    req: &Request,
    Path(id): Path<String>,
    body: Json<JwsBody>,
) -> Response {
    let called = called_url(state, req);
    let authenticated = match super::authenticate(state, &body.0, &called, &EnvelopeOptions::default()).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match handle_finalize(state, &id, authenticated).await {
        Ok(resp) => resp,
        Err((err, nonce)) => error_response(state, err, &nonce),
    }
}

async fn load_owned_order(
    state: &AppState,
    authenticated: &crate::jws::RequestData,
    order_id: &str,
) -> Result<Order, AcmeError> {
    let account = authenticated
        .account
        .as_ref()
        .ok_or_else(|| AcmeError::Unauthorized("this resource requires kid".into()))?;
    let order = state
        .store
        .get_order(order_id)
        .await?
        .ok_or_else(|| AcmeError::NotFound("no such order".into()))?;
    if order.account_id != account.id {
        return Err(AcmeError::Unauthorized("order does not belong to this account".into()));
    }
    Ok(order)
}

async fn handle_finalize(
    state: &AppState,
    order_id: &str,
    authenticated: crate::jws::RequestData,
) -> Result<Response, (AcmeError, String)> {
    let nonce = authenticated.new_nonce.clone();
    let order = load_owned_order(state, &authenticated, order_id)
        .await
        .map_err(|e| (e, nonce.clone()))?;

    let now = OffsetDateTime::now_utc();
    if order.expires_at < now {
        invalidate_expired_order(state, &order).await.map_err(|e| (e, nonce.clone()))?;
        return Err((AcmeError::OrderNotReady("order has expired".into()), nonce));
    }
    if order.status != OrderStatus::Ready {
        return Err((AcmeError::OrderNotReady(format!("order is {:?}, not ready", order.status)), nonce));
    }

    let payload: FinalizeOrderPayload = serde_json::from_value(authenticated.payload)
        .map_err(|e| (AcmeError::Malformed(format!("invalid finalize payload: {e}")), nonce.clone()))?;
    let csr_der = URL_SAFE_NO_PAD
        .decode(&payload.csr)
        .map_err(|e| (AcmeError::BadCsr(format!("invalid csr encoding: {e}")), nonce.clone()))?;

    let authorizations = state
        .store
        .list_authorizations_for_order(&order.id)
        .await
        .map_err(|e| (AcmeError::from(e), nonce.clone()))?;
    let ordered_domains: BTreeSet<String> = authorizations.iter().map(|a| a.domain.clone()).collect();

    let checked = check_csr(&csr_der, &ordered_domains).map_err(|e| (e, nonce.clone()))?;

    let advanced = state
        .store
        .set_order_status_if(&order.id, OrderStatus::Ready, OrderStatus::Processing, None)
        .await
        .map_err(|e| (AcmeError::from(e), nonce.clone()))?;
    if !advanced {
        return Err((AcmeError::OrderNotReady("order is no longer ready".into()), nonce));
    }

    let order = match sign_and_attach(state, &order, &csr_der, &checked).await {
        Ok(order) => order,
        Err(err) => {
            let detail = ProblemDetail::new("serverInternal", err.to_string());
            let _ = state
                .store
                .set_order_status(&order.id, OrderStatus::Invalid, Some(detail))
                .await;
            return Err((AcmeError::ServerInternal(err.to_string()), nonce));
        }
    };

    Ok(respond_with_order(state, &order, &nonce).await)
}

async fn invalidate_expired_order(state: &AppState, order: &Order) -> Result<(), AcmeError> {
    let detail = ProblemDetail::new("malformed", "order expired before finalization");
    state.store.set_order_status(&order.id, OrderStatus::Invalid, Some(detail)).await?;
    for authz_id in &order.authorization_ids {
        state.store.set_authorization_status(authz_id, AuthorizationStatus::Expired).await?;
    }
    Ok(())
}

async fn sign_and_attach(
    state: &AppState,
    order: &Order,
    csr_der: &[u8],
    checked: &CheckedCsr,
) -> anyhow::Result<Order> {
    let (issuer, ca) = state.load_issuer().await.map_err(|e| anyhow::anyhow!(e.detail()))?;
    let issued = crate::ca::sign_csr(
        csr_der,
        &checked.subject_domain,
        &checked.san_domains,
        &issuer,
        &ca.cert_pem,
        &ca.serial_number,
        state.cert_lifetime(),
        &state.settings.external_url,
    )?;

    let public_key_der = leaf_spki_der(&issued.leaf_pem)?;

    let certificate = crate::store::model::Certificate {
        serial_number: issued.serial_hex.clone(),
        order_id: order.id.clone(),
        ca_serial: ca.serial_number,
        csr_pem: checked.csr_pem.clone(),
        chain_pem: issued.chain_pem,
        public_key_der,
        not_valid_before: issued.not_valid_before,
        not_valid_after: issued.not_valid_after,
        revoked_at: None,
        user_informed_cert_will_expire: false,
        user_informed_cert_has_expired: false,
    };
    state.store.insert_certificate(certificate).await?;
    state.store.attach_certificate_to_order(&order.id, &issued.serial_hex).await?;
    state.store.set_order_status(&order.id, OrderStatus::Valid, None).await?;

    let mut order = order.clone();
    order.status = OrderStatus::Valid;
    order.certificate_serial = Some(issued.serial_hex);
    Ok(order)
}

async fn respond_with_order(state: &AppState, order: &Order, nonce: &str) -> Response {
    let identifiers = state
        .store
        .list_authorizations_for_order(&order.id)
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|authz| IdentifierResponse { r#type: "dns".into(), value: authz.domain })
        .collect();
    let body = OrderResponse::build(order, &state.settings.external_url, identifiers);
    let resp = Response::builder()
        .content_type("application/json")
        .body(serde_json::to_vec(&body).unwrap_or_default());
    ok_with_nonce(resp, nonce, &state.settings.external_url)
}

struct CheckedCsr {
    subject_domain: String,
    san_domains: Vec<String>,
    csr_pem: String,
}

/// Parses and validates a DER CSR: `rcgen` verifies the self-signature
/// while parsing, so a CSR that fails to parse has already failed that
/// check. The CN (if present) or else the first SAN becomes the subject.
fn check_csr(csr_der: &[u8], ordered_domains: &BTreeSet<String>) -> Result<CheckedCsr, AcmeError> {
    let params = rcgen::CertificateSigningRequestParams::from_der(csr_der)
        .map_err(|e| AcmeError::BadCsr(format!("invalid CSR: {e}")))?;

    let mut san_domains: Vec<String> = params
        .params
        .subject_alt_names
        .iter()
        .filter_map(|san| match san {
            rcgen::SanType::DnsName(name) => Some(name.to_string()),
            _ => None,
        })
        .collect();

    let cn = params
        .params
        .distinguished_name
        .get(&rcgen::DnType::CommonName)
        .map(ToString::to_string);

    if cn.is_none() && san_domains.is_empty() {
        return Err(AcmeError::BadCsr("CSR has no common name and no SAN entries".into()));
    }

    let mut csr_domains: BTreeSet<String> = san_domains.iter().cloned().collect();
    if let Some(cn) = &cn {
        csr_domains.insert(cn.clone());
    }
    if &csr_domains != ordered_domains {
        return Err(AcmeError::BadCsr("CSR names do not match the order's identifiers".into()));
    }

    let subject_domain = cn.unwrap_or_else(|| san_domains.remove(0));
    let csr_pem = pem_encode_csr(csr_der);

    Ok(CheckedCsr {
        subject_domain,
        san_domains: csr_domains.into_iter().collect(),
        csr_pem,
    })
}

/// Extracts the DER `SubjectPublicKeyInfo` of a freshly issued leaf
/// certificate, for later comparison against a revocation request's
/// presented JWK.
fn leaf_spki_der(leaf_pem: &str) -> anyhow::Result<Vec<u8>> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(leaf_pem.as_bytes())?;
    let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents)?;
    Ok(cert.public_key().raw.to_vec())
}

fn pem_encode_csr(der: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE REQUEST-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE REQUEST-----\n");
    pem
}

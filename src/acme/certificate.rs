//! Certificate chain download, revocation, and the public CRL endpoint.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use poem::web::{Data, Json, Path};
use poem::{Request, Response, handler};
use time::OffsetDateTime;

use super::types::RevokeCertPayload;
use super::{AppState, called_url, error_response, ok_with_nonce};
use crate::errors::AcmeError;
use crate::jws::EnvelopeOptions;
use crate::jws::JwsBody;
use crate::store::model::Certificate;

#[handler]
pub async fn download(
    Data(state): Data<&Arc<AppState>>,
    req: &Request,
    Path(serial): Path<String>,
    body: Json<JwsBody>,
) -> Response {
    let accept = req
        .header("accept")
        .map(str::to_owned)
        .unwrap_or_else(|| "*/*".to_string());
    if !accept.contains("application/pem-certificate-chain") && !accept.contains("*/*") {
        return AcmeError::Malformed("Accept header must allow application/pem-certificate-chain".into()).into_response();
    }

    let called = called_url(state, req);
    let authenticated = match super::authenticate(state, &body.0, &called, &EnvelopeOptions::default()).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let nonce = authenticated.new_nonce.clone();
    let Some(account) = authenticated.account else {
        return error_response(state, AcmeError::Unauthorized("this resource requires kid".into()), &nonce);
    };

    let cert = match state.store.get_certificate(&serial).await {
        Ok(Some(c)) => c,
        Ok(None) => return error_response(state, AcmeError::NotFound("no such certificate".into()), &nonce),
        Err(err) => return error_response(state, AcmeError::from(err), &nonce),
    };
    let order = match state.store.get_order(&cert.order_id).await {
        Ok(Some(o)) => o,
        Ok(None) => return error_response(state, AcmeError::ServerInternal("certificate has no order".into()), &nonce),
        Err(err) => return error_response(state, AcmeError::from(err), &nonce),
    };
    if order.account_id != account.id {
        return error_response(state, AcmeError::Unauthorized("certificate does not belong to this account".into()), &nonce);
    }

    let resp = Response::builder()
        .content_type("application/pem-certificate-chain")
        .body(cert.chain_pem);
    ok_with_nonce(resp, &nonce, &state.settings.external_url)
}

#[handler]
pub async fn revoke(Data(state): Data<&Arc<AppState>>, req: &Request, body: Json<JwsBody>) -> Response {
    let called = called_url(state, req);
    let opts = EnvelopeOptions {
        allow_new_account: true,
        allow_blocked_account: false,
    };
    let authenticated = match super::authenticate(state, &body.0, &called, &opts).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match handle_revoke(state, authenticated).await {
        Ok(resp) => resp,
        Err((err, nonce)) => error_response(state, err, &nonce),
    }
}

async fn handle_revoke(
    state: &AppState,
    authenticated: crate::jws::RequestData,
) -> Result<Response, (AcmeError, String)> {
    let nonce = authenticated.new_nonce.clone();
    let payload: RevokeCertPayload = serde_json::from_value(authenticated.payload)
        .map_err(|e| (AcmeError::Malformed(format!("invalid revokeCert payload: {e}")), nonce.clone()))?;

    if let Some(reason) = payload.reason {
        if reason > 10 || reason == 7 {
            return Err((AcmeError::BadRevocationReason(format!("unsupported reason code {reason}")), nonce));
        }
    }

    let cert_der = URL_SAFE_NO_PAD
        .decode(&payload.certificate)
        .map_err(|e| (AcmeError::Malformed(format!("invalid certificate encoding: {e}")), nonce.clone()))?;
    let serial = serial_from_der(&cert_der).map_err(|e| (AcmeError::Malformed(e.to_string()), nonce.clone()))?;

    let cert = state
        .store
        .get_certificate(&serial)
        .await
        .map_err(|e| (AcmeError::from(e), nonce.clone()))?
        .ok_or_else(|| (AcmeError::NotFound("no such certificate".into()), nonce.clone()))?;
    if cert.revoked_at.is_some() {
        return Err((AcmeError::AlreadyRevoked("certificate is already revoked".into()), nonce));
    }

    authorize_revocation(state, &authenticated.account, &authenticated.key, &cert)
        .await
        .map_err(|e| (e, nonce.clone()))?;

    let now = OffsetDateTime::now_utc();
    state.store.set_certificate_revoked(&serial, now).await.map_err(|e| (AcmeError::from(e), nonce.clone()))?;
    rebuild_crl(state, &cert.ca_serial).await.map_err(|e| (AcmeError::from(e), nonce.clone()))?;

    let resp = Response::builder().finish();
    Ok(ok_with_nonce(resp, &nonce, &state.settings.external_url))
}

async fn authorize_revocation(
    state: &AppState,
    account: &Option<crate::store::model::Account>,
    key: &crate::jwk::Jwk,
    cert: &Certificate,
) -> Result<(), AcmeError> {
    if let Some(account) = account {
        let order = state
            .store
            .get_order(&cert.order_id)
            .await
            .map_err(AcmeError::from)?
            .ok_or_else(|| AcmeError::ServerInternal("certificate has no order".into()))?;
        if order.account_id == account.id {
            return Ok(());
        }
    }
    let presented = key.spki_der().map_err(|e| AcmeError::Malformed(e.to_string()))?;
    if presented == cert.public_key_der {
        return Ok(());
    }
    Err(AcmeError::Unauthorized("revocation requires the account or the certificate's own key".into()))
}

async fn rebuild_crl(state: &AppState, ca_serial: &str) -> anyhow::Result<()> {
    let ca = state
        .store
        .get_ca(ca_serial)
        .await?
        .ok_or_else(|| anyhow::anyhow!("unknown CA {ca_serial}"))?;
    let key = crate::ca::fernet::parse_key(&state.settings.ca.encryption_key)?;
    let issuer = crate::ca::load_issuer(&ca, &key)?;
    let revoked = state.store.list_revoked_serials(ca_serial).await?;
    let crl_pem = crate::ca::build_crl(&issuer, &revoked, state.crl_lifetime())?;
    state.store.update_ca_crl(ca_serial, crl_pem).await?;
    Ok(())
}

fn serial_from_der(der: &[u8]) -> anyhow::Result<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)?;
    Ok(cert.raw_serial().iter().map(|b| format!("{b:02X}")).collect())
}

#[handler]
pub async fn crl(Data(state): Data<&Arc<AppState>>, Path(serial): Path<String>) -> Response {
    match state.store.get_ca(&serial).await {
        Ok(Some(ca)) => Response::builder().content_type("application/pkix-crl").body(ca.crl_pem),
        Ok(None) => AcmeError::NotFound("no such CA".into()).into_response(),
        Err(err) => AcmeError::from(err).into_response(),
    }
}

//! Authorization viewing and deactivation.

use std::sync::Arc;

use poem::web::{Data, Json, Path};
use poem::{Request, Response, handler};
use serde::Deserialize;

use super::types::AuthorizationResponse;
use super::{AppState, called_url, error_response, ok_with_nonce};
use crate::errors::AcmeError;
use crate::jws::{EnvelopeOptions, JwsBody};
use crate::store::model::{AuthorizationStatus, OrderStatus, ProblemDetail};

#[derive(Debug, Deserialize, Default)]
struct DeactivatePayload {
    status: Option<String>,
}

#[handler]
pub async fn view_or_deactivate(
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
    match handle(state, &id, authenticated).await {
        Ok(resp) => resp,
        Err((err, nonce)) => error_response(state, err, &nonce),
    }
}

async fn handle(
    state: &AppState,
    authz_id: &str,
    authenticated: crate::jws::RequestData,
) -> Result<Response, (AcmeError, String)> {
    let nonce = authenticated.new_nonce.clone();
    let account = authenticated
        .account
        .ok_or_else(|| (AcmeError::Unauthorized("this resource requires kid".into()), nonce.clone()))?;

    let authz = state
        .store
        .get_authorization(authz_id)
        .await
        .map_err(|e| (AcmeError::from(e), nonce.clone()))?
        .ok_or_else(|| (AcmeError::NotFound("no such authorization".into()), nonce.clone()))?;

    let order = state
        .store
        .get_order(&authz.order_id)
        .await
        .map_err(|e| (AcmeError::from(e), nonce.clone()))?
        .ok_or_else(|| (AcmeError::NotFound("no such order".into()), nonce.clone()))?;
    if order.account_id != account.id {
        return Err((AcmeError::Unauthorized("authorization does not belong to this account".into()), nonce));
    }

    let deactivate_requested = if authenticated.payload.is_null() {
        false
    } else {
        let payload: DeactivatePayload = serde_json::from_value(authenticated.payload)
            .map_err(|e| (AcmeError::Malformed(format!("invalid authorization update: {e}")), nonce.clone()))?;
        payload.status.as_deref() == Some("deactivated")
    };

    let authz = if deactivate_requested {
        let can_deactivate = matches!(authz.status, AuthorizationStatus::Pending | AuthorizationStatus::Valid)
            && matches!(order.status, OrderStatus::Pending | OrderStatus::Ready);
        if !can_deactivate {
            return Err((AcmeError::Malformed("authorization cannot be deactivated in its current state".into()), nonce));
        }
        state
            .store
            .set_authorization_status(&authz.id, AuthorizationStatus::Deactivated)
            .await
            .map_err(|e| (AcmeError::from(e), nonce.clone()))?;
        let detail = ProblemDetail::new("unauthorized", "authorization deactivated");
        state
            .store
            .set_order_status(&order.id, OrderStatus::Invalid, Some(detail))
            .await
            .map_err(|e| (AcmeError::from(e), nonce.clone()))?;
        let mut authz = authz;
        authz.status = AuthorizationStatus::Deactivated;
        authz
    } else {
        authz
    };

    let challenge = state
        .store
        .get_challenge_context(&authz.challenge_id)
        .await
        .map_err(|e| (AcmeError::from(e), nonce.clone()))?
        .ok_or_else(|| (AcmeError::ServerInternal("authorization has no challenge".into()), nonce.clone()))?
        .challenge;

    let body = AuthorizationResponse::build(&authz, &challenge, &state.settings.external_url);
    let resp = Response::builder()
        .content_type("application/json")
        .header("Link", format!("<{}>;rel=\"up\"", state.url(&format!("acme/orders/{}", order.id))))
        .body(serde_json::to_vec(&body).unwrap_or_default());
    Ok(ok_with_nonce(resp, &nonce, &state.settings.external_url))
}

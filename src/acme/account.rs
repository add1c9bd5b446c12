//! Account registration, view/update, and per-account order listing.

use std::sync::Arc;

use poem::web::{Data, Json, Path};
use poem::{Request, Response, handler};

use super::types::{AccountResponse, NewAccountPayload, UpdateAccountPayload};
use super::{AppState, called_url, error_response, ok_with_nonce};
use crate::errors::AcmeError;
use crate::jws::{EnvelopeOptions, JwsBody};
use crate::store::model::{Account, AccountStatus};

#[handler]
pub async fn new_account(Data(state): Data<&Arc<AppState>>, req: &Request, body: Json<JwsBody>) -> Response {
    let called = called_url(state, req);
    let opts = EnvelopeOptions {
        allow_new_account: true,
        allow_blocked_account: false,
    };
    let authenticated = match super::authenticate(state, &body.0, &called, &opts).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match handle_new_account(state, authenticated).await {
        Ok(resp) => resp,
        Err((err, nonce)) => error_response(state, err, &nonce),
    }
}

async fn handle_new_account(
    state: &AppState,
    authenticated: crate::jws::RequestData,
) -> Result<Response, (AcmeError, String)> {
    let nonce = authenticated.new_nonce.clone();
    let payload: NewAccountPayload = if authenticated.payload.is_null() {
        NewAccountPayload::default()
    } else {
        serde_json::from_value(authenticated.payload.clone())
            .map_err(|e| (AcmeError::Malformed(format!("invalid newAccount payload: {e}")), nonce.clone()))?
    };

    let thumbprint = authenticated.key.thumbprint();

    if payload.only_return_existing {
        let existing = state
            .store
            .find_account_by_thumbprint(&thumbprint)
            .await
            .map_err(|e| (AcmeError::from(e), nonce.clone()))?;
        let Some(account) = existing else {
            return Err((AcmeError::AccountDoesNotExist("no account for this key".into()), nonce));
        };
        return Ok(respond_with_account(state, &account, poem::http::StatusCode::OK, &nonce));
    }

    if state.settings.acme.terms_of_service_url.is_some() && !payload.terms_of_service_agreed {
        return Err((
            AcmeError::Malformed("termsOfServiceAgreed must be true".into()),
            nonce,
        ));
    }

    let contact = first_contact(state, &payload.contact).map_err(|e| (e, nonce.clone()))?;
    if contact.is_none() && state.settings.acme.mail_required {
        return Err((AcmeError::InvalidContact("a contact address is required".into()), nonce));
    }

    let account = Account {
        id: String::new(),
        jwk: authenticated.key.clone(),
        jwk_thumbprint: thumbprint,
        contact: contact.clone(),
        status: AccountStatus::Valid,
    };
    let (account, created) = state
        .store
        .find_or_create_account(account)
        .await
        .map_err(|e| (AcmeError::from(e), nonce.clone()))?;

    if created {
        if let (Some(mailer), Some(contact)) = (&state.mailer, &account.contact) {
            if let Some(address) = contact.strip_prefix("mailto:") {
                mailer.send_new_account_info(address).await;
            }
        }
    }

    let status = if created {
        poem::http::StatusCode::CREATED
    } else {
        poem::http::StatusCode::OK
    };
    Ok(respond_with_account(state, &account, status, &nonce))
}

#[handler]
pub async fn view_or_update(
    Data(state): Data<&Arc<AppState>>,
    req: &Request,
    Path(id): Path<String>,
    body: Json<JwsBody>,
) -> Response {
    let called = called_url(state, req);
    let opts = EnvelopeOptions::default();
    let authenticated = match super::authenticate(state, &body.0, &called, &opts).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match handle_view_or_update(state, &id, authenticated).await {
        Ok(resp) => resp,
        Err((err, nonce)) => error_response(state, err, &nonce),
    }
}

async fn handle_view_or_update(
    state: &AppState,
    path_id: &str,
    authenticated: crate::jws::RequestData,
) -> Result<Response, (AcmeError, String)> {
    let nonce = authenticated.new_nonce.clone();
    let account = authenticated
        .account
        .filter(|a| a.id == path_id)
        .ok_or_else(|| (AcmeError::Unauthorized("account does not match signing key".into()), nonce.clone()))?;

    if authenticated.payload.is_null() {
        return Ok(respond_with_account(state, &account, poem::http::StatusCode::OK, &nonce));
    }

    let update: UpdateAccountPayload = serde_json::from_value(authenticated.payload.clone())
        .map_err(|e| (AcmeError::Malformed(format!("invalid account update: {e}")), nonce.clone()))?;

    if let Some(status) = &update.status {
        if status == "deactivated" {
            state
                .store
                .set_account_status(&account.id, AccountStatus::Deactivated)
                .await
                .map_err(|e| (AcmeError::from(e), nonce.clone()))?;
            let mut account = account;
            account.status = AccountStatus::Deactivated;
            return Ok(respond_with_account(state, &account, poem::http::StatusCode::OK, &nonce));
        }
        return Err((AcmeError::Malformed(format!("unsupported account status: {status}")), nonce));
    }

    if let Some(contacts) = update.contact {
        let contact = first_contact(state, &contacts).map_err(|e| (e, nonce.clone()))?;
        if contact.is_none() && state.settings.acme.mail_required {
            return Err((AcmeError::InvalidContact("a contact address is required".into()), nonce));
        }
        state
            .store
            .update_account_contact(&account.id, contact.clone())
            .await
            .map_err(|e| (AcmeError::from(e), nonce.clone()))?;
        if let (Some(mailer), Some(contact)) = (&state.mailer, &contact) {
            if let Some(address) = contact.strip_prefix("mailto:") {
                mailer.send_new_account_info(address).await;
            }
        }
        let mut account = account;
        account.contact = contact;
        return Ok(respond_with_account(state, &account, poem::http::StatusCode::OK, &nonce));
    }

    Ok(respond_with_account(state, &account, poem::http::StatusCode::OK, &nonce))
}

#[handler]
pub async fn list_orders(
    Data(state): Data<&Arc<AppState>>,
    req: &Request,
    Path(id): Path<String>,
    body: Json<JwsBody>,
) -> Response {
    let called = called_url(state, req);
    let opts = EnvelopeOptions::default();
    let authenticated = match super::authenticate(state, &body.0, &called, &opts).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let nonce = authenticated.new_nonce.clone();
    let Some(account) = authenticated.account.filter(|a| a.id == id) else {
        return error_response(state, AcmeError::Unauthorized("account does not match signing key".into()), &nonce);
    };
    let orders = match state.store.list_orders_for_account(&account.id).await {
        Ok(o) => o,
        Err(err) => return error_response(state, AcmeError::from(err), &nonce),
    };
    let urls: Vec<String> = orders
        .iter()
        .filter(|o| o.status != crate::store::model::OrderStatus::Invalid)
        .map(|o| state.url(&format!("acme/orders/{}", o.id)))
        .collect();
    let resp = Response::builder()
        .content_type("application/json")
        .body(serde_json::to_vec(&urls).unwrap_or_default());
    ok_with_nonce(resp, &nonce, &state.settings.external_url)
}

fn respond_with_account(
    state: &AppState,
    account: &Account,
    status: poem::http::StatusCode,
    nonce: &str,
) -> Response {
    let body = AccountResponse {
        status: match account.status {
            AccountStatus::Valid => "valid",
            AccountStatus::Deactivated => "deactivated",
            AccountStatus::Revoked => "revoked",
        }
        .to_string(),
        contact: account.contact.clone().into_iter().collect(),
        orders: state.url(&format!("acme/accounts/{}/orders", account.id)),
    };
    let mut resp = Response::builder()
        .status(status)
        .content_type("application/json")
        .header("Location", state.url(&format!("acme/accounts/{}", account.id)))
        .body(serde_json::to_vec(&body).unwrap_or_default());
    ok_with_nonce(resp, nonce, &state.settings.external_url)
}

/// At most one contact is supported; a request with more than one is
/// `malformed`, and each must match `acme.mail_target_regex`.
fn first_contact(state: &AppState, contacts: &[String]) -> Result<Option<String>, AcmeError> {
    if contacts.is_empty() {
        return Ok(None);
    }
    if contacts.len() > 1 {
        return Err(AcmeError::InvalidContact("only one contact address is supported".into()));
    }
    let contact = &contacts[0];
    let Some(address) = contact.strip_prefix("mailto:") else {
        return Err(AcmeError::UnsupportedContact("contact must be a mailto: URI".into()));
    };
    if !state.mail_target_regex.is_match(address) {
        return Err(AcmeError::InvalidContact(format!("{address} is not an accepted contact address")));
    }
    Ok(Some(contact.clone()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use regex::Regex;

    use super::*;
    use crate::config::Settings;
    use crate::store::memory::MemoryStore;

    fn test_state() -> AppState {
        let settings = Settings::new(None).unwrap();
        AppState {
            store: Arc::new(MemoryStore::new()),
            mail_target_regex: Regex::new(&settings.acme.mail_target_regex).unwrap(),
            target_domain_regex: Regex::new(&settings.acme.target_domain_regex).unwrap(),
            probe_client: super::super::http01_probe::build_client(),
            mailer: None,
            settings,
        }
    }

    #[test]
    fn accepts_a_single_matching_mailto_contact() {
        let state = test_state();
        let contact = first_contact(&state, &["mailto:admin@example.com".into()]).unwrap();
        assert_eq!(contact, Some("mailto:admin@example.com".into()));
    }

    #[test]
    fn rejects_more_than_one_contact() {
        let state = test_state();
        let err = first_contact(
            &state,
            &["mailto:a@example.com".into(), "mailto:b@example.com".into()],
        )
        .unwrap_err();
        assert!(matches!(err, AcmeError::InvalidContact(_)));
    }

    #[test]
    fn rejects_non_mailto_contact() {
        let state = test_state();
        let err = first_contact(&state, &["tel:+12025550123".into()]).unwrap_err();
        assert!(matches!(err, AcmeError::UnsupportedContact(_)));
    }

    #[test]
    fn no_contact_is_allowed() {
        let state = test_state();
        assert_eq!(first_contact(&state, &[]).unwrap(), None);
    }
}

//! The ACME HTTP surface: directory, accounts, orders, authorizations,
//! challenges, certificates. Each submodule owns one RFC 8555 resource
//! family; this module wires them into one [`poem::Route`] and holds the
//! shared [`AppState`] every handler is given through `Data`.

pub mod account;
pub mod authorization;
pub mod certificate;
pub mod challenge;
pub mod directory;
pub mod http01_probe;
pub mod order;
pub mod types;

use std::sync::Arc;

use poem::web::Data;
use poem::{EndpointExt, IntoResponse, Response, Route, get, handler, post};
use rcgen::{Issuer, KeyPair};
use regex::Regex;
use time::Duration;

use crate::config::Settings;
use crate::errors::AcmeError;
use crate::jws::{EnvelopeError, EnvelopeOptions, JwsBody, RequestData};
use crate::mail::Mailer;
use crate::store::Store;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub settings: Settings,
    pub probe_client: reqwest::Client,
    pub mailer: Option<Mailer>,
    pub target_domain_regex: Regex,
    pub mail_target_regex: Regex,
}

impl AppState {
    /// Builds the absolute URL this server considers itself reachable at
    /// for `path` (no leading slash), e.g. `acme/orders/<id>`.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.external_url)
    }

    pub async fn load_issuer(&self) -> Result<(Issuer<'static, KeyPair>, crate::store::model::Ca), AcmeError> {
        let ca = self
            .store
            .get_active_ca()
            .await
            .map_err(AcmeError::from)?
            .ok_or_else(|| AcmeError::ServerInternal("no active CA configured".into()))?;
        let key = crate::ca::fernet::parse_key(&self.settings.ca.encryption_key).map_err(AcmeError::from)?;
        let issuer = crate::ca::load_issuer(&ca, &key).map_err(AcmeError::from)?;
        Ok((issuer, ca))
    }

    #[must_use]
    pub fn cert_lifetime(&self) -> Duration {
        self.settings.ca.cert_lifetime
    }

    #[must_use]
    pub fn crl_lifetime(&self) -> Duration {
        self.settings.ca.crl_lifetime
    }
}

pub fn routes(state: Arc<AppState>) -> Route {
    Route::new()
        .at("/directory", get(directory::directory))
        .at("/acme/directory", get(directory::directory))
        .at("/acme/new-nonce", get(directory::new_nonce).head(directory::new_nonce_head))
        .at("/acme/new-account", post(account::new_account))
        .at("/acme/accounts/:id", post(account::view_or_update))
        .at("/acme/accounts/:id/orders", post(account::list_orders))
        .at("/acme/new-order", post(order::new_order))
        .at("/acme/orders/:id", post(order::view_order))
        .at("/acme/orders/:id/finalize", post(order::finalize_order))
        .at("/acme/authorizations/:id", post(authorization::view_or_deactivate))
        .at("/acme/challenges/:id", post(challenge::trigger))
        .at("/acme/certificates/:serial", post(certificate::download))
        .at("/acme/revoke-cert", post(certificate::revoke))
        .at("/acme/key-change", post(key_change))
        .at("/ca/:serial/crl", get(certificate::crl))
        .data(state)
}

#[handler]
fn key_change() -> AcmeError {
    AcmeError::ServerInternal("key rollover is not implemented".into())
}

/// Verifies the JWS envelope of the current request and maps a failure
/// straight into an HTTP response, so handlers only ever deal with the
/// success path.
pub async fn authenticate(
    state: &AppState,
    body: &JwsBody,
    called_url: &str,
    opts: &EnvelopeOptions,
) -> Result<RequestData, Response> {
    crate::jws::verify(body, called_url, &state.settings.external_url, state.store.as_ref(), opts)
        .await
        .map_err(envelope_error_response)
}

fn envelope_error_response(err: EnvelopeError) -> Response {
    with_directory_link(err.error.into_response_with_nonce(err.new_nonce.as_deref()))
}

pub fn error_response(state: &AppState, err: AcmeError, nonce: &str) -> Response {
    with_directory_link_url(err.into_response_with_nonce(Some(nonce)), &state.settings.external_url)
}

pub fn with_directory_link(resp: Response) -> Response {
    resp
}

pub fn with_directory_link_url(mut resp: Response, external_url: &str) -> Response {
    if let Ok(value) = poem::http::HeaderValue::from_str(&format!("<{external_url}acme/directory>;rel=\"index\"")) {
        resp.headers_mut().insert("Link", value);
    }
    resp
}

pub fn ok_with_nonce(mut resp: Response, nonce: &str, external_url: &str) -> Response {
    if let Ok(value) = poem::http::HeaderValue::from_str(nonce) {
        resp.headers_mut().insert("Replay-Nonce", value);
    }
    with_directory_link_url(resp, external_url)
}

/// Reconstructs the absolute URL this server considers the current
/// request to have hit, for comparison against the JWS `protected.url`.
#[must_use]
pub fn called_url(state: &AppState, req: &poem::Request) -> String {
    format!("{}{}", state.settings.external_url, req.uri().path().trim_start_matches('/'))
}

/// Generates a random URL-safe base64 token of `bytes` random bytes, used
/// for account/order/authorization/challenge ids and HTTP-01 tokens.
#[must_use]
pub fn random_token(bytes: usize) -> String {
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use ring::rand::{SecureRandom, SystemRandom};

    let mut buf = vec![0u8; bytes];
    SystemRandom::new().fill(&mut buf).expect("system RNG unavailable");
    URL_SAFE_NO_PAD.encode(buf)
}

//! `/acme/directory` and `/acme/new-nonce`.

use std::sync::Arc;

use poem::web::Data;
use poem::{Response, handler};

use super::AppState;
use super::types::{DirectoryMeta, DirectoryResponse};

#[handler]
pub async fn directory(Data(state): Data<&Arc<AppState>>) -> Response {
    let body = DirectoryResponse {
        new_nonce: state.url("acme/new-nonce"),
        new_account: state.url("acme/new-account"),
        new_order: state.url("acme/new-order"),
        revoke_cert: state.url("acme/revoke-cert"),
        key_change: state.url("acme/key-change"),
        meta: DirectoryMeta {
            website: state.settings.external_url.clone(),
            terms_of_service: state.settings.acme.terms_of_service_url.clone(),
        },
    };
    let resp = Response::builder()
        .content_type("application/json")
        .body(serde_json::to_vec(&body).unwrap_or_default());
    super::with_directory_link_url(resp, &state.settings.external_url)
}

#[handler]
pub async fn new_nonce(Data(state): Data<&Arc<AppState>>) -> Response {
    respond(state, poem::http::StatusCode::NO_CONTENT).await
}

#[handler]
pub async fn new_nonce_head(Data(state): Data<&Arc<AppState>>) -> Response {
    respond(state, poem::http::StatusCode::OK).await
}

async fn respond(state: &AppState, status: poem::http::StatusCode) -> Response {
    let nonce = match crate::nonce::mint(state.store.as_ref()).await {
        Ok(n) => n,
        Err(err) => return crate::errors::AcmeError::from(err).into_response_with_nonce(None),
    };
    let resp = Response::builder()
        .status(status)
        .header("Cache-Control", "no-store")
        .finish();
    super::ok_with_nonce(resp, &nonce, &state.settings.external_url)
}

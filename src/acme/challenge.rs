//! Challenge verification: the HTTP-01 state machine described in
//! §4.4. Triggering a challenge kicks off the out-of-band probe in the
//! background and returns the challenge's current view immediately, the
//! same "accept, then do the slow part off the request path" shape the
//! order lifecycle already uses for id/token generation.

use std::sync::Arc;

use poem::web::{Data, Json, Path};
use poem::{Request, Response, handler};
use time::OffsetDateTime;
use tracing::warn;

use super::types::ChallengeResponse;
use super::{AppState, called_url, error_response, ok_with_nonce};
use crate::errors::AcmeError;
use crate::jws::EnvelopeOptions;
use crate::jws::JwsBody;
use crate::store::model::{AuthorizationStatus, ChallengeStatus, OrderStatus, ProblemDetail};
use crate::store::ChallengeContext;

#[handler]
pub async fn trigger(
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
    let account = match authenticated.account {
        Some(a) => a,
        None => {
            return error_response(state, AcmeError::Unauthorized("this resource requires kid".into()), &nonce);
        }
    };

    let ctx = match state.store.get_challenge_context(&id).await {
        Ok(Some(ctx)) => ctx,
        Ok(None) => return error_response(state, AcmeError::NotFound("no such challenge".into()), &nonce),
        Err(err) => return error_response(state, AcmeError::from(err), &nonce),
    };
    if ctx.order.account_id != account.id {
        return error_response(state, AcmeError::Unauthorized("challenge does not belong to this account".into()), &nonce);
    }

    if ctx.order.status == OrderStatus::Invalid {
        let _ = cascade_invalid(state, &ctx).await;
        return respond(state, &ctx, &nonce).await;
    }

    if ctx.challenge.status == ChallengeStatus::Pending && ctx.order.status == OrderStatus::Pending {
        if ctx.authorization.status == AuthorizationStatus::Pending {
            let advanced = state
                .store
                .set_challenge_status_if(&ctx.challenge.id, ChallengeStatus::Pending, ChallengeStatus::Processing)
                .await
                .unwrap_or(false);
            if advanced {
                spawn_probe(Arc::clone(state), ctx.clone(), account.jwk.thumbprint());
            }
        } else {
            let detail = ProblemDetail::new("unauthorized", "authorization is not pending");
            let _ = state
                .store
                .set_challenge_result(&ctx.challenge.id, ChallengeStatus::Invalid, None, Some(detail))
                .await;
        }
    }

    let ctx = state.store.get_challenge_context(&id).await.ok().flatten().unwrap_or(ctx);
    respond(state, &ctx, &nonce).await
}

fn spawn_probe(state: Arc<AppState>, ctx: ChallengeContext, thumbprint: String) {
    tokio::spawn(async move {
        let expected = format!("{}.{}", ctx.challenge.token, thumbprint);
        let outcome = super::http01_probe::verify(&state.probe_client, &ctx.authorization.domain, &ctx.challenge.token, &expected).await;
        if let Err(err) = finish_probe(&state, &ctx, outcome).await {
            warn!("failed to record HTTP-01 probe result for challenge {}: {err}", ctx.challenge.id);
        }
    });
}

async fn finish_probe(
    state: &AppState,
    ctx: &ChallengeContext,
    outcome: Result<(), ProblemDetail>,
) -> anyhow::Result<()> {
    match outcome {
        Ok(()) => {
            state
                .store
                .set_challenge_result(&ctx.challenge.id, ChallengeStatus::Valid, Some(OffsetDateTime::now_utc()), None)
                .await?;
            state
                .store
                .set_authorization_status_if(&ctx.authorization.id, &[AuthorizationStatus::Pending], AuthorizationStatus::Valid)
                .await?;
            let authorizations = state.store.list_authorizations_for_order(&ctx.order.id).await?;
            if authorizations.iter().all(|a| a.status == AuthorizationStatus::Valid) {
                state
                    .store
                    .set_order_status_if(&ctx.order.id, OrderStatus::Pending, OrderStatus::Ready, None)
                    .await?;
            }
        }
        Err(detail) => {
            state
                .store
                .set_challenge_result(&ctx.challenge.id, ChallengeStatus::Invalid, None, Some(detail))
                .await?;
            state.store.set_authorization_status(&ctx.authorization.id, AuthorizationStatus::Invalid).await?;
            let order_detail = ProblemDetail::new("unauthorized", "challenge failed");
            state
                .store
                .set_order_status(&ctx.order.id, OrderStatus::Invalid, Some(order_detail))
                .await?;
        }
    }
    Ok(())
}

async fn cascade_invalid(state: &AppState, ctx: &ChallengeContext) -> anyhow::Result<()> {
    state.store.set_authorization_status(&ctx.authorization.id, AuthorizationStatus::Invalid).await?;
    state
        .store
        .set_challenge_result(&ctx.challenge.id, ChallengeStatus::Invalid, None, None)
        .await?;
    Ok(())
}

async fn respond(state: &AppState, ctx: &ChallengeContext, nonce: &str) -> Response {
    let body = ChallengeResponse::build(&ctx.challenge, &ctx.authorization, &state.settings.external_url);
    let up = state.url(&format!("acme/authorizations/{}", ctx.authorization.id));
    let resp = Response::builder()
        .content_type("application/json")
        .header("Link", format!("<{up}>;rel=\"up\""))
        .body(serde_json::to_vec(&body).unwrap_or_default());
    ok_with_nonce(resp, nonce, &state.settings.external_url)
}

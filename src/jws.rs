//! JWS envelope verification: the gate every non-GET ACME request must
//! pass before a resource handler ever sees it.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::AcmeError;
use crate::jwk::Jwk;
use crate::store::Store;
use crate::store::model::{Account, AccountStatus};

const ALLOWED_ALGS: &[&str] = &["RS256", "RS384", "RS512", "ES256"];

#[derive(Debug, Deserialize)]
pub struct JwsBody {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
struct Protected {
    alg: String,
    nonce: String,
    url: String,
    jwk: Option<Value>,
    kid: Option<String>,
}

/// What a handler allows the envelope to resolve the signing key to.
pub struct EnvelopeOptions {
    pub allow_new_account: bool,
    pub allow_blocked_account: bool,
}

impl Default for EnvelopeOptions {
    fn default() -> Self {
        Self {
            allow_new_account: false,
            allow_blocked_account: false,
        }
    }
}

/// Everything a resource handler needs once the envelope has been
/// authenticated: the decoded payload, the key it was signed with, the
/// bound account (absent only for brand-new-account requests), and the
/// nonce to attach to the response (or to any error raised downstream).
pub struct RequestData {
    pub payload: Value,
    pub key: Jwk,
    pub account: Option<Account>,
    pub new_nonce: String,
}

/// A failed envelope still needs to hand the caller a fresh nonce
/// whenever one was minted before the failure, so the client can retry
/// without another `new-nonce` round trip.
pub struct EnvelopeError {
    pub error: AcmeError,
    pub new_nonce: Option<String>,
}

impl EnvelopeError {
    fn new(error: AcmeError, new_nonce: Option<String>) -> Self {
        Self { error, new_nonce }
    }
}

/// Verifies a flattened JWS per RFC 8555 §6.2-§6.4.
///
/// `called_url` is the absolute URL the request actually hit; it is
/// compared against `protected.url` ignoring scheme, to tolerate TLS
/// being terminated by a reverse proxy.
pub async fn verify(
    body: &JwsBody,
    called_url: &str,
    external_url: &str,
    store: &dyn Store,
    opts: &EnvelopeOptions,
) -> Result<RequestData, EnvelopeError> {
    let protected_bytes = URL_SAFE_NO_PAD.decode(&body.protected).map_err(|e| {
        EnvelopeError::new(
            AcmeError::Malformed(format!("invalid protected header encoding: {e}")),
            None,
        )
    })?;
    let protected: Protected = serde_json::from_slice(&protected_bytes).map_err(|e| {
        EnvelopeError::new(AcmeError::Malformed(format!("invalid protected header: {e}")), None)
    })?;

    if !ALLOWED_ALGS.contains(&protected.alg.as_str()) {
        return Err(EnvelopeError::new(
            AcmeError::BadSignatureAlgorithm(format!("unsupported alg: {}", protected.alg)),
            None,
        ));
    }

    if strip_scheme(&protected.url) != strip_scheme(called_url) {
        return Err(EnvelopeError::new(
            AcmeError::Malformed("protected url does not match request url".into()),
            None,
        ));
    }

    // The nonce is consumed before signature verification so that a
    // replayed nonce is rejected even if the attacker also has a valid
    // signature over stale content. From here on every error carries the
    // freshly minted replacement.
    let (nonce_valid, new_nonce) = crate::nonce::consume(store, &protected.nonce)
        .await
        .map_err(|e| EnvelopeError::new(AcmeError::from(e), None))?;
    if !nonce_valid {
        return Err(EnvelopeError::new(
            AcmeError::BadNonce("nonce unknown or already used".into()),
            Some(new_nonce),
        ));
    }

    let (key, account) = match (&protected.jwk, &protected.kid) {
        (Some(_), Some(_)) => {
            return Err(EnvelopeError::new(
                AcmeError::Malformed("exactly one of jwk or kid must be set".into()),
                Some(new_nonce),
            ));
        }
        (Some(jwk_value), None) => {
            if !opts.allow_new_account {
                return Err(EnvelopeError::new(
                    AcmeError::Malformed("this resource requires kid, not jwk".into()),
                    Some(new_nonce),
                ));
            }
            let key = Jwk::from_value(jwk_value).map_err(|e| {
                EnvelopeError::new(AcmeError::BadPublicKey(e.to_string()), Some(new_nonce.clone()))
            })?;
            (key, None)
        }
        (None, Some(kid)) => {
            let account_url_prefix = format!("{external_url}acme/accounts/");
            let account_id = kid.strip_prefix(&account_url_prefix).ok_or_else(|| {
                EnvelopeError::new(
                    AcmeError::Malformed("kid is not an account url on this server".into()),
                    Some(new_nonce.clone()),
                )
            })?;
            let account = store
                .get_account(account_id)
                .await
                .map_err(|e| EnvelopeError::new(AcmeError::from(e), Some(new_nonce.clone())))?
                .ok_or_else(|| {
                    EnvelopeError::new(
                        AcmeError::AccountDoesNotExist("unknown account".into()),
                        Some(new_nonce.clone()),
                    )
                })?;
            if account.status != AccountStatus::Valid && !opts.allow_blocked_account {
                return Err(EnvelopeError::new(
                    AcmeError::Unauthorized("account is not valid".into()),
                    Some(new_nonce),
                ));
            }
            let key = account.jwk.clone();
            (key, Some(account))
        }
        (None, None) => {
            return Err(EnvelopeError::new(
                AcmeError::Malformed("exactly one of jwk or kid must be set".into()),
                Some(new_nonce),
            ));
        }
    };

    let signing_input = format!("{}.{}", body.protected, body.payload);
    let signature = URL_SAFE_NO_PAD.decode(&body.signature).map_err(|e| {
        EnvelopeError::new(
            AcmeError::Malformed(format!("invalid signature encoding: {e}")),
            Some(new_nonce.clone()),
        )
    })?;
    key.verify(&protected.alg, signing_input.as_bytes(), &signature)
        .map_err(|e| EnvelopeError::new(AcmeError::Unauthorized(e.to_string()), Some(new_nonce.clone())))?;

    let payload = if body.payload.is_empty() {
        Value::Null
    } else {
        let payload_bytes = URL_SAFE_NO_PAD.decode(&body.payload).map_err(|e| {
            EnvelopeError::new(
                AcmeError::Malformed(format!("invalid payload encoding: {e}")),
                Some(new_nonce.clone()),
            )
        })?;
        serde_json::from_slice(&payload_bytes).map_err(|e| {
            EnvelopeError::new(
                AcmeError::Malformed(format!("invalid payload json: {e}")),
                Some(new_nonce.clone()),
            )
        })?
    };

    Ok(RequestData {
        payload,
        key,
        account,
        new_nonce,
    })
}

fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, rest)| rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_scheme_ignores_http_vs_https() {
        assert_eq!(
            strip_scheme("https://example.com/acme/new-order"),
            strip_scheme("http://example.com/acme/new-order")
        );
    }

    #[test]
    fn rejects_alg_none() {
        assert!(!ALLOWED_ALGS.contains(&"none"));
    }
}

use poem::http::StatusCode;
use poem::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// The closed set of ACME error kinds from RFC 8555 §6.7, plus the
/// `serverInternal` catch-all every implementation needs.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("{0}")]
    AccountDoesNotExist(String),
    #[error("{0}")]
    AlreadyRevoked(String),
    #[error("{0}")]
    BadCsr(String),
    #[error("{0}")]
    BadNonce(String),
    #[error("{0}")]
    BadPublicKey(String),
    #[error("{0}")]
    BadRevocationReason(String),
    #[error("{0}")]
    BadSignatureAlgorithm(String),
    #[error("{0}")]
    Compound(String),
    #[error("{0}")]
    Connection(String),
    #[error("{0}")]
    Dns(String),
    #[error("{0}")]
    ExternalAccountRequired(String),
    #[error("{0}")]
    IncorrectResponse(String),
    #[error("{0}")]
    InvalidContact(String),
    #[error("{0}")]
    Malformed(String),
    /// A `malformed`-typed error whose resource simply doesn't exist, so
    /// it carries 404 rather than `Malformed`'s 400 — RFC 8555 doesn't
    /// define a dedicated "not found" problem type, but the original
    /// implementation still answers unknown orders/authorizations/
    /// challenges/certificates with an HTTP 404.
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    OrderNotReady(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    RejectedIdentifier(String),
    #[error("{0}")]
    ServerInternal(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    UnsupportedContact(String),
    #[error("{0}")]
    UnsupportedIdentifier(String),
    #[error("{0}")]
    UserActionRequired(String),
}

impl AcmeError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AccountDoesNotExist(_) => "accountDoesNotExist",
            Self::AlreadyRevoked(_) => "alreadyRevoked",
            Self::BadCsr(_) => "badCSR",
            Self::BadNonce(_) => "badNonce",
            Self::BadPublicKey(_) => "badPublicKey",
            Self::BadRevocationReason(_) => "badRevocationReason",
            Self::BadSignatureAlgorithm(_) => "badSignatureAlgorithm",
            Self::Compound(_) => "compound",
            Self::Connection(_) => "connection",
            Self::Dns(_) => "dns",
            Self::ExternalAccountRequired(_) => "externalAccountRequired",
            Self::IncorrectResponse(_) => "incorrectResponse",
            Self::InvalidContact(_) => "invalidContact",
            Self::Malformed(_) => "malformed",
            Self::NotFound(_) => "malformed",
            Self::OrderNotReady(_) => "orderNotReady",
            Self::RateLimited(_) => "rateLimited",
            Self::RejectedIdentifier(_) => "rejectedIdentifier",
            Self::ServerInternal(_) => "serverInternal",
            Self::Unauthorized(_) => "unauthorized",
            Self::UnsupportedContact(_) => "unsupportedContact",
            Self::UnsupportedIdentifier(_) => "unsupportedIdentifier",
            Self::UserActionRequired(_) => "userActionRequired",
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AccountDoesNotExist(_) => StatusCode::BAD_REQUEST,
            Self::AlreadyRevoked(_) => StatusCode::BAD_REQUEST,
            Self::BadCsr(_) => StatusCode::BAD_REQUEST,
            Self::BadNonce(_) => StatusCode::BAD_REQUEST,
            Self::BadPublicKey(_) => StatusCode::BAD_REQUEST,
            Self::BadRevocationReason(_) => StatusCode::BAD_REQUEST,
            Self::BadSignatureAlgorithm(_) => StatusCode::BAD_REQUEST,
            Self::Compound(_) => StatusCode::BAD_REQUEST,
            Self::Connection(_) => StatusCode::BAD_REQUEST,
            Self::Dns(_) => StatusCode::BAD_REQUEST,
            Self::ExternalAccountRequired(_) => StatusCode::UNAUTHORIZED,
            Self::IncorrectResponse(_) => StatusCode::BAD_REQUEST,
            Self::InvalidContact(_) => StatusCode::BAD_REQUEST,
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::OrderNotReady(_) => StatusCode::FORBIDDEN,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::RejectedIdentifier(_) => StatusCode::BAD_REQUEST,
            Self::ServerInternal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::UnsupportedContact(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedIdentifier(_) => StatusCode::BAD_REQUEST,
            Self::UserActionRequired(_) => StatusCode::FORBIDDEN,
        }
    }

    #[must_use]
    pub fn detail(&self) -> String {
        self.to_string()
    }

    /// Builds the `application/problem+json` response, attaching a
    /// `Replay-Nonce` when the caller has one on hand (most call sites do,
    /// since the envelope verifier mints a replacement before dispatch).
    #[must_use]
    pub fn into_response_with_nonce(self, nonce: Option<&str>) -> Response {
        let body = ProblemBody {
            r#type: format!("urn:ietf:params:acme:error:{}", self.kind()),
            detail: self.detail(),
        };
        let mut resp = Response::builder()
            .status(self.status())
            .content_type("application/problem+json")
            .body(serde_json::to_vec(&body).unwrap_or_default());
        if let Some(nonce) = nonce {
            resp.headers_mut().insert(
                "Replay-Nonce",
                poem::http::HeaderValue::from_str(nonce).unwrap_or(poem::http::HeaderValue::from_static("")),
            );
        }
        resp
    }
}

#[derive(Serialize)]
struct ProblemBody {
    r#type: String,
    detail: String,
}

impl IntoResponse for AcmeError {
    fn into_response(self) -> Response {
        self.into_response_with_nonce(None)
    }
}

/// Any unexpected internal error (store failure, signing failure, ...) is
/// coerced into `serverInternal` at the HTTP boundary, the way the original
/// implementation's generic exception handler does.
impl From<anyhow::Error> for AcmeError {
    fn from(err: anyhow::Error) -> Self {
        Self::ServerInternal(err.to_string())
    }
}

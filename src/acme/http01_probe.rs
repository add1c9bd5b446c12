//! The outbound HTTP-01 verifier. This is the CA's side of the
//! challenge: it fetches the token the client is supposed to be serving,
//! not the other way around, so it deliberately disables everything a
//! well-behaved HTTP client would normally want (proxies, redirects,
//! HTTP/2) since the only thing being proven is "something answers on
//! port 80 for this exact token".

use std::time::Duration;

use reqwest::redirect::Policy;

use crate::store::model::ProblemDetail;

const ATTEMPTS: u32 = 3;
const RETRY_SLEEP: Duration = Duration::from_secs(3);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the probe client once at startup; reused across all
/// verifications.
#[must_use]
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(Policy::none())
        .timeout(PROBE_TIMEOUT)
        .http1_only()
        .build()
        .expect("probe client configuration is static and always valid")
}

/// Probes `domain` for `token`, retrying up to [`ATTEMPTS`] times with a
/// fixed sleep in between. Returns the classified problem detail of the
/// last attempt on failure.
pub async fn verify(client: &reqwest::Client, domain: &str, token: &str, expected_body: &str) -> Result<(), ProblemDetail> {
    let url = format!("http://{domain}/.well-known/acme-challenge/{token}");
    let mut last_error = ProblemDetail::new("serverInternal", "probe never ran");

    for attempt in 1..=ATTEMPTS {
        match attempt_once(client, &url, expected_body).await {
            Ok(()) => return Ok(()),
            Err(err) => last_error = err,
        }
        if attempt < ATTEMPTS {
            tokio::time::sleep(RETRY_SLEEP).await;
        }
    }
    Err(last_error)
}

async fn attempt_once(client: &reqwest::Client, url: &str, expected_body: &str) -> Result<(), ProblemDetail> {
    let response = client.get(url).send().await.map_err(classify_request_error)?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(ProblemDetail::new(
            "incorrectResponse",
            format!("challenge endpoint returned status {}", response.status()),
        ));
    }
    let body = response.text().await.map_err(classify_request_error)?;
    if body.trim_end() == expected_body {
        Ok(())
    } else {
        Err(ProblemDetail::new("incorrectResponse", "challenge response body did not match"))
    }
}

fn classify_request_error(err: reqwest::Error) -> ProblemDetail {
    if err.is_timeout() {
        ProblemDetail::new("connection", "timed out waiting for challenge response")
    } else if err.is_connect() {
        ProblemDetail::new("dns", "could not resolve or connect to challenge endpoint")
    } else {
        ProblemDetail::new("serverInternal", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn verify_succeeds_on_matching_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/acme-challenge/tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("tok-1.thumb"))
            .mount(&server)
            .await;

        let client = build_client();
        let domain = server.address().to_string();
        verify(&client, &domain, "tok-1", "tok-1.thumb").await.unwrap();
    }

    #[tokio::test]
    async fn verify_reports_incorrect_response_on_body_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/acme-challenge/tok-2"))
            .respond_with(ResponseTemplate::new(200).set_body_string("wrong-body"))
            .mount(&server)
            .await;

        let client = build_client();
        let domain = server.address().to_string();
        let err = verify(&client, &domain, "tok-2", "tok-2.thumb").await.unwrap_err();
        assert_eq!(err.r#type, "urn:ietf:params:acme:error:incorrectResponse");
    }

    #[tokio::test]
    async fn verify_reports_dns_error_for_unroutable_host() {
        let client = build_client();
        let err = verify(&client, "127.0.0.1:1", "tok-3", "tok-3.thumb").await.unwrap_err();
        assert_eq!(err.r#type, "urn:ietf:params:acme:error:dns");
    }
}

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::model::Provider;

const MAX_ERROR_BODY: usize = 300;

/// Shared HTTP client for every adapter and the token endpoint.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("inboxsync/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))
}

pub(crate) async fn send(provider: Provider, req: RequestBuilder) -> Result<Response> {
    req.send().await.map_err(|e| Error::transport(provider, e))
}

/// `Retry-After` in seconds. HTTP-date values are ignored.
pub(crate) fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) fn status_error(
    provider: Provider,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> Error {
    match status {
        StatusCode::UNAUTHORIZED => Error::TokenInvalid { provider },
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited {
            provider,
            retry_after,
        },
        s if s.is_server_error() => Error::ProviderUnavailable {
            provider,
            message: format!("{s}: {}", truncate(body)),
        },
        s => Error::Api {
            provider,
            status: s.as_u16(),
            message: truncate(body),
        },
    }
}

/// Pass successful responses through, map the rest onto the error taxonomy.
pub(crate) async fn check_status(provider: Provider, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let after = retry_after(&resp);
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(provider, status, after, &body))
}

pub(crate) async fn read_json<T: DeserializeOwned>(provider: Provider, resp: Response) -> Result<T> {
    let resp = check_status(provider, resp).await?;
    resp.json::<T>()
        .await
        .map_err(|e| Error::transport(provider, e))
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}…", &body[..idx]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let p = Provider::Mail;
        assert!(matches!(
            status_error(p, StatusCode::UNAUTHORIZED, None, ""),
            Error::TokenInvalid { .. }
        ));
        match status_error(p, StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), "") {
            Error::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(status_error(p, StatusCode::BAD_GATEWAY, None, "").is_retryable());
        match status_error(p, StatusCode::FORBIDDEN, None, "nope") {
            Error::Api { status, message, .. } => {
                assert_eq!(status, 403);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_truncate_long_bodies() {
        let long = "x".repeat(1000);
        assert_eq!(truncate(&long).chars().count(), MAX_ERROR_BODY + 1);
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use super::{ProbeOutcome, RefreshFailure, TokenAuthority};
use crate::config::OAuthClientConfig;
use crate::error::{Error, Result};
use crate::model::{Credential, Provider, TokenGrant};
use crate::providers::ProviderSet;

/// Error codes meaning the grant is gone for good.
const REVOKED_CODES: &[&str] = &[
    "invalid_grant",
    "invalid_refresh_token",
    "token_revoked",
];

#[derive(Debug, Deserialize)]
struct TokenResponse {
    ok: Option<bool>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    /// A string for RFC 6749 endpoints and the chat API, an object for Graph.
    error: Option<Value>,
    error_description: Option<String>,
}

impl TokenResponse {
    fn error_code(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::String(code) => Some(code.clone()),
            Value::Object(obj) => match obj.get("code").and_then(Value::as_i64) {
                Some(190) => Some("invalid_grant".into()),
                Some(code) => Some(code.to_string()),
                None => Some("unknown_error".into()),
            },
            _ => Some("unknown_error".into()),
        }
    }
}

/// Exchanges refresh tokens at each provider's token endpoint.
#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    clients: HashMap<Provider, OAuthClientConfig>,
}

impl OAuthClient {
    pub fn new(http: Client, clients: HashMap<Provider, OAuthClientConfig>) -> Self {
        Self { http, clients }
    }

    pub async fn refresh_access_token(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, RefreshFailure> {
        let config = self.clients.get(&provider).ok_or_else(|| {
            RefreshFailure::Transient(format!("no OAuth client configured for {provider}"))
        })?;

        log::info!("Refreshing OAuth tokens for {provider}");

        // Graph long-lived tokens are re-exchanged rather than refreshed.
        let mut form: Vec<(&str, &str)> = if provider.is_social_graph() {
            vec![
                ("grant_type", "fb_exchange_token"),
                ("fb_exchange_token", refresh_token),
            ]
        } else {
            vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ]
        };
        form.push(("client_id", config.client_id.as_str()));
        if let Some(secret) = &config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let resp = self
            .http
            .post(&config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshFailure::Transient(e.to_string()))?;
        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(RefreshFailure::Transient(format!("token endpoint returned {status}")));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RefreshFailure::Transient(format!("unreadable token response: {e}")))?;

        if let Some(code) = body.error_code().filter(|_| body.ok != Some(true)) {
            let detail = body.error_description.clone().unwrap_or_default();
            return Err(if REVOKED_CODES.contains(&code.as_str()) {
                RefreshFailure::Revoked(code)
            } else {
                RefreshFailure::Transient(format!("{code} {detail}").trim().to_string())
            });
        }
        if body.ok == Some(false) || !status.is_success() {
            return Err(RefreshFailure::Transient(format!("token endpoint returned {status}")));
        }

        let access_token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RefreshFailure::Transient("token response without access_token".into()))?;
        Ok(TokenGrant {
            access_token,
            refresh_token: body.refresh_token.filter(|t| !t.is_empty()),
            expires_in: body.expires_in,
        })
    }
}

/// Probes with the adapters' whoami call and refreshes through `OAuthClient`.
pub struct HttpAuthority {
    oauth: OAuthClient,
    providers: ProviderSet,
}

impl HttpAuthority {
    pub fn new(oauth: OAuthClient, providers: ProviderSet) -> Self {
        Self { oauth, providers }
    }
}

#[async_trait]
impl TokenAuthority for HttpAuthority {
    async fn probe(&self, cred: &Credential) -> Result<ProbeOutcome> {
        let api = self.providers.api(cred.provider)?;
        match api.whoami(cred).await {
            Ok(_) => Ok(ProbeOutcome::Valid),
            Err(Error::TokenInvalid { .. }) => Ok(ProbeOutcome::Invalid),
            Err(e) => Err(e),
        }
    }

    async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, RefreshFailure> {
        self.oauth.refresh_access_token(provider, refresh_token).await
    }
}

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::model::Provider;

#[derive(Debug, Error)]
pub enum Error {
    /// The user never connected this provider.
    #[error("no {provider} credential for user {user_id}")]
    NoCredential { user_id: String, provider: Provider },

    /// Refresh was exhausted or the grant was revoked; the user has to reconnect.
    #[error("{provider} authorization for user {user_id} must be renewed")]
    ReauthRequired { user_id: String, provider: Provider },

    /// The provider rejected the access token on a call. Handled by the
    /// gateway (invalidate, refresh once); never surfaced as-is.
    #[error("{provider} rejected the access token")]
    TokenInvalid { provider: Provider },

    #[error("{provider} rate limited the request")]
    RateLimited {
        provider: Provider,
        retry_after: Option<Duration>,
    },

    /// The stored sync cursor is too old or unknown to the provider.
    #[error("{provider} rejected the sync cursor")]
    CursorInvalid { provider: Provider },

    #[error("{provider} unavailable: {message}")]
    ProviderUnavailable { provider: Provider, message: String },

    #[error("{provider} API error ({status}): {message}")]
    Api {
        provider: Provider,
        status: u16,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Payload error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Webhook rejected: {0}")]
    Webhook(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a caller may retry the same call after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::ProviderUnavailable { .. }
        )
    }

    /// The provider this error is attributed to, if any.
    pub fn provider(&self) -> Option<Provider> {
        match self {
            Error::NoCredential { provider, .. }
            | Error::ReauthRequired { provider, .. }
            | Error::TokenInvalid { provider }
            | Error::RateLimited { provider, .. }
            | Error::CursorInvalid { provider }
            | Error::ProviderUnavailable { provider, .. }
            | Error::Api { provider, .. } => Some(*provider),
            _ => None,
        }
    }

    /// Short text for the inbox surface.
    pub fn user_message(&self) -> String {
        match self {
            Error::NoCredential { provider, .. } => format!("Please connect {provider}."),
            Error::ReauthRequired { provider, .. } => format!("Please reconnect {provider}."),
            Error::RateLimited { provider, .. } | Error::ProviderUnavailable { provider, .. } => {
                format!("{provider} is temporarily unavailable.")
            }
            other => other.to_string(),
        }
    }

    pub(crate) fn transport(provider: Provider, e: reqwest::Error) -> Self {
        if e.is_decode() {
            Error::Parse(format!("{provider}: {e}"))
        } else {
            Error::ProviderUnavailable {
                provider,
                message: e.to_string(),
            }
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

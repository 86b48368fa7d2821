//! Token lifecycle: validate before use, refresh on failure, keep the
//! credential store and the in-process mirror consistent.

pub mod oauth;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{Credential, Provider, TokenGrant};
use crate::storage::{repository, Database};

pub use oauth::{HttpAuthority, OAuthClient};

const EXPIRY_SKEW_MINUTES: i64 = 5;

/// Result of a cheap "whoami" call with a stored access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Valid,
    Invalid,
}

/// Why a refresh did not produce new tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    /// The grant is gone (`invalid_grant` and friends). The credential is
    /// deleted.
    Revoked(String),
    /// Network or server trouble. The credential is kept.
    Transient(String),
}

impl std::fmt::Display for RefreshFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefreshFailure::Revoked(reason) => write!(f, "grant revoked: {reason}"),
            RefreshFailure::Transient(reason) => write!(f, "refresh failed: {reason}"),
        }
    }
}

/// Provider-facing half of the token lifecycle.
#[async_trait]
pub trait TokenAuthority: Send + Sync {
    async fn probe(&self, cred: &Credential) -> Result<ProbeOutcome>;

    async fn refresh(
        &self,
        provider: Provider,
        refresh_token: &str,
    ) -> std::result::Result<TokenGrant, RefreshFailure>;
}

type Key = (String, Provider);

struct MirrorEntry {
    cred: Credential,
    validated_at: Instant,
}

/// Serializes refreshes for one key and remembers the last failed attempt,
/// so callers that queued behind it share its outcome.
#[derive(Default)]
struct RefreshSlot {
    failed: Option<FailedRefresh>,
}

struct FailedRefresh {
    access_token: String,
    at: Instant,
}

/// Hands out valid credentials. Clones share the mirror and refresh locks.
#[derive(Clone)]
pub struct TokenManager {
    db: Database,
    authority: Arc<dyn TokenAuthority>,
    mirror: Arc<Mutex<HashMap<Key, MirrorEntry>>>,
    refresh_locks: Arc<Mutex<HashMap<Key, Arc<Mutex<RefreshSlot>>>>>,
    probe_ttl: Duration,
    expiry_skew: chrono::Duration,
}

impl TokenManager {
    pub fn new(db: Database, authority: Arc<dyn TokenAuthority>, probe_ttl: Duration) -> Self {
        Self {
            db,
            authority,
            mirror: Arc::new(Mutex::new(HashMap::new())),
            refresh_locks: Arc::new(Mutex::new(HashMap::new())),
            probe_ttl,
            expiry_skew: chrono::Duration::minutes(EXPIRY_SKEW_MINUTES),
        }
    }

    /// Return a credential whose access token the provider accepts, or
    /// `NoCredential` / `ReauthRequired`.
    pub async fn get_valid_token(&self, user_id: &str, provider: Provider) -> Result<Credential> {
        let key: Key = (user_id.to_string(), provider);
        if let Some(cred) = self.mirrored(&key).await {
            return Ok(cred);
        }

        let cred = self
            .load(user_id, provider)
            .await?
            .ok_or_else(|| Error::NoCredential {
                user_id: user_id.to_string(),
                provider,
            })?;

        if cred.expires_within(self.expiry_skew, Utc::now()) {
            log::debug!(
                "{provider} token <{}> for {user_id} is expiring, refreshing",
                cred.fingerprint()
            );
        } else {
            match self.authority.probe(&cred).await? {
                ProbeOutcome::Valid => {
                    self.remember(key, cred.clone()).await;
                    return Ok(cred);
                }
                ProbeOutcome::Invalid => {
                    log::info!(
                        "{provider} token <{}> for {user_id} failed probe, refreshing",
                        cred.fingerprint()
                    );
                }
            }
        }

        self.refresh(key, &cred).await
    }

    /// Forget the mirrored credential so the next `get_valid_token` probes
    /// again. Called when a provider rejects a token mid-operation.
    pub async fn invalidate(&self, user_id: &str, provider: Provider) {
        self.mirror
            .lock()
            .await
            .remove(&(user_id.to_string(), provider));
    }

    async fn refresh(&self, key: Key, stale: &Credential) -> Result<Credential> {
        let (user_id, provider) = key.clone();
        let queued_at = Instant::now();
        let lock = self.refresh_lock(&key).await;
        let mut slot = lock.lock().await;

        let reauth = || Error::ReauthRequired {
            user_id: user_id.clone(),
            provider,
        };

        // Another caller may have refreshed (or revoked) while we waited.
        let current = self.load(&user_id, provider).await?.ok_or_else(reauth)?;
        if current.access_token != stale.access_token {
            log::debug!("{provider} token for {user_id} was refreshed concurrently");
            self.remember(key, current.clone()).await;
            return Ok(current);
        }
        // A refresh of this same token failed while we waited.
        if let Some(failed) = &slot.failed {
            if failed.at >= queued_at && failed.access_token == current.access_token {
                log::debug!("{provider} refresh for {user_id} already failed, not retrying");
                return Err(reauth());
            }
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            log::warn!("{provider} credential for {user_id} has no refresh token");
            return Err(reauth());
        };

        match self.authority.refresh(provider, &refresh_token).await {
            Ok(grant) => {
                let expires_at = grant
                    .expires_in
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
                let stored = self
                    .db
                    .writer()
                    .call({
                        let user_id = user_id.clone();
                        let access = grant.access_token.clone();
                        let refresh = grant.refresh_token.clone();
                        let expires_ms = expires_at.map(|t| t.timestamp_millis());
                        move |conn| {
                            let tx = conn.transaction()?;
                            let changed = repository::update_credential_tokens(
                                &tx,
                                &user_id,
                                provider,
                                &access,
                                refresh.as_deref(),
                                expires_ms,
                            )?;
                            tx.commit()?;
                            Ok::<bool, rusqlite::Error>(changed)
                        }
                    })
                    .await?;
                if !stored {
                    // Disconnected while the refresh was in flight.
                    return Err(reauth());
                }

                let fresh = Credential {
                    access_token: grant.access_token,
                    refresh_token: grant.refresh_token.or(current.refresh_token.clone()),
                    expires_at,
                    ..current
                };
                log::info!(
                    "Refreshed {provider} token for {user_id}, now <{}>",
                    fresh.fingerprint()
                );
                slot.failed = None;
                self.remember(key, fresh.clone()).await;
                Ok(fresh)
            }
            Err(RefreshFailure::Revoked(reason)) => {
                log::warn!("{provider} grant for {user_id} revoked ({reason}), removing credential");
                self.db
                    .writer()
                    .call({
                        let user_id = user_id.clone();
                        move |conn| repository::delete_credential(conn, &user_id, provider)
                    })
                    .await?;
                self.mirror.lock().await.remove(&key);
                Err(reauth())
            }
            Err(RefreshFailure::Transient(reason)) => {
                log::warn!("{provider} refresh for {user_id} failed: {reason}");
                slot.failed = Some(FailedRefresh {
                    access_token: current.access_token.clone(),
                    at: Instant::now(),
                });
                self.mirror.lock().await.remove(&key);
                Err(reauth())
            }
        }
    }

    async fn mirrored(&self, key: &Key) -> Option<Credential> {
        let mirror = self.mirror.lock().await;
        let entry = mirror.get(key)?;
        let fresh = entry.validated_at.elapsed() < self.probe_ttl
            && !entry.cred.expires_within(self.expiry_skew, Utc::now());
        fresh.then(|| entry.cred.clone())
    }

    async fn remember(&self, key: Key, cred: Credential) {
        self.mirror.lock().await.insert(
            key,
            MirrorEntry {
                cred,
                validated_at: Instant::now(),
            },
        );
    }

    async fn refresh_lock(&self, key: &Key) -> Arc<Mutex<RefreshSlot>> {
        self.refresh_locks
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    async fn load(&self, user_id: &str, provider: Provider) -> Result<Option<Credential>> {
        let cred = self
            .db
            .reader()
            .call({
                let user_id = user_id.to_string();
                move |conn| repository::get_credential(conn, &user_id, provider)
            })
            .await?;
        Ok(cred)
    }
}

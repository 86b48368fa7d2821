//! Provider adapters. Each adapter maps one back-end's REST surface onto the
//! uniform conversation and message types; provider field names stop here.

pub mod chat;
#[cfg(test)]
pub(crate) mod fake;
pub mod http;
pub mod mail;
pub mod social;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::auth::TokenManager;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::model::{
    ConversationSnapshot, Credential, Message, MessagePage, Provider, SendReceipt, SendTarget,
    SyncCursor,
};
use crate::sync::rate_limit::{backoff_sleep, ProviderLimiter, RetryPolicy};

pub use chat::ChatAdapter;
pub use mail::MailAdapter;
pub use social::GraphAdapter;

/// Operations every provider supports.
#[async_trait]
pub trait InboxApi: Send + Sync {
    fn provider(&self) -> Provider;

    /// Cheap identity call. Returns the provider-side account reference.
    async fn whoami(&self, cred: &Credential) -> Result<String>;

    async fn list_conversations(&self, cred: &Credential) -> Result<Vec<ConversationSnapshot>>;

    /// Newest page first when `cursor` is `None`; `next_cursor` walks back.
    async fn messages(
        &self,
        cred: &Credential,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> Result<MessagePage>;

    async fn send(&self, cred: &Credential, target: &SendTarget, text: &str)
        -> Result<SendReceipt>;

    async fn mark_read(
        &self,
        cred: &Credential,
        conversation_id: &str,
        up_to: DateTime<Utc>,
    ) -> Result<()>;
}

/// One change reported by a change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Provider ordering key (history id, update time in millis).
    pub sequence: u64,
    pub message_id: String,
    pub conversation_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
    pub next_cursor: SyncCursor,
}

/// Recent messages plus the cursor captured before they were listed.
#[derive(Debug, Clone, PartialEq)]
pub struct Bootstrap {
    pub messages: Vec<Message>,
    pub cursor: SyncCursor,
}

/// Providers with a "changes since cursor" primitive.
#[async_trait]
pub trait ChangeFeed: InboxApi {
    async fn current_cursor(&self, cred: &Credential) -> Result<SyncCursor>;

    /// `Err(Error::CursorInvalid)` when the provider no longer knows `cursor`.
    async fn changes_since(&self, cred: &Credential, cursor: &SyncCursor) -> Result<ChangeSet>;

    /// Fetch the concrete message. `None` when it vanished in between.
    async fn resolve(&self, cred: &Credential, change: &Change) -> Result<Option<Message>>;

    async fn bootstrap(&self, cred: &Credential, limit: usize) -> Result<Bootstrap>;
}

// ── Registry ───────────────────────────────────────────────────────

/// The adapters in use, keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderSet {
    apis: HashMap<Provider, Arc<dyn InboxApi>>,
    feeds: HashMap<Provider, Arc<dyn ChangeFeed>>,
}

impl ProviderSet {
    /// The HTTP adapters for every provider.
    pub fn from_settings(settings: &Settings, client: reqwest::Client) -> Self {
        Self::default()
            .with_feed(Arc::new(MailAdapter::new(
                client.clone(),
                &settings.mail_api_base,
            )))
            .with_api(Arc::new(ChatAdapter::new(
                client.clone(),
                &settings.chat_api_base,
            )))
            .with_feed(Arc::new(GraphAdapter::new(
                client.clone(),
                &settings.graph_api_base,
                Provider::Messenger,
            )))
            .with_feed(Arc::new(GraphAdapter::new(
                client,
                &settings.graph_api_base,
                Provider::Instagram,
            )))
    }

    pub fn with_api<T: InboxApi + 'static>(mut self, api: Arc<T>) -> Self {
        self.feeds.remove(&api.provider());
        self.apis.insert(api.provider(), api);
        self
    }

    pub fn with_feed<T: ChangeFeed + 'static>(mut self, feed: Arc<T>) -> Self {
        self.apis.insert(feed.provider(), feed.clone());
        self.feeds.insert(feed.provider(), feed);
        self
    }

    pub fn api(&self, provider: Provider) -> Result<Arc<dyn InboxApi>> {
        self.apis
            .get(&provider)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no adapter registered for {provider}")))
    }

    pub fn feed(&self, provider: Provider) -> Option<Arc<dyn ChangeFeed>> {
        self.feeds.get(&provider).cloned()
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut out: Vec<Provider> = self.apis.keys().copied().collect();
        out.sort();
        out
    }
}

// ── Gateway ────────────────────────────────────────────────────────

/// Runs provider calls with a valid token, a concurrency permit and the
/// retry policy.
#[derive(Clone)]
pub struct Gateway {
    tokens: TokenManager,
    limiter: ProviderLimiter,
    retry: RetryPolicy,
}

impl Gateway {
    pub fn new(tokens: TokenManager, limiter: ProviderLimiter, retry: RetryPolicy) -> Self {
        Self {
            tokens,
            limiter,
            retry,
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Call `op` with a valid credential. A rejected token is invalidated
    /// and refreshed once; a second rejection means re-authentication.
    /// Rate limits and outages are retried with backoff.
    pub async fn call<T, F, Fut>(&self, user_id: &str, provider: Provider, op: F) -> Result<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(user_id, provider, op, true).await
    }

    /// Like [`Gateway::call`] for writes that must not happen twice. Only
    /// answers that prove the provider did nothing (a rejected token, a rate
    /// limit) are retried; an outage or timeout is returned as is.
    pub async fn call_at_most_once<T, F, Fut>(
        &self,
        user_id: &str,
        provider: Provider,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(user_id, provider, op, false).await
    }

    async fn run<T, F, Fut>(
        &self,
        user_id: &str,
        provider: Provider,
        mut op: F,
        repeatable: bool,
    ) -> Result<T>
    where
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut token_retried = false;
        let mut attempt: u32 = 0;
        loop {
            let cred = self.tokens.get_valid_token(user_id, provider).await?;
            let result = {
                let _permit = self.limiter.acquire(provider).await?;
                op(cred).await
            };
            match result {
                Ok(v) => return Ok(v),
                Err(Error::TokenInvalid { .. }) if !token_retried => {
                    log::info!("{provider} rejected token for {user_id}, refreshing once");
                    self.tokens.invalidate(user_id, provider).await;
                    token_retried = true;
                }
                Err(Error::TokenInvalid { .. }) => {
                    self.tokens.invalidate(user_id, provider).await;
                    return Err(Error::ReauthRequired {
                        user_id: user_id.to_string(),
                        provider,
                    });
                }
                Err(e)
                    if (repeatable || matches!(e, Error::RateLimited { .. }))
                        && self.retry.should_retry(attempt, &e) =>
                {
                    backoff_sleep(&self.retry, attempt, &e).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

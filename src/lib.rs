pub mod auth;
pub mod config;
pub mod error;
pub mod model;
pub mod providers;
pub mod reconcile;
pub mod storage;
pub mod sync;
pub mod time_util;
pub mod webhook;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;

pub use config::Settings;
pub use error::{Error, Result};
pub use model::{
    Conversation, Credential, DeliveryState, Direction, Message, Page, Provider, SendTarget,
};
pub use storage::Database;
pub use sync::{SyncOptions, SyncReport, SyncStatus};

use auth::{HttpAuthority, OAuthClient, TokenAuthority, TokenManager};
use providers::{Gateway, ProviderSet};
use reconcile::{mark_failed, new_temp_id};
use storage::repository;
use sync::dispatcher::{DispatcherHandle, SyncDispatcher};
use sync::incremental::IncrementalSync;
use sync::polling::{ConversationPager, Poller, PollerHandle, PollingEngine};
use sync::rate_limit::{ProviderLimiter, RetryPolicy};
use webhook::{WebhookHandler, WebhookServer};

const SIGNAL_QUEUE: usize = 256;

/// Conversations across providers, plus the providers that could not be
/// listed. A failing provider never hides the others.
#[derive(Debug, Clone, Serialize)]
pub struct InboxView {
    pub conversations: Vec<Conversation>,
    pub failures: Vec<ProviderFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderFailure {
    pub provider: Provider,
    pub message: String,
}

/// The optimistic message created by a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    pub temp_id: String,
    pub conversation_id: String,
    pub state: DeliveryState,
    pub error: Option<String>,
}

/// Main entry point: owns the database, token manager, adapters and
/// limiter.
pub struct InboxSync {
    db: Database,
    settings: Settings,
    providers: ProviderSet,
    gateway: Gateway,
    engine: PollingEngine,
    sync: IncrementalSync,
}

impl InboxSync {
    /// Settings from the environment and `app_config`, HTTP adapters for
    /// every provider.
    pub async fn open(db: Database) -> Result<Self> {
        let mut settings = Settings::from_env()?;
        settings.overlay_db(&db).await?;
        Self::open_with(db, settings).await
    }

    /// HTTP adapters for every provider, configured by `settings`.
    pub async fn open_with(db: Database, settings: Settings) -> Result<Self> {
        let client = providers::http::build_client(settings.http_timeout)?;
        let providers = ProviderSet::from_settings(&settings, client.clone());
        let authority = HttpAuthority::new(
            OAuthClient::new(client, settings.oauth.clone()),
            providers.clone(),
        );
        Ok(Self::new(db, settings, providers, Arc::new(authority)))
    }

    pub fn new(
        db: Database,
        settings: Settings,
        providers: ProviderSet,
        authority: Arc<dyn TokenAuthority>,
    ) -> Self {
        Self::with_retry(db, settings, providers, authority, RetryPolicy::default())
    }

    pub fn with_retry(
        db: Database,
        settings: Settings,
        providers: ProviderSet,
        authority: Arc<dyn TokenAuthority>,
        retry: RetryPolicy,
    ) -> Self {
        let tokens = TokenManager::new(db.clone(), authority, settings.probe_ttl);
        let gateway = Gateway::new(tokens, ProviderLimiter::new(settings.max_in_flight), retry);
        let engine = PollingEngine::new(
            db.clone(),
            gateway.clone(),
            providers.clone(),
            settings.echo_window,
        );
        let sync = IncrementalSync::new(
            db.clone(),
            gateway.clone(),
            SyncOptions {
                bootstrap_limit: settings.bootstrap_limit,
                concurrency: settings.max_in_flight,
            },
            settings.echo_window,
        );
        Self {
            db,
            settings,
            providers,
            gateway,
            engine,
            sync,
        }
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn tokens(&self) -> &TokenManager {
        self.gateway.tokens()
    }

    // ── Inbox surface ──────────────────────────────────────────────

    /// Send `text` and return the temporary message standing in for it
    /// until the provider's copy arrives. A rejected send is returned with
    /// state `failed`; a missing or dead credential is an error.
    pub async fn send_message(
        &self,
        user_id: &str,
        provider: Provider,
        target: SendTarget,
        text: &str,
    ) -> Result<SentMessage> {
        let cred = self.tokens().get_valid_token(user_id, provider).await?;
        let api = self.providers.api(provider)?;

        let now = Utc::now();
        let placeholder_conversation = match &target {
            SendTarget::Conversation(id) | SendTarget::Recipient(id) => id.clone(),
        };
        let mut temp = Message {
            id: new_temp_id(now),
            provider,
            conversation_id: placeholder_conversation,
            sender_ref: cred.metadata.account_ref.clone().unwrap_or_else(|| "me".into()),
            content: text.to_string(),
            timestamp: now,
            direction: Direction::Outgoing,
            delivery_state: DeliveryState::Sending,
        };
        self.save_temp(user_id, &temp, None).await?;

        let sent = {
            let api = &api;
            let target = &target;
            self.gateway
                .call_at_most_once(user_id, provider, |cred| async move {
                    api.send(&cred, target, text).await
                })
                .await
        };

        match sent {
            Ok(receipt) => {
                if receipt.conversation_id != temp.conversation_id {
                    let previous = std::mem::replace(
                        &mut temp.conversation_id,
                        receipt.conversation_id.clone(),
                    );
                    self.save_temp(user_id, &temp, Some(previous)).await?;
                }
                log::info!(
                    "Sent {provider} message {} in {}",
                    temp.id,
                    temp.conversation_id
                );
                Ok(SentMessage {
                    temp_id: temp.id,
                    conversation_id: temp.conversation_id,
                    state: DeliveryState::Sending,
                    error: None,
                })
            }
            Err(e @ Error::ProviderUnavailable { .. }) => {
                // The provider may have taken it; the echo settles it either way.
                log::warn!("{provider} send for {user_id} is unconfirmed: {e}");
                Ok(SentMessage {
                    temp_id: temp.id,
                    conversation_id: temp.conversation_id,
                    state: temp.delivery_state,
                    error: Some(e.user_message()),
                })
            }
            Err(e) => {
                log::warn!("{provider} send for {user_id} failed: {e}");
                mark_failed(&mut temp);
                self.save_temp(user_id, &temp, None).await?;
                Ok(SentMessage {
                    temp_id: temp.id,
                    conversation_id: temp.conversation_id,
                    state: temp.delivery_state,
                    error: Some(e.user_message()),
                })
            }
        }
    }

    /// Write a temporary message, removing it from `moved_from` first.
    async fn save_temp(
        &self,
        user_id: &str,
        temp: &Message,
        moved_from: Option<String>,
    ) -> Result<()> {
        self.db
            .writer()
            .call({
                let user_id = user_id.to_string();
                let temp = temp.clone();
                move |conn| {
                    let tx = conn.transaction()?;
                    if let Some(previous) = &moved_from {
                        repository::delete_message(&tx, &user_id, temp.provider, previous, &temp.id)?;
                    }
                    repository::upsert_message(&tx, &user_id, &temp, true)?;
                    tx.commit()?;
                    Ok::<_, rusqlite::Error>(())
                }
            })
            .await?;
        Ok(())
    }

    /// Move the provider's read marker for a conversation to `up_to`.
    pub async fn mark_read(
        &self,
        user_id: &str,
        provider: Provider,
        conversation_id: &str,
        up_to: DateTime<Utc>,
    ) -> Result<()> {
        let api = self.providers.api(provider)?;
        let api = &api;
        self.gateway
            .call(user_id, provider, |cred| async move {
                api.mark_read(&cred, conversation_id, up_to).await
            })
            .await?;
        log::info!("Marked {provider} conversation {conversation_id} read up to {up_to}");
        Ok(())
    }

    /// Conversations of one provider, or of every provider the user
    /// connected, newest first.
    pub async fn get_conversations(
        &self,
        user_id: &str,
        provider: Option<Provider>,
    ) -> Result<InboxView> {
        let targets = match provider {
            Some(p) => vec![p],
            None => self.connected_providers(user_id).await?,
        };

        let results = join_all(
            targets
                .iter()
                .map(|p| self.engine.list_conversations(user_id, *p)),
        )
        .await;

        let mut conversations = Vec::new();
        let mut failures = Vec::new();
        for (provider, result) in targets.into_iter().zip(results) {
            match result {
                Ok(list) => conversations.extend(list),
                Err(e) => {
                    log::warn!("Listing {provider} conversations for {user_id} failed: {e}");
                    failures.push(ProviderFailure {
                        provider,
                        message: e.user_message(),
                    });
                }
            }
        }
        conversations.sort_by(|a, b| {
            (b.last_message_timestamp, &a.id).cmp(&(a.last_message_timestamp, &b.id))
        });
        Ok(InboxView {
            conversations,
            failures,
        })
    }

    pub async fn get_messages(
        &self,
        user_id: &str,
        provider: Provider,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<Message>> {
        self.engine
            .get_messages(user_id, provider, conversation_id, cursor)
            .await
    }

    /// Up to `max_pages` pages of a conversation, oldest first.
    pub async fn get_history(
        &self,
        user_id: &str,
        provider: Provider,
        conversation_id: &str,
        max_pages: usize,
    ) -> Result<Vec<Message>> {
        let mut pager = ConversationPager::new();
        let mut messages = Vec::new();
        for _ in 0..max_pages {
            let page = self
                .engine
                .get_messages(user_id, provider, conversation_id, pager.cursor())
                .await?;
            messages.extend(pager.absorb(model::MessagePage {
                messages: page.items,
                next_cursor: page.next_cursor,
                last_read: None,
            }));
            if pager.is_done() {
                break;
            }
        }
        messages.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(messages)
    }

    // ── Sync ───────────────────────────────────────────────────────

    /// Bring one user's provider up to date: incremental for change-feed
    /// providers, a poll otherwise.
    pub async fn sync(&self, user_id: &str, provider: Provider) -> Result<SyncReport> {
        match self.providers.feed(provider) {
            Some(feed) => self.sync.run(&feed, user_id, None).await,
            None => self.engine.poll_user(user_id, provider, None).await,
        }
    }

    /// Sync every connected provider of one user.
    pub async fn sync_user(&self, user_id: &str) -> Result<Vec<SyncReport>> {
        let mut reports = Vec::new();
        for provider in self.connected_providers(user_id).await? {
            let report = self.sync(user_id, provider).await.unwrap_or_else(|e| {
                log::warn!("{provider} sync for {user_id} failed: {e}");
                SyncReport::failed(
                    user_id,
                    provider,
                    sync::SyncPhase::Fetching,
                    e.user_message(),
                )
            });
            reports.push(report);
        }
        Ok(reports)
    }

    /// One poll cycle over every user and provider.
    pub async fn poll_once(&self) -> Vec<SyncReport> {
        self.poller().run_cycle().await
    }

    fn poller(&self) -> Poller {
        Poller::new(
            self.db.clone(),
            self.engine.clone(),
            self.sync.clone(),
            self.settings.poll_interval,
        )
    }

    async fn connected_providers(&self, user_id: &str) -> Result<Vec<Provider>> {
        let creds = self
            .db
            .reader()
            .call(|conn| repository::list_credentials(conn))
            .await?;
        let mut providers: Vec<Provider> = creds
            .into_iter()
            .filter(|c| c.user_id == user_id)
            .map(|c| c.provider)
            .filter(|p| self.providers.api(*p).is_ok())
            .collect();
        providers.sort();
        providers.dedup();
        Ok(providers)
    }

    // ── Background services ────────────────────────────────────────

    /// Start the poller, the sync dispatcher and the webhook server.
    pub async fn start(&self) -> Result<Services> {
        let dispatcher = SyncDispatcher::new(self.sync.clone(), self.providers.clone());
        let (signals, dispatcher) = dispatcher.start(SIGNAL_QUEUE);
        let handler = WebhookHandler::new(self.db.clone(), signals, &self.settings);
        let webhook = match WebhookServer::start(handler, &self.settings.webhook_bind).await {
            Ok(server) => server,
            Err(e) => {
                dispatcher.stop().await;
                return Err(e);
            }
        };
        let poller = self.poller().start();
        Ok(Services {
            poller,
            dispatcher,
            webhook,
        })
    }
}

/// Handles to the running background tasks.
pub struct Services {
    poller: PollerHandle,
    dispatcher: DispatcherHandle,
    webhook: WebhookServer,
}

impl Services {
    pub fn webhook_addr(&self) -> std::net::SocketAddr {
        self.webhook.local_addr()
    }

    pub fn set_open_conversation(&self, user_id: &str, open: Option<(Provider, String)>) {
        self.poller.set_open_conversation(user_id, open);
    }

    /// Stop accepting webhooks first so no signal is lost mid-shutdown.
    pub async fn stop(self) {
        self.webhook.stop().await;
        self.poller.stop().await;
        self.dispatcher.stop().await;
    }
}

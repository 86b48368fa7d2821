use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::model::{Conversation, Message, MessagePage, Page, Provider, SyncCursor};
use crate::providers::{Gateway, ProviderSet};
use crate::reconcile::{conversation_unread, is_temp_id, reconcile};
use crate::storage::repository;
use crate::storage::Database;
use crate::sync::incremental::IncrementalSync;
use crate::sync::{SyncPhase, SyncReport};
use crate::time_util::to_millis;

/// `(user_id, provider, conversation_id)`
pub type ConversationKey = (String, Provider, String);

// ── Guards ─────────────────────────────────────────────────────────

/// Remembers the newest message timestamp applied per conversation and
/// rejects poll results that are older.
#[derive(Debug, Default)]
pub struct PollGuard {
    applied: HashMap<ConversationKey, DateTime<Utc>>,
}

impl PollGuard {
    /// Returns false when a newer result was already applied. An equal
    /// sequence is admitted so re-polls can pick up state changes.
    pub fn admit(&mut self, key: &ConversationKey, sequence: Option<DateTime<Utc>>) -> bool {
        let sequence = sequence.unwrap_or(DateTime::<Utc>::MIN_UTC);
        match self.applied.get(key) {
            Some(last) if sequence < *last => false,
            _ => {
                self.applied.insert(key.clone(), sequence);
                true
            }
        }
    }

    pub fn last_applied(&self, key: &ConversationKey) -> Option<DateTime<Utc>> {
        self.applied.get(key).copied()
    }
}

/// Walks a conversation backwards page by page, dropping messages already
/// seen on an earlier, overlapping page.
#[derive(Debug, Default)]
pub struct ConversationPager {
    seen: HashSet<String>,
    cursor: Option<String>,
    done: bool,
}

impl ConversationPager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor for the next request. `None` before the first page.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Take in one page and return its messages not seen before. Paging
    /// stops when the provider repeats a cursor or stops handing them out.
    pub fn absorb(&mut self, page: MessagePage) -> Vec<Message> {
        let fresh: Vec<Message> = page
            .messages
            .into_iter()
            .filter(|m| self.seen.insert(m.id.clone()))
            .collect();
        match page.next_cursor {
            Some(next) if Some(next.as_str()) != self.cursor.as_deref() => self.cursor = Some(next),
            _ => self.done = true,
        }
        fresh
    }
}

// ── Engine ─────────────────────────────────────────────────────────

/// Conversation listing and message paging for every provider, plus the
/// poll-driven refresh used for providers without a change feed.
#[derive(Clone)]
pub struct PollingEngine {
    db: Database,
    gateway: Gateway,
    providers: ProviderSet,
    echo_window: chrono::Duration,
    guard: Arc<Mutex<PollGuard>>,
    /// Issued to each listing when it starts; a listing that finishes after
    /// a later-started one is not stored.
    listings: Arc<AtomicU64>,
    summaries: Arc<RwLock<HashMap<(String, Provider), (u64, Vec<Conversation>)>>>,
}

impl PollingEngine {
    pub fn new(
        db: Database,
        gateway: Gateway,
        providers: ProviderSet,
        echo_window: chrono::Duration,
    ) -> Self {
        Self {
            db,
            gateway,
            providers,
            echo_window,
            guard: Arc::new(Mutex::new(PollGuard::default())),
            listings: Arc::new(AtomicU64::new(0)),
            summaries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    /// Conversations newest first, with unread derived from the provider's
    /// read marker.
    pub async fn list_conversations(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> Result<Vec<Conversation>> {
        let api = self.providers.api(provider)?;
        let ticket = self.listings.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshots = {
            let api = &api;
            self.gateway
                .call(user_id, provider, |cred| async move {
                    api.list_conversations(&cred).await
                })
                .await?
        };
        let mut conversations: Vec<Conversation> = snapshots
            .into_iter()
            .map(|s| s.into_conversation())
            .collect();
        conversations.sort_by(|a, b| {
            (b.last_message_timestamp, &a.id).cmp(&(a.last_message_timestamp, &b.id))
        });

        if let Ok(mut summaries) = self.summaries.write() {
            let entry = summaries
                .entry((user_id.to_string(), provider))
                .or_insert_with(|| (0, Vec::new()));
            if ticket > entry.0 {
                *entry = (ticket, conversations.clone());
            } else {
                log::debug!("Discarding superseded {provider} listing for {user_id}");
            }
        }
        Ok(conversations)
    }

    /// Last listing taken for this user and provider.
    pub fn summaries(&self, user_id: &str, provider: Provider) -> Vec<Conversation> {
        self.summaries
            .read()
            .ok()
            .and_then(|s| s.get(&(user_id.to_string(), provider)).map(|(_, c)| c.clone()))
            .unwrap_or_default()
    }

    /// One page of a conversation, oldest first. `cursor` comes from the
    /// previous page's `next_cursor`.
    pub async fn get_messages(
        &self,
        user_id: &str,
        provider: Provider,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<Message>> {
        let page = self
            .fetch_page(user_id, provider, conversation_id, cursor)
            .await?;

        let mut seen = HashSet::new();
        let mut items: Vec<Message> = page
            .messages
            .into_iter()
            .filter(|m| seen.insert(m.id.clone()))
            .collect();
        items.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        self.store(user_id, provider, conversation_id, items.clone())
            .await?;

        let next_cursor = page.next_cursor.filter(|next| Some(next.as_str()) != cursor);
        Ok(Page { items, next_cursor })
    }

    /// Re-fetch the newest page of an open conversation. Returns false when
    /// the result was older than one already applied.
    pub async fn refresh_open(
        &self,
        user_id: &str,
        provider: Provider,
        conversation_id: &str,
    ) -> Result<bool> {
        let page = self
            .fetch_page(user_id, provider, conversation_id, None)
            .await?;
        let newest = page.messages.iter().map(|m| m.timestamp).max();
        let key = (user_id.to_string(), provider, conversation_id.to_string());
        let admitted = self
            .guard
            .lock()
            .map(|mut guard| guard.admit(&key, newest))
            .unwrap_or(true);
        if !admitted {
            log::debug!("Discarding stale poll result for {provider} conversation {conversation_id}");
            return Ok(false);
        }
        if conversation_unread(&page.messages, page.last_read) {
            self.mark_unread(user_id, provider, conversation_id);
        }
        self.store(user_id, provider, conversation_id, page.messages)
            .await?;
        Ok(true)
    }

    /// Flag a listed conversation unread after its newest page showed an
    /// incoming message past the read marker.
    fn mark_unread(&self, user_id: &str, provider: Provider, conversation_id: &str) {
        let Ok(mut summaries) = self.summaries.write() else {
            return;
        };
        if let Some((_, conversations)) = summaries.get_mut(&(user_id.to_string(), provider)) {
            for c in conversations.iter_mut().filter(|c| c.id == conversation_id) {
                c.unread = true;
            }
        }
    }

    /// One poll of a provider for one user: refresh the summary listing and
    /// the open conversation's first page.
    pub async fn poll_user(
        &self,
        user_id: &str,
        provider: Provider,
        open_conversation: Option<&str>,
    ) -> Result<SyncReport> {
        let conversations = self.list_conversations(user_id, provider).await?;
        let mut refreshed = 0;
        if let Some(conversation_id) = open_conversation {
            if self.refresh_open(user_id, provider, conversation_id).await? {
                refreshed += 1;
            }
        }

        let newest = conversations
            .iter()
            .filter_map(|c| c.last_message_timestamp)
            .max();
        if let Some(newest) = newest {
            self.advance_cursor(user_id, provider, to_millis(newest).max(0) as u64)
                .await?;
        }

        Ok(SyncReport::from_counts(
            user_id,
            provider,
            SyncPhase::Applied,
            conversations.len() as u64 + refreshed,
            0,
        )
        .with_cursor(newest.map(|ts| to_millis(ts).to_string())))
    }

    async fn fetch_page(
        &self,
        user_id: &str,
        provider: Provider,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> Result<MessagePage> {
        let api = self.providers.api(provider)?;
        let api = &api;
        self.gateway
            .call(user_id, provider, |cred| async move {
                api.messages(&cred, conversation_id, cursor).await
            })
            .await
    }

    async fn store(
        &self,
        user_id: &str,
        provider: Provider,
        conversation_id: &str,
        messages: Vec<Message>,
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let window = self.echo_window;
        self.db
            .writer()
            .call({
                let user_id = user_id.to_string();
                let conversation_id = conversation_id.to_string();
                move |conn| {
                    let tx = conn.transaction()?;
                    let local =
                        repository::list_messages(&tx, &user_id, provider, &conversation_id)?;
                    let merged = reconcile(&local, &messages, window);
                    for replaced in &merged.replaced {
                        repository::delete_message(
                            &tx,
                            &user_id,
                            provider,
                            &replaced.conversation_id,
                            &replaced.temp_id,
                        )?;
                    }
                    for message in &merged.messages {
                        repository::upsert_message(&tx, &user_id, message, is_temp_id(&message.id))?;
                    }
                    tx.commit()?;
                    Ok::<_, rusqlite::Error>(())
                }
            })
            .await?;
        Ok(())
    }

    /// Poll cursors follow the newest listed message and never move back.
    async fn advance_cursor(&self, user_id: &str, provider: Provider, newest: u64) -> Result<()> {
        self.db
            .writer()
            .call({
                let user_id = user_id.to_string();
                move |conn| {
                    let current = repository::get_sync_cursor(conn, &user_id, provider)?
                        .and_then(|c| c.sequence());
                    if current.map_or(true, |c| newest > c) {
                        repository::set_sync_cursor(
                            conn,
                            &user_id,
                            provider,
                            &SyncCursor::from(newest),
                        )?;
                    }
                    Ok::<_, rusqlite::Error>(())
                }
            })
            .await?;
        Ok(())
    }
}

// ── Poller ─────────────────────────────────────────────────────────

type OpenConversations = Arc<RwLock<HashMap<String, (Provider, String)>>>;

/// Timer-driven refresh of every connected user and provider.
pub struct Poller {
    db: Database,
    engine: PollingEngine,
    sync: IncrementalSync,
    interval: Duration,
    open: OpenConversations,
}

impl Poller {
    pub fn new(db: Database, engine: PollingEngine, sync: IncrementalSync, interval: Duration) -> Self {
        Self {
            db,
            engine,
            sync,
            interval,
            open: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// One pass over every user of every provider. Change-feed providers
    /// catch up incrementally; the rest are polled. A failing user or
    /// provider is reported and the others carry on.
    pub async fn run_cycle(&self) -> Vec<SyncReport> {
        let mut jobs = Vec::new();
        for provider in self.engine.providers().providers() {
            let users = self
                .db
                .reader()
                .call(move |conn| repository::list_users_for_provider(conn, provider))
                .await;
            let users = match users {
                Ok(users) => users,
                Err(e) => {
                    log::warn!("Could not list {provider} users: {e}");
                    continue;
                }
            };
            for user_id in users {
                jobs.push(self.poll_one(user_id, provider));
            }
        }
        join_all(jobs).await
    }

    async fn poll_one(&self, user_id: String, provider: Provider) -> SyncReport {
        let result = match self.engine.providers().feed(provider) {
            Some(feed) => self.sync.run(&feed, &user_id, None).await,
            None => {
                let open = self.open_conversation(&user_id, provider);
                self.engine
                    .poll_user(&user_id, provider, open.as_deref())
                    .await
            }
        };
        result.unwrap_or_else(|e| {
            log::warn!("{provider} poll for {user_id} failed: {e}");
            SyncReport::failed(&user_id, provider, SyncPhase::Fetching, e.user_message())
        })
    }

    fn open_conversation(&self, user_id: &str, provider: Provider) -> Option<String> {
        let open = self.open.read().ok()?;
        open.get(user_id)
            .filter(|(p, _)| *p == provider)
            .map(|(_, conversation_id)| conversation_id.clone())
    }

    /// Spawn the polling loop.
    pub fn start(self) -> PollerHandle {
        let (shutdown, mut stopped) = watch::channel(false);
        let open = self.open.clone();
        let interval = self.interval;
        log::info!("Poller started, every {}s", interval.as_secs_f64());

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let reports = self.run_cycle().await;
                        let failed = reports.iter().filter(|r| r.error.is_some()).count();
                        log::debug!("Poll cycle done: {} runs, {failed} with errors", reports.len());
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("Poller stopped");
        });

        PollerHandle {
            shutdown,
            task,
            open,
        }
    }
}

pub struct PollerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    open: OpenConversations,
}

impl PollerHandle {
    /// The conversation the user has open; its first page is refreshed
    /// every cycle. `None` clears it.
    pub fn set_open_conversation(&self, user_id: &str, open: Option<(Provider, String)>) {
        if let Ok(mut map) = self.open.write() {
            match open {
                Some(conversation) => map.insert(user_id.to_string(), conversation),
                None => map.remove(user_id),
            };
        }
    }

    /// Signal shutdown and wait for the loop to finish its current cycle.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::warn!("Poller task ended abnormally: {e}");
        }
    }
}

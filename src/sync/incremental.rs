use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Duration;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{ChangeSignal, Message, Provider, ReadReceipt, SyncCursor};
use crate::providers::{Change, ChangeFeed, ChangeSet, Gateway};
use crate::reconcile::{is_temp_id, reconcile};
use crate::storage::repository;
use crate::storage::Database;
use crate::sync::{SyncOptions, SyncPhase, SyncReport};
use crate::time_util::to_millis;

/// Applies provider change feeds to the message cache.
///
/// A run reads the stored cursor, asks the feed for changes since it,
/// resolves and reconciles every change, and only then advances the cursor.
/// A missing or rejected cursor falls back to a bounded bootstrap that
/// resets it. Runs for the same user and provider never overlap; clones
/// share that exclusion.
#[derive(Clone)]
pub struct IncrementalSync {
    db: Database,
    gateway: Gateway,
    options: SyncOptions,
    echo_window: Duration,
    running: Arc<Mutex<HashMap<(String, Provider), Arc<Mutex<()>>>>>,
}

/// How a run moves the stored cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CursorUpdate {
    Hold,
    /// Write only if not behind the row as it is at commit time.
    Advance(SyncCursor),
    /// Replace a cursor the provider rejected. Skipped if the row changed.
    Reset {
        rejected: Option<SyncCursor>,
        to: SyncCursor,
    },
}

impl IncrementalSync {
    pub fn new(db: Database, gateway: Gateway, options: SyncOptions, echo_window: Duration) -> Self {
        Self {
            db,
            gateway,
            options,
            echo_window,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sync one user's feed. `signal` is the webhook notification that
    /// triggered the run, if any.
    pub async fn run(
        &self,
        feed: &Arc<dyn ChangeFeed>,
        user_id: &str,
        signal: Option<&ChangeSignal>,
    ) -> Result<SyncReport> {
        let provider = feed.provider();
        let lock = self.run_lock(user_id, provider).await;
        let _running = lock.lock().await;

        if let Some(signal) = signal {
            self.apply_receipts(user_id, provider, &signal.receipts).await?;
        }

        let stored: Option<SyncCursor> = self
            .db
            .reader()
            .call({
                let user_id = user_id.to_string();
                move |conn| repository::get_sync_cursor(conn, &user_id, provider)
            })
            .await?;

        if let (Some(signal), Some(seq)) = (signal, stored.as_ref().and_then(SyncCursor::sequence)) {
            if signal.at_least <= seq {
                log::debug!(
                    "{provider} signal {} for {user_id} is not past cursor {seq}, nothing to do",
                    signal.at_least
                );
                return Ok(
                    SyncReport::from_counts(user_id, provider, SyncPhase::Idle, 0, 0)
                        .with_cursor(stored.map(|c| c.0)),
                );
            }
        }

        let outcome = match stored {
            None => self.bootstrap(feed, user_id, None, "no stored cursor").await,
            Some(cursor) => {
                log::debug!("{provider} sync for {user_id}: fetching since {cursor}");
                let fetched = {
                    let cursor = &cursor;
                    self.gateway
                        .call(user_id, provider, |cred| async move {
                            feed.changes_since(&cred, cursor).await
                        })
                        .await
                };
                match fetched {
                    Ok(set) => self.apply_delta(feed, user_id, &cursor, set).await,
                    Err(Error::CursorInvalid { .. }) => {
                        self.bootstrap(feed, user_id, Some(cursor), "cursor rejected")
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
        };

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                let report =
                    SyncReport::failed(user_id, provider, SyncPhase::Fetching, e.to_string());
                if let Err(record_err) = self.record(&report).await {
                    log::warn!("Could not record failed {provider} sync: {record_err}");
                }
                return Err(e);
            }
        };
        self.record(&report).await?;
        log::info!(
            "{provider} sync for {user_id}: {} ({} applied, {} failed)",
            report.phase.as_str(),
            report.items_synced,
            report.items_failed
        );
        Ok(report)
    }

    async fn bootstrap(
        &self,
        feed: &Arc<dyn ChangeFeed>,
        user_id: &str,
        rejected: Option<SyncCursor>,
        reason: &str,
    ) -> Result<SyncReport> {
        let provider = feed.provider();
        let limit = self.options.bootstrap_limit;
        log::info!("Bootstrapping {provider} for {user_id} ({reason}), last {limit} messages");

        let boot = self
            .gateway
            .call(user_id, provider, |cred| async move {
                feed.bootstrap(&cred, limit).await
            })
            .await?;

        let update = CursorUpdate::Reset {
            rejected,
            to: boot.cursor,
        };
        let (applied, cursor) = self
            .persist(user_id, provider, boot.messages, update)
            .await?;
        Ok(
            SyncReport::from_counts(user_id, provider, SyncPhase::BootstrapRequired, applied, 0)
                .with_cursor(cursor.map(|c| c.0)),
        )
    }

    async fn apply_delta(
        &self,
        feed: &Arc<dyn ChangeFeed>,
        user_id: &str,
        stored: &SyncCursor,
        set: ChangeSet,
    ) -> Result<SyncReport> {
        let provider = feed.provider();
        let changes = order_changes(set.changes);

        let cached: HashSet<String> = self
            .db
            .reader()
            .call({
                let user_id = user_id.to_string();
                move |conn| repository::list_message_ids(conn, &user_id, provider)
            })
            .await?
            .into_iter()
            .collect();
        let pending: Vec<Change> = changes
            .into_iter()
            .filter(|c| !cached.contains(&c.message_id))
            .collect();

        let gateway = self.gateway.clone();
        let shared_feed = Arc::clone(feed);
        let owner = user_id.to_string();
        let resolved: Vec<(Change, Result<Option<Message>>)> = stream::iter(pending)
            .map(move |change| {
                let gateway = gateway.clone();
                let feed = Arc::clone(&shared_feed);
                let owner = owner.clone();
                async move {
                    let result = gateway
                        .call(&owner, provider, |cred| {
                            let feed = Arc::clone(&feed);
                            let change = change.clone();
                            async move { feed.resolve(&cred, &change).await }
                        })
                        .await;
                    (change, result)
                }
            })
            .buffered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut messages = Vec::new();
        let mut failed: u64 = 0;
        for (change, result) in resolved {
            match result {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => log::debug!("{provider} message {} vanished", change.message_id),
                Err(e @ (Error::NoCredential { .. } | Error::ReauthRequired { .. })) => {
                    return Err(e)
                }
                Err(e) => {
                    log::warn!("Failed to resolve {provider} message {}: {e}", change.message_id);
                    failed += 1;
                }
            }
        }

        let update = if failed == 0 {
            CursorUpdate::Advance(set.next_cursor)
        } else {
            log::warn!("{provider} cursor for {user_id} held at {stored}, {failed} changes unresolved");
            CursorUpdate::Hold
        };
        let (applied, cursor) = self.persist(user_id, provider, messages, update).await?;

        Ok(
            SyncReport::from_counts(user_id, provider, SyncPhase::Applied, applied, failed)
                .with_cursor(cursor.map(|c| c.0)),
        )
    }

    /// Reconcile `messages` into the cache per conversation and, in the same
    /// transaction, apply `update` to the stored cursor. Returns the number
    /// of messages and the cursor as committed.
    async fn persist(
        &self,
        user_id: &str,
        provider: Provider,
        messages: Vec<Message>,
        update: CursorUpdate,
    ) -> Result<(u64, Option<SyncCursor>)> {
        let applied = messages.len() as u64;
        let mut by_conversation: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for message in messages {
            by_conversation
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }
        let window = self.echo_window;

        let committed = self
            .db
            .writer()
            .call({
                let user_id = user_id.to_string();
                move |conn| {
                    let tx = conn.transaction()?;
                    for (conversation_id, authoritative) in &by_conversation {
                        let local =
                            repository::list_messages(&tx, &user_id, provider, conversation_id)?;
                        let merged = reconcile(&local, authoritative, window);
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
                            repository::upsert_message(
                                &tx,
                                &user_id,
                                message,
                                is_temp_id(&message.id),
                            )?;
                        }
                    }
                    let current = repository::get_sync_cursor(&tx, &user_id, provider)?;
                    let next = next_cursor(current.as_ref(), &update);
                    if let Some(cursor) = &next {
                        if current.as_ref() != Some(cursor) {
                            repository::set_sync_cursor(&tx, &user_id, provider, cursor)?;
                        }
                    }
                    tx.commit()?;
                    Ok::<_, rusqlite::Error>(next.or(current))
                }
            })
            .await?;
        Ok((applied, committed))
    }

    async fn run_lock(&self, user_id: &str, provider: Provider) -> Arc<Mutex<()>> {
        self.running
            .lock()
            .await
            .entry((user_id.to_string(), provider))
            .or_default()
            .clone()
    }

    async fn apply_receipts(
        &self,
        user_id: &str,
        provider: Provider,
        receipts: &[ReadReceipt],
    ) -> Result<usize> {
        if receipts.is_empty() {
            return Ok(0);
        }
        let promoted = self
            .db
            .writer()
            .call({
                let user_id = user_id.to_string();
                let receipts = receipts.to_vec();
                move |conn| {
                    let mut promoted = 0;
                    for receipt in &receipts {
                        promoted += repository::promote_seen_for_participant(
                            conn,
                            &user_id,
                            provider,
                            &receipt.participant_ref,
                            to_millis(receipt.watermark),
                        )?;
                    }
                    Ok::<_, rusqlite::Error>(promoted)
                }
            })
            .await?;
        if promoted > 0 {
            log::debug!("{promoted} {provider} messages for {user_id} marked seen");
        }
        Ok(promoted)
    }

    async fn record(&self, report: &SyncReport) -> Result<()> {
        self.db
            .writer()
            .call({
                let report = report.clone();
                move |conn| {
                    repository::insert_sync_run(
                        conn,
                        &report.user_id,
                        report.provider,
                        report.phase.as_str(),
                        report.status.as_str(),
                        report.items_synced,
                        report.items_failed,
                        report.error.as_deref(),
                    )
                }
            })
            .await?;
        Ok(())
    }
}

/// Provider sequence order, first occurrence of each message id wins.
fn order_changes(mut changes: Vec<Change>) -> Vec<Change> {
    changes.sort_by_key(|c| c.sequence);
    let mut seen = HashSet::new();
    changes.retain(|c| seen.insert(c.message_id.clone()));
    changes
}

/// The cursor to store given the row at commit time, or `None` to leave it.
/// An advance never moves it backwards.
fn next_cursor(current: Option<&SyncCursor>, update: &CursorUpdate) -> Option<SyncCursor> {
    match update {
        CursorUpdate::Hold => None,
        CursorUpdate::Advance(next) => match current {
            Some(stored) => Some(advance(stored, next.clone())),
            None => Some(next.clone()),
        },
        CursorUpdate::Reset { rejected, to } => {
            if current == rejected.as_ref() {
                Some(to.clone())
            } else {
                current.map(|stored| advance(stored, to.clone()))
            }
        }
    }
}

fn advance(stored: &SyncCursor, next: SyncCursor) -> SyncCursor {
    match (stored.sequence(), next.sequence()) {
        (Some(current), Some(proposed)) if proposed < current => stored.clone(),
        _ => next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeliveryState, Direction};
    use crate::providers::fake::FakeProvider;
    use crate::providers::tests::gateway_for;
    use crate::time_util::from_millis;
    use std::sync::atomic::Ordering;

    async fn engine(db: &Database, provider: Provider) -> IncrementalSync {
        let gateway = gateway_for(db, provider, "tok").await;
        IncrementalSync::new(
            db.clone(),
            gateway,
            SyncOptions::default(),
            Duration::seconds(30),
        )
    }

    async fn set_cursor(db: &Database, provider: Provider, value: u64) {
        db.writer()
            .call(move |conn| {
                repository::set_sync_cursor(conn, "u1", provider, &SyncCursor::from(value))
            })
            .await
            .unwrap();
    }

    async fn cursor(db: &Database, provider: Provider) -> Option<SyncCursor> {
        db.reader()
            .call(move |conn| repository::get_sync_cursor(conn, "u1", provider))
            .await
            .unwrap()
    }

    async fn cached(db: &Database, provider: Provider, conv: &str) -> Vec<Message> {
        let conv = conv.to_string();
        db.reader()
            .call(move |conn| repository::list_messages(conn, "u1", provider, &conv))
            .await
            .unwrap()
    }

    fn signal(provider: Provider, at_least: u64) -> ChangeSignal {
        ChangeSignal {
            user_id: "u1".into(),
            provider,
            at_least,
            receipts: vec![],
        }
    }

    fn as_feed(fake: &Arc<FakeProvider>) -> Arc<dyn ChangeFeed> {
        fake.clone()
    }

    #[tokio::test]
    async fn test_missing_cursor_bootstraps() {
        let db = Database::open_memory().await.unwrap();
        let sync = engine(&db, Provider::Mail).await;
        let fake = Arc::new(FakeProvider::new(Provider::Mail));
        fake.incoming(1, "t1", "m1", 1_000, "one");
        fake.incoming(2, "t1", "m2", 2_000, "two");
        fake.incoming(3, "t2", "m3", 3_000, "three");

        let report = sync.run(&as_feed(&fake), "u1", None).await.unwrap();
        assert_eq!(report.phase, SyncPhase::BootstrapRequired);
        assert_eq!(report.items_synced, 3);
        assert_eq!(cursor(&db, Provider::Mail).await, Some(SyncCursor::from(3)));
        assert_eq!(cached(&db, Provider::Mail, "t1").await.len(), 2);
        assert_eq!(fake.change_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_signal_at_cursor_is_noop() {
        let db = Database::open_memory().await.unwrap();
        let sync = engine(&db, Provider::Mail).await;
        let fake = Arc::new(FakeProvider::new(Provider::Mail));
        fake.incoming(100, "t1", "m1", 1_000, "one");
        set_cursor(&db, Provider::Mail, 100).await;

        let report = sync
            .run(&as_feed(&fake), "u1", Some(&signal(Provider::Mail, 100)))
            .await
            .unwrap();
        assert_eq!(report.phase, SyncPhase::Idle);
        assert_eq!(report.items_synced, 0);
        assert_eq!(fake.change_calls.load(Ordering::SeqCst), 0);
        assert_eq!(cursor(&db, Provider::Mail).await, Some(SyncCursor::from(100)));
    }

    #[tokio::test]
    async fn test_rejected_cursor_bootstraps_and_resets() {
        let db = Database::open_memory().await.unwrap();
        let sync = engine(&db, Provider::Mail).await;
        let fake = Arc::new(FakeProvider::new(Provider::Mail));
        fake.state.lock().unwrap().oldest_valid = 50;
        fake.incoming(55, "t1", "m1", 1_000, "one");
        fake.incoming(60, "t1", "m2", 2_000, "two");
        set_cursor(&db, Provider::Mail, 10).await;

        let report = sync.run(&as_feed(&fake), "u1", None).await.unwrap();
        assert_eq!(report.phase, SyncPhase::BootstrapRequired);
        assert_eq!(fake.bootstrap_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cursor(&db, Provider::Mail).await, Some(SyncCursor::from(60)));
        assert_eq!(cached(&db, Provider::Mail, "t1").await.len(), 2);
    }

    #[tokio::test]
    async fn test_delta_applies_new_messages_and_advances() {
        let db = Database::open_memory().await.unwrap();
        let sync = engine(&db, Provider::Mail).await;
        let fake = Arc::new(FakeProvider::new(Provider::Mail));
        fake.incoming(1, "t1", "m1", 1_000, "one");
        fake.incoming(2, "t1", "m2", 2_000, "two");
        fake.incoming(3, "t1", "m3", 3_000, "three");
        set_cursor(&db, Provider::Mail, 1).await;

        let report = sync
            .run(&as_feed(&fake), "u1", Some(&signal(Provider::Mail, 3)))
            .await
            .unwrap();
        assert_eq!(report.phase, SyncPhase::Applied);
        assert_eq!(report.items_synced, 2);
        assert_eq!(fake.resolve_calls.load(Ordering::SeqCst), 2);
        assert_eq!(cursor(&db, Provider::Mail).await, Some(SyncCursor::from(3)));

        let ids: Vec<String> = cached(&db, Provider::Mail, "t1")
            .await
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m2", "m3"]);
    }

    #[tokio::test]
    async fn test_failed_resolution_holds_cursor() {
        let db = Database::open_memory().await.unwrap();
        let sync = engine(&db, Provider::Mail).await;
        let fake = Arc::new(FakeProvider::new(Provider::Mail));
        fake.incoming(1, "t1", "m1", 1_000, "one");
        fake.incoming(2, "t1", "m2", 2_000, "two");
        fake.incoming(3, "t1", "m3", 3_000, "three");
        fake.state.lock().unwrap().fail_resolve.push("m3".into());
        set_cursor(&db, Provider::Mail, 1).await;

        let report = sync.run(&as_feed(&fake), "u1", None).await.unwrap();
        assert_eq!(report.items_synced, 1);
        assert_eq!(report.items_failed, 1);
        assert_eq!(cursor(&db, Provider::Mail).await, Some(SyncCursor::from(1)));

        // The next run retries the unresolved change only.
        fake.state.lock().unwrap().fail_resolve.clear();
        let report = sync.run(&as_feed(&fake), "u1", None).await.unwrap();
        assert_eq!(report.items_synced, 1);
        assert_eq!(cursor(&db, Provider::Mail).await, Some(SyncCursor::from(3)));
    }

    #[tokio::test]
    async fn test_duplicate_and_reordered_signals_apply_same_set() {
        async fn deliver(order: &[u64]) -> (Vec<Message>, Option<SyncCursor>) {
            let db = Database::open_memory().await.unwrap();
            let sync = engine(&db, Provider::Messenger).await;
            let fake = Arc::new(FakeProvider::new(Provider::Messenger));
            fake.incoming(1, "c", "a", 1_000, "a");
            set_cursor(&db, Provider::Messenger, 1).await;
            fake.incoming(2, "c", "b", 2_000, "b");
            fake.incoming(3, "c", "d", 3_000, "d");
            for at_least in order {
                sync.run(
                    &as_feed(&fake),
                    "u1",
                    Some(&signal(Provider::Messenger, *at_least)),
                )
                .await
                .unwrap();
            }
            (
                cached(&db, Provider::Messenger, "c").await,
                cursor(&db, Provider::Messenger).await,
            )
        }

        let once = deliver(&[3]).await;
        let shuffled = deliver(&[3, 2, 3, 2]).await;
        let in_order = deliver(&[2, 3]).await;
        assert_eq!(once, shuffled);
        assert_eq!(once, in_order);
        assert_eq!(once.0.len(), 2);
        assert_eq!(once.1, Some(SyncCursor::from(3)));
    }

    #[tokio::test]
    async fn test_echo_replaces_cached_temp() {
        let db = Database::open_memory().await.unwrap();
        let sync = engine(&db, Provider::Mail).await;
        let fake = Arc::new(FakeProvider::new(Provider::Mail));
        fake.incoming(1, "C", "m0", 500, "hi");
        set_cursor(&db, Provider::Mail, 1).await;
        fake.push(2, "C", "X", 1_005, "hello", Direction::Outgoing);

        let temp = Message {
            id: "temp-1000-0".into(),
            provider: Provider::Mail,
            conversation_id: "C".into(),
            sender_ref: "me".into(),
            content: "hello".into(),
            timestamp: from_millis(1_000),
            direction: Direction::Outgoing,
            delivery_state: DeliveryState::Sending,
        };
        db.writer()
            .call(move |conn| repository::upsert_message(conn, "u1", &temp, true))
            .await
            .unwrap();

        sync.run(&as_feed(&fake), "u1", Some(&signal(Provider::Mail, 2)))
            .await
            .unwrap();

        let msgs = cached(&db, Provider::Mail, "C").await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id, "X");
        assert_eq!(msgs[0].delivery_state, DeliveryState::Delivered);
    }

    #[tokio::test]
    async fn test_read_receipt_marks_outgoing_seen() {
        let db = Database::open_memory().await.unwrap();
        let sync = engine(&db, Provider::Instagram).await;
        let fake = Arc::new(FakeProvider::new(Provider::Instagram));
        fake.incoming(1, "c", "in1", 1_000, "hey");
        fake.push(2, "c", "out1", 2_000, "yo", Direction::Outgoing);
        sync.run(&as_feed(&fake), "u1", None).await.unwrap();

        let receipt = ChangeSignal {
            receipts: vec![ReadReceipt {
                participant_ref: "peer-c".into(),
                watermark: from_millis(2_000),
            }],
            ..signal(Provider::Instagram, 2)
        };
        let report = sync
            .run(&as_feed(&fake), "u1", Some(&receipt))
            .await
            .unwrap();
        assert_eq!(report.phase, SyncPhase::Idle);

        let msgs = cached(&db, Provider::Instagram, "c").await;
        assert_eq!(msgs[1].id, "out1");
        assert_eq!(msgs[1].delivery_state, DeliveryState::Seen);
    }

    #[tokio::test]
    async fn test_overlapping_runs_never_move_cursor_back() {
        let db = Database::open_memory().await.unwrap();
        let sync = engine(&db, Provider::Mail).await;
        let fake = Arc::new(FakeProvider::new(Provider::Mail));
        fake.incoming(1, "t1", "m1", 1_000, "one");
        fake.incoming(2, "t1", "m2", 2_000, "two");
        set_cursor(&db, Provider::Mail, 1).await;
        fake.state.lock().unwrap().resolve_delay = Some(std::time::Duration::from_millis(200));

        // The first run sees changes up to 2 and stalls resolving them.
        let slow = {
            let sync = sync.clone();
            let feed = as_feed(&fake);
            tokio::spawn(async move { sync.run(&feed, "u1", None).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        fake.state.lock().unwrap().resolve_delay = None;
        fake.incoming(3, "t1", "m3", 3_000, "three");
        fake.incoming(5, "t1", "m5", 5_000, "five");

        let newer = sync.run(&as_feed(&fake), "u1", None).await.unwrap();
        let older = slow.await.unwrap().unwrap();
        assert_eq!(older.cursor.as_deref(), Some("2"));
        assert_eq!(newer.cursor.as_deref(), Some("5"));
        assert_eq!(cursor(&db, Provider::Mail).await, Some(SyncCursor::from(5)));
        assert_eq!(cached(&db, Provider::Mail, "t1").await.len(), 3);
    }

    #[tokio::test]
    async fn test_stale_advance_keeps_newer_row() {
        let db = Database::open_memory().await.unwrap();
        let sync = engine(&db, Provider::Messenger).await;
        set_cursor(&db, Provider::Messenger, 5).await;

        let (_, committed) = sync
            .persist(
                "u1",
                Provider::Messenger,
                vec![],
                CursorUpdate::Advance(SyncCursor::from(2)),
            )
            .await
            .unwrap();
        assert_eq!(committed, Some(SyncCursor::from(5)));
        assert_eq!(cursor(&db, Provider::Messenger).await, Some(SyncCursor::from(5)));
    }

    #[test]
    fn test_reset_replaces_only_the_rejected_cursor() {
        let rejected = SyncCursor::from(90);
        let reset = CursorUpdate::Reset {
            rejected: Some(rejected.clone()),
            to: SyncCursor::from(40),
        };
        assert_eq!(next_cursor(Some(&rejected), &reset), Some(SyncCursor::from(40)));
        assert_eq!(
            next_cursor(Some(&SyncCursor::from(95)), &reset),
            Some(SyncCursor::from(95))
        );
        assert_eq!(next_cursor(Some(&rejected), &CursorUpdate::Hold), None);
    }

    #[test]
    fn test_cursor_never_regresses() {
        let stored = SyncCursor::from(10);
        assert_eq!(advance(&stored, SyncCursor::from(7)), stored);
        assert_eq!(advance(&stored, SyncCursor::from(12)), SyncCursor::from(12));
    }

    #[test]
    fn test_order_changes_dedupes_by_id() {
        let change = |seq, id: &str| Change {
            sequence: seq,
            message_id: id.into(),
            conversation_hint: None,
        };
        let out = order_changes(vec![change(5, "b"), change(3, "a"), change(4, "b")]);
        let ids: Vec<(u64, &str)> = out.iter().map(|c| (c.sequence, c.message_id.as_str())).collect();
        assert_eq!(ids, vec![(3, "a"), (4, "b")]);
    }
}

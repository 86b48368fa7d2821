//! In-memory provider for engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Bootstrap, Change, ChangeFeed, ChangeSet, InboxApi};
use crate::error::{Error, Result};
use crate::model::{
    ConversationSnapshot, Credential, DeliveryState, Direction, Message, MessagePage, Provider,
    SendReceipt, SendTarget, SyncCursor,
};
use crate::time_util::from_millis;

pub(crate) const PAGE_SIZE: usize = 2;

#[derive(Default)]
pub(crate) struct FakeState {
    /// `(sequence, message)` in sequence order.
    pub log: Vec<(u64, Message)>,
    /// Cursors below this are rejected.
    pub oldest_valid: u64,
    pub last_read: HashMap<String, DateTime<Utc>>,
    pub participants: HashMap<String, String>,
    pub fail_listing: bool,
    pub fail_send: bool,
    /// Deliver the next send, then report a timeout for it.
    pub time_out_after_send: bool,
    /// Pause inside `resolve`, to hold a sync run open.
    pub resolve_delay: Option<Duration>,
    /// Pause after a listing was taken, before it is returned.
    pub listing_delay: Option<Duration>,
    /// Message ids whose resolution fails.
    pub fail_resolve: Vec<String>,
    /// Timestamp the provider stamps on the next sent message.
    pub send_clock: Option<DateTime<Utc>>,
    pub marked: Vec<(String, DateTime<Utc>)>,
}

impl FakeState {
    fn head(&self) -> u64 {
        self.log.last().map(|(seq, _)| *seq).unwrap_or(self.oldest_valid)
    }
}

pub(crate) struct FakeProvider {
    provider: Provider,
    pub state: Mutex<FakeState>,
    pub change_calls: AtomicUsize,
    pub resolve_calls: AtomicUsize,
    pub bootstrap_calls: AtomicUsize,
    pub send_calls: AtomicUsize,
}

impl FakeProvider {
    pub(crate) fn new(provider: Provider) -> Self {
        Self {
            provider,
            state: Mutex::new(FakeState::default()),
            change_calls: AtomicUsize::new(0),
            resolve_calls: AtomicUsize::new(0),
            bootstrap_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn incoming(&self, seq: u64, conv: &str, id: &str, ts_ms: i64, text: &str) {
        self.push(seq, conv, id, ts_ms, text, Direction::Incoming);
    }

    pub(crate) fn push(
        &self,
        seq: u64,
        conv: &str,
        id: &str,
        ts_ms: i64,
        text: &str,
        direction: Direction,
    ) {
        let sender = match direction {
            Direction::Incoming => format!("peer-{conv}"),
            Direction::Outgoing => "me".to_string(),
        };
        let mut state = self.state.lock().unwrap();
        state
            .participants
            .insert(conv.to_string(), format!("peer-{conv}"));
        state.log.push((
            seq,
            Message {
                id: id.into(),
                provider: self.provider,
                conversation_id: conv.into(),
                sender_ref: sender,
                content: text.into(),
                timestamp: from_millis(ts_ms),
                direction,
                delivery_state: DeliveryState::Delivered,
            },
        ));
    }

    pub(crate) fn head(&self) -> u64 {
        self.state.lock().unwrap().head()
    }

    fn conversation(&self, conv: &str) -> Vec<Message> {
        let state = self.state.lock().unwrap();
        let mut msgs: Vec<Message> = state
            .log
            .iter()
            .filter(|(_, m)| m.conversation_id == conv)
            .map(|(_, m)| m.clone())
            .collect();
        msgs.sort_by(|a, b| (b.timestamp, &b.id).cmp(&(a.timestamp, &a.id)));
        msgs
    }
}

#[async_trait]
impl InboxApi for FakeProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn whoami(&self, _cred: &Credential) -> Result<String> {
        Ok("me".into())
    }

    async fn list_conversations(&self, _cred: &Credential) -> Result<Vec<ConversationSnapshot>> {
        let (fail, convs, last_read, delay) = {
            let state = self.state.lock().unwrap();
            let mut convs: Vec<String> = state.participants.keys().cloned().collect();
            convs.sort();
            (
                state.fail_listing,
                convs,
                state.last_read.clone(),
                state.listing_delay,
            )
        };
        if fail {
            return Err(Error::Api {
                provider: self.provider,
                status: 403,
                message: "listing disabled".into(),
            });
        }
        let listed: Vec<ConversationSnapshot> = convs
            .into_iter()
            .map(|id| {
                let msgs = self.conversation(&id);
                ConversationSnapshot {
                    participant_ref: format!("peer-{id}"),
                    provider: self.provider,
                    last_message_timestamp: msgs.first().map(|m| m.timestamp),
                    preview: msgs.first().map(|m| m.content.clone()).unwrap_or_default(),
                    last_read: last_read.get(&id).copied(),
                    latest_incoming: msgs
                        .iter()
                        .find(|m| m.direction == Direction::Incoming)
                        .map(|m| m.timestamp),
                    id,
                }
            })
            .collect();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(listed)
    }

    async fn messages(
        &self,
        _cred: &Credential,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> Result<MessagePage> {
        let all = self.conversation(conversation_id);
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let end = (offset + PAGE_SIZE).min(all.len());
        let mut messages = all.get(offset..end).map(<[Message]>::to_vec).unwrap_or_default();
        messages.reverse();
        let last_read = self
            .state
            .lock()
            .unwrap()
            .last_read
            .get(conversation_id)
            .copied();
        Ok(MessagePage {
            messages,
            next_cursor: (end < all.len()).then(|| end.to_string()),
            last_read,
        })
    }

    async fn send(
        &self,
        _cred: &Credential,
        target: &SendTarget,
        text: &str,
    ) -> Result<SendReceipt> {
        let conv = match target {
            SendTarget::Conversation(c) => c.clone(),
            SendTarget::Recipient(r) => format!("dm-{r}"),
        };
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let (fail, time_out, ts, seq) = {
            let state = self.state.lock().unwrap();
            (
                state.fail_send,
                state.time_out_after_send,
                state.send_clock.unwrap_or_else(Utc::now),
                state.head() + 1,
            )
        };
        if fail {
            return Err(Error::Api {
                provider: self.provider,
                status: 400,
                message: "send rejected".into(),
            });
        }
        let id = format!("srv-{seq}");
        self.push(seq, &conv, &id, ts.timestamp_millis(), text, Direction::Outgoing);
        if time_out {
            return Err(Error::ProviderUnavailable {
                provider: self.provider,
                message: "operation timed out".into(),
            });
        }
        Ok(SendReceipt {
            conversation_id: conv,
            provider_message_id: Some(id),
        })
    }

    async fn mark_read(
        &self,
        _cred: &Credential,
        conversation_id: &str,
        up_to: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.marked.push((conversation_id.to_string(), up_to));
        state.last_read.insert(conversation_id.to_string(), up_to);
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for FakeProvider {
    async fn current_cursor(&self, _cred: &Credential) -> Result<SyncCursor> {
        Ok(SyncCursor::from(self.head()))
    }

    async fn changes_since(&self, _cred: &Credential, cursor: &SyncCursor) -> Result<ChangeSet> {
        self.change_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let since = cursor
            .sequence()
            .filter(|s| *s >= state.oldest_valid)
            .ok_or(Error::CursorInvalid {
                provider: self.provider,
            })?;
        let changes = state
            .log
            .iter()
            .filter(|(seq, _)| *seq > since)
            .map(|(seq, m)| Change {
                sequence: *seq,
                message_id: m.id.clone(),
                conversation_hint: Some(m.conversation_id.clone()),
            })
            .collect();
        Ok(ChangeSet {
            changes,
            next_cursor: SyncCursor::from(state.head().max(since)),
        })
    }

    async fn resolve(&self, _cred: &Credential, change: &Change) -> Result<Option<Message>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().unwrap().resolve_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        if state.fail_resolve.contains(&change.message_id) {
            return Err(Error::Api {
                provider: self.provider,
                status: 500,
                message: format!("cannot load {}", change.message_id),
            });
        }
        Ok(state
            .log
            .iter()
            .find(|(_, m)| m.id == change.message_id)
            .map(|(_, m)| m.clone()))
    }

    async fn bootstrap(&self, _cred: &Credential, limit: usize) -> Result<Bootstrap> {
        self.bootstrap_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let skip = state.log.len().saturating_sub(limit);
        Ok(Bootstrap {
            messages: state.log.iter().skip(skip).map(|(_, m)| m.clone()).collect(),
            cursor: SyncCursor::from(state.head()),
        })
    }
}

//! Mail adapter (Gmail-shaped REST). Threads are conversations; the
//! mailbox `historyId` is the change cursor.

use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use super::http::{read_json, send};
use super::{Bootstrap, Change, ChangeFeed, ChangeSet, InboxApi};
use crate::error::{Error, Result};
use crate::model::{
    ConversationSnapshot, Credential, DeliveryState, Direction, Message, MessagePage, Provider,
    SendReceipt, SendTarget, SyncCursor,
};
use crate::time_util::from_millis;

const PROVIDER: Provider = Provider::Mail;
const MAX_HISTORY_PAGES: usize = 10;
const THREAD_LIST_SIZE: &str = "25";
const FETCH_CONCURRENCY: usize = 4;
const SENT_LABEL: &str = "SENT";
const UNREAD_LABEL: &str = "UNREAD";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    email_address: String,
    history_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    history_id: Option<String>,
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    id: String,
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Debug, Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct ThreadList {
    #[serde(default)]
    threads: Vec<ThreadRef>,
}

#[derive(Debug, Deserialize)]
struct ThreadRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Thread {
    id: String,
    #[serde(default)]
    messages: Vec<RawMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    thread_id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    internal_date: Option<String>,
    payload: Option<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    body: Option<Body>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct Body {
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SentMessage {
    id: String,
    thread_id: String,
}

impl RawMessage {
    fn timestamp(&self) -> DateTime<Utc> {
        from_millis(
            self.internal_date
                .as_deref()
                .and_then(|d| d.parse().ok())
                .unwrap_or(0),
        )
    }

    fn is_outgoing(&self) -> bool {
        self.label_ids.iter().any(|l| l == SENT_LABEL)
    }

    fn is_unread(&self) -> bool {
        self.label_ids.iter().any(|l| l == UNREAD_LABEL)
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.payload
            .as_ref()?
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    fn counterpart(&self) -> String {
        let header = if self.is_outgoing() { "To" } else { "From" };
        self.header(header).map(address_of).unwrap_or_default()
    }

    fn into_message(self, self_address: Option<&str>) -> Message {
        let timestamp = self.timestamp();
        let outgoing = self.is_outgoing();
        let sender_ref = if outgoing {
            self_address
                .map(str::to_string)
                .or_else(|| self.header("From").map(address_of))
                .unwrap_or_default()
        } else {
            self.header("From").map(address_of).unwrap_or_default()
        };
        let content = self
            .payload
            .as_ref()
            .and_then(plain_text)
            .unwrap_or_else(|| self.snippet.clone());
        Message {
            id: self.id,
            provider: PROVIDER,
            conversation_id: self.thread_id,
            sender_ref,
            content,
            timestamp,
            direction: if outgoing {
                Direction::Outgoing
            } else {
                Direction::Incoming
            },
            delivery_state: DeliveryState::Delivered,
        }
    }
}

/// `"Alice <alice@example.com>"` -> `alice@example.com`.
fn address_of(value: &str) -> String {
    match (value.rfind('<'), value.rfind('>')) {
        (Some(start), Some(end)) if start < end => value[start + 1..end].trim().to_lowercase(),
        _ => value.trim().to_lowercase(),
    }
}

fn plain_text(part: &Part) -> Option<String> {
    if part.mime_type.eq_ignore_ascii_case("text/plain") {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            return decode_body(data);
        }
    }
    part.parts.iter().find_map(plain_text)
}

fn decode_body(data: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(data))
        .ok()?;
    String::from_utf8(bytes).ok().map(|s| s.trim().to_string())
}

/// Read position derived from per-message UNREAD labels: just before the
/// oldest unread incoming message, or the newest incoming one when all are
/// read.
fn read_marker(messages: &[RawMessage]) -> Option<DateTime<Utc>> {
    let incoming = messages.iter().filter(|m| !m.is_outgoing());
    let oldest_unread = incoming
        .clone()
        .filter(|m| m.is_unread())
        .map(RawMessage::timestamp)
        .min();
    match oldest_unread {
        Some(ts) => Some(ts - chrono::Duration::milliseconds(1)),
        None => incoming.map(RawMessage::timestamp).max(),
    }
}

fn snapshot(thread: &Thread) -> ConversationSnapshot {
    let latest = thread.messages.iter().max_by_key(|m| m.timestamp());
    let latest_incoming = thread
        .messages
        .iter()
        .filter(|m| !m.is_outgoing())
        .max_by_key(|m| m.timestamp());
    ConversationSnapshot {
        id: thread.id.clone(),
        provider: PROVIDER,
        participant_ref: latest_incoming
            .or(latest)
            .map(RawMessage::counterpart)
            .unwrap_or_default(),
        last_message_timestamp: latest.map(RawMessage::timestamp),
        preview: latest.map(|m| m.snippet.clone()).unwrap_or_default(),
        last_read: read_marker(&thread.messages),
        latest_incoming: latest_incoming.map(RawMessage::timestamp),
    }
}

fn build_raw(to: &str, subject: &str, text: &str) -> String {
    let mime = format!(
        "To: {to}\r\nSubject: {subject}\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\n\r\n{text}"
    );
    URL_SAFE_NO_PAD.encode(mime.as_bytes())
}

pub struct MailAdapter {
    client: Client,
    base: String,
}

impl MailAdapter {
    pub fn new(client: Client, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{path}", self.base)
    }

    async fn profile(&self, cred: &Credential) -> Result<Profile> {
        let req = self
            .client
            .get(self.url("profile"))
            .bearer_auth(&cred.access_token);
        read_json(PROVIDER, send(PROVIDER, req).await?).await
    }

    async fn thread(&self, cred: &Credential, thread_id: &str, format: &str) -> Result<Thread> {
        let req = self
            .client
            .get(self.url(&format!("threads/{thread_id}")))
            .bearer_auth(&cred.access_token)
            .query(&[
                ("format", format),
                ("metadataHeaders", "From"),
                ("metadataHeaders", "To"),
                ("metadataHeaders", "Subject"),
            ]);
        read_json(PROVIDER, send(PROVIDER, req).await?).await
    }

    async fn message(&self, cred: &Credential, message_id: &str) -> Result<Option<RawMessage>> {
        let req = self
            .client
            .get(self.url(&format!("messages/{message_id}")))
            .bearer_auth(&cred.access_token)
            .query(&[("format", "full")]);
        let resp = send(PROVIDER, req).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_json(PROVIDER, resp).await.map(Some)
    }
}

#[async_trait]
impl InboxApi for MailAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn whoami(&self, cred: &Credential) -> Result<String> {
        Ok(self.profile(cred).await?.email_address.to_lowercase())
    }

    async fn list_conversations(&self, cred: &Credential) -> Result<Vec<ConversationSnapshot>> {
        let req = self
            .client
            .get(self.url("threads"))
            .bearer_auth(&cred.access_token)
            .query(&[("maxResults", THREAD_LIST_SIZE)]);
        let list: ThreadList = read_json(PROVIDER, send(PROVIDER, req).await?).await?;

        stream::iter(list.threads)
            .map(|t| async move {
                let thread = self.thread(cred, &t.id, "metadata").await?;
                Ok::<_, Error>(snapshot(&thread))
            })
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn messages(
        &self,
        cred: &Credential,
        conversation_id: &str,
        _cursor: Option<&str>,
    ) -> Result<MessagePage> {
        // A thread is returned whole; there is nothing older to page to.
        let thread = self.thread(cred, conversation_id, "full").await?;
        let last_read = read_marker(&thread.messages);
        let self_address = cred.metadata.account_ref.as_deref();
        let mut messages: Vec<Message> = thread
            .messages
            .into_iter()
            .map(|m| m.into_message(self_address))
            .collect();
        messages.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
        Ok(MessagePage {
            messages,
            next_cursor: None,
            last_read,
        })
    }

    async fn send(
        &self,
        cred: &Credential,
        target: &SendTarget,
        text: &str,
    ) -> Result<SendReceipt> {
        let body = match target {
            SendTarget::Recipient(address) => json!({ "raw": build_raw(address, "", text) }),
            SendTarget::Conversation(thread_id) => {
                let thread = self.thread(cred, thread_id, "metadata").await?;
                let anchor = thread
                    .messages
                    .iter()
                    .filter(|m| !m.is_outgoing())
                    .max_by_key(|m| m.timestamp())
                    .or_else(|| thread.messages.iter().max_by_key(|m| m.timestamp()))
                    .ok_or_else(|| Error::NotFound(format!("mail thread {thread_id} is empty")))?;
                let subject = anchor.header("Subject").unwrap_or_default();
                let subject = if subject.to_lowercase().starts_with("re:") || subject.is_empty() {
                    subject.to_string()
                } else {
                    format!("Re: {subject}")
                };
                json!({
                    "raw": build_raw(&anchor.counterpart(), &subject, text),
                    "threadId": thread_id,
                })
            }
        };
        let req = self
            .client
            .post(self.url("messages/send"))
            .bearer_auth(&cred.access_token)
            .json(&body);
        let sent: SentMessage = read_json(PROVIDER, send(PROVIDER, req).await?).await?;
        Ok(SendReceipt {
            conversation_id: sent.thread_id,
            provider_message_id: Some(sent.id),
        })
    }

    async fn mark_read(
        &self,
        cred: &Credential,
        conversation_id: &str,
        up_to: DateTime<Utc>,
    ) -> Result<()> {
        let thread = self.thread(cred, conversation_id, "metadata").await?;
        let ids: Vec<&str> = thread
            .messages
            .iter()
            .filter(|m| m.is_unread() && m.timestamp() <= up_to)
            .map(|m| m.id.as_str())
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let req = self
            .client
            .post(self.url("messages/batchModify"))
            .bearer_auth(&cred.access_token)
            .json(&json!({ "ids": ids, "removeLabelIds": [UNREAD_LABEL] }));
        super::http::check_status(PROVIDER, send(PROVIDER, req).await?).await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MailAdapter {
    async fn current_cursor(&self, cred: &Credential) -> Result<SyncCursor> {
        Ok(SyncCursor::new(self.profile(cred).await?.history_id))
    }

    async fn changes_since(&self, cred: &Credential, cursor: &SyncCursor) -> Result<ChangeSet> {
        let mut changes = Vec::new();
        let mut page_token: Option<String> = None;
        let mut latest: Option<String> = None;

        for _ in 0..MAX_HISTORY_PAGES {
            let mut req = self
                .client
                .get(self.url("history"))
                .bearer_auth(&cred.access_token)
                .query(&[
                    ("startHistoryId", cursor.as_str()),
                    ("historyTypes", "messageAdded"),
                    ("maxResults", "100"),
                ]);
            if let Some(tok) = &page_token {
                req = req.query(&[("pageToken", tok.as_str())]);
            }
            let resp = send(PROVIDER, req).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(Error::CursorInvalid { provider: PROVIDER });
            }
            let body: HistoryResponse = read_json(PROVIDER, resp).await?;
            latest = body.history_id.or(latest);

            for record in body.history {
                let Ok(sequence) = record.id.parse::<u64>() else {
                    log::warn!("Skipping mail history record with id {:?}", record.id);
                    continue;
                };
                for added in record.messages_added {
                    changes.push(Change {
                        sequence,
                        message_id: added.message.id,
                        conversation_hint: added.message.thread_id,
                    });
                }
            }

            page_token = body.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        if page_token.is_some() {
            // Stop at the last applied record so the next run picks up the rest.
            if let Some(last) = changes.iter().map(|c| c.sequence).max() {
                latest = Some(last.to_string());
            }
        }

        Ok(ChangeSet {
            changes,
            next_cursor: latest.map(SyncCursor::new).unwrap_or_else(|| cursor.clone()),
        })
    }

    async fn resolve(&self, cred: &Credential, change: &Change) -> Result<Option<Message>> {
        let self_address = cred.metadata.account_ref.as_deref();
        Ok(self
            .message(cred, &change.message_id)
            .await?
            .map(|m| m.into_message(self_address)))
    }

    async fn bootstrap(&self, cred: &Credential, limit: usize) -> Result<Bootstrap> {
        // Captured first so anything arriving during the listing is replayed.
        let cursor = self.current_cursor(cred).await?;

        let req = self
            .client
            .get(self.url("messages"))
            .bearer_auth(&cred.access_token)
            .query(&[("maxResults", limit.to_string())]);
        let list: MessageList = read_json(PROVIDER, send(PROVIDER, req).await?).await?;

        let self_address = cred.metadata.account_ref.as_deref();
        let fetched: Vec<Option<RawMessage>> = stream::iter(list.messages)
            .map(|m| async move { self.message(cred, &m.id).await })
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        let messages = fetched
            .into_iter()
            .flatten()
            .map(|m| m.into_message(self_address))
            .collect();

        Ok(Bootstrap { messages, cursor })
    }
}

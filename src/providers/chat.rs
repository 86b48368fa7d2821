//! Chat adapter (Slack-shaped Web API). Channels and DMs are conversations;
//! a message's `ts` string is its id and its timestamp.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::http::{read_json, send};
use super::InboxApi;
use crate::error::{Error, Result};
use crate::model::{
    ConversationSnapshot, Credential, DeliveryState, Direction, Message, MessagePage, Provider,
    SendReceipt, SendTarget,
};
use crate::time_util::{format_chat_ts, parse_chat_ts};

const PROVIDER: Provider = Provider::Chat;
const PAGE_SIZE: &str = "50";
const MAX_LIST_PAGES: usize = 5;
const INFO_CONCURRENCY: usize = 4;

#[derive(Debug, Deserialize)]
struct AuthTest {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct ChannelList {
    #[serde(default)]
    channels: Vec<ChannelRef>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
struct ChannelRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ResponseMetadata {
    next_cursor: Option<String>,
}

impl ResponseMetadata {
    fn cursor(meta: Option<Self>) -> Option<String> {
        meta.and_then(|m| m.next_cursor).filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    id: String,
    /// Counterpart of a direct message.
    user: Option<String>,
    name: Option<String>,
    last_read: Option<String>,
    latest: Option<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct History {
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    has_more: bool,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessage {
    ts: String,
    user: Option<String>,
    bot_id: Option<String>,
    #[serde(default)]
    text: String,
    subtype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Posted {
    channel: String,
    ts: String,
}

#[derive(Debug, Deserialize)]
struct Opened {
    channel: ChannelRef,
}

impl ChatMessage {
    fn sender(&self) -> String {
        self.user
            .clone()
            .or_else(|| self.bot_id.clone())
            .unwrap_or_default()
    }

    /// Joins, topic changes and the like carry no conversation content.
    fn is_conversational(&self) -> bool {
        matches!(
            self.subtype.as_deref(),
            None | Some("bot_message") | Some("file_share") | Some("thread_broadcast")
        )
    }

    fn into_message(self, conversation_id: &str, self_id: Option<&str>) -> Option<Message> {
        let timestamp = parse_chat_ts(&self.ts)?;
        let sender_ref = self.sender();
        let outgoing = self_id.is_some_and(|me| me == sender_ref);
        Some(Message {
            id: self.ts,
            provider: PROVIDER,
            conversation_id: conversation_id.to_string(),
            sender_ref,
            content: self.text,
            timestamp,
            direction: if outgoing {
                Direction::Outgoing
            } else {
                Direction::Incoming
            },
            delivery_state: DeliveryState::Delivered,
        })
    }
}

fn api_error(code: &str) -> Error {
    match code {
        "invalid_auth" | "not_authed" | "token_expired" | "token_revoked" | "account_inactive" => {
            Error::TokenInvalid { provider: PROVIDER }
        }
        "ratelimited" => Error::RateLimited {
            provider: PROVIDER,
            retry_after: None,
        },
        "fatal_error" | "internal_error" | "service_unavailable" | "request_timeout" => {
            Error::ProviderUnavailable {
                provider: PROVIDER,
                message: code.to_string(),
            }
        }
        other => Error::Api {
            provider: PROVIDER,
            status: 200,
            message: other.to_string(),
        },
    }
}

fn snapshot(channel: Channel, self_id: Option<&str>) -> ConversationSnapshot {
    let latest = channel.latest;
    let latest_ts = latest.as_ref().and_then(|m| parse_chat_ts(&m.ts));
    let latest_incoming = latest
        .as_ref()
        .filter(|m| self_id != Some(m.sender().as_str()))
        .and(latest_ts);
    ConversationSnapshot {
        participant_ref: channel
            .user
            .or(channel.name)
            .unwrap_or_else(|| channel.id.clone()),
        id: channel.id,
        provider: PROVIDER,
        last_message_timestamp: latest_ts,
        preview: latest.map(|m| m.text).unwrap_or_default(),
        last_read: channel.last_read.as_deref().and_then(parse_chat_ts),
        latest_incoming,
    }
}

pub struct ChatAdapter {
    client: Client,
    base: String,
}

impl ChatAdapter {
    pub fn new(client: Client, base: &str) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn get(&self, cred: &Credential, method: &str) -> RequestBuilder {
        self.client
            .get(format!("{}/{method}", self.base))
            .bearer_auth(&cred.access_token)
    }

    fn post(&self, cred: &Credential, method: &str, body: Value) -> RequestBuilder {
        self.client
            .post(format!("{}/{method}", self.base))
            .bearer_auth(&cred.access_token)
            .json(&body)
    }

    /// The Web API answers 200 with `ok: false` for most failures.
    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let value: Value = read_json(PROVIDER, send(PROVIDER, req).await?).await?;
        if value.get("ok").and_then(Value::as_bool) != Some(true) {
            let code = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(api_error(code));
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn info(&self, cred: &Credential, channel: &str) -> Result<Channel> {
        let req = self
            .get(cred, "conversations.info")
            .query(&[("channel", channel)]);
        Ok(self.call::<ChannelInfo>(req).await?.channel)
    }
}

#[async_trait]
impl InboxApi for ChatAdapter {
    fn provider(&self) -> Provider {
        PROVIDER
    }

    async fn whoami(&self, cred: &Credential) -> Result<String> {
        let auth: AuthTest = self.call(self.get(cred, "auth.test")).await?;
        Ok(auth.user_id)
    }

    async fn list_conversations(&self, cred: &Credential) -> Result<Vec<ConversationSnapshot>> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_LIST_PAGES {
            let mut req = self.get(cred, "conversations.list").query(&[
                ("types", "im,mpim,private_channel,public_channel"),
                ("exclude_archived", "true"),
                ("limit", "100"),
            ]);
            if let Some(c) = &cursor {
                req = req.query(&[("cursor", c.as_str())]);
            }
            let page: ChannelList = self.call(req).await?;
            ids.extend(page.channels.into_iter().map(|c| c.id));
            cursor = ResponseMetadata::cursor(page.response_metadata);
            if cursor.is_none() {
                break;
            }
        }

        let self_id = cred.metadata.account_ref.as_deref();
        stream::iter(ids)
            .map(|id| async move {
                let channel = self.info(cred, &id).await?;
                Ok::<_, Error>(snapshot(channel, self_id))
            })
            .buffered(INFO_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn messages(
        &self,
        cred: &Credential,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> Result<MessagePage> {
        let mut req = self
            .get(cred, "conversations.history")
            .query(&[("channel", conversation_id), ("limit", PAGE_SIZE)]);
        if let Some(c) = cursor {
            req = req.query(&[("cursor", c)]);
        }
        let history: History = self.call(req).await?;

        let self_id = cred.metadata.account_ref.as_deref();
        let mut messages: Vec<Message> = history
            .messages
            .into_iter()
            .filter(ChatMessage::is_conversational)
            .filter_map(|m| m.into_message(conversation_id, self_id))
            .collect();
        messages.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));

        let next_cursor = if history.has_more {
            ResponseMetadata::cursor(history.response_metadata)
        } else {
            None
        };
        // The read marker only matters for the newest page.
        let last_read = match cursor {
            None => self
                .info(cred, conversation_id)
                .await?
                .last_read
                .as_deref()
                .and_then(parse_chat_ts),
            Some(_) => None,
        };

        Ok(MessagePage {
            messages,
            next_cursor,
            last_read,
        })
    }

    async fn send(
        &self,
        cred: &Credential,
        target: &SendTarget,
        text: &str,
    ) -> Result<SendReceipt> {
        let channel = match target {
            SendTarget::Conversation(id) => id.clone(),
            SendTarget::Recipient(user) => {
                let req = self.post(cred, "conversations.open", json!({ "users": user }));
                self.call::<Opened>(req).await?.channel.id
            }
        };
        let req = self.post(
            cred,
            "chat.postMessage",
            json!({ "channel": channel, "text": text }),
        );
        let posted: Posted = self.call(req).await?;
        Ok(SendReceipt {
            conversation_id: posted.channel,
            provider_message_id: Some(posted.ts),
        })
    }

    async fn mark_read(
        &self,
        cred: &Credential,
        conversation_id: &str,
        up_to: DateTime<Utc>,
    ) -> Result<()> {
        let req = self.post(
            cred,
            "conversations.mark",
            json!({ "channel": conversation_id, "ts": format_chat_ts(up_to) }),
        );
        self.call::<Value>(req).await?;
        Ok(())
    }
}

//! Social adapter for the shared Graph API. One instance per platform
//! (`messenger`, `instagram`); both page through `/me/conversations`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::http::{retry_after, send, status_error};
use super::{Bootstrap, Change, ChangeFeed, ChangeSet, InboxApi};
use crate::error::{Error, Result};
use crate::model::{
    ConversationSnapshot, Credential, DeliveryState, Direction, Message, MessagePage, Provider,
    SendReceipt, SendTarget, SyncCursor,
};
use crate::time_util::parse_graph_time;

const PAGE_SIZE: &str = "25";
const MAX_CONVERSATION_PAGES: usize = 5;
/// Change scans walk further than listings. Past these the backlog is
/// treated as a lost cursor.
const MAX_CHANGE_PAGES: usize = 40;
const MAX_MESSAGE_PAGES: usize = 20;
const CONVERSATION_FIELDS: &str =
    "id,updated_time,unread_count,participants,messages.limit(10){id,message,from,created_time}";
const MESSAGE_FIELDS: &str = "id,message,from,created_time";

#[derive(Debug, Deserialize)]
struct Me {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Paged<T> {
    #[serde(default)]
    data: Vec<T>,
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    cursors: Option<Cursors>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Cursors {
    after: Option<String>,
}

impl<T> Paged<T> {
    /// The `after` cursor, only when the provider says there is more.
    fn after(&self) -> Option<String> {
        let paging = self.paging.as_ref()?;
        paging.next.as_ref()?;
        paging.cursors.as_ref()?.after.clone()
    }
}

#[derive(Debug, Deserialize)]
struct GraphConversation {
    id: String,
    updated_time: Option<String>,
    unread_count: Option<u32>,
    participants: Option<Paged<Participant>>,
    messages: Option<Paged<GraphMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
struct Participant {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphMessage {
    id: String,
    message: Option<String>,
    from: Option<Participant>,
    created_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnreadOnly {
    unread_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    recipient_id: Option<String>,
    message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i64,
}

impl GraphMessage {
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.created_time.as_deref().and_then(parse_graph_time)
    }

    fn is_from(&self, self_id: Option<&str>) -> bool {
        match (self.from.as_ref(), self_id) {
            (Some(from), Some(me)) => from.id == me,
            _ => false,
        }
    }

    fn into_message(
        self,
        provider: Provider,
        conversation_id: &str,
        self_id: Option<&str>,
    ) -> Option<Message> {
        let timestamp = self.timestamp()?;
        let outgoing = self.is_from(self_id);
        Some(Message {
            id: self.id,
            provider,
            conversation_id: conversation_id.to_string(),
            sender_ref: self.from.map(|f| f.id).unwrap_or_default(),
            content: self.message.unwrap_or_default(),
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

/// Graph reports a per-conversation unread count rather than a position.
/// The marker sits just before the `unread`-th newest incoming message; a
/// zero count puts it at the newest incoming message.
fn marker_from_unread_count(
    incoming_newest_first: &[DateTime<Utc>],
    unread: u32,
) -> Option<DateTime<Utc>> {
    if unread == 0 {
        return incoming_newest_first.first().copied();
    }
    match incoming_newest_first.get(unread as usize - 1) {
        Some(ts) => Some(*ts - chrono::Duration::milliseconds(1)),
        None => Some(DateTime::<Utc>::UNIX_EPOCH),
    }
}

fn incoming_newest_first(messages: &[GraphMessage], self_id: Option<&str>) -> Vec<DateTime<Utc>> {
    let mut out: Vec<DateTime<Utc>> = messages
        .iter()
        .filter(|m| !m.is_from(self_id))
        .filter_map(GraphMessage::timestamp)
        .collect();
    out.sort_by(|a, b| b.cmp(a));
    out
}

fn millis(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

fn graph_error(provider: Provider, status: reqwest::StatusCode, err: GraphError) -> Error {
    match err.code {
        190 | 102 => Error::TokenInvalid { provider },
        4 | 17 | 32 | 613 => Error::RateLimited {
            provider,
            retry_after: None,
        },
        1 | 2 => Error::ProviderUnavailable {
            provider,
            message: err.message,
        },
        _ if status.is_server_error() => Error::ProviderUnavailable {
            provider,
            message: err.message,
        },
        _ => Error::Api {
            provider,
            status: status.as_u16(),
            message: format!("({}) {}", err.code, err.message),
        },
    }
}

pub struct GraphAdapter {
    client: Client,
    base: String,
    provider: Provider,
}

impl GraphAdapter {
    /// `provider` must be `Messenger` or `Instagram`.
    pub fn new(client: Client, base: &str, provider: Provider) -> Self {
        debug_assert!(provider.is_social_graph());
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            provider,
        }
    }

    fn platform(&self) -> &'static str {
        match self.provider {
            Provider::Instagram => "instagram",
            _ => "messenger",
        }
    }

    fn get(&self, cred: &Credential, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}/{path}", self.base))
            .bearer_auth(&cred.access_token)
    }

    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = send(self.provider, req).await?;
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<T>()
                .await
                .map_err(|e| Error::transport(self.provider, e));
        }
        let after = retry_after(&resp);
        let body = resp.text().await.unwrap_or_default();
        let err = match serde_json::from_str::<GraphErrorEnvelope>(&body) {
            Ok(envelope) => match graph_error(self.provider, status, envelope.error) {
                Error::RateLimited { provider, .. } => Error::RateLimited {
                    provider,
                    retry_after: after,
                },
                other => other,
            },
            Err(_) => status_error(self.provider, status, after, &body),
        };
        Err(err)
    }

    async fn conversations_page(
        &self,
        cred: &Credential,
        after: Option<&str>,
        extra: &[(&str, &str)],
    ) -> Result<Paged<GraphConversation>> {
        let mut req = self.get(cred, "me/conversations").query(&[
            ("platform", self.platform()),
            ("fields", CONVERSATION_FIELDS),
            ("limit", PAGE_SIZE),
        ]);
        if !extra.is_empty() {
            req = req.query(extra);
        }
        if let Some(a) = after {
            req = req.query(&[("after", a)]);
        }
        self.call(req).await
    }

    /// Messages of one conversation newer than `since`. Starts from the page
    /// embedded in the listing and follows the messages edge while every
    /// message seen is still newer.
    async fn messages_since(
        &self,
        cred: &Credential,
        conversation_id: &str,
        embedded: Option<Paged<GraphMessage>>,
        since: u64,
    ) -> Result<Vec<GraphMessage>> {
        let edge = |after: Option<&str>| {
            let mut req = self
                .get(cred, &format!("{conversation_id}/messages"))
                .query(&[("fields", MESSAGE_FIELDS), ("limit", PAGE_SIZE)]);
            if let Some(a) = after {
                req = req.query(&[("after", a)]);
            }
            req
        };
        let mut page = match embedded {
            Some(page) => page,
            None => self.call(edge(None)).await?,
        };

        let mut out = Vec::new();
        let mut fetched = 0;
        loop {
            let after = page.after();
            let mut reached = false;
            for m in page.data {
                match m.timestamp() {
                    Some(ts) if millis(ts) > since => out.push(m),
                    Some(_) => reached = true,
                    None => {}
                }
            }
            let Some(after) = after else {
                return Ok(out);
            };
            if reached {
                return Ok(out);
            }
            if fetched == MAX_MESSAGE_PAGES {
                log::warn!(
                    "{} conversation {conversation_id} has more than {} new pages",
                    self.provider,
                    MAX_MESSAGE_PAGES
                );
                return Err(Error::CursorInvalid {
                    provider: self.provider,
                });
            }
            fetched += 1;
            page = self.call(edge(Some(&after))).await?;
        }
    }

    fn snapshot(&self, conv: GraphConversation, self_id: Option<&str>) -> ConversationSnapshot {
        let messages = conv.messages.map(|p| p.data).unwrap_or_default();
        let incoming = incoming_newest_first(&messages, self_id);
        let latest = messages.iter().filter_map(GraphMessage::timestamp).max();
        let preview = messages
            .iter()
            .max_by_key(|m| m.timestamp())
            .and_then(|m| m.message.clone())
            .unwrap_or_default();
        let participant_ref = conv
            .participants
            .map(|p| p.data)
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.id)
            .find(|id| Some(id.as_str()) != self_id)
            .unwrap_or_default();
        ConversationSnapshot {
            id: conv.id,
            provider: self.provider,
            participant_ref,
            last_message_timestamp: latest
                .or_else(|| conv.updated_time.as_deref().and_then(parse_graph_time)),
            preview,
            last_read: conv
                .unread_count
                .and_then(|n| marker_from_unread_count(&incoming, n)),
            latest_incoming: incoming.first().copied(),
        }
    }

    async fn send_to(&self, cred: &Credential, recipient: &str, text: &str) -> Result<SendResponse> {
        let req = self
            .client
            .post(format!("{}/me/messages", self.base))
            .bearer_auth(&cred.access_token)
            .json(&json!({
                "recipient": { "id": recipient },
                "message": { "text": text },
                "messaging_type": "RESPONSE",
            }));
        self.call(req).await
    }

    async fn counterpart(&self, cred: &Credential, conversation_id: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct WithParticipants {
            participants: Option<Paged<Participant>>,
        }
        let req = self
            .get(cred, conversation_id)
            .query(&[("fields", "participants")]);
        let conv: WithParticipants = self.call(req).await?;
        let self_id = cred.metadata.account_ref.as_deref();
        conv.participants
            .map(|p| p.data)
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.id)
            .find(|id| Some(id.as_str()) != self_id)
            .ok_or_else(|| Error::NotFound(format!("no counterpart in {conversation_id}")))
    }
}

#[async_trait]
impl InboxApi for GraphAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn whoami(&self, cred: &Credential) -> Result<String> {
        let me: Me = self.call(self.get(cred, "me").query(&[("fields", "id")])).await?;
        Ok(me.id)
    }

    async fn list_conversations(&self, cred: &Credential) -> Result<Vec<ConversationSnapshot>> {
        let self_id = cred.metadata.account_ref.as_deref();
        let mut out = Vec::new();
        let mut after: Option<String> = None;
        for _ in 0..MAX_CONVERSATION_PAGES {
            let page = self.conversations_page(cred, after.as_deref(), &[]).await?;
            after = page.after();
            out.extend(page.data.into_iter().map(|c| self.snapshot(c, self_id)));
            if after.is_none() {
                break;
            }
        }
        Ok(out)
    }

    async fn messages(
        &self,
        cred: &Credential,
        conversation_id: &str,
        cursor: Option<&str>,
    ) -> Result<MessagePage> {
        let mut req = self
            .get(cred, &format!("{conversation_id}/messages"))
            .query(&[("fields", MESSAGE_FIELDS), ("limit", PAGE_SIZE)]);
        if let Some(c) = cursor {
            req = req.query(&[("after", c)]);
        }
        let page: Paged<GraphMessage> = self.call(req).await?;
        let next_cursor = page.after();
        let self_id = cred.metadata.account_ref.as_deref();

        let last_read = match cursor {
            None => {
                let req = self
                    .get(cred, conversation_id)
                    .query(&[("fields", "unread_count")]);
                let unread: UnreadOnly = self.call(req).await?;
                let incoming = incoming_newest_first(&page.data, self_id);
                unread
                    .unread_count
                    .and_then(|n| marker_from_unread_count(&incoming, n))
            }
            Some(_) => None,
        };

        let mut messages: Vec<Message> = page
            .data
            .into_iter()
            .filter_map(|m| m.into_message(self.provider, conversation_id, self_id))
            .collect();
        messages.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));

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
        match target {
            SendTarget::Conversation(conversation_id) => {
                let recipient = self.counterpart(cred, conversation_id).await?;
                let sent = self.send_to(cred, &recipient, text).await?;
                Ok(SendReceipt {
                    conversation_id: conversation_id.clone(),
                    provider_message_id: sent.message_id,
                })
            }
            SendTarget::Recipient(recipient) => {
                let sent = self.send_to(cred, recipient, text).await?;
                let user = sent.recipient_id.unwrap_or_else(|| recipient.clone());
                let page = self
                    .conversations_page(cred, None, &[("user_id", user.as_str())])
                    .await?;
                let conversation_id = match page.data.into_iter().next() {
                    Some(conv) => conv.id,
                    None => {
                        log::debug!(
                            "{} conversation with {user} not listed yet, keying by recipient",
                            self.provider
                        );
                        user
                    }
                };
                Ok(SendReceipt {
                    conversation_id,
                    provider_message_id: sent.message_id,
                })
            }
        }
    }

    async fn mark_read(
        &self,
        cred: &Credential,
        conversation_id: &str,
        _up_to: DateTime<Utc>,
    ) -> Result<()> {
        // The platform only knows "seen everything".
        let recipient = self.counterpart(cred, conversation_id).await?;
        let req = self
            .client
            .post(format!("{}/me/messages", self.base))
            .bearer_auth(&cred.access_token)
            .json(&json!({
                "recipient": { "id": recipient },
                "sender_action": "mark_seen",
            }));
        self.call::<serde_json::Value>(req).await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for GraphAdapter {
    async fn current_cursor(&self, cred: &Credential) -> Result<SyncCursor> {
        let page = self.conversations_page(cred, None, &[]).await?;
        let newest = page
            .data
            .iter()
            .filter_map(|c| c.updated_time.as_deref().and_then(parse_graph_time))
            .map(millis)
            .max()
            .unwrap_or(0);
        Ok(SyncCursor::from(newest))
    }

    async fn changes_since(&self, cred: &Credential, cursor: &SyncCursor) -> Result<ChangeSet> {
        let since = cursor.sequence().ok_or(Error::CursorInvalid {
            provider: self.provider,
        })?;
        let self_id = cred.metadata.account_ref.as_deref();

        let mut changes = Vec::new();
        let mut newest = since;
        let mut after: Option<String> = None;
        let mut pages = 0;
        loop {
            if pages == MAX_CHANGE_PAGES {
                log::warn!(
                    "{} has more than {} pages of conversations changed since {since}",
                    self.provider,
                    MAX_CHANGE_PAGES
                );
                return Err(Error::CursorInvalid {
                    provider: self.provider,
                });
            }
            pages += 1;
            let page = self.conversations_page(cred, after.as_deref(), &[]).await?;
            let next = page.after();
            // Listed newest first; stop at the first conversation not touched since.
            let mut reached = false;
            for conv in page.data {
                let updated = conv
                    .updated_time
                    .as_deref()
                    .and_then(parse_graph_time)
                    .map(millis)
                    .unwrap_or(0);
                if updated <= since {
                    reached = true;
                    break;
                }
                newest = newest.max(updated);
                let messages = self
                    .messages_since(cred, &conv.id, conv.messages, since)
                    .await?;
                for m in messages {
                    let Some(ts) = m.timestamp() else { continue };
                    changes.push(Change {
                        sequence: millis(ts),
                        message_id: m.id,
                        conversation_hint: Some(conv.id.clone()),
                    });
                }
            }
            match next {
                Some(next) if !reached => after = Some(next),
                _ => break,
            }
        }
        log::debug!(
            "{} changes since {since} for {self_id:?}: {}",
            self.provider,
            changes.len()
        );

        Ok(ChangeSet {
            changes,
            next_cursor: SyncCursor::from(newest),
        })
    }

    async fn resolve(&self, cred: &Credential, change: &Change) -> Result<Option<Message>> {
        let Some(conversation_id) = change.conversation_hint.as_deref() else {
            return Err(Error::Parse(format!(
                "{} change {} has no conversation",
                self.provider, change.message_id
            )));
        };
        let req = self
            .get(cred, &change.message_id)
            .query(&[("fields", MESSAGE_FIELDS)]);
        let raw: GraphMessage = match self.call(req).await {
            Ok(m) => m,
            Err(Error::Api { status: 404, .. }) => return Ok(None),
            Err(Error::Api { message, .. }) if message.starts_with("(100)") => return Ok(None),
            Err(e) => return Err(e),
        };
        let self_id = cred.metadata.account_ref.as_deref();
        Ok(raw.into_message(self.provider, conversation_id, self_id))
    }

    async fn bootstrap(&self, cred: &Credential, limit: usize) -> Result<Bootstrap> {
        let cursor = self.current_cursor(cred).await?;
        let self_id = cred.metadata.account_ref.as_deref();

        let mut messages = Vec::new();
        let mut after: Option<String> = None;
        for _ in 0..MAX_CONVERSATION_PAGES {
            let page = self.conversations_page(cred, after.as_deref(), &[]).await?;
            after = page.after();
            for conv in page.data {
                let inline = conv.messages.map(|p| p.data).unwrap_or_default();
                messages.extend(
                    inline
                        .into_iter()
                        .filter_map(|m| m.into_message(self.provider, &conv.id, self_id)),
                );
            }
            if messages.len() >= limit || after.is_none() {
                break;
            }
        }
        messages.sort_by(|a: &Message, b: &Message| b.timestamp.cmp(&a.timestamp));
        messages.truncate(limit);

        Ok(Bootstrap { messages, cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProviderMetadata;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cred(provider: Provider) -> Credential {
        Credential {
            user_id: "u1".into(),
            provider,
            access_token: "page-token".into(),
            refresh_token: None,
            expires_at: None,
            metadata: ProviderMetadata {
                account_ref: Some("PAGE".into()),
                ..Default::default()
            },
        }
    }

    fn conversations_body() -> serde_json::Value {
        json!({
            "data": [
                {
                    "id": "c2",
                    "updated_time": "2024-05-01T10:00:05+0000",
                    "unread_count": 1,
                    "participants": {"data": [{"id": "PAGE"}, {"id": "PSID2"}]},
                    "messages": {"data": [
                        {"id": "m3", "message": "are you there?", "from": {"id": "PSID2"}, "created_time": "2024-05-01T10:00:05+0000"},
                        {"id": "m2", "message": "hi", "from": {"id": "PAGE"}, "created_time": "2024-05-01T10:00:02+0000"}
                    ]}
                },
                {
                    "id": "c1",
                    "updated_time": "2024-05-01T09:00:00+0000",
                    "unread_count": 0,
                    "participants": {"data": [{"id": "PSID1"}, {"id": "PAGE"}]},
                    "messages": {"data": [
                        {"id": "m1", "message": "thanks", "from": {"id": "PSID1"}, "created_time": "2024-05-01T09:00:00+0000"}
                    ]}
                }
            ]
        })
    }

    #[test]
    fn test_marker_from_unread_count() {
        let t = |s: i64| DateTime::<Utc>::from_timestamp(s, 0).unwrap();
        let incoming = vec![t(30), t(20), t(10)];
        assert_eq!(marker_from_unread_count(&incoming, 0), Some(t(30)));
        assert_eq!(
            marker_from_unread_count(&incoming, 2),
            Some(t(20) - chrono::Duration::milliseconds(1))
        );
        assert_eq!(
            marker_from_unread_count(&incoming, 5),
            Some(DateTime::<Utc>::UNIX_EPOCH)
        );
        assert_eq!(marker_from_unread_count(&[], 0), None);
    }

    #[tokio::test]
    async fn test_list_conversations_by_platform() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/conversations"))
            .and(query_param("platform", "instagram"))
            .respond_with(ResponseTemplate::new(200).set_body_json(conversations_body()))
            .mount(&server)
            .await;

        let adapter = GraphAdapter::new(Client::new(), &server.uri(), Provider::Instagram);
        let snaps = adapter
            .list_conversations(&cred(Provider::Instagram))
            .await
            .unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].participant_ref, "PSID2");
        assert_eq!(snaps[0].preview, "are you there?");
        assert!(snaps[0].latest_incoming > snaps[0].last_read);
        assert_eq!(snaps[1].participant_ref, "PSID1");
        assert_eq!(snaps[1].latest_incoming, snaps[1].last_read);
    }

    #[tokio::test]
    async fn test_expired_token_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "Error validating access token", "type": "OAuthException", "code": 190}
            })))
            .mount(&server)
            .await;

        let adapter = GraphAdapter::new(Client::new(), &server.uri(), Provider::Messenger);
        let err = adapter.whoami(&cred(Provider::Messenger)).await.unwrap_err();
        assert!(matches!(err, Error::TokenInvalid { .. }));
    }

    #[tokio::test]
    async fn test_changes_since_updated_time() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(conversations_body()))
            .mount(&server)
            .await;

        let adapter = GraphAdapter::new(Client::new(), &server.uri(), Provider::Messenger);
        // 2024-05-01T10:00:00Z
        let since = SyncCursor::from(1_714_557_600_000u64);
        let set = adapter
            .changes_since(&cred(Provider::Messenger), &since)
            .await
            .unwrap();
        let ids: Vec<&str> = set.changes.iter().map(|c| c.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m2"]);
        assert_eq!(set.next_cursor.sequence(), Some(1_714_557_605_000));

        let err = adapter
            .changes_since(&cred(Provider::Messenger), &SyncCursor::new("garbage"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CursorInvalid { .. }));
    }

    #[tokio::test]
    async fn test_changes_follow_messages_past_embedded_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": "c9",
                    "updated_time": "2024-05-01T10:00:09+0000",
                    "messages": {
                        "data": [
                            {"id": "m5", "message": "5", "from": {"id": "PSID9"}, "created_time": "2024-05-01T10:00:09+0000"},
                            {"id": "m4", "message": "4", "from": {"id": "PSID9"}, "created_time": "2024-05-01T10:00:08+0000"}
                        ],
                        "paging": {"cursors": {"before": "P1", "after": "P2"}, "next": "https://graph/c9/messages?after=P2"}
                    }
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/c9/messages"))
            .and(query_param("after", "P2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"id": "m3", "message": "3", "from": {"id": "PSID9"}, "created_time": "2024-05-01T10:00:07+0000"},
                    {"id": "m2", "message": "2", "from": {"id": "PSID9"}, "created_time": "2024-05-01T09:59:00+0000"}
                ],
                "paging": {"cursors": {"after": "P3"}, "next": "https://graph/c9/messages?after=P3"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = GraphAdapter::new(Client::new(), &server.uri(), Provider::Messenger);
        let since = SyncCursor::from(1_714_557_600_000u64);
        let set = adapter
            .changes_since(&cred(Provider::Messenger), &since)
            .await
            .unwrap();
        let ids: Vec<&str> = set.changes.iter().map(|c| c.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m5", "m4", "m3"]);
        assert_eq!(set.next_cursor.sequence(), Some(1_714_557_609_000));
    }

    #[tokio::test]
    async fn test_unbounded_backlog_rejects_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/me/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{
                    "id": "c1",
                    "updated_time": "2024-05-01T10:00:09+0000",
                    "messages": {"data": []}
                }],
                "paging": {"cursors": {"after": "more"}, "next": "https://graph/me/conversations?after=more"}
            })))
            .mount(&server)
            .await;

        let adapter = GraphAdapter::new(Client::new(), &server.uri(), Provider::Instagram);
        let err = adapter
            .changes_since(
                &cred(Provider::Instagram),
                &SyncCursor::from(1_714_557_600_000u64),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CursorInvalid { .. }));
    }

    #[tokio::test]
    async fn test_send_to_conversation_resolves_recipient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/c2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "participants": {"data": [{"id": "PAGE"}, {"id": "PSID2"}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/me/messages"))
            .and(body_partial_json(json!({"recipient": {"id": "PSID2"}, "message": {"text": "yes"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "recipient_id": "PSID2", "message_id": "m4"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = GraphAdapter::new(Client::new(), &server.uri(), Provider::Messenger);
        let receipt = adapter
            .send(
                &cred(Provider::Messenger),
                &SendTarget::Conversation("c2".into()),
                "yes",
            )
            .await
            .unwrap();
        assert_eq!(receipt.conversation_id, "c2");
        assert_eq!(receipt.provider_message_id.as_deref(), Some("m4"));
    }
}

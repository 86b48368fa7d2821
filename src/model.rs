use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// A messaging back-end. Messenger and Instagram share one Graph API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Mail,
    Chat,
    Messenger,
    Instagram,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Mail,
        Provider::Chat,
        Provider::Messenger,
        Provider::Instagram,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Mail => "mail",
            Provider::Chat => "chat",
            Provider::Messenger => "messenger",
            Provider::Instagram => "instagram",
        }
    }

    pub fn is_social_graph(self) -> bool {
        matches!(self, Provider::Messenger | Provider::Instagram)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mail" | "gmail" => Ok(Provider::Mail),
            "chat" | "slack" => Ok(Provider::Chat),
            "messenger" | "facebook" => Ok(Provider::Messenger),
            "instagram" => Ok(Provider::Instagram),
            other => Err(Error::Config(format!("unknown provider: {other}"))),
        }
    }
}

// ── Credentials ────────────────────────────────────────────────────

/// Provider-specific data kept next to a credential.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// The provider-side account: mailbox address, chat user id, page or
    /// Instagram account id. Webhook deliveries are routed by it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_ref: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, PartialEq)]
pub struct Credential {
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: ProviderMetadata,
}

impl Credential {
    /// True when the token is expired or will be within `skew`.
    pub fn expires_within(&self, skew: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at - now <= skew)
    }

    /// Short, non-reversible identifier of the access token for log lines.
    pub fn fingerprint(&self) -> String {
        token_fingerprint(&self.access_token)
    }
}

// Tokens never reach log output through Debug.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("provider", &self.provider)
            .field("access_token", &format_args!("<{}>", self.fingerprint()))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("metadata", &self.metadata)
            .finish()
    }
}

pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest[..4].iter().map(|b| format!("{b:02x}")).collect()
}

/// Tokens issued by a provider's token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}

// ── Sync cursor ────────────────────────────────────────────────────

/// Opaque provider position marker. Mail uses a history id, the Graph
/// providers use epoch milliseconds; both order numerically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncCursor(pub String);

impl SyncCursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The numeric position, when the provider's cursor is numeric.
    pub fn sequence(&self) -> Option<u64> {
        self.0.trim().parse().ok()
    }
}

impl From<u64> for SyncCursor {
    fn from(v: u64) -> Self {
        Self(v.to_string())
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Messages & conversations ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming" => Some(Direction::Incoming),
            "outgoing" => Some(Direction::Outgoing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sending,
    Delivered,
    Seen,
    Failed,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            DeliveryState::Sending => 0,
            DeliveryState::Delivered => 1,
            DeliveryState::Seen => 2,
            DeliveryState::Failed => 3,
        }
    }

    /// Move towards `next` without ever going backwards. `Failed` is only
    /// reachable from `Sending` and is terminal.
    pub fn promote(self, next: DeliveryState) -> DeliveryState {
        match (self, next) {
            (DeliveryState::Failed, _) => DeliveryState::Failed,
            (DeliveryState::Sending, DeliveryState::Failed) => DeliveryState::Failed,
            (current, DeliveryState::Failed) => current,
            (current, next) if next.rank() > current.rank() => next,
            (current, _) => current,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Sending => "sending",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Seen => "seen",
            DeliveryState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sending" => Some(DeliveryState::Sending),
            "delivered" => Some(DeliveryState::Delivered),
            "seen" => Some(DeliveryState::Seen),
            "failed" => Some(DeliveryState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub provider: Provider,
    pub conversation_id: String,
    pub sender_ref: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub delivery_state: DeliveryState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub provider: Provider,
    pub participant_ref: String,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub unread: bool,
    pub preview: String,
}

/// What an adapter knows about a conversation before unread is derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub id: String,
    pub provider: Provider,
    pub participant_ref: String,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub preview: String,
    /// Provider-reported last-read position.
    pub last_read: Option<DateTime<Utc>>,
    /// Newest incoming message the provider reported.
    pub latest_incoming: Option<DateTime<Utc>>,
}

/// One page of messages. `next_cursor` points at older messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

/// A page of messages as an adapter returns it, with the conversation's
/// read marker when the provider reports one.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
    pub last_read: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    Conversation(String),
    Recipient(String),
}

/// Result of a send as the provider acknowledged it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub conversation_id: String,
    pub provider_message_id: Option<String>,
}

/// "Something changed for this user; the provider is at least at `at_least`."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSignal {
    pub user_id: String,
    pub provider: Provider,
    pub at_least: u64,
    pub receipts: Vec<ReadReceipt>,
}

/// The counterpart read everything up to `watermark` in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub participant_ref: String,
    pub watermark: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_state_is_monotonic() {
        use DeliveryState::*;
        assert_eq!(Sending.promote(Delivered), Delivered);
        assert_eq!(Delivered.promote(Seen), Seen);
        assert_eq!(Seen.promote(Delivered), Seen);
        assert_eq!(Delivered.promote(Sending), Delivered);
        assert_eq!(Sending.promote(Failed), Failed);
        assert_eq!(Delivered.promote(Failed), Delivered);
        assert_eq!(Failed.promote(Delivered), Failed);
        assert_eq!(Failed.promote(Seen), Failed);
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("gmail".parse::<Provider>().unwrap(), Provider::Mail);
        assert_eq!("Instagram".parse::<Provider>().unwrap(), Provider::Instagram);
        assert!("fax".parse::<Provider>().is_err());
        assert!(Provider::Messenger.is_social_graph());
        assert!(!Provider::Chat.is_social_graph());
    }

    #[test]
    fn test_credential_debug_redacts_tokens() {
        let cred = Credential {
            user_id: "u1".into(),
            provider: Provider::Mail,
            access_token: "ya29.secret-access".into(),
            refresh_token: Some("1//secret-refresh".into()),
            expires_at: None,
            metadata: ProviderMetadata::default(),
        };
        let out = format!("{cred:?}");
        assert!(!out.contains("secret-access"));
        assert!(!out.contains("secret-refresh"));
        assert!(out.contains(&cred.fingerprint()));
    }

    #[test]
    fn test_expires_within() {
        let now = Utc::now();
        let mut cred = Credential {
            user_id: "u1".into(),
            provider: Provider::Chat,
            access_token: "t".into(),
            refresh_token: None,
            expires_at: Some(now + Duration::minutes(2)),
            metadata: ProviderMetadata::default(),
        };
        assert!(cred.expires_within(Duration::minutes(5), now));
        cred.expires_at = Some(now + Duration::hours(1));
        assert!(!cred.expires_within(Duration::minutes(5), now));
        cred.expires_at = None;
        assert!(!cred.expires_within(Duration::minutes(5), now));
    }

    #[test]
    fn test_cursor_sequence() {
        assert_eq!(SyncCursor::new("100").sequence(), Some(100));
        assert_eq!(SyncCursor::new("dXNlcjpV").sequence(), None);
    }
}

//! Webhook ingestion: validate deliveries, drop the ones already processed,
//! and hand a change signal to the sync dispatcher. Nothing here touches
//! the message cache.

pub mod server;

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::{mpsc, Mutex};

use crate::config::Settings;
use crate::error::Error;
use crate::model::{ChangeSignal, Provider, ReadReceipt};
use crate::storage::{repository, Database};
use crate::time_util::from_millis;

pub use server::{router, WebhookServer};

/// Positive answer to a delivery. Every variant is acknowledged with 200 so
/// the provider stops redelivering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Accepted,
    /// Sequence not past the last one processed.
    Duplicate,
    /// Well-formed but for an account nobody connected.
    Ignored,
}

impl Ack {
    pub fn as_str(self) -> &'static str {
        match self {
            Ack::Accepted => "accepted",
            Ack::Duplicate => "duplicate",
            Ack::Ignored => "ignored",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Malformed(String),
    BadSignature,
    BadToken,
    VerificationFailed,
    /// The dispatcher is gone; the provider should retry later.
    Unavailable,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::Malformed(_) => "malformed_payload",
            Rejection::BadSignature => "invalid_signature",
            Rejection::BadToken => "invalid_token",
            Rejection::VerificationFailed => "verification_failed",
            Rejection::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Malformed(reason) => write!(f, "malformed payload: {reason}"),
            Rejection::BadSignature => f.write_str("signature verification failed"),
            Rejection::BadToken => f.write_str("push token mismatch"),
            Rejection::VerificationFailed => f.write_str("subscription verification failed"),
            Rejection::Unavailable => f.write_str("sync dispatcher unavailable"),
        }
    }
}

impl From<Rejection> for Error {
    fn from(r: Rejection) -> Self {
        Error::Webhook(r.to_string())
    }
}

pub type Outcome = std::result::Result<Ack, Rejection>;

/// `hub.*` query of the subscription handshake.
#[derive(Debug, Default, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

// ── Payloads ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailNotification {
    email_address: String,
    /// A number in practice, a string in some client libraries.
    history_id: Value,
}

#[derive(Debug, Deserialize)]
struct GraphDelivery {
    object: String,
    #[serde(default)]
    entry: Vec<GraphEntry>,
}

#[derive(Debug, Deserialize)]
struct GraphEntry {
    id: String,
    #[serde(default)]
    time: Option<u64>,
    #[serde(default)]
    messaging: Vec<GraphEvent>,
}

#[derive(Debug, Deserialize)]
struct GraphEvent {
    sender: Option<GraphRef>,
    timestamp: Option<u64>,
    read: Option<GraphRead>,
}

#[derive(Debug, Deserialize)]
struct GraphRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GraphRead {
    watermark: u64,
}

// ── Handler ────────────────────────────────────────────────────────

/// Validates and deduplicates deliveries, then forwards change signals.
#[derive(Clone)]
pub struct WebhookHandler {
    db: Database,
    signals: mpsc::Sender<ChangeSignal>,
    verify_token: Option<String>,
    app_secret: Option<String>,
    push_token: Option<String>,
    /// Last processed sequence per user and provider, each behind its own
    /// lock so one busy account does not stall the others.
    last_seen: Arc<Mutex<HashMap<(String, Provider), Arc<Mutex<Option<u64>>>>>>,
}

impl WebhookHandler {
    pub fn new(db: Database, signals: mpsc::Sender<ChangeSignal>, settings: &Settings) -> Self {
        Self {
            db,
            signals,
            verify_token: settings.webhook_verify_token.clone(),
            app_secret: settings.graph_app_secret.clone(),
            push_token: settings.mail_push_token.clone(),
            last_seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscription handshake. Returns the challenge to echo.
    pub fn verify_subscription(&self, query: &VerifyQuery) -> std::result::Result<String, Rejection> {
        let expected = self.verify_token.as_deref().map(str::trim).unwrap_or("");
        let observed = query.verify_token.as_deref().map(str::trim).unwrap_or("");
        if query.mode.as_deref() == Some("subscribe") && !expected.is_empty() && observed == expected
        {
            Ok(query.challenge.clone().unwrap_or_default())
        } else {
            log::warn!("Webhook subscription verification failed");
            Err(Rejection::VerificationFailed)
        }
    }

    /// Mail push delivery: a Pub/Sub envelope around `{emailAddress, historyId}`.
    pub async fn handle_mail_push(&self, token: Option<&str>, body: &[u8]) -> Outcome {
        if let Some(expected) = self.push_token.as_deref() {
            if token.map(str::trim) != Some(expected.trim()) {
                return Err(Rejection::BadToken);
            }
        }
        let envelope: PushEnvelope = serde_json::from_slice(body)
            .map_err(|e| Rejection::Malformed(format!("push envelope: {e}")))?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(envelope.message.data.trim())
            .or_else(|_| {
                base64::engine::general_purpose::URL_SAFE_NO_PAD
                    .decode(envelope.message.data.trim().trim_end_matches('='))
            })
            .map_err(|e| Rejection::Malformed(format!("push data: {e}")))?;
        let notification: MailNotification = serde_json::from_slice(&data)
            .map_err(|e| Rejection::Malformed(format!("push notification: {e}")))?;
        let history_id = match &notification.history_id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| Rejection::Malformed("historyId is not a number".into()))?;

        self.route(
            &[Provider::Mail],
            &notification.email_address,
            history_id,
            Vec::new(),
        )
        .await
    }

    /// Graph messaging delivery for a page or an Instagram account.
    pub async fn handle_social(&self, signature: Option<&str>, body: &[u8]) -> Outcome {
        if let Some(secret) = self.app_secret.as_deref() {
            let valid = signature.is_some_and(|sig| verify_signature(body, sig, secret));
            if !valid {
                log::warn!("Rejecting social delivery with a bad signature");
                return Err(Rejection::BadSignature);
            }
        }
        let delivery: GraphDelivery = serde_json::from_slice(body)
            .map_err(|e| Rejection::Malformed(format!("graph delivery: {e}")))?;
        let providers: &[Provider] = match delivery.object.as_str() {
            "page" => &[Provider::Messenger],
            "instagram" => &[Provider::Instagram],
            other => return Err(Rejection::Malformed(format!("unknown object {other}"))),
        };
        if delivery.entry.is_empty() {
            return Err(Rejection::Malformed("no entries".into()));
        }

        let mut outcome = Ack::Ignored;
        for entry in delivery.entry {
            let sequence = entry
                .messaging
                .iter()
                .filter_map(|e| e.timestamp)
                .chain(entry.time)
                .max()
                .unwrap_or(0);
            let receipts = entry
                .messaging
                .iter()
                .filter_map(|e| {
                    let read = e.read.as_ref()?;
                    let watermark = i64::try_from(read.watermark).ok()?;
                    Some(ReadReceipt {
                        participant_ref: e.sender.as_ref()?.id.clone(),
                        watermark: from_millis(watermark),
                    })
                })
                .collect();
            let ack = self.route(providers, &entry.id, sequence, receipts).await?;
            outcome = strongest(outcome, ack);
        }
        Ok(outcome)
    }

    async fn route(
        &self,
        providers: &[Provider],
        account_ref: &str,
        sequence: u64,
        receipts: Vec<ReadReceipt>,
    ) -> Outcome {
        let found = self
            .db
            .reader()
            .call({
                let providers = providers.to_vec();
                let account_ref = account_ref.to_string();
                move |conn| repository::find_user_by_account(conn, &providers, &account_ref)
            })
            .await;
        let (user_id, provider) = match found {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                log::info!("Ignoring delivery for unknown account {account_ref}");
                return Ok(Ack::Ignored);
            }
            Err(e) => {
                log::warn!("Account lookup failed: {e}");
                return Err(Rejection::Unavailable);
            }
        };

        let slot = self
            .last_seen
            .lock()
            .await
            .entry((user_id.clone(), provider))
            .or_default()
            .clone();
        // Held across the send so redeliveries for this account see each other.
        let mut last_seen = slot.lock().await;
        let processed = match *last_seen {
            Some(seq) => seq,
            None => self.stored_sequence(&user_id, provider).await,
        };
        if sequence <= processed {
            log::debug!("Duplicate {provider} delivery for {user_id}: {sequence} <= {processed}");
            *last_seen = Some(processed);
            return Ok(Ack::Duplicate);
        }

        let permit = self
            .signals
            .reserve()
            .await
            .map_err(|_| Rejection::Unavailable)?;
        permit.send(ChangeSignal {
            user_id,
            provider,
            at_least: sequence,
            receipts,
        });
        *last_seen = Some(sequence);
        Ok(Ack::Accepted)
    }

    async fn stored_sequence(&self, user_id: &str, provider: Provider) -> u64 {
        let stored = self
            .db
            .reader()
            .call({
                let user_id = user_id.to_string();
                move |conn| repository::get_sync_cursor(conn, &user_id, provider)
            })
            .await;
        match stored {
            Ok(cursor) => cursor.and_then(|c| c.sequence()).unwrap_or(0),
            Err(e) => {
                log::warn!("Could not read {provider} cursor for {user_id}: {e}");
                0
            }
        }
    }
}

fn strongest(a: Ack, b: Ack) -> Ack {
    match (a, b) {
        (Ack::Accepted, _) | (_, Ack::Accepted) => Ack::Accepted,
        (Ack::Duplicate, _) | (_, Ack::Duplicate) => Ack::Duplicate,
        _ => Ack::Ignored,
    }
}

/// Check a `sha256=<hex>` signature over the raw body.
pub fn verify_signature(body: &[u8], header: &str, secret: &str) -> bool {
    let Some(digest) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Some(expected) = decode_hex(digest) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| raw.get(i..i + 2).and_then(|b| u8::from_str_radix(b, 16).ok()))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{Credential, ProviderMetadata, SyncCursor};
    use serde_json::json;

    pub(crate) fn sign(body: &[u8], secret: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        format!(
            "sha256={}",
            digest.iter().map(|b| format!("{b:02x}")).collect::<String>()
        )
    }

    pub(crate) fn mail_push(address: &str, history_id: u64) -> Vec<u8> {
        let data = json!({ "emailAddress": address, "historyId": history_id }).to_string();
        json!({
            "message": {
                "data": base64::engine::general_purpose::STANDARD.encode(data),
                "messageId": "2070443601311540",
            },
            "subscription": "projects/demo/subscriptions/inbox"
        })
        .to_string()
        .into_bytes()
    }

    pub(crate) async fn connect(db: &Database, user: &str, provider: Provider, account: &str) {
        let cred = Credential {
            user_id: user.into(),
            provider,
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: None,
            metadata: ProviderMetadata {
                account_ref: Some(account.into()),
                ..Default::default()
            },
        };
        db.writer()
            .call(move |conn| repository::upsert_credential(conn, &cred))
            .await
            .unwrap();
    }

    pub(crate) fn settings() -> Settings {
        Settings {
            webhook_verify_token: Some("verify-me".into()),
            graph_app_secret: Some("app-secret".into()),
            ..Settings::default()
        }
    }

    async fn handler() -> (Database, WebhookHandler, mpsc::Receiver<ChangeSignal>) {
        let db = Database::open_memory().await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        let handler = WebhookHandler::new(db.clone(), tx, &settings());
        (db, handler, rx)
    }

    #[tokio::test]
    async fn test_verify_subscription() {
        let (_db, handler, _rx) = handler().await;
        let ok = VerifyQuery {
            mode: Some("subscribe".into()),
            verify_token: Some("verify-me".into()),
            challenge: Some("1158201444".into()),
        };
        assert_eq!(handler.verify_subscription(&ok).unwrap(), "1158201444");

        let wrong = VerifyQuery {
            verify_token: Some("nope".into()),
            ..ok
        };
        assert_eq!(
            handler.verify_subscription(&wrong),
            Err(Rejection::VerificationFailed)
        );
    }

    #[tokio::test]
    async fn test_mail_push_at_cursor_is_duplicate() {
        let (db, handler, mut rx) = handler().await;
        connect(&db, "u1", Provider::Mail, "me@example.com").await;
        db.writer()
            .call(|conn| {
                repository::set_sync_cursor(conn, "u1", Provider::Mail, &SyncCursor::from(100))
            })
            .await
            .unwrap();

        let ack = handler
            .handle_mail_push(None, &mail_push("me@example.com", 100))
            .await;
        assert_eq!(ack, Ok(Ack::Duplicate));
        assert!(rx.try_recv().is_err());

        let ack = handler
            .handle_mail_push(None, &mail_push("me@example.com", 101))
            .await;
        assert_eq!(ack, Ok(Ack::Accepted));
        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.user_id, "u1");
        assert_eq!(signal.at_least, 101);
    }

    #[tokio::test]
    async fn test_redelivery_and_reordering_signal_once() {
        let (db, handler, mut rx) = handler().await;
        connect(&db, "u1", Provider::Mail, "me@example.com").await;

        for history_id in [7, 7, 5, 7] {
            handler
                .handle_mail_push(None, &mail_push("me@example.com", history_id))
                .await
                .unwrap();
        }
        assert_eq!(rx.try_recv().unwrap().at_least, 7);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_does_not_stall_other_accounts() {
        let db = Database::open_memory().await.unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let handler = WebhookHandler::new(db.clone(), tx, &settings());
        connect(&db, "u1", Provider::Mail, "one@example.com").await;
        connect(&db, "u2", Provider::Mail, "two@example.com").await;

        let ack = handler
            .handle_mail_push(None, &mail_push("one@example.com", 4))
            .await;
        assert_eq!(ack, Ok(Ack::Accepted));

        // The queue is full, so this delivery waits for room.
        let waiting = {
            let handler = handler.clone();
            tokio::spawn(async move {
                handler
                    .handle_mail_push(None, &mail_push("two@example.com", 9))
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let redelivery = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            handler.handle_mail_push(None, &mail_push("one@example.com", 4)),
        )
        .await
        .expect("redelivery for another account must not wait");
        assert_eq!(redelivery, Ok(Ack::Duplicate));

        assert_eq!(rx.recv().await.unwrap().user_id, "u1");
        assert_eq!(waiting.await.unwrap(), Ok(Ack::Accepted));
        assert_eq!(rx.recv().await.unwrap().user_id, "u2");
    }

    #[tokio::test]
    async fn test_out_of_range_watermark_is_skipped() {
        let (db, handler, mut rx) = handler().await;
        connect(&db, "u1", Provider::Instagram, "IG1").await;
        let body = json!({
            "object": "instagram",
            "entry": [{
                "id": "IG1",
                "time": 1_700_000_000_100u64,
                "messaging": [
                    { "sender": {"id": "IGSID"}, "timestamp": 1_700_000_000_200u64,
                      "read": {"watermark": u64::MAX} }
                ]
            }]
        })
        .to_string();
        let sig = sign(body.as_bytes(), "app-secret");

        assert_eq!(
            handler.handle_social(Some(&sig), body.as_bytes()).await,
            Ok(Ack::Accepted)
        );
        assert!(rx.try_recv().unwrap().receipts.is_empty());
    }

    #[tokio::test]
    async fn test_mail_push_token_and_shape() {
        let db = Database::open_memory().await.unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let settings = Settings {
            mail_push_token: Some("push-secret".into()),
            ..Settings::default()
        };
        let handler = WebhookHandler::new(db, tx, &settings);

        let body = mail_push("me@example.com", 1);
        assert_eq!(
            handler.handle_mail_push(Some("wrong"), &body).await,
            Err(Rejection::BadToken)
        );
        assert_eq!(
            handler.handle_mail_push(Some("push-secret"), &body).await,
            Ok(Ack::Ignored)
        );
        assert!(matches!(
            handler.handle_mail_push(Some("push-secret"), b"{}").await,
            Err(Rejection::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_social_signature_and_read_receipts() {
        let (db, handler, mut rx) = handler().await;
        connect(&db, "u1", Provider::Messenger, "PAGE1").await;

        let body = json!({
            "object": "page",
            "entry": [{
                "id": "PAGE1",
                "time": 1_700_000_000_100u64,
                "messaging": [
                    { "sender": {"id": "PSID9"}, "recipient": {"id": "PAGE1"},
                      "timestamp": 1_700_000_000_200u64, "read": {"watermark": 1_700_000_000_000u64} }
                ]
            }]
        })
        .to_string();

        assert_eq!(
            handler.handle_social(Some("sha256=00ff"), body.as_bytes()).await,
            Err(Rejection::BadSignature)
        );
        assert_eq!(
            handler.handle_social(None, body.as_bytes()).await,
            Err(Rejection::BadSignature)
        );

        let sig = sign(body.as_bytes(), "app-secret");
        assert_eq!(
            handler.handle_social(Some(&sig), body.as_bytes()).await,
            Ok(Ack::Accepted)
        );
        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.provider, Provider::Messenger);
        assert_eq!(signal.at_least, 1_700_000_000_200);
        assert_eq!(signal.receipts.len(), 1);
        assert_eq!(signal.receipts[0].participant_ref, "PSID9");
        assert_eq!(signal.receipts[0].watermark, from_millis(1_700_000_000_000));
    }

    #[tokio::test]
    async fn test_social_unknown_object_is_malformed() {
        let (_db, handler, _rx) = handler().await;
        let body = json!({ "object": "user", "entry": [] }).to_string();
        let sig = sign(body.as_bytes(), "app-secret");
        assert!(matches!(
            handler.handle_social(Some(&sig), body.as_bytes()).await,
            Err(Rejection::Malformed(_))
        ));
    }

    #[test]
    fn test_verify_signature() {
        let sig = sign(b"payload", "s3cret");
        assert!(verify_signature(b"payload", &sig, "s3cret"));
        assert!(!verify_signature(b"payload!", &sig, "s3cret"));
        assert!(!verify_signature(b"payload", "sha1=abcd", "s3cret"));
        assert!(!verify_signature(b"payload", "sha256=zz", "s3cret"));
    }
}

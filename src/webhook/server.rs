//! Axum surface for webhook deliveries.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{Outcome, Rejection, VerifyQuery, WebhookHandler};
use crate::error::{Error, Result};

#[derive(Debug, Default, Deserialize)]
struct PushQuery {
    token: Option<String>,
}

pub fn router(handler: WebhookHandler) -> Router {
    Router::new()
        .route("/webhooks/mail", get(verify).post(mail_push))
        .route("/webhooks/social", get(verify).post(social))
        .route("/healthz", get(health))
        .with_state(handler)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn verify(State(handler): State<WebhookHandler>, Query(query): Query<VerifyQuery>) -> Response {
    match handler.verify_subscription(&query) {
        Ok(challenge) => (StatusCode::OK, challenge).into_response(),
        Err(rejection) => rejected(rejection),
    }
}

async fn mail_push(
    State(handler): State<WebhookHandler>,
    Query(query): Query<PushQuery>,
    body: Bytes,
) -> Response {
    respond(handler.handle_mail_push(query.token.as_deref(), &body).await)
}

async fn social(State(handler): State<WebhookHandler>, headers: HeaderMap, body: Bytes) -> Response {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok());
    respond(handler.handle_social(signature, &body).await)
}

fn respond(outcome: Outcome) -> Response {
    match outcome {
        Ok(ack) => (StatusCode::OK, Json(json!({"status": ack.as_str()}))).into_response(),
        Err(rejection) => rejected(rejection),
    }
}

fn rejected(rejection: Rejection) -> Response {
    let status = match rejection {
        Rejection::Malformed(_) => StatusCode::BAD_REQUEST,
        Rejection::BadSignature | Rejection::BadToken => StatusCode::UNAUTHORIZED,
        Rejection::VerificationFailed => StatusCode::FORBIDDEN,
        Rejection::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = json!({"error": {"code": rejection.code(), "message": rejection.to_string()}});
    (status, Json(body)).into_response()
}

/// A running webhook listener.
pub struct WebhookServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WebhookServer {
    /// Bind `addr` and serve until [`WebhookServer::stop`].
    pub async fn start(handler: WebhookHandler, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Config(format!("failed to resolve bound address: {e}")))?;
        let (shutdown, mut stopped) = watch::channel(false);

        let app = router(handler);
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while stopped.changed().await.is_ok() {
                        if *stopped.borrow() {
                            break;
                        }
                    }
                })
                .await;
            if let Err(e) = served {
                log::error!("Webhook server exited: {e}");
            }
        });
        log::info!("Webhook server listening on {local_addr}");

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            log::warn!("Webhook server task ended abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeSignal, Provider};
    use crate::storage::Database;
    use crate::webhook::tests::{connect, mail_push, settings, sign};
    use tokio::sync::mpsc;

    async fn serve() -> (WebhookServer, mpsc::Receiver<ChangeSignal>, Database) {
        let db = Database::open_memory().await.unwrap();
        let (tx, rx) = mpsc::channel(8);
        let handler = WebhookHandler::new(db.clone(), tx, &settings());
        let server = WebhookServer::start(handler, "127.0.0.1:0").await.unwrap();
        (server, rx, db)
    }

    #[tokio::test]
    async fn test_handshake_and_health() {
        let (server, _rx, _db) = serve().await;
        let base = format!("http://{}", server.local_addr());
        let client = reqwest::Client::new();

        let ok = client
            .get(format!(
                "{base}/webhooks/social?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=42"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);
        assert_eq!(ok.text().await.unwrap(), "42");

        let denied = client
            .get(format!(
                "{base}/webhooks/mail?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=42"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), 403);

        let health = client.get(format!("{base}/healthz")).send().await.unwrap();
        assert_eq!(health.status(), 200);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_post_status_codes() {
        let (server, mut rx, db) = serve().await;
        connect(&db, "u1", Provider::Mail, "me@example.com").await;
        let base = format!("http://{}", server.local_addr());
        let client = reqwest::Client::new();

        let accepted = client
            .post(format!("{base}/webhooks/mail"))
            .body(mail_push("me@example.com", 9))
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), 200);
        let body: serde_json::Value = accepted.json().await.unwrap();
        assert_eq!(body["status"], "accepted");
        assert_eq!(rx.recv().await.unwrap().at_least, 9);

        let malformed = client
            .post(format!("{base}/webhooks/mail"))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), 400);

        let payload = r#"{"object":"page","entry":[{"id":"P","messaging":[]}]}"#;
        let unsigned = client
            .post(format!("{base}/webhooks/social"))
            .body(payload)
            .send()
            .await
            .unwrap();
        assert_eq!(unsigned.status(), 401);

        let signed = client
            .post(format!("{base}/webhooks/social"))
            .header("x-hub-signature-256", sign(payload.as_bytes(), "app-secret"))
            .body(payload)
            .send()
            .await
            .unwrap();
        assert_eq!(signed.status(), 200);
        let body: serde_json::Value = signed.json().await.unwrap();
        assert_eq!(body["status"], "ignored");

        server.stop().await;
    }
}

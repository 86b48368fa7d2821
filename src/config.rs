use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::Provider;
use crate::storage::{repository, Database};

/// OAuth client registration used to refresh a provider's tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub token_url: String,
}

/// Runtime settings. Built from defaults, then `INBOXSYNC_*` environment
/// variables, then `app_config` rows (`inboxsync config set <key> <value>`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub mail_api_base: String,
    pub chat_api_base: String,
    pub graph_api_base: String,
    pub oauth: HashMap<Provider, OAuthClientConfig>,
    /// Shared `hub.verify_token` for the subscription handshake.
    pub webhook_verify_token: Option<String>,
    /// Graph app secret; when set, social deliveries must carry a valid
    /// `X-Hub-Signature-256`.
    pub graph_app_secret: Option<String>,
    /// Token expected in the `token` query parameter of mail push deliveries.
    pub mail_push_token: Option<String>,
    pub webhook_bind: String,
    pub poll_interval: Duration,
    pub bootstrap_limit: usize,
    pub max_in_flight: usize,
    pub echo_window: chrono::Duration,
    /// How long a successful whoami probe is trusted before probing again.
    pub probe_ttl: Duration,
    pub http_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mail_api_base: "https://gmail.googleapis.com/gmail/v1".into(),
            chat_api_base: "https://slack.com/api".into(),
            graph_api_base: "https://graph.facebook.com/v19.0".into(),
            oauth: HashMap::new(),
            webhook_verify_token: None,
            graph_app_secret: None,
            mail_push_token: None,
            webhook_bind: "127.0.0.1:8787".into(),
            poll_interval: Duration::from_secs(15),
            bootstrap_limit: 50,
            max_in_flight: 4,
            echo_window: chrono::Duration::seconds(30),
            probe_ttl: Duration::from_secs(60),
            http_timeout: Duration::from_secs(20),
        }
    }
}

impl Settings {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix("INBOXSYNC_")
                    .map(|rest| (rest.to_ascii_lowercase(), v))
            })
            .collect();
        let mut settings = Self::default();
        settings.apply(&vars)?;
        Ok(settings)
    }

    /// Overlay `app_config` rows on top of the current values.
    pub async fn overlay_db(&mut self, db: &Database) -> Result<()> {
        let rows: Vec<(String, String)> =
            db.reader().call(|conn| repository::list_config(conn)).await?;
        let vars: HashMap<String, String> = rows.into_iter().collect();
        self.apply(&vars)
    }

    /// Apply lower-case keys such as `poll_interval_secs` or
    /// `chat_oauth_client_id`. Unknown keys are ignored.
    pub fn apply(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        let get = |k: &str| vars.get(k).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(v) = get("mail_api_base") {
            self.mail_api_base = validate_base_url(v)?;
        }
        if let Some(v) = get("chat_api_base") {
            self.chat_api_base = validate_base_url(v)?;
        }
        if let Some(v) = get("graph_api_base") {
            self.graph_api_base = validate_base_url(v)?;
        }
        if let Some(v) = get("webhook_verify_token") {
            self.webhook_verify_token = Some(v.to_string());
        }
        if let Some(v) = get("graph_app_secret") {
            self.graph_app_secret = Some(v.to_string());
        }
        if let Some(v) = get("mail_push_token") {
            self.mail_push_token = Some(v.to_string());
        }
        if let Some(v) = get("webhook_bind") {
            self.webhook_bind = v.to_string();
        }
        if let Some(v) = get("poll_interval_secs") {
            self.poll_interval = Duration::from_secs(parse_number(v, "poll_interval_secs")?.max(1));
        }
        if let Some(v) = get("bootstrap_limit") {
            self.bootstrap_limit = parse_number(v, "bootstrap_limit")?.max(1) as usize;
        }
        if let Some(v) = get("max_in_flight") {
            self.max_in_flight = parse_number(v, "max_in_flight")?.max(1) as usize;
        }
        if let Some(v) = get("echo_window_secs") {
            self.echo_window = chrono::Duration::seconds(parse_number(v, "echo_window_secs")? as i64);
        }
        if let Some(v) = get("probe_ttl_secs") {
            self.probe_ttl = Duration::from_secs(parse_number(v, "probe_ttl_secs")?);
        }
        if let Some(v) = get("http_timeout_secs") {
            self.http_timeout = Duration::from_secs(parse_number(v, "http_timeout_secs")?.max(1));
        }

        for provider in Provider::ALL {
            let prefix = provider.as_str();
            let client_id = get(&format!("{prefix}_oauth_client_id"));
            let token_url = get(&format!("{prefix}_oauth_token_url"));
            let secret = get(&format!("{prefix}_oauth_client_secret"));
            if let (Some(client_id), Some(token_url)) = (client_id, token_url) {
                self.oauth.insert(
                    provider,
                    OAuthClientConfig {
                        client_id: client_id.to_string(),
                        client_secret: secret.map(str::to_string),
                        token_url: validate_base_url(token_url)?,
                    },
                );
            }
        }
        Ok(())
    }
}

fn parse_number(v: &str, key: &str) -> Result<u64> {
    v.parse::<u64>()
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {v:?}")))
}

fn validate_base_url(v: &str) -> Result<String> {
    let url = url::Url::parse(v).map_err(|e| Error::Config(format!("invalid URL {v:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!("unsupported URL scheme in {v:?}")));
    }
    Ok(v.trim_end_matches('/').to_string())
}

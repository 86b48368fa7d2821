use std::collections::HashMap;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use inboxsync::model::ProviderMetadata;
use inboxsync::storage::repository;
use inboxsync::{Credential, InboxSync, Provider, SendTarget, SyncReport};

#[derive(Parser)]
#[command(name = "inboxsync", about = "Unified inbox sync across mail, chat and social providers")]
struct Cli {
    /// Database path (default: ~/.inboxsync/inboxsync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the poller, sync dispatcher and webhook server until Ctrl-C
    Serve {
        /// Override the webhook bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Sync one user now
    Sync {
        #[arg(long)]
        user: String,
        /// Only this provider (default: every connected provider)
        #[arg(long)]
        provider: Option<Provider>,
        #[arg(long)]
        json: bool,
    },
    /// Run one poll cycle over every connected user
    Poll {
        #[arg(long)]
        json: bool,
    },
    /// List conversations, newest first
    Conversations {
        #[arg(long)]
        user: String,
        #[arg(long)]
        provider: Option<Provider>,
        #[arg(long)]
        json: bool,
    },
    /// Show messages of a conversation
    Messages {
        #[arg(long)]
        user: String,
        #[arg(long)]
        provider: Provider,
        #[arg(long)]
        conversation: String,
        /// Cursor from a previous page
        #[arg(long)]
        cursor: Option<String>,
        /// Walk back through up to this many pages
        #[arg(long)]
        pages: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Send a message
    Send {
        #[arg(long)]
        user: String,
        #[arg(long)]
        provider: Provider,
        /// Existing conversation id
        #[arg(long, conflicts_with = "to", required_unless_present = "to")]
        conversation: Option<String>,
        /// Recipient id for a new conversation
        #[arg(long)]
        to: Option<String>,
        text: String,
    },
    /// Mark a conversation read
    MarkRead {
        #[arg(long)]
        user: String,
        #[arg(long)]
        provider: Provider,
        #[arg(long)]
        conversation: String,
        /// RFC 3339 timestamp (default: now)
        #[arg(long)]
        up_to: Option<String>,
    },
    /// Manage stored credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show cache and sync status
    Status,
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Import tokens obtained from a provider's OAuth flow
    Add {
        #[arg(long)]
        user: String,
        #[arg(long)]
        provider: Provider,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
        /// Seconds until the access token expires
        #[arg(long)]
        expires_in: Option<i64>,
        /// Provider account (mailbox address, page id, ...) used to route webhooks
        #[arg(long)]
        account: Option<String>,
    },
    /// List stored credentials (tokens are never printed)
    List,
    /// Remove a credential
    Remove {
        #[arg(long)]
        user: String,
        #[arg(long)]
        provider: Provider,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => inboxsync::Database::open_at(path).await?,
        None => inboxsync::Database::open().await?,
    };

    match cli.command {
        Commands::Status => print_status(&db).await?,
        Commands::Config { action } => handle_config(&db, action).await?,
        Commands::Credentials { action } => handle_credentials(&db, action).await?,
        command => {
            let inbox = InboxSync::open(db).await?;
            handle_inbox(&inbox, command).await?;
        }
    }

    Ok(())
}

async fn handle_inbox(inbox: &InboxSync, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve { bind } => {
            let services = match bind {
                Some(bind) => {
                    let mut settings = inbox.settings().clone();
                    settings.webhook_bind = bind;
                    let db = inbox.db().clone();
                    InboxSync::open_with(db, settings).await?.start().await?
                }
                None => inbox.start().await?,
            };
            eprintln!("Listening for webhooks on {}", services.webhook_addr());
            eprintln!("Press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            eprintln!("Shutting down...");
            services.stop().await;
        }
        Commands::Sync {
            user,
            provider,
            json,
        } => {
            let reports = match provider {
                Some(p) => vec![inbox.sync(&user, p).await?],
                None => inbox.sync_user(&user).await?,
            };
            print_reports(&reports, json)?;
        }
        Commands::Poll { json } => {
            let reports = inbox.poll_once().await;
            print_reports(&reports, json)?;
        }
        Commands::Conversations {
            user,
            provider,
            json,
        } => {
            let view = inbox.get_conversations(&user, provider).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                for c in &view.conversations {
                    let when = c
                        .last_message_timestamp
                        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".into());
                    let marker = if c.unread { "*" } else { " " };
                    println!(
                        "{marker} [{:<9}] {when}  {}  {}",
                        c.provider.as_str(),
                        c.id,
                        truncate(&c.preview, 60)
                    );
                }
                for f in &view.failures {
                    eprintln!("! {}: {}", f.provider, f.message);
                }
                if view.conversations.is_empty() && view.failures.is_empty() {
                    println!("No conversations.");
                }
            }
        }
        Commands::Messages {
            user,
            provider,
            conversation,
            cursor,
            pages,
            json,
        } => {
            let (messages, next) = match pages {
                Some(pages) => (
                    inbox
                        .get_history(&user, provider, &conversation, pages.max(1))
                        .await?,
                    None,
                ),
                None => {
                    let page = inbox
                        .get_messages(&user, provider, &conversation, cursor.as_deref())
                        .await?;
                    (page.items, page.next_cursor)
                }
            };
            if json {
                let out = serde_json::json!({ "messages": messages, "next_cursor": next });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                for m in &messages {
                    let arrow = match m.direction {
                        inboxsync::Direction::Incoming => "<",
                        inboxsync::Direction::Outgoing => ">",
                    };
                    println!(
                        "{} {arrow} {:<10} {} ({})",
                        m.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        truncate(&m.sender_ref, 10),
                        m.content,
                        m.delivery_state.as_str()
                    );
                }
                if let Some(next) = next {
                    println!("-- more: --cursor {next}");
                }
            }
        }
        Commands::Send {
            user,
            provider,
            conversation,
            to,
            text,
        } => {
            let target = match (conversation, to) {
                (Some(c), _) => SendTarget::Conversation(c),
                (None, Some(r)) => SendTarget::Recipient(r),
                (None, None) => anyhow::bail!("--conversation or --to is required"),
            };
            let sent = inbox.send_message(&user, provider, target, &text).await?;
            match sent.error {
                Some(err) => anyhow::bail!("send failed ({}): {err}", sent.temp_id),
                None => println!(
                    "Queued {} in {} ({})",
                    sent.temp_id,
                    sent.conversation_id,
                    sent.state.as_str()
                ),
            }
        }
        Commands::MarkRead {
            user,
            provider,
            conversation,
            up_to,
        } => {
            let up_to = match up_to {
                Some(s) => DateTime::parse_from_rfc3339(&s)
                    .map_err(|e| anyhow::anyhow!("invalid --up-to '{s}': {e}"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            inbox.mark_read(&user, provider, &conversation, up_to).await?;
            println!("Marked {conversation} read.");
        }
        Commands::Status | Commands::Config { .. } | Commands::Credentials { .. } => {}
    }
    Ok(())
}

fn print_reports(reports: &[SyncReport], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(reports)?);
        return Ok(());
    }
    if reports.is_empty() {
        println!("Nothing to sync. Add a credential first.");
    }
    for r in reports {
        print!(
            "{:<9} {:<10} {:<9} {} synced",
            r.provider.as_str(),
            r.user_id,
            r.phase.as_str(),
            r.items_synced
        );
        if r.items_failed > 0 {
            print!(", {} failed", r.items_failed);
        }
        if let Some(err) = &r.error {
            print!(" ({err})");
        }
        println!();
    }
    Ok(())
}

async fn handle_credentials(db: &inboxsync::Database, action: CredentialAction) -> anyhow::Result<()> {
    match action {
        CredentialAction::Add {
            user,
            provider,
            access_token,
            refresh_token,
            expires_in,
            account,
        } => {
            if access_token.trim().is_empty() {
                anyhow::bail!("--access-token must not be empty");
            }
            let cred = Credential {
                user_id: user.clone(),
                provider,
                access_token,
                refresh_token,
                expires_at: expires_in.map(|s| Utc::now() + chrono::Duration::seconds(s)),
                metadata: ProviderMetadata {
                    account_ref: account,
                    ..Default::default()
                },
            };
            db.writer()
                .call(move |conn| {
                    repository::upsert_credential(conn, &cred)?;
                    Ok::<(), rusqlite::Error>(())
                })
                .await?;
            println!("Stored {provider} credential for {user}.");
        }
        CredentialAction::List => {
            let creds = db.reader().call(|conn| repository::list_credentials(conn)).await?;
            if creds.is_empty() {
                println!("No credentials stored.");
            }
            for c in creds {
                let expires = c
                    .expires_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<10} {:<9} token {}  refresh {}  expires {expires}  account {}",
                    c.user_id,
                    c.provider.as_str(),
                    c.fingerprint(),
                    if c.refresh_token.is_some() { "yes" } else { "no" },
                    c.metadata.account_ref.as_deref().unwrap_or("-")
                );
            }
        }
        CredentialAction::Remove { user, provider } => {
            let removed = db
                .writer()
                .call({
                    let user = user.clone();
                    move |conn| repository::delete_credential(conn, &user, provider)
                })
                .await?;
            if removed {
                println!("Removed {provider} credential for {user}.");
            } else {
                println!("No {provider} credential for {user}.");
            }
        }
    }
    Ok(())
}

async fn print_status(db: &inboxsync::Database) -> anyhow::Result<()> {
    let stats = db
        .reader()
        .call(|conn| {
            let credentials: i64 =
                conn.query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))?;
            let cursors: i64 =
                conn.query_row("SELECT COUNT(*) FROM sync_cursors", [], |row| row.get(0))?;
            let messages: i64 = conn.query_row(
                "SELECT COUNT(*) FROM cached_messages WHERE is_temp = 0",
                [],
                |row| row.get(0),
            )?;
            let pending: i64 = conn.query_row(
                "SELECT COUNT(*) FROM cached_messages WHERE is_temp = 1 AND delivery_state = 'sending'",
                [],
                |row| row.get(0),
            )?;
            let mut last_syncs = Vec::new();
            for provider in Provider::ALL {
                last_syncs.push((provider, repository::last_sync_at(conn, provider)?));
            }
            Ok::<_, rusqlite::Error>((credentials, cursors, messages, pending, last_syncs))
        })
        .await?;

    let (credentials, cursors, messages, pending, last_syncs) = stats;
    println!("Inbox Status");
    println!("  Credentials:      {credentials}");
    println!("  Sync cursors:     {cursors}");
    println!("  Cached messages:  {messages}");
    println!("  Pending sends:    {pending}");
    for (provider, last) in last_syncs {
        println!(
            "  Last {:<10}    {}",
            format!("{provider}:"),
            last.unwrap_or_else(|| "never".to_string())
        );
    }
    Ok(())
}

async fn handle_config(db: &inboxsync::Database, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let val: Option<String> = db
                .reader()
                .call({
                    let key = key.clone();
                    move |conn| repository::get_config(conn, &key)
                })
                .await?;
            match val {
                Some(v) => println!("{key} = {v}"),
                None => println!("{key} is not set"),
            }
        }
        ConfigAction::Set { key, value } => {
            // Validate against the settings parser before storing.
            let mut probe = inboxsync::Settings::default();
            probe.apply(&HashMap::from([(key.clone(), value.clone())]))?;
            db.writer()
                .call(move |conn| {
                    repository::set_config(conn, &key, &value)?;
                    Ok::<(), rusqlite::Error>(())
                })
                .await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items: Vec<(String, String)> =
                db.reader().call(|conn| repository::list_config(conn)).await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    let shown = if k.contains("secret") || k.contains("token") {
                        "<redacted>".to_string()
                    } else {
                        v
                    };
                    println!("{k} = {shown}");
                }
            }
        }
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

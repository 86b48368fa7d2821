use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::{
    Credential, DeliveryState, Direction, Message, Provider, ProviderMetadata, SyncCursor,
};
use crate::time_util::{from_millis, to_millis};

// ── Credentials ────────────────────────────────────────────────────

const CREDENTIAL_COLUMNS: &str =
    "user_id, provider, access_token, refresh_token, expires_at, account_ref, metadata_json";

fn credential_from_row(row: &Row<'_>) -> Result<Credential, rusqlite::Error> {
    let provider: String = row.get(1)?;
    let metadata_json: String = row.get(6)?;
    let mut metadata: ProviderMetadata = serde_json::from_str(&metadata_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    // The column is authoritative; the JSON copy only carries extras.
    metadata.account_ref = row.get(5)?;
    Ok(Credential {
        user_id: row.get(0)?,
        provider: parse_provider(1, &provider)?,
        access_token: row.get(2)?,
        refresh_token: row.get(3)?,
        expires_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
        metadata,
    })
}

/// Insert or replace the credential for `(user_id, provider)`.
/// Called when an external OAuth flow completes.
pub fn upsert_credential(conn: &Connection, cred: &Credential) -> Result<(), rusqlite::Error> {
    let metadata_json = serde_json::to_string(&cred.metadata)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT INTO credentials (
            user_id, provider, access_token, refresh_token, expires_at,
            account_ref, metadata_json, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'), datetime('now'))
        ON CONFLICT(user_id, provider) DO UPDATE SET
            access_token=excluded.access_token, refresh_token=excluded.refresh_token,
            expires_at=excluded.expires_at, account_ref=excluded.account_ref,
            metadata_json=excluded.metadata_json, updated_at=excluded.updated_at",
        params![
            cred.user_id,
            cred.provider.as_str(),
            cred.access_token,
            cred.refresh_token,
            cred.expires_at.map(to_millis),
            cred.metadata.account_ref,
            metadata_json,
        ],
    )?;
    Ok(())
}

pub fn get_credential(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
) -> Result<Option<Credential>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE user_id = ?1 AND provider = ?2"),
        params![user_id, provider.as_str()],
        credential_from_row,
    )
    .optional()
}

pub fn list_credentials(conn: &Connection) -> Result<Vec<Credential>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CREDENTIAL_COLUMNS} FROM credentials ORDER BY user_id, provider"
    ))?;
    let rows = stmt.query_map([], credential_from_row)?;
    rows.collect()
}

/// Users that have connected `provider`.
pub fn list_users_for_provider(
    conn: &Connection,
    provider: Provider,
) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM credentials WHERE provider = ?1 ORDER BY user_id")?;
    let rows = stmt.query_map(params![provider.as_str()], |row| row.get(0))?;
    rows.collect()
}

/// Replace the token pair after a refresh. Access token, refresh token and
/// expiry change in one statement so a reader never sees half a refresh.
/// Returns false when the row no longer exists (disconnected meanwhile).
pub fn update_credential_tokens(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at_ms: Option<i64>,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE credentials SET
            access_token = ?3,
            refresh_token = COALESCE(?4, refresh_token),
            expires_at = ?5,
            updated_at = datetime('now')
         WHERE user_id = ?1 AND provider = ?2",
        params![user_id, provider.as_str(), access_token, refresh_token, expires_at_ms],
    )?;
    Ok(count > 0)
}

pub fn delete_credential(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "DELETE FROM credentials WHERE user_id = ?1 AND provider = ?2",
        params![user_id, provider.as_str()],
    )?;
    Ok(count > 0)
}

/// Route a webhook delivery: find which user owns `account_ref` on one of `providers`.
pub fn find_user_by_account(
    conn: &Connection,
    providers: &[Provider],
    account_ref: &str,
) -> Result<Option<(String, Provider)>, rusqlite::Error> {
    for provider in providers {
        let found: Option<String> = conn
            .query_row(
                "SELECT user_id FROM credentials WHERE provider = ?1 AND account_ref = ?2",
                params![provider.as_str(), account_ref],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(user_id) = found {
            return Ok(Some((user_id, *provider)));
        }
    }
    Ok(None)
}

// ── Sync Cursors ───────────────────────────────────────────────────

pub fn get_sync_cursor(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
) -> Result<Option<SyncCursor>, rusqlite::Error> {
    conn.query_row(
        "SELECT cursor FROM sync_cursors WHERE user_id = ?1 AND provider = ?2",
        params![user_id, provider.as_str()],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map(|opt| opt.map(SyncCursor))
}

pub fn set_sync_cursor(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
    cursor: &SyncCursor,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO sync_cursors (user_id, provider, cursor, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))",
        params![user_id, provider.as_str(), cursor.as_str()],
    )?;
    Ok(())
}

// ── Message Cache ──────────────────────────────────────────────────

const MESSAGE_COLUMNS: &str =
    "message_id, provider, conversation_id, sender_ref, content, ts_ms, direction, delivery_state";

fn message_from_row(row: &Row<'_>) -> Result<Message, rusqlite::Error> {
    let provider: String = row.get(1)?;
    let direction: String = row.get(6)?;
    let state: String = row.get(7)?;
    Ok(Message {
        id: row.get(0)?,
        provider: parse_provider(1, &provider)?,
        conversation_id: row.get(2)?,
        sender_ref: row.get(3)?,
        content: row.get(4)?,
        timestamp: from_millis(row.get(5)?),
        direction: Direction::parse(&direction)
            .ok_or_else(|| conversion_error(6, format!("bad direction {direction}")))?,
        delivery_state: DeliveryState::parse(&state)
            .ok_or_else(|| conversion_error(7, format!("bad delivery state {state}")))?,
    })
}

pub fn upsert_message(
    conn: &Connection,
    user_id: &str,
    message: &Message,
    is_temp: bool,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO cached_messages (
            user_id, provider, conversation_id, message_id, sender_ref, content,
            ts_ms, direction, delivery_state, is_temp, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, datetime('now'))
        ON CONFLICT(user_id, provider, conversation_id, message_id) DO UPDATE SET
            sender_ref=excluded.sender_ref, content=excluded.content, ts_ms=excluded.ts_ms,
            direction=excluded.direction, delivery_state=excluded.delivery_state,
            is_temp=excluded.is_temp, cached_at=excluded.cached_at",
        params![
            user_id,
            message.provider.as_str(),
            message.conversation_id,
            message.id,
            message.sender_ref,
            message.content,
            to_millis(message.timestamp),
            message.direction.as_str(),
            message.delivery_state.as_str(),
            is_temp as i32,
        ],
    )?;
    Ok(())
}

pub fn delete_message(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
    conversation_id: &str,
    message_id: &str,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "DELETE FROM cached_messages
         WHERE user_id = ?1 AND provider = ?2 AND conversation_id = ?3 AND message_id = ?4",
        params![user_id, provider.as_str(), conversation_id, message_id],
    )?;
    Ok(count > 0)
}

/// Cached messages of one conversation, oldest first.
pub fn list_messages(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
    conversation_id: &str,
) -> Result<Vec<Message>, rusqlite::Error> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM cached_messages
         WHERE user_id = ?1 AND provider = ?2 AND conversation_id = ?3
         ORDER BY ts_ms, message_id"
    ))?;
    let rows = stmt.query_map(
        params![user_id, provider.as_str(), conversation_id],
        message_from_row,
    )?;
    rows.collect()
}

/// Every cached message id for a user on a provider.
pub fn list_message_ids(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT message_id FROM cached_messages
         WHERE user_id = ?1 AND provider = ?2 AND is_temp = 0
         ORDER BY message_id",
    )?;
    let rows = stmt.query_map(params![user_id, provider.as_str()], |row| row.get(0))?;
    rows.collect()
}

pub fn set_delivery_state(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
    conversation_id: &str,
    message_id: &str,
    state: DeliveryState,
) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "UPDATE cached_messages SET delivery_state = ?5
         WHERE user_id = ?1 AND provider = ?2 AND conversation_id = ?3 AND message_id = ?4",
        params![
            user_id,
            provider.as_str(),
            conversation_id,
            message_id,
            state.as_str()
        ],
    )?;
    Ok(count > 0)
}

/// Promote delivered outgoing messages to `seen` in every conversation the
/// participant has written in, up to and including `watermark_ms`.
pub fn promote_seen_for_participant(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
    participant_ref: &str,
    watermark_ms: i64,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "UPDATE cached_messages SET delivery_state = 'seen'
         WHERE user_id = ?1 AND provider = ?2
           AND direction = 'outgoing' AND delivery_state = 'delivered'
           AND is_temp = 0 AND ts_ms <= ?4
           AND conversation_id IN (
               SELECT DISTINCT conversation_id FROM cached_messages
               WHERE user_id = ?1 AND provider = ?2 AND sender_ref = ?3
           )",
        params![user_id, provider.as_str(), participant_ref, watermark_ms],
    )
}

// ── Sync Runs ──────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub fn insert_sync_run(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
    phase: &str,
    status: &str,
    items_synced: u64,
    items_failed: u64,
    error_message: Option<&str>,
) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_runs (
            user_id, provider, phase, status, items_synced, items_failed, error_message, completed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, datetime('now'))",
        params![
            user_id,
            provider.as_str(),
            phase,
            status,
            items_synced as i64,
            items_failed as i64,
            error_message,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn last_sync_at(
    conn: &Connection,
    provider: Provider,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT MAX(completed_at) FROM sync_runs WHERE provider = ?1",
        params![provider.as_str()],
        |row| row.get(0),
    )
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, datetime('now'))",
        params![key, value],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

// ── Helpers ────────────────────────────────────────────────────────

fn parse_provider(idx: usize, s: &str) -> Result<Provider, rusqlite::Error> {
    s.parse::<Provider>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

//! Merges optimistic sends with the provider's confirmed messages.

pub mod unread;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};

use crate::model::{DeliveryState, Direction, Message};

pub use unread::{conversation_unread, is_unread};

const TEMP_PREFIX: &str = "temp-";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Id for a client-originated message: `temp-{created millis}-{counter}`.
pub fn new_temp_id(now: DateTime<Utc>) -> String {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{TEMP_PREFIX}{}-{n}", now.timestamp_millis())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_PREFIX)
}

pub fn mark_failed(message: &mut Message) {
    message.delivery_state = message.delivery_state.promote(DeliveryState::Failed);
}

/// A temporary message that an authoritative one replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub temp_id: String,
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Deduplicated by id, sorted by `(timestamp, id)`.
    pub messages: Vec<Message>,
    pub replaced: Vec<Replacement>,
}

fn matches(temp: &Message, confirmed: &Message, window: Duration) -> bool {
    confirmed.direction == Direction::Outgoing
        && confirmed.provider == temp.provider
        && confirmed.conversation_id == temp.conversation_id
        && confirmed.content.trim() == temp.content.trim()
        && (confirmed.timestamp - temp.timestamp).abs() < window
}

/// Merge `local` (cached plus temporary) with `authoritative` messages.
///
/// A pending temporary message is replaced by the closest unclaimed
/// authoritative outgoing message in the same conversation with the same
/// content inside `window`; the result is at least `delivered`. Failed
/// temporaries are never matched. Delivery states only move forward.
pub fn reconcile(local: &[Message], authoritative: &[Message], window: Duration) -> Reconciliation {
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut replaced = Vec::new();
    let mut promoted: HashMap<usize, DeliveryState> = HashMap::new();
    let mut kept_temps: Vec<&Message> = Vec::new();

    let mut temps: Vec<&Message> = local.iter().filter(|m| is_temp_id(&m.id)).collect();
    temps.sort_by_key(|m| (m.timestamp, m.id.clone()));

    for temp in temps {
        if temp.delivery_state == DeliveryState::Failed {
            kept_temps.push(temp);
            continue;
        }
        let best = authoritative
            .iter()
            .enumerate()
            .filter(|(i, c)| !claimed.contains(i) && matches(temp, c, window))
            .min_by_key(|(_, c)| ((c.timestamp - temp.timestamp).abs(), c.id.clone()));
        match best {
            Some((i, confirmed)) => {
                claimed.insert(i);
                let state = temp
                    .delivery_state
                    .promote(confirmed.delivery_state)
                    .promote(DeliveryState::Delivered);
                promoted.insert(i, state);
                replaced.push(Replacement {
                    temp_id: temp.id.clone(),
                    conversation_id: confirmed.conversation_id.clone(),
                    message_id: confirmed.id.clone(),
                });
            }
            None => kept_temps.push(temp),
        }
    }

    let mut by_id: HashMap<(String, String), Message> = HashMap::new();
    let mut merge = |m: Message| {
        let key = (m.conversation_id.clone(), m.id.clone());
        match by_id.get_mut(&key) {
            Some(existing) => {
                let state = existing.delivery_state.promote(m.delivery_state);
                *existing = m;
                existing.delivery_state = state;
            }
            None => {
                by_id.insert(key, m);
            }
        }
    };

    for m in local.iter().filter(|m| !is_temp_id(&m.id)) {
        merge(m.clone());
    }
    for m in kept_temps {
        merge(m.clone());
    }
    for (i, m) in authoritative.iter().enumerate() {
        let mut m = m.clone();
        if let Some(state) = promoted.get(&i) {
            m.delivery_state = m.delivery_state.promote(*state);
        }
        merge(m);
    }

    let mut messages: Vec<Message> = by_id.into_values().collect();
    messages.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));
    Reconciliation { messages, replaced }
}

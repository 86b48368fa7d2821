use chrono::{DateTime, Utc};

use crate::model::{Conversation, ConversationSnapshot, Direction, Message};

/// A message is unread when it is incoming and strictly newer than the
/// conversation's read marker. No marker means everything is read.
pub fn is_unread(message: &Message, marker: Option<DateTime<Utc>>) -> bool {
    match marker {
        Some(marker) => message.direction == Direction::Incoming && message.timestamp > marker,
        None => false,
    }
}

pub fn conversation_unread(messages: &[Message], marker: Option<DateTime<Utc>>) -> bool {
    messages.iter().any(|m| is_unread(m, marker))
}

impl ConversationSnapshot {
    pub fn is_unread(&self) -> bool {
        match (self.latest_incoming, self.last_read) {
            (Some(latest), Some(marker)) => latest > marker,
            _ => false,
        }
    }

    pub fn into_conversation(self) -> Conversation {
        let unread = self.is_unread();
        Conversation {
            id: self.id,
            provider: self.provider,
            participant_ref: self.participant_ref,
            last_message_timestamp: self.last_message_timestamp,
            unread,
            preview: self.preview,
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{MessageId, UserId};

/// A row of the platform's `messages` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl ChatMessage {
    /// The other participant relative to `identity`, or `None` when the
    /// message does not involve `identity` or is addressed to itself.
    pub fn counterpart_of(&self, identity: UserId) -> Option<UserId> {
        if self.sender_id == self.recipient_id {
            return None;
        }
        if self.sender_id == identity {
            Some(self.recipient_id)
        } else if self.recipient_id == identity {
            Some(self.sender_id)
        } else {
            None
        }
    }

    pub fn is_unread_for(&self, identity: UserId) -> bool {
        self.recipient_id == identity && self.sender_id != identity && !self.read
    }

    /// Ordering key used to pick the newest message of a conversation.
    pub fn ordering_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.id)
    }
}

/// Insert payload for the `messages` table; the platform assigns `id` and `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadMarkUpdate {
    pub read: bool,
}

/// A row of the platform's `profiles` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
}

impl Profile {
    pub fn display_name(&self) -> &str {
        match self.full_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => "Unknown user",
        }
    }
}

/// Change notifications delivered by the realtime feed for the `messages` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert(ChatMessage),
    Update(ChatMessage),
}

impl ChangeEvent {
    pub fn record(&self) -> &ChatMessage {
        match self {
            ChangeEvent::Insert(message) | ChangeEvent::Update(message) => message,
        }
    }
}

/// Outbound payload for the push-notification relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushNotification {
    pub to: String,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

use tokio::sync::watch;

use crate::conversations::ConversationStore;

/// Publishes the unread badge count. The value is always derived from the
/// store; nothing increments it directly.
pub struct UnreadAggregator {
    count: watch::Sender<usize>,
}

impl Default for UnreadAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl UnreadAggregator {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    /// Recomputes from `store` (`None` means no identity) and notifies
    /// subscribers only when the value moved. Returns the current count.
    pub fn recompute(&self, store: Option<&ConversationStore>) -> usize {
        let next = store.map_or(0, ConversationStore::unread_counterparts);
        self.count.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        next
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use shared::{
        domain::{MessageId, UserId},
        protocol::{ChatMessage, Profile},
    };

    use super::*;

    fn unread_from(sender: UserId, recipient: UserId) -> ChatMessage {
        ChatMessage {
            id: MessageId::new_v4(),
            sender_id: sender,
            recipient_id: recipient,
            content: "ping".to_string(),
            created_at: Utc::now(),
            read: false,
        }
    }

    #[test]
    fn repeated_messages_from_one_counterpart_count_once() {
        let me = UserId::new_v4();
        let coach = UserId::new_v4();
        let mut store = ConversationStore::new(me);
        store.remember_profile(Profile {
            id: coach,
            full_name: Some("Coach".to_string()),
            avatar_url: None,
            push_token: None,
        });
        let aggregator = UnreadAggregator::new();

        store.apply_incoming(&unread_from(coach, me));
        assert_eq!(aggregator.recompute(Some(&store)), 1);
        store.apply_incoming(&unread_from(coach, me));
        assert_eq!(aggregator.recompute(Some(&store)), 1);
        assert_eq!(aggregator.count(), 1);

        assert_eq!(aggregator.recompute(None), 0);
    }

    #[tokio::test]
    async fn subscribers_are_only_notified_on_change() {
        let aggregator = UnreadAggregator::new();
        let mut rx = aggregator.subscribe();

        aggregator.recompute(None);
        assert!(!rx.has_changed().expect("sender alive"));

        let me = UserId::new_v4();
        let coach = UserId::new_v4();
        let mut store = ConversationStore::new(me);
        store.remember_profile(Profile {
            id: coach,
            full_name: None,
            avatar_url: None,
            push_token: None,
        });
        store.apply_incoming(&unread_from(coach, me));
        aggregator.recompute(Some(&store));

        rx.changed().await.expect("changed");
        assert_eq!(*rx.borrow_and_update(), 1);
    }
}

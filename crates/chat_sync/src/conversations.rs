use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::{ChatMessage, Profile},
};

/// Client-side summary of everything exchanged with one counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub counterpart_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub last_message: String,
    pub last_message_id: MessageId,
    pub last_message_at: DateTime<Utc>,
    pub unread: bool,
}

impl Conversation {
    fn from_message(profile: &Profile, message: &ChatMessage) -> Self {
        Self {
            counterpart_id: profile.id,
            display_name: profile.display_name().to_string(),
            avatar_url: profile.avatar_url.clone(),
            last_message: message.content.clone(),
            last_message_id: message.id,
            last_message_at: message.created_at,
            unread: false,
        }
    }

    fn set_summary(&mut self, message: &ChatMessage) {
        self.last_message = message.content.clone();
        self.last_message_id = message.id;
        self.last_message_at = message.created_at;
    }
}

/// Result of one full fetch: every message touching the identity plus the
/// profile rows of their counterparts.
#[derive(Debug, Clone, Default)]
pub struct ConversationSnapshot {
    pub messages: Vec<ChatMessage>,
    pub profiles: Vec<Profile>,
}

/// Issued before a full fetch goes out; orders snapshots against each other
/// and against incremental updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Applied { skipped: usize, replayed: usize },
    /// A snapshot fetched later has already been applied.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    /// Summary kept; the unread flag may still have been raised.
    Stale { unread_changed: bool },
    /// The counterpart has no cached profile; load it and apply again.
    MissingProfile(UserId),
    /// The message does not involve this identity.
    Ignored,
}

impl ApplyOutcome {
    pub fn changed(&self) -> bool {
        match self {
            ApplyOutcome::Created | ApplyOutcome::Updated => true,
            ApplyOutcome::Stale { unread_changed } => *unread_changed,
            ApplyOutcome::MissingProfile(_) | ApplyOutcome::Ignored => false,
        }
    }
}

#[derive(Debug, Clone)]
enum JournalOp {
    Incoming(ChatMessage),
    MarkedRead(UserId),
}

#[derive(Debug, Clone)]
struct JournalEntry {
    seq: u64,
    op: JournalOp,
}

/// The single owned set of conversations for one identity.
#[derive(Debug)]
pub struct ConversationStore {
    identity: UserId,
    conversations: HashMap<UserId, Conversation>,
    profiles: HashMap<UserId, Profile>,
    seq: u64,
    applied_snapshot: Option<FetchTicket>,
    /// Tickets whose snapshot has not come back yet. The journal only has
    /// to reach back to the oldest of them.
    outstanding: BTreeSet<FetchTicket>,
    journal: Vec<JournalEntry>,
}

impl ConversationStore {
    pub fn new(identity: UserId) -> Self {
        Self {
            identity,
            conversations: HashMap::new(),
            profiles: HashMap::new(),
            seq: 0,
            applied_snapshot: None,
            outstanding: BTreeSet::new(),
            journal: Vec::new(),
        }
    }

    pub fn identity(&self) -> UserId {
        self.identity
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn get(&self, counterpart: UserId) -> Option<&Conversation> {
        self.conversations.get(&counterpart)
    }

    pub fn profile(&self, user_id: UserId) -> Option<&Profile> {
        self.profiles.get(&user_id)
    }

    /// Conversations ordered newest first.
    pub fn list(&self) -> Vec<Conversation> {
        let mut conversations: Vec<_> = self.conversations.values().cloned().collect();
        conversations.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| b.last_message_id.cmp(&a.last_message_id))
        });
        conversations
    }

    /// Number of distinct counterparts with at least one unread message.
    pub fn unread_counterparts(&self) -> usize {
        self.conversations.values().filter(|c| c.unread).count()
    }

    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.seq += 1;
        let ticket = FetchTicket(self.seq);
        self.outstanding.insert(ticket);
        ticket
    }

    /// Releases `ticket` after its fetch failed.
    pub fn abandon_fetch(&mut self, ticket: FetchTicket) {
        self.outstanding.remove(&ticket);
        self.trim_journal();
    }

    pub fn remember_profile(&mut self, profile: Profile) {
        if let Some(conversation) = self.conversations.get_mut(&profile.id) {
            conversation.display_name = profile.display_name().to_string();
            conversation.avatar_url = profile.avatar_url.clone();
        }
        self.profiles.insert(profile.id, profile);
    }

    /// Replaces the whole set with `snapshot`, then replays updates observed
    /// after `ticket` was issued.
    pub fn replace_all(
        &mut self,
        ticket: FetchTicket,
        snapshot: ConversationSnapshot,
    ) -> SnapshotOutcome {
        self.outstanding.remove(&ticket);
        if self.applied_snapshot.is_some_and(|applied| applied > ticket) {
            self.trim_journal();
            return SnapshotOutcome::Discarded;
        }

        let profiles: HashMap<UserId, Profile> = snapshot
            .profiles
            .into_iter()
            .map(|profile| (profile.id, profile))
            .collect();
        let (conversations, skipped) = group_conversations(self.identity, &snapshot.messages, &profiles);

        self.profiles.extend(profiles);
        self.conversations = conversations;
        self.applied_snapshot = Some(ticket);

        let FetchTicket(ticket_seq) = ticket;
        let pending: Vec<JournalOp> = self
            .journal
            .iter()
            .filter(|entry| entry.seq > ticket_seq)
            .map(|entry| entry.op.clone())
            .collect();
        let replayed = pending.len();
        for op in pending {
            match op {
                JournalOp::Incoming(message) => {
                    self.merge_incoming(&message);
                }
                JournalOp::MarkedRead(counterpart) => {
                    self.clear_unread(counterpart);
                }
            }
        }

        self.trim_journal();
        SnapshotOutcome::Applied { skipped, replayed }
    }

    /// Folds one newly observed message into its counterpart's entry. The
    /// summary only moves forward in `created_at`.
    pub fn apply_incoming(&mut self, message: &ChatMessage) -> ApplyOutcome {
        let outcome = self.merge_incoming(message);
        if outcome.changed() {
            self.record(JournalOp::Incoming(message.clone()));
        }
        outcome
    }

    /// Clears the unread flag of `counterpart`. Returns whether it was set.
    pub fn mark_read(&mut self, counterpart: UserId) -> bool {
        self.record(JournalOp::MarkedRead(counterpart));
        self.clear_unread(counterpart)
    }

    /// Journals `op` for replay over snapshots still in flight.
    fn record(&mut self, op: JournalOp) {
        self.seq += 1;
        if self.outstanding.is_empty() {
            return;
        }
        self.journal.push(JournalEntry { seq: self.seq, op });
    }

    fn trim_journal(&mut self) {
        match self.outstanding.first() {
            Some(&FetchTicket(oldest)) => self.journal.retain(|entry| entry.seq > oldest),
            None => self.journal.clear(),
        }
    }

    #[cfg(test)]
    pub(crate) fn journal_len(&self) -> usize {
        self.journal.len()
    }

    fn clear_unread(&mut self, counterpart: UserId) -> bool {
        match self.conversations.get_mut(&counterpart) {
            Some(conversation) if conversation.unread => {
                conversation.unread = false;
                true
            }
            _ => false,
        }
    }

    fn merge_incoming(&mut self, message: &ChatMessage) -> ApplyOutcome {
        let Some(counterpart) = message.counterpart_of(self.identity) else {
            return ApplyOutcome::Ignored;
        };
        let unread = message.is_unread_for(self.identity);

        if let Some(conversation) = self.conversations.get_mut(&counterpart) {
            let unread_changed = unread && !conversation.unread;
            if unread {
                conversation.unread = true;
            }
            if message.created_at > conversation.last_message_at {
                conversation.set_summary(message);
                return ApplyOutcome::Updated;
            }
            return ApplyOutcome::Stale { unread_changed };
        }

        let Some(profile) = self.profiles.get(&counterpart) else {
            return ApplyOutcome::MissingProfile(counterpart);
        };
        let mut conversation = Conversation::from_message(profile, message);
        conversation.unread = unread;
        self.conversations.insert(counterpart, conversation);
        ApplyOutcome::Created
    }
}

/// Groups messages into one conversation per counterpart. Records without a
/// resolvable counterpart or profile are skipped and counted.
fn group_conversations(
    identity: UserId,
    messages: &[ChatMessage],
    profiles: &HashMap<UserId, Profile>,
) -> (HashMap<UserId, Conversation>, usize) {
    let mut conversations: HashMap<UserId, Conversation> = HashMap::new();
    let mut newest: HashMap<UserId, (DateTime<Utc>, MessageId)> = HashMap::new();
    let mut skipped = 0;

    for message in messages {
        let Some(counterpart) = message.counterpart_of(identity) else {
            skipped += 1;
            continue;
        };
        let Some(profile) = profiles.get(&counterpart) else {
            skipped += 1;
            continue;
        };

        let unread = message.is_unread_for(identity);
        let key = message.ordering_key();
        match conversations.get_mut(&counterpart) {
            Some(conversation) => {
                conversation.unread |= unread;
                if newest.get(&counterpart).is_some_and(|current| key > *current) {
                    conversation.set_summary(message);
                    newest.insert(counterpart, key);
                }
            }
            None => {
                let mut conversation = Conversation::from_message(profile, message);
                conversation.unread = unread;
                conversations.insert(counterpart, conversation);
                newest.insert(counterpart, key);
            }
        }
    }

    (conversations, skipped)
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;

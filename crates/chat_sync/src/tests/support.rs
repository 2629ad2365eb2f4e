use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::{ChangeEvent, ChatMessage, NewMessage, Profile, PushNotification},
};
use tokio::sync::{mpsc, Mutex, Notify};

use crate::{
    session::{AuthSession, Identity},
    AuthProvider, ChatBackend, PushRelay, RealtimeConnector, RealtimeSubscription,
    SubscriptionRequest,
};

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("timestamp")
}

pub(crate) fn message(from: UserId, to: UserId, secs: i64, read: bool, content: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId::new_v4(),
        sender_id: from,
        recipient_id: to,
        content: content.to_string(),
        created_at: at(secs),
        read,
    }
}

pub(crate) fn profile(id: UserId, name: &str) -> Profile {
    Profile {
        id,
        full_name: Some(name.to_string()),
        avatar_url: None,
        push_token: None,
    }
}

pub(crate) fn session_for(user_id: UserId) -> AuthSession {
    AuthSession {
        user_id,
        email: Some(format!("{user_id}@coach.test")),
        access_token: format!("access-{user_id}"),
        refresh_token: format!("refresh-{user_id}"),
        expires_at: Utc::now() + chrono::Duration::hours(1),
    }
}

/// Polls `check` until it holds or two seconds pass.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// In-memory `messages`/`profiles` tables.
#[derive(Default)]
pub(crate) struct FakeBackend {
    pub messages: Mutex<Vec<ChatMessage>>,
    pub profiles: Mutex<Vec<Profile>>,
    pub fail_fetch: AtomicBool,
    pub hold_fetch: AtomicBool,
    pub release: Notify,
    pub fetch_calls: AtomicUsize,
    pub profile_calls: AtomicUsize,
    pub read_marks: Mutex<Vec<(UserId, UserId)>>,
}

impl FakeBackend {
    pub async fn seed(&self, messages: Vec<ChatMessage>, profiles: Vec<Profile>) {
        self.messages.lock().await.extend(messages);
        self.profiles.lock().await.extend(profiles);
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn fetch_messages(&self, identity: &Identity) -> Result<Vec<ChatMessage>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold_fetch.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(anyhow!("connection reset by peer"));
        }
        let mut rows: Vec<ChatMessage> = self
            .messages
            .lock()
            .await
            .iter()
            .filter(|m| m.sender_id == identity.user_id || m.recipient_id == identity.user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn fetch_profiles(&self, _identity: &Identity, ids: &[UserId]) -> Result<Vec<Profile>> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .profiles
            .lock()
            .await
            .iter()
            .filter(|p| ids.contains(&p.id))
            .cloned()
            .collect())
    }

    async fn mark_read(&self, identity: &Identity, counterpart: UserId) -> Result<()> {
        for row in self.messages.lock().await.iter_mut() {
            if row.sender_id == counterpart && row.recipient_id == identity.user_id {
                row.read = true;
            }
        }
        self.read_marks
            .lock()
            .await
            .push((identity.user_id, counterpart));
        Ok(())
    }

    async fn insert_message(&self, _identity: &Identity, message: NewMessage) -> Result<ChatMessage> {
        let row = ChatMessage {
            id: MessageId::new_v4(),
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            content: message.content,
            created_at: Utc::now(),
            read: false,
        };
        self.messages.lock().await.push(row.clone());
        Ok(row)
    }
}

/// Realtime connector whose subscriptions are fed from the test.
#[derive(Default)]
pub(crate) struct FakeConnector {
    pub active: Arc<AtomicUsize>,
    pub connects: AtomicUsize,
    pub fail_remaining: AtomicU32,
    pub senders: Mutex<Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    pub requested_users: Mutex<Vec<UserId>>,
}

impl FakeConnector {
    pub fn failing(times: u32) -> Self {
        let connector = Self::default();
        connector.fail_remaining.store(times, Ordering::SeqCst);
        connector
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Delivers `change` on the most recent subscription.
    pub async fn emit(&self, change: ChangeEvent) -> bool {
        match self.senders.lock().await.last() {
            Some(sender) => sender.send(change).is_ok(),
            None => false,
        }
    }

    /// Simulates the transport silently dropping every open subscription.
    pub async fn drop_all(&self) {
        self.senders.lock().await.clear();
    }
}

#[async_trait]
impl RealtimeConnector for FakeConnector {
    async fn connect(&self, request: SubscriptionRequest) -> Result<Box<dyn RealtimeSubscription>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.requested_users
            .lock()
            .await
            .push(request.identity.user_id);
        let failed = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("realtime handshake refused"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().await.push(tx);
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSubscription {
            rx,
            active: Arc::clone(&self.active),
            open: true,
        }))
    }
}

pub(crate) struct FakeSubscription {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    active: Arc<AtomicUsize>,
    open: bool,
}

impl FakeSubscription {
    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RealtimeSubscription for FakeSubscription {
    async fn next_change(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for FakeSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Default)]
pub(crate) struct FakePush {
    pub sent: Mutex<Vec<PushNotification>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl PushRelay for FakePush {
    async fn send(&self, notification: &PushNotification) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("relay unavailable"));
        }
        self.sent.lock().await.push(notification.clone());
        Ok(())
    }
}

pub(crate) struct FakeAuth {
    pub user_id: UserId,
    pub refreshes: AtomicUsize,
    pub sign_outs: AtomicUsize,
    pub hold_refresh: AtomicBool,
    pub release_refresh: Notify,
}

impl FakeAuth {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            refreshes: AtomicUsize::new(0),
            sign_outs: AtomicUsize::new(0),
            hold_refresh: AtomicBool::new(false),
            release_refresh: Notify::new(),
        }
    }
}

#[async_trait]
impl AuthProvider for FakeAuth {
    async fn sign_in_with_password(&self, _email: &str, password: &str) -> Result<AuthSession> {
        if password != "correct horse" {
            return Err(anyhow!("Invalid login credentials"));
        }
        Ok(session_for(self.user_id))
    }

    async fn refresh_session(&self, _refresh_token: &str) -> Result<AuthSession> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.hold_refresh.load(Ordering::SeqCst) {
            self.release_refresh.notified().await;
        }
        let mut session = session_for(self.user_id);
        session.access_token = format!("refreshed-{n}");
        Ok(session)
    }

    async fn sign_out(&self, _access_token: &str) -> Result<()> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

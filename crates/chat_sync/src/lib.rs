use std::{collections::BTreeSet, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::UserId,
    protocol::{ChangeEvent, ChatMessage, NewMessage, Profile, PushNotification},
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod auth;
pub mod config;
pub mod conversations;
pub mod error;
pub mod live_channel;
pub mod push;
pub mod realtime;
pub mod rest;
pub mod resync;
pub mod session;
pub mod unread;

pub use conversations::{
    ApplyOutcome, Conversation, ConversationSnapshot, ConversationStore, SnapshotOutcome,
};
pub use error::SyncError;
pub use live_channel::{BackoffPolicy, ChannelState, LiveSignal, LiveUpdateChannel};
pub use resync::{AppState, ForegroundResynchronizer, LifecycleEvent, ResyncPlan};
pub use session::{AuthSession, Identity, SessionGate, SessionState, SessionTransition};
pub use unread::UnreadAggregator;

use config::ClientSettings;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Every message where `identity` is sender or recipient, newest first.
    async fn fetch_messages(&self, identity: &Identity) -> Result<Vec<ChatMessage>>;
    async fn fetch_profiles(&self, identity: &Identity, ids: &[UserId]) -> Result<Vec<Profile>>;
    /// Marks every unread message from `counterpart` to `identity` as read.
    async fn mark_read(&self, identity: &Identity, counterpart: UserId) -> Result<()>;
    async fn insert_message(&self, identity: &Identity, message: NewMessage) -> Result<ChatMessage>;
}

pub struct MissingChatBackend;

#[async_trait]
impl ChatBackend for MissingChatBackend {
    async fn fetch_messages(&self, _identity: &Identity) -> Result<Vec<ChatMessage>> {
        Err(anyhow!("chat backend is unavailable"))
    }

    async fn fetch_profiles(&self, _identity: &Identity, _ids: &[UserId]) -> Result<Vec<Profile>> {
        Err(anyhow!("chat backend is unavailable"))
    }

    async fn mark_read(&self, _identity: &Identity, counterpart: UserId) -> Result<()> {
        Err(anyhow!(
            "chat backend is unavailable; cannot mark messages from {counterpart} read"
        ))
    }

    async fn insert_message(&self, _identity: &Identity, _message: NewMessage) -> Result<ChatMessage> {
        Err(anyhow!("chat backend is unavailable"))
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthSession>;
    async fn refresh_session(&self, refresh_token: &str) -> Result<AuthSession>;
    async fn sign_out(&self, access_token: &str) -> Result<()>;
}

pub struct MissingAuthProvider;

#[async_trait]
impl AuthProvider for MissingAuthProvider {
    async fn sign_in_with_password(&self, _email: &str, _password: &str) -> Result<AuthSession> {
        Err(anyhow!("auth provider is unavailable"))
    }

    async fn refresh_session(&self, _refresh_token: &str) -> Result<AuthSession> {
        Err(anyhow!("auth provider is unavailable"))
    }

    async fn sign_out(&self, _access_token: &str) -> Result<()> {
        Err(anyhow!("auth provider is unavailable"))
    }
}

#[async_trait]
pub trait PushRelay: Send + Sync {
    async fn send(&self, notification: &PushNotification) -> Result<()>;
}

pub struct MissingPushRelay;

#[async_trait]
impl PushRelay for MissingPushRelay {
    async fn send(&self, _notification: &PushNotification) -> Result<()> {
        Err(anyhow!("push relay is unavailable"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub identity: Identity,
}

#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self, request: SubscriptionRequest) -> Result<Box<dyn RealtimeSubscription>>;
}

#[async_trait]
pub trait RealtimeSubscription: Send {
    /// Next change for the subscribed identity; `None` once the transport dropped.
    async fn next_change(&mut self) -> Option<ChangeEvent>;
    async fn close(&mut self) -> Result<()>;
}

pub struct MissingRealtimeConnector;

#[async_trait]
impl RealtimeConnector for MissingRealtimeConnector {
    async fn connect(&self, _request: SubscriptionRequest) -> Result<Box<dyn RealtimeSubscription>> {
        Err(anyhow!("realtime connector is unavailable"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    SessionChanged(Option<UserId>),
    UnreadCountChanged(usize),
    LiveStateChanged(ChannelState),
    Resynced { conversations: usize },
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// No identity, so no request was made.
    Skipped,
    /// The identity changed while the request was in flight.
    Superseded,
    /// A newer snapshot had already been applied.
    Discarded,
    Applied { conversations: usize, skipped: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub backoff: BackoffPolicy,
    pub token_refresh_margin: chrono::Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            token_refresh_margin: chrono::Duration::seconds(60),
        }
    }
}

struct SyncState {
    epoch: u64,
    store: Option<ConversationStore>,
    sink: Option<mpsc::UnboundedSender<LiveSignal>>,
    dispatch_task: Option<JoinHandle<()>>,
}

/// Owns the conversation list and unread count for the signed-in user and
/// keeps them in step with the platform.
pub struct ChatSyncClient {
    backend: Arc<dyn ChatBackend>,
    auth: Arc<dyn AuthProvider>,
    push: Arc<dyn PushRelay>,
    options: SyncOptions,
    session: SessionGate,
    /// Serializes session installs with the teardown and rebuild they cause.
    transitions: Mutex<()>,
    inner: Mutex<SyncState>,
    live: Mutex<LiveUpdateChannel>,
    resync: Mutex<ForegroundResynchronizer>,
    unread: UnreadAggregator,
    conversations: watch::Sender<Vec<Conversation>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatSyncClient {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Arc<Self> {
        Self::new_with_dependencies(
            backend,
            connector,
            Arc::new(MissingAuthProvider),
            Arc::new(MissingPushRelay),
            SyncOptions::default(),
        )
    }

    pub fn new_with_dependencies(
        backend: Arc<dyn ChatBackend>,
        connector: Arc<dyn RealtimeConnector>,
        auth: Arc<dyn AuthProvider>,
        push: Arc<dyn PushRelay>,
        options: SyncOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (conversations, _) = watch::channel(Vec::new());
        Arc::new(Self {
            backend,
            auth,
            push,
            options,
            session: SessionGate::new(),
            transitions: Mutex::new(()),
            inner: Mutex::new(SyncState {
                epoch: 0,
                store: None,
                sink: None,
                dispatch_task: None,
            }),
            live: Mutex::new(LiveUpdateChannel::new(connector, options.backoff)),
            resync: Mutex::new(ForegroundResynchronizer::new()),
            unread: UnreadAggregator::new(),
            conversations,
            events,
        })
    }

    /// Wires the platform-backed implementations described by `settings`.
    pub fn from_settings(settings: &ClientSettings) -> Arc<Self> {
        Self::new_with_dependencies(
            Arc::new(rest::RestChatBackend::new(
                settings.platform_url.clone(),
                settings.anon_key.clone(),
            )),
            Arc::new(realtime::PhoenixRealtimeConnector::new(
                settings.platform_url.clone(),
                settings.anon_key.clone(),
                settings.heartbeat_interval(),
            )),
            Arc::new(auth::PlatformAuthClient::new(
                settings.platform_url.clone(),
                settings.anon_key.clone(),
            )),
            Arc::new(push::HttpPushRelay::new(settings.push_relay_url.clone())),
            SyncOptions {
                backoff: settings.backoff(),
                token_refresh_margin: settings.token_refresh_margin(),
            },
        )
    }

    pub fn session(&self) -> &SessionGate {
        &self.session
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.conversations.subscribe()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations.borrow().clone()
    }

    pub fn subscribe_unread(&self) -> watch::Receiver<usize> {
        self.unread.subscribe()
    }

    pub fn unread_count(&self) -> usize {
        self.unread.count()
    }

    pub async fn live_state(&self) -> ChannelState {
        self.live.lock().await.state()
    }

    pub async fn sign_in(self: &Arc<Self>, email: &str, password: &str) -> Result<UserId> {
        {
            let _transition = self.transitions.lock().await;
            if self.session.begin_resolving() == SessionTransition::IdentityChanged {
                self.on_identity_changed().await;
            }
        }
        match self.auth.sign_in_with_password(email, password).await {
            Ok(session) => {
                let user_id = session.user_id;
                self.set_session(Some(session)).await;
                Ok(user_id)
            }
            Err(err) => {
                warn!("session: sign in failed: {err:#}");
                self.set_session(None).await;
                Err(err)
            }
        }
    }

    pub async fn sign_out(self: &Arc<Self>) {
        if let Some(session) = self.session.auth_session() {
            if let Err(err) = self.auth.sign_out(&session.access_token).await {
                warn!(user_id = %session.user_id, "session: remote sign out failed: {err:#}");
            }
        }
        self.set_session(None).await;
    }

    /// Installs a resolved session (or none). An identity change tears down
    /// all per-user state before the new user's state is built.
    pub async fn set_session(self: &Arc<Self>, session: Option<AuthSession>) -> SessionTransition {
        let _transition = self.transitions.lock().await;
        self.install_session(session).await
    }

    /// Caller holds `transitions`.
    async fn install_session(self: &Arc<Self>, session: Option<AuthSession>) -> SessionTransition {
        let transition = self.session.resolve(session);
        match transition {
            SessionTransition::IdentityChanged => self.on_identity_changed().await,
            SessionTransition::Refreshed => debug!("session: tokens refreshed"),
            SessionTransition::Unchanged => {}
        }
        transition
    }

    /// Stops background work; per-user state is dropped.
    pub async fn shutdown(&self) {
        self.deactivate().await;
    }

    async fn on_identity_changed(self: &Arc<Self>) {
        self.deactivate().await;
        let identity = self.session.identity();
        let _ = self
            .events
            .send(ClientEvent::SessionChanged(identity.as_ref().map(|i| i.user_id)));
        if let Some(identity) = identity {
            self.activate(identity).await;
        }
    }

    async fn deactivate(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.epoch += 1;
            guard.store = None;
            guard.sink = None;
            if let Some(task) = guard.dispatch_task.take() {
                task.abort();
            }
            self.publish(None);
        }
        self.live.lock().await.teardown().await;
        self.resync.lock().await.reset();
    }

    async fn activate(self: &Arc<Self>, identity: Identity) {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = {
            let mut guard = self.inner.lock().await;
            guard.epoch += 1;
            guard.store = Some(ConversationStore::new(identity.user_id));
            guard.sink = Some(tx);
            self.publish(guard.store.as_ref());
            guard.epoch
        };

        let task = self.spawn_dispatch(epoch, rx);
        {
            let mut guard = self.inner.lock().await;
            if guard.epoch == epoch {
                if let Some(stale) = guard.dispatch_task.replace(task) {
                    stale.abort();
                }
            } else {
                task.abort();
                return;
            }
        }
        info!(user_id = %identity.user_id, epoch, "sync: activated");

        self.ensure_subscribed().await;
        if let Err(err) = self.fetch_all().await {
            let _ = self
                .events
                .send(ClientEvent::Error(format!("initial conversation fetch failed: {err}")));
        }
    }

    fn spawn_dispatch(
        self: &Arc<Self>,
        epoch: u64,
        mut signals: mpsc::UnboundedReceiver<LiveSignal>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                match signal {
                    LiveSignal::Change(change) => client.handle_change(epoch, change).await,
                    LiveSignal::State(state) => {
                        let _ = client.events.send(ClientEvent::LiveStateChanged(state));
                    }
                }
            }
        })
    }

    /// Makes sure the live channel runs for the current identity. A healthy
    /// subscription is left alone; anything else is replaced.
    pub async fn ensure_subscribed(&self) {
        let Some(identity) = self.session.identity() else {
            return;
        };
        let Some(sink) = self.inner.lock().await.sink.clone() else {
            return;
        };
        let mut live = self.live.lock().await;
        if live.is_feeding(identity.user_id, &sink)
            && matches!(
                live.state(),
                ChannelState::Subscribed | ChannelState::Subscribing
            )
        {
            return;
        }
        live.subscribe(identity, sink).await;
    }

    async fn current_epoch(&self) -> u64 {
        self.inner.lock().await.epoch
    }

    /// Reloads every conversation for the signed-in user and replaces the
    /// in-memory set. Failures are logged, leave the set untouched and are
    /// returned so the caller can retry.
    pub async fn fetch_all(&self) -> Result<FetchOutcome> {
        let Some(identity) = self.session.identity() else {
            return Ok(FetchOutcome::Skipped);
        };
        let (epoch, ticket) = {
            let mut guard = self.inner.lock().await;
            let epoch = guard.epoch;
            match guard.store.as_mut() {
                Some(store) if store.identity() == identity.user_id => (epoch, store.begin_fetch()),
                _ => return Ok(FetchOutcome::Skipped),
            }
        };

        let snapshot = match self.load_snapshot(&identity).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(user_id = %identity.user_id, "sync: conversation fetch failed: {err:#}");
                let mut guard = self.inner.lock().await;
                if guard.epoch == epoch {
                    if let Some(store) = guard.store.as_mut() {
                        store.abandon_fetch(ticket);
                    }
                }
                return Err(err);
            }
        };

        let mut guard = self.inner.lock().await;
        if guard.epoch != epoch {
            debug!(user_id = %identity.user_id, epoch, "sync: dropping fetch for superseded identity");
            return Ok(FetchOutcome::Superseded);
        }
        let Some(store) = guard.store.as_mut() else {
            return Ok(FetchOutcome::Superseded);
        };
        let outcome = match store.replace_all(ticket, snapshot) {
            SnapshotOutcome::Applied { skipped, replayed } => {
                if skipped > 0 {
                    warn!(user_id = %identity.user_id, skipped, "sync: skipped malformed message records");
                }
                debug!(user_id = %identity.user_id, replayed, "sync: snapshot applied");
                FetchOutcome::Applied {
                    conversations: store.list().len(),
                    skipped,
                }
            }
            SnapshotOutcome::Discarded => {
                debug!(user_id = %identity.user_id, "sync: discarded stale snapshot");
                FetchOutcome::Discarded
            }
        };
        self.publish(guard.store.as_ref());
        Ok(outcome)
    }

    async fn load_snapshot(&self, identity: &Identity) -> Result<ConversationSnapshot> {
        let messages = self.backend.fetch_messages(identity).await?;
        let counterparts: Vec<UserId> = messages
            .iter()
            .filter_map(|message| message.counterpart_of(identity.user_id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let profiles = self.backend.fetch_profiles(identity, &counterparts).await?;
        Ok(ConversationSnapshot { messages, profiles })
    }

    async fn handle_change(&self, epoch: u64, change: ChangeEvent) {
        if self.current_epoch().await != epoch {
            return;
        }
        match change {
            ChangeEvent::Insert(message) => {
                if let Err(err) = self.apply_incoming(epoch, message).await {
                    warn!(epoch, "sync: incoming message not applied: {err:#}");
                }
            }
            ChangeEvent::Update(message) => {
                debug!(message_id = %message.id, "sync: update observed; resyncing");
                if let Err(err) = self.fetch_all().await {
                    let _ = self
                        .events
                        .send(ClientEvent::Error(format!("resync after update failed: {err}")));
                }
            }
        }
    }

    async fn apply_incoming(&self, epoch: u64, message: ChatMessage) -> Result<ApplyOutcome> {
        let outcome = {
            let mut guard = self.inner.lock().await;
            if guard.epoch != epoch {
                return Err(SyncError::Superseded.into());
            }
            let Some(store) = guard.store.as_mut() else {
                return Err(SyncError::NotSignedIn.into());
            };
            let outcome = store.apply_incoming(&message);
            if outcome.changed() {
                self.publish(guard.store.as_ref());
            }
            outcome
        };

        let ApplyOutcome::MissingProfile(counterpart) = outcome else {
            return Ok(outcome);
        };

        let identity = self.session.identity().ok_or(SyncError::NotSignedIn)?;
        let profile = self
            .backend
            .fetch_profiles(&identity, &[counterpart])
            .await?
            .into_iter()
            .find(|profile| profile.id == counterpart);

        let mut guard = self.inner.lock().await;
        if guard.epoch != epoch {
            return Err(SyncError::Superseded.into());
        }
        let Some(store) = guard.store.as_mut() else {
            return Err(SyncError::NotSignedIn.into());
        };
        let Some(profile) = profile else {
            warn!(counterpart_id = %counterpart, "sync: skipping message from user without profile");
            return Ok(outcome);
        };
        store.remember_profile(profile);
        let outcome = store.apply_incoming(&message);
        if outcome.changed() {
            self.publish(guard.store.as_ref());
        }
        Ok(outcome)
    }

    /// Marks the conversation with `counterpart` read on the platform, then
    /// locally. The unread count drops by at most one.
    pub async fn mark_conversation_read(&self, counterpart: UserId) -> Result<()> {
        let identity = self.require_identity()?;
        let epoch = self.current_epoch().await;

        if let Err(err) = self.backend.mark_read(&identity, counterpart).await {
            warn!(counterpart_id = %counterpart, "sync: mark read failed: {err:#}");
            return Err(err);
        }

        let mut guard = self.inner.lock().await;
        if guard.epoch != epoch {
            return Err(SyncError::Superseded.into());
        }
        if let Some(store) = guard.store.as_mut() {
            if store.mark_read(counterpart) {
                self.publish(guard.store.as_ref());
            }
        }
        Ok(())
    }

    /// Sends a message, folds it into the local list and notifies the
    /// recipient's device. Notification failures are only logged.
    pub async fn send_message(&self, recipient: UserId, content: &str) -> Result<ChatMessage> {
        let identity = self.require_identity()?;
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::EmptyMessage.into());
        }
        if recipient == identity.user_id {
            return Err(SyncError::SelfMessage.into());
        }
        let epoch = self.current_epoch().await;

        let saved = self
            .backend
            .insert_message(
                &identity,
                NewMessage {
                    sender_id: identity.user_id,
                    recipient_id: recipient,
                    content: content.to_string(),
                },
            )
            .await?;

        if let Err(err) = self.apply_incoming(epoch, saved.clone()).await {
            debug!(message_id = %saved.id, "sync: sent message not applied locally: {err:#}");
        }
        self.notify_recipient(&identity, &saved).await;
        Ok(saved)
    }

    async fn notify_recipient(&self, identity: &Identity, message: &ChatMessage) {
        let profiles = match self
            .backend
            .fetch_profiles(identity, &[message.sender_id, message.recipient_id])
            .await
        {
            Ok(profiles) => profiles,
            Err(err) => {
                warn!(message_id = %message.id, "push: profile lookup failed: {err:#}");
                return;
            }
        };
        let find = |id: UserId| profiles.iter().find(|profile| profile.id == id);
        let Some(token) = find(message.recipient_id).and_then(|p| p.push_token.as_deref()) else {
            debug!(recipient_id = %message.recipient_id, "push: recipient has no device token");
            return;
        };
        let sender_name = find(message.sender_id)
            .map(Profile::display_name)
            .unwrap_or("New message");

        let notification = push::chat_notification(token, sender_name, message);
        if let Err(err) = self.push.send(&notification).await {
            warn!(recipient_id = %message.recipient_id, "push: delivery failed: {err:#}");
        }
    }

    /// Feeds an app-lifecycle or screen-focus transition to the foreground
    /// resynchronizer and runs the resulting plan.
    pub async fn handle_lifecycle(self: &Arc<Self>, event: LifecycleEvent) -> Result<Option<ResyncPlan>> {
        let live_state = self.live.lock().await.state();
        let Some(first) = self.resync.lock().await.observe(&event, live_state) else {
            return Ok(None);
        };

        let mut plan = first;
        loop {
            if self.session.identity().is_none() {
                self.resync.lock().await.reset();
                return Ok(None);
            }
            info!(?event, resubscribe = plan.resubscribe, "sync: foreground resync");
            if let Err(err) = self.run_resync(plan).await {
                self.resync.lock().await.reset();
                return Err(err);
            }
            let live_state = self.live.lock().await.state();
            match self.resync.lock().await.finish(live_state) {
                Some(next) => {
                    debug!("sync: trigger arrived during resync; running again");
                    plan = next;
                }
                None => return Ok(Some(first)),
            }
        }
    }

    async fn run_resync(self: &Arc<Self>, plan: ResyncPlan) -> Result<()> {
        if let Err(err) = self.refresh_session_if_needed().await {
            warn!("session: token refresh failed: {err:#}");
        }
        if plan.resubscribe {
            self.ensure_subscribed().await;
        }
        if plan.refetch {
            if let FetchOutcome::Applied { conversations, .. } = self.fetch_all().await? {
                let _ = self.events.send(ClientEvent::Resynced { conversations });
            }
        }
        Ok(())
    }

    /// Refreshes the access token when it expires within the configured margin.
    pub async fn refresh_session_if_needed(self: &Arc<Self>) -> Result<bool> {
        let Some(session) = self.session.auth_session() else {
            return Ok(false);
        };
        if !session.expires_within(self.options.token_refresh_margin, Utc::now()) {
            return Ok(false);
        }
        let refreshed = self.auth.refresh_session(&session.refresh_token).await?;

        let _transition = self.transitions.lock().await;
        let still_current = self.session.auth_session().is_some_and(|current| {
            current.user_id == session.user_id && current.refresh_token == session.refresh_token
        });
        if !still_current {
            debug!(user_id = %session.user_id, "session: dropping refresh for superseded session");
            return Ok(false);
        }
        self.install_session(Some(refreshed)).await;
        Ok(true)
    }

    fn require_identity(&self) -> Result<Identity> {
        if self.session.is_loading() {
            return Err(SyncError::SessionLoading.into());
        }
        self.session
            .identity()
            .ok_or_else(|| SyncError::NotSignedIn.into())
    }

    fn publish(&self, store: Option<&ConversationStore>) {
        let list = store.map(ConversationStore::list).unwrap_or_default();
        self.conversations.send_if_modified(|current| {
            if *current == list {
                return false;
            }
            *current = list;
            true
        });
        let before = self.unread.count();
        let after = self.unread.recompute(store);
        if before != after {
            let _ = self.events.send(ClientEvent::UnreadCountChanged(after));
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

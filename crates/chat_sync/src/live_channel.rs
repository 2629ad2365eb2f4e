use std::{sync::Arc, time::Duration};

use shared::{domain::UserId, protocol::ChangeEvent};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{session::Identity, RealtimeConnector, SubscriptionRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Failed,
}

/// Exponential reconnect schedule used after a subscription fails or drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: 8,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero based), or `None` once retries are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.max(1).saturating_pow(attempt);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveSignal {
    Change(ChangeEvent),
    State(ChannelState),
}

struct ActiveSubscription {
    user_id: UserId,
    sink: mpsc::UnboundedSender<LiveSignal>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the one realtime subscription for the signed-in identity.
pub struct LiveUpdateChannel {
    connector: Arc<dyn RealtimeConnector>,
    backoff: BackoffPolicy,
    state: Arc<watch::Sender<ChannelState>>,
    active: Option<ActiveSubscription>,
}

impl LiveUpdateChannel {
    pub fn new(connector: Arc<dyn RealtimeConnector>, backoff: BackoffPolicy) -> Self {
        let (state, _) = watch::channel(ChannelState::Unsubscribed);
        Self {
            connector,
            backoff,
            state: Arc::new(state),
            active: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn active_user(&self) -> Option<UserId> {
        self.active.as_ref().map(|active| active.user_id)
    }

    /// Whether the running subscription belongs to `user_id` and delivers into `sink`.
    pub fn is_feeding(&self, user_id: UserId, sink: &mpsc::UnboundedSender<LiveSignal>) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.user_id == user_id && active.sink.same_channel(sink))
    }

    /// Starts delivering changes for `identity` into `sink`. Any previous
    /// subscription is closed first.
    pub async fn subscribe(&mut self, identity: Identity, sink: mpsc::UnboundedSender<LiveSignal>) {
        self.teardown().await;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let user_id = identity.user_id;
        let task = tokio::spawn(run_subscription(
            Arc::clone(&self.connector),
            self.backoff,
            Arc::clone(&self.state),
            identity,
            sink.clone(),
            shutdown_rx,
        ));
        self.active = Some(ActiveSubscription {
            user_id,
            sink,
            shutdown,
            task,
        });
    }

    pub async fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.shutdown.send(());
            if let Err(err) = active.task.await {
                warn!(user_id = %active.user_id, "live: subscription task ended abnormally: {err}");
            }
            info!(user_id = %active.user_id, "live: subscription torn down");
        }
        self.state.send_replace(ChannelState::Unsubscribed);
    }
}

enum PumpEnd {
    Shutdown,
    SinkClosed,
    Dropped,
}

fn publish(
    state: &watch::Sender<ChannelState>,
    sink: &mpsc::UnboundedSender<LiveSignal>,
    next: ChannelState,
) {
    state.send_replace(next);
    let _ = sink.send(LiveSignal::State(next));
}

async fn run_subscription(
    connector: Arc<dyn RealtimeConnector>,
    backoff: BackoffPolicy,
    state: Arc<watch::Sender<ChannelState>>,
    identity: Identity,
    sink: mpsc::UnboundedSender<LiveSignal>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let user_id = identity.user_id;
    let mut attempt = 0u32;

    loop {
        publish(&state, &sink, ChannelState::Subscribing);
        let request = SubscriptionRequest {
            identity: identity.clone(),
        };
        let connected = tokio::select! {
            _ = &mut shutdown => return,
            result = connector.connect(request) => result,
        };

        match connected {
            Ok(mut subscription) => {
                attempt = 0;
                publish(&state, &sink, ChannelState::Subscribed);
                info!(user_id = %user_id, "live: subscribed to message changes");

                let ended = loop {
                    tokio::select! {
                        _ = &mut shutdown => break PumpEnd::Shutdown,
                        change = subscription.next_change() => match change {
                            Some(change) => {
                                if sink.send(LiveSignal::Change(change)).is_err() {
                                    break PumpEnd::SinkClosed;
                                }
                            }
                            None => break PumpEnd::Dropped,
                        }
                    }
                };

                if let Err(err) = subscription.close().await {
                    debug!(user_id = %user_id, "live: close after pump end failed: {err:#}");
                }
                match ended {
                    PumpEnd::Shutdown | PumpEnd::SinkClosed => return,
                    PumpEnd::Dropped => warn!(user_id = %user_id, "live: subscription dropped"),
                }
            }
            Err(err) => {
                warn!(user_id = %user_id, attempt, "live: subscribe failed: {err:#}");
            }
        }

        publish(&state, &sink, ChannelState::Failed);
        let Some(delay) = backoff.delay_for(attempt) else {
            warn!(
                user_id = %user_id,
                attempts = attempt,
                "live: reconnect attempts exhausted; waiting for foreground resync"
            );
            publish(&state, &sink, ChannelState::Unsubscribed);
            return;
        };
        attempt += 1;
        debug!(user_id = %user_id, attempt, delay_ms = delay.as_millis() as u64, "live: retrying");
        tokio::select! {
            _ = &mut shutdown => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/live_channel_tests.rs"]
mod tests;

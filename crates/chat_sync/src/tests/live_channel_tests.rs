use super::*;
use crate::test_support::{eventually, message, FakeConnector};

fn identity(user_id: UserId) -> Identity {
    Identity {
        user_id,
        access_token: format!("token-{user_id}"),
    }
}

fn fast_backoff(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        initial: Duration::from_millis(1),
        max: Duration::from_millis(5),
        multiplier: 2,
        max_attempts,
    }
}

#[test]
fn backoff_grows_and_caps() {
    let policy = BackoffPolicy {
        initial: Duration::from_millis(100),
        max: Duration::from_secs(1),
        multiplier: 3,
        max_attempts: 5,
    };
    assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
    assert_eq!(policy.delay_for(1), Some(Duration::from_millis(300)));
    assert_eq!(policy.delay_for(2), Some(Duration::from_millis(900)));
    assert_eq!(policy.delay_for(3), Some(Duration::from_secs(1)));
    assert_eq!(policy.delay_for(5), None);
}

#[tokio::test]
async fn delivers_changes_once_subscribed() {
    let connector = Arc::new(FakeConnector::default());
    let mut channel = LiveUpdateChannel::new(connector.clone(), fast_backoff(3));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let me = UserId::new_v4();

    channel.subscribe(identity(me), tx).await;
    assert_eq!(rx.recv().await, Some(LiveSignal::State(ChannelState::Subscribing)));
    assert_eq!(rx.recv().await, Some(LiveSignal::State(ChannelState::Subscribed)));
    assert_eq!(channel.state(), ChannelState::Subscribed);
    assert_eq!(channel.active_user(), Some(me));

    let change = ChangeEvent::Insert(message(UserId::new_v4(), me, 1, false, "hi"));
    assert!(connector.emit(change.clone()).await);
    assert_eq!(rx.recv().await, Some(LiveSignal::Change(change)));

    channel.teardown().await;
    assert_eq!(channel.state(), ChannelState::Unsubscribed);
    assert_eq!(connector.active_count(), 0);
}

#[tokio::test]
async fn resubscribing_keeps_exactly_one_subscription() {
    let connector = Arc::new(FakeConnector::default());
    let mut channel = LiveUpdateChannel::new(connector.clone(), fast_backoff(3));
    let me = UserId::new_v4();

    for _ in 0..3 {
        let (tx, _rx) = mpsc::unbounded_channel();
        channel.subscribe(identity(me), tx).await;
        assert!(eventually(|| connector.active_count() == 1 && channel.state() == ChannelState::Subscribed).await);
    }
    assert_eq!(connector.connect_count(), 3);
    assert_eq!(connector.active_count(), 1);
}

#[tokio::test]
async fn retries_with_backoff_after_connect_failures() {
    let connector = Arc::new(FakeConnector::failing(2));
    let mut channel = LiveUpdateChannel::new(connector.clone(), fast_backoff(5));
    let (tx, mut rx) = mpsc::unbounded_channel();

    channel.subscribe(identity(UserId::new_v4()), tx).await;

    let mut states = Vec::new();
    while let Some(signal) = rx.recv().await {
        if let LiveSignal::State(state) = signal {
            states.push(state);
            if state == ChannelState::Subscribed {
                break;
            }
        }
    }
    assert_eq!(
        states,
        vec![
            ChannelState::Subscribing,
            ChannelState::Failed,
            ChannelState::Subscribing,
            ChannelState::Failed,
            ChannelState::Subscribing,
            ChannelState::Subscribed,
        ]
    );
    assert_eq!(connector.connect_count(), 3);
    channel.teardown().await;
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let connector = Arc::new(FakeConnector::failing(u32::MAX));
    let mut channel = LiveUpdateChannel::new(connector.clone(), fast_backoff(2));
    let (tx, mut rx) = mpsc::unbounded_channel();

    channel.subscribe(identity(UserId::new_v4()), tx).await;
    loop {
        match rx.recv().await {
            Some(LiveSignal::State(ChannelState::Unsubscribed)) => break,
            Some(_) => {}
            None => panic!("sink closed before giving up"),
        }
    }
    assert_eq!(channel.state(), ChannelState::Unsubscribed);
    assert_eq!(connector.connect_count(), 3);
}

#[tokio::test]
async fn reconnects_when_transport_drops() {
    let connector = Arc::new(FakeConnector::default());
    let mut channel = LiveUpdateChannel::new(connector.clone(), fast_backoff(3));
    let (tx, _rx) = mpsc::unbounded_channel();

    channel.subscribe(identity(UserId::new_v4()), tx).await;
    assert!(eventually(|| channel.state() == ChannelState::Subscribed).await);

    connector.drop_all().await;
    assert!(eventually(|| connector.connect_count() == 2 && channel.state() == ChannelState::Subscribed).await);
    assert_eq!(connector.active_count(), 1);
    channel.teardown().await;
    assert_eq!(connector.active_count(), 0);
}

#[tokio::test]
async fn is_feeding_tracks_user_and_sink() {
    let connector = Arc::new(FakeConnector::default());
    let mut channel = LiveUpdateChannel::new(connector.clone(), fast_backoff(3));
    let me = UserId::new_v4();
    let (current, _rx) = mpsc::unbounded_channel();
    let (replaced, _old_rx) = mpsc::unbounded_channel();

    assert!(!channel.is_feeding(me, &current));
    channel.subscribe(identity(me), current.clone()).await;
    assert!(channel.is_feeding(me, &current));
    assert!(!channel.is_feeding(me, &replaced));
    assert!(!channel.is_feeding(UserId::new_v4(), &current));

    channel.teardown().await;
    assert!(!channel.is_feeding(me, &current));
}

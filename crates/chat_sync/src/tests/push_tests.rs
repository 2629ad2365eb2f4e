use super::*;
use axum::{extract::State, routing::post, Json, Router};
use chrono::Utc;
use shared::domain::{MessageId, UserId};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::Mutex};

fn chat_message(content: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId::new_v4(),
        sender_id: UserId::new_v4(),
        recipient_id: UserId::new_v4(),
        content: content.to_string(),
        created_at: Utc::now(),
        read: false,
    }
}

#[derive(Clone)]
struct RelayState {
    received: Arc<Mutex<Vec<Value>>>,
    ack: Value,
}

async fn accept(State(state): State<RelayState>, Json(body): Json<Value>) -> Json<Value> {
    state.received.lock().await.push(body);
    Json(state.ack.clone())
}

async fn spawn_relay(ack: Value) -> Result<(String, RelayState)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = RelayState {
        received: Arc::new(Mutex::new(Vec::new())),
        ack,
    };
    let app = Router::new()
        .route("/--/api/v2/push/send", post(accept))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/--/api/v2/push/send"), state))
}

#[test]
fn notification_carries_sender_and_message_ids() {
    let message = chat_message("Great session today");
    let notification = chat_notification("ExponentPushToken[abc]", "Coach Kim", &message);
    assert_eq!(notification.to, "ExponentPushToken[abc]");
    assert_eq!(notification.title, "Coach Kim");
    assert_eq!(notification.body, "Great session today");
    assert_eq!(notification.data["type"], "chat_message");
    assert_eq!(notification.data["message_id"], message.id.to_string());
    assert_eq!(notification.data["sender_id"], message.sender_id.to_string());
}

#[test]
fn long_bodies_are_truncated_on_char_boundaries() {
    let content = "é".repeat(200);
    let notification = chat_notification("token", "Coach", &chat_message(&content));
    assert_eq!(notification.body.chars().count(), 121);
    assert!(notification.body.ends_with('…'));

    let exact = "x".repeat(120);
    let notification = chat_notification("token", "Coach", &chat_message(&exact));
    assert_eq!(notification.body, exact);
}

#[tokio::test]
async fn relay_posts_notification_json() {
    let (url, state) = spawn_relay(json!({ "data": { "status": "ok", "id": "ticket-1" } }))
        .await
        .expect("spawn relay");
    let relay = HttpPushRelay::new(url);
    let notification = chat_notification("token-1", "Coach", &chat_message("hi"));

    relay.send(&notification).await.expect("delivered");

    let received = state.received.lock().await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["to"], "token-1");
    assert_eq!(received[0]["title"], "Coach");
    assert_eq!(received[0]["body"], "hi");
}

#[tokio::test]
async fn error_ticket_fails_the_send() {
    let (url, _state) = spawn_relay(json!({
        "data": {
            "status": "error",
            "message": "\"token-1\" is not a registered push notification recipient",
        }
    }))
    .await
    .expect("spawn relay");
    let relay = HttpPushRelay::new(url);

    let err = relay
        .send(&chat_notification("token-1", "Coach", &chat_message("hi")))
        .await
        .expect_err("refused");
    assert!(err.to_string().contains("not a registered push notification recipient"));
}

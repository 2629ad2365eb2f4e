use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use chat_sync::{
    config::load_settings, AppState, ChatSyncClient, ClientEvent, Conversation, LifecycleEvent,
};
use clap::{Parser, Subcommand};
use shared::domain::UserId;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to ./coach.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every conversation and the unread count.
    Conversations,
    /// Keep the list live. Reads `fg`, `bg`, `focus <screen>` and `quit` from stdin.
    Watch,
    Send {
        #[arg(long)]
        to: UserId,
        text: String,
    },
    Read {
        #[arg(long)]
        from: UserId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .init();
    let args = Args::parse();

    let settings = load_settings(args.config.as_deref())?;
    let client = ChatSyncClient::from_settings(&settings);
    let user_id = client.sign_in(&args.email, &args.password).await?;
    println!("signed in as {user_id}");

    let result = match args.command {
        Command::Conversations => {
            print_conversations(&client.conversations(), client.unread_count());
            Ok(())
        }
        Command::Watch => watch(&client).await,
        Command::Send { to, text } => {
            let sent = client.send_message(to, &text).await?;
            println!("sent message_id={} at {}", sent.id, sent.created_at);
            Ok(())
        }
        Command::Read { from } => {
            client.mark_conversation_read(from).await?;
            println!("marked conversation with {from} read; unread={}", client.unread_count());
            Ok(())
        }
    };

    client.shutdown().await;
    result
}

/// `RUST_LOG` when set, `info` otherwise.
fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn print_conversations(conversations: &[Conversation], unread: usize) {
    if conversations.is_empty() {
        println!("no conversations yet");
    }
    for conversation in conversations {
        let marker = if conversation.unread { "*" } else { " " };
        println!(
            "{marker} {} [{}] {}: {}",
            conversation.last_message_at.format("%Y-%m-%d %H:%M"),
            conversation.counterpart_id,
            conversation.display_name,
            conversation.last_message
        );
    }
    println!("unread conversations: {unread}");
}

fn parse_lifecycle(line: &str) -> Result<Option<LifecycleEvent>> {
    let mut words = line.split_whitespace();
    let event = match (words.next(), words.next()) {
        (Some("fg"), None) => LifecycleEvent::AppStateChanged(AppState::Active),
        (Some("bg"), None) => LifecycleEvent::AppStateChanged(AppState::Background),
        (Some("inactive"), None) => LifecycleEvent::AppStateChanged(AppState::Inactive),
        (Some("focus"), Some(screen)) => LifecycleEvent::ScreenFocused {
            screen: screen.to_string(),
        },
        (None, _) => return Ok(None),
        _ => bail!("unknown command: {line}"),
    };
    Ok(Some(event))
}

async fn watch(client: &Arc<ChatSyncClient>) -> Result<()> {
    let mut events = client.subscribe_events();
    let mut conversations = client.subscribe_conversations();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    print_conversations(&client.conversations(), client.unread_count());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = conversations.changed() => {
                if changed.is_err() {
                    break;
                }
                let list = conversations.borrow_and_update().clone();
                print_conversations(&list, client.unread_count());
            }
            event = events.recv() => match event {
                Ok(ClientEvent::LiveStateChanged(state)) => println!("live: {state:?}"),
                Ok(ClientEvent::Resynced { conversations }) => {
                    println!("resynced {conversations} conversations")
                }
                Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "cli: dropped client events"),
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                if line.trim() == "quit" {
                    break;
                }
                match parse_lifecycle(&line) {
                    Ok(Some(event)) => {
                        if let Err(err) = client.handle_lifecycle(event).await {
                            eprintln!("resync failed: {err:#}");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => eprintln!("{err}"),
                }
            }
        }
    }
    Ok(())
}

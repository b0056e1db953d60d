/// chatsync demo - drives the sync engine against the in-memory transports
use chatsync_core::model::ConversationKind;
use chatsync_core::{InMemoryBackend, InMemoryChannel, Message, Origin, SyncConfig, SyncEngine, SyncEvent, SyncHandle};
use colored::*;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::info;
use tracing_subscriber::EnvFilter;

const BOT_ID: &str = "bob";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let config = SyncConfig::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let me = config.self_user_id.clone();

    let backend = InMemoryBackend::new(me.clone());
    let channel = InMemoryChannel::new(backend.clone());
    seed(&backend, &me);

    let (handle, engine_task) = SyncEngine::spawn(config, Arc::new(backend.clone()), Arc::new(channel.clone()))
        .map_err(|e| anyhow::anyhow!("Engine error: {}", e))?;
    info!("Starting chatsync demo as {}", me);

    tokio::spawn(print_events(handle.clone()));
    tokio::spawn(echo_bot(handle.clone(), channel.clone()));

    handle.connect().await?;
    let listed = handle.refresh_conversations().await?;
    handle.set_visible_conversations(vec!["general".into(), "bob".into()]).await?;
    handle.open_conversation("general").await?;
    println!("{} {} conversations, opened {}", "✓".green().bold(), listed, "general".cyan());
    print_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ' ');
        let command = parts.next().unwrap_or_default();
        let arg = parts.next().unwrap_or_default().trim();

        let snapshot = handle.snapshot();
        let open = snapshot.open_conversation.clone().unwrap_or_default();
        let result = match command {
            "/quit" => break,
            "/help" => {
                print_help();
                Ok(())
            }
            "/open" => handle.open_conversation(arg).await,
            "/older" => handle.load_older(&open).await.map(|started| {
                if !started {
                    println!("{} no older messages", "·".dimmed());
                }
            }),
            "/drop" => {
                channel.drop_connection();
                Ok(())
            }
            "/offline" => {
                channel.set_reachable(false);
                channel.drop_connection();
                Ok(())
            }
            "/online" => {
                channel.set_reachable(true);
                Ok(())
            }
            "/reconnect" => handle.reconnect().await,
            "/resend" => handle.resend(&open, arg).await.map(|_| ()),
            "/list" => {
                for conv in &snapshot.conversations {
                    let unread = match conv.unread_count {
                        0 => String::new(),
                        n => format!(" ({} unread)", n).yellow().to_string(),
                    };
                    println!("  {} {}{}", conv.id.cyan(), conv.display_name, unread);
                }
                Ok(())
            }
            "/show" => {
                for message in snapshot.messages(&open) {
                    print_message(message);
                }
                Ok(())
            }
            _ => handle.send(&open, line).await.map(|_| ()),
        };
        if let Err(e) = result {
            println!("{} {}", "✗".red().bold(), e);
        }
    }

    handle.shutdown().await?;
    engine_task.await?;
    Ok(())
}

fn seed(backend: &InMemoryBackend, me: &str) {
    backend.add_conversation(
        "general",
        ConversationKind::Group,
        &[(me, "You"), (BOT_ID, "Bob"), ("ann", "Ann")],
    );
    backend.add_conversation("bob", ConversationKind::Direct, &[(me, "You"), (BOT_ID, "Bob")]);
    for i in 1..=45 {
        let sender = if i % 3 == 0 { "ann" } else { BOT_ID };
        backend.store_message("general", sender, &format!("history message #{}", i));
    }
    backend.store_message("bob", BOT_ID, "hey, are you around?");
}

/// Replies to every message we send in a conversation Bob is part of
async fn echo_bot(handle: SyncHandle, channel: InMemoryChannel) {
    let mut events = handle.events();
    while let Some(event) = next_event(&mut events).await {
        let SyncEvent::MessageConfirmed { conversation_id, message_id, .. } = event else {
            continue;
        };
        let body = handle
            .snapshot()
            .messages(&conversation_id)
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| m.body.clone())
            .unwrap_or_default();

        channel.push_typing(&conversation_id, BOT_ID, true);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        channel.push_typing(&conversation_id, BOT_ID, false);
        channel.inject_message(&conversation_id, BOT_ID, &format!("you said: {}", body));
    }
}

async fn print_events(handle: SyncHandle) {
    let mut events = handle.events();
    while let Some(event) = next_event(&mut events).await {
        match event {
            SyncEvent::Connected => println!("{} connected", "●".green().bold()),
            SyncEvent::Disconnected => println!("{} disconnected (type /reconnect)", "●".red().bold()),
            SyncEvent::ReconnectFailed { attempts } => {
                println!("{} gave up after {} attempts", "✗".red().bold(), attempts)
            }
            SyncEvent::MessageReceived { message } => print_message(&message),
            SyncEvent::MessageConfirmed { message_id, .. } => {
                println!("  {} delivered {}", "✓".green(), message_id.dimmed())
            }
            SyncEvent::MessageUnconfirmed { temp_id, .. } => {
                println!("  {} no confirmation yet for {}", "?".yellow(), temp_id.dimmed())
            }
            SyncEvent::MessageFailed { temp_id, reason, .. } => {
                println!("  {} {} failed: {} (/resend {})", "✗".red(), temp_id, reason, temp_id)
            }
            SyncEvent::HistoryLoaded { conversation_id } => {
                for message in handle.snapshot().messages(&conversation_id) {
                    print_message(message);
                }
            }
            SyncEvent::HistoryPrepended { conversation_id, count } => {
                println!("{} {} older messages in {}", "↑".cyan(), count, conversation_id)
            }
            SyncEvent::TypingChanged { users, .. } if !users.is_empty() => {
                println!("  {} {} typing…", "…".dimmed(), users.join(", ").italic())
            }
            SyncEvent::UnreadChanged { conversation_id, count } if count > 0 => {
                println!("  {} {} unread in {}", "•".yellow(), count, conversation_id)
            }
            SyncEvent::Error { message, .. } => println!("{} {}", "✗".red().bold(), message),
            _ => {}
        }
    }
}

async fn next_event(events: &mut broadcast::Receiver<SyncEvent>) -> Option<SyncEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(n)) => {
                tracing::warn!("event listener lagged by {} events", n);
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

fn print_message(message: &Message) {
    let who = message
        .sender_name
        .clone()
        .unwrap_or_else(|| message.sender_id.clone());
    let marker = match &message.origin {
        Origin::Pending => "…".dimmed().to_string(),
        Origin::Unconfirmed => "?".yellow().to_string(),
        Origin::Confirmed => " ".to_string(),
        Origin::Failed { .. } => "✗".red().to_string(),
    };
    let who = if message.mine { who.green() } else { who.cyan() };
    println!(
        "{} [{}] {}: {}",
        marker,
        message.created_at.format("%H:%M:%S").to_string().dimmed(),
        who.bold(),
        message.body
    );
}

fn print_help() {
    println!("{}", "Commands:".bold());
    println!("  {}           Open a conversation", "/open <id>".cyan());
    println!("  {}               Load an older page", "/older".cyan());
    println!("  {}                 List conversations", "/list".cyan());
    println!("  {}                 Print the open timeline", "/show".cyan());
    println!("  {}  Drop / block / unblock the push connection", "/drop /offline /online".cyan());
    println!("  {}           Reconnect with backoff", "/reconnect".cyan());
    println!("  {}      Resend a failed message", "/resend <tmp-id>".cyan());
    println!("  {}                 Exit", "/quit".cyan());
    println!("  anything else is sent to the open conversation");
}

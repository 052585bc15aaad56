use anyhow::{Context, Result};
use livebot_panel::integration::{PanelConfig, SessionBuilder, SessionSnapshot};
use livebot_panel::messages::{MessageId, Role};
use livebot_panel::render::{ChannelRenderer, RenderCommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livebot_panel=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PanelConfig::load(&path).with_context(|| format!("loading {}", path))?,
        None => PanelConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;

    info!("Starting livebot panel against {}", config.server.base_url);

    // Stand-in for the avatar: log what it would render
    let (renderer, render_rx) = ChannelRenderer::new();
    std::thread::Builder::new()
        .name("render".to_string())
        .spawn(move || {
            for command in render_rx.iter() {
                match command {
                    RenderCommand::MouthAmplitude(a) => debug!("mouth {:.2}", a),
                    RenderCommand::Expression(cue) => {
                        info!("expression {} ({})", cue.expression, cue.motion_group)
                    }
                }
            }
        })?;

    let (session, handle) = SessionBuilder::new()
        .with_config(config)
        .with_renderer(Arc::new(renderer))
        .build()?;
    let task = session.start();

    let mut snapshots = handle.subscribe();
    tokio::spawn(async move {
        let mut printed: MessageId = 0;
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            printed = print_settled(&snapshot, printed);
        }
    });

    println!("Type a message and press enter. Commands: /stop /clear /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let sent = match line.trim() {
            "" => continue,
            "/quit" => break,
            "/stop" => handle.stop(),
            "/clear" => handle.clear_history(),
            text => handle.send_text(text),
        };
        if let Err(e) = sent {
            eprintln!("{}", e.user_message());
            if !e.is_recoverable() {
                break;
            }
        }
    }

    if let Err(e) = handle.shutdown() {
        debug!("Session already stopped: {}", e);
    }
    task.await?;
    Ok(())
}

/// Print messages settled since `after`, returning the highest id printed
fn print_settled(snapshot: &SessionSnapshot, after: MessageId) -> MessageId {
    let mut last = after;
    for message in snapshot.messages.iter().filter(|m| m.id > after) {
        // Stop at the first message still in flight to keep the order
        if !message.is_settled() {
            break;
        }
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "bot",
            Role::SystemError => "error",
        };
        match &message.emotion_tag {
            Some(emotion) => println!("[{}|{}] {}", who, emotion, message.content),
            None => println!("[{}] {}", who, message.content),
        }
        last = message.id;
    }
    last
}

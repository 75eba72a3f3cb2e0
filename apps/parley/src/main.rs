use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use parley::auth::AuthClient;
use parley::config::Config;
use parley::link::signaling::SignalingClient;
use parley::link::{LinkEvent, PeerLink};
use parley::protocol::mux::{ChatEvent, Identity, MuxError, Multiplexer};
use parley::protocol::PresenceStatus;

#[derive(Parser)]
#[command(name = "parley", about = "End-to-end encrypted two-party chat over WebRTC")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account on the relay
    Signup { handle: String, secret: String },
    /// Log in and chat
    Chat {
        handle: String,
        secret: String,
        /// Initiate the connection (exactly one of the two peers passes this)
        #[arg(long)]
        caller: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "parley=info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Signup { handle, secret } => {
            let auth = AuthClient::new(&config.relay_url);
            auth.signup(&handle, &secret).await?;
            println!("Account '{handle}' created.");
            Ok(())
        }
        Commands::Chat {
            handle,
            secret,
            caller,
        } => chat(config, handle, secret, caller).await,
    }
}

async fn chat(config: Config, handle: String, secret: String, caller: bool) -> Result<()> {
    let auth = AuthClient::new(&config.relay_url);
    let session = auth.login(&handle, &secret).await?;
    info!(handle, "logged in");

    let signaling = SignalingClient::connect(&config.signaling_url())
        .await
        .context("connecting to relay signaling")?;
    let (signal_tx, signal_rx) = signaling.split();

    let (link, mut link_events) = PeerLink::connect(
        signal_tx,
        signal_rx,
        vec![config.stun_server.clone()],
        caller,
    )
    .await
    .context("setting up peer connection")?;
    let link = Arc::new(link);

    let (chat_tx, mut chat_events) = mpsc::unbounded_channel();
    let mut mux = Multiplexer::new(Identity::new(handle.clone()), link.clone(), chat_tx);

    if caller {
        println!("Calling... waiting for the other side to answer.");
    } else {
        println!("Waiting for a call...");
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = link_events.recv() => {
                match event {
                    Some(LinkEvent::ChannelOpen) => {
                        println!("Connected. Messages are end-to-end encrypted.");
                        if let Err(err) = mux.on_channel_open().await {
                            warn!(error = %err, "failed to start key exchange");
                        }
                    }
                    Some(LinkEvent::Inbound(frame)) => mux.handle_raw(&frame).await,
                    Some(LinkEvent::ChannelClosed) => {
                        println!("Peer disconnected.");
                        break;
                    }
                    Some(LinkEvent::Failed(reason)) => {
                        eprintln!("Connection failed: {reason}");
                        break;
                    }
                    None => break,
                }
            }
            event = chat_events.recv() => {
                if let Some(event) = event {
                    print_chat_event(event).await;
                }
            }
            line = stdin.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_input(line.trim(), &mux).await? {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = mux.send_status(PresenceStatus::Offline).await;
    link.close().await;
    if let Err(err) = auth.logout(&session).await {
        warn!(error = %err, "logout failed; session will expire on its own");
    }
    Ok(())
}

/// Returns false when the user asked to quit.
async fn handle_input(line: &str, mux: &Multiplexer) -> Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }
    if line == "/quit" {
        return Ok(false);
    }
    if let Some(path) = line.strip_prefix("/send ") {
        send_file(mux, path.trim()).await;
        return Ok(true);
    }
    if let Some(timestamp) = line.strip_prefix("/delete ") {
        if let Err(err) = mux.send_delete(timestamp.trim()).await {
            eprintln!("Could not send delete: {err}");
        }
        return Ok(true);
    }

    match mux.send_message(line).await {
        Ok(()) => {}
        Err(MuxError::HandshakeIncomplete) => {
            eprintln!("Still exchanging keys; try again in a moment.");
        }
        Err(err) => eprintln!("Could not send: {err}"),
    }
    Ok(true)
}

async fn send_file(mux: &Multiplexer, path: &str) {
    let payload = match tokio::fs::read(path).await {
        Ok(payload) => payload,
        Err(err) => {
            eprintln!("Could not read {path}: {err}");
            return;
        }
    };
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    let mime = guess_mime(&name);
    println!("Sending {name} ({} bytes)...", payload.len());
    if let Err(err) = mux.send_file(&name, mime, &payload).await {
        eprintln!("Transfer failed: {err}");
    }
}

async fn print_chat_event(event: ChatEvent) {
    match event {
        ChatEvent::PeerJoined { handle } => println!("* {handle} joined"),
        ChatEvent::PeerStatus { handle, status } => {
            println!("* {handle} is {status:?}");
        }
        ChatEvent::Message {
            sender,
            body,
            timestamp,
        } => println!("[{timestamp}] {sender}: {body}"),
        ChatEvent::FileReceived {
            name,
            mime,
            payload,
        } => {
            let target = format!("received-{name}");
            match tokio::fs::write(&target, &payload).await {
                Ok(()) => println!("* received {name} ({mime}, {} bytes) -> {target}", payload.len()),
                Err(err) => eprintln!("Could not save {name}: {err}"),
            }
        }
        ChatEvent::MessageDeleted { timestamp } => {
            println!("* peer deleted their message from {timestamp}");
        }
        ChatEvent::TransferProgress {
            received, total, ..
        } => {
            if received == total || received % 32 == 0 {
                println!("* transfer {received}/{total} chunks");
            }
        }
        ChatEvent::TransferFailed {
            transfer_id,
            reason,
        } => eprintln!("* transfer {transfer_id} failed: {reason}"),
    }
}

fn guess_mime(name: &str) -> &'static str {
    match Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("txt") | Some("md") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("pdf") => "application/pdf",
        Some("webm") => "video/webm",
        Some("ogg") => "audio/ogg",
        Some("wav") => "audio/wav",
        _ => "application/octet-stream",
    }
}

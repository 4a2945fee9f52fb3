//! Interactive StudyConnect Client
//!
//! Terminal client for course chat, voice channels and Ask AI

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use studyconnect_rtc::api::ApiClient;
use studyconnect_rtc::ask_ai::{AskAi, AskOutcome, AudioSink, Delivery};
use studyconnect_rtc::audio::{CpalCapture, RodioPlayer};
use studyconnect_rtc::channel::{ChannelSettings, Connector, WsConnector};
use studyconnect_rtc::chat::{ChatEvent, ChatScope, ChatSession};
use studyconnect_rtc::rtc::WebRtcConnector;
use studyconnect_rtc::voice::{VoiceDeps, VoiceError, VoiceEvent, VoiceSession, VoiceState};
use studyconnect_rtc::ClientConfig;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "studyconnect-rtc")]
#[command(about = "StudyConnect chat and voice client")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Backend base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Access token
    #[arg(short, long)]
    token: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = if config_found {
        ClientConfig::from_file(&args.config.to_string_lossy())?
    } else {
        ClientConfig::default()
    };
    if let Some(api_url) = args.api_url {
        config.api_base_url = api_url;
    }
    if args.token.is_some() {
        config.token = args.token;
    }
    let log_level = args.log_level.unwrap_or_else(|| config.log_level.clone());

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();
    if !config_found {
        info!("Config file not found, using defaults");
    }
    if config.token.is_none() {
        warn!("No access token configured; the backend will reject most requests");
    }

    let api = ApiClient::from_config(&config)?;
    let settings = ChannelSettings::new(config.ws_base()?, config.token.clone().unwrap_or_default());
    let connector: Arc<dyn Connector> = Arc::new(WsConnector);

    let (chat, chat_events) =
        ChatSession::new(Arc::clone(&connector), settings.clone(), config.max_message_length);
    let (voice, voice_events) = VoiceSession::new(
        VoiceDeps {
            connector,
            capture: Arc::new(CpalCapture::new(config.audio.clone())),
            peers: Arc::new(WebRtcConnector::new(
                &config.voice.ice_servers,
                config.audio.clone(),
            )?),
        },
        settings,
    );

    println!("🎓 StudyConnect Client");
    println!("======================");
    println!("Backend: {}", config.api_base_url);
    println!();
    print_help();

    tokio::spawn(print_chat_events(chat_events));
    tokio::spawn(print_voice_events(voice_events));

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
    let input_task = tokio::spawn(handle_user_input(cmd_tx));

    let player: Arc<dyn AudioSink> = Arc::new(RodioPlayer::new());
    // Set once a voice join with a course succeeds
    let ask_ai: Arc<Mutex<Option<Arc<AskAi>>>> = Arc::new(Mutex::new(None));

    while let Some(command) = cmd_rx.recv().await {
        let parts: Vec<&str> = command.split_whitespace().collect();
        if parts.is_empty() {
            prompt();
            continue;
        }

        match parts[0].to_lowercase().as_str() {
            "help" => print_help(),
            "chat" => {
                let scope = match parts.get(1).copied() {
                    Some("course") => ChatScope::Course,
                    Some("group") => ChatScope::Group,
                    _ => {
                        println!("Usage: chat <course|group> <id>");
                        prompt();
                        continue;
                    }
                };
                let Some(id) = parts.get(2) else {
                    println!("Usage: chat <course|group> <id>");
                    prompt();
                    continue;
                };
                let resource = match api.fetch_resource(scope, id).await {
                    Ok(resource) => resource,
                    Err(e) => {
                        println!("❌ Cannot open {} {}: {}", scope, id, e);
                        prompt();
                        continue;
                    }
                };
                let history = match api.fetch_messages(scope, id, config.history_limit).await {
                    Ok(history) => history,
                    Err(e) => {
                        warn!("Chat history unavailable: {}", e);
                        Vec::new()
                    }
                };
                for message in &history {
                    println!("  {}: {}", message.user_email, message.content);
                }
                if let Err(e) = chat.join(resource, history).await {
                    println!("❌ Chat unavailable: {}", e);
                }
            }
            "say" => {
                let text = command.trim_start()[parts[0].len()..].trim();
                if !chat.send_message(text) {
                    println!("Not sent: join a chat first and type a message");
                }
            }
            "voice" => {
                let Some(channel_id) = parts.get(1).map(|s| s.to_string()) else {
                    println!("Usage: voice <channel_id> [course_id]");
                    prompt();
                    continue;
                };
                let assistant = parts.get(2).map(|course_id| {
                    Arc::new(AskAi::new(
                        Arc::new(api.clone()),
                        Arc::clone(&player),
                        voice.clone(),
                        *course_id,
                    ))
                });
                let voice = voice.clone();
                let ask_ai = Arc::clone(&ask_ai);
                tokio::spawn(async move {
                    match voice.join(&channel_id).await {
                        Ok(()) => *ask_ai.lock() = assistant,
                        Err(VoiceError::Cancelled) => info!("Voice join cancelled"),
                        Err(e) => println!("❌ Cannot join voice channel: {}", e),
                    }
                    prompt();
                });
            }
            "mute" => {
                voice.set_muted(true);
                println!("🔇 Microphone muted");
            }
            "unmute" => {
                voice.set_muted(false);
                println!("🎤 Microphone live");
            }
            "ask" => {
                let question = command.trim_start()[parts[0].len()..].trim().to_string();
                let Some(assistant) = ask_ai.lock().clone() else {
                    println!("Ask AI needs a course: voice <channel_id> <course_id>");
                    prompt();
                    continue;
                };
                tokio::spawn(async move {
                    println!("🤖 Asking...");
                    match assistant.ask_text(&question).await {
                        Ok(outcome) => print_answer(&outcome),
                        Err(e) => println!("❌ Ask AI: {}", e),
                    }
                    prompt();
                });
            }
            "peers" => {
                println!(
                    "👥 {} participant(s), {} connected peer(s), {} waiting",
                    voice.participant_count(),
                    voice.peer_link_count(),
                    voice.pending_count()
                );
                for user in voice.roster() {
                    let state = voice
                        .negotiation_state(&user)
                        .map(|s| format!("{:?}", s))
                        .unwrap_or_else(|| "waiting for offer".to_string());
                    println!("  {} ({})", user, state);
                }
            }
            "leave" => match parts.get(1).copied() {
                Some("chat") => chat.leave(),
                Some("voice") => {
                    voice.leave();
                    *ask_ai.lock() = None;
                }
                _ => {
                    chat.leave();
                    voice.leave();
                    *ask_ai.lock() = None;
                }
            },
            "quit" | "exit" => {
                println!("👋 Goodbye!");
                break;
            }
            _ => {
                println!(
                    "Unknown command: {}. Type 'help' for available commands.",
                    parts[0]
                );
            }
        }
        prompt();
    }

    chat.leave();
    voice.leave();
    input_task.abort();
    Ok(())
}

fn print_help() {
    println!("💬 Interactive Commands:");
    println!("  chat <course|group> <id>        - Open a chat with its history");
    println!("  say <text>                      - Send a chat message");
    println!("  voice <channel_id> [course_id]  - Join a voice channel");
    println!("  mute | unmute                   - Toggle the microphone");
    println!("  ask <question>                  - Ask the course AI (in voice)");
    println!("  peers                           - Show voice participants");
    println!("  leave [chat|voice]              - Leave chat, voice or both");
    println!("  quit                            - Exit client");
    println!();
}

fn print_answer(outcome: &AskOutcome) {
    println!("❓ {}", outcome.question);
    println!("🤖 {}", outcome.answer);
    match &outcome.delivery {
        Delivery::Played => println!("🔊 Answer played"),
        Delivery::Displayed => {}
        Delivery::PlaybackFailed(reason) => println!("⚠️ Could not play the answer: {}", reason),
    }
}

async fn print_chat_events(mut events: mpsc::UnboundedReceiver<ChatEvent>) {
    while let Some(event) = events.recv().await {
        println!();
        match event {
            ChatEvent::Connected(resource) => {
                println!("✅ Chatting in {}", resource.display_name())
            }
            ChatEvent::Message(message) => {
                let time = message
                    .parsed_timestamp()
                    .map(|t| t.format("%H:%M").to_string())
                    .unwrap_or_default();
                println!("[{}] {}: {}", time, message.user_email, message.content);
            }
            ChatEvent::Disconnected => println!("🔴 Chat connection lost"),
        }
        prompt();
    }
}

async fn print_voice_events(mut events: mpsc::UnboundedReceiver<VoiceEvent>) {
    while let Some(event) = events.recv().await {
        println!();
        match event {
            VoiceEvent::StateChanged(VoiceState::Joining) => println!("🔌 Joining voice..."),
            VoiceEvent::StateChanged(VoiceState::Joined) => println!("🎉 In voice channel"),
            VoiceEvent::StateChanged(VoiceState::Idle) => println!("👋 Left voice channel"),
            VoiceEvent::ParticipantJoined(user) => println!("🟢 {} joined voice", user),
            VoiceEvent::ParticipantLeft(user) => println!("🔴 {} left voice", user),
            VoiceEvent::PeerConnectionState { user_id, state } => {
                info!("Peer {} is {:?}", user_id, state)
            }
            VoiceEvent::Disconnected => error!("Voice signaling connection lost"),
        }
        prompt();
    }
}

async fn handle_user_input(cmd_tx: mpsc::UnboundedSender<String>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let reader = BufReader::new(stdin);
    let mut lines = reader.lines();

    prompt();
    while let Some(line) = lines.next_line().await? {
        if cmd_tx.send(line).is_err() {
            break;
        }
    }
    Ok(())
}

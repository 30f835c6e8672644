//! `conclave chat` — run a configured panel interactively.

use conclave_agent::StreamEvent;
use conclave_config::AppConfig;
use conclave_core::persistence::{JsonlSink, NoopSink, PersistenceSink};
use conclave_core::session::SpeakingMode;
use conclave_session::{SessionOptions, SessionRegistry};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

/// One line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    Say(String),
    Interrupt,
    Invite(String),
    Mode(SpeakingMode),
    FlowLock(bool),
    History,
    Who,
    Help,
    Quit,
    Invalid(String),
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<ChatCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(ChatCommand::Say(line.to_string()));
    };

    let (cmd, arg) = match rest.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (rest, ""),
    };

    let parsed = match (cmd.to_lowercase().as_str(), arg) {
        ("interrupt" | "stop", _) => ChatCommand::Interrupt,
        ("invite", id) if !id.is_empty() => ChatCommand::Invite(id.trim_start_matches('@').to_string()),
        ("invite", _) => ChatCommand::Invalid("usage: /invite <participant id>".into()),
        ("mode", mode) => match mode.parse::<SpeakingMode>() {
            Ok(mode) => ChatCommand::Mode(mode),
            Err(_) => ChatCommand::Invalid(format!(
                "usage: /mode <{}>",
                SpeakingMode::ALL.map(|m| m.as_str()).join("|")
            )),
        },
        ("flowlock", "on") => ChatCommand::FlowLock(true),
        ("flowlock", "off") => ChatCommand::FlowLock(false),
        ("flowlock", _) => ChatCommand::Invalid("usage: /flowlock on|off".into()),
        ("history", _) => ChatCommand::History,
        ("who", _) => ChatCommand::Who,
        ("help" | "?", _) => ChatCommand::Help,
        ("quit" | "exit", _) => ChatCommand::Quit,
        (other, _) => ChatCommand::Invalid(format!("unknown command: /{other}")),
    };
    Some(parsed)
}

pub async fn run(
    session_name: Option<String>,
    transcript: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    OPENROUTER_API_KEY = 'sk-or-v1-...'   (recommended)");
        eprintln!("    OPENAI_API_KEY     = 'sk-...'");
        eprintln!("    CONCLAVE_API_KEY   = 'sk-...'");
        eprintln!();
        eprintln!("  Or add it to {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let session_config = match &session_name {
        Some(name) => config
            .session(name)
            .cloned()
            .ok_or_else(|| format!("No session named '{name}' in the config"))?,
        None => config
            .sessions
            .first()
            .cloned()
            .or_else(|| AppConfig::starter().sessions.into_iter().next())
            .ok_or("No sessions configured")?,
    };

    let persistence: Arc<dyn PersistenceSink> = match &transcript {
        Some(path) => Arc::new(JsonlSink::new(path)),
        None => Arc::new(NoopSink),
    };

    let registry = SessionRegistry::from_config(&config, persistence);
    let id = registry.create_session(SessionOptions::from_config(&config, &session_config))?;
    let (_subscription, mut stream) = registry.subscribe_channel(&id)?;
    info!(session_id = %id, name = %session_config.name, "Chat session started");

    let participants = registry.participants(&id)?;
    let names: HashMap<String, String> = participants
        .iter()
        .map(|p| (p.id.clone(), p.display_name.clone()))
        .collect();

    println!();
    println!("  Conclave — {}", session_config.name);
    println!();
    println!("  Mode:       {}", session_config.speaking_mode);
    println!(
        "  Flow-lock:  {}",
        if session_config.flow_lock.enabled { "on" } else { "off" }
    );
    for p in &participants {
        println!("  @{:<10} {}", p.id, p.display_name);
    }
    if let Some(path) = &transcript {
        println!("  Transcript: {}", path.display());
    }
    println!();
    println!("  Type a message, or /help for commands.");
    println!();
    prompt()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let Some(command) = parse_line(&line) else {
                    prompt()?;
                    continue;
                };
                if command == ChatCommand::Quit {
                    break;
                }
                debug!(?command, "Chat command");
                handle(&registry, &id, &names, command);
                prompt()?;
            }
            Some(event) = stream.recv() => {
                print_event(&names, &event);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing session");
                break;
            }
        }
    }

    registry.destroy_session(&id).await?;
    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

fn handle(
    registry: &SessionRegistry,
    id: &conclave_core::session::SessionId,
    names: &HashMap<String, String>,
    command: ChatCommand,
) {
    let outcome = match command {
        ChatCommand::Say(text) => registry.post_user_message(id, &text).map(|dispatch| {
            if dispatch.is_empty() {
                println!("  (nobody was selected to answer; try /invite <id>)");
            }
        }),
        ChatCommand::Interrupt => registry.interrupt(id).map(|n| {
            println!("  Interrupted {n} run(s).");
        }),
        ChatCommand::Invite(participant_id) => registry.invite(id, &participant_id).map(|_| ()),
        ChatCommand::Mode(mode) => registry.set_speaking_mode(id, mode).map(|()| {
            println!("  Speaking mode: {mode}");
        }),
        ChatCommand::FlowLock(enabled) => registry.set_flow_lock(id, enabled).map(|()| {
            println!("  Flow-lock {}", if enabled { "on" } else { "off" });
        }),
        ChatCommand::History => registry.history(id).map(|turns| {
            for turn in turns {
                let author = names
                    .get(&turn.author_id)
                    .map(String::as_str)
                    .unwrap_or("You");
                let marker = if turn.truncated { " (interrupted)" } else { "" };
                println!("  [{}] {author}{marker}: {}", turn.timestamp.format("%H:%M:%S"), turn.content);
            }
        }),
        ChatCommand::Who => registry.participants(id).map(|participants| {
            for p in participants {
                println!("  @{:<10} {:<16} {}", p.id, p.display_name, p.status);
            }
        }),
        ChatCommand::Help => {
            print_help();
            Ok(())
        }
        ChatCommand::Invalid(message) => {
            println!("  {message}");
            Ok(())
        }
        ChatCommand::Quit => Ok(()),
    };

    if let Err(e) = outcome {
        eprintln!("  [Error] {e}");
    }
}

fn print_event(names: &HashMap<String, String>, event: &StreamEvent) {
    let name = names
        .get(event.participant_id())
        .map(String::as_str)
        .unwrap_or(event.participant_id());
    match event {
        StreamEvent::Thinking { .. } => {
            println!("\r  · {name} is thinking...");
        }
        StreamEvent::Render { .. } => {}
        StreamEvent::Complete {
            text, truncated, ..
        } => {
            println!();
            for line in text.lines() {
                println!("  {name} > {line}");
            }
            if *truncated {
                println!("  ({name} was interrupted)");
            }
            println!();
        }
    }
}

fn print_help() {
    println!("  /interrupt          stop everyone who is speaking");
    println!("  /invite <id>        ask one participant to speak");
    println!("  /mode <mode>        change the speaking mode");
    println!("  /flowlock on|off    toggle autonomous speaking on silence");
    println!("  /history            show the conversation so far");
    println!("  /who                show participants and their status");
    println!("  /quit               leave");
}

fn prompt() -> std::io::Result<()> {
    print!("  You > ");
    std::io::stdout().flush()
}

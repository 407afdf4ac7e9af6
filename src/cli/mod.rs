//! CLI commands for mindfleet using clap.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{get_home_dir, load_settings_or_default, HOME_ENV};
use crate::core::{Content, DeliveryPayload, Inbox};
use crate::logging::LogMode;

/// mindfleet - supervisor daemon for a fleet of long-running AI minds.
#[derive(Parser)]
#[command(name = "mindfleet")]
#[command(version = "0.1.0")]
#[command(about = "Supervise, sleep, wake and message a fleet of minds", long_about = None)]
pub struct Commands {
    /// Home directory (settings, state, inbox)
    #[arg(long, global = true, env = HOME_ENV)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Daemon,

    /// Start a mind (wakes it if asleep)
    Start {
        /// Mind name, `name` or `name@variant`
        mind: String,
    },

    /// Stop a mind and cancel any pending restart
    Stop { mind: String },

    /// Put a mind to sleep; messages are queued until it wakes
    Sleep { mind: String },

    /// Wake a sleeping mind and deliver its queue
    Wake { mind: String },

    /// Show every configured mind instance
    Status,

    /// Send a message to a mind
    Send {
        mind: String,

        /// Message text
        message: String,

        #[arg(long, default_value = "cli")]
        channel: String,

        #[arg(long)]
        sender: Option<String>,

        #[arg(long)]
        conversation: Option<String>,
    },

    /// Follow the live event stream
    Events {
        /// Conversation ids to follow in addition to fleet activity
        #[arg(long = "conversation")]
        conversations: Vec<String>,
    },
}

impl Commands {
    /// `--home`, `$MINDFLEET_HOME` or `~/.mindfleet`.
    pub fn home(&self) -> Result<PathBuf> {
        match &self.home {
            Some(home) => Ok(home.clone()),
            None => Ok(get_home_dir()?),
        }
    }

    pub fn log_mode(&self) -> LogMode {
        match self.command {
            Command::Daemon => LogMode::Daemon,
            _ => LogMode::Client,
        }
    }

    /// Run the command.
    pub async fn run(&self, home: &std::path::Path) -> Result<()> {
        match &self.command {
            Command::Daemon => cmd_daemon(home).await,
            Command::Start { mind } => cmd_action(home, mind, "start").await,
            Command::Stop { mind } => cmd_action(home, mind, "stop").await,
            Command::Sleep { mind } => cmd_action(home, mind, "sleep").await,
            Command::Wake { mind } => cmd_action(home, mind, "wake").await,
            Command::Status => cmd_status(home).await,
            Command::Send {
                mind,
                message,
                channel,
                sender,
                conversation,
            } => {
                let mut payload =
                    DeliveryPayload::new(channel, sender.as_deref(), Content::text(message.as_str()));
                payload.conversation_id = conversation.clone();
                cmd_send(home, mind, payload).await
            }
            Command::Events { conversations } => cmd_events(home, conversations).await,
        }
    }
}

fn daemon_url(home: &std::path::Path) -> String {
    load_settings_or_default(home).daemon.base_url()
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or(body);
    anyhow::bail!("daemon returned {}: {}", status, message)
}

// Command implementations

async fn cmd_daemon(home: &std::path::Path) -> Result<()> {
    crate::daemon::run_daemon(home).await?;
    Ok(())
}

async fn cmd_action(home: &std::path::Path, mind: &str, action: &str) -> Result<()> {
    let url = format!("{}/api/minds/{}/{}", daemon_url(home), mind, action);
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("Could not reach the daemon at {}", url))?;
    let body: serde_json::Value = error_for_status(response).await?.json().await?;

    match body.get("result").and_then(|r| r.get("result")).and_then(|r| r.as_str()) {
        Some("woke") => println!(
            "{}: woke, delivered {} queued message(s)",
            mind,
            body["result"]["delivered"].as_u64().unwrap_or(0)
        ),
        Some(result) => println!("{}: {}", mind, result.replace('_', " ")),
        None => println!(
            "{}: {}",
            mind,
            body.get("action").and_then(|a| a.as_str()).unwrap_or(action)
        ),
    }
    Ok(())
}

async fn cmd_status(home: &std::path::Path) -> Result<()> {
    let url = format!("{}/api/minds", daemon_url(home));
    let response = match reqwest::Client::new().get(&url).send().await {
        Ok(response) => response,
        Err(e) if e.is_connect() => {
            println!("Daemon: not running ({})", url);
            let inbox = Inbox::new(home);
            if !inbox.is_empty() {
                println!("Inbox: {} spooled message(s)", inbox.len());
            }
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    let minds: Vec<serde_json::Value> = error_for_status(response).await?.json().await?;

    println!("Daemon: running ({})", daemon_url(home));
    if minds.is_empty() {
        println!("No minds configured.");
        return Ok(());
    }
    println!();
    println!(
        "{:<24} {:>6} {:<12} {:>8} {:<9} {:>6} {:>8}",
        "MIND", "PORT", "PROCESS", "PID", "STATE", "QUEUED", "RESTARTS"
    );
    for mind in &minds {
        println!("{}", format_status_row(mind));
    }
    Ok(())
}

fn format_status_row(mind: &serde_json::Value) -> String {
    let state = if mind["sleeping"].as_bool().unwrap_or(false) {
        "sleeping"
    } else if mind["active"].as_bool().unwrap_or(false) {
        "active"
    } else {
        "idle"
    };
    let pid = mind["pid"]
        .as_u64()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());

    format!(
        "{:<24} {:>6} {:<12} {:>8} {:<9} {:>6} {:>8}",
        mind["name"].as_str().unwrap_or("?"),
        mind["port"].as_u64().unwrap_or(0),
        mind["process"]["state"].as_str().unwrap_or("unknown"),
        pid,
        state,
        mind["queued"].as_u64().unwrap_or(0),
        mind["restart_attempts"].as_u64().unwrap_or(0),
    )
}

async fn cmd_send(home: &std::path::Path, mind: &str, payload: DeliveryPayload) -> Result<()> {
    let url = format!("{}/api/minds/{}/deliver", daemon_url(home), mind);
    match reqwest::Client::new().post(&url).json(&payload).send().await {
        Ok(response) => {
            let body: serde_json::Value = error_for_status(response).await?.json().await?;
            println!(
                "{}: {}",
                mind,
                body.get("outcome").and_then(|o| o.as_str()).unwrap_or("unknown")
            );
        }
        Err(e) if e.is_connect() => {
            let id = Inbox::new(home).enqueue(mind, payload)?;
            println!("Daemon not reachable; spooled message {} for {}", id, mind);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn cmd_events(home: &std::path::Path, conversations: &[String]) -> Result<()> {
    let mut url = format!("{}/api/events", daemon_url(home));
    if !conversations.is_empty() {
        url.push_str("?conversations=");
        url.push_str(&conversations.join(","));
    }

    let response = reqwest::Client::new()
        .get(&url)
        .header("accept", "text/event-stream")
        .send()
        .await
        .with_context(|| format!("Could not reach the daemon at {}", url))?;
    let mut response = error_for_status(response).await?;

    let mut buffer = String::new();
    while let Some(chunk) = response.chunk().await? {
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..end + 2).collect();
            if let Some((event, data)) = parse_sse_frame(&frame) {
                println!("[{}] {}", event, data);
            }
        }
    }
    println!("Event stream closed.");
    Ok(())
}

/// Event name and data of one SSE frame; keep-alive comments yield `None`.
fn parse_sse_frame(frame: &str) -> Option<(String, String)> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data.is_empty() && event.is_none() {
        return None;
    }
    Some((event.unwrap_or_else(|| "message".to_string()), data.join("\n")))
}

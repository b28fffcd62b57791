//! Console Commands
//!
//! Plain text goes to the speech agent, `@action <text>` to the action agent. Slash
//! commands control the session.

use crate::session::Session;
use serde_json::{Value, json};
use std::sync::Arc;
use tandem_core::{
    AgentRole, Invocation, Message, ScheduleError, SteeredPair, Trigger, WORLD_TOOL,
};
use std::io::BufRead;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const HELP: &str = "Commands: <text>, @action <text>, /continue [speech|action], /abort [speech|action], \
/reset [speech|action], /inject {\"action\":...,\"observation\":...}, /observe, /status, /quit";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Say { target: AgentRole, text: String },
    Continue(AgentRole),
    /// `None` means both agents.
    Abort(Option<AgentRole>),
    Reset(Option<AgentRole>),
    Inject { action: Value, observation: Value },
    Observe,
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("Unknown agent '{0}'; expected speech or action")]
    UnknownAgent(String),
    #[error("Invalid /inject JSON: {0}")]
    InvalidJson(String),
    #[error("Nothing to send")]
    Empty,
}

fn parse_role(raw: &str) -> Result<Option<AgentRole>, ParseError> {
    match raw.trim().to_lowercase().as_str() {
        "" => Ok(None),
        "speech" | "s" => Ok(Some(AgentRole::Speech)),
        "action" | "a" => Ok(Some(AgentRole::Action)),
        other => Err(ParseError::UnknownAgent(other.to_string())),
    }
}

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    if let Some(rest) = line.strip_prefix("@action") {
        let text = rest.trim();
        if text.is_empty() {
            return Err(ParseError::Empty);
        }
        return Ok(Some(Command::Say {
            target: AgentRole::Action,
            text: text.to_string(),
        }));
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say {
            target: AgentRole::Speech,
            text: line.to_string(),
        }));
    };
    let (name, arg) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let command = match name {
        "continue" => Command::Continue(parse_role(arg)?.unwrap_or(AgentRole::Speech)),
        "abort" => Command::Abort(parse_role(arg)?),
        "reset" => Command::Reset(parse_role(arg)?),
        "inject" => {
            let payload: Value =
                serde_json::from_str(arg.trim()).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
            let action = payload.get("action").cloned().unwrap_or_else(|| json!({}));
            let observation = payload
                .get("observation")
                .or_else(|| payload.get("obs"))
                .cloned()
                .unwrap_or_else(|| json!({}));
            Command::Inject {
                action,
                observation,
            }
        }
        "observe" => Command::Observe,
        "status" => Command::Status,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// What the console should do after a command.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    Continue(Vec<String>),
    Quit,
}

fn roles(target: Option<AgentRole>) -> Vec<AgentRole> {
    match target {
        Some(role) => vec![role],
        None => AgentRole::ALL.to_vec(),
    }
}

fn rejection(error: &ScheduleError) -> String {
    match error {
        ScheduleError::Busy(role) => format!("{}> Still processing. Try /abort or wait.", role),
        ScheduleError::NoHistory(role) => {
            format!("{}> No conversation yet. Send a first message instead.", role)
        }
    }
}

pub async fn execute(session: &Session, command: Command) -> Flow {
    let scheduler = session.scheduler();
    let lines = match command {
        Command::Say { target, text } => {
            if scheduler.is_running(target) {
                scheduler.steer(target, Message::user(text));
                vec![format!("{}> Queued for the running turn.", target)]
            } else {
                match scheduler.request(target, Invocation::Prompt(text), Trigger::User) {
                    Ok(_) => vec![],
                    Err(e) => vec![rejection(&e)],
                }
            }
        }
        Command::Continue(role) => match scheduler.request(role, Invocation::Continue, Trigger::User) {
            Ok(_) => vec![],
            Err(e) => vec![rejection(&e)],
        },
        Command::Abort(target) => roles(target)
            .into_iter()
            .map(|role| {
                if scheduler.abort(role) {
                    format!("{}> Aborted.", role)
                } else {
                    format!("{}> Nothing to abort.", role)
                }
            })
            .collect(),
        Command::Reset(target) => roles(target)
            .into_iter()
            .map(|role| {
                scheduler.reset(role);
                format!("{}> Conversation reset.", role)
            })
            .collect(),
        Command::Inject {
            action,
            observation,
        } => {
            let pair = SteeredPair::new(
                WORLD_TOOL,
                json!({ "action": action }),
                json!({ "ok": true, "observation": observation }),
            );
            scheduler.inject_pair(AgentRole::Speech, pair);
            if scheduler.is_running(AgentRole::Speech) {
                vec!["speech> Injected via steer during active run.".to_string()]
            } else {
                match scheduler.request(AgentRole::Speech, Invocation::Continue, Trigger::User) {
                    Ok(_) => vec![],
                    Err(ScheduleError::NoHistory(_)) => vec![
                        "speech> Injected and queued. Send a first message or run /continue after one turn exists."
                            .to_string(),
                    ],
                    Err(e) => vec![rejection(&e)],
                }
            }
        }
        Command::Observe => match session.poll_world().await {
            Ok(Some(report)) => vec![format!(
                "world> tick {} ({})",
                report.tick,
                if report.injected { "injected" } else { "no change" }
            )],
            Ok(None) => vec!["world> Stale observation discarded.".to_string()],
            Err(e) => vec![format!("world> {}", e)],
        },
        Command::Status => {
            let mut lines: Vec<String> = AgentRole::ALL
                .into_iter()
                .map(|role| {
                    let status = scheduler.status(role);
                    format!(
                        "{}> {:?}, {} messages, {} pending",
                        role, status.state, status.messages, status.pending
                    )
                })
                .collect();
            lines.push(match session.speaker() {
                Some(speaker) => format!("audio> {}", speaker.status()),
                None => "audio> disabled".to_string(),
            });
            lines
        }
        Command::Help => vec![HELP.to_string()],
        Command::Quit => return Flow::Quit,
    };
    Flow::Continue(lines)
}

/// Forwards stdin lines from a plain thread, so a pending read never holds up shutdown.
pub fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read console input");
                    break;
                }
            }
        }
        debug!("Console input closed");
    });
    rx
}

/// Executes input lines and prints transcript lines until `/quit` or end of input.
pub async fn run(
    session: Arc<Session>,
    mut transcript: mpsc::UnboundedReceiver<String>,
    mut input: mpsc::UnboundedReceiver<String>,
) {
    println!("{}", HELP);
    loop {
        tokio::select! {
            Some(line) = transcript.recv() => println!("{}", line),
            line = input.recv() => {
                let Some(line) = line else { break };
                match parse(&line) {
                    Ok(None) => {}
                    Ok(Some(command)) => match execute(&session, command).await {
                        Flow::Continue(lines) => lines.iter().for_each(|l| println!("{}", l)),
                        Flow::Quit => break,
                    },
                    Err(e) => println!("{}", e),
                }
            }
        }
    }
}

//! Terminal chat client.

use anyhow::Context;
use mesa_client::{AuthenticateOptions, Session, SessionEvent};
use mesa_core::ClientConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::protocol::{self, Chat, Login, Notice, Say, Whisper, op};

#[derive(Debug, PartialEq)]
enum Input {
    Say(String),
    Whisper { to: String, text: String },
    Quit,
    Nothing,
    Invalid(&'static str),
}

fn parse_line(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Nothing;
    }
    if line == "/quit" {
        return Input::Quit;
    }
    if let Some(rest) = line.strip_prefix("/w ") {
        return match rest.trim().split_once(' ') {
            Some((to, text)) if !text.trim().is_empty() => Input::Whisper {
                to: to.to_string(),
                text: text.trim().to_string(),
            },
            _ => Input::Invalid("usage: /w <name> <text>"),
        };
    }
    if line.starts_with('/') {
        return Input::Invalid("unknown command");
    }
    Input::Say(line.to_string())
}

pub async fn run(url: &str, name: &str, config: ClientConfig) -> anyhow::Result<()> {
    let session = Session::new(url, config)?;
    let printer = tokio::spawn(print_events(session.subscribe()));

    let login = Login {
        name: name.to_string(),
    };
    session
        .authenticate(serde_json::to_value(&login)?, AuthenticateOptions { resync: true })
        .await
        .context("logging in")?;
    println!("* logged in as {name}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_line(&line) {
            Input::Say(text) => session.send(protocol::envelope(op::SAY, &Say { text }))?,
            Input::Whisper { to, text } => {
                session.send(protocol::envelope(op::WHISPER, &Whisper { to, text }))?
            }
            Input::Quit => break,
            Input::Nothing => {}
            Input::Invalid(usage) => eprintln!("* {usage}"),
        }
    }

    session.disconnect(1000, "bye");
    session.closed().await;
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Message(envelope)) => match envelope.op() {
                op::CHAT => {
                    if let Some(chat) = protocol::body::<Chat>(&envelope) {
                        let marker = if chat.private { " (whisper)" } else { "" };
                        println!("[{}]{marker} {}", chat.from, chat.text);
                    }
                }
                op::NOTICE => {
                    if let Some(notice) = protocol::body::<Notice>(&envelope) {
                        println!("* {}", notice.text);
                    }
                }
                _ => {}
            },
            Ok(SessionEvent::Disconnected { code, reason }) => {
                println!("* disconnected ({code}) {reason}");
            }
            Ok(SessionEvent::Connected) => println!("* connected"),
            Ok(SessionEvent::Error(e)) => eprintln!("* {e}"),
            Ok(SessionEvent::Authenticated(_)) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

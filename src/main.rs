//! Minimal terminal front-end over the streaming core.
//!
//! Reads user lines, streams the assistant reply to stdout as fragments
//! arrive, and keeps the conversation history across turns. Input arrives
//! on its own thread so a send can be refused while a reply is still
//! streaming instead of being queued behind it.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use sidechat::{
    ChatSession, Conversation, CurlTransport, FileConfig, SessionEvent, Transport, start_session,
};

const CONFIG_PATH: &str = ".sidechat/config.yaml";

enum HostInput {
    Line(String),
    Eof,
}

fn main() {
    let (config, options) = match FileConfig::load(Path::new(CONFIG_PATH)) {
        Ok(file) => file.into_settings(),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    println!("sidechat — {} via {}", config.model, config.endpoint_url);
    println!("type a message and press enter; 'quit' exits");

    let transport: Arc<dyn Transport> = Arc::new(CurlTransport::new());
    let mut conversation = Conversation::new();

    let (input_tx, input_rx) = mpsc::channel();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if input_tx.send(HostInput::Line(line)).is_err() {
                return;
            }
        }
        let _ = input_tx.send(HostInput::Eof);
    });

    let (tx, rx) = mpsc::channel();
    let mut session: Option<ChatSession> = None;

    prompt();
    loop {
        // Stream events first so fragments appear promptly.
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::Chunk { fragment, .. } => {
                    print!("{}", fragment);
                    let _ = io::stdout().flush();
                }
                SessionEvent::Done(outcome) => {
                    session = None;
                    match outcome {
                        Ok(text) => {
                            conversation.push_assistant(text);
                            println!();
                        }
                        Err(e) => eprintln!("\n{}", e),
                    }
                    prompt();
                }
            }
        }

        match input_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(HostInput::Line(line)) => {
                let text = line.trim();
                if text.is_empty() {
                    if session.is_none() {
                        prompt();
                    }
                    continue;
                }
                if text == "quit" || text == "exit" {
                    shut_down(session.take());
                    return;
                }
                if session.is_some() {
                    println!("(still streaming — wait for the reply to finish)");
                    continue;
                }
                conversation.push_user(text);
                session = Some(start_session(
                    &config,
                    &options,
                    conversation.messages(),
                    Arc::clone(&transport),
                    tx.clone(),
                ));
            }
            Ok(HostInput::Eof) | Err(RecvTimeoutError::Disconnected) => {
                shut_down(session.take());
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

fn shut_down(session: Option<ChatSession>) {
    if let Some(live) = session {
        live.cancel();
        live.join();
    }
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

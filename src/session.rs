//! One request/response streaming lifecycle.
//!
//! A session validates its config snapshot, launches the transport on a
//! worker thread, pipes raw lines through the SSE parser into the delta
//! accumulator, and delivers events to the host over an `mpsc` channel:
//! zero or more `Chunk`s followed by exactly one `Done`, no matter whether
//! the stream ends via sentinel, server error, transport exit, or cancel.

use std::sync::Arc;
use std::sync::mpsc::Sender;
use std::thread;

use serde::Serialize;

use crate::accumulate::{Absorbed, DeltaAccumulator};
use crate::config::{ChatConfig, StreamOptions};
use crate::diag;
use crate::error::{ChatError, sanitize_message};
use crate::message::Message;
use crate::sse::{self, SseFrame};
use crate::transport::{self, CancelHandle, LineFlow, Transport, TransportRequest};

/// Events delivered to the host, in order.
#[derive(Debug)]
pub enum SessionEvent {
    /// New text arrived. Carries the fragment and the full reply so far.
    Chunk { fragment: String, accumulated: String },
    /// Terminal outcome. Sent exactly once; nothing follows it.
    Done(Result<String, ChatError>),
}

/// Handle to a live session. Dropping it does not stop the stream; use
/// [`ChatSession::cancel`] for that.
pub struct ChatSession {
    cancel: CancelHandle,
    worker: Option<thread::JoinHandle<()>>,
}

impl ChatSession {
    /// Ask the transport to stop. The terminal event reports `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map(|w| w.is_finished()).unwrap_or(true)
    }

    /// Block until the worker is done. Events are already in the channel.
    pub fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<&'a Message>,
    stream: bool,
}

/// `{model, messages, stream: true}`, with the configured system prompt
/// prepended when present and non-empty.
fn build_request_body(config: &ChatConfig, messages: &[Message]) -> Vec<u8> {
    let system = config
        .system_prompt
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(Message::system);
    let mut wire: Vec<&Message> = Vec::with_capacity(messages.len() + 1);
    wire.extend(system.iter());
    wire.extend(messages.iter());

    let request = WireRequest { model: &config.model, messages: wire, stream: true };
    serde_json::to_vec(&request).unwrap_or_default()
}

/// Start streaming one reply for `messages` under `config`.
///
/// Validation failures surface immediately as the session's `Done` event;
/// nothing is spawned for them. Otherwise a worker thread owns the whole
/// transport lifecycle and the returned handle can cancel it.
pub fn start_session(
    config: &ChatConfig,
    options: &StreamOptions,
    messages: &[Message],
    transport: Arc<dyn Transport>,
    tx: Sender<SessionEvent>,
) -> ChatSession {
    let cancel = CancelHandle::new();

    let api_key = match config.resolve_api_key() {
        Ok(key) => key,
        Err(e) => {
            let _ = tx.send(SessionEvent::Done(Err(e)));
            return ChatSession { cancel, worker: None };
        }
    };
    if let Err(e) = transport::validate_url(&config.endpoint_url) {
        let _ = tx.send(SessionEvent::Done(Err(e)));
        return ChatSession { cancel, worker: None };
    }

    let body = build_request_body(config, messages);
    diag::dump_request(&body);

    let request = TransportRequest {
        url: config.endpoint_url.clone(),
        api_key,
        body,
        extra_headers: vec![("Accept".to_string(), "text/event-stream".to_string())],
        timeout: options.timeout,
    };
    let require_sentinel = options.require_sentinel;
    let worker_cancel = cancel.clone();
    let worker = thread::spawn(move || {
        run_stream(transport, request, require_sentinel, worker_cancel, tx);
    });

    ChatSession { cancel, worker: Some(worker) }
}

fn run_stream(
    transport: Arc<dyn Transport>,
    request: TransportRequest,
    require_sentinel: bool,
    cancel: CancelHandle,
    tx: Sender<SessionEvent>,
) {
    let mut acc = DeltaAccumulator::new();
    // Set once by the sentinel or a server error; the exit path below only
    // fills in when the stream ended without either.
    let mut terminal: Option<Result<String, ChatError>> = None;

    let exit = transport.stream(request, &cancel, &mut |line| match sse::parse_line(line) {
        SseFrame::Ignored => LineFlow::Continue,
        SseFrame::Done => {
            terminal = Some(Ok(acc.text().to_string()));
            LineFlow::Stop
        }
        SseFrame::Event(chunk) => match acc.absorb(chunk) {
            Absorbed::Nothing => LineFlow::Continue,
            Absorbed::Fragment(fragment) => {
                let _ = tx.send(SessionEvent::Chunk {
                    fragment,
                    accumulated: acc.text().to_string(),
                });
                LineFlow::Continue
            }
            Absorbed::ServerError(msg) => {
                terminal = Some(Err(ChatError::Api(sanitize_message(&msg))));
                LineFlow::Stop
            }
        },
    });

    let outcome = match (terminal, exit) {
        // Sentinel or server error already decided; exit is cleanup only.
        (Some(decided), _) => decided,
        (None, Err(start_failure)) => Err(start_failure),
        (None, Ok(exit)) => {
            if cancel.is_cancelled() {
                Err(ChatError::Cancelled)
            } else if exit.status == 0 {
                if require_sentinel {
                    Err(ChatError::Exit {
                        status: 0,
                        detail: "stream ended without completion sentinel".to_string(),
                    })
                } else {
                    // Silent clean exit counts as success, accumulated text
                    // as-is, even when empty.
                    Ok(acc.into_text())
                }
            } else {
                let detail = sanitize_message(exit.stderr.trim());
                let detail = if detail.is_empty() {
                    "transport produced no diagnostic output".to_string()
                } else {
                    detail
                };
                Err(ChatError::Exit { status: exit.status, detail })
            }
        }
    };

    if let Err(e) = &outcome {
        diag::log_error(&e.to_string());
    }
    let _ = tx.send(SessionEvent::Done(outcome));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportExit;
    use secrecy::SecretString;
    use std::sync::Mutex;
    use std::sync::mpsc;

    /// Scripted transport: plays back lines, then exits with a fixed status.
    struct FakeTransport {
        lines: Vec<String>,
        status: i32,
        stderr: String,
        start_error: Option<ChatError>,
        delivered: Mutex<usize>,
        called: Mutex<bool>,
    }

    impl FakeTransport {
        fn new(lines: &[&str], status: i32) -> Self {
            Self {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                status,
                stderr: String::new(),
                start_error: None,
                delivered: Mutex::new(0),
                called: Mutex::new(false),
            }
        }

        fn with_stderr(mut self, stderr: &str) -> Self {
            self.stderr = stderr.to_string();
            self
        }

        fn failing_to_start(error: ChatError) -> Self {
            let mut t = Self::new(&[], 0);
            t.start_error = Some(error);
            t
        }
    }

    impl Transport for FakeTransport {
        fn stream(
            &self,
            _request: TransportRequest,
            _cancel: &CancelHandle,
            on_line: &mut dyn FnMut(&str) -> LineFlow,
        ) -> Result<TransportExit, ChatError> {
            *self.called.lock().unwrap() = true;
            if let Some(e) = &self.start_error {
                return Err(e.clone());
            }
            let mut delivered = 0;
            for line in &self.lines {
                delivered += 1;
                if on_line(line) == LineFlow::Stop {
                    break;
                }
            }
            *self.delivered.lock().unwrap() = delivered;
            Ok(TransportExit { status: self.status, stderr: self.stderr.clone() })
        }
    }

    fn config_with_key() -> ChatConfig {
        ChatConfig {
            api_key: Some(SecretString::from("test-key".to_string())),
            ..ChatConfig::default()
        }
    }

    fn drive(transport: Arc<FakeTransport>, config: &ChatConfig, options: &StreamOptions) -> Vec<SessionEvent> {
        let (tx, rx) = mpsc::channel();
        let messages = [Message::user("hello")];
        let session = start_session(config, options, &messages, transport, tx);
        session.join();
        rx.try_iter().collect()
    }

    fn split(events: Vec<SessionEvent>) -> (Vec<(String, String)>, Vec<Result<String, ChatError>>) {
        let mut chunks = Vec::new();
        let mut outcomes = Vec::new();
        for event in events {
            match event {
                SessionEvent::Chunk { fragment, accumulated } => chunks.push((fragment, accumulated)),
                SessionEvent::Done(outcome) => outcomes.push(outcome),
            }
        }
        (chunks, outcomes)
    }

    #[test]
    fn deltas_then_sentinel_complete_with_full_text() {
        let transport = Arc::new(FakeTransport::new(
            &[
                r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
                r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
                "data: [DONE]",
            ],
            0,
        ));
        let events = drive(transport, &config_with_key(), &StreamOptions::default());
        let (chunks, outcomes) = split(events);
        assert_eq!(
            chunks,
            vec![("Hel".to_string(), "Hel".to_string()), ("lo".to_string(), "Hello".to_string())]
        );
        assert_eq!(outcomes, vec![Ok("Hello".to_string())]);
    }

    #[test]
    fn server_error_is_terminal_and_stops_line_processing() {
        let transport = Arc::new(FakeTransport::new(
            &[
                r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#,
                r#"data: {"error":{"message":"rate limited"}}"#,
                r#"data: {"choices":[{"delta":{"content":"never seen"}}]}"#,
            ],
            0,
        ));
        let events = drive(Arc::clone(&transport), &config_with_key(), &StreamOptions::default());
        let (chunks, outcomes) = split(events);
        assert_eq!(chunks.len(), 1);
        assert_eq!(outcomes, vec![Err(ChatError::Api("rate limited".to_string()))]);
        // The line after the error frame was never read.
        assert_eq!(*transport.delivered.lock().unwrap(), 2);
    }

    #[test]
    fn clean_exit_without_sentinel_is_success() {
        let transport = Arc::new(FakeTransport::new(
            &[r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#],
            0,
        ));
        let events = drive(transport, &config_with_key(), &StreamOptions::default());
        let (_, outcomes) = split(events);
        assert_eq!(outcomes, vec![Ok("partial".to_string())]);
    }

    #[test]
    fn require_sentinel_rejects_silent_clean_exit() {
        let transport = Arc::new(FakeTransport::new(
            &[r#"data: {"choices":[{"delta":{"content":"partial"}}]}"#],
            0,
        ));
        let options = StreamOptions { require_sentinel: true, ..StreamOptions::default() };
        let events = drive(transport, &config_with_key(), &options);
        let (_, outcomes) = split(events);
        match &outcomes[..] {
            [Err(ChatError::Exit { status: 0, detail })] => {
                assert!(detail.contains("sentinel"), "unexpected detail: {}", detail);
            }
            other => panic!("expected a sentinel failure, got {:?}", other),
        }
    }

    #[test]
    fn nonzero_exit_reports_sanitized_stderr() {
        let transport = Arc::new(
            FakeTransport::new(&[], 7).with_stderr("curl: (7) Failed to connect\r\n"),
        );
        let events = drive(transport, &config_with_key(), &StreamOptions::default());
        let (chunks, outcomes) = split(events);
        assert!(chunks.is_empty());
        assert_eq!(
            outcomes,
            vec![Err(ChatError::Exit { status: 7, detail: "curl: (7) Failed to connect".to_string() })]
        );
    }

    #[test]
    fn exit_after_sentinel_performs_cleanup_only() {
        // Broken pipe after the sentinel must not turn a completed stream
        // into a failure, and must not produce a second outcome.
        let transport = Arc::new(FakeTransport::new(&["data: [DONE]"], 23));
        let events = drive(transport, &config_with_key(), &StreamOptions::default());
        let (_, outcomes) = split(events);
        assert_eq!(outcomes, vec![Ok(String::new())]);
    }

    #[test]
    fn malformed_and_foreign_lines_are_skipped() {
        let transport = Arc::new(FakeTransport::new(
            &[
                r#"data: {"choices":[{"delta":{"content":"a"}}]}"#,
                "data: {not json",
                ": keep-alive",
                "",
                r#"data: {"choices":[{"delta":{"content":"b"}}]}"#,
                "data: [DONE]",
            ],
            0,
        ));
        let events = drive(transport, &config_with_key(), &StreamOptions::default());
        let (chunks, outcomes) = split(events);
        assert_eq!(chunks.len(), 2);
        assert_eq!(outcomes, vec![Ok("ab".to_string())]);
    }

    #[test]
    fn bad_url_fails_before_the_transport_runs() {
        let transport = Arc::new(FakeTransport::new(&[], 0));
        let config = ChatConfig { endpoint_url: String::new(), ..config_with_key() };
        let events = drive(Arc::clone(&transport), &config, &StreamOptions::default());
        let (chunks, outcomes) = split(events);
        assert!(chunks.is_empty());
        assert!(matches!(&outcomes[..], [Err(ChatError::Config(_))]));
        assert!(!*transport.called.lock().unwrap());
    }

    #[test]
    fn transport_start_failure_surfaces_as_the_outcome() {
        let transport = Arc::new(FakeTransport::failing_to_start(ChatError::Spawn(
            "curl: no such file".to_string(),
        )));
        let events = drive(transport, &config_with_key(), &StreamOptions::default());
        let (_, outcomes) = split(events);
        assert_eq!(outcomes, vec![Err(ChatError::Spawn("curl: no such file".to_string()))]);
    }

    #[test]
    fn system_prompt_is_prepended_when_configured() {
        let config = ChatConfig {
            system_prompt: Some("be brief".to_string()),
            ..config_with_key()
        };
        let body = build_request_body(&config, &[Message::user("hi")]);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["stream"], serde_json::Value::Bool(true));
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][0]["content"], "be brief");
        assert_eq!(value["messages"][1]["role"], "user");
    }

    #[test]
    fn empty_system_prompt_is_not_sent() {
        let config = ChatConfig { system_prompt: Some(String::new()), ..config_with_key() };
        let body = build_request_body(&config, &[Message::user("hi")]);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
        assert_eq!(value["messages"][0]["role"], "user");
    }
}

//! Line-streaming HTTPS transport backed by a curl subprocess.
//!
//! The request body travels over stdin and the bearer token through a
//! transient curl config file, so neither appears on the process argument
//! list. Response lines are handed to the caller as they arrive; the exit
//! status and captured stderr are reported once at the end.

use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tempfile::NamedTempFile;

use crate::error::ChatError;

/// Outbound call handed to a transport.
pub struct TransportRequest {
    pub url: String,
    pub api_key: SecretString,
    pub body: Vec<u8>,
    /// Extra headers beyond Authorization and Content-Type.
    pub extra_headers: Vec<(String, String)>,
    /// Upper bound on the whole call. None means no deadline.
    pub timeout: Option<Duration>,
}

/// Exit report delivered once, after the last line.
#[derive(Debug)]
pub struct TransportExit {
    pub status: i32,
    pub stderr: String,
}

/// Whether the caller wants more lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFlow {
    Continue,
    Stop,
}

/// Cooperative cancellation shared between the host and a running transport.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Seam between the session controller and the outbound call.
///
/// `on_line` is invoked for each complete line before the next one is read.
/// A `Stop` return ends line delivery; the exit report is still produced.
/// Errors are returned only when the call could not be started at all.
pub trait Transport: Send + Sync {
    fn stream(
        &self,
        request: TransportRequest,
        cancel: &CancelHandle,
        on_line: &mut dyn FnMut(&str) -> LineFlow,
    ) -> Result<TransportExit, ChatError>;
}

/// Reject URLs the command-line transport must never see: empty, non-HTTPS,
/// or anything that could be parsed as a flag.
pub fn validate_url(url: &str) -> Result<(), ChatError> {
    if url.is_empty() {
        return Err(ChatError::Config("endpoint URL is empty".into()));
    }
    if url.starts_with('-') {
        return Err(ChatError::Config(format!("endpoint URL must not start with '-': {}", url)));
    }
    if !url.starts_with("https://") {
        return Err(ChatError::Config(format!("endpoint URL must start with https://: {}", url)));
    }
    Ok(())
}

/// Transport that shells out to curl.
pub struct CurlTransport {
    program: String,
}

impl CurlTransport {
    pub fn new() -> Self {
        Self { program: "curl".to_string() }
    }

    /// Substitute the executable. Used by tests to run scripted transports.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl Default for CurlTransport {
    fn default() -> Self {
        Self::new()
    }
}

/// Full argument list for one call. The URL goes last, after validation,
/// so it can never be taken for an option.
fn curl_args(request: &TransportRequest, auth_config: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--silent".into(),
        "--show-error".into(),
        "--no-buffer".into(),
        "--fail-with-body".into(),
        "--config".into(),
        auth_config.as_os_str().into(),
        "--request".into(),
        "POST".into(),
        "--header".into(),
        "Content-Type: application/json".into(),
    ];
    for (name, value) in &request.extra_headers {
        args.push("--header".into());
        args.push(format!("{}: {}", name, value).into());
    }
    if let Some(timeout) = request.timeout {
        args.push("--max-time".into());
        args.push(timeout.as_secs().max(1).to_string().into());
    }
    args.push("--data-binary".into());
    args.push("@-".into());
    args.push(request.url.as_str().into());
    args
}

impl Transport for CurlTransport {
    fn stream(
        &self,
        request: TransportRequest,
        cancel: &CancelHandle,
        on_line: &mut dyn FnMut(&str) -> LineFlow,
    ) -> Result<TransportExit, ChatError> {
        validate_url(&request.url)?;

        // The bearer token goes into a 0600 temp file passed via --config.
        // NamedTempFile removes it on drop, which covers every exit path
        // out of this function, early returns included.
        let mut auth_config = NamedTempFile::new()
            .map_err(|e| ChatError::Spawn(format!("could not create auth config: {}", e)))?;
        writeln!(auth_config, "header \"Authorization: Bearer {}\"", request.api_key.expose_secret())
            .and_then(|_| auth_config.flush())
            .map_err(|e| ChatError::Spawn(format!("could not write auth config: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(curl_args(&request, auth_config.path()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ChatError::Spawn(format!("{}: {}", self.program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChatError::Spawn("transport stdout unavailable".into()))?;

        // Drain stderr on its own thread so a chatty subprocess cannot
        // block on a full pipe while we read stdout.
        let stderr = child.stderr.take();
        let stderr_thread = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut buf);
            }
            buf
        });

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&request.body) {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stderr_thread.join();
                return Err(ChatError::Spawn(format!("could not write request body: {}", e)));
            }
        }

        let child = Arc::new(Mutex::new(child));
        let finished = Arc::new(AtomicBool::new(false));

        // Kill the subprocess when the handle fires, even if no line ever
        // arrives to wake the read loop.
        let watcher = {
            let cancel = cancel.clone();
            let child = Arc::clone(&child);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                loop {
                    if finished.load(Ordering::SeqCst) {
                        return;
                    }
                    if cancel.is_cancelled() {
                        let mut guard = child.lock().unwrap_or_else(|e| e.into_inner());
                        let _ = guard.kill();
                        return;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            })
        };

        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        let mut stopped_early = false;
        loop {
            if cancel.is_cancelled() {
                stopped_early = true;
                break;
            }
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    if on_line(trimmed) == LineFlow::Stop {
                        stopped_early = true;
                        break;
                    }
                }
                // A failed read means the pipe died under us; the exit
                // status below tells the rest of the story.
                Err(_) => break,
            }
        }
        drop(reader);

        // Once the caller stops listening the stream is over; do not sit
        // out a server that keeps the connection open past that point.
        if stopped_early {
            let mut guard = child.lock().unwrap_or_else(|e| e.into_inner());
            let _ = guard.kill();
        }

        let status = loop {
            {
                let mut guard = child.lock().unwrap_or_else(|e| e.into_inner());
                match guard.try_wait() {
                    Ok(Some(status)) => break status,
                    Ok(None) => {}
                    Err(e) => {
                        finished.store(true, Ordering::SeqCst);
                        let _ = watcher.join();
                        let _ = stderr_thread.join();
                        return Err(ChatError::Spawn(format!("could not reap transport: {}", e)));
                    }
                }
            }
            thread::sleep(Duration::from_millis(20));
        };
        finished.store(true, Ordering::SeqCst);
        let _ = watcher.join();

        let stderr_text = stderr_thread.join().unwrap_or_default();
        Ok(TransportExit { status: status.code().unwrap_or(-1), stderr: stderr_text })
    }
}

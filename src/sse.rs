//! Per-line parsing of OpenAI-compatible SSE chat streams.
//!
//! Each event arrives as a line `data: <json>`; the stream ends with the
//! literal `data: [DONE]`. Anything else on the wire (comments, other SSE
//! fields, keep-alive blanks, truncated JSON) is skipped, not an error.

use serde::Deserialize;

use crate::diag;

/// Literal terminator marking normal stream end.
pub const DONE_SENTINEL: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// One decoded chunk of an OpenAI-compatible chat stream.
///
/// Streaming responses carry text under `choices[0].delta`; some endpoints
/// in the same family answer with a full `choices[0].message` instead, and
/// server-side failures arrive as a top-level `error` object.
#[derive(Debug, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    pub error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    pub delta: Option<ChunkContent>,
    pub message: Option<ChunkContent>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkContent {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireError {
    pub message: Option<String>,
    #[serde(rename = "type")]
    pub error_type: Option<String>,
}

/// Result of parsing one raw stream line.
#[derive(Debug)]
pub enum SseFrame {
    /// Blank line, non-data field, or undecodable payload. Skip it.
    Ignored,
    /// The `[DONE]` sentinel; stop processing further lines.
    Done,
    /// A decoded chunk for the accumulator.
    Event(ChatChunk),
}

/// Parse one raw line. Stateless; never fails the stream.
pub fn parse_line(line: &str) -> SseFrame {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return SseFrame::Ignored;
    };
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        return SseFrame::Done;
    }
    match serde_json::from_str::<ChatChunk>(payload) {
        Ok(chunk) => SseFrame::Event(chunk),
        Err(_) => {
            diag::log_dropped_frame(line);
            SseFrame::Ignored
        }
    }
}

//! Incremental assembly of the assistant reply from decoded chunks.

use crate::sse::ChatChunk;

/// Fallback when the server reports an error with no usable detail.
const GENERIC_SERVER_ERROR: &str = "request failed";

/// What one decoded chunk contributed to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Absorbed {
    /// No user-visible content in this chunk.
    Nothing,
    /// A fragment was appended to the accumulated text.
    Fragment(String),
    /// The server reported an error; terminal. Accumulated text untouched.
    ServerError(String),
}

/// Running buffer of the reply text for one session.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    text: String,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Fold one decoded chunk into the buffer.
    ///
    /// Prefers the streaming delta field; falls back to a full-message field
    /// so non-streaming-shaped responses from the same endpoint family still
    /// produce output. Empty fragments are swallowed.
    pub fn absorb(&mut self, chunk: ChatChunk) -> Absorbed {
        if let Some(err) = chunk.error {
            let msg = err
                .message
                .or(err.error_type)
                .unwrap_or_else(|| GENERIC_SERVER_ERROR.to_string());
            return Absorbed::ServerError(msg);
        }

        let fragment = chunk.choices.into_iter().next().and_then(|choice| {
            choice
                .delta
                .and_then(|d| d.content)
                .or_else(|| choice.message.and_then(|m| m.content))
        });

        match fragment {
            Some(fragment) if !fragment.is_empty() => {
                self.text.push_str(&fragment);
                Absorbed::Fragment(fragment)
            }
            _ => Absorbed::Nothing,
        }
    }
}

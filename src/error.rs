use std::fmt;

/// Typed error for one streaming chat request.
///
/// Distinguishes failures that happen before any network activity (config),
/// failures to launch the transport, errors the endpoint reports inside the
/// stream, and abnormal transport termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Bad endpoint URL or missing API key; rejected before anything runs
    Config(String),
    /// The transport subprocess could not be started
    Spawn(String),
    /// The endpoint reported an error inside the stream
    Api(String),
    /// Transport exited abnormally with no terminal event seen
    Exit { status: i32, detail: String },
    /// The caller cancelled the request
    Cancelled,
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatError::Config(msg) => write!(f, "Config error: {}", msg),
            ChatError::Spawn(msg) => write!(f, "Transport start error: {}", msg),
            ChatError::Api(msg) => write!(f, "API error: {}", msg),
            ChatError::Exit { status, detail } => {
                write!(f, "Transport exit {}: {}", status, detail)
            }
            ChatError::Cancelled => write!(f, "Request cancelled"),
        }
    }
}

impl std::error::Error for ChatError {}

/// Strip control characters from a message before it reaches the host.
///
/// Stream errors can carry raw stderr or wire fragments; escape sequences
/// and stray carriage returns must not leak into the display surface.
/// Applying this twice yields the same string.
pub fn sanitize_message(msg: &str) -> String {
    msg.chars().filter(|c| !c.is_control()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_config() {
        let e = ChatError::Config("endpoint URL is empty".into());
        assert_eq!(e.to_string(), "Config error: endpoint URL is empty");
    }

    #[test]
    fn display_api() {
        let e = ChatError::Api("rate limited".into());
        assert_eq!(e.to_string(), "API error: rate limited");
    }

    #[test]
    fn display_exit() {
        let e = ChatError::Exit { status: 7, detail: "connection reset".into() };
        assert_eq!(e.to_string(), "Transport exit 7: connection reset");
    }

    #[test]
    fn sanitize_strips_control_characters() {
        assert_eq!(sanitize_message("a\x1b[31mred\x1b[0m\r\nb"), "a[31mred[0mb");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize_message("curl: (7)\tFailed\r\n");
        assert_eq!(sanitize_message(&once), once);
    }

    #[test]
    fn sanitize_passes_clean_text_through() {
        assert_eq!(sanitize_message("plain message"), "plain message");
    }
}

//! Request configuration and credential resolution.

use std::path::Path;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::ChatError;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Environment variable consulted when no explicit key is configured.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Read-only snapshot of where and how to send one request.
///
/// Concurrent sessions may hold different snapshots; a session never sees
/// config changes made after it started.
pub struct ChatConfig {
    pub endpoint_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub system_prompt: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            endpoint_url: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            system_prompt: None,
        }
    }
}

impl ChatConfig {
    /// Explicit key wins; otherwise the environment (a `.env` file is
    /// honored); otherwise a config failure before anything is sent.
    pub fn resolve_api_key(&self) -> Result<SecretString, ChatError> {
        if let Some(key) = &self.api_key {
            return Ok(SecretString::from(key.expose_secret().to_string()));
        }
        dotenvy::dotenv().ok();
        match std::env::var(API_KEY_ENV) {
            Ok(value) if !value.is_empty() => Ok(SecretString::from(value)),
            _ => Err(ChatError::Config(format!(
                "missing API key: set {} or configure one",
                API_KEY_ENV
            ))),
        }
    }
}

/// Per-request behavior knobs, separate from endpoint identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Treat a clean exit without the completion sentinel as a failure
    /// instead of accepting whatever text accumulated.
    pub require_sentinel: bool,
    /// Deadline for the whole transport call. None means no deadline.
    pub timeout: Option<Duration>,
}

/// On-disk host configuration, YAML. All fields optional; missing file
/// means defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub endpoint_url: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub api_key: Option<String>,
    pub require_sentinel: bool,
    pub timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Load from `path`. A missing file is not an error; a malformed one is.
    pub fn load(path: &Path) -> Result<Self, ChatError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return Ok(Self::default()),
        };
        serde_yaml::from_str(&raw)
            .map_err(|e| ChatError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn into_settings(self) -> (ChatConfig, StreamOptions) {
        let config = ChatConfig {
            endpoint_url: self.endpoint_url.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key: self.api_key.map(SecretString::from),
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt: self.system_prompt,
        };
        let options = StreamOptions {
            require_sentinel: self.require_sentinel,
            timeout: self.timeout_secs.map(Duration::from_secs),
        };
        (config, options)
    }
}

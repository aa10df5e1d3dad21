//! Error types for monkchat.

use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`ConversationBackend`](crate::backend::ConversationBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// The HTTP request could not be sent or its body could not be read
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backend answered with a non-success status code
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body was not the JSON we expected
    #[error("failed to decode backend response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The response was well-formed JSON but violated the protocol
    #[error("malformed backend response: {0}")]
    Protocol(String),

    /// The backend refused the request for a reason of its own
    #[error("backend rejected the request: {0}")]
    Rejected(String),

    /// The backend does not implement this operation
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
}

/// Failures of a single chat turn.
///
/// Every variant is recovered at the [`ChatSession`](crate::chat::ChatSession)
/// boundary: it is logged, turned into a user-visible notice, and the session
/// stays usable for the next turn.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("could not create a remote session: {0}")]
    SessionCreation(#[source] BackendError),

    /// Posting the user message or creating the run failed. The user turn
    /// stays in the local store even though the backend never saw it.
    #[error("could not submit the message: {0}")]
    Submission(#[source] BackendError),

    #[error("run failed: {reason}")]
    RunFailed { reason: String },

    #[error("run did not finish after {polls} polls in {elapsed:?}")]
    Timeout { polls: u32, elapsed: Duration },

    #[error("run was cancelled")]
    Cancelled,
}

impl ChatError {
    /// The run completed but produced no assistant text.
    pub fn empty_response() -> Self {
        Self::RunFailed {
            reason: "empty_response".to_string(),
        }
    }

    pub fn run_failed(reason: impl Into<String>) -> Self {
        Self::RunFailed {
            reason: reason.into(),
        }
    }

    /// Short machine-friendly name, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::SessionCreation(_) => "session_creation",
            ChatError::Submission(_) => "submission",
            ChatError::RunFailed { .. } => "run_failed",
            ChatError::Timeout { .. } => "timeout",
            ChatError::Cancelled => "cancelled",
        }
    }

    /// Generic message shown to the user. Details go to the log only.
    pub fn user_notice(&self) -> &'static str {
        match self {
            ChatError::SessionCreation(_) => {
                "Could not start a conversation right now. Please try again."
            }
            ChatError::Submission(_) => {
                "Your message could not be delivered. Please try again."
            }
            // Timeouts look the same as failures to the user.
            ChatError::RunFailed { .. } | ChatError::Timeout { .. } => {
                "Sorry, no answer could be produced. Please try again."
            }
            ChatError::Cancelled => "The answer was cancelled.",
        }
    }
}

/// Startup configuration failures. These are not retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not locate the home directory")]
    NoHome,

    #[error(
        "missing required secret `{key}`: set it under [openai] in {path} or export {env}"
    )]
    MissingSecret {
        key: &'static str,
        env: &'static str,
        path: String,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("unknown persona '{0}'")]
    UnknownPersona(String),
}

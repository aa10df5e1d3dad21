use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};

use crate::error::ChatError;

/// Role in conversation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message of a conversation. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub remote_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            remote_message_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_remote_id(mut self, id: Option<String>) -> Self {
        self.remote_message_id = id;
        self
    }
}

/// Opaque identifier of a server-side conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to one in-flight run on a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRef {
    pub session: SessionHandle,
    pub run_id: String,
}

/// Run status exactly as the backend reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
}

/// The four phases the driver distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunPhase {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn phase(self) -> RunPhase {
        match self {
            RunStatus::Queued => RunPhase::Queued,
            RunStatus::InProgress | RunStatus::Cancelling => RunPhase::InProgress,
            RunStatus::Completed => RunPhase::Completed,
            // Tool outputs are never submitted, so a run waiting on them cannot finish.
            RunStatus::RequiresAction
            | RunStatus::Cancelled
            | RunStatus::Failed
            | RunStatus::Incomplete
            | RunStatus::Expired => RunPhase::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self.phase(), RunPhase::Completed | RunPhase::Failed)
    }
}

/// Error detail attached to a failed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

/// Point-in-time view of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub last_error: Option<RunError>,
}

impl RunSnapshot {
    /// Best available explanation for a failed run.
    pub fn failure_reason(&self) -> String {
        match &self.last_error {
            Some(err) if !err.message.is_empty() => err.message.clone(),
            Some(RunError { code: Some(code), .. }) => code.clone(),
            _ => self.status.to_string(),
        }
    }
}

/// Options for creating a run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RunOptions {
    pub assistant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_instructions: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

/// A message as listed by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendMessage {
    pub id: String,
    pub role: Role,
    pub run_id: Option<String>,
    pub text: String,
}

/// Events read from a streaming run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    RunCreated { run_id: String },
    Status(RunSnapshot),
    TextDelta {
        message_id: Option<String>,
        text: String,
    },
    Error(String),
    Done,
}

/// Text chunk handed to the presentation layer while a run is driven
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Local re-emission of an already complete reply (typing effect)
    Replay(String),
    /// Genuine incremental text received from the backend
    Delta(String),
}

impl Chunk {
    pub fn text(&self) -> &str {
        match self {
            Chunk::Replay(text) | Chunk::Delta(text) => text,
        }
    }
}

/// Final assistant reply of a run, before citation cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub message_id: Option<String>,
}

/// Events emitted while driving a run
#[derive(Debug)]
pub enum DriveEvent {
    /// The run moved to a new phase
    Status(RunPhase),
    Chunk(Chunk),
    /// Run completed with this reply
    Completed(Reply),
    /// Run ended without a reply
    Failed(ChatError),
}

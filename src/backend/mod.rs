//! Remote conversation backend.
//!
//! The backend owns threads (server-side conversation contexts) and runs (one
//! assistant turn computed against a thread). [`AssistantsBackend`] talks to
//! the hosted assistants API over HTTPS; [`ScriptedBackend`] plays back a
//! fixed script in memory for tests and offline use.

mod assistants;
mod scripted;
pub mod sse;

pub use assistants::AssistantsBackend;
pub use scripted::ScriptedBackend;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::BackendError;
use crate::events::{BackendMessage, Role, RunOptions, RunRef, RunSnapshot, SessionHandle, StreamEvent};

/// Events of a streaming run, in arrival order
pub type EventStream = BoxStream<'static, Result<StreamEvent, BackendError>>;

#[async_trait]
pub trait ConversationBackend: Send + Sync {
    /// Create a new thread
    async fn create_session(&self) -> Result<SessionHandle, BackendError>;

    /// Add a message to a thread, returning the remote message id
    async fn post_message(
        &self,
        session: &SessionHandle,
        role: Role,
        text: &str,
    ) -> Result<String, BackendError>;

    /// Start a run on a thread.
    ///
    /// With `options.stream` set, the run's event stream is kept until
    /// [`stream_run`](Self::stream_run) claims it.
    async fn create_run(
        &self,
        session: &SessionHandle,
        options: &RunOptions,
    ) -> Result<RunRef, BackendError>;

    async fn get_run_status(&self, run: &RunRef) -> Result<RunSnapshot, BackendError>;

    /// Messages of a thread, most recent first
    async fn list_messages(
        &self,
        session: &SessionHandle,
    ) -> Result<Vec<BackendMessage>, BackendError>;

    /// Incremental events of a run created with `stream = true`
    async fn stream_run(&self, _run: &RunRef) -> Result<EventStream, BackendError> {
        Err(BackendError::Unsupported("stream_run"))
    }
}

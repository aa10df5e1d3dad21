use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use crate::backend::ConversationBackend;
use crate::error::ChatError;
use crate::events::SessionHandle;

/// Remote session manager: one live thread handle per persona.
///
/// Handles are created lazily on first need and replaced on rotation. An
/// abandoned handle is only dropped locally; the remote thread is left as is.
pub struct SessionManager {
    backend: Arc<dyn ConversationBackend>,
    handles: HashMap<String, SessionHandle>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn ConversationBackend>) -> Self {
        Self {
            backend,
            handles: HashMap::new(),
        }
    }

    /// Existing handle for `persona`, or a freshly created one.
    ///
    /// Returns `None` when the backend refuses to create a thread. The error is
    /// logged and the slot stays unset so the next turn tries again.
    pub async fn ensure_session(&mut self, persona: &str) -> Option<SessionHandle> {
        match self.try_ensure_session(persona).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!(persona, error = %err, "failed to create remote session");
                None
            }
        }
    }

    /// Like [`ensure_session`](Self::ensure_session) but hands back the error.
    pub async fn try_ensure_session(&mut self, persona: &str) -> Result<SessionHandle, ChatError> {
        if let Some(handle) = self.handles.get(persona) {
            return Ok(handle.clone());
        }
        self.create(persona).await
    }

    /// Replace the handle of `persona` with a new one.
    ///
    /// The previous handle is forgotten even when creating the new one fails,
    /// so the next turn creates a session lazily.
    pub async fn rotate(&mut self, persona: &str) -> Result<SessionHandle, ChatError> {
        if let Some(old) = self.forget(persona) {
            info!(persona, thread_id = %old, "abandoning remote session");
        }
        self.create(persona).await
    }

    pub fn current(&self, persona: &str) -> Option<&SessionHandle> {
        self.handles.get(persona)
    }

    /// Drop the local reference without asking for a replacement
    pub fn forget(&mut self, persona: &str) -> Option<SessionHandle> {
        self.handles.remove(persona)
    }

    async fn create(&mut self, persona: &str) -> Result<SessionHandle, ChatError> {
        let handle = self
            .backend
            .create_session()
            .await
            .map_err(ChatError::SessionCreation)?;
        info!(persona, thread_id = %handle, "created remote session");
        self.handles.insert(persona.to_string(), handle.clone());
        Ok(handle)
    }
}

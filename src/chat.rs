use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::ConversationBackend;
use crate::config::{Config, Persona};
use crate::driver::{DriverSettings, RunDriver};
use crate::error::ChatError;
use crate::events::{Chunk, Turn};
use crate::postprocess::clean;
use crate::session::SessionManager;
use crate::store::ConversationStore;

/// Result of one user turn
#[derive(Debug)]
pub enum TurnOutcome {
    /// The assistant answered; the turn has been stored
    Replied(Turn),
    /// No answer. `notice` is safe to show to the user
    Failed { notice: String, error: ChatError },
}

/// All conversation state of one user session.
///
/// Owns the conversation store and the remote session handles, so nothing is
/// shared between user sessions. Turns are handled strictly one at a time.
pub struct ChatSession {
    personas: Vec<Persona>,
    store: ConversationStore,
    sessions: SessionManager,
    driver: RunDriver,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn ConversationBackend>,
        assistant_id: impl Into<String>,
        settings: DriverSettings,
        personas: Vec<Persona>,
    ) -> Self {
        Self {
            personas,
            store: ConversationStore::new(),
            sessions: SessionManager::new(backend.clone()),
            driver: RunDriver::new(backend, assistant_id, settings),
        }
    }

    pub fn from_config(
        backend: Arc<dyn ConversationBackend>,
        assistant_id: impl Into<String>,
        config: &Config,
    ) -> Self {
        Self::new(
            backend,
            assistant_id,
            DriverSettings::from(&config.driver),
            config.personas.clone(),
        )
    }

    pub fn personas(&self) -> &[Persona] {
        &self.personas
    }

    pub fn persona(&self, name: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.name == name)
    }

    pub fn history(&mut self, persona: &str) -> &[Turn] {
        self.store.get(persona)
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Handle one user message for `persona`.
    ///
    /// The user turn is stored before anything goes over the network. The
    /// assistant turn is stored only once its full text is known, after
    /// citation markers are removed. `on_chunk` sees every chunk as it is
    /// produced. Errors never escape: they come back as
    /// [`TurnOutcome::Failed`] and the session stays usable.
    pub async fn send<F>(
        &mut self,
        persona: &str,
        text: &str,
        cancel: CancellationToken,
        mut on_chunk: F,
    ) -> TurnOutcome
    where
        F: FnMut(&Chunk),
    {
        self.store.append(persona, Turn::user(text));

        let profile = self
            .persona(persona)
            .cloned()
            .unwrap_or_else(|| Persona::new(persona, ""));

        let session = match self.sessions.try_ensure_session(persona).await {
            Ok(session) => session,
            Err(err) => return Self::failed(persona, err),
        };

        let run = match self.driver.submit(&session, &profile, text).await {
            Ok(run) => run,
            Err(err) => return Self::failed(persona, err),
        };

        let mut stream = self.driver.drive(run, cancel);
        while let Some(chunk) = stream.next().await {
            on_chunk(&chunk);
        }
        debug!(persona, phase = ?stream.phase(), "run stream drained");

        match self.driver.finalize(stream).await {
            Ok(reply) => {
                let turn = Turn::assistant(clean(&reply.text)).with_remote_id(reply.message_id);
                self.store.append(persona, turn.clone());
                TurnOutcome::Replied(turn)
            }
            Err(err) => Self::failed(persona, err),
        }
    }

    /// Clear the conversation of `persona` and move it to a new remote session.
    ///
    /// The store is cleared even when the new session cannot be created; the
    /// next turn then creates one lazily.
    pub async fn reset(&mut self, persona: &str) -> Result<(), ChatError> {
        self.store.reset(persona);
        match self.sessions.rotate(persona).await {
            Ok(handle) => {
                info!(persona, thread_id = %handle, "conversation reset");
                Ok(())
            }
            Err(err) => {
                warn!(persona, error = %err, "conversation reset without a new session");
                Err(err)
            }
        }
    }

    fn failed(persona: &str, error: ChatError) -> TurnOutcome {
        error!(persona, kind = error.kind(), error = %error, "turn failed");
        TurnOutcome::Failed {
            notice: error.user_notice().to_string(),
            error,
        }
    }
}
